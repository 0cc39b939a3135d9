use std::{path::Path, sync::Arc};

use anyhow::Context as _;

use crate::{
    applier::Applier,
    raft::{
        app::RaftConsensus,
        network_http::HttpNetworkFactory,
        storage::{GroupLogStore, StateMachineShell},
        types::{NodeId, TypeConfig},
    },
};

/// Start one replication group: open its log store and state machine under
/// `<data_dir>/<group>` and hand the applier to the consensus engine.
///
/// Cluster initialization is left to the caller; it depends on bootstrap mode.
pub async fn start_group<A: Applier>(
    data_dir: &Path,
    group: &str,
    node_id: NodeId,
    applier: Arc<A>,
    network: HttpNetworkFactory,
) -> anyhow::Result<RaftConsensus> {
    let config = {
        #[cfg(test)]
        {
            openraft::Config {
                cluster_name: group.to_string(),
                ..Default::default()
            }
        }

        #[cfg(not(test))]
        {
            // Election timings sized for LAN-ish deployments; heartbeat_interval
            // doubles as openraft's hard TTL for replication RPCs.
            openraft::Config {
                cluster_name: group.to_string(),
                heartbeat_interval: 500,
                election_timeout_min: 1_500,
                election_timeout_max: 3_000,
                install_snapshot_timeout: 30_000,
                ..Default::default()
            }
        }
    }
    .validate()
    .map_err(|e| anyhow::anyhow!("raft config validate: {e}"))?;

    let config = Arc::new(config);

    let log_store = GroupLogStore::open(data_dir, group)
        .await
        .map_err(|e| anyhow::anyhow!("open log store for group {group}: {e}"))?;
    let state_machine = StateMachineShell::open(data_dir, group, applier)
        .await
        .map_err(|e| anyhow::anyhow!("open state machine for group {group}: {e}"))?;

    let raft =
        openraft::Raft::<TypeConfig>::new(node_id, config, network, log_store, state_machine)
            .await
            .with_context(|| format!("start raft group {group}"))?;

    Ok(RaftConsensus::new(raft))
}
