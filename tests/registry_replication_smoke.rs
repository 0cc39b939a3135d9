use std::{collections::BTreeSet, sync::Arc};

use anyhow::Context as _;
use tokio::{
    net::TcpListener,
    sync::oneshot,
    task::JoinHandle,
    time::{Duration, Instant},
};

use regatta::{
    raft::{
        app::{ConsensusHandle as _, RaftConsensus},
        http_rpc::build_raft_rpc_router,
        network_http::HttpNetworkFactory,
        runtime::start_group,
        NodeId, NodeMeta, REGISTRY_GROUP,
    },
    registry::{Registry, RegistryApplier, RegistryError, RegistryStore},
};

struct RpcServerHandle {
    base_url: String,
    shutdown_tx: Option<oneshot::Sender<()>>,
    join: JoinHandle<anyhow::Result<()>>,
}

impl RpcServerHandle {
    async fn shutdown(mut self) -> anyhow::Result<()> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.join
            .await
            .context("join raft rpc server task")?
            .context("raft rpc server exited with error")?;
        Ok(())
    }
}

async fn spawn_raft_rpc_server(consensus: &RaftConsensus) -> anyhow::Result<RpcServerHandle> {
    let listener = TcpListener::bind(("127.0.0.1", 0))
        .await
        .context("bind raft rpc listener")?;
    let addr = listener.local_addr().context("raft rpc local_addr")?;
    let base_url = format!("http://{addr}");

    let router = build_raft_rpc_router(REGISTRY_GROUP, consensus.raft());

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let join = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .map_err(|e| anyhow::anyhow!("axum serve: {e}"))?;
        Ok(())
    });

    Ok(RpcServerHandle {
        base_url,
        shutdown_tx: Some(shutdown_tx),
        join,
    })
}

async fn wait_for_leader(
    mut rx: tokio::sync::watch::Receiver<openraft::RaftMetrics<NodeId, NodeMeta>>,
    expected_leader: NodeId,
    timeout: Duration,
) -> anyhow::Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        {
            let m = rx.borrow();
            if m.state == openraft::ServerState::Leader && m.current_leader == Some(expected_leader)
            {
                return Ok(());
            }
        }

        if Instant::now() >= deadline {
            let m = rx.borrow();
            anyhow::bail!(
                "timeout waiting for leader={expected_leader}; state={:?} current_leader={:?}",
                m.state,
                m.current_leader
            );
        }

        rx.changed().await.context("metrics changed")?;
    }
}

async fn wait_for_instance(
    store: &Arc<RegistryStore>,
    service: &str,
    service_id: &str,
    timeout: Duration,
) -> anyhow::Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        if store
            .instances(service)
            .iter()
            .any(|i| i.service_id == service_id)
        {
            return Ok(());
        }
        if Instant::now() >= deadline {
            anyhow::bail!("timeout waiting for replicated instance {service}/{service_id}");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn registry_two_node_replication_smoke() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir().context("tempdir")?;
    let node1_dir = tmp.path().join("node-1");
    let node2_dir = tmp.path().join("node-2");
    std::fs::create_dir_all(&node1_dir).context("create node-1 dir")?;
    std::fs::create_dir_all(&node2_dir).context("create node-2 dir")?;

    let node1_id: NodeId = 1;
    let node2_id: NodeId = 2;

    let store1 = Arc::new(RegistryStore::new());
    let store2 = Arc::new(RegistryStore::new());

    let consensus1 = start_group(
        &node1_dir,
        REGISTRY_GROUP,
        node1_id,
        Arc::new(RegistryApplier::new(store1.clone())),
        HttpNetworkFactory::new(REGISTRY_GROUP)?,
    )
    .await
    .context("start group on node-1")?;
    let consensus2 = start_group(
        &node2_dir,
        REGISTRY_GROUP,
        node2_id,
        Arc::new(RegistryApplier::new(store2.clone())),
        HttpNetworkFactory::new(REGISTRY_GROUP)?,
    )
    .await
    .context("start group on node-2")?;

    let rpc1 = spawn_raft_rpc_server(&consensus1).await.context("rpc-1")?;
    let rpc2 = spawn_raft_rpc_server(&consensus2).await.context("rpc-2")?;

    let node1_meta = NodeMeta {
        name: "node-1".to_string(),
        api_base_url: rpc1.base_url.clone(),
    };
    let node2_meta = NodeMeta {
        name: "node-2".to_string(),
        api_base_url: rpc2.base_url.clone(),
    };

    consensus1
        .initialize_single_node_if_needed(node1_id, node1_meta.clone())
        .await
        .context("initialize node-1")?;
    wait_for_leader(consensus1.metrics(), node1_id, Duration::from_secs(8)).await?;

    consensus1
        .raft()
        .add_learner(node2_id, node2_meta, true)
        .await
        .context("add node-2 learner")?;

    let registry1 = Registry::new(store1.clone(), Arc::new(consensus1.clone()));
    let registry2 = Registry::new(store2.clone(), Arc::new(consensus2.clone()));

    // The write resolves only after commit and local apply, so the instance
    // is visible on the leader the moment register returns.
    registry1
        .register("orders", "svc-1", "10.0.0.1", 9000, Default::default())
        .await
        .map_err(|e| anyhow::anyhow!("register on leader: {e}"))?;
    assert_eq!(registry1.get_instances("orders").len(), 1);

    wait_for_instance(&store2, "orders", "svc-1", Duration::from_secs(8)).await?;

    // A non-leader refuses writes instead of forwarding them.
    let err = registry2
        .register("orders", "svc-2", "10.0.0.2", 9000, Default::default())
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::NotLeader));
    assert!(!consensus2.is_leader());

    consensus1
        .raft()
        .change_membership(BTreeSet::from([node1_id, node2_id]), false)
        .await
        .context("promote node-2 to voter")?;

    registry1
        .deregister("orders", "svc-1")
        .await
        .map_err(|e| anyhow::anyhow!("deregister on leader: {e}"))?;
    assert!(registry1.get_instances("orders").is_empty());

    let deadline = Instant::now() + Duration::from_secs(8);
    while !store2.instances("orders").is_empty() {
        if Instant::now() >= deadline {
            anyhow::bail!("timeout waiting for deregistration to replicate");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    rpc1.shutdown().await?;
    rpc2.shutdown().await?;

    Ok(())
}
