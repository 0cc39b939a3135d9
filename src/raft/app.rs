use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

use anyhow::Context as _;
use tokio::sync::watch;

use crate::{
    applier::{Applier, LeaderState},
    command::{Command, CommandResponse},
    raft::types::{NodeId, NodeMeta, TypeConfig},
};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Why a write proposal never became a log entry, or failed after submission.
#[derive(Debug)]
pub enum ProposeError {
    /// This node does not currently believe itself leader. No log entry was
    /// created; the caller retries against the leader. No forwarding here.
    NotLeader,
    /// The consensus engine rejected or lost the entry (e.g. leadership lost
    /// mid-flight).
    Engine(String),
}

impl std::fmt::Display for ProposeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotLeader => write!(f, "not leader"),
            Self::Engine(msg) => write!(f, "consensus engine: {msg}"),
        }
    }
}

impl std::error::Error for ProposeError {}

/// Write path shared by both appliers: serialize a command into the group's
/// log and resolve once the commit decision and local application are known.
pub trait ConsensusHandle: Send + Sync + 'static {
    fn is_leader(&self) -> bool;

    fn propose(&self, cmd: Command) -> BoxFuture<'_, Result<CommandResponse, ProposeError>>;
}

/// Real consensus handle over one openraft replication group.
#[derive(Clone)]
pub struct RaftConsensus {
    raft: openraft::Raft<TypeConfig>,
    metrics: watch::Receiver<openraft::RaftMetrics<NodeId, NodeMeta>>,
    leader: Arc<LeaderState>,
}

impl RaftConsensus {
    /// Wrap a started raft group and spawn the leadership watcher that keeps
    /// the leader hint current from engine callbacks.
    pub fn new(raft: openraft::Raft<TypeConfig>) -> Self {
        let metrics = raft.metrics();
        let leader = Arc::new(LeaderState::new());

        let mut watch_rx = metrics.clone();
        let watch_leader = leader.clone();
        tokio::spawn(async move {
            loop {
                {
                    let m = watch_rx.borrow();
                    if m.state == openraft::ServerState::Leader {
                        watch_leader.on_leader_start(m.current_term);
                    } else {
                        watch_leader.on_leader_stop();
                    }
                }
                if watch_rx.changed().await.is_err() {
                    return;
                }
            }
        });

        Self {
            raft,
            metrics,
            leader,
        }
    }

    pub fn raft(&self) -> openraft::Raft<TypeConfig> {
        self.raft.clone()
    }

    pub fn metrics(&self) -> watch::Receiver<openraft::RaftMetrics<NodeId, NodeMeta>> {
        self.metrics.clone()
    }

    pub fn leader_state(&self) -> Arc<LeaderState> {
        self.leader.clone()
    }

    pub async fn initialize_single_node_if_needed(
        &self,
        node_id: NodeId,
        node_meta: NodeMeta,
    ) -> anyhow::Result<()> {
        let initialized = self
            .raft
            .is_initialized()
            .await
            .context("raft is_initialized")?;
        if initialized {
            return Ok(());
        }
        let mut nodes = std::collections::BTreeMap::new();
        nodes.insert(node_id, node_meta);
        self.raft
            .initialize(nodes)
            .await
            .map_err(|e| anyhow::anyhow!("raft initialize: {e}"))?;
        Ok(())
    }

    pub async fn initialize_cluster_if_needed(
        &self,
        nodes: std::collections::BTreeMap<NodeId, NodeMeta>,
    ) -> anyhow::Result<()> {
        let initialized = self
            .raft
            .is_initialized()
            .await
            .context("raft is_initialized")?;
        if initialized {
            return Ok(());
        }
        self.raft
            .initialize(nodes)
            .await
            .map_err(|e| anyhow::anyhow!("raft initialize: {e}"))?;
        Ok(())
    }
}

impl ConsensusHandle for RaftConsensus {
    fn is_leader(&self) -> bool {
        self.leader.is_leader()
    }

    fn propose(&self, cmd: Command) -> BoxFuture<'_, Result<CommandResponse, ProposeError>> {
        Box::pin(async move {
            // Pre-proposal rejection on the hint: no log entry is created for
            // a node that does not believe itself leader.
            if !self.leader.is_leader() {
                return Err(ProposeError::NotLeader);
            }
            match self.raft.client_write(cmd).await {
                Ok(resp) => Ok(resp.data),
                Err(err) => {
                    // The hint can be stale between check and use; the engine
                    // is authoritative.
                    if let Some(openraft::error::ClientWriteError::ForwardToLeader(_)) =
                        err.api_error()
                    {
                        return Err(ProposeError::NotLeader);
                    }
                    Err(ProposeError::Engine(err.to_string()))
                }
            }
        })
    }
}

/// Test-only consensus handle that commits commands straight to an applier,
/// mimicking the commit-then-apply contract without a cluster.
pub struct LocalConsensus {
    applier: Arc<dyn Applier>,
    leader: AtomicBool,
    entries_created: AtomicU64,
}

impl LocalConsensus {
    pub fn leader(applier: Arc<dyn Applier>) -> Self {
        Self {
            applier,
            leader: AtomicBool::new(true),
            entries_created: AtomicU64::new(0),
        }
    }

    pub fn follower(applier: Arc<dyn Applier>) -> Self {
        Self {
            applier,
            leader: AtomicBool::new(false),
            entries_created: AtomicU64::new(0),
        }
    }

    pub fn set_leader(&self, leader: bool) {
        self.leader.store(leader, Ordering::SeqCst);
    }

    /// Number of log entries this handle has created.
    pub fn entries_created(&self) -> u64 {
        self.entries_created.load(Ordering::SeqCst)
    }
}

impl ConsensusHandle for LocalConsensus {
    fn is_leader(&self) -> bool {
        self.leader.load(Ordering::SeqCst)
    }

    fn propose(&self, cmd: Command) -> BoxFuture<'_, Result<CommandResponse, ProposeError>> {
        Box::pin(async move {
            if !self.is_leader() {
                return Err(ProposeError::NotLeader);
            }
            self.entries_created.fetch_add(1, Ordering::SeqCst);
            Ok(match self.applier.execute(&cmd) {
                Ok(result) => CommandResponse::Ok { result },
                Err(err) => CommandResponse::Err {
                    code: err.code().to_string(),
                    message: err.to_string(),
                },
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{RegistryApplier, RegistryStore};

    fn register_cmd() -> Command {
        Command::Registry(crate::command::RegistryOperation::Register {
            service_name: "orders".to_string(),
            service_id: "svc-1".to_string(),
            host: "10.0.0.1".to_string(),
            port: 9000,
            metadata: Default::default(),
            timestamp_ms: 1,
        })
    }

    #[tokio::test]
    async fn follower_rejects_writes_without_creating_entries() {
        let store = Arc::new(RegistryStore::new());
        let consensus = LocalConsensus::follower(Arc::new(RegistryApplier::new(store.clone())));

        let err = consensus.propose(register_cmd()).await.unwrap_err();
        assert!(matches!(err, ProposeError::NotLeader));
        assert_eq!(consensus.entries_created(), 0);
        assert!(store.instances("orders").is_empty());
    }

    #[tokio::test]
    async fn leader_commits_and_applies() {
        let store = Arc::new(RegistryStore::new());
        let consensus = LocalConsensus::leader(Arc::new(RegistryApplier::new(store.clone())));

        let resp = consensus.propose(register_cmd()).await.unwrap();
        assert!(resp.is_ok());
        assert_eq!(consensus.entries_created(), 1);
        assert_eq!(store.instances("orders").len(), 1);
    }
}
