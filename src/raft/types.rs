use std::io::Cursor;

use serde::{Deserialize, Serialize};

use crate::command::{Command, CommandResponse};

/// Raft node identifier.
pub type NodeId = u64;

/// Node metadata stored in membership config and exposed to networking.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMeta {
    /// A human-friendly node name.
    pub name: String,

    /// Base URL of this node's HTTP listener; raft RPC routes for every
    /// replication group are nested under it.
    pub api_base_url: String,
}

/// OpenRaft type configuration shared by both replication groups.
///
/// Storage v2 separates `RaftLogStorage` and `RaftStateMachine`, which matches
/// the WAL + snapshot + applier architecture here. Each group's state machine
/// owns the applier for its command family.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct TypeConfig;

impl openraft::RaftTypeConfig for TypeConfig {
    type D = Command;
    type R = CommandResponse;

    type NodeId = NodeId;
    type Node = NodeMeta;

    type Entry = openraft::impls::Entry<TypeConfig>;
    type Responder = openraft::impls::OneshotResponder<TypeConfig>;
    type AsyncRuntime = openraft::impls::TokioRuntime;

    // Requires tokio `io-util` for AsyncRead/Write/Seek impls on Cursor.
    type SnapshotData = Cursor<Vec<u8>>;
}
