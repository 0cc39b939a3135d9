//! Consensus wiring: openraft type config, per-group storage adapters, the
//! HTTP raft transport, and the proposal-path facade both appliers share.

pub mod app;
pub mod http_rpc;
pub mod network_http;
pub mod runtime;
pub mod storage;
pub mod types;

pub use types::{NodeId, NodeMeta, TypeConfig};

/// Replication group carrying the service directory.
pub const REGISTRY_GROUP: &str = "registry";
/// Replication group carrying the embedded SQL store.
pub const SQL_GROUP: &str = "sql";
