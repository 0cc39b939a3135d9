//! Replicated control plane: a raft-backed service registry and SQL store,
//! plus the RPC pipeline services use to call each other through the
//! registry.

pub mod applier;
pub mod command;
pub mod config;
pub mod http;
pub mod raft;
pub mod registry;
pub mod rpc;
pub mod sql;
