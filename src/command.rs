//! Replicated command families and the shared response type. Everything here
//! travels through the consensus log, so every field is serde-stable and
//! application is a pure function of the payload (timestamps are captured at
//! proposal time, never at apply time).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Lifecycle state of one registered instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    Up,
    Down,
    Starting,
    OutOfService,
}

/// One registered provider of a service.
#[derive(Debug, Clone, Eq, Serialize, Deserialize)]
pub struct ServiceInstance {
    /// Unique within its service; the identity key for equality.
    pub service_id: String,
    pub service_name: String,
    pub host: String,
    pub port: u16,
    pub status: ServiceStatus,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// Unix millis of the last accepted registration or heartbeat.
    pub last_heartbeat_ms: i64,
}

impl ServiceInstance {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl PartialEq for ServiceInstance {
    fn eq(&self, other: &Self) -> bool {
        self.service_id == other.service_id
    }
}

/// Directory mutations. Each carries the full data needed to apply it
/// deterministically on every replica.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RegistryOperation {
    Register {
        service_name: String,
        service_id: String,
        host: String,
        port: u16,
        #[serde(default)]
        metadata: BTreeMap<String, String>,
        timestamp_ms: i64,
    },
    Deregister {
        service_name: String,
        service_id: String,
        timestamp_ms: i64,
    },
    Heartbeat {
        service_name: String,
        service_id: String,
        status: ServiceStatus,
        timestamp_ms: i64,
    },
}

impl RegistryOperation {
    pub fn service_name(&self) -> &str {
        match self {
            Self::Register { service_name, .. }
            | Self::Deregister { service_name, .. }
            | Self::Heartbeat { service_name, .. } => service_name,
        }
    }
}

/// One replicated SQL statement with positional parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SqlOperation {
    pub sql: String,
    #[serde(default)]
    pub params: Vec<serde_json::Value>,
    pub timestamp_ms: i64,
}

/// The union of everything that can enter a replication log. Each group's
/// applier accepts exactly one variant family and rejects the other.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Command {
    Registry(RegistryOperation),
    Sql(SqlOperation),
}

/// What a successfully applied command produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CommandOutput {
    Registry { instances: Vec<ServiceInstance> },
    Sql { rows_affected: u64 },
    /// Applied with nothing to report (blank and membership entries).
    Applied,
}

/// Outcome delivered to the proposer once the entry is committed and applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CommandResponse {
    Ok { result: CommandOutput },
    Err { code: String, message: String },
}

impl Default for CommandResponse {
    fn default() -> Self {
        Self::Ok {
            result: CommandOutput::Applied,
        }
    }
}

impl CommandResponse {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok { .. })
    }
}

/// Current wall-clock time as Unix millis. Called on the proposal path only.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
