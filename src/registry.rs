//! Replicated service directory: the registry applier that lives under
//! consensus, plus the facade applications call to register, discover, and
//! subscribe.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use tracing::debug;

use crate::{
    applier::{Applier, ApplyError, SnapshotError, SnapshotReader, SnapshotWriter},
    command::{
        now_ms, Command, CommandOutput, CommandResponse, RegistryOperation, ServiceInstance,
        ServiceStatus,
    },
    raft::app::{ConsensusHandle, ProposeError},
};

/// File name the registry registers in every snapshot manifest.
pub const REGISTRY_SNAPSHOT_FILE: &str = "registry.json";

/// Change callback: receives the full instance list of the service it is
/// subscribed to, after every applied change to that service.
pub type Listener = Arc<dyn Fn(&[ServiceInstance]) + Send + Sync>;

#[derive(Debug)]
pub enum RegistryError {
    /// This node is not the leader; retry against the leader.
    NotLeader,
    Consensus(String),
    /// The command committed but the directory rejected it.
    Application { code: String, message: String },
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotLeader => write!(f, "not leader"),
            Self::Consensus(msg) => write!(f, "consensus: {msg}"),
            Self::Application { code, message } => write!(f, "{code}: {message}"),
        }
    }
}

impl std::error::Error for RegistryError {}

impl From<ProposeError> for RegistryError {
    fn from(err: ProposeError) -> Self {
        match err {
            ProposeError::NotLeader => Self::NotLeader,
            ProposeError::Engine(msg) => Self::Consensus(msg),
        }
    }
}

/// The whole directory, exactly as it is snapshotted. BTreeMaps keep
/// serialization deterministic across replicas.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct DirectoryState {
    pub services: BTreeMap<String, BTreeMap<String, ServiceInstance>>,
}

/// In-memory directory shared by the applier (single writer, in log order)
/// and any number of concurrent readers.
#[derive(Default)]
pub struct RegistryStore {
    directory: RwLock<DirectoryState>,
    subscriptions: RwLock<HashMap<String, Vec<Listener>>>,
}

// A panicked writer can only have been the apply task; the data it guards is
// still the last consistently applied state.
fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|p| p.into_inner())
}

fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|p| p.into_inner())
}

impl RegistryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one committed directory mutation. Deterministic: every input to
    /// the new state comes from the operation itself.
    pub fn apply_operation(&self, op: &RegistryOperation) -> Result<CommandOutput, ApplyError> {
        let service_name = op.service_name().to_string();
        let instances = {
            let mut directory = write_lock(&self.directory);
            match op {
                RegistryOperation::Register {
                    service_name,
                    service_id,
                    host,
                    port,
                    metadata,
                    timestamp_ms,
                } => {
                    let instance = ServiceInstance {
                        service_id: service_id.clone(),
                        service_name: service_name.clone(),
                        host: host.clone(),
                        port: *port,
                        status: ServiceStatus::Up,
                        metadata: metadata.clone(),
                        last_heartbeat_ms: *timestamp_ms,
                    };
                    directory
                        .services
                        .entry(service_name.clone())
                        .or_default()
                        .insert(service_id.clone(), instance);
                }
                RegistryOperation::Deregister {
                    service_name,
                    service_id,
                    ..
                } => {
                    if let Some(instances) = directory.services.get_mut(service_name) {
                        instances.remove(service_id);
                        if instances.is_empty() {
                            directory.services.remove(service_name);
                        }
                    }
                }
                RegistryOperation::Heartbeat {
                    service_name,
                    service_id,
                    status,
                    timestamp_ms,
                } => {
                    let instance = directory
                        .services
                        .get_mut(service_name)
                        .and_then(|instances| instances.get_mut(service_id));
                    match instance {
                        Some(instance) => {
                            instance.status = *status;
                            instance.last_heartbeat_ms = *timestamp_ms;
                        }
                        None => {
                            return Err(ApplyError::Rejected {
                                code: "unknown_instance",
                                message: format!(
                                    "no instance {service_id} registered for {service_name}"
                                ),
                            });
                        }
                    }
                }
            }
            collect_instances(&directory, &service_name)
        };

        self.notify(&service_name, &instances);
        Ok(CommandOutput::Registry { instances })
    }

    /// Current instances of one service, registration order by id.
    pub fn instances(&self, service_name: &str) -> Vec<ServiceInstance> {
        collect_instances(&read_lock(&self.directory), service_name)
    }

    pub fn service_names(&self) -> Vec<String> {
        read_lock(&self.directory).services.keys().cloned().collect()
    }

    pub fn directory_state(&self) -> DirectoryState {
        read_lock(&self.directory).clone()
    }

    /// Replace the whole directory, as snapshot installation does, and notify
    /// every service affected before or after the swap.
    pub fn replace_directory(&self, state: DirectoryState) {
        let affected: Vec<String> = {
            let mut directory = write_lock(&self.directory);
            let mut names: Vec<String> = directory.services.keys().cloned().collect();
            for name in state.services.keys() {
                if !names.contains(name) {
                    names.push(name.clone());
                }
            }
            *directory = state;
            names
        };
        for name in affected {
            let instances = self.instances(&name);
            self.notify(&name, &instances);
        }
    }

    pub fn subscribe(&self, service_name: &str, listener: Listener) {
        write_lock(&self.subscriptions)
            .entry(service_name.to_string())
            .or_default()
            .push(listener);
    }

    /// Remove one subscription by listener identity.
    pub fn unsubscribe(&self, service_name: &str, listener: &Listener) {
        let mut subscriptions = write_lock(&self.subscriptions);
        if let Some(listeners) = subscriptions.get_mut(service_name) {
            listeners.retain(|l| !Arc::ptr_eq(l, listener));
            if listeners.is_empty() {
                subscriptions.remove(service_name);
            }
        }
    }

    fn notify(&self, service_name: &str, instances: &[ServiceInstance]) {
        let listeners: Vec<Listener> = read_lock(&self.subscriptions)
            .get(service_name)
            .map(|l| l.to_vec())
            .unwrap_or_default();
        if !listeners.is_empty() {
            debug!(service = service_name, listeners = listeners.len(), "notify");
        }
        for listener in listeners {
            listener(instances);
        }
    }
}

fn collect_instances(directory: &DirectoryState, service_name: &str) -> Vec<ServiceInstance> {
    directory
        .services
        .get(service_name)
        .map(|instances| instances.values().cloned().collect())
        .unwrap_or_default()
}

/// Registry's side of the applier contract. Snapshot format is the pretty
/// JSON of [`DirectoryState`] under one registered file.
pub struct RegistryApplier {
    store: Arc<RegistryStore>,
}

impl RegistryApplier {
    pub fn new(store: Arc<RegistryStore>) -> Self {
        Self { store }
    }
}

impl Applier for RegistryApplier {
    fn execute(&self, cmd: &Command) -> Result<CommandOutput, ApplyError> {
        match cmd {
            Command::Registry(op) => self.store.apply_operation(op),
            Command::Sql(_) => Err(ApplyError::UnsupportedCommand { got: "sql" }),
        }
    }

    fn save_snapshot(&self, writer: &mut SnapshotWriter) -> Result<(), SnapshotError> {
        let state = self.store.directory_state();
        let json = serde_json::to_vec_pretty(&state)
            .map_err(|e| SnapshotError::Corrupt { reason: e.to_string() })?;
        std::fs::write(writer.file_path(REGISTRY_SNAPSHOT_FILE), json)?;
        writer.add_file(REGISTRY_SNAPSHOT_FILE);
        Ok(())
    }

    fn load_snapshot(&self, reader: &SnapshotReader) -> Result<(), SnapshotError> {
        if !reader.contains(REGISTRY_SNAPSHOT_FILE) {
            return Err(SnapshotError::MissingFile {
                name: REGISTRY_SNAPSHOT_FILE.to_string(),
            });
        }
        let bytes = std::fs::read(reader.file_path(REGISTRY_SNAPSHOT_FILE))?;
        let state: DirectoryState = serde_json::from_slice(&bytes)
            .map_err(|e| SnapshotError::Corrupt { reason: e.to_string() })?;
        self.store.replace_directory(state);
        Ok(())
    }
}

/// What applications hold: writes go through consensus, reads and
/// subscriptions are served from the local replica.
#[derive(Clone)]
pub struct Registry {
    store: Arc<RegistryStore>,
    consensus: Arc<dyn ConsensusHandle>,
}

impl Registry {
    pub fn new(store: Arc<RegistryStore>, consensus: Arc<dyn ConsensusHandle>) -> Self {
        Self { store, consensus }
    }

    pub async fn register(
        &self,
        service_name: &str,
        service_id: &str,
        host: &str,
        port: u16,
        metadata: BTreeMap<String, String>,
    ) -> Result<(), RegistryError> {
        self.propose(RegistryOperation::Register {
            service_name: service_name.to_string(),
            service_id: service_id.to_string(),
            host: host.to_string(),
            port,
            metadata,
            timestamp_ms: now_ms(),
        })
        .await
    }

    pub async fn deregister(&self, service_name: &str, service_id: &str) -> Result<(), RegistryError> {
        self.propose(RegistryOperation::Deregister {
            service_name: service_name.to_string(),
            service_id: service_id.to_string(),
            timestamp_ms: now_ms(),
        })
        .await
    }

    pub async fn heartbeat(
        &self,
        service_name: &str,
        service_id: &str,
        status: ServiceStatus,
    ) -> Result<(), RegistryError> {
        self.propose(RegistryOperation::Heartbeat {
            service_name: service_name.to_string(),
            service_id: service_id.to_string(),
            status,
            timestamp_ms: now_ms(),
        })
        .await
    }

    async fn propose(&self, op: RegistryOperation) -> Result<(), RegistryError> {
        match self.consensus.propose(Command::Registry(op)).await? {
            CommandResponse::Ok { .. } => Ok(()),
            CommandResponse::Err { code, message } => {
                Err(RegistryError::Application { code, message })
            }
        }
    }

    /// Local-replica read; commit-before-visibility is guaranteed by the
    /// apply path, not by this read.
    pub fn get_instances(&self, service_name: &str) -> Vec<ServiceInstance> {
        self.store.instances(service_name)
    }

    pub fn get_services(&self) -> Vec<String> {
        self.store.service_names()
    }

    pub fn subscribe(&self, service_name: &str, listener: Listener) {
        self.store.subscribe(service_name, listener);
    }

    pub fn unsubscribe(&self, service_name: &str, listener: &Listener) {
        self.store.unsubscribe(service_name, listener);
    }
}
