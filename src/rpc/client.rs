use std::{
    collections::{BTreeMap, HashMap},
    io,
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::{
    net::{tcp::OwnedWriteHalf, TcpStream},
    sync::oneshot,
};
use tracing::{debug, warn};

use crate::{
    command::{ServiceInstance, ServiceStatus},
    registry::Registry,
    rpc::{
        balance::LoadBalancer,
        envelope::{next_request_id, read_frame, write_frame, RpcRequest, RpcResponse, STATUS_OK},
        route::Router,
    },
};

#[derive(Debug)]
pub enum RpcError {
    /// Discovery found no live instance of the service.
    NoAvailableProviders { service: String },
    /// Routing narrowed the candidate set to nothing.
    NoProvidersMatchedRouting { service: String },
    /// The balancer declined to pick an instance.
    NoInstanceSelected { service: String },
    /// The provider ran the method and reported failure.
    Remote { message: String },
    /// No response within the call's timeout. The request may still execute
    /// on the provider.
    Timeout { after: Duration },
    Transport(io::Error),
    Encode(rmp_serde::encode::Error),
    Decode(rmp_serde::decode::Error),
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoAvailableProviders { service } => {
                write!(f, "no available providers for service {service}")
            }
            Self::NoProvidersMatchedRouting { service } => {
                write!(f, "no providers matched routing rules for service {service}")
            }
            Self::NoInstanceSelected { service } => {
                write!(f, "load balancer selected no instance for service {service}")
            }
            Self::Remote { message } => write!(f, "remote invocation failed: {message}"),
            Self::Timeout { after } => write!(f, "call timed out after {after:?}"),
            Self::Transport(e) => write!(f, "transport: {e}"),
            Self::Encode(e) => write!(f, "encode arguments: {e}"),
            Self::Decode(e) => write!(f, "decode result: {e}"),
        }
    }
}

impl std::error::Error for RpcError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transport(e) => Some(e),
            Self::Encode(e) => Some(e),
            Self::Decode(e) => Some(e),
            _ => None,
        }
    }
}

impl From<rmp_serde::encode::Error> for RpcError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        Self::Encode(e)
    }
}

impl From<rmp_serde::decode::Error> for RpcError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        Self::Decode(e)
    }
}

/// Where the client learns about providers. The registry is the production
/// implementation; a fixed list covers tests and static topologies.
pub trait Discovery: Send + Sync + 'static {
    fn instances(&self, service_name: &str) -> Vec<ServiceInstance>;
}

impl Discovery for Registry {
    fn instances(&self, service_name: &str) -> Vec<ServiceInstance> {
        self.get_instances(service_name)
    }
}

pub struct StaticDiscovery {
    instances: Vec<ServiceInstance>,
}

impl StaticDiscovery {
    pub fn new(instances: Vec<ServiceInstance>) -> Self {
        Self { instances }
    }
}

impl Discovery for StaticDiscovery {
    fn instances(&self, service_name: &str) -> Vec<ServiceInstance> {
        self.instances
            .iter()
            .filter(|i| i.service_name == service_name)
            .cloned()
            .collect()
    }
}

const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(3);

/// Remote-call entry point. Each call walks the same pipeline: discover live
/// instances, narrow them through the routing stages, let the balancer pick
/// one, then exchange one request/response pair over a cached connection.
pub struct RpcClient {
    discovery: Arc<dyn Discovery>,
    routers: Vec<Arc<dyn Router>>,
    balancer: Arc<dyn LoadBalancer>,
    transport: Transport,
    timeout: Duration,
}

impl RpcClient {
    pub fn new(discovery: Arc<dyn Discovery>, balancer: Arc<dyn LoadBalancer>) -> Self {
        Self {
            discovery,
            routers: Vec::new(),
            balancer,
            transport: Transport::new(),
            timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    /// Append a routing stage. Stages run in insertion order.
    pub fn with_router(mut self, router: Arc<dyn Router>) -> Self {
        self.routers.push(router);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Typed call: arguments and result are MessagePack-encoded.
    pub async fn call<A, R>(&self, service: &str, method: &str, args: &A) -> Result<R, RpcError>
    where
        A: serde::Serialize + ?Sized,
        R: serde::de::DeserializeOwned,
    {
        let arguments = rmp_serde::to_vec(args)?;
        let result = self
            .call_raw(service, method, arguments, BTreeMap::new())
            .await?;
        Ok(rmp_serde::from_slice(&result)?)
    }

    pub async fn call_with_attachments<A, R>(
        &self,
        service: &str,
        method: &str,
        args: &A,
        attachments: BTreeMap<String, String>,
    ) -> Result<R, RpcError>
    where
        A: serde::Serialize + ?Sized,
        R: serde::de::DeserializeOwned,
    {
        let arguments = rmp_serde::to_vec(args)?;
        let result = self.call_raw(service, method, arguments, attachments).await?;
        Ok(rmp_serde::from_slice(&result)?)
    }

    pub async fn call_raw(
        &self,
        service: &str,
        method: &str,
        arguments: Vec<u8>,
        attachments: BTreeMap<String, String>,
    ) -> Result<Vec<u8>, RpcError> {
        let live: Vec<ServiceInstance> = self
            .discovery
            .instances(service)
            .into_iter()
            .filter(|i| i.status == ServiceStatus::Up)
            .collect();
        if live.is_empty() {
            return Err(RpcError::NoAvailableProviders {
                service: service.to_string(),
            });
        }

        let request = RpcRequest {
            request_id: next_request_id(),
            service_name: service.to_string(),
            method_name: method.to_string(),
            arguments,
            timeout_ms: self.timeout.as_millis() as u64,
            attachments,
        };

        let mut candidates = live;
        for router in &self.routers {
            candidates = router.route(candidates, &request);
            if candidates.is_empty() {
                return Err(RpcError::NoProvidersMatchedRouting {
                    service: service.to_string(),
                });
            }
        }

        let target = self
            .balancer
            .select(&candidates)
            .ok_or_else(|| RpcError::NoInstanceSelected {
                service: service.to_string(),
            })?;

        debug!(
            service,
            method,
            target = %target.address(),
            request_id = request.request_id,
            "rpc call"
        );

        let response = self
            .transport
            .send(&target.address(), &request, self.timeout)
            .await?;
        if response.status == STATUS_OK {
            Ok(response.result)
        } else {
            Err(RpcError::Remote {
                message: response.error_message,
            })
        }
    }
}

type PendingMap = Mutex<HashMap<u64, oneshot::Sender<RpcResponse>>>;

struct Connection {
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    pending: Arc<PendingMap>,
    closed: Arc<std::sync::atomic::AtomicBool>,
}

impl Connection {
    fn is_closed(&self) -> bool {
        self.closed.load(std::sync::atomic::Ordering::SeqCst)
    }
}

/// One multiplexed connection per provider address, created on first use. A
/// reader task per connection resolves pending calls by request id.
pub struct Transport {
    connections: tokio::sync::Mutex<HashMap<String, Arc<Connection>>>,
}

impl Default for Transport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport {
    pub fn new() -> Self {
        Self {
            connections: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    async fn connection(&self, address: &str) -> Result<Arc<Connection>, RpcError> {
        // The cache lock covers the connect so concurrent callers to one
        // address share a single connection instead of racing to create it.
        let mut connections = self.connections.lock().await;
        if let Some(conn) = connections.get(address) {
            if !conn.is_closed() {
                return Ok(conn.clone());
            }
            connections.remove(address);
        }

        let stream = TcpStream::connect(address)
            .await
            .map_err(RpcError::Transport)?;
        let (mut read_half, write_half) = stream.into_split();

        let pending: Arc<PendingMap> = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let conn = Arc::new(Connection {
            writer: tokio::sync::Mutex::new(write_half),
            pending: pending.clone(),
            closed: closed.clone(),
        });

        let reader_address = address.to_string();
        tokio::spawn(async move {
            loop {
                match read_frame::<RpcResponse, _>(&mut read_half).await {
                    Ok(response) => {
                        // Removing the entry is the exclusive claim on this
                        // request's outcome; a response for an id the timeout
                        // already claimed is dropped here.
                        let sender = pending.lock().unwrap_or_else(|p| p.into_inner())
                            .remove(&response.request_id);
                        if let Some(sender) = sender {
                            let _ = sender.send(response);
                        }
                    }
                    Err(err) => {
                        if err.kind() != io::ErrorKind::UnexpectedEof {
                            warn!(address = %reader_address, error = %err, "rpc connection lost");
                        }
                        closed.store(true, std::sync::atomic::Ordering::SeqCst);
                        // Fail everything still waiting on this connection.
                        pending.lock().unwrap_or_else(|p| p.into_inner()).clear();
                        return;
                    }
                }
            }
        });

        connections.insert(address.to_string(), conn.clone());
        Ok(conn)
    }

    async fn evict(&self, address: &str, conn: &Arc<Connection>) {
        let mut connections = self.connections.lock().await;
        if let Some(current) = connections.get(address) {
            if Arc::ptr_eq(current, conn) {
                connections.remove(address);
            }
        }
    }

    /// Send one request and wait for its correlated response or the timeout,
    /// whichever claims the pending entry first.
    pub async fn send(
        &self,
        address: &str,
        request: &RpcRequest,
        timeout: Duration,
    ) -> Result<RpcResponse, RpcError> {
        let conn = self.connection(address).await?;

        let (tx, mut rx) = oneshot::channel();
        conn.pending
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(request.request_id, tx);

        {
            let mut writer = conn.writer.lock().await;
            if let Err(err) = write_frame(&mut *writer, request).await {
                conn.pending
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .remove(&request.request_id);
                conn.closed.store(true, std::sync::atomic::Ordering::SeqCst);
                self.evict(address, &conn).await;
                return Err(RpcError::Transport(err));
            }
        }

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => {
                // Reader task dropped the sender: connection died under us.
                self.evict(address, &conn).await;
                Err(RpcError::Transport(io::Error::other("connection closed")))
            }
            Err(_) => {
                let claimed = conn
                    .pending
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .remove(&request.request_id)
                    .is_some();
                if claimed {
                    Err(RpcError::Timeout { after: timeout })
                } else {
                    // The response won the claim between the timer firing and
                    // this check; deliver it rather than invent a timeout.
                    match rx.await {
                        Ok(response) => Ok(response),
                        Err(_) => {
                            self.evict(address, &conn).await;
                            Err(RpcError::Transport(io::Error::other("connection closed")))
                        }
                    }
                }
            }
        }
    }
}
