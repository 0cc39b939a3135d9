use std::{collections::BTreeMap, collections::HashMap, net::SocketAddr, sync::Arc};

use tokio::{
    net::{tcp::OwnedWriteHalf, TcpListener},
    sync::{oneshot, Mutex},
    task::JoinHandle,
};
use tracing::{debug, warn};

use crate::rpc::envelope::{
    read_frame, write_frame, RpcRequest, RpcResponse, STATUS_INVOCATION_FAILED,
    STATUS_SERVICE_NOT_FOUND,
};

/// Why a method invocation failed on the provider side. The message travels
/// back verbatim in the response envelope.
#[derive(Debug)]
pub enum ServiceError {
    UnknownMethod(String),
    Failed(String),
}

impl std::fmt::Display for ServiceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownMethod(method) => write!(f, "unknown method: {method}"),
            Self::Failed(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for ServiceError {}

/// One exported service: dispatches a method name and raw MessagePack
/// arguments to an implementation.
pub trait RpcService: Send + Sync + 'static {
    fn invoke(
        &self,
        method: &str,
        arguments: &[u8],
        attachments: &BTreeMap<String, String>,
    ) -> Result<Vec<u8>, ServiceError>;
}

/// Frame server hosting any number of named services on one listener.
/// Requests on a connection are dispatched concurrently; responses go back
/// whenever their invocation finishes, correlated by request id.
#[derive(Default)]
pub struct RpcServer {
    services: HashMap<String, Arc<dyn RpcService>>,
}

impl RpcServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_service(mut self, name: &str, service: Arc<dyn RpcService>) -> Self {
        self.services.insert(name.to_string(), service);
        self
    }

    /// Run the accept loop on `listener` until the handle is shut down.
    pub fn serve(self, listener: TcpListener) -> std::io::Result<RpcServerHandle> {
        let addr = listener.local_addr()?;
        let services = Arc::new(self.services);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let join = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => return,
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, peer)) => {
                                debug!(%peer, "rpc connection accepted");
                                tokio::spawn(handle_connection(stream, services.clone()));
                            }
                            Err(err) => {
                                warn!(error = %err, "rpc accept failed");
                            }
                        }
                    }
                }
            }
        });

        Ok(RpcServerHandle {
            addr,
            shutdown: Some(shutdown_tx),
            join,
        })
    }
}

pub struct RpcServerHandle {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    join: JoinHandle<()>,
}

impl RpcServerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let _ = self.join.await;
    }
}

async fn handle_connection(
    stream: tokio::net::TcpStream,
    services: Arc<HashMap<String, Arc<dyn RpcService>>>,
) {
    let (mut reader, writer) = stream.into_split();
    let writer = Arc::new(Mutex::new(writer));

    loop {
        let request: RpcRequest = match read_frame(&mut reader).await {
            Ok(request) => request,
            // EOF or a broken frame both end the connection.
            Err(_) => return,
        };

        let services = services.clone();
        let writer = writer.clone();
        tokio::spawn(async move {
            let response = dispatch(&services, &request);
            send_response(&writer, &response).await;
        });
    }
}

fn dispatch(services: &HashMap<String, Arc<dyn RpcService>>, request: &RpcRequest) -> RpcResponse {
    let Some(service) = services.get(&request.service_name) else {
        return RpcResponse::error(
            request.request_id,
            STATUS_SERVICE_NOT_FOUND,
            format!("no such service: {}", request.service_name),
        );
    };

    match service.invoke(&request.method_name, &request.arguments, &request.attachments) {
        Ok(result) => RpcResponse::ok(request.request_id, result),
        Err(err) => RpcResponse::error(request.request_id, STATUS_INVOCATION_FAILED, err.to_string()),
    }
}

async fn send_response(writer: &Arc<Mutex<OwnedWriteHalf>>, response: &RpcResponse) {
    let mut writer = writer.lock().await;
    if let Err(err) = write_frame(&mut *writer, response).await {
        warn!(error = %err, "rpc response write failed");
    }
}
