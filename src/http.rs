//! Admin HTTP API: registry reads and writes, SQL execution, and raft
//! status, mounted beside the raft RPC routes on the node's HTTP listener.

use std::{collections::BTreeMap, sync::Arc};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    command::{now_ms, Command, CommandResponse, ServiceInstance, ServiceStatus, SqlOperation},
    raft::app::{ConsensusHandle, ProposeError},
    registry::{Registry, RegistryError},
    rpc::{RpcClient, RpcError},
    sql::SqlStore,
};

#[derive(Clone)]
pub struct AppState {
    pub registry: Registry,
    pub sql_store: Arc<SqlStore>,
    pub sql_consensus: Arc<dyn ConsensusHandle>,
    pub rpc_client: Arc<RpcClient>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/services", get(list_services))
        .route(
            "/v1/services/:service/instances",
            get(list_instances).post(register_instance),
        )
        .route(
            "/v1/services/:service/instances/:id",
            axum::routing::delete(deregister_instance),
        )
        .route(
            "/v1/services/:service/instances/:id/heartbeat",
            axum::routing::put(heartbeat_instance),
        )
        .route("/v1/sql/exec", post(sql_exec))
        .route("/v1/sql/query", post(sql_query))
        .route("/v1/rpc/invoke", post(rpc_invoke))
        .with_state(state)
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
}

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ApiError>)>;

fn api_error(status: StatusCode, code: &str, message: impl Into<String>) -> (StatusCode, Json<ApiError>) {
    (
        status,
        Json(ApiError {
            code: code.to_string(),
            message: message.into(),
        }),
    )
}

fn registry_error(err: RegistryError) -> (StatusCode, Json<ApiError>) {
    match err {
        // 409 tells the client to retry against the leader.
        RegistryError::NotLeader => {
            api_error(StatusCode::CONFLICT, "not_leader", "this node is not the leader")
        }
        RegistryError::Consensus(msg) => {
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "consensus", msg)
        }
        RegistryError::Application { code, message } => {
            api_error(StatusCode::UNPROCESSABLE_ENTITY, &code, message)
        }
    }
}

async fn healthz() -> &'static str {
    "ok"
}

async fn list_services(State(state): State<AppState>) -> Json<Vec<String>> {
    Json(state.registry.get_services())
}

async fn list_instances(
    State(state): State<AppState>,
    Path(service): Path<String>,
) -> Json<Vec<ServiceInstance>> {
    Json(state.registry.get_instances(&service))
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    /// Generated when absent.
    #[serde(default)]
    pub service_id: Option<String>,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

async fn register_instance(
    State(state): State<AppState>,
    Path(service): Path<String>,
    Json(req): Json<RegisterRequest>,
) -> ApiResult<Vec<ServiceInstance>> {
    let service_id = req
        .service_id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    state
        .registry
        .register(&service, &service_id, &req.host, req.port, req.metadata)
        .await
        .map_err(registry_error)?;
    info!(service, instance = service_id, "registered");
    Ok(Json(state.registry.get_instances(&service)))
}

async fn deregister_instance(
    State(state): State<AppState>,
    Path((service, id)): Path<(String, String)>,
) -> ApiResult<Vec<ServiceInstance>> {
    state
        .registry
        .deregister(&service, &id)
        .await
        .map_err(registry_error)?;
    info!(service, instance = id, "deregistered");
    Ok(Json(state.registry.get_instances(&service)))
}

#[derive(Debug, Deserialize)]
pub struct HeartbeatRequest {
    pub status: ServiceStatus,
}

async fn heartbeat_instance(
    State(state): State<AppState>,
    Path((service, id)): Path<(String, String)>,
    Json(req): Json<HeartbeatRequest>,
) -> ApiResult<Vec<ServiceInstance>> {
    state
        .registry
        .heartbeat(&service, &id, req.status)
        .await
        .map_err(registry_error)?;
    Ok(Json(state.registry.get_instances(&service)))
}

#[derive(Debug, Deserialize)]
pub struct SqlRequest {
    pub sql: String,
    #[serde(default)]
    pub params: Vec<serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub struct SqlExecResponse {
    pub rows_affected: u64,
}

async fn sql_exec(
    State(state): State<AppState>,
    Json(req): Json<SqlRequest>,
) -> ApiResult<SqlExecResponse> {
    let cmd = Command::Sql(SqlOperation {
        sql: req.sql,
        params: req.params,
        timestamp_ms: now_ms(),
    });
    let response = state.sql_consensus.propose(cmd).await.map_err(|e| match e {
        ProposeError::NotLeader => {
            api_error(StatusCode::CONFLICT, "not_leader", "this node is not the leader")
        }
        ProposeError::Engine(msg) => api_error(StatusCode::INTERNAL_SERVER_ERROR, "consensus", msg),
    })?;

    match response {
        CommandResponse::Ok { result } => {
            let rows_affected = match result {
                crate::command::CommandOutput::Sql { rows_affected } => rows_affected,
                _ => 0,
            };
            Ok(Json(SqlExecResponse { rows_affected }))
        }
        CommandResponse::Err { code, message } => {
            Err(api_error(StatusCode::UNPROCESSABLE_ENTITY, &code, message))
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RpcInvokeRequest {
    pub service: String,
    pub method: String,
    #[serde(default)]
    pub args: serde_json::Value,
    #[serde(default)]
    pub attachments: BTreeMap<String, String>,
}

/// Invoke a registered provider through the full client pipeline. Arguments
/// and result cross the wire as MessagePack-encoded JSON values.
async fn rpc_invoke(
    State(state): State<AppState>,
    Json(req): Json<RpcInvokeRequest>,
) -> ApiResult<serde_json::Value> {
    state
        .rpc_client
        .call_with_attachments::<serde_json::Value, serde_json::Value>(
            &req.service,
            &req.method,
            &req.args,
            req.attachments,
        )
        .await
        .map(Json)
        .map_err(rpc_error)
}

fn rpc_error(err: RpcError) -> (StatusCode, Json<ApiError>) {
    match &err {
        RpcError::NoAvailableProviders { .. }
        | RpcError::NoProvidersMatchedRouting { .. }
        | RpcError::NoInstanceSelected { .. } => {
            api_error(StatusCode::SERVICE_UNAVAILABLE, "no_providers", err.to_string())
        }
        RpcError::Timeout { .. } => {
            api_error(StatusCode::GATEWAY_TIMEOUT, "timeout", err.to_string())
        }
        RpcError::Remote { message } => {
            api_error(StatusCode::BAD_GATEWAY, "remote_error", message.clone())
        }
        _ => api_error(StatusCode::INTERNAL_SERVER_ERROR, "rpc", err.to_string()),
    }
}

async fn sql_query(
    State(state): State<AppState>,
    Json(req): Json<SqlRequest>,
) -> ApiResult<Vec<BTreeMap<String, serde_json::Value>>> {
    state
        .sql_store
        .query(&req.sql, &req.params)
        .map(Json)
        .map_err(|e| api_error(StatusCode::UNPROCESSABLE_ENTITY, "sql_error", e.to_string()))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        raft::app::LocalConsensus,
        registry::{RegistryApplier, RegistryStore},
        rpc::{RoundRobinBalancer, RpcServer, RpcService, ServiceError},
        sql::SqlApplier,
    };
    use axum::{body::Body, http::Request};
    use tower::ServiceExt as _;

    fn test_state_with_timeout(timeout: Duration) -> AppState {
        let store = Arc::new(RegistryStore::new());
        let registry_consensus =
            Arc::new(LocalConsensus::leader(Arc::new(RegistryApplier::new(store.clone()))));
        let registry = Registry::new(store, registry_consensus);
        let sql_store = Arc::new(SqlStore::open_in_memory().unwrap());
        let sql_consensus =
            Arc::new(LocalConsensus::leader(Arc::new(SqlApplier::new(sql_store.clone()))));
        let rpc_client = Arc::new(
            RpcClient::new(
                Arc::new(registry.clone()),
                Arc::new(RoundRobinBalancer::default()),
            )
            .with_timeout(timeout),
        );
        AppState {
            registry,
            sql_store,
            sql_consensus,
            rpc_client,
        }
    }

    fn test_state() -> AppState {
        test_state_with_timeout(Duration::from_secs(3))
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn register_then_list_round_trip() {
        let app = build_router(test_state());

        let response = app
            .clone()
            .oneshot(
                Request::post("/v1/services/orders/instances")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        serde_json::json!({
                            "service_id": "svc-1",
                            "host": "10.0.0.1",
                            "port": 9000
                        })
                        .to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(
                Request::get("/v1/services/orders/instances")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let instances = body_json(response).await;
        assert_eq!(instances.as_array().unwrap().len(), 1);
        assert_eq!(instances[0]["service_id"], "svc-1");
        assert_eq!(instances[0]["status"], "up");
    }

    #[tokio::test]
    async fn follower_rejects_writes_with_conflict() {
        let store = Arc::new(RegistryStore::new());
        let registry_consensus =
            Arc::new(LocalConsensus::follower(Arc::new(RegistryApplier::new(store.clone()))));
        let registry = Registry::new(store, registry_consensus);
        let sql_store = Arc::new(SqlStore::open_in_memory().unwrap());
        let sql_consensus =
            Arc::new(LocalConsensus::leader(Arc::new(SqlApplier::new(sql_store.clone()))));
        let rpc_client = Arc::new(RpcClient::new(
            Arc::new(registry.clone()),
            Arc::new(RoundRobinBalancer::default()),
        ));
        let app = build_router(AppState {
            registry,
            sql_store,
            sql_consensus,
            rpc_client,
        });

        let response = app
            .oneshot(
                Request::post("/v1/services/orders/instances")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        serde_json::json!({
                            "service_id": "svc-1",
                            "host": "10.0.0.1",
                            "port": 9000
                        })
                        .to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(body_json(response).await["code"], "not_leader");
    }

    #[tokio::test]
    async fn sql_exec_and_query_round_trip() {
        let app = build_router(test_state());

        for sql in [
            "CREATE TABLE t (k TEXT PRIMARY KEY, v INTEGER)",
            "INSERT INTO t (k, v) VALUES ('a', 1)",
        ] {
            let response = app
                .clone()
                .oneshot(
                    Request::post("/v1/sql/exec")
                        .header("content-type", "application/json")
                        .body(Body::from(serde_json::json!({ "sql": sql }).to_string()))
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = app
            .oneshot(
                Request::post("/v1/sql/query")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        serde_json::json!({ "sql": "SELECT v FROM t WHERE k = ?1", "params": ["a"] })
                            .to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let rows = body_json(response).await;
        assert_eq!(rows[0]["v"], 1);
    }

    #[tokio::test]
    async fn failed_sql_statement_maps_to_unprocessable() {
        let app = build_router(test_state());

        let response = app
            .oneshot(
                Request::post("/v1/sql/exec")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        serde_json::json!({ "sql": "INSERT INTO missing VALUES (1)" }).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body_json(response).await["code"], "sql_error");
    }

    struct Shout;

    impl RpcService for Shout {
        fn invoke(
            &self,
            method: &str,
            arguments: &[u8],
            _attachments: &BTreeMap<String, String>,
        ) -> Result<Vec<u8>, ServiceError> {
            match method {
                "shout" => {
                    let text: String = rmp_serde::from_slice(arguments)
                        .map_err(|e| ServiceError::Failed(e.to_string()))?;
                    rmp_serde::to_vec(&text.to_uppercase())
                        .map_err(|e| ServiceError::Failed(e.to_string()))
                }
                other => Err(ServiceError::UnknownMethod(other.to_string())),
            }
        }
    }

    async fn register_provider(state: &AppState, service: &str, port: u16) {
        state
            .registry
            .register(service, "svc-1", "127.0.0.1", port, Default::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn invoke_calls_a_registered_provider() {
        let state = test_state();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let handle = RpcServer::new()
            .with_service("announcer", Arc::new(Shout))
            .serve(listener)
            .unwrap();
        register_provider(&state, "announcer", handle.addr().port()).await;
        let app = build_router(state);

        let response = app
            .oneshot(
                Request::post("/v1/rpc/invoke")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        serde_json::json!({
                            "service": "announcer",
                            "method": "shout",
                            "args": "hello"
                        })
                        .to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, serde_json::json!("HELLO"));

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn invoke_without_providers_is_unavailable() {
        let app = build_router(test_state());

        let response = app
            .oneshot(
                Request::post("/v1/rpc/invoke")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        serde_json::json!({ "service": "ghost", "method": "shout" }).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body_json(response).await["code"], "no_providers");
    }

    #[tokio::test]
    async fn invoke_honors_the_configured_timeout() {
        // Provider accepts and reads but never answers.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut stream = stream;
                    let mut buf = [0u8; 1024];
                    loop {
                        use tokio::io::AsyncReadExt as _;
                        match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(_) => {}
                        }
                    }
                });
            }
        });

        let state = test_state_with_timeout(Duration::from_millis(200));
        register_provider(&state, "announcer", port).await;
        let app = build_router(state);

        let response = app
            .oneshot(
                Request::post("/v1/rpc/invoke")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        serde_json::json!({ "service": "announcer", "method": "shout", "args": "x" })
                            .to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(body_json(response).await["code"], "timeout");
    }
}
