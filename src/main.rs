use std::{collections::BTreeMap, sync::Arc};

use anyhow::{Context as _, Result};
use clap::Parser;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use regatta::{
    command::ServiceInstance,
    config::{Cli, Config},
    http::{build_router, AppState},
    raft::{
        app::RaftConsensus, http_rpc::build_raft_rpc_router, network_http::HttpNetworkFactory,
        runtime::start_group, REGISTRY_GROUP, SQL_GROUP,
    },
    registry::{Registry, RegistryApplier, RegistryStore},
    rpc::{RoundRobinBalancer, RpcClient, RpcServer, RpcService, ServiceError, TagRouter},
    sql::{SqlApplier, SqlStore},
};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    run_server(cli.config).await
}

async fn run_server(config: Config) -> Result<()> {
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("create data dir {}", config.data_dir.display()))?;

    let registry_store = Arc::new(RegistryStore::new());
    let registry_applier = Arc::new(RegistryApplier::new(registry_store.clone()));

    let sql_dir = config.data_dir.join("sql");
    std::fs::create_dir_all(&sql_dir)
        .with_context(|| format!("create sql dir {}", sql_dir.display()))?;
    let sql_store = Arc::new(SqlStore::open(&sql_dir.join("store.db")).context("open sql store")?);
    let sql_applier = Arc::new(SqlApplier::new(sql_store.clone()));

    let registry_consensus = start_group(
        &config.data_dir,
        REGISTRY_GROUP,
        config.node_id,
        registry_applier,
        HttpNetworkFactory::new(REGISTRY_GROUP)?,
    )
    .await?;
    let sql_consensus = start_group(
        &config.data_dir,
        SQL_GROUP,
        config.node_id,
        sql_applier,
        HttpNetworkFactory::new(SQL_GROUP)?,
    )
    .await?;

    bootstrap(&config, &registry_consensus).await?;
    bootstrap(&config, &sql_consensus).await?;

    let registry = Registry::new(registry_store, Arc::new(registry_consensus.clone()));

    let rpc_listener = tokio::net::TcpListener::bind(config.rpc_bind)
        .await
        .with_context(|| format!("bind rpc listener {}", config.rpc_bind))?;
    let rpc_server = RpcServer::new()
        .with_service("registry", Arc::new(DirectoryService { registry: registry.clone() }))
        .serve(rpc_listener)
        .context("start rpc server")?;

    let rpc_client = Arc::new(
        RpcClient::new(
            Arc::new(registry.clone()),
            Arc::new(RoundRobinBalancer::default()),
        )
        .with_router(Arc::new(TagRouter::default()))
        .with_timeout(std::time::Duration::from_millis(config.rpc_call_timeout_ms)),
    );

    let app = build_router(AppState {
        registry,
        sql_store,
        sql_consensus: Arc::new(sql_consensus.clone()),
        rpc_client,
    })
    .merge(build_raft_rpc_router(REGISTRY_GROUP, registry_consensus.raft()))
    .merge(build_raft_rpc_router(SQL_GROUP, sql_consensus.raft()))
    .layer(TraceLayer::new_for_http())
    .layer(CorsLayer::permissive());

    info!(
        bind = %config.bind,
        rpc_bind = %rpc_server.addr(),
        node_id = config.node_id,
        data_dir = %config.data_dir.display(),
        "starting regatta"
    );
    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("bind http listener {}", config.bind))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    rpc_server.shutdown().await;
    Ok(())
}

/// First-boot cluster formation for one group. With no peers configured the
/// node bootstraps a single-node cluster; otherwise all listed peers (plus
/// this node) form the initial membership. No-op once initialized.
async fn bootstrap(config: &Config, consensus: &RaftConsensus) -> Result<()> {
    let mut nodes = config.initial_cluster_nodes()?;
    if nodes.is_empty() {
        return consensus
            .initialize_single_node_if_needed(config.node_id, config.node_meta())
            .await;
    }
    nodes.insert(config.node_id, config.node_meta());
    consensus.initialize_cluster_if_needed(nodes).await
}

/// Built-in frame service exposing the directory over the RPC protocol, so
/// providers without HTTP access can still discover peers.
struct DirectoryService {
    registry: Registry,
}

impl RpcService for DirectoryService {
    fn invoke(
        &self,
        method: &str,
        arguments: &[u8],
        _attachments: &BTreeMap<String, String>,
    ) -> Result<Vec<u8>, ServiceError> {
        match method {
            "instances" => {
                let service: String = rmp_serde::from_slice(arguments)
                    .map_err(|e| ServiceError::Failed(format!("decode service name: {e}")))?;
                let instances: Vec<ServiceInstance> = self.registry.get_instances(&service);
                rmp_serde::to_vec(&instances).map_err(|e| ServiceError::Failed(e.to_string()))
            }
            "services" => rmp_serde::to_vec(&self.registry.get_services())
                .map_err(|e| ServiceError::Failed(e.to_string())),
            other => Err(ServiceError::UnknownMethod(other.to_string())),
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).compact().init();
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
