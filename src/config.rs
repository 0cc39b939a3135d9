use std::{net::SocketAddr, path::PathBuf};

use clap::{Args, Parser};

use crate::raft::{NodeId, NodeMeta};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "regatta",
    about = "Replicated service registry and SQL control plane",
    version,
    disable_help_subcommand = true
)]
pub struct Cli {
    #[command(flatten)]
    pub config: Config,
}

#[derive(Args, Debug, Clone)]
pub struct Config {
    /// HTTP listener: admin API plus raft RPC for both groups.
    #[arg(
        long,
        global = true,
        env = "REGATTA_BIND",
        value_name = "ADDR",
        default_value = "127.0.0.1:7200"
    )]
    pub bind: SocketAddr,

    /// Frame-RPC listener for exported services.
    #[arg(
        long = "rpc-bind",
        global = true,
        env = "REGATTA_RPC_BIND",
        value_name = "ADDR",
        default_value = "127.0.0.1:7201"
    )]
    pub rpc_bind: SocketAddr,

    #[arg(
        long,
        global = true,
        env = "REGATTA_DATA_DIR",
        value_name = "PATH",
        default_value = "./data"
    )]
    pub data_dir: PathBuf,

    #[arg(
        long = "node-id",
        global = true,
        env = "REGATTA_NODE_ID",
        value_name = "ID",
        default_value_t = 1,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub node_id: NodeId,

    #[arg(
        long = "node-name",
        global = true,
        env = "REGATTA_NODE_NAME",
        value_name = "NAME",
        default_value = "node-1"
    )]
    pub node_name: String,

    /// Base URL other nodes use to reach this node's HTTP listener.
    #[arg(
        long = "api-base-url",
        global = true,
        env = "REGATTA_API_BASE_URL",
        value_name = "ORIGIN",
        default_value = "http://127.0.0.1:7200"
    )]
    pub api_base_url: String,

    /// Peers for first-boot cluster initialization, as
    /// `id=base_url` pairs separated by commas
    /// (e.g. `1=http://10.0.0.1:7200,2=http://10.0.0.2:7200`).
    /// Empty means bootstrap as a single-node cluster.
    #[arg(
        long = "initial-cluster",
        global = true,
        env = "REGATTA_INITIAL_CLUSTER",
        value_name = "PEERS",
        default_value = ""
    )]
    pub initial_cluster: String,

    #[arg(
        long = "rpc-call-timeout-ms",
        global = true,
        env = "REGATTA_RPC_CALL_TIMEOUT_MS",
        value_name = "MS",
        default_value_t = 3_000,
        value_parser = clap::value_parser!(u64).range(100..=60_000)
    )]
    pub rpc_call_timeout_ms: u64,
}

impl Config {
    /// Parse `--initial-cluster` into membership metadata. Node names are
    /// derived as `node-<id>`; this node's own entry may be included or not.
    pub fn initial_cluster_nodes(&self) -> anyhow::Result<std::collections::BTreeMap<NodeId, NodeMeta>> {
        let mut nodes = std::collections::BTreeMap::new();
        for pair in self.initial_cluster.split(',') {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }
            let (id, url) = pair
                .split_once('=')
                .ok_or_else(|| anyhow::anyhow!("invalid --initial-cluster entry: {pair}"))?;
            let id: NodeId = id
                .trim()
                .parse()
                .map_err(|_| anyhow::anyhow!("invalid node id in --initial-cluster: {id}"))?;
            nodes.insert(
                id,
                NodeMeta {
                    name: format!("node-{id}"),
                    api_base_url: url.trim().to_string(),
                },
            );
        }
        Ok(nodes)
    }

    pub fn node_meta(&self) -> NodeMeta {
        NodeMeta {
            name: self.node_name.clone(),
            api_base_url: self.api_base_url.clone(),
        }
    }
}
