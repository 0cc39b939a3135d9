//! Service-to-service RPC: length-prefixed MessagePack frames over TCP, a
//! client pipeline of discovery, routing, and load balancing, and a frame
//! server for exported services.

pub mod balance;
pub mod client;
pub mod envelope;
pub mod route;
pub mod server;

pub use balance::{LoadBalancer, RandomBalancer, RoundRobinBalancer};
pub use client::{Discovery, RpcClient, RpcError, StaticDiscovery};
pub use envelope::{RpcRequest, RpcResponse};
pub use route::{Router, TagRouter};
pub use server::{RpcServer, RpcServerHandle, RpcService, ServiceError};
