use std::{collections::BTreeMap, net::SocketAddr, sync::Arc, time::Duration};

use tokio::net::TcpListener;

use regatta::{
    command::{ServiceInstance, ServiceStatus},
    rpc::{
        RandomBalancer, RoundRobinBalancer, RpcClient, RpcError, RpcServer, RpcServerHandle,
        RpcService, ServiceError, StaticDiscovery, TagRouter,
    },
};

/// Answers `who` with its own name; everything else fails.
struct NamedService {
    name: String,
}

impl RpcService for NamedService {
    fn invoke(
        &self,
        method: &str,
        _arguments: &[u8],
        _attachments: &BTreeMap<String, String>,
    ) -> Result<Vec<u8>, ServiceError> {
        match method {
            "who" => rmp_serde::to_vec(&self.name).map_err(|e| ServiceError::Failed(e.to_string())),
            "fail" => Err(ServiceError::Failed("deliberate failure".to_string())),
            other => Err(ServiceError::UnknownMethod(other.to_string())),
        }
    }
}

async fn start_provider(service: &str, name: &str) -> (RpcServerHandle, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let handle = RpcServer::new()
        .with_service(
            service,
            Arc::new(NamedService {
                name: name.to_string(),
            }),
        )
        .serve(listener)
        .unwrap();
    let addr = handle.addr();
    (handle, addr)
}

fn instance(service: &str, id: &str, addr: SocketAddr, tag: Option<&str>) -> ServiceInstance {
    let mut metadata = BTreeMap::new();
    if let Some(tag) = tag {
        metadata.insert("tag".to_string(), tag.to_string());
    }
    ServiceInstance {
        service_id: id.to_string(),
        service_name: service.to_string(),
        host: addr.ip().to_string(),
        port: addr.port(),
        status: ServiceStatus::Up,
        metadata,
        last_heartbeat_ms: 1,
    }
}

#[tokio::test]
async fn typed_call_round_trip() {
    let (handle, addr) = start_provider("orders", "alpha").await;
    let client = RpcClient::new(
        Arc::new(StaticDiscovery::new(vec![instance("orders", "a", addr, None)])),
        Arc::new(RandomBalancer),
    );

    let name: String = client.call("orders", "who", &()).await.unwrap();
    assert_eq!(name, "alpha");

    handle.shutdown().await;
}

#[tokio::test]
async fn remote_failure_surfaces_as_remote_error() {
    let (handle, addr) = start_provider("orders", "alpha").await;
    let client = RpcClient::new(
        Arc::new(StaticDiscovery::new(vec![instance("orders", "a", addr, None)])),
        Arc::new(RandomBalancer),
    );

    let err = client.call::<_, String>("orders", "fail", &()).await.unwrap_err();
    match err {
        RpcError::Remote { message } => assert!(message.contains("deliberate failure")),
        other => panic!("expected Remote error, got {other}"),
    }

    handle.shutdown().await;
}

#[tokio::test]
async fn round_robin_spreads_calls_across_providers() {
    let (handle_a, addr_a) = start_provider("orders", "alpha").await;
    let (handle_b, addr_b) = start_provider("orders", "beta").await;

    let client = RpcClient::new(
        Arc::new(StaticDiscovery::new(vec![
            instance("orders", "a", addr_a, None),
            instance("orders", "b", addr_b, None),
        ])),
        Arc::new(RoundRobinBalancer::default()),
    );

    let mut names = Vec::new();
    for _ in 0..4 {
        let name: String = client.call("orders", "who", &()).await.unwrap();
        names.push(name);
    }
    assert_eq!(names, ["alpha", "beta", "alpha", "beta"]);

    handle_a.shutdown().await;
    handle_b.shutdown().await;
}

#[tokio::test]
async fn tag_routing_pins_calls_to_matching_providers() {
    let (handle_eu, addr_eu) = start_provider("orders", "eu-node").await;
    let (handle_us, addr_us) = start_provider("orders", "us-node").await;

    let client = RpcClient::new(
        Arc::new(StaticDiscovery::new(vec![
            instance("orders", "eu", addr_eu, Some("eu")),
            instance("orders", "us", addr_us, Some("us")),
        ])),
        Arc::new(RandomBalancer),
    )
    .with_router(Arc::new(TagRouter::default()));

    for _ in 0..5 {
        let name: String = client
            .call_with_attachments(
                "orders",
                "who",
                &(),
                BTreeMap::from([("tag".to_string(), "eu".to_string())]),
            )
            .await
            .unwrap();
        assert_eq!(name, "eu-node");
    }

    handle_eu.shutdown().await;
    handle_us.shutdown().await;
}

#[tokio::test]
async fn silent_provider_times_out() {
    // Accepts connections and reads forever without ever responding.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
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

    let client = RpcClient::new(
        Arc::new(StaticDiscovery::new(vec![instance("orders", "a", addr, None)])),
        Arc::new(RandomBalancer),
    )
    .with_timeout(Duration::from_millis(200));

    let err = client.call::<_, String>("orders", "who", &()).await.unwrap_err();
    assert!(matches!(err, RpcError::Timeout { .. }));
}

#[tokio::test]
async fn one_connection_carries_concurrent_calls() {
    let (handle, addr) = start_provider("orders", "alpha").await;
    let client = Arc::new(RpcClient::new(
        Arc::new(StaticDiscovery::new(vec![instance("orders", "a", addr, None)])),
        Arc::new(RandomBalancer),
    ));

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let client = client.clone();
        tasks.push(tokio::spawn(async move {
            client.call::<_, String>("orders", "who", &()).await
        }));
    }
    for task in tasks {
        assert_eq!(task.await.unwrap().unwrap(), "alpha");
    }

    handle.shutdown().await;
}
