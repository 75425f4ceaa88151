//! Control node and worker nodes wired together end to end

use flotilla::agent::NodeStack;
use flotilla::config::FleetConfig;
use flotilla::container::{LaunchRequest, NetworkProbe};
use flotilla::fleet::{Dispatcher, HttpNodeTransport, LocalTransport, NodeRegistry, NodeStatus, Placement};
use flotilla::http::HttpServer;
use flotilla::proxy::LocalProxy;
use flotilla::runtime::{ContainerRuntime, LocalRuntime};
use flotilla::service::{ServiceConfig, ServiceDefinition};
use flotilla::store::MemoryStore;
use flotilla::FleetError;
use std::sync::Arc;
use std::time::Duration;

const SERVICE: &str = r#"
networks:
  - name: front
  - name: back
    random_cidr: true
containers:
  - image: web
    ports:
      - port: 80
    networks: [front, back]
    flags:
      - command: echo $flag > /flag
        score: 100
        uuid: web-flag
  - image: db
    networks: [back]
total_score: 100
network_count: 2
container_count: 2
"#;

fn node(client_id: &str, cidr: &str) -> (Arc<LocalRuntime>, NodeStack) {
    let mut config = FleetConfig::default();
    config.node.client_id = client_id.to_string();
    config.node.cidr = cidr.to_string();
    let runtime = Arc::new(LocalRuntime::new());
    for image in ["web", "db", "alpine"] {
        runtime.publish(image, None).unwrap();
    }
    let stack = NodeStack::assemble(
        &config,
        runtime.clone(),
        Arc::new(LocalProxy::default()),
        Arc::new(MemoryStore::new()),
    )
    .unwrap();
    (runtime, stack)
}

fn status(cpu_usage: f64) -> NodeStatus {
    NodeStatus {
        cpu_usage,
        ..NodeStatus::default()
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_service_lifecycle_across_two_nodes() {
    let (_, busy) = node("busy", "10.90.[0-3].0/24");
    let (idle_runtime, idle) = node("idle", "10.91.[0-3].0/24");

    let registry = Arc::new(NodeRegistry::default());
    let transport = Arc::new(LocalTransport::new());
    for (id, stack) in [("busy", &busy), ("idle", &idle)] {
        registry.connect(id, "127.0.0.1", 0).unwrap();
        transport.register(id, Arc::new(stack.agent())).unwrap();
    }
    registry.push_status("busy", status(0.8)).unwrap();
    registry.push_status("idle", status(0.2)).unwrap();

    let dispatcher = Dispatcher::new(registry.clone(), transport)
        .with_timings(Duration::from_millis(10), Duration::from_secs(30));

    let definition = ServiceDefinition {
        name: "shop".to_string(),
        owner_uid: "42".to_string(),
        module: "ctf".to_string(),
        config: ServiceConfig::from_yaml(SERVICE).unwrap(),
    };
    let mut messages = Vec::new();
    let (node_id, service) = dispatcher
        .launch_service(&definition, &Placement::Auto, |m| messages.push(m.to_string()))
        .await
        .unwrap();

    assert_eq!(node_id, "idle");
    assert_eq!(service.containers.len(), 2);
    assert_eq!(service.flags.len(), 1);
    assert!(service.flags[0].flag.starts_with("flag{"));
    for container in &service.containers {
        assert_eq!(registry.locate_container(&container.id).unwrap(), "idle");
    }
    assert!(busy.services.list_services().unwrap().is_empty());
    assert_eq!(dispatcher.list_services("idle").await.unwrap().len(), 1);

    // monitor the service's named network
    let front = service
        .networks
        .iter()
        .find(|n| n.name == "front")
        .unwrap()
        .network
        .name
        .clone();
    let context = tempfile::tempdir().unwrap();
    std::fs::write(context.path().join("Dockerfile"), "FROM alpine\nRUN apk add curl\n").unwrap();
    let monitor = dispatcher
        .run_network_monitor("idle", &front, context.path(), |_| {})
        .await
        .unwrap();
    assert!(idle_runtime.inspect_container(&monitor.id).unwrap().running);

    let web = service.containers.iter().find(|c| c.image == "web").unwrap();
    let report = dispatcher
        .run_probes(
            "idle",
            vec![NetworkProbe {
                container_id: web.id.clone(),
                monitor_id: monitor.id.clone(),
                script: "curl -s http://$ip/".to_string(),
            }],
        )
        .await
        .unwrap();
    assert!(report.errors.is_empty(), "{:?}", report.errors);
    assert_eq!(report.results[0].container_id, web.id);
    dispatcher.stop_network_monitor("idle", &monitor.id).await.unwrap();

    dispatcher
        .stop_service(&service.id, &Placement::Auto)
        .await
        .unwrap();
    assert!(dispatcher.list_services("idle").await.unwrap().is_empty());
    for container in &service.containers {
        assert!(matches!(
            registry.locate_container(&container.id),
            Err(FleetError::ContainerNotFound(_))
        ));
    }
    assert_eq!(idle.containers.pool().available(), idle.containers.pool().capacity());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_container_launch_over_http() {
    let (_, stack) = node("remote", "10.92.[0-1].0/24");
    let server = HttpServer::bind("127.0.0.1:0", Arc::new(stack.agent()))
        .await
        .unwrap();
    let port = server.local_addr().unwrap().port();
    server.spawn();

    let registry = Arc::new(NodeRegistry::default());
    registry.connect("remote", "127.0.0.1", port).unwrap();
    registry.push_status("remote", status(0.1)).unwrap();
    let transport = Arc::new(HttpNodeTransport::new(Duration::from_secs(5)).unwrap());
    let dispatcher = Dispatcher::new(registry.clone(), transport)
        .with_timings(Duration::from_millis(10), Duration::from_secs(30));

    let placed = dispatcher
        .launch_container(&LaunchRequest::new("web"), &Placement::Auto, |_| {})
        .await
        .unwrap();
    assert_eq!(placed.node_id, "remote");

    let listed = dispatcher.list_containers("remote").await.unwrap();
    assert!(listed.iter().any(|c| c.id == placed.container.id));

    dispatcher
        .stop_container(&placed.container.id, &Placement::Auto)
        .await
        .unwrap();
    assert!(registry.containers_on("remote").unwrap().is_empty());

    let missing = dispatcher
        .launch_container(
            &LaunchRequest::new("web"),
            &Placement::Node("ghost".to_string()),
            |_| {},
        )
        .await;
    assert!(matches!(missing, Err(FleetError::NodeNotFound(_))));
}
