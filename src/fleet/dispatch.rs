//! Server-side placement and the poll protocol
//!
//! The dispatcher picks a node, forwards the request to its agent and, for
//! slow actions, polls the returned handle until the work finishes.
//! [`FleetServer`] answers the node-facing routes.

use super::node::{NodeEndpoint, NodeStatus};
use super::registry::{NodeRegistry, PlacedContainer};
use super::transport::NodeTransport;
use crate::config::ServerConfig;
use crate::container::{Container, LaunchRequest, NetworkProbe, ProbeReport};
use crate::error::{FleetError, Result};
use crate::network::{Network, NetworkSpec};
use crate::operation::{poll_until_finished, TaskOutcome};
use crate::protocol::{
    decode, encode, routes, Accepted, ClientRequest, ConnectReply, ConnectRequest, ContainerRef,
    Empty, ExecCommand, HeartbeatReply, ImageRef, MonitorRun, NetworkRef, NodeRef, PollReply,
    ProbeSet, RouteHandler, ServiceRef, StatusReport,
};
use crate::runtime::{ExecOutput, ImageInfo};
use crate::service::{Service, ServiceDefinition};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Where a request should run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Placement {
    /// Let the dispatcher decide
    #[default]
    Auto,
    /// A specific node
    Node(String),
}

#[derive(Debug, Clone)]
struct PlacedService {
    node_id: String,
    containers: Vec<String>,
}

/// Routes work to nodes
pub struct Dispatcher {
    registry: Arc<NodeRegistry>,
    transport: Arc<dyn NodeTransport>,
    services: Mutex<HashMap<String, PlacedService>>,
    poll_interval: Duration,
    timeout: Duration,
}

impl Dispatcher {
    pub fn new(registry: Arc<NodeRegistry>, transport: Arc<dyn NodeTransport>) -> Self {
        let defaults = ServerConfig::default();
        Self {
            registry,
            transport,
            services: Mutex::new(HashMap::new()),
            poll_interval: defaults.poll_interval(),
            timeout: defaults.operation_timeout(),
        }
    }

    /// Override the poll cadence and the per-operation timeout
    pub fn with_timings(mut self, poll_interval: Duration, timeout: Duration) -> Self {
        self.poll_interval = poll_interval;
        self.timeout = timeout;
        self
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    fn lock_services(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, PlacedService>>> {
        self.services
            .lock()
            .map_err(|_| FleetError::Lock("Failed to acquire service placement lock".to_string()))
    }

    /// Explicit node, else the lowest-demand node
    pub fn resolve(&self, placement: &Placement) -> Result<NodeEndpoint> {
        match placement {
            Placement::Node(id) => self.registry.endpoint(id),
            Placement::Auto => self.registry.select_lowest_demand(),
        }
    }

    /// Explicit node, else the node the container was placed on, else the lowest-demand node
    fn resolve_container(&self, container_id: &str, placement: &Placement) -> Result<NodeEndpoint> {
        if let Placement::Node(id) = placement {
            return self.registry.endpoint(id);
        }
        match self.registry.locate_container(container_id) {
            Ok(node_id) => self.registry.endpoint(&node_id),
            Err(_) => self.registry.select_lowest_demand(),
        }
    }

    fn resolve_service(&self, service_id: &str, placement: &Placement) -> Result<NodeEndpoint> {
        if let Placement::Node(id) = placement {
            return self.registry.endpoint(id);
        }
        let node_id = self
            .lock_services()?
            .get(service_id)
            .map(|s| s.node_id.clone())
            .ok_or_else(|| FleetError::ServiceNotFound(service_id.to_string()))?;
        self.registry.endpoint(&node_id)
    }

    async fn call<B, R>(&self, node: &NodeEndpoint, route: &str, body: B) -> Result<R>
    where
        B: Serialize,
        R: DeserializeOwned,
    {
        let request = encode(&ClientRequest::new(&node.id, body))?;
        let reply = self.transport.call(node, route, request).await?;
        decode(reply)
    }

    /// Poll an accepted operation to completion and decode its result
    async fn await_operation<R, M>(
        &self,
        node: &NodeEndpoint,
        check_route: &str,
        accepted: &Accepted,
        on_message: M,
    ) -> Result<R>
    where
        R: DeserializeOwned,
        M: FnMut(&str),
    {
        let check = &accepted.check();
        let payload = poll_until_finished(
            self.poll_interval,
            self.timeout,
            || async move {
                let reply: PollReply = self.call(node, check_route, check).await?;
                Ok(reply.into_progress())
            },
            on_message,
        )
        .await?;
        TaskOutcome::<R>::decode(payload)
    }

    /// Launch a container and remember where it runs
    pub async fn launch_container<M: FnMut(&str)>(
        &self,
        request: &LaunchRequest,
        placement: &Placement,
        on_message: M,
    ) -> Result<PlacedContainer> {
        let node = self.resolve(placement)?;
        tracing::info!("Launching {} on node {}", request.image, node.id);
        let accepted: Accepted = self.call(&node, routes::CONTAINER_LAUNCH, request).await?;
        let container: Container = self
            .await_operation(&node, routes::CONTAINER_LAUNCH_CHECK, &accepted, on_message)
            .await?;
        self.registry.record_container(&node.id, container.clone())?;
        Ok(PlacedContainer {
            node_id: node.id,
            container,
        })
    }

    pub async fn stop_container(&self, container_id: &str, placement: &Placement) -> Result<()> {
        let node = self.resolve_container(container_id, placement)?;
        let body = ContainerRef {
            container_id: container_id.to_string(),
        };
        let () = self.call(&node, routes::CONTAINER_STOP, body).await?;
        self.registry.forget_container(container_id)?;
        tracing::info!("Stopped container {} on node {}", container_id, node.id);
        Ok(())
    }

    pub async fn inspect_container(&self, container_id: &str, placement: &Placement) -> Result<Container> {
        let node = self.resolve_container(container_id, placement)?;
        let body = ContainerRef {
            container_id: container_id.to_string(),
        };
        self.call(&node, routes::CONTAINER_INSPECT, body).await
    }

    pub async fn exec(&self, container_id: &str, command: &str, placement: &Placement) -> Result<ExecOutput> {
        let node = self.resolve_container(container_id, placement)?;
        let body = ExecCommand {
            container_id: container_id.to_string(),
            command: command.to_string(),
        };
        self.call(&node, routes::CONTAINER_EXEC, body).await
    }

    pub async fn list_containers(&self, node_id: &str) -> Result<Vec<Container>> {
        let node = self.registry.endpoint(node_id)?;
        self.call(&node, routes::CONTAINER_LIST, Empty {}).await
    }

    /// Seed the placement table with what a node already runs
    pub async fn sync_node(&self, node_id: &str) -> Result<usize> {
        let containers = self.list_containers(node_id).await?;
        let count = containers.len();
        for container in containers {
            self.registry.record_container(node_id, container)?;
        }
        tracing::info!("Node {} runs {} managed container(s)", node_id, count);
        Ok(count)
    }

    /// Pull an image; progress lines go to `on_message`
    pub async fn pull_image<M: FnMut(&str)>(
        &self,
        image: &str,
        placement: &Placement,
        on_message: M,
    ) -> Result<ImageInfo> {
        let node = self.resolve(placement)?;
        let body = ImageRef {
            image: image.to_string(),
        };
        let accepted: Accepted = self.call(&node, routes::IMAGE_PULL, body).await?;
        self.await_operation(&node, routes::IMAGE_PULL_CHECK, &accepted, on_message)
            .await
    }

    pub async fn list_images(&self, node_id: &str) -> Result<Vec<ImageInfo>> {
        let node = self.registry.endpoint(node_id)?;
        self.call(&node, routes::IMAGE_LIST, Empty {}).await
    }

    pub async fn delete_image(&self, node_id: &str, image: &str) -> Result<Vec<String>> {
        let node = self.registry.endpoint(node_id)?;
        let body = ImageRef {
            image: image.to_string(),
        };
        self.call(&node, routes::IMAGE_DELETE, body).await
    }

    pub async fn create_network(&self, node_id: &str, spec: &NetworkSpec) -> Result<Network> {
        let node = self.registry.endpoint(node_id)?;
        self.call(&node, routes::NETWORK_CREATE, spec).await
    }

    pub async fn remove_network(&self, node_id: &str, network: &str) -> Result<()> {
        let node = self.registry.endpoint(node_id)?;
        let body = NetworkRef {
            network: network.to_string(),
        };
        self.call(&node, routes::NETWORK_REMOVE, body).await
    }

    pub async fn list_networks(&self, node_id: &str) -> Result<Vec<Network>> {
        let node = self.registry.endpoint(node_id)?;
        self.call(&node, routes::NETWORK_LIST, Empty {}).await
    }

    /// Stand up a service on one node
    pub async fn launch_service<M: FnMut(&str)>(
        &self,
        definition: &ServiceDefinition,
        placement: &Placement,
        on_message: M,
    ) -> Result<(String, Service)> {
        definition.config.validate()?;
        let node = self.resolve(placement)?;
        tracing::info!("Launching service {} on node {}", definition.name, node.id);
        let accepted: Accepted = self.call(&node, routes::SERVICE_LAUNCH, definition).await?;
        let service: Service = self
            .await_operation(&node, routes::SERVICE_LAUNCH_CHECK, &accepted, on_message)
            .await?;

        for container in &service.containers {
            self.registry.record_container(&node.id, container.clone())?;
        }
        self.lock_services()?.insert(
            service.id.clone(),
            PlacedService {
                node_id: node.id.clone(),
                containers: service.containers.iter().map(|c| c.id.clone()).collect(),
            },
        );
        Ok((node.id, service))
    }

    /// Tear a service down on the node that runs it
    pub async fn stop_service(&self, service_id: &str, placement: &Placement) -> Result<()> {
        let node = self.resolve_service(service_id, placement)?;
        let body = ServiceRef {
            service_id: service_id.to_string(),
        };
        let accepted: Accepted = self.call(&node, routes::SERVICE_STOP, body).await?;
        let result: Result<String> = self
            .await_operation(&node, routes::SERVICE_STOP_CHECK, &accepted, |_| {})
            .await;

        // the node drops the service record even when teardown partly failed
        if let Some(placed) = self.lock_services()?.remove(service_id) {
            for container_id in &placed.containers {
                self.registry.forget_container(container_id)?;
            }
        }
        result.map(|_| ())
    }

    pub async fn list_services(&self, node_id: &str) -> Result<Vec<Service>> {
        let node = self.registry.endpoint(node_id)?;
        self.call(&node, routes::SERVICE_LIST, Empty {}).await
    }

    /// Build and attach a monitoring container to a network
    pub async fn run_network_monitor<M: FnMut(&str)>(
        &self,
        node_id: &str,
        network_name: &str,
        context_dir: &Path,
        on_message: M,
    ) -> Result<Container> {
        let node = self.registry.endpoint(node_id)?;
        let body = MonitorRun {
            network_name: network_name.to_string(),
            context_dir: context_dir.to_path_buf(),
        };
        let accepted: Accepted = self.call(&node, routes::MONITOR_RUN, body).await?;
        self.await_operation(&node, routes::MONITOR_RUN_CHECK, &accepted, on_message)
            .await
    }

    pub async fn stop_network_monitor(&self, node_id: &str, container_id: &str) -> Result<()> {
        let node = self.registry.endpoint(node_id)?;
        let body = ContainerRef {
            container_id: container_id.to_string(),
        };
        self.call(&node, routes::MONITOR_STOP, body).await
    }

    pub async fn run_probes(&self, node_id: &str, probes: Vec<NetworkProbe>) -> Result<ProbeReport> {
        let node = self.registry.endpoint(node_id)?;
        self.call(&node, routes::MONITOR_SCRIPT, ProbeSet { probes }).await
    }
}

/// Answers `/connect`, `/disconnect`, `/heartbeat` and `/status`
pub struct FleetServer {
    dispatcher: Arc<Dispatcher>,
}

impl FleetServer {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }

    fn connect(&self, request: ConnectRequest) -> Result<ConnectReply> {
        let registry = self.dispatcher.registry();
        let token = match registry.connect(&request.client_id, &request.client_ip, request.client_port) {
            Ok(token) => token,
            Err(FleetError::NodeExists(_)) => return Ok(ConnectReply::default()),
            Err(e) => return Err(e),
        };

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let dispatcher = self.dispatcher.clone();
            let id = request.client_id.clone();
            handle.spawn(async move {
                if let Err(e) = dispatcher.sync_node(&id).await {
                    tracing::warn!("Failed to fetch containers of node {}: {}", id, e);
                }
            });
        }

        Ok(ConnectReply {
            client_id: request.client_id,
            client_token: token,
        })
    }

    fn heartbeat(&self, request: NodeRef) -> Result<HeartbeatReply> {
        let now = self.dispatcher.registry().heartbeat(&request.client_id)?;
        Ok(HeartbeatReply {
            client_id: request.client_id,
            timestamp: now.timestamp(),
        })
    }

    fn status(&self, report: StatusReport) -> Result<()> {
        let status: NodeStatus = report.status;
        self.dispatcher.registry().push_status(&report.client_id, status)
    }
}

impl RouteHandler for FleetServer {
    fn handle(&self, route: &str, body: Value) -> Result<Value> {
        match route {
            routes::CONNECT => encode(&self.connect(decode(body)?)?),
            routes::DISCONNECT => {
                let request: NodeRef = decode(body)?;
                self.dispatcher.registry().disconnect(&request.client_id)?;
                Ok(Value::Null)
            }
            routes::HEARTBEAT => encode(&self.heartbeat(decode(body)?)?),
            routes::STATUS => {
                self.status(decode(body)?)?;
                Ok(Value::Null)
            }
            other => Err(FleetError::Transport(format!("unknown route {}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::transport::LocalTransport;
    use crate::operation::OperationRegistry;
    use serde_json::json;

    /// Agent stand-in that launches containers through the operation registry
    struct FakeAgent {
        operations: Arc<OperationRegistry>,
        fail: bool,
    }

    impl RouteHandler for FakeAgent {
        fn handle(&self, route: &str, body: Value) -> Result<Value> {
            match route {
                routes::CONTAINER_LAUNCH => {
                    let request: ClientRequest<LaunchRequest> = decode(body)?;
                    let fail = self.fail;
                    let id = self.operations.run(move |sink| {
                        sink.push("pulling;");
                        if fail {
                            return Err(FleetError::Container("create failed".to_string()));
                        }
                        Ok(json!({
                            "id": format!("c-{}", request.body.image),
                            "name": "x",
                            "image": request.body.image,
                            "owner_uid": "",
                            "labels": {},
                            "networks": {},
                            "ports": [],
                            "host_port": "",
                            "created": "2024-01-01T00:00:00Z"
                        }))
                    })?;
                    encode(&Accepted::single(id))
                }
                routes::CONTAINER_LAUNCH_CHECK => {
                    let check: ClientRequest<crate::protocol::CheckRequest> = decode(body)?;
                    encode(&PollReply::from(self.operations.poll(&check.body.response_id)?))
                }
                routes::CONTAINER_STOP => Ok(Value::Null),
                routes::CONTAINER_LIST => Ok(json!([])),
                other => Err(FleetError::Transport(format!("unknown route {}", other))),
            }
        }
    }

    fn setup(fail: bool) -> (Arc<NodeRegistry>, Dispatcher) {
        let registry = Arc::new(NodeRegistry::default());
        let transport = Arc::new(LocalTransport::new());
        for id in ["busy", "idle"] {
            registry.connect(id, "127.0.0.1", 0).unwrap();
            transport
                .register(
                    id,
                    Arc::new(FakeAgent {
                        operations: Arc::new(OperationRegistry::default()),
                        fail,
                    }),
                )
                .unwrap();
        }
        registry
            .push_status("busy", NodeStatus { cpu_usage: 0.9, ..NodeStatus::default() })
            .unwrap();
        registry
            .push_status("idle", NodeStatus { cpu_usage: 0.1, ..NodeStatus::default() })
            .unwrap();
        let dispatcher = Dispatcher::new(registry.clone(), transport)
            .with_timings(Duration::from_millis(5), Duration::from_secs(5));
        (registry, dispatcher)
    }

    #[tokio::test]
    async fn test_launch_goes_to_idle_node_and_is_recorded() {
        let (registry, dispatcher) = setup(false);
        let mut messages = Vec::new();
        let placed = dispatcher
            .launch_container(&LaunchRequest::new("web"), &Placement::Auto, |m| {
                messages.push(m.to_string())
            })
            .await
            .unwrap();

        assert_eq!(placed.node_id, "idle");
        assert_eq!(placed.container.id, "c-web");
        assert_eq!(registry.locate_container("c-web").unwrap(), "idle");

        dispatcher.stop_container("c-web", &Placement::Auto).await.unwrap();
        assert!(registry.locate_container("c-web").is_err());
    }

    #[tokio::test]
    async fn test_explicit_placement_and_remote_failure() {
        let (_, dispatcher) = setup(true);
        let err = dispatcher
            .launch_container(&LaunchRequest::new("web"), &Placement::Node("busy".to_string()), |_| {})
            .await
            .unwrap_err();
        match err {
            FleetError::OperationFailed(msg) => assert!(msg.contains("create failed")),
            other => panic!("unexpected error {:?}", other),
        }

        let missing = dispatcher
            .launch_container(&LaunchRequest::new("web"), &Placement::Node("gone".to_string()), |_| {})
            .await;
        assert!(matches!(missing, Err(FleetError::NodeNotFound(_))));
    }

    #[tokio::test]
    async fn test_fleet_server_routes() {
        let registry = Arc::new(NodeRegistry::default());
        let dispatcher = Arc::new(Dispatcher::new(registry.clone(), Arc::new(LocalTransport::new())));
        let server = FleetServer::new(dispatcher);

        let connect = json!({"client_id": "n1", "client_ip": "10.0.0.1", "client_port": 7879});
        let reply: ConnectReply = decode(server.handle(routes::CONNECT, connect.clone()).unwrap()).unwrap();
        assert_eq!(reply.client_id, "n1");
        assert!(!reply.is_empty());

        let again: ConnectReply = decode(server.handle(routes::CONNECT, connect).unwrap()).unwrap();
        assert!(again.is_empty());

        let beat: HeartbeatReply =
            decode(server.handle(routes::HEARTBEAT, json!({"client_id": "n1"})).unwrap()).unwrap();
        assert!(beat.timestamp > 0);

        let status = json!({
            "client_id": "n1", "cpu_usage": 0.2, "memory_usage": 0.4, "disk_usage": 0.1,
            "network_usage": 0.0, "container_count": 2, "container_usage": 0.1
        });
        server.handle(routes::STATUS, status).unwrap();
        assert_eq!(registry.select_lowest_demand().unwrap().id, "n1");

        server.handle(routes::DISCONNECT, json!({"client_id": "n1"})).unwrap();
        assert!(registry.is_empty());
        assert!(server.handle(routes::HEARTBEAT, json!({"client_id": "n1"})).is_err());
    }
}
