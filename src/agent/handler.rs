//! Node-side request surface
//!
//! Every request must carry this node's client ID. Slow actions are handed to
//! the operation registry and answered with handles at once; everything else
//! runs inline.

use crate::container::{ContainerOrchestrator, LaunchRequest, NetworkMonitorManager};
use crate::error::{FleetError, Result};
use crate::network::NetworkSpec;
use crate::operation::OperationRegistry;
use crate::protocol::{
    decode, encode, routes, Accepted, CheckRequest, ClientRequest, ContainerRef, ExecCommand,
    ImageRef, MonitorRun, NetworkRef, PollReply, ProbeSet, RouteHandler, ServiceRef,
};
use crate::service::{ServiceDefinition, ServiceOrchestrator};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;

/// Answers the server's requests on a worker node
pub struct NodeAgent {
    client_id: String,
    max_containers: usize,
    containers: Arc<ContainerOrchestrator>,
    services: Arc<ServiceOrchestrator>,
    monitors: Arc<NetworkMonitorManager>,
    operations: Arc<OperationRegistry>,
}

impl NodeAgent {
    pub fn new(
        client_id: &str,
        max_containers: usize,
        containers: Arc<ContainerOrchestrator>,
        services: Arc<ServiceOrchestrator>,
        monitors: Arc<NetworkMonitorManager>,
        operations: Arc<OperationRegistry>,
    ) -> Self {
        Self {
            client_id: client_id.to_string(),
            max_containers: max_containers.max(1),
            containers,
            services,
            monitors,
            operations,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    fn authorize(&self, body: &Value) -> Result<()> {
        match body.get("client_id").and_then(Value::as_str) {
            Some(id) if id == self.client_id => Ok(()),
            Some(id) => {
                tracing::warn!("Rejected request from unknown client {}", id);
                Err(FleetError::PermissionDenied(format!("client id {} is not accepted", id)))
            }
            None => Err(FleetError::PermissionDenied("client id missing".to_string())),
        }
    }

    /// Poll a handle; with a finish handle, completion is read from it
    fn check(&self, request: CheckRequest) -> Result<PollReply> {
        if let Some(finish_id) = &request.finish_response_id {
            let finished = self.operations.poll(finish_id)?;
            if finished.is_finished() {
                return Ok(PollReply::from(finished));
            }
        }
        let progress = self.operations.poll(&request.response_id)?;
        Ok(PollReply::from(progress))
    }

    fn launch_container(&self, request: LaunchRequest) -> Result<Accepted> {
        let containers = self.containers.clone();
        let max = self.max_containers;
        let id = self.operations.run(move |sink| {
            let running = containers.container_count()?;
            if running >= max {
                return Err(FleetError::Container(format!(
                    "node is full: {} of {} containers running",
                    running, max
                )));
            }
            containers.launch(&request, &mut |line| sink.push(line))
        })?;
        Ok(Accepted::single(id))
    }

    fn pull_image(&self, request: ImageRef) -> Result<Accepted> {
        let images = self.containers.images().clone();
        let handles = self.operations.run_pair(move |sink| {
            images.pull_image(&request.image, &mut |line| sink.push(line))
        })?;
        Ok(Accepted::pair(handles))
    }

    fn launch_service(&self, definition: ServiceDefinition) -> Result<Accepted> {
        definition.config.validate()?;
        let services = self.services.clone();
        let id = self.operations.run(move |sink| {
            services.create_service(&definition, &mut |line| sink.push(line))
        })?;
        Ok(Accepted::single(id))
    }

    fn stop_service(&self, request: ServiceRef) -> Result<Accepted> {
        let services = self.services.clone();
        let id = self.operations.run(move |_| {
            services.delete_service(&request.service_id)?;
            Ok(request.service_id)
        })?;
        Ok(Accepted::single(id))
    }

    fn run_monitor(&self, request: MonitorRun) -> Result<Accepted> {
        let monitors = self.monitors.clone();
        let handles = self.operations.run_pair(move |sink| {
            monitors.run(&request.network_name, &request.context_dir, &mut |line| sink.push(line))
        })?;
        Ok(Accepted::pair(handles))
    }
}

/// Strip the client ID and decode the rest of a request
fn body_of<T: DeserializeOwned>(body: Value) -> Result<T> {
    let request: ClientRequest<T> = decode(body)?;
    Ok(request.body)
}

fn done() -> Result<Value> {
    Ok(Value::Null)
}

impl RouteHandler for NodeAgent {
    fn handle(&self, route: &str, body: Value) -> Result<Value> {
        self.authorize(&body)?;
        tracing::debug!("Handling {}", route);

        match route {
            routes::CONTAINER_LAUNCH => encode(&self.launch_container(body_of(body)?)?),
            routes::CONTAINER_LAUNCH_CHECK
            | routes::IMAGE_PULL_CHECK
            | routes::SERVICE_LAUNCH_CHECK
            | routes::SERVICE_STOP_CHECK
            | routes::MONITOR_RUN_CHECK => encode(&self.check(body_of(body)?)?),
            routes::CONTAINER_STOP => {
                let request: ContainerRef = body_of(body)?;
                self.containers.stop(&request.container_id)?;
                done()
            }
            routes::CONTAINER_REMOVE => {
                let request: ContainerRef = body_of(body)?;
                self.containers.remove(&request.container_id)?;
                done()
            }
            routes::CONTAINER_LIST => encode(&self.containers.list()?),
            routes::CONTAINER_INSPECT => {
                let request: ContainerRef = body_of(body)?;
                encode(&self.containers.inspect(&request.container_id)?)
            }
            routes::CONTAINER_EXEC => {
                let request: ExecCommand = body_of(body)?;
                encode(&self.containers.exec(&request.container_id, &request.command)?)
            }

            routes::NETWORK_CREATE => {
                let spec: NetworkSpec = body_of(body)?;
                encode(&self.containers.create_network(&spec)?)
            }
            routes::NETWORK_LIST => encode(&self.containers.list_networks()?),
            routes::NETWORK_REMOVE => {
                let request: NetworkRef = body_of(body)?;
                self.containers.delete_network(&request.network)?;
                done()
            }

            routes::IMAGE_LIST => encode(&self.containers.images().list_images()?),
            routes::IMAGE_PULL => encode(&self.pull_image(body_of(body)?)?),
            routes::IMAGE_DELETE => {
                let request: ImageRef = body_of(body)?;
                encode(&self.containers.images().delete_image(&request.image)?)
            }

            routes::SERVICE_LAUNCH => encode(&self.launch_service(body_of(body)?)?),
            routes::SERVICE_STOP => encode(&self.stop_service(body_of(body)?)?),
            routes::SERVICE_LIST => encode(&self.services.list_services()?),

            routes::MONITOR_RUN => encode(&self.run_monitor(body_of(body)?)?),
            routes::MONITOR_STOP => {
                let request: ContainerRef = body_of(body)?;
                self.monitors.stop(&request.container_id)?;
                done()
            }
            routes::MONITOR_SCRIPT => {
                let request: ProbeSet = body_of(body)?;
                encode(&self.monitors.probe(&request.probes))
            }

            other => Err(FleetError::Transport(format!("unknown route {}", other))),
        }
    }
}
