//! Client-side container and network orchestration
//!
//! Launches are all-or-nothing: a failure after the container exists
//! releases every port mapping obtained so far and removes the container.
//! Stops are driven by the runtime; persisted metadata only tells us which
//! mappings to release, and a missing or unreadable record is logged and
//! skipped.

use super::config::{
    host_port_summary, Container, LaunchRequest, LABEL_HOST_PORT, LABEL_MANAGED, LABEL_MODULE,
    LABEL_OWNER, LABEL_PORT_MAP, LABEL_UUID,
};
use super::monitor::StatsTable;
use crate::error::{FleetError, Result};
use crate::events::{EventBus, GuardChain};
use crate::image::ImageLifecycleManager;
use crate::network::pool::{network_name_for, subnet_for_network_name};
use crate::network::{AddressPool, Network, NetworkDriver, NetworkSpec};
use crate::proxy::{PortMapping, PortProxy};
use crate::runtime::{ContainerInfo, ContainerRuntime, ContainerSpec, ExecOutput};
use crate::store::{ContainerRecord, MetadataStore};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Something that happened to a container or network on this node
#[derive(Debug, Clone)]
pub enum RuntimeEvent {
    ContainerLaunched(Container),
    ContainerStopped { id: String },
    NetworkCreated(Network),
    NetworkRemoved { id: String, name: String },
    /// Emitted by `recover` with the networks present at startup
    DaemonStarted { networks: Vec<Network> },
}

/// Timings and defaults for the orchestrator
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// DNS servers for launched containers
    pub dns: Vec<String>,
    /// Inspections while waiting for a new network to show its subnet
    pub network_ready_attempts: u32,
    pub network_ready_delay: Duration,
    /// Inspections while waiting for a network to lose its containers
    pub network_drain_attempts: u32,
    pub network_drain_delay: Duration,
    /// Subnets tried before a pool network creation gives up
    pub pool_network_attempts: u32,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            dns: Vec::new(),
            network_ready_attempts: 10,
            network_ready_delay: Duration::from_millis(50),
            network_drain_attempts: 30,
            network_drain_delay: Duration::from_secs(1),
            pool_network_attempts: 3,
        }
    }
}

fn persisted_mappings(record: &ContainerRecord) -> Result<Vec<PortMapping>> {
    let labels: HashMap<String, String> = serde_json::from_str(&record.labels)?;
    match labels.get(LABEL_PORT_MAP) {
        Some(encoded) => Ok(serde_json::from_str(encoded)?),
        None => Ok(Vec::new()),
    }
}

/// Wraps the container runtime for launches, stops and networks
pub struct ContainerOrchestrator {
    runtime: Arc<dyn ContainerRuntime>,
    proxy: Arc<dyn PortProxy>,
    store: Arc<dyn MetadataStore>,
    images: Arc<ImageLifecycleManager>,
    pool: Arc<AddressPool>,
    stats: Arc<StatsTable>,
    events: EventBus<RuntimeEvent>,
    network_guards: GuardChain<Network>,
    settings: OrchestratorSettings,
}

impl ContainerOrchestrator {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        proxy: Arc<dyn PortProxy>,
        store: Arc<dyn MetadataStore>,
        images: Arc<ImageLifecycleManager>,
        pool: Arc<AddressPool>,
    ) -> Self {
        Self {
            runtime,
            proxy,
            store,
            images,
            pool,
            stats: Arc::new(StatsTable::new()),
            events: EventBus::new(),
            network_guards: GuardChain::new(),
            settings: OrchestratorSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: OrchestratorSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Container and network events
    pub fn events(&self) -> &EventBus<RuntimeEvent> {
        &self.events
    }

    /// Checks run before a network is removed; an error aborts the removal
    pub fn network_guards(&self) -> &GuardChain<Network> {
        &self.network_guards
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    pub fn images(&self) -> &Arc<ImageLifecycleManager> {
        &self.images
    }

    pub fn pool(&self) -> &Arc<AddressPool> {
        &self.pool
    }

    /// Launch a container and expose its ports
    pub fn launch(&self, request: &LaunchRequest, on_progress: &mut dyn FnMut(&str)) -> Result<Container> {
        let image = self.images.require_image(&request.image, on_progress)?;
        let networks = request
            .networks
            .iter()
            .map(|name| self.runtime.inspect_network(name))
            .collect::<Result<Vec<_>>>()?;
        let primary = networks
            .first()
            .map(|n| n.name.clone())
            .unwrap_or_else(|| "bridge".to_string());

        let name = Uuid::new_v4().to_string();
        let mut labels = HashMap::new();
        labels.insert(LABEL_OWNER.to_string(), request.owner_uid.clone());
        labels.insert(LABEL_MODULE.to_string(), request.module.clone());
        labels.insert(LABEL_UUID.to_string(), name.clone());
        labels.insert(LABEL_MANAGED.to_string(), "true".to_string());

        let spec = ContainerSpec {
            name: name.clone(),
            image: request.image.clone(),
            env: request.env.clone(),
            labels: labels.clone(),
            network_mode: primary,
            limits: request.resources.limits(),
            dns: self.settings.dns.clone(),
        };

        tracing::info!("Launching container {} from {} ({})", name, request.image, image.id);
        on_progress(&format!("Creating container {}\n", name));
        let id = self.runtime.create_container(&spec)?;

        let mut mappings = Vec::new();
        match self.assemble(&id, &name, request, &networks, labels, &mut mappings) {
            Ok(container) => {
                if let Err(e) = self.stats.attach(&self.runtime, &id) {
                    tracing::warn!("Failed to attach monitor to {}: {}", id, e);
                }
                on_progress(&format!("Container {} running\n", name));
                self.events.emit(&RuntimeEvent::ContainerLaunched(container.clone()));
                Ok(container)
            }
            Err(e) => {
                tracing::warn!("Launch of {} failed, rolling back: {}", name, e);
                self.discard(&id, &mappings);
                Err(e)
            }
        }
    }

    /// Steps after creation; obtained mappings are pushed as they are made
    fn assemble(
        &self,
        id: &str,
        name: &str,
        request: &LaunchRequest,
        networks: &[Network],
        mut labels: HashMap<String, String>,
        mappings: &mut Vec<PortMapping>,
    ) -> Result<Container> {
        self.runtime.start_container(id)?;
        for network in networks.iter().skip(1) {
            self.runtime.connect_network(&network.id, id)?;
        }

        let info = self.runtime.inspect_container(id)?;
        let ip = networks
            .iter()
            .find_map(|n| info.networks.get(&n.name).filter(|ip| !ip.is_empty()))
            .or_else(|| info.networks.values().find(|ip| !ip.is_empty()))
            .cloned()
            .unwrap_or_default();
        if !request.ports.is_empty() && ip.is_empty() {
            return Err(FleetError::Container(format!(
                "container {} has no address to expose ports on",
                id
            )));
        }

        for port in &request.ports {
            mappings.push(self.proxy.start(&ip, port.port, port.protocol)?);
        }

        let host_port = host_port_summary(mappings);
        labels.insert(LABEL_PORT_MAP.to_string(), serde_json::to_string(&mappings)?);
        labels.insert(LABEL_HOST_PORT.to_string(), host_port.clone());
        self.store.put_container(ContainerRecord {
            name: name.to_string(),
            runtime_id: id.to_string(),
            labels: serde_json::to_string(&labels)?,
            image: request.image.clone(),
            owner_uid: request.owner_uid.clone(),
        })?;

        Ok(Container {
            id: id.to_string(),
            name: name.to_string(),
            image: request.image.clone(),
            owner_uid: request.owner_uid.clone(),
            labels: info.labels,
            networks: info.networks,
            ports: mappings.clone(),
            host_port,
            created: info.created,
            usage: None,
        })
    }

    /// Best-effort removal of a half-built container
    fn discard(&self, id: &str, mappings: &[PortMapping]) {
        for mapping in mappings {
            if let Err(e) = self.proxy.stop(mapping) {
                tracing::warn!("Failed to release mapping {}: {}", mapping, e);
            }
        }
        if let Err(e) = self.runtime.stop_container(id) {
            tracing::warn!("Failed to stop container {}: {}", id, e);
        }
        if let Err(e) = self.runtime.remove_container(id, true) {
            tracing::warn!("Failed to remove container {}: {}", id, e);
        }
    }

    /// Release mappings, then stop and remove the container
    pub fn stop(&self, id: &str) -> Result<()> {
        let info = self.runtime.inspect_container(id)?;
        let mappings = match self.store.get_container(&info.id) {
            Ok(Some(record)) => persisted_mappings(&record).unwrap_or_else(|e| {
                tracing::warn!("Stored labels of {} are unreadable: {}", info.id, e);
                Vec::new()
            }),
            Ok(None) => {
                tracing::warn!("No stored metadata for container {}", info.id);
                Vec::new()
            }
            Err(e) => {
                tracing::warn!("Failed to read metadata of {}: {}", info.id, e);
                Vec::new()
            }
        };

        for mapping in &mappings {
            if let Err(e) = self.proxy.stop(mapping) {
                tracing::warn!("Failed to release mapping {}: {}", mapping, e);
            }
        }

        self.runtime.stop_container(&info.id)?;
        self.runtime.remove_container(&info.id, true)?;

        if let Err(e) = self.store.delete_container(&info.id) {
            tracing::warn!("Failed to delete metadata of {}: {}", info.id, e);
        }
        self.stats.forget(&info.id);
        tracing::info!("Stopped container {}", info.id);
        self.events.emit(&RuntimeEvent::ContainerStopped { id: info.id });
        Ok(())
    }

    /// Remove a container that is no longer running
    pub fn remove(&self, id: &str) -> Result<()> {
        let info = self.runtime.inspect_container(id)?;
        self.runtime.remove_container(&info.id, false)?;
        if let Err(e) = self.store.delete_container(&info.id) {
            tracing::warn!("Failed to delete metadata of {}: {}", info.id, e);
        }
        Ok(())
    }

    pub fn inspect(&self, id: &str) -> Result<Container> {
        let info = self.runtime.inspect_container(id)?;
        Ok(self.describe(info))
    }

    /// Containers launched by this crate
    pub fn list(&self) -> Result<Vec<Container>> {
        Ok(self
            .runtime
            .list_containers()?
            .into_iter()
            .filter(|c| c.labels.get(LABEL_MANAGED).map(String::as_str) == Some("true"))
            .map(|c| self.describe(c))
            .collect())
    }

    /// Managed containers currently running
    pub fn container_count(&self) -> Result<usize> {
        Ok(self
            .runtime
            .list_containers()?
            .iter()
            .filter(|c| c.running && c.labels.get(LABEL_MANAGED).map(String::as_str) == Some("true"))
            .count())
    }

    fn describe(&self, info: ContainerInfo) -> Container {
        let record = self.store.get_container(&info.id).ok().flatten();
        let ports = record
            .as_ref()
            .and_then(|r| persisted_mappings(r).ok())
            .unwrap_or_default();
        Container {
            name: info.name,
            image: info.image,
            owner_uid: info.labels.get(LABEL_OWNER).cloned().unwrap_or_default(),
            host_port: host_port_summary(&ports),
            ports,
            networks: info.networks,
            created: info.created,
            usage: self.stats.get(&info.id),
            labels: info.labels,
            id: info.id,
        }
    }

    /// Run a shell command inside a container
    pub fn exec(&self, id: &str, command: &str) -> Result<ExecOutput> {
        let argv = vec!["sh".to_string(), "-c".to_string(), command.to_string()];
        self.runtime.exec(id, &argv)
    }

    /// Create a network and wait until the runtime reports it
    pub fn create_network(&self, spec: &NetworkSpec) -> Result<Network> {
        let id = self.runtime.create_network(spec)?;
        let network = match self.wait_until_ready(&id, spec) {
            Ok(network) => network,
            Err(e) => {
                if let Err(cleanup) = self.runtime.remove_network(&id) {
                    tracing::warn!("Failed to remove unready network {}: {}", spec.name, cleanup);
                }
                return Err(e);
            }
        };
        tracing::info!("Created network {} ({})", network.name, network.id);
        self.events.emit(&RuntimeEvent::NetworkCreated(network.clone()));
        Ok(network)
    }

    fn wait_until_ready(&self, id: &str, spec: &NetworkSpec) -> Result<Network> {
        let attempts = self.settings.network_ready_attempts.max(1);
        for attempt in 1..=attempts {
            if let Ok(network) = self.runtime.inspect_network(id) {
                if spec.subnet.is_none() || network.subnet == spec.subnet {
                    return Ok(network);
                }
            }
            if attempt < attempts {
                std::thread::sleep(self.settings.network_ready_delay);
            }
        }
        Err(FleetError::Network(format!("network {} did not become ready", spec.name)))
    }

    /// Create a network on the next free pool subnet.
    ///
    /// A failed creation returns the subnet and tries the next one.
    pub fn create_pool_network(&self, driver: NetworkDriver, internal: bool) -> Result<Network> {
        let mut last_error = None;
        for attempt in 1..=self.settings.pool_network_attempts.max(1) {
            let subnet = self.pool.checkout()?;
            let spec = NetworkSpec::new(&network_name_for(&subnet))
                .driver(driver)
                .subnet(&subnet)
                .internal(internal)
                .attachable(true);
            match self.create_network(&spec) {
                Ok(network) => return Ok(network),
                Err(e) => {
                    tracing::warn!("Attempt {} to create network on {} failed: {}", attempt, subnet, e);
                    self.pool.release(&subnet)?;
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or(FleetError::PoolExhausted))
    }

    /// Delete a network and hand its subnet back to the pool when it came from there
    pub fn release_network(&self, reference: &str) -> Result<()> {
        let network = self.runtime.inspect_network(reference)?;
        self.delete_network(&network.id)?;
        if let Some(subnet) = subnet_for_network_name(&network.name) {
            if self.pool.owns(&subnet) {
                self.pool.release(&subnet)?;
            }
        }
        Ok(())
    }

    /// Delete a network once every guard agrees and no container is attached
    pub fn delete_network(&self, reference: &str) -> Result<()> {
        let network = self.runtime.inspect_network(reference)?;
        self.network_guards.check(&network)?;
        self.wait_until_drained(&network)?;
        self.runtime.remove_network(&network.id)?;
        tracing::info!("Removed network {}", network.name);
        self.events.emit(&RuntimeEvent::NetworkRemoved {
            id: network.id,
            name: network.name,
        });
        Ok(())
    }

    fn wait_until_drained(&self, network: &Network) -> Result<()> {
        let attempts = self.settings.network_drain_attempts.max(1);
        let mut attached = 0;
        for attempt in 1..=attempts {
            attached = self.runtime.inspect_network(&network.id)?.containers.len();
            if attached == 0 {
                return Ok(());
            }
            tracing::debug!("Network {} still has {} container(s)", network.name, attached);
            if attempt < attempts {
                std::thread::sleep(self.settings.network_drain_delay);
            }
        }
        Err(FleetError::Network(format!(
            "network {} still has {} attached container(s)",
            network.name, attached
        )))
    }

    pub fn network_by_name(&self, reference: &str) -> Result<Network> {
        self.runtime.inspect_network(reference)
    }

    pub fn list_networks(&self) -> Result<Vec<Network>> {
        self.runtime.list_networks()
    }

    /// Fill the pool from `expr` and remove networks left over from a previous run
    pub fn init_address_pool(&self, expr: &str) -> Result<usize> {
        let names: Vec<String> = self.runtime.list_networks()?.into_iter().map(|n| n.name).collect();
        let init = self.pool.init(expr, &names)?;
        for name in &init.stale {
            match self.runtime.remove_network(name) {
                Ok(()) => tracing::info!("Removed stale network {}", name),
                Err(e) => {
                    tracing::warn!("Failed to remove stale network {}: {}", name, e);
                    if let Some(subnet) = subnet_for_network_name(name) {
                        self.pool.reserve(&subnet)?;
                    }
                }
            }
        }
        tracing::info!("Address pool ready with {} subnet(s)", self.pool.available());
        Ok(self.pool.available())
    }

    /// Re-attach monitors to running containers after a restart
    pub fn recover(&self) -> Result<usize> {
        let mut attached = 0;
        for container in self.runtime.list_containers()? {
            let managed = container.labels.get(LABEL_MANAGED).map(String::as_str) == Some("true");
            if !managed || !container.running {
                continue;
            }
            match self.stats.attach(&self.runtime, &container.id) {
                Ok(()) => attached += 1,
                Err(e) => tracing::warn!("Failed to attach monitor to {}: {}", container.id, e),
            }
        }
        let networks = self.runtime.list_networks()?;
        self.events.emit(&RuntimeEvent::DaemonStarted { networks });
        Ok(attached)
    }
}
