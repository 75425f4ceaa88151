//! Wiring of a worker node's components

use super::handler::NodeAgent;
use super::link::StatusReporter;
use super::probe::HostProbe;
use crate::config::FleetConfig;
use crate::container::{ContainerOrchestrator, NetworkMonitorManager, OrchestratorSettings};
use crate::error::Result;
use crate::image::ImageLifecycleManager;
use crate::network::AddressPool;
use crate::operation::OperationRegistry;
use crate::proxy::{LocalProxy, PortProxy};
use crate::runtime::{ContainerRuntime, LocalRuntime};
use crate::service::ServiceOrchestrator;
use crate::store::{JsonFileStore, MemoryStore, MetadataStore};
use std::sync::Arc;

/// File holding persisted node metadata, under the data directory
pub const METADATA_FILE: &str = "metadata.json";

/// Everything a worker node runs
pub struct NodeStack {
    pub client_id: String,
    pub max_containers: usize,
    pub images: Arc<ImageLifecycleManager>,
    pub containers: Arc<ContainerOrchestrator>,
    pub services: Arc<ServiceOrchestrator>,
    pub monitors: Arc<NetworkMonitorManager>,
    pub operations: Arc<OperationRegistry>,
}

impl NodeStack {
    /// Build the node's components and restore their state from `store`.
    ///
    /// Fills the address pool (removing stale pool networks), creates usage
    /// records for images already present, then recovers containers and
    /// services.
    pub fn assemble(
        config: &FleetConfig,
        runtime: Arc<dyn ContainerRuntime>,
        proxy: Arc<dyn PortProxy>,
        store: Arc<dyn MetadataStore>,
    ) -> Result<Self> {
        let images = Arc::new(ImageLifecycleManager::new(
            runtime.clone(),
            store.clone(),
            config.images.clone(),
        ));
        let recorded = images.init_records()?;
        if recorded > 0 {
            tracing::info!("Tracking {} image(s) already present", recorded);
        }

        let settings = OrchestratorSettings {
            dns: config.node.dns.clone(),
            ..OrchestratorSettings::default()
        };
        let containers = Arc::new(
            ContainerOrchestrator::new(
                runtime,
                proxy,
                store.clone(),
                images.clone(),
                Arc::new(AddressPool::new()),
            )
            .with_settings(settings),
        );
        let subnets = containers.init_address_pool(&config.node.cidr)?;
        tracing::info!("Address pool holds {} subnet(s)", subnets);
        containers.recover()?;

        let services = Arc::new(ServiceOrchestrator::new(containers.clone(), store));
        services.recover()?;

        let monitors = Arc::new(NetworkMonitorManager::new(containers.clone()));
        monitors.attach_guard();

        Ok(Self {
            client_id: config.node.client_id.clone(),
            max_containers: config.node.max_containers as usize,
            images,
            containers,
            services,
            monitors,
            operations: Arc::new(OperationRegistry::new(config.operations.remainder)),
        })
    }

    /// Node backed by the in-memory engine and store
    pub fn in_memory(config: &FleetConfig) -> Result<Self> {
        Self::assemble(
            config,
            Arc::new(LocalRuntime::new()),
            Arc::new(LocalProxy::default()),
            Arc::new(MemoryStore::new()),
        )
    }

    /// In-memory engine with metadata kept under the data directory
    pub fn persistent(config: &FleetConfig, runtime: Arc<dyn ContainerRuntime>) -> Result<Self> {
        let store = JsonFileStore::open(&config.data_dir.join(METADATA_FILE))?;
        Self::assemble(config, runtime, Arc::new(LocalProxy::default()), Arc::new(store))
    }

    pub fn agent(&self) -> NodeAgent {
        NodeAgent::new(
            &self.client_id,
            self.max_containers,
            self.containers.clone(),
            self.services.clone(),
            self.monitors.clone(),
            self.operations.clone(),
        )
    }

    pub fn status_reporter(&self, probe: Box<dyn HostProbe>) -> StatusReporter {
        StatusReporter::new(probe, self.containers.clone(), self.max_containers)
    }
}
