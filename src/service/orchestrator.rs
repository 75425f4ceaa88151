//! Atomic service provisioning
//!
//! A service comes up in three phases: networks, containers, flags. If any
//! step fails, everything built so far is torn down again and the original
//! error is returned. Teardown of a running service is best effort: every
//! container and network is attempted and the failures are reported together.

use super::config::{
    Service, ServiceDefinition, ServiceFlag, ServiceNetwork, ServiceStatus, FLAG_PLACEHOLDER,
};
use crate::container::{Container, ContainerOrchestrator, LaunchRequest};
use crate::error::{FleetError, Result};
use crate::network::{NetworkDriver, NetworkSpec};
use crate::store::{MetadataStore, ServiceRecord};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Resources obtained while a service is being built
#[derive(Default)]
struct Provisioned {
    networks: Vec<ServiceNetwork>,
    containers: Vec<Container>,
    persisted: bool,
}

/// Generate a fresh flag value
pub fn generate_flag() -> String {
    format!("flag{{{}}}", Uuid::new_v4())
}

fn encode(service: &Service) -> Result<ServiceRecord> {
    Ok(ServiceRecord {
        id: service.id.clone(),
        name: service.name.clone(),
        containers: serde_json::to_string(&service.containers)?,
        networks: serde_json::to_string(&service.networks)?,
        flags: serde_json::to_string(&service.flags)?,
    })
}

fn decode(record: &ServiceRecord) -> Result<Service> {
    let containers: Vec<Container> = serde_json::from_str(&record.containers)?;
    let created = containers
        .iter()
        .map(|c| c.created)
        .min()
        .unwrap_or_else(Utc::now);
    Ok(Service {
        id: record.id.clone(),
        name: record.name.clone(),
        owner_uid: containers.first().map(|c| c.owner_uid.clone()).unwrap_or_default(),
        networks: serde_json::from_str(&record.networks)?,
        flags: serde_json::from_str(&record.flags)?,
        status: ServiceStatus::Running,
        created,
        containers,
    })
}

/// Creates and tears down services
pub struct ServiceOrchestrator {
    containers: Arc<ContainerOrchestrator>,
    store: Arc<dyn MetadataStore>,
    services: Mutex<HashMap<String, Service>>,
}

impl ServiceOrchestrator {
    pub fn new(containers: Arc<ContainerOrchestrator>, store: Arc<dyn MetadataStore>) -> Self {
        Self {
            containers,
            store,
            services: Mutex::new(HashMap::new()),
        }
    }

    /// Build a service, rolling everything back on failure
    pub fn create_service(
        &self,
        definition: &ServiceDefinition,
        on_progress: &mut dyn FnMut(&str),
    ) -> Result<Service> {
        definition.config.validate()?;
        let id = Uuid::new_v4().to_string();
        tracing::info!("Creating service {} ({})", definition.name, id);

        let mut provisioned = Provisioned::default();
        match self.provision(&id, definition, &mut provisioned, on_progress) {
            Ok(service) => {
                tracing::info!(
                    "Service {} running with {} container(s)",
                    service.id,
                    service.containers.len()
                );
                Ok(service)
            }
            Err(e) => {
                tracing::warn!("Service {} failed, rolling back: {}", id, e);
                on_progress(&format!("service failed: {}\n", e));
                self.rollback(&id, &provisioned);
                Err(e)
            }
        }
    }

    fn provision(
        &self,
        id: &str,
        definition: &ServiceDefinition,
        provisioned: &mut Provisioned,
        on_progress: &mut dyn FnMut(&str),
    ) -> Result<Service> {
        let config = &definition.config;

        for decl in &config.networks {
            let network = if decl.random_cidr {
                self.containers.create_pool_network(NetworkDriver::Overlay, true)?
            } else {
                let spec = NetworkSpec::new(&format!("{}_{}", decl.name, &id[..8]))
                    .driver(NetworkDriver::Overlay)
                    .internal(true)
                    .attachable(true);
                self.containers.create_network(&spec)?
            };
            on_progress(&format!("network {} created as {}\n", decl.name, network.name));
            provisioned.networks.push(ServiceNetwork {
                name: decl.name.clone(),
                random_cidr: decl.random_cidr,
                network,
            });
        }

        let mut flags = Vec::new();
        for decl in &config.containers {
            let mut request = LaunchRequest::new(&decl.image)
                .owner(&definition.owner_uid)
                .module(&definition.module);
            for reference in &decl.networks {
                if let Some(network) = provisioned.networks.iter().find(|n| n.name == *reference) {
                    request = request.network(&network.network.name);
                }
            }
            request.ports = decl.ports.clone();
            request.env = decl.env_list();
            if let Some(resources) = decl.resources {
                request.resources = resources;
            }

            let container = self.containers.launch(&request, on_progress)?;
            on_progress(&format!("container {} created\n", container.id));
            let container_id = container.id.clone();
            provisioned.containers.push(container);

            for flag in &decl.flags {
                let value = generate_flag();
                let command = flag.command.replace(FLAG_PLACEHOLDER, &value);
                let output = self.containers.exec(&container_id, &command)?;
                if output.exit_code != 0 {
                    return Err(FleetError::Service(format!(
                        "flag {} command exited with {} in {}: {}",
                        flag.uuid,
                        output.exit_code,
                        container_id,
                        output.output.trim()
                    )));
                }
                on_progress(&format!("flag {} created\n", flag.uuid));
                flags.push(ServiceFlag {
                    flag_uuid: flag.uuid.clone(),
                    flag: value,
                });
            }
        }

        let service = Service {
            id: id.to_string(),
            name: definition.name.clone(),
            owner_uid: definition.owner_uid.clone(),
            containers: provisioned.containers.clone(),
            networks: provisioned.networks.clone(),
            flags,
            status: ServiceStatus::Running,
            created: Utc::now(),
        };

        self.store.put_service(encode(&service)?)?;
        provisioned.persisted = true;

        self.services
            .lock()
            .map_err(|_| FleetError::Lock("Failed to acquire service lock".to_string()))?
            .insert(service.id.clone(), service.clone());
        Ok(service)
    }

    fn rollback(&self, id: &str, provisioned: &Provisioned) {
        if provisioned.persisted {
            if let Err(e) = self.store.delete_service(id) {
                tracing::warn!("Failed to delete record of service {}: {}", id, e);
            }
        }
        for container in provisioned.containers.iter().rev() {
            if let Err(e) = self.containers.stop(&container.id) {
                tracing::warn!("Failed to stop container {} of service {}: {}", container.id, id, e);
            }
        }
        for network in provisioned.networks.iter().rev() {
            if let Err(e) = self.containers.release_network(&network.network.id) {
                tracing::warn!("Failed to release network {} of service {}: {}", network.network.name, id, e);
            }
        }
    }

    /// Stop every container and release every network of a service
    pub fn delete_service(&self, id: &str) -> Result<()> {
        let service = self.get_service(id)?;
        tracing::info!("Deleting service {} ({})", service.name, service.id);
        let mut failures = Vec::new();

        for container in &service.containers {
            match self.containers.stop(&container.id) {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {
                    tracing::debug!("Container {} of service {} is already gone", container.id, id);
                }
                Err(e) => failures.push(format!("container {}: {}", container.id, e)),
            }
        }
        for network in &service.networks {
            match self.containers.release_network(&network.network.id) {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {
                    tracing::debug!("Network {} of service {} is already gone", network.network.name, id);
                }
                Err(e) => failures.push(format!("network {}: {}", network.network.name, e)),
            }
        }

        if let Err(e) = self.store.delete_service(id) {
            failures.push(format!("record: {}", e));
        }
        self.services
            .lock()
            .map_err(|_| FleetError::Lock("Failed to acquire service lock".to_string()))?
            .remove(id);

        if failures.is_empty() {
            Ok(())
        } else {
            for failure in &failures {
                tracing::warn!("Teardown of service {}: {}", id, failure);
            }
            Err(FleetError::Teardown {
                id: id.to_string(),
                failures,
            })
        }
    }

    pub fn get_service(&self, id: &str) -> Result<Service> {
        self.services
            .lock()
            .map_err(|_| FleetError::Lock("Failed to acquire service lock".to_string()))?
            .get(id)
            .cloned()
            .ok_or_else(|| FleetError::ServiceNotFound(id.to_string()))
    }

    /// Services ordered by creation time
    pub fn list_services(&self) -> Result<Vec<Service>> {
        let mut services: Vec<Service> = self
            .services
            .lock()
            .map_err(|_| FleetError::Lock("Failed to acquire service lock".to_string()))?
            .values()
            .cloned()
            .collect();
        services.sort_by(|a, b| a.created.cmp(&b.created).then_with(|| a.id.cmp(&b.id)));
        Ok(services)
    }

    /// Reload persisted services after a restart.
    ///
    /// Services whose containers are no longer all present come back as degraded.
    pub fn recover(&self) -> Result<usize> {
        let mut recovered = Vec::new();
        for record in self.store.list_services()? {
            let mut service = match decode(&record) {
                Ok(service) => service,
                Err(e) => {
                    tracing::warn!("Skipping unreadable service record {}: {}", record.id, e);
                    continue;
                }
            };
            let missing = service
                .containers
                .iter()
                .filter(|c| self.containers.inspect(&c.id).is_err())
                .count();
            if missing > 0 {
                tracing::warn!("Service {} lost {} container(s)", service.id, missing);
                service.status = ServiceStatus::Degraded;
            }
            recovered.push(service);
        }

        let count = recovered.len();
        let mut services = self.services
            .lock()
            .map_err(|_| FleetError::Lock("Failed to acquire service lock".to_string()))?;
        for service in recovered {
            services.insert(service.id.clone(), service);
        }
        tracing::info!("Recovered {} service(s)", count);
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ImagePolicy;
    use crate::container::OrchestratorSettings;
    use crate::image::ImageLifecycleManager;
    use crate::network::AddressPool;
    use crate::proxy::LocalProxy;
    use crate::runtime::{ContainerRuntime, Fault, LocalRuntime};
    use crate::service::config::{ContainerDecl, FlagSpec, NetworkDecl, ServiceConfig};
    use crate::store::MemoryStore;
    use std::time::Duration;

    struct Fixture {
        runtime: Arc<LocalRuntime>,
        proxy: Arc<LocalProxy>,
        store: Arc<MemoryStore>,
        containers: Arc<ContainerOrchestrator>,
        services: ServiceOrchestrator,
    }

    fn fixture() -> Fixture {
        let runtime = Arc::new(LocalRuntime::new());
        for image in ["x", "web", "db", "cache"] {
            runtime.publish(image, None).unwrap();
        }
        let proxy = Arc::new(LocalProxy::default());
        let store = Arc::new(MemoryStore::new());
        let images = Arc::new(ImageLifecycleManager::new(
            runtime.clone(),
            store.clone(),
            ImagePolicy::default(),
        ));
        let pool = Arc::new(AddressPool::from_expression("172.[128-131].0.0/24").unwrap());
        let containers = Arc::new(
            ContainerOrchestrator::new(runtime.clone(), proxy.clone(), store.clone(), images, pool)
                .with_settings(OrchestratorSettings {
                    network_ready_delay: Duration::from_millis(1),
                    network_drain_delay: Duration::from_millis(1),
                    ..OrchestratorSettings::default()
                }),
        );
        let services = ServiceOrchestrator::new(containers.clone(), store.clone());
        Fixture { runtime, proxy, store, containers, services }
    }

    fn container(image: &str, networks: &[&str]) -> ContainerDecl {
        ContainerDecl {
            image: image.to_string(),
            ports: Vec::new(),
            networks: networks.iter().map(|n| n.to_string()).collect(),
            flags: Vec::new(),
            env: Default::default(),
            resources: None,
        }
    }

    fn flag(command: &str, score: u32, uuid: &str) -> FlagSpec {
        FlagSpec {
            command: command.to_string(),
            score,
            uuid: uuid.to_string(),
        }
    }

    fn definition(config: ServiceConfig) -> ServiceDefinition {
        ServiceDefinition {
            name: "challenge".to_string(),
            owner_uid: "7".to_string(),
            module: "ctf".to_string(),
            config,
        }
    }

    #[test]
    fn test_single_container_with_flag() {
        let f = fixture();
        let mut x = container("x", &["A"]);
        x.flags.push(flag("echo $flag > /flag", 100, "u1"));
        let config = ServiceConfig {
            networks: vec![NetworkDecl { name: "A".to_string(), random_cidr: true }],
            containers: vec![x],
            total_score: 100,
            network_count: 1,
            container_count: 1,
        };

        let service = f.services.create_service(&definition(config), &mut |_| {}).unwrap();
        assert_eq!(service.networks.len(), 1);
        assert_eq!(service.networks[0].network.subnet.as_deref(), Some("172.128.0.0/24"));
        assert_eq!(service.containers.len(), 1);
        assert!(service.containers[0].networks.contains_key(&service.networks[0].network.name));
        assert_eq!(service.flags.len(), 1);
        assert_eq!(service.flags[0].flag_uuid, "u1");
        let value = &service.flags[0].flag;
        assert!(value.starts_with("flag{") && value.ends_with('}') && value.len() > 6);

        let log = f.runtime.exec_log(&service.containers[0].id).unwrap();
        assert!(log.iter().any(|cmd| cmd.contains(&format!("echo {} > /flag", value))));
        assert!(f.store.get_service(&service.id).unwrap().is_some());
        assert_eq!(f.services.get_service(&service.id).unwrap().flags, service.flags);
    }

    #[test]
    fn test_failure_on_third_container_rolls_back() {
        let f = fixture();
        f.runtime.inject(Fault::CreateContainer { image: "cache".to_string() }).unwrap();
        let mut web = container("web", &["front", "back"]);
        web.ports = crate::container::parse_port_specs("80/tcp").unwrap();
        let config = ServiceConfig {
            networks: vec![
                NetworkDecl { name: "front".to_string(), random_cidr: true },
                NetworkDecl { name: "back".to_string(), random_cidr: false },
            ],
            containers: vec![web, container("db", &["back"]), container("cache", &["back"])],
            total_score: 0,
            network_count: 2,
            container_count: 3,
        };
        let networks_before = f.runtime.list_networks().unwrap().len();

        let err = f.services.create_service(&definition(config), &mut |_| {}).unwrap_err();
        assert!(matches!(err, FleetError::Container(_)));

        assert!(f.runtime.list_containers().unwrap().is_empty());
        assert_eq!(f.runtime.list_networks().unwrap().len(), networks_before);
        assert_eq!(f.containers.pool().available(), 4);
        assert!(f.proxy.active().is_empty());
        assert!(f.store.list_services().unwrap().is_empty());
        assert!(f.store.list_containers().unwrap().is_empty());
        assert!(f.services.list_services().unwrap().is_empty());
    }

    #[test]
    fn test_failing_flag_command_rolls_back() {
        let f = fixture();
        f.runtime.inject(Fault::Exec { pattern: "/readonly".to_string() }).unwrap();
        let mut web = container("web", &["A"]);
        web.flags.push(flag("echo $flag > /flag", 50, "u1"));
        let mut db = container("db", &["A"]);
        db.flags.push(flag("echo $flag > /readonly/flag", 50, "u2"));
        let config = ServiceConfig {
            networks: vec![NetworkDecl { name: "A".to_string(), random_cidr: true }],
            containers: vec![web, db],
            total_score: 100,
            network_count: 1,
            container_count: 2,
        };

        let err = f.services.create_service(&definition(config), &mut |_| {}).unwrap_err();
        assert!(err.to_string().contains("u2"));
        assert!(f.runtime.list_containers().unwrap().is_empty());
        assert_eq!(f.containers.pool().available(), 4);
    }

    #[test]
    fn test_invalid_config_touches_nothing() {
        let f = fixture();
        let config = ServiceConfig {
            networks: vec![NetworkDecl { name: "A".to_string(), random_cidr: true }],
            containers: vec![container("x", &["A"])],
            total_score: 10,
            network_count: 1,
            container_count: 1,
        };
        assert!(matches!(
            f.services.create_service(&definition(config), &mut |_| {}),
            Err(FleetError::InvalidServiceConfig(_))
        ));
        assert_eq!(f.containers.pool().available(), 4);
        assert_eq!(f.runtime.list_networks().unwrap().len(), 3);
    }

    fn two_container_config() -> ServiceConfig {
        ServiceConfig {
            networks: vec![
                NetworkDecl { name: "A".to_string(), random_cidr: true },
                NetworkDecl { name: "B".to_string(), random_cidr: false },
            ],
            containers: vec![container("web", &["A", "B"]), container("db", &["B"])],
            total_score: 0,
            network_count: 2,
            container_count: 2,
        }
    }

    #[test]
    fn test_delete_service_releases_everything() {
        let f = fixture();
        let service = f
            .services
            .create_service(&definition(two_container_config()), &mut |_| {})
            .unwrap();
        assert_eq!(f.containers.pool().available(), 3);

        f.services.delete_service(&service.id).unwrap();
        assert!(f.runtime.list_containers().unwrap().is_empty());
        assert_eq!(f.runtime.list_networks().unwrap().len(), 3);
        assert_eq!(f.containers.pool().available(), 4);
        assert!(matches!(
            f.services.get_service(&service.id),
            Err(FleetError::ServiceNotFound(_))
        ));
        assert!(f.store.get_service(&service.id).unwrap().is_none());
    }

    #[test]
    fn test_delete_collects_failures() {
        let f = fixture();
        let service = f
            .services
            .create_service(&definition(two_container_config()), &mut |_| {})
            .unwrap();
        let named = service.networks.iter().find(|n| !n.random_cidr).unwrap();
        f.runtime
            .inject(Fault::RemoveNetwork { name: named.network.name.clone() })
            .unwrap();

        match f.services.delete_service(&service.id) {
            Err(FleetError::Teardown { id, failures }) => {
                assert_eq!(id, service.id);
                assert_eq!(failures.len(), 1);
                assert!(failures[0].contains(&named.network.name));
            }
            other => panic!("expected teardown error, got {:?}", other),
        }
        // the rest was still torn down
        assert!(f.runtime.list_containers().unwrap().is_empty());
        assert_eq!(f.containers.pool().available(), 4);
        assert!(f.services.list_services().unwrap().is_empty());
    }

    #[test]
    fn test_recover_marks_lost_containers() {
        let f = fixture();
        let service = f
            .services
            .create_service(&definition(two_container_config()), &mut |_| {})
            .unwrap();

        let restarted = ServiceOrchestrator::new(f.containers.clone(), f.store.clone());
        assert_eq!(restarted.recover().unwrap(), 1);
        let recovered = restarted.get_service(&service.id).unwrap();
        assert_eq!(recovered.status, ServiceStatus::Running);
        assert_eq!(recovered.owner_uid, "7");
        assert_eq!(recovered.networks.len(), 2);

        f.runtime.stop_container(&service.containers[1].id).unwrap();
        f.runtime.remove_container(&service.containers[1].id, false).unwrap();
        let again = ServiceOrchestrator::new(f.containers.clone(), f.store.clone());
        again.recover().unwrap();
        assert_eq!(again.get_service(&service.id).unwrap().status, ServiceStatus::Degraded);
    }
}
