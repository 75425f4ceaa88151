//! In-memory container engine
//!
//! Behaves like a single-host engine closely enough for the orchestrators:
//! names are unique, networks refuse removal while endpoints remain, images
//! with children cannot be removed and stats streams end when the container
//! stops. Faults can be injected per operation.

use super::{
    ContainerInfo, ContainerRuntime, ContainerSpec, ExecOutput, ImageInfo, StatsSample, StatsStream,
};
use crate::error::{FleetError, Result};
use crate::network::{HostAllocator, Network, NetworkDriver, NetworkEndpoint, NetworkSpec};
use chrono::Utc;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use uuid::Uuid;

const PREDEFINED_NETWORKS: [&str; 3] = ["bridge", "host", "none"];
const DEFAULT_MEMORY_LIMIT: u64 = 2 * 1024 * 1024 * 1024;

/// Operation to fail on purpose
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Creating a container from this image
    CreateContainer { image: String },
    /// Starting a container created from this image
    StartContainer { image: String },
    /// Connecting any container to this network
    ConnectNetwork { network: String },
    /// Creating a network whose name starts with this prefix
    CreateNetwork { prefix: String },
    /// Removing this network
    RemoveNetwork { name: String },
    /// Exec of a command containing this text exits non-zero
    Exec { pattern: String },
    /// Pulling this reference
    Pull { reference: String },
}

#[derive(Debug, Clone)]
struct CatalogEntry {
    parent: Option<String>,
    size: u64,
}

#[derive(Debug, Clone)]
struct LocalContainer {
    info: ContainerInfo,
    image_id: String,
    exec_log: Vec<String>,
}

#[derive(Debug, Clone)]
struct LocalNetwork {
    network: Network,
    hosts: Option<HostAllocator>,
}

#[derive(Debug, Default)]
struct LocalState {
    catalog: HashMap<String, CatalogEntry>,
    images: HashMap<String, ImageInfo>,
    containers: HashMap<String, LocalContainer>,
    networks: HashMap<String, LocalNetwork>,
    faults: Vec<(Fault, Option<u32>)>,
    disk_usage: f64,
}

impl LocalState {
    /// Consume a matching fault, if any
    fn trip(&mut self, matches: impl Fn(&Fault) -> bool) -> bool {
        let Some(index) = self.faults.iter().position(|(fault, _)| matches(fault)) else {
            return false;
        };
        if let Some(remaining) = &mut self.faults[index].1 {
            *remaining -= 1;
            if *remaining == 0 {
                self.faults.remove(index);
            }
        }
        true
    }

    fn image_id(&self, reference: &str) -> Option<String> {
        if self.images.contains_key(reference) {
            return Some(reference.to_string());
        }
        let tag = normalize_reference(reference);
        self.images
            .values()
            .find(|image| image.tags.iter().any(|t| *t == tag))
            .map(|image| image.id.clone())
    }

    fn network_id(&self, reference: &str) -> Option<String> {
        if self.networks.contains_key(reference) {
            return Some(reference.to_string());
        }
        self.networks
            .values()
            .find(|n| n.network.name == reference)
            .map(|n| n.network.id.clone())
    }

    fn container_id(&self, reference: &str) -> Option<String> {
        if self.containers.contains_key(reference) {
            return Some(reference.to_string());
        }
        self.containers
            .values()
            .find(|c| c.info.name == reference)
            .map(|c| c.info.id.clone())
    }

    fn attach(&mut self, network_id: &str, container_id: &str) -> Result<()> {
        let container_name = self
            .containers
            .get(container_id)
            .map(|c| c.info.name.clone())
            .ok_or_else(|| FleetError::ContainerNotFound(container_id.to_string()))?;
        let entry = self
            .networks
            .get_mut(network_id)
            .ok_or_else(|| FleetError::NetworkNotFound(network_id.to_string()))?;
        if entry.network.containers.contains_key(container_id) {
            return Err(FleetError::Network(format!(
                "container {} is already attached to network {}",
                container_name, entry.network.name
            )));
        }

        let ip = match &mut entry.hosts {
            Some(hosts) => hosts.allocate()?.to_string(),
            None => String::new(),
        };
        entry.network.containers.insert(
            container_id.to_string(),
            NetworkEndpoint {
                container_id: container_id.to_string(),
                name: container_name,
                ipv4_address: (!ip.is_empty()).then(|| ip.clone()),
            },
        );
        let network_name = entry.network.name.clone();
        if let Some(container) = self.containers.get_mut(container_id) {
            container.info.networks.insert(network_name, ip);
        }
        Ok(())
    }

    fn detach(&mut self, network_id: &str, container_id: &str) -> Result<()> {
        let entry = self
            .networks
            .get_mut(network_id)
            .ok_or_else(|| FleetError::NetworkNotFound(network_id.to_string()))?;
        let endpoint = entry.network.containers.remove(container_id).ok_or_else(|| {
            FleetError::Network(format!(
                "container {} is not attached to network {}",
                container_id, entry.network.name
            ))
        })?;
        if let (Some(hosts), Some(ip)) = (&mut entry.hosts, endpoint.ipv4_address) {
            if let Ok(ip) = ip.parse::<Ipv4Addr>() {
                hosts.release(ip);
            }
        }
        let network_name = entry.network.name.clone();
        if let Some(container) = self.containers.get_mut(container_id) {
            container.info.networks.remove(&network_name);
        }
        Ok(())
    }
}

fn normalize_reference(reference: &str) -> String {
    let name = reference.rsplit('/').next().unwrap_or(reference);
    if name.contains(':') {
        reference.to_string()
    } else {
        format!("{}:latest", reference)
    }
}

fn new_id() -> String {
    format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
}

fn subnet_range(subnet: &str) -> Option<(u32, u32)> {
    let (addr, prefix) = subnet.split_once('/')?;
    let addr: Ipv4Addr = addr.parse().ok()?;
    let prefix: u32 = prefix.parse().ok().filter(|p| *p <= 32)?;
    let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
    let start = u32::from(addr) & mask;
    Some((start, start | !mask))
}

/// In-memory engine
#[derive(Clone)]
pub struct LocalRuntime {
    state: Arc<RwLock<LocalState>>,
    stats_interval: Duration,
}

impl Default for LocalRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalRuntime {
    /// Create an engine with the predefined networks
    pub fn new() -> Self {
        let mut state = LocalState::default();
        for name in PREDEFINED_NETWORKS {
            let mut spec = NetworkSpec::new(name);
            spec.driver = match name {
                "host" => NetworkDriver::Host,
                "none" => NetworkDriver::None,
                _ => NetworkDriver::Bridge,
            };
            let hosts = if name == "bridge" {
                spec.subnet = Some("172.17.0.0/16".to_string());
                HostAllocator::new("172.17.0.0/16").ok()
            } else {
                None
            };
            let id = new_id();
            state.networks.insert(
                id.clone(),
                LocalNetwork { network: Network::from_spec(&id, &spec), hosts },
            );
        }

        Self {
            state: Arc::new(RwLock::new(state)),
            stats_interval: Duration::from_millis(100),
        }
    }

    /// Cadence of stats samples
    pub fn with_stats_interval(mut self, interval: Duration) -> Self {
        self.stats_interval = interval;
        self
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, LocalState>> {
        self.state.write()
            .map_err(|_| FleetError::Lock("Failed to acquire write lock".to_string()))
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, LocalState>> {
        self.state.read()
            .map_err(|_| FleetError::Lock("Failed to acquire read lock".to_string()))
    }

    /// Make an image pullable, optionally on top of another published image
    pub fn publish(&self, reference: &str, parent: Option<&str>) -> Result<()> {
        let mut state = self.write()?;
        state.catalog.insert(
            normalize_reference(reference),
            CatalogEntry {
                parent: parent.map(normalize_reference),
                size: 64 * 1024 * 1024,
            },
        );
        Ok(())
    }

    /// Place an image directly in local storage
    pub fn add_image(&self, reference: &str, parent_id: Option<&str>) -> Result<String> {
        let mut state = self.write()?;
        if let Some(parent) = parent_id {
            if !state.images.contains_key(parent) {
                return Err(FleetError::ImageNotFound(parent.to_string()));
            }
        }
        let id = format!("sha256:{}", new_id());
        let tags = if reference.is_empty() {
            Vec::new()
        } else {
            vec![normalize_reference(reference)]
        };
        state.images.insert(id.clone(), ImageInfo {
            id: id.clone(),
            tags,
            parent_id: parent_id.map(|p| p.to_string()),
            size: 64 * 1024 * 1024,
            created: Utc::now(),
        });
        Ok(id)
    }

    pub fn set_disk_usage(&self, usage: f64) -> Result<()> {
        self.write()?.disk_usage = usage;
        Ok(())
    }

    /// Fail every matching call until cleared
    pub fn inject(&self, fault: Fault) -> Result<()> {
        self.write()?.faults.push((fault, None));
        Ok(())
    }

    /// Fail the next `times` matching calls
    pub fn inject_times(&self, fault: Fault, times: u32) -> Result<()> {
        if times > 0 {
            self.write()?.faults.push((fault, Some(times)));
        }
        Ok(())
    }

    /// Commands executed in a container, oldest first
    pub fn exec_log(&self, container: &str) -> Result<Vec<String>> {
        let state = self.read()?;
        let id = state
            .container_id(container)
            .ok_or_else(|| FleetError::ContainerNotFound(container.to_string()))?;
        Ok(state.containers.get(&id).map(|c| c.exec_log.clone()).unwrap_or_default())
    }
}

impl ContainerRuntime for LocalRuntime {
    fn inspect_image(&self, reference: &str) -> Result<Option<ImageInfo>> {
        let state = self.read()?;
        Ok(state.image_id(reference).and_then(|id| state.images.get(&id).cloned()))
    }

    fn pull_image(&self, reference: &str, progress: &mut dyn FnMut(&str)) -> Result<()> {
        let mut state = self.write()?;
        let tag = normalize_reference(reference);
        if state.trip(|f| matches!(f, Fault::Pull { reference } if normalize_reference(reference) == tag)) {
            return Err(FleetError::Image(format!("pull of {} failed", tag)));
        }

        // oldest ancestor first
        let mut chain = Vec::new();
        let mut cursor = Some(tag.clone());
        while let Some(current) = cursor {
            let entry = state
                .catalog
                .get(&current)
                .cloned()
                .ok_or_else(|| FleetError::ImageNotFound(current.clone()))?;
            if chain.contains(&current) {
                return Err(FleetError::Image(format!("cyclic image parents at {}", current)));
            }
            chain.push(current);
            cursor = entry.parent;
        }
        chain.reverse();

        let mut parent_id: Option<String> = None;
        for name in chain {
            if let Some(existing) = state.image_id(&name) {
                parent_id = Some(existing);
                continue;
            }
            progress(&format!("{}: Pulling fs layer\n", name));
            let size = state.catalog.get(&name).map(|e| e.size).unwrap_or(0);
            let id = format!("sha256:{}", new_id());
            state.images.insert(id.clone(), ImageInfo {
                id: id.clone(),
                tags: vec![name.clone()],
                parent_id: parent_id.take(),
                size,
                created: Utc::now(),
            });
            progress(&format!("{}: Pull complete\n", name));
            parent_id = Some(id);
        }
        Ok(())
    }

    fn build_image(&self, tag: &str, context: &Path, progress: &mut dyn FnMut(&str)) -> Result<ImageInfo> {
        let dockerfile = context.join("Dockerfile");
        if !context.is_dir() {
            return Err(FleetError::Image(format!(
                "build context {} not found",
                context.display()
            )));
        }
        let content = std::fs::read_to_string(&dockerfile).map_err(|_| {
            FleetError::Image(format!("no Dockerfile in {}", context.display()))
        })?;
        let steps: Vec<&str> = content
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .collect();

        let mut state = self.write()?;
        let mut parent_id = None;
        for (index, step) in steps.iter().enumerate() {
            progress(&format!("Step {}/{} : {}\n", index + 1, steps.len(), step));
            if let Some(base) = step.strip_prefix("FROM ").map(str::trim) {
                parent_id = Some(
                    state
                        .image_id(base)
                        .ok_or_else(|| FleetError::ImageNotFound(base.to_string()))?,
                );
            }
        }

        let tag = normalize_reference(tag);
        for image in state.images.values_mut() {
            image.tags.retain(|t| *t != tag);
        }
        let id = format!("sha256:{}", new_id());
        let image = ImageInfo {
            id: id.clone(),
            tags: vec![tag.clone()],
            parent_id,
            size: 16 * 1024 * 1024,
            created: Utc::now(),
        };
        state.images.insert(id, image.clone());
        progress(&format!("Successfully tagged {}\n", tag));
        Ok(image)
    }

    fn list_images(&self) -> Result<Vec<ImageInfo>> {
        Ok(self.read()?.images.values().cloned().collect())
    }

    fn remove_image(&self, id: &str, force: bool, prune_children: bool) -> Result<Vec<String>> {
        let mut state = self.write()?;
        let id = state
            .image_id(id)
            .ok_or_else(|| FleetError::ImageNotFound(id.to_string()))?;
        if state.images.values().any(|i| i.parent_id.as_deref() == Some(id.as_str())) {
            return Err(FleetError::Image(format!("image {} has dependent child images", id)));
        }
        if !force && state.containers.values().any(|c| c.image_id == id) {
            return Err(FleetError::Image(format!("image {} is being used by a container", id)));
        }

        let mut removed = Vec::new();
        let mut cursor = state.images.remove(&id).and_then(|image| image.parent_id);
        removed.push(id);

        // untagged parents left without children go too
        while prune_children {
            let Some(parent) = cursor.take() else { break };
            let prunable = state
                .images
                .get(&parent)
                .map(|p| p.tags.is_empty())
                .unwrap_or(false)
                && !state.images.values().any(|i| i.parent_id.as_deref() == Some(parent.as_str()))
                && !state.containers.values().any(|c| c.image_id == parent);
            if !prunable {
                break;
            }
            cursor = state.images.remove(&parent).and_then(|image| image.parent_id);
            removed.push(parent);
        }
        Ok(removed)
    }

    fn disk_usage(&self) -> Result<f64> {
        Ok(self.read()?.disk_usage)
    }

    fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let mut state = self.write()?;
        if state.trip(|f| matches!(f, Fault::CreateContainer { image } if *image == spec.image)) {
            return Err(FleetError::Container(format!(
                "failed to create container from {}",
                spec.image
            )));
        }
        let image_id = state
            .image_id(&spec.image)
            .ok_or_else(|| FleetError::ImageNotFound(spec.image.clone()))?;

        let id = new_id();
        let name = if spec.name.is_empty() { id[..12].to_string() } else { spec.name.clone() };
        if state.container_id(&name).is_some() {
            return Err(FleetError::Container(format!("container name {} is already in use", name)));
        }
        let mode = if spec.network_mode.is_empty() { "bridge" } else { spec.network_mode.as_str() };
        let network_id = match mode {
            "host" | "none" => None,
            other => Some(
                state
                    .network_id(other)
                    .ok_or_else(|| FleetError::NetworkNotFound(other.to_string()))?,
            ),
        };

        state.containers.insert(id.clone(), LocalContainer {
            info: ContainerInfo {
                id: id.clone(),
                name,
                image: spec.image.clone(),
                labels: spec.labels.clone(),
                running: false,
                networks: HashMap::new(),
                limits: spec.limits,
                created: Utc::now(),
            },
            image_id,
            exec_log: Vec::new(),
        });
        if let Some(network_id) = network_id {
            state.attach(&network_id, &id)?;
        }
        Ok(id)
    }

    fn start_container(&self, id: &str) -> Result<()> {
        let mut state = self.write()?;
        let id = state
            .container_id(id)
            .ok_or_else(|| FleetError::ContainerNotFound(id.to_string()))?;
        let image = state.containers.get(&id).map(|c| c.info.image.clone()).unwrap_or_default();
        if state.trip(|f| matches!(f, Fault::StartContainer { image: i } if *i == image)) {
            return Err(FleetError::Container(format!("failed to start container {}", id)));
        }
        if let Some(container) = state.containers.get_mut(&id) {
            container.info.running = true;
        }
        Ok(())
    }

    fn stop_container(&self, id: &str) -> Result<()> {
        let mut state = self.write()?;
        let id = state
            .container_id(id)
            .ok_or_else(|| FleetError::ContainerNotFound(id.to_string()))?;
        if let Some(container) = state.containers.get_mut(&id) {
            container.info.running = false;
        }
        Ok(())
    }

    fn remove_container(&self, id: &str, force: bool) -> Result<()> {
        let mut state = self.write()?;
        let id = state
            .container_id(id)
            .ok_or_else(|| FleetError::ContainerNotFound(id.to_string()))?;
        let running = state.containers.get(&id).map(|c| c.info.running).unwrap_or(false);
        if running && !force {
            return Err(FleetError::Container(format!(
                "cannot remove running container {}",
                id
            )));
        }
        let attached: Vec<String> = state
            .networks
            .values()
            .filter(|n| n.network.containers.contains_key(&id))
            .map(|n| n.network.id.clone())
            .collect();
        for network_id in attached {
            state.detach(&network_id, &id)?;
        }
        state.containers.remove(&id);
        Ok(())
    }

    fn inspect_container(&self, id: &str) -> Result<ContainerInfo> {
        let state = self.read()?;
        state
            .container_id(id)
            .and_then(|id| state.containers.get(&id))
            .map(|c| c.info.clone())
            .ok_or_else(|| FleetError::ContainerNotFound(id.to_string()))
    }

    fn list_containers(&self) -> Result<Vec<ContainerInfo>> {
        Ok(self.read()?.containers.values().map(|c| c.info.clone()).collect())
    }

    fn exec(&self, id: &str, command: &[String]) -> Result<ExecOutput> {
        let mut state = self.write()?;
        let id = state
            .container_id(id)
            .ok_or_else(|| FleetError::ContainerNotFound(id.to_string()))?;
        let joined = command.join(" ");
        let running = state.containers.get(&id).map(|c| c.info.running).unwrap_or(false);
        if !running {
            return Err(FleetError::Container(format!("container {} is not running", id)));
        }
        if let Some(container) = state.containers.get_mut(&id) {
            container.exec_log.push(joined.clone());
        }
        if state.trip(|f| matches!(f, Fault::Exec { pattern } if joined.contains(pattern.as_str()))) {
            return Ok(ExecOutput {
                exit_code: 1,
                output: format!("{}: command failed", joined),
            });
        }
        Ok(ExecOutput { exit_code: 0, output: String::new() })
    }

    fn stats(&self, id: &str) -> Result<StatsStream> {
        let id = self
            .read()?
            .container_id(id)
            .ok_or_else(|| FleetError::ContainerNotFound(id.to_string()))?;
        Ok(Box::new(LocalStats {
            state: self.state.clone(),
            id,
            interval: self.stats_interval,
            tick: 0,
        }))
    }

    fn create_network(&self, spec: &NetworkSpec) -> Result<String> {
        let mut state = self.write()?;
        if state.trip(|f| matches!(f, Fault::CreateNetwork { prefix } if spec.name.starts_with(prefix.as_str()))) {
            return Err(FleetError::Network(format!("failed to create network {}", spec.name)));
        }
        if state.network_id(&spec.name).is_some() {
            return Err(FleetError::Network(format!(
                "network with name {} already exists",
                spec.name
            )));
        }
        let hosts = match &spec.subnet {
            Some(subnet) => {
                let (start, end) = subnet_range(subnet)
                    .ok_or_else(|| FleetError::Network(format!("Invalid subnet: {}", subnet)))?;
                let overlaps = state.networks.values().any(|n| {
                    n.network
                        .subnet
                        .as_deref()
                        .and_then(subnet_range)
                        .map(|(s, e)| s <= end && start <= e)
                        .unwrap_or(false)
                });
                if overlaps {
                    return Err(FleetError::Network(format!(
                        "Pool overlaps with other one on this address space: {}",
                        subnet
                    )));
                }
                Some(HostAllocator::new(subnet)?)
            }
            None => None,
        };

        let id = new_id();
        state.networks.insert(
            id.clone(),
            LocalNetwork { network: Network::from_spec(&id, spec), hosts },
        );
        Ok(id)
    }

    fn inspect_network(&self, reference: &str) -> Result<Network> {
        let state = self.read()?;
        state
            .network_id(reference)
            .and_then(|id| state.networks.get(&id))
            .map(|n| n.network.clone())
            .ok_or_else(|| FleetError::NetworkNotFound(reference.to_string()))
    }

    fn list_networks(&self) -> Result<Vec<Network>> {
        Ok(self.read()?.networks.values().map(|n| n.network.clone()).collect())
    }

    fn remove_network(&self, reference: &str) -> Result<()> {
        let mut state = self.write()?;
        let id = state
            .network_id(reference)
            .ok_or_else(|| FleetError::NetworkNotFound(reference.to_string()))?;
        let (name, endpoints) = state
            .networks
            .get(&id)
            .map(|n| (n.network.name.clone(), n.network.containers.len()))
            .unwrap_or_default();
        if PREDEFINED_NETWORKS.contains(&name.as_str()) {
            return Err(FleetError::PermissionDenied(format!(
                "{} is a pre-defined network and cannot be removed",
                name
            )));
        }
        if state.trip(|f| matches!(f, Fault::RemoveNetwork { name: n } if *n == name)) {
            return Err(FleetError::Network(format!("failed to remove network {}", name)));
        }
        if endpoints > 0 {
            return Err(FleetError::Network(format!(
                "network {} has {} active endpoint(s)",
                name, endpoints
            )));
        }
        state.networks.remove(&id);
        Ok(())
    }

    fn connect_network(&self, network: &str, container: &str) -> Result<()> {
        let mut state = self.write()?;
        let network_id = state
            .network_id(network)
            .ok_or_else(|| FleetError::NetworkNotFound(network.to_string()))?;
        let container_id = state
            .container_id(container)
            .ok_or_else(|| FleetError::ContainerNotFound(container.to_string()))?;
        let name = state.networks.get(&network_id).map(|n| n.network.name.clone()).unwrap_or_default();
        if state.trip(|f| matches!(f, Fault::ConnectNetwork { network } if *network == name)) {
            return Err(FleetError::Network(format!(
                "failed to connect {} to {}",
                container_id, name
            )));
        }
        state.attach(&network_id, &container_id)
    }

    fn disconnect_network(&self, network: &str, container: &str) -> Result<()> {
        let mut state = self.write()?;
        let network_id = state
            .network_id(network)
            .ok_or_else(|| FleetError::NetworkNotFound(network.to_string()))?;
        let container_id = state
            .container_id(container)
            .ok_or_else(|| FleetError::ContainerNotFound(container.to_string()))?;
        state.detach(&network_id, &container_id)
    }
}

/// Synthetic stats stream: two CPUs, a fifth of each busy, 256 MiB resident
struct LocalStats {
    state: Arc<RwLock<LocalState>>,
    id: String,
    interval: Duration,
    tick: u64,
}

impl Iterator for LocalStats {
    type Item = StatsSample;

    fn next(&mut self) -> Option<StatsSample> {
        std::thread::sleep(self.interval);
        let state = self.state.read().ok()?;
        let container = state.containers.get(&self.id).filter(|c| c.info.running)?;
        let limit = if container.info.limits.memory_bytes > 0 {
            container.info.limits.memory_bytes as u64
        } else {
            DEFAULT_MEMORY_LIMIT
        };
        self.tick += 1;
        Some(StatsSample {
            cpu_total: self.tick * 20_000_000,
            precpu_total: (self.tick - 1) * 20_000_000,
            system_total: self.tick * 100_000_000,
            presystem_total: (self.tick - 1) * 100_000_000,
            online_cpus: 2,
            memory_usage: 256 * 1024 * 1024,
            memory_limit: limit,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(image: &str, network: &str) -> ContainerSpec {
        ContainerSpec {
            image: image.to_string(),
            network_mode: network.to_string(),
            ..ContainerSpec::default()
        }
    }

    #[test]
    fn test_pull_brings_parents() {
        let runtime = LocalRuntime::new();
        runtime.publish("base", None).unwrap();
        runtime.publish("app:1", Some("base")).unwrap();

        let mut lines = Vec::new();
        runtime.pull_image("app:1", &mut |l| lines.push(l.to_string())).unwrap();

        let app = runtime.inspect_image("app:1").unwrap().unwrap();
        let base = runtime.inspect_image("base").unwrap().unwrap();
        assert_eq!(app.parent_id.as_deref(), Some(base.id.as_str()));
        assert_eq!(lines.len(), 4);
        assert!(matches!(
            runtime.pull_image("missing", &mut |_| {}),
            Err(FleetError::ImageNotFound(_))
        ));
    }

    #[test]
    fn test_remove_image_refuses_parent_of_child() {
        let runtime = LocalRuntime::new();
        let parent = runtime.add_image("", None).unwrap();
        let child = runtime.add_image("child", Some(&parent)).unwrap();

        assert!(runtime.remove_image(&parent, true, true).is_err());
        let removed = runtime.remove_image(&child, true, true).unwrap();
        assert_eq!(removed, vec![child, parent]);
        assert!(runtime.list_images().unwrap().is_empty());
    }

    #[test]
    fn test_container_network_lifecycle() {
        let runtime = LocalRuntime::new();
        runtime.add_image("web", None).unwrap();
        let net = runtime
            .create_network(&NetworkSpec::new("front").subnet("10.5.0.0/24"))
            .unwrap();

        let id = runtime.create_container(&spec("web", "front")).unwrap();
        runtime.start_container(&id).unwrap();
        let info = runtime.inspect_container(&id).unwrap();
        assert_eq!(info.networks.get("front").map(String::as_str), Some("10.5.0.2"));

        assert!(runtime.remove_network(&net).is_err());
        assert!(runtime.remove_container(&id, false).is_err());
        runtime.remove_container(&id, true).unwrap();
        runtime.remove_network(&net).unwrap();
        assert!(runtime.remove_network("bridge").is_err());
    }

    #[test]
    fn test_overlapping_subnets_rejected() {
        let runtime = LocalRuntime::new();
        runtime.create_network(&NetworkSpec::new("a").subnet("10.6.0.0/16")).unwrap();
        assert!(runtime.create_network(&NetworkSpec::new("b").subnet("10.6.1.0/24")).is_err());
        assert!(runtime.create_network(&NetworkSpec::new("a").subnet("10.7.0.0/24")).is_err());
    }

    #[test]
    fn test_faults_trip_limited_times() {
        let runtime = LocalRuntime::new();
        runtime
            .inject_times(Fault::CreateNetwork { prefix: "x".to_string() }, 1)
            .unwrap();
        assert!(runtime.create_network(&NetworkSpec::new("x1")).is_err());
        assert!(runtime.create_network(&NetworkSpec::new("x1")).is_ok());
    }

    #[test]
    fn test_stats_stream_ends_with_container() {
        let runtime = LocalRuntime::new().with_stats_interval(Duration::from_millis(1));
        runtime.add_image("web", None).unwrap();
        let id = runtime.create_container(&spec("web", "bridge")).unwrap();
        runtime.start_container(&id).unwrap();

        let mut stream = runtime.stats(&id).unwrap();
        let sample = stream.next().unwrap();
        assert_eq!(sample.online_cpus, 2);

        runtime.stop_container(&id).unwrap();
        assert!(stream.next().is_none());
    }
}
