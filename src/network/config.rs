//! Network descriptions shared by the runtime and the orchestrators

use crate::error::{FleetError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::net::Ipv4Addr;

/// Network driver types
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkDriver {
    /// Bridge network (default)
    #[default]
    Bridge,
    /// Host network
    Host,
    /// No networking
    None,
    /// Multi-host overlay network
    Overlay,
}

impl std::fmt::Display for NetworkDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NetworkDriver::Bridge => write!(f, "bridge"),
            NetworkDriver::Host => write!(f, "host"),
            NetworkDriver::None => write!(f, "none"),
            NetworkDriver::Overlay => write!(f, "overlay"),
        }
    }
}

/// Network scope
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkScope {
    /// Local to this node
    #[default]
    Local,
    /// Spans the cluster
    Swarm,
}

/// Requested network
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkSpec {
    /// Network name
    pub name: String,
    /// Network driver
    pub driver: NetworkDriver,
    /// Network scope
    pub scope: NetworkScope,
    /// Subnet in CIDR format
    pub subnet: Option<String>,
    /// Internal network (no external access)
    pub internal: bool,
    /// Attachable by standalone containers
    pub attachable: bool,
    /// Network labels
    pub labels: HashMap<String, String>,
}

impl NetworkSpec {
    /// Create a new network specification
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            attachable: true,
            ..Self::default()
        }
    }

    /// Set network driver
    pub fn driver(mut self, driver: NetworkDriver) -> Self {
        self.driver = driver;
        self
    }

    /// Set subnet
    pub fn subnet(mut self, subnet: &str) -> Self {
        self.subnet = Some(subnet.to_string());
        self
    }

    /// Set internal
    pub fn internal(mut self, internal: bool) -> Self {
        self.internal = internal;
        self
    }

    /// Set attachable
    pub fn attachable(mut self, attachable: bool) -> Self {
        self.attachable = attachable;
        self
    }
}

/// Network as reported by the runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Network {
    /// Runtime network ID
    pub id: String,
    /// Network name
    pub name: String,
    /// Network driver
    pub driver: NetworkDriver,
    /// Network scope
    pub scope: NetworkScope,
    /// Subnet in CIDR format
    pub subnet: Option<String>,
    /// Internal network (no external access)
    pub internal: bool,
    /// Attachable by standalone containers
    pub attachable: bool,
    /// Network labels
    pub labels: HashMap<String, String>,
    /// Attached containers keyed by container ID
    pub containers: HashMap<String, NetworkEndpoint>,
    /// Created timestamp
    pub created: DateTime<Utc>,
}

impl Network {
    /// Materialize a network from its specification
    pub fn from_spec(id: &str, spec: &NetworkSpec) -> Self {
        Self {
            id: id.to_string(),
            name: spec.name.clone(),
            driver: spec.driver,
            scope: spec.scope,
            subnet: spec.subnet.clone(),
            internal: spec.internal,
            attachable: spec.attachable,
            labels: spec.labels.clone(),
            containers: HashMap::new(),
            created: Utc::now(),
        }
    }
}

/// A container's attachment to a network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkEndpoint {
    /// Container ID
    pub container_id: String,
    /// Container name
    pub name: String,
    /// IPv4 address without prefix
    pub ipv4_address: Option<String>,
}

/// Hands out host addresses inside a subnet
#[derive(Debug, Clone)]
pub struct HostAllocator {
    network: u32,
    host_count: u32,
    allocated: BTreeSet<u32>,
}

impl HostAllocator {
    /// Create an allocator for `subnet`; the first host address is kept for the gateway
    pub fn new(subnet: &str) -> Result<Self> {
        let (addr, prefix) = subnet
            .split_once('/')
            .ok_or_else(|| FleetError::Network(format!("Invalid subnet: {}", subnet)))?;
        let base: Ipv4Addr = addr
            .parse()
            .map_err(|_| FleetError::Network(format!("Invalid IP: {}", addr)))?;
        let prefix: u32 = prefix
            .parse()
            .ok()
            .filter(|p| *p <= 30)
            .ok_or_else(|| FleetError::Network(format!("Unusable prefix in {}", subnet)))?;

        let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
        let mut allocated = BTreeSet::new();
        allocated.insert(1);

        Ok(Self {
            network: u32::from(base) & mask,
            host_count: (1u32 << (32 - prefix)) - 2,
            allocated,
        })
    }

    /// Lowest free host address
    pub fn allocate(&mut self) -> Result<Ipv4Addr> {
        let offset = (1..=self.host_count)
            .find(|o| !self.allocated.contains(o))
            .ok_or_else(|| FleetError::Network("No free address in subnet".to_string()))?;
        self.allocated.insert(offset);
        Ok(Ipv4Addr::from(self.network + offset))
    }

    /// Release a host address
    pub fn release(&mut self, ip: Ipv4Addr) {
        let offset = u32::from(ip).wrapping_sub(self.network);
        if offset != 1 {
            self.allocated.remove(&offset);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_spec_builder() {
        let spec = NetworkSpec::new("svc-net")
            .driver(NetworkDriver::Overlay)
            .subnet("10.0.0.0/24")
            .internal(true);

        assert_eq!(spec.name, "svc-net");
        assert_eq!(spec.driver, NetworkDriver::Overlay);
        assert!(spec.internal);
        assert!(spec.attachable);

        let network = Network::from_spec("abc", &spec);
        assert_eq!(network.subnet.as_deref(), Some("10.0.0.0/24"));
        assert!(network.containers.is_empty());
    }

    #[test]
    fn test_host_allocator_reuses_released() {
        let mut allocator = HostAllocator::new("172.18.0.0/24").unwrap();
        let first = allocator.allocate().unwrap();
        let second = allocator.allocate().unwrap();
        assert_eq!(first, Ipv4Addr::new(172, 18, 0, 2));
        assert_eq!(second, Ipv4Addr::new(172, 18, 0, 3));

        allocator.release(first);
        assert_eq!(allocator.allocate().unwrap(), first);
    }

    #[test]
    fn test_host_allocator_exhausts() {
        let mut allocator = HostAllocator::new("10.9.9.0/30").unwrap();
        assert_eq!(allocator.allocate().unwrap(), Ipv4Addr::new(10, 9, 9, 2));
        assert!(allocator.allocate().is_err());
    }
}
