//! Container launch requests and descriptors

use crate::error::{FleetError, Result};
use crate::proxy::{PortMapping, Protocol};
use crate::runtime::ResourceLimits;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Label carrying the owner of a container
pub const LABEL_OWNER: &str = "owner_uid";
/// Label carrying the module that launched a container
pub const LABEL_MODULE: &str = "module";
/// Label carrying the correlation UUID
pub const LABEL_UUID: &str = "uuid";
/// Label marking containers managed by this crate
pub const LABEL_MANAGED: &str = "flotilla";
/// Persisted label with the serialized port mappings
pub const LABEL_PORT_MAP: &str = "port_map";
/// Persisted label with the human-readable mapping summary
pub const LABEL_HOST_PORT: &str = "host_port";

const GIB: u64 = 1024 * 1024 * 1024;

/// A container port to expose
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortSpec {
    pub port: u16,
    #[serde(default)]
    pub protocol: Protocol,
}

impl std::fmt::Display for PortSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.port, self.protocol)
    }
}

/// Parse `"80/tcp,22/tcp"`. A missing protocol means tcp; an empty string means no ports.
pub fn parse_port_specs(specs: &str) -> Result<Vec<PortSpec>> {
    specs
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|spec| -> Result<PortSpec> {
            let (port, protocol) = match spec.split_once('/') {
                Some((port, protocol)) => (port, protocol.parse::<Protocol>()?),
                None => (spec, Protocol::Tcp),
            };
            let port: u16 = port
                .trim()
                .parse()
                .ok()
                .filter(|p| *p > 0)
                .ok_or_else(|| FleetError::InvalidPortSpec(format!("invalid port in '{}'", spec)))?;
            Ok(PortSpec { port, protocol })
        })
        .collect()
}

/// Requested resources
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequest {
    /// CPUs
    pub cpu: f64,
    /// Memory ceiling in bytes
    pub memory_bytes: u64,
    /// Disk share in bytes, turned into a block IO weight
    pub disk_bytes: u64,
}

impl Default for ResourceRequest {
    fn default() -> Self {
        Self {
            cpu: 1.0,
            memory_bytes: 2 * GIB,
            disk_bytes: 5 * GIB,
        }
    }
}

impl ResourceRequest {
    pub fn limits(&self) -> ResourceLimits {
        let weight = self.disk_bytes / (GIB / 100);
        ResourceLimits {
            nano_cpus: (self.cpu * 1e9) as i64,
            memory_bytes: self.memory_bytes.min(i64::MAX as u64) as i64,
            blkio_weight: weight.clamp(10, 1000) as u16,
        }
    }
}

/// Everything needed to launch a container
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LaunchRequest {
    /// Image reference
    pub image: String,
    /// Owner of the container
    #[serde(default)]
    pub owner_uid: String,
    /// Module that launched the container
    #[serde(default)]
    pub module: String,
    /// Networks by name; the first one is joined at creation
    #[serde(default)]
    pub networks: Vec<String>,
    /// Ports to expose through the proxy
    #[serde(default)]
    pub ports: Vec<PortSpec>,
    /// Resource request
    #[serde(default)]
    pub resources: ResourceRequest,
    /// Environment in KEY=VALUE form
    #[serde(default)]
    pub env: Vec<String>,
}

impl LaunchRequest {
    pub fn new(image: &str) -> Self {
        Self {
            image: image.to_string(),
            ..Self::default()
        }
    }

    pub fn owner(mut self, owner_uid: &str) -> Self {
        self.owner_uid = owner_uid.to_string();
        self
    }

    pub fn module(mut self, module: &str) -> Self {
        self.module = module.to_string();
        self
    }

    pub fn network(mut self, name: &str) -> Self {
        self.networks.push(name.to_string());
        self
    }

    pub fn port(mut self, port: u16, protocol: Protocol) -> Self {
        self.ports.push(PortSpec { port, protocol });
        self
    }

    pub fn resources(mut self, resources: ResourceRequest) -> Self {
        self.resources = resources;
        self
    }

    pub fn env(mut self, var: &str) -> Self {
        self.env.push(var.to_string());
        self
    }
}

/// Live usage of a container
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub cpu_percent: f64,
    pub memory_percent: f64,
}

/// A launched container
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Container {
    /// Runtime container ID
    pub id: String,
    /// Container name (the correlation UUID)
    pub name: String,
    /// Image reference
    pub image: String,
    /// Owner of the container
    pub owner_uid: String,
    /// Container labels
    pub labels: HashMap<String, String>,
    /// Network name to IPv4 address
    pub networks: HashMap<String, String>,
    /// Established port mappings
    pub ports: Vec<PortMapping>,
    /// Mapping summary, `proto/ip:port->addr:port` joined by commas
    pub host_port: String,
    /// Creation time
    pub created: DateTime<Utc>,
    /// Latest usage sample, when a monitor is attached
    #[serde(default)]
    pub usage: Option<Usage>,
}

/// Summary string stored alongside the mappings
pub fn host_port_summary(mappings: &[PortMapping]) -> String {
    mappings
        .iter()
        .map(|m| m.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_port_specs() {
        let ports = parse_port_specs("80/tcp, 53/udp,8080").unwrap();
        assert_eq!(
            ports,
            vec![
                PortSpec { port: 80, protocol: Protocol::Tcp },
                PortSpec { port: 53, protocol: Protocol::Udp },
                PortSpec { port: 8080, protocol: Protocol::Tcp },
            ]
        );
        assert!(parse_port_specs("").unwrap().is_empty());
        assert!(parse_port_specs("0/tcp").is_err());
        assert!(parse_port_specs("80/icmp").is_err());
        assert!(parse_port_specs("http/tcp").is_err());
    }

    #[test]
    fn test_default_limits() {
        let limits = ResourceRequest::default().limits();
        assert_eq!(limits.nano_cpus, 1_000_000_000);
        assert_eq!(limits.memory_bytes, 2 * GIB as i64);
        assert_eq!(limits.blkio_weight, 500);
    }

    #[test]
    fn test_host_port_summary() {
        let mapping = PortMapping {
            container_ip: "10.0.0.2".to_string(),
            container_port: 80,
            protocol: Protocol::Tcp,
            public_addr: "1.2.3.4".to_string(),
            public_port: 30001,
        };
        assert_eq!(
            host_port_summary(&[mapping.clone(), mapping]),
            "tcp/10.0.0.2:80->1.2.3.4:30001,tcp/10.0.0.2:80->1.2.3.4:30001"
        );
    }
}
