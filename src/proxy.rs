//! Reverse-proxy port mapping
//!
//! Container ports live on internal networks. A [`PortProxy`] exposes a
//! container `ip:port/protocol` on an externally reachable address.

use crate::error::{FleetError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

/// Transport protocol of a mapped port
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

impl std::str::FromStr for Protocol {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            other => Err(FleetError::InvalidPortSpec(format!("unknown protocol '{}'", other))),
        }
    }
}

/// An established mapping
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortMapping {
    /// Container address on its network
    pub container_ip: String,
    /// Container port
    pub container_port: u16,
    /// Protocol
    pub protocol: Protocol,
    /// Externally reachable address
    pub public_addr: String,
    /// Externally reachable port
    pub public_port: u16,
}

impl std::fmt::Display for PortMapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}:{}->{}:{}",
            self.protocol, self.container_ip, self.container_port, self.public_addr, self.public_port
        )
    }
}

/// Maps container ports to public endpoints
pub trait PortProxy: Send + Sync {
    /// Expose `ip:port/protocol`
    fn start(&self, container_ip: &str, container_port: u16, protocol: Protocol) -> Result<PortMapping>;

    /// Tear a mapping down
    fn stop(&self, mapping: &PortMapping) -> Result<()>;
}

#[derive(Debug, Default)]
struct ProxyState {
    active: HashMap<(String, u16, Protocol), PortMapping>,
    used_ports: HashSet<u16>,
    failing_ports: HashSet<u16>,
}

/// In-process proxy that allocates public ports from a range
#[derive(Debug)]
pub struct LocalProxy {
    public_addr: String,
    first_port: u16,
    last_port: u16,
    state: Mutex<ProxyState>,
}

impl Default for LocalProxy {
    fn default() -> Self {
        Self::new("127.0.0.1", 30000, 39999)
    }
}

impl LocalProxy {
    pub fn new(public_addr: &str, first_port: u16, last_port: u16) -> Self {
        Self {
            public_addr: public_addr.to_string(),
            first_port,
            last_port,
            state: Mutex::new(ProxyState::default()),
        }
    }

    /// Make mappings of this container port fail
    pub fn fail_port(&self, container_port: u16) -> Result<()> {
        self.state.lock()
            .map_err(|_| FleetError::Lock("Failed to acquire proxy lock".to_string()))?
            .failing_ports
            .insert(container_port);
        Ok(())
    }

    /// Mappings currently established
    pub fn active(&self) -> Vec<PortMapping> {
        self.state
            .lock()
            .map(|s| s.active.values().cloned().collect())
            .unwrap_or_default()
    }
}

impl PortProxy for LocalProxy {
    fn start(&self, container_ip: &str, container_port: u16, protocol: Protocol) -> Result<PortMapping> {
        let mut state = self.state.lock()
            .map_err(|_| FleetError::Lock("Failed to acquire proxy lock".to_string()))?;
        if state.failing_ports.contains(&container_port) {
            return Err(FleetError::Proxy(format!(
                "cannot expose {}:{}/{}",
                container_ip, container_port, protocol
            )));
        }
        let key = (container_ip.to_string(), container_port, protocol);
        if let Some(existing) = state.active.get(&key) {
            return Ok(existing.clone());
        }
        let public_port = (self.first_port..=self.last_port)
            .find(|p| !state.used_ports.contains(p))
            .ok_or_else(|| FleetError::Proxy("no public port left".to_string()))?;

        let mapping = PortMapping {
            container_ip: container_ip.to_string(),
            container_port,
            protocol,
            public_addr: self.public_addr.clone(),
            public_port,
        };
        state.used_ports.insert(public_port);
        state.active.insert(key, mapping.clone());
        tracing::debug!("Proxy started {}", mapping);
        Ok(mapping)
    }

    fn stop(&self, mapping: &PortMapping) -> Result<()> {
        let mut state = self.state.lock()
            .map_err(|_| FleetError::Lock("Failed to acquire proxy lock".to_string()))?;
        let key = (mapping.container_ip.clone(), mapping.container_port, mapping.protocol);
        let removed = state
            .active
            .remove(&key)
            .ok_or_else(|| FleetError::Proxy(format!("no mapping {}", mapping)))?;
        state.used_ports.remove(&removed.public_port);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_and_stop_mapping() {
        let proxy = LocalProxy::new("203.0.113.5", 40000, 40001);
        let web = proxy.start("10.0.0.2", 80, Protocol::Tcp).unwrap();
        assert_eq!(web.to_string(), "tcp/10.0.0.2:80->203.0.113.5:40000");

        let ssh = proxy.start("10.0.0.2", 22, Protocol::Tcp).unwrap();
        assert_eq!(ssh.public_port, 40001);
        assert!(proxy.start("10.0.0.3", 22, Protocol::Tcp).is_err());

        proxy.stop(&web).unwrap();
        assert!(proxy.stop(&web).is_err());
        assert_eq!(proxy.start("10.0.0.3", 22, Protocol::Tcp).unwrap().public_port, 40000);
    }

    #[test]
    fn test_protocol_parse() {
        assert_eq!("UDP".parse::<Protocol>().unwrap(), Protocol::Udp);
        assert!("sctp".parse::<Protocol>().is_err());
    }
}
