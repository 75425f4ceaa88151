//! Service definitions
//!
//! A service is a set of containers wired into up to four private networks,
//! with scored flags injected into the containers at creation time.

use crate::container::{Container, PortSpec, ResourceRequest};
use crate::error::{FleetError, Result};
use crate::network::Network;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Most containers a service may declare
pub const MAX_CONTAINERS: usize = 16;
/// Most networks a service may declare
pub const MAX_NETWORKS: usize = 4;
/// Placeholder replaced by the generated flag in flag commands
pub const FLAG_PLACEHOLDER: &str = "$flag";

/// A logical network of the service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkDecl {
    /// Name containers use to refer to the network
    pub name: String,
    /// Allocate the subnet from the address pool instead of creating a named network
    #[serde(default, alias = "random")]
    pub random_cidr: bool,
}

/// Command that plants a flag inside a container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlagSpec {
    /// Shell command; every `$flag` is replaced by the generated value
    #[serde(alias = "flag_command")]
    pub command: String,
    /// Score awarded for the flag
    #[serde(alias = "flag_score")]
    pub score: u32,
    /// Caller-side identifier of the flag
    #[serde(alias = "flag_uuid")]
    pub uuid: String,
}

/// One container of the service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerDecl {
    pub image: String,
    #[serde(default)]
    pub ports: Vec<PortSpec>,
    /// Logical network names
    #[serde(default)]
    pub networks: Vec<String>,
    #[serde(default)]
    pub flags: Vec<FlagSpec>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub resources: Option<ResourceRequest>,
}

impl ContainerDecl {
    /// Environment in KEY=VALUE form
    pub fn env_list(&self) -> Vec<String> {
        self.env.iter().map(|(k, v)| format!("{}={}", k, v)).collect()
    }
}

/// Layout of a service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub networks: Vec<NetworkDecl>,
    pub containers: Vec<ContainerDecl>,
    /// Must equal the sum of every flag score
    pub total_score: u32,
    pub network_count: usize,
    pub container_count: usize,
}

impl ServiceConfig {
    /// Parse a YAML (or JSON) document and validate it
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check counts, references and scores
    pub fn validate(&self) -> Result<()> {
        if self.container_count == 0 || self.container_count > MAX_CONTAINERS {
            return invalid(format!(
                "container count must be between 1 and {}, got {}",
                MAX_CONTAINERS, self.container_count
            ));
        }
        if self.containers.len() != self.container_count {
            return invalid(format!(
                "container count {} does not match the {} declared containers",
                self.container_count,
                self.containers.len()
            ));
        }
        if self.network_count == 0 || self.network_count > MAX_NETWORKS {
            return invalid(format!(
                "network count must be between 1 and {}, got {}",
                MAX_NETWORKS, self.network_count
            ));
        }
        if self.networks.len() != self.network_count {
            return invalid(format!(
                "network count {} does not match the {} declared networks",
                self.network_count,
                self.networks.len()
            ));
        }

        let mut names = HashSet::new();
        for network in &self.networks {
            if network.name.trim().is_empty() {
                return invalid("network name cannot be empty".to_string());
            }
            if !names.insert(network.name.as_str()) {
                return invalid(format!("network {} is declared twice", network.name));
            }
        }

        let mut score = 0u32;
        let mut flag_ids = HashSet::new();
        for (index, container) in self.containers.iter().enumerate() {
            if container.image.trim().is_empty() {
                return invalid(format!("container {} has no image", index));
            }
            for reference in &container.networks {
                if !names.contains(reference.as_str()) {
                    return invalid(format!(
                        "container {} refers to undeclared network {}",
                        index, reference
                    ));
                }
            }
            for flag in &container.flags {
                if !flag.command.contains(FLAG_PLACEHOLDER) {
                    return invalid(format!("flag {} command does not use {}", flag.uuid, FLAG_PLACEHOLDER));
                }
                if !flag_ids.insert(flag.uuid.as_str()) {
                    return invalid(format!("flag {} is declared twice", flag.uuid));
                }
                score = score.saturating_add(flag.score);
            }
        }

        if score != self.total_score {
            return invalid(format!(
                "flag scores add up to {} but the total score is {}",
                score, self.total_score
            ));
        }
        Ok(())
    }
}

fn invalid(msg: String) -> Result<()> {
    Err(FleetError::InvalidServiceConfig(msg))
}

/// Request to create a service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceDefinition {
    pub name: String,
    #[serde(default)]
    pub owner_uid: String,
    #[serde(default)]
    pub module: String,
    pub config: ServiceConfig,
}

/// A generated flag
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceFlag {
    pub flag_uuid: String,
    pub flag: String,
}

/// A network created for a service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceNetwork {
    /// Logical name from the definition
    pub name: String,
    pub random_cidr: bool,
    pub network: Network,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Running,
    /// Recovered after a restart with some containers gone
    Degraded,
}

/// A running service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Service {
    pub id: String,
    pub name: String,
    pub owner_uid: String,
    pub containers: Vec<Container>,
    pub networks: Vec<ServiceNetwork>,
    pub flags: Vec<ServiceFlag>,
    pub status: ServiceStatus,
    pub created: DateTime<Utc>,
}
