//! Flotilla configuration
//!
//! Every section has a complete default, so a configuration file only needs
//! to carry the values that differ from them.

use crate::error::{FleetError, Result};
use crate::network::pool::parse_range_expression;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    /// Directory for persisted metadata
    pub data_dir: PathBuf,
    /// Control-node settings
    pub server: ServerConfig,
    /// Worker-node settings
    pub node: NodeConfig,
    /// Image retention policy
    pub images: ImagePolicy,
    /// Long-running operation bookkeeping
    pub operations: OperationConfig,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            data_dir: Self::default_data_dir(),
            server: ServerConfig::default(),
            node: NodeConfig::default(),
            images: ImagePolicy::default(),
            operations: OperationConfig::default(),
        }
    }
}

impl FleetConfig {
    /// Load configuration from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: FleetConfig = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Default metadata directory
    pub fn default_data_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("flotilla")
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if self.server.degrade_after_secs >= self.server.evict_after_secs {
            return Err(FleetError::InvalidConfig(
                "degrade_after_secs must be lower than evict_after_secs".to_string(),
            ));
        }
        if self.server.check_interval_secs == 0 || self.server.poll_interval_ms == 0 {
            return Err(FleetError::InvalidConfig(
                "supervision and poll intervals must be non-zero".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.images.disk_threshold) {
            return Err(FleetError::InvalidConfig(format!(
                "disk_threshold must be within [0, 1], got {}",
                self.images.disk_threshold
            )));
        }
        if self.node.max_containers == 0 {
            return Err(FleetError::InvalidConfig(
                "max_containers must be at least 1".to_string(),
            ));
        }
        if self.operations.remainder == 0 {
            return Err(FleetError::InvalidConfig(
                "operation remainder must be at least 1".to_string(),
            ));
        }
        parse_range_expression(&self.node.cidr)?;
        Ok(())
    }
}

/// Control-node settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the control node is reachable on
    pub listen: String,
    /// Supervisor tick
    pub check_interval_secs: u64,
    /// Heartbeat silence after which a node loses priority
    pub degrade_after_secs: u64,
    /// Heartbeat silence after which a node is removed
    pub evict_after_secs: u64,
    /// Cadence of operation polls
    pub poll_interval_ms: u64,
    /// How long a caller waits for a node operation
    pub operation_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:7878".to_string(),
            check_interval_secs: 30,
            degrade_after_secs: 40,
            evict_after_secs: 90,
            poll_interval_ms: 1000,
            operation_timeout_secs: 600,
        }
    }
}

impl ServerConfig {
    /// Supervisor timings
    pub fn supervision(&self) -> Supervision {
        Supervision {
            check_interval: Duration::from_secs(self.check_interval_secs),
            degrade_after: Duration::from_secs(self.degrade_after_secs),
            evict_after: Duration::from_secs(self.evict_after_secs),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }
}

/// Timings that drive node supervision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Supervision {
    pub check_interval: Duration,
    pub degrade_after: Duration,
    pub evict_after: Duration,
}

impl Default for Supervision {
    fn default() -> Self {
        ServerConfig::default().supervision()
    }
}

/// Worker-node settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Shared identifier the control node presents on every call
    pub client_id: String,
    /// Address this node advertises
    pub address: String,
    /// Port this node advertises
    pub port: u16,
    /// Base URL of the control node
    pub server_url: String,
    /// Container capacity used for container_usage
    pub max_containers: u32,
    /// DNS servers for launched containers
    pub dns: Vec<String>,
    /// Bracket-range expression for the address pool
    pub cidr: String,
    /// Link bandwidth used to turn byte counters into a usage fraction
    pub link_capacity_bytes: u64,
    pub status_interval_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub heartbeat_attempts: u32,
    pub reconnect_delay_secs: u64,
    /// Clock skew beyond which the control node is considered down
    pub max_clock_skew_secs: i64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            address: gethostname::gethostname().to_string_lossy().into_owned(),
            port: 7879,
            server_url: "http://127.0.0.1:7878".to_string(),
            max_containers: 20,
            dns: vec!["8.8.8.8".to_string()],
            cidr: "172.[128-255].0.0/24".to_string(),
            link_capacity_bytes: 125_000_000,
            status_interval_secs: 10,
            heartbeat_interval_secs: 30,
            heartbeat_attempts: 3,
            reconnect_delay_secs: 5,
            max_clock_skew_secs: 90,
        }
    }
}

/// Image retention policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImagePolicy {
    /// Days an unused image is kept
    pub retention_days: i64,
    /// Disk usage fraction that triggers eviction
    pub disk_threshold: f64,
    /// Minimum time between eviction sweeps
    pub eviction_interval_secs: u64,
}

impl Default for ImagePolicy {
    fn default() -> Self {
        Self {
            retention_days: 30,
            disk_threshold: 0.8,
            eviction_interval_secs: 3600,
        }
    }
}

impl ImagePolicy {
    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.retention_days)
    }

    pub fn eviction_interval(&self) -> Duration {
        Duration::from_secs(self.eviction_interval_secs)
    }
}

/// Long-running operation bookkeeping
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OperationConfig {
    /// Sweep cadence
    pub sweep_interval_secs: u64,
    /// Sweeps a finished operation survives
    pub remainder: u32,
}

impl Default for OperationConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 30,
            remainder: 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = FleetConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.supervision().evict_after, Duration::from_secs(90));
        assert_eq!(config.images.retention(), chrono::Duration::days(30));
    }

    #[test]
    fn test_load_partial_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "node:\n  client_id: shared\n  cidr: \"10.[0-3].0.0/24\"\nimages:\n  retention_days: 7\n"
        )
        .unwrap();

        let config = FleetConfig::load(file.path()).unwrap();
        assert_eq!(config.node.client_id, "shared");
        assert_eq!(config.node.cidr, "10.[0-3].0.0/24");
        assert_eq!(config.images.retention_days, 7);
        assert_eq!(config.node.max_containers, 20);
        assert_eq!(config.server.check_interval_secs, 30);
    }

    #[test]
    fn test_rejects_bad_cidr() {
        let mut config = FleetConfig::default();
        config.node.cidr = "10.[5-1].0.0/24".to_string();
        assert!(matches!(config.validate(), Err(FleetError::CidrParse { .. })));
    }

    #[test]
    fn test_rejects_inverted_supervision() {
        let mut config = FleetConfig::default();
        config.server.degrade_after_secs = 120;
        assert!(config.validate().is_err());
    }
}
