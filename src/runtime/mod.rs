//! Container runtime contract
//!
//! Everything above this module talks to the engine through
//! [`ContainerRuntime`]. Calls are blocking; callers run them on worker
//! threads.

pub mod local;

use crate::error::Result;
use crate::network::{Network, NetworkSpec};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

pub use local::{Fault, LocalRuntime};

/// Image as reported by the runtime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageInfo {
    /// Image ID
    pub id: String,
    /// Repository tags
    pub tags: Vec<String>,
    /// Parent image ID
    pub parent_id: Option<String>,
    /// Size in bytes
    pub size: u64,
    /// Creation time
    pub created: DateTime<Utc>,
}

impl ImageInfo {
    /// Primary name, falling back to the ID for untagged images
    pub fn name(&self) -> &str {
        self.tags.first().map(|t| t.as_str()).unwrap_or(&self.id)
    }
}

/// Limits applied to a container
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// CPU quota in units of 1e-9 CPUs
    pub nano_cpus: i64,
    /// Memory ceiling in bytes
    pub memory_bytes: i64,
    /// Block IO weight (10-1000)
    pub blkio_weight: u16,
}

/// Container creation request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerSpec {
    /// Container name
    pub name: String,
    /// Image name or ID
    pub image: String,
    /// Environment in KEY=VALUE form
    pub env: Vec<String>,
    /// Container labels
    pub labels: HashMap<String, String>,
    /// Network joined at creation
    pub network_mode: String,
    /// Resource limits
    pub limits: ResourceLimits,
    /// DNS servers
    pub dns: Vec<String>,
}

/// Container as reported by the runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerInfo {
    /// Container ID
    pub id: String,
    /// Container name
    pub name: String,
    /// Image the container was created from
    pub image: String,
    /// Container labels
    pub labels: HashMap<String, String>,
    /// Whether the container is running
    pub running: bool,
    /// Network name to IPv4 address
    pub networks: HashMap<String, String>,
    /// Applied limits
    pub limits: ResourceLimits,
    /// Creation time
    pub created: DateTime<Utc>,
}

/// One raw resource-usage sample
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsSample {
    pub cpu_total: u64,
    pub precpu_total: u64,
    pub system_total: u64,
    pub presystem_total: u64,
    pub online_cpus: u32,
    pub memory_usage: u64,
    pub memory_limit: u64,
}

/// Result of a command run inside a container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub output: String,
}

/// Stream of usage samples that ends with the container
pub type StatsStream = Box<dyn Iterator<Item = StatsSample> + Send>;

/// Operations the orchestrators need from a container engine
pub trait ContainerRuntime: Send + Sync {
    /// Look up an image by name or ID
    fn inspect_image(&self, reference: &str) -> Result<Option<ImageInfo>>;

    /// Pull an image, reporting progress lines
    fn pull_image(&self, reference: &str, progress: &mut dyn FnMut(&str)) -> Result<()>;

    /// Build an image from a context directory
    fn build_image(&self, tag: &str, context: &Path, progress: &mut dyn FnMut(&str)) -> Result<ImageInfo>;

    fn list_images(&self) -> Result<Vec<ImageInfo>>;

    /// Remove an image, returning the IDs actually deleted
    fn remove_image(&self, id: &str, force: bool, prune_children: bool) -> Result<Vec<String>>;

    /// Fraction of runtime storage in use
    fn disk_usage(&self) -> Result<f64>;

    fn create_container(&self, spec: &ContainerSpec) -> Result<String>;

    fn start_container(&self, id: &str) -> Result<()>;

    fn stop_container(&self, id: &str) -> Result<()>;

    fn remove_container(&self, id: &str, force: bool) -> Result<()>;

    fn inspect_container(&self, id: &str) -> Result<ContainerInfo>;

    fn list_containers(&self) -> Result<Vec<ContainerInfo>>;

    /// Run a command inside a running container
    fn exec(&self, id: &str, command: &[String]) -> Result<ExecOutput>;

    /// Stream usage samples until the container goes away
    fn stats(&self, id: &str) -> Result<StatsStream>;

    fn create_network(&self, spec: &NetworkSpec) -> Result<String>;

    /// Look up a network by name or ID
    fn inspect_network(&self, reference: &str) -> Result<Network>;

    fn list_networks(&self) -> Result<Vec<Network>>;

    fn remove_network(&self, reference: &str) -> Result<()>;

    fn connect_network(&self, network: &str, container: &str) -> Result<()>;

    fn disconnect_network(&self, network: &str, container: &str) -> Result<()>;
}
