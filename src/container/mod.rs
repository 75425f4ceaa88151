//! Container management
//!
//! Launch requests, the orchestrator that drives the container runtime,
//! per-container usage monitors and network monitor containers.

pub mod config;
pub mod monitor;
pub mod network_monitor;
pub mod orchestrator;

pub use config::{parse_port_specs, Container, LaunchRequest, PortSpec, ResourceRequest, Usage};
pub use monitor::StatsTable;
pub use network_monitor::{NetworkMonitorManager, NetworkProbe, ProbeReport, ProbeResult};
pub use orchestrator::{ContainerOrchestrator, OrchestratorSettings, RuntimeEvent};
