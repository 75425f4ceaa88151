//! Multi-container services with injected flags

pub mod config;
pub mod orchestrator;

pub use config::{
    ContainerDecl, FlagSpec, NetworkDecl, Service, ServiceConfig, ServiceDefinition, ServiceFlag,
    ServiceNetwork, ServiceStatus,
};
pub use orchestrator::ServiceOrchestrator;
