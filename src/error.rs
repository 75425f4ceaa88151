//! Error types for Flotilla

use thiserror::Error;

/// Result type for Flotilla operations
pub type Result<T> = std::result::Result<T, FleetError>;

/// Flotilla error types
#[derive(Error, Debug)]
pub enum FleetError {
    #[error("Container error: {0}")]
    Container(String),

    #[error("Container not found: {0}")]
    ContainerNotFound(String),

    #[error("Image error: {0}")]
    Image(String),

    #[error("Image not found: {0}")]
    ImageNotFound(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Network not found: {0}")]
    NetworkNotFound(String),

    #[error("Address pool exhausted")]
    PoolExhausted,

    #[error("Invalid CIDR expression '{expr}': {reason}")]
    CidrParse { expr: String, reason: String },

    #[error("Invalid port specification: {0}")]
    InvalidPortSpec(String),

    #[error("Service error: {0}")]
    Service(String),

    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error("Invalid service configuration: {0}")]
    InvalidServiceConfig(String),

    #[error("Teardown of {id} finished with {} failure(s): {}", .failures.len(), .failures.join("; "))]
    Teardown { id: String, failures: Vec<String> },

    #[error("Node error: {0}")]
    Node(String),

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Node already connected: {0}")]
    NodeExists(String),

    #[error("No node available")]
    NoNodeAvailable,

    #[error("Operation not found: {0}")]
    OperationNotFound(String),

    #[error("Operation failed: {0}")]
    OperationFailed(String),

    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error("Proxy error: {0}")]
    Proxy(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl FleetError {
    /// Whether this error reports a missing resource
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            FleetError::ContainerNotFound(_)
                | FleetError::ImageNotFound(_)
                | FleetError::NetworkNotFound(_)
                | FleetError::ServiceNotFound(_)
                | FleetError::NodeNotFound(_)
                | FleetError::OperationNotFound(_)
        )
    }
}

impl From<serde_yaml::Error> for FleetError {
    fn from(err: serde_yaml::Error) -> Self {
        FleetError::Yaml(err.to_string())
    }
}

impl From<reqwest::Error> for FleetError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FleetError::Timeout(err.to_string())
        } else {
            FleetError::Transport(err.to_string())
        }
    }
}
