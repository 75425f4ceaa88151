//! Messages exchanged between the server and its nodes
//!
//! Every reply is wrapped in an [`Envelope`]: `code` 0 carries `data`,
//! anything else carries an error `message`. Slow node actions answer with
//! [`Accepted`] handles that the caller polls through the matching `/check`
//! route.

use crate::container::NetworkProbe;
use crate::error::{FleetError, Result};
use crate::fleet::NodeStatus;
use crate::operation::Progress;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;

/// Route paths
pub mod routes {
    pub const CONNECT: &str = "/connect";
    pub const DISCONNECT: &str = "/disconnect";
    pub const HEARTBEAT: &str = "/heartbeat";
    pub const STATUS: &str = "/status";

    pub const CONTAINER_LAUNCH: &str = "/container/launch";
    pub const CONTAINER_LAUNCH_CHECK: &str = "/container/launch/check";
    pub const CONTAINER_STOP: &str = "/container/stop";
    pub const CONTAINER_REMOVE: &str = "/container/remove";
    pub const CONTAINER_LIST: &str = "/container/list";
    pub const CONTAINER_EXEC: &str = "/container/exec";
    pub const CONTAINER_INSPECT: &str = "/container/inspect";

    pub const NETWORK_CREATE: &str = "/network/create";
    pub const NETWORK_LIST: &str = "/network/list";
    pub const NETWORK_REMOVE: &str = "/network/remove";

    pub const IMAGE_LIST: &str = "/image/list";
    pub const IMAGE_PULL: &str = "/image/pull";
    pub const IMAGE_PULL_CHECK: &str = "/image/pull/check";
    pub const IMAGE_DELETE: &str = "/image/delete";

    pub const SERVICE_LAUNCH: &str = "/service/launch";
    pub const SERVICE_LAUNCH_CHECK: &str = "/service/launch/check";
    pub const SERVICE_STOP: &str = "/service/stop";
    pub const SERVICE_STOP_CHECK: &str = "/service/stop/check";
    pub const SERVICE_LIST: &str = "/service/list";

    pub const MONITOR_RUN: &str = "/network/monitor/run";
    pub const MONITOR_RUN_CHECK: &str = "/network/monitor/run/check";
    pub const MONITOR_STOP: &str = "/network/monitor/stop";
    pub const MONITOR_SCRIPT: &str = "/network/monitor/script";
}

/// Something that answers requests addressed by route
pub trait RouteHandler: Send + Sync {
    /// Handle one request. Blocking; async callers go through `spawn_blocking`.
    fn handle(&self, route: &str, body: Value) -> Result<Value>;
}

/// Reply wrapper
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub code: i32,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    pub const SUCCESS: i32 = 0;
    pub const FAILURE: i32 = -1;

    pub fn success(data: Value) -> Self {
        Self {
            code: Self::SUCCESS,
            message: "success".to_string(),
            data,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            code: Self::FAILURE,
            message: message.into(),
            data: Value::Null,
        }
    }

    pub fn from_result(result: Result<Value>) -> Self {
        match result {
            Ok(data) => Self::success(data),
            Err(e) => Self::error(e.to_string()),
        }
    }

    /// Unwrap the data of a successful reply
    pub fn into_result(self) -> Result<Value> {
        if self.code == Self::SUCCESS {
            Ok(self.data)
        } else {
            Err(FleetError::Transport(format!("remote error: {}", self.message)))
        }
    }
}

/// Deserialize a request or reply body
pub fn decode<T: DeserializeOwned>(value: Value) -> Result<T> {
    Ok(serde_json::from_value(value)?)
}

/// Serialize a request or reply body
pub fn encode<T: Serialize>(value: &T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

/// A node-addressed request; every node route expects the node's own ID
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientRequest<T> {
    pub client_id: String,
    #[serde(flatten)]
    pub body: T,
}

impl<T> ClientRequest<T> {
    pub fn new(client_id: &str, body: T) -> Self {
        Self {
            client_id: client_id.to_string(),
            body,
        }
    }
}

/// Body of routes that take nothing beyond the node ID
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Empty {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectRequest {
    pub client_id: String,
    pub client_ip: String,
    pub client_port: u16,
}

/// Reply to `/connect`; both fields are empty when the node was already connected
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectReply {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_token: String,
}

impl ConnectReply {
    pub fn is_empty(&self) -> bool {
        self.client_token.is_empty()
    }
}

/// Body of `/heartbeat` and `/disconnect`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRef {
    pub client_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatReply {
    pub client_id: String,
    /// Server time, seconds since the epoch
    pub timestamp: i64,
}

/// Body of `/status`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub client_id: String,
    #[serde(flatten)]
    pub status: NodeStatus,
}

/// Handles of a started operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Accepted {
    /// Handle carrying progress text
    pub response_id: String,
    /// Separate completion handle, for actions that stream progress
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_response_id: Option<String>,
}

impl Accepted {
    pub fn single(response_id: String) -> Self {
        Self {
            response_id,
            finish_response_id: None,
        }
    }

    pub fn pair((response_id, finish_response_id): (String, String)) -> Self {
        Self {
            response_id,
            finish_response_id: Some(finish_response_id),
        }
    }

    pub fn check(&self) -> CheckRequest {
        CheckRequest {
            response_id: self.response_id.clone(),
            finish_response_id: self.finish_response_id.clone(),
        }
    }
}

/// Body of the `/check` routes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckRequest {
    pub response_id: String,
    #[serde(default)]
    pub finish_response_id: Option<String>,
}

/// Reply of the `/check` routes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollReply {
    #[serde(default)]
    pub message: String,
    pub finished: bool,
    #[serde(default)]
    pub payload: Value,
}

impl From<Progress> for PollReply {
    fn from(progress: Progress) -> Self {
        match progress {
            Progress::Running { message } => Self {
                message,
                finished: false,
                payload: Value::Null,
            },
            Progress::Finished { payload } => Self {
                message: String::new(),
                finished: true,
                payload,
            },
        }
    }
}

impl PollReply {
    pub fn into_progress(self) -> Progress {
        if self.finished {
            Progress::Finished { payload: self.payload }
        } else {
            Progress::Running { message: self.message }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerRef {
    pub container_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecCommand {
    pub container_id: String,
    pub command: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub image: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRef {
    pub service_id: String,
}

/// Network by name or ID
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkRef {
    pub network: String,
}

/// Body of `/network/monitor/run`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorRun {
    pub network_name: String,
    /// Build context on the node's filesystem
    pub context_dir: PathBuf,
}

/// Body of `/network/monitor/script`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeSet {
    pub probes: Vec<NetworkProbe>,
}
