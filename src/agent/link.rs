//! Node-to-server connection loop
//!
//! A node connects, then pushes its status on one cadence and heartbeats on
//! another. When every heartbeat attempt of a round fails, the session ends
//! and the node reconnects after a delay.

use super::probe::{round2, CpuSmoother, HostProbe};
use crate::config::NodeConfig;
use crate::container::ContainerOrchestrator;
use crate::error::{FleetError, Result};
use crate::fleet::NodeStatus;
use crate::http::post_json;
use crate::protocol::{
    decode, encode, routes, ConnectReply, ConnectRequest, HeartbeatReply, NodeRef, RouteHandler,
    StatusReport,
};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Delivers node requests to the control node
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn call(&self, route: &str, body: Value) -> Result<Value>;
}

/// Control node reached over HTTP
pub struct HttpControlPlane {
    client: reqwest::Client,
    base_url: String,
}

impl HttpControlPlane {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FleetError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    async fn call(&self, route: &str, body: Value) -> Result<Value> {
        post_json(&self.client, &format!("{}{}", self.base_url, route), &body).await
    }
}

/// Control node in the same process
pub struct LocalControlPlane {
    server: Arc<dyn RouteHandler>,
}

impl LocalControlPlane {
    pub fn new(server: Arc<dyn RouteHandler>) -> Self {
        Self { server }
    }
}

#[async_trait]
impl ControlPlane for LocalControlPlane {
    async fn call(&self, route: &str, body: Value) -> Result<Value> {
        let server = self.server.clone();
        let route = route.to_string();
        tokio::task::spawn_blocking(move || server.handle(&route, body))
            .await
            .map_err(|e| FleetError::Internal(format!("control plane call panicked: {}", e)))?
    }
}

/// Produces the status snapshots a node pushes
pub struct StatusReporter {
    probe: Mutex<Box<dyn HostProbe>>,
    cpu: Mutex<Option<CpuSmoother>>,
    containers: Arc<ContainerOrchestrator>,
    max_containers: usize,
}

impl StatusReporter {
    pub fn new(probe: Box<dyn HostProbe>, containers: Arc<ContainerOrchestrator>, max_containers: usize) -> Self {
        Self {
            probe: Mutex::new(probe),
            cpu: Mutex::new(None),
            containers,
            max_containers: max_containers.max(1),
        }
    }

    /// Take a reading; CPU is the mean of the recent window
    pub fn snapshot(&self) -> Result<NodeStatus> {
        let sample = self
            .probe
            .lock()
            .map_err(|_| FleetError::Lock("Failed to acquire probe lock".to_string()))?
            .sample();
        let cpu_usage = {
            let mut cpu = self
                .cpu
                .lock()
                .map_err(|_| FleetError::Lock("Failed to acquire cpu window lock".to_string()))?;
            // the first reading fills the whole window
            cpu.get_or_insert_with(|| CpuSmoother::new(sample.cpu_usage))
                .push(sample.cpu_usage)
        };

        let container_count = match self.containers.container_count() {
            Ok(count) => count,
            Err(e) => {
                tracing::warn!("Failed to count containers: {}", e);
                0
            }
        };

        Ok(NodeStatus {
            cpu_usage: round2(cpu_usage),
            memory_usage: round2(sample.memory_usage),
            disk_usage: round2(sample.disk_usage),
            network_usage: round2(sample.network_usage),
            container_count,
            container_usage: round2(container_count as f64 / self.max_containers as f64),
        })
    }
}

/// Timings of the connection loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkSettings {
    pub status_interval: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_attempts: u32,
    pub reconnect_delay: Duration,
    /// Largest tolerated difference between server and node clocks, in seconds
    pub max_clock_skew_secs: i64,
}

impl From<&NodeConfig> for LinkSettings {
    fn from(config: &NodeConfig) -> Self {
        Self {
            status_interval: Duration::from_secs(config.status_interval_secs),
            heartbeat_interval: Duration::from_secs(config.heartbeat_interval_secs),
            heartbeat_attempts: config.heartbeat_attempts.max(1),
            reconnect_delay: Duration::from_secs(config.reconnect_delay_secs),
            max_clock_skew_secs: config.max_clock_skew_secs,
        }
    }
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self::from(&NodeConfig::default())
    }
}

/// A node's session with the control node
pub struct NodeLink {
    plane: Arc<dyn ControlPlane>,
    reporter: Arc<StatusReporter>,
    client_id: String,
    address: String,
    port: u16,
    settings: LinkSettings,
    token: Mutex<Option<String>>,
}

impl NodeLink {
    pub fn new(
        plane: Arc<dyn ControlPlane>,
        reporter: Arc<StatusReporter>,
        config: &NodeConfig,
    ) -> Self {
        Self {
            plane,
            reporter,
            client_id: config.client_id.clone(),
            address: config.address.clone(),
            port: config.port,
            settings: LinkSettings::from(config),
            token: Mutex::new(None),
        }
    }

    pub fn with_settings(mut self, settings: LinkSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Token of the current session
    pub fn token(&self) -> Option<String> {
        self.token.lock().ok().and_then(|t| t.clone())
    }

    fn set_token(&self, token: Option<String>) {
        if let Ok(mut current) = self.token.lock() {
            *current = token;
        }
    }

    /// One connect attempt; `Ok(false)` when the server refused the session
    pub async fn connect(&self) -> Result<bool> {
        let request = ConnectRequest {
            client_id: self.client_id.clone(),
            client_ip: self.address.clone(),
            client_port: self.port,
        };
        let reply: ConnectReply = decode(self.plane.call(routes::CONNECT, encode(&request)?).await?)?;
        if reply.is_empty() {
            tracing::error!("Failed to connect to server: token is empty");
            return Ok(false);
        }
        if reply.client_id != self.client_id {
            tracing::error!("Failed to connect to server: client id is not matched");
            return Ok(false);
        }
        self.set_token(Some(reply.client_token));
        tracing::info!("Connected to server as {}", self.client_id);
        Ok(true)
    }

    /// One heartbeat; a wrong ID or a skewed server clock counts as a failure
    pub async fn heartbeat(&self) -> Result<()> {
        let request = NodeRef {
            client_id: self.client_id.clone(),
        };
        let reply: HeartbeatReply = decode(self.plane.call(routes::HEARTBEAT, encode(&request)?).await?)?;
        if reply.client_id != self.client_id {
            return Err(FleetError::Node("heartbeat answered for another client".to_string()));
        }
        let skew = (Utc::now().timestamp() - reply.timestamp).abs();
        if skew > self.settings.max_clock_skew_secs {
            return Err(FleetError::Node(format!(
                "server clock is {}s away, server may be down",
                skew
            )));
        }
        tracing::debug!("Heartbeat acknowledged");
        Ok(())
    }

    /// Push one status snapshot
    pub async fn push_status(&self) -> Result<()> {
        let reporter = self.reporter.clone();
        let status = tokio::task::spawn_blocking(move || reporter.snapshot())
            .await
            .map_err(|e| FleetError::Internal(format!("status probe panicked: {}", e)))??;
        let report = StatusReport {
            client_id: self.client_id.clone(),
            status,
        };
        self.plane.call(routes::STATUS, encode(&report)?).await?;
        Ok(())
    }

    /// Up to `heartbeat_attempts` heartbeats; true once one succeeds
    async fn beat(&self) -> bool {
        for attempt in 1..=self.settings.heartbeat_attempts {
            match self.heartbeat().await {
                Ok(()) => return true,
                Err(e) => tracing::error!(
                    "Failed to send heartbeat (attempt {}/{}): {}",
                    attempt,
                    self.settings.heartbeat_attempts,
                    e
                ),
            }
        }
        false
    }

    /// Run a connected session until heartbeats fail
    pub async fn session(&self) {
        let status = async {
            let mut ticker = tokio::time::interval(self.settings.status_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = self.push_status().await {
                    tracing::warn!("Failed to upload status to server: {}", e);
                }
            }
        };
        let heartbeats = async {
            while self.beat().await {
                tokio::time::sleep(self.settings.heartbeat_interval).await;
            }
        };

        tokio::select! {
            _ = status => {}
            _ = heartbeats => {}
        }
        self.set_token(None);
        tracing::warn!("Heartbeat failed, reconnecting");
    }

    /// Connect, hold the session, and reconnect forever
    pub async fn run(self: Arc<Self>) {
        loop {
            match self.connect().await {
                Ok(true) => self.session().await,
                Ok(false) => {}
                Err(e) => tracing::error!("Failed to connect to server: {}", e),
            }
            tokio::time::sleep(self.settings.reconnect_delay).await;
        }
    }

    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}
