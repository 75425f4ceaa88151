//! Connected worker nodes

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Resource usage reported by a node, every field in `[0, 1]` except the count
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub disk_usage: f64,
    pub network_usage: f64,
    pub container_count: usize,
    /// Running containers over the node's container limit
    pub container_usage: f64,
}

impl NodeStatus {
    /// Placement cost of a node; 1.0 means saturated
    pub fn demand(&self) -> f64 {
        if self.network_usage >= 0.9
            || self.cpu_usage >= 0.98
            || self.memory_usage >= 0.98
            || self.container_usage >= 1.0
        {
            return 1.0;
        }
        self.cpu_usage * 0.7 + self.memory_usage * 0.2 + self.container_usage * 0.1
    }
}

/// Liveness as judged from heartbeats
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Liveness {
    #[default]
    Active,
    /// Heartbeats are late; the node stays selectable
    Degraded,
}

/// Where a node's agent listens
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeEndpoint {
    pub id: String,
    pub address: String,
    pub port: u16,
}

impl NodeEndpoint {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.address, self.port)
    }
}

/// A connected node
#[derive(Debug, Clone)]
pub struct Node {
    pub endpoint: NodeEndpoint,
    /// Session token issued on connect
    pub token: String,
    pub connected_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    /// Monotonic time of the last heartbeat, used for supervision
    pub last_seen: Instant,
    /// Latest status push, if any
    pub status: Option<NodeStatus>,
    pub liveness: Liveness,
    /// Connection order, used to break demand ties
    pub(crate) sequence: u64,
}

impl Node {
    pub fn id(&self) -> &str {
        &self.endpoint.id
    }

    /// Demand, or `None` before the first status push
    pub fn demand(&self) -> Option<f64> {
        self.status.map(|s| s.demand())
    }
}

/// Serializable view of a node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSummary {
    pub id: String,
    pub address: String,
    pub port: u16,
    pub connected_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub status: Option<NodeStatus>,
    pub liveness: Liveness,
}

impl From<&Node> for NodeSummary {
    fn from(node: &Node) -> Self {
        Self {
            id: node.endpoint.id.clone(),
            address: node.endpoint.address.clone(),
            port: node.endpoint.port,
            connected_at: node.connected_at,
            last_heartbeat: node.last_heartbeat,
            status: node.status,
            liveness: node.liveness,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(cpu: f64, mem: f64, net: f64, containers: f64) -> NodeStatus {
        NodeStatus {
            cpu_usage: cpu,
            memory_usage: mem,
            network_usage: net,
            container_usage: containers,
            ..NodeStatus::default()
        }
    }

    #[test]
    fn test_demand_weights() {
        let demand = status(0.5, 0.5, 0.1, 0.5).demand();
        assert!((demand - 0.5).abs() < 1e-9);
        let demand = status(0.2, 0.4, 0.0, 0.1).demand();
        assert!((demand - 0.23).abs() < 1e-9);
    }

    #[test]
    fn test_saturation_thresholds() {
        assert_eq!(status(0.1, 0.1, 0.9, 0.1).demand(), 1.0);
        assert_eq!(status(0.98, 0.1, 0.0, 0.1).demand(), 1.0);
        assert_eq!(status(0.1, 0.98, 0.0, 0.1).demand(), 1.0);
        assert_eq!(status(0.1, 0.1, 0.0, 1.0).demand(), 1.0);
        assert!(status(0.97, 0.97, 0.89, 0.99).demand() < 1.0);
    }

    #[test]
    fn test_base_url() {
        let endpoint = NodeEndpoint {
            id: "n1".to_string(),
            address: "10.0.0.5".to_string(),
            port: 7879,
        };
        assert_eq!(endpoint.base_url(), "http://10.0.0.5:7879");
    }
}
