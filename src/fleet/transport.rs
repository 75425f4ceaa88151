//! Server-to-node calls

use super::node::NodeEndpoint;
use crate::error::{FleetError, Result};
use crate::http::post_json;
use crate::protocol::RouteHandler;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Delivers a request to the agent of a node
#[async_trait]
pub trait NodeTransport: Send + Sync {
    async fn call(&self, node: &NodeEndpoint, route: &str, body: Value) -> Result<Value>;
}

/// Reaches agents over HTTP
pub struct HttpNodeTransport {
    client: reqwest::Client,
}

impl HttpNodeTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FleetError::Transport(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl NodeTransport for HttpNodeTransport {
    async fn call(&self, node: &NodeEndpoint, route: &str, body: Value) -> Result<Value> {
        let url = format!("{}{}", node.base_url(), route);
        tracing::debug!("POST {} for node {}", url, node.id);
        post_json(&self.client, &url, &body).await
    }
}

/// Reaches in-process agents, keyed by node ID
#[derive(Default)]
pub struct LocalTransport {
    agents: RwLock<HashMap<String, Arc<dyn RouteHandler>>>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, node_id: &str, agent: Arc<dyn RouteHandler>) -> Result<()> {
        self.agents
            .write()
            .map_err(|_| FleetError::Lock("Failed to acquire transport lock".to_string()))?
            .insert(node_id.to_string(), agent);
        Ok(())
    }

    pub fn unregister(&self, node_id: &str) -> bool {
        self.agents
            .write()
            .map(|mut agents| agents.remove(node_id).is_some())
            .unwrap_or(false)
    }
}

#[async_trait]
impl NodeTransport for LocalTransport {
    async fn call(&self, node: &NodeEndpoint, route: &str, body: Value) -> Result<Value> {
        let agent = self
            .agents
            .read()
            .map_err(|_| FleetError::Lock("Failed to acquire transport lock".to_string()))?
            .get(&node.id)
            .cloned()
            .ok_or_else(|| FleetError::Transport(format!("node {} is unreachable", node.id)))?;
        let route = route.to_string();
        tokio::task::spawn_blocking(move || agent.handle(&route, body))
            .await
            .map_err(|e| FleetError::Internal(format!("agent call panicked: {}", e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Fixed(Value);

    impl RouteHandler for Fixed {
        fn handle(&self, route: &str, _body: Value) -> Result<Value> {
            Ok(json!({ "route": route, "value": self.0 }))
        }
    }

    fn endpoint(id: &str) -> NodeEndpoint {
        NodeEndpoint {
            id: id.to_string(),
            address: "127.0.0.1".to_string(),
            port: 0,
        }
    }

    #[tokio::test]
    async fn test_local_transport_routes_by_node() {
        let transport = LocalTransport::new();
        transport.register("a", Arc::new(Fixed(json!(1)))).unwrap();
        transport.register("b", Arc::new(Fixed(json!(2)))).unwrap();

        let reply = transport.call(&endpoint("b"), "/x", Value::Null).await.unwrap();
        assert_eq!(reply, json!({"route": "/x", "value": 2}));

        assert!(transport.unregister("a"));
        assert!(matches!(
            transport.call(&endpoint("a"), "/x", Value::Null).await,
            Err(FleetError::Transport(_))
        ));
    }
}
