//! Server-side table of connected nodes
//!
//! Each node gets a supervisor task on connect. The supervisor wakes every
//! `check_interval`; a node silent for longer than `degrade_after` is marked
//! degraded, and one silent for longer than `evict_after` is dropped along
//! with its container placements.

use super::node::{Liveness, Node, NodeEndpoint, NodeStatus, NodeSummary};
use crate::config::Supervision;
use crate::container::Container;
use crate::error::{FleetError, Result};
use crate::events::EventBus;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

/// Why a node left the fleet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    Requested,
    HeartbeatTimeout,
}

/// Node and placement events
#[derive(Debug, Clone)]
pub enum FleetEvent {
    NodeConnected(NodeEndpoint),
    NodeDisconnected { id: String, reason: DisconnectReason },
    Heartbeat { id: String, status: Option<NodeStatus> },
    ContainerLaunched { node_id: String, container: Container },
    ContainerStopped { node_id: String, container_id: String },
}

/// Outcome of a liveness check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Healthy,
    Degraded,
    /// The node was removed
    Expired,
}

/// A container and the node running it
#[derive(Debug, Clone)]
pub struct PlacedContainer {
    pub node_id: String,
    pub container: Container,
}

#[derive(Default)]
struct RegistryState {
    nodes: HashMap<String, Node>,
    next_sequence: u64,
}

/// Connected nodes, their health and where containers run
pub struct NodeRegistry {
    state: Mutex<RegistryState>,
    placements: Mutex<HashMap<String, PlacedContainer>>,
    events: EventBus<FleetEvent>,
    supervision: Supervision,
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new(Supervision::default())
    }
}

impl NodeRegistry {
    pub fn new(supervision: Supervision) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            placements: Mutex::new(HashMap::new()),
            events: EventBus::new(),
            supervision,
        }
    }

    pub fn events(&self) -> &EventBus<FleetEvent> {
        &self.events
    }

    fn lock_state(&self) -> Result<std::sync::MutexGuard<'_, RegistryState>> {
        self.state
            .lock()
            .map_err(|_| FleetError::Lock("Failed to acquire node registry lock".to_string()))
    }

    fn lock_placements(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, PlacedContainer>>> {
        self.placements
            .lock()
            .map_err(|_| FleetError::Lock("Failed to acquire placement lock".to_string()))
    }

    /// Register a node and issue its session token.
    ///
    /// Inside a tokio runtime this also starts the node's supervisor.
    pub fn connect(self: &Arc<Self>, id: &str, address: &str, port: u16) -> Result<String> {
        let token = Uuid::new_v4().to_string();
        let endpoint = NodeEndpoint {
            id: id.to_string(),
            address: address.to_string(),
            port,
        };
        {
            let mut state = self.lock_state()?;
            if state.nodes.contains_key(id) {
                tracing::warn!("Node {} is already connected, ignoring", id);
                return Err(FleetError::NodeExists(id.to_string()));
            }
            let now = Utc::now();
            let sequence = state.next_sequence;
            state.next_sequence += 1;
            state.nodes.insert(
                id.to_string(),
                Node {
                    endpoint: endpoint.clone(),
                    token: token.clone(),
                    connected_at: now,
                    last_heartbeat: now,
                    last_seen: Instant::now(),
                    status: None,
                    liveness: Liveness::Active,
                    sequence,
                },
            );
        }

        tracing::info!("Node {} connected from {}:{}", id, address, port);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(supervise(Arc::downgrade(self), id.to_string(), token.clone()));
        }
        self.events.emit(&FleetEvent::NodeConnected(endpoint));
        Ok(token)
    }

    /// Record a heartbeat and return the server time
    pub fn heartbeat(&self, id: &str) -> Result<DateTime<Utc>> {
        let now = Utc::now();
        let status = {
            let mut state = self.lock_state()?;
            let node = state
                .nodes
                .get_mut(id)
                .ok_or_else(|| FleetError::NodeNotFound(id.to_string()))?;
            node.last_heartbeat = now;
            node.last_seen = Instant::now();
            node.liveness = Liveness::Active;
            node.status
        };
        self.events.emit(&FleetEvent::Heartbeat {
            id: id.to_string(),
            status,
        });
        Ok(now)
    }

    /// Store the latest status snapshot of a node
    pub fn push_status(&self, id: &str, status: NodeStatus) -> Result<()> {
        let mut state = self.lock_state()?;
        let node = state
            .nodes
            .get_mut(id)
            .ok_or_else(|| FleetError::NodeNotFound(id.to_string()))?;
        tracing::debug!(
            "Node {} status: cpu {:.2} mem {:.2} net {:.2} containers {}",
            id,
            status.cpu_usage,
            status.memory_usage,
            status.network_usage,
            status.container_count
        );
        node.status = Some(status);
        Ok(())
    }

    /// Remove a node at its own request
    pub fn disconnect(&self, id: &str) -> Result<()> {
        self.remove(id, DisconnectReason::Requested)
    }

    fn remove(&self, id: &str, reason: DisconnectReason) -> Result<()> {
        self.lock_state()?
            .nodes
            .remove(id)
            .ok_or_else(|| FleetError::NodeNotFound(id.to_string()))?;
        let flushed = self.flush_containers(id)?;
        tracing::info!("Node {} disconnected ({:?}), {} placement(s) dropped", id, reason, flushed);
        self.events.emit(&FleetEvent::NodeDisconnected {
            id: id.to_string(),
            reason,
        });
        Ok(())
    }

    /// Judge a node's heartbeat silence as of `now`, removing it when expired
    pub fn check_liveness(&self, id: &str, now: Instant) -> Result<Health> {
        let silence = {
            let mut state = self.lock_state()?;
            let node = state
                .nodes
                .get_mut(id)
                .ok_or_else(|| FleetError::NodeNotFound(id.to_string()))?;
            let silence = now.saturating_duration_since(node.last_seen);
            if silence <= self.supervision.evict_after {
                if silence > self.supervision.degrade_after {
                    if node.liveness == Liveness::Active {
                        tracing::warn!(
                            "Node {} has not sent a heartbeat for {}s, lowering its priority",
                            id,
                            silence.as_secs()
                        );
                    }
                    node.liveness = Liveness::Degraded;
                    return Ok(Health::Degraded);
                }
                node.liveness = Liveness::Active;
                return Ok(Health::Healthy);
            }
            silence
        };

        tracing::warn!("Node {} silent for {}s, removing it", id, silence.as_secs());
        self.remove(id, DisconnectReason::HeartbeatTimeout)?;
        Ok(Health::Expired)
    }

    fn token_of(&self, id: &str) -> Option<String> {
        self.state
            .lock()
            .ok()?
            .nodes
            .get(id)
            .map(|n| n.token.clone())
    }

    pub fn get(&self, id: &str) -> Result<Node> {
        self.lock_state()?
            .nodes
            .get(id)
            .cloned()
            .ok_or_else(|| FleetError::NodeNotFound(id.to_string()))
    }

    pub fn endpoint(&self, id: &str) -> Result<NodeEndpoint> {
        Ok(self.get(id)?.endpoint)
    }

    /// Nodes in connection order
    pub fn list(&self) -> Result<Vec<NodeSummary>> {
        let state = self.lock_state()?;
        let mut nodes: Vec<&Node> = state.nodes.values().collect();
        nodes.sort_by_key(|n| n.sequence);
        Ok(nodes.into_iter().map(NodeSummary::from).collect())
    }

    pub fn len(&self) -> usize {
        self.state.lock().map(|s| s.nodes.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Node with the strictly lowest demand; ties go to the earlier connection.
    ///
    /// Nodes that have not reported status yet are skipped.
    pub fn select_lowest_demand(&self) -> Result<NodeEndpoint> {
        let state = self.lock_state()?;
        let mut nodes: Vec<&Node> = state.nodes.values().collect();
        nodes.sort_by_key(|n| n.sequence);

        let mut best: Option<(f64, &Node)> = None;
        for node in nodes {
            let Some(demand) = node.demand() else { continue };
            match best {
                Some((lowest, _)) if demand >= lowest => {}
                _ => best = Some((demand, node)),
            }
        }
        best.map(|(_, node)| node.endpoint.clone())
            .ok_or(FleetError::NoNodeAvailable)
    }

    /// Remember that a container runs on a node
    pub fn record_container(&self, node_id: &str, container: Container) -> Result<()> {
        self.lock_placements()?.insert(
            container.id.clone(),
            PlacedContainer {
                node_id: node_id.to_string(),
                container: container.clone(),
            },
        );
        self.events.emit(&FleetEvent::ContainerLaunched {
            node_id: node_id.to_string(),
            container,
        });
        Ok(())
    }

    /// Node running a container
    pub fn locate_container(&self, container_id: &str) -> Result<String> {
        self.lock_placements()?
            .get(container_id)
            .map(|p| p.node_id.clone())
            .ok_or_else(|| FleetError::ContainerNotFound(container_id.to_string()))
    }

    pub fn forget_container(&self, container_id: &str) -> Result<Option<PlacedContainer>> {
        let placed = self.lock_placements()?.remove(container_id);
        if let Some(placed) = &placed {
            self.events.emit(&FleetEvent::ContainerStopped {
                node_id: placed.node_id.clone(),
                container_id: container_id.to_string(),
            });
        }
        Ok(placed)
    }

    pub fn containers_on(&self, node_id: &str) -> Result<Vec<Container>> {
        Ok(self
            .lock_placements()?
            .values()
            .filter(|p| p.node_id == node_id)
            .map(|p| p.container.clone())
            .collect())
    }

    fn flush_containers(&self, node_id: &str) -> Result<usize> {
        let mut placements = self.lock_placements()?;
        let before = placements.len();
        placements.retain(|_, p| p.node_id != node_id);
        Ok(before - placements.len())
    }
}

/// Periodic liveness check for one node session
async fn supervise(registry: Weak<NodeRegistry>, id: String, token: String) {
    let period = match registry.upgrade() {
        Some(registry) => registry.supervision.check_interval,
        None => return,
    };
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let Some(registry) = registry.upgrade() else { break };
        // a reconnect under the same ID has its own supervisor
        if registry.token_of(&id).as_deref() != Some(token.as_str()) {
            break;
        }
        match registry.check_liveness(&id, Instant::now()) {
            Ok(Health::Healthy) | Ok(Health::Degraded) => {}
            Ok(Health::Expired) => break,
            Err(e) => {
                tracing::debug!("Supervisor for {} stopping: {}", id, e);
                break;
            }
        }
    }
    tracing::debug!("Supervisor for node {} finished", id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn status_with_demand(cpu: f64) -> NodeStatus {
        // only cpu contributes: demand = 0.7 * cpu
        NodeStatus {
            cpu_usage: cpu / 0.7,
            ..NodeStatus::default()
        }
    }

    fn container(id: &str) -> Container {
        Container {
            id: id.to_string(),
            name: id.to_string(),
            image: "web".to_string(),
            owner_uid: String::new(),
            labels: HashMap::new(),
            networks: HashMap::new(),
            ports: Vec::new(),
            host_port: String::new(),
            created: Utc::now(),
            usage: None,
        }
    }

    #[test]
    fn test_connect_rejects_duplicates() {
        let registry = Arc::new(NodeRegistry::default());
        let token = registry.connect("n1", "10.0.0.1", 7879).unwrap();
        assert!(!token.is_empty());
        assert!(matches!(
            registry.connect("n1", "10.0.0.2", 7879),
            Err(FleetError::NodeExists(_))
        ));
        assert_eq!(registry.endpoint("n1").unwrap().address, "10.0.0.1");
    }

    #[test]
    fn test_select_lowest_demand() {
        let registry = Arc::new(NodeRegistry::default());
        for (id, demand) in [("a", 0.9), ("b", 0.3), ("c", 0.6)] {
            registry.connect(id, "127.0.0.1", 7879).unwrap();
            registry.push_status(id, status_with_demand(demand)).unwrap();
        }
        assert_eq!(registry.select_lowest_demand().unwrap().id, "b");
    }

    #[test]
    fn test_selection_skips_silent_nodes_and_breaks_ties_by_order() {
        let registry = Arc::new(NodeRegistry::default());
        assert!(matches!(registry.select_lowest_demand(), Err(FleetError::NoNodeAvailable)));

        registry.connect("quiet", "127.0.0.1", 1).unwrap();
        assert!(matches!(registry.select_lowest_demand(), Err(FleetError::NoNodeAvailable)));

        for id in ["first", "second"] {
            registry.connect(id, "127.0.0.1", 1).unwrap();
            registry.push_status(id, status_with_demand(0.4)).unwrap();
        }
        assert_eq!(registry.select_lowest_demand().unwrap().id, "first");
    }

    #[test]
    fn test_liveness_transitions() {
        let registry = Arc::new(NodeRegistry::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        registry.events().subscribe(move |event| {
            if let FleetEvent::NodeDisconnected { id, reason } = event {
                sink.lock().unwrap().push((id.clone(), *reason));
            }
        });

        registry.connect("n1", "127.0.0.1", 1).unwrap();
        registry.record_container("n1", container("c1")).unwrap();
        let start = Instant::now();

        assert_eq!(registry.check_liveness("n1", start).unwrap(), Health::Healthy);
        assert_eq!(
            registry.check_liveness("n1", start + Duration::from_secs(45)).unwrap(),
            Health::Degraded
        );
        assert_eq!(registry.get("n1").unwrap().liveness, Liveness::Degraded);

        registry.heartbeat("n1").unwrap();
        assert_eq!(registry.get("n1").unwrap().liveness, Liveness::Active);

        let later = Instant::now() + Duration::from_secs(95);
        assert_eq!(registry.check_liveness("n1", later).unwrap(), Health::Expired);
        assert!(registry.is_empty());
        assert!(registry.locate_container("c1").is_err());
        assert_eq!(
            *seen.lock().unwrap(),
            vec![("n1".to_string(), DisconnectReason::HeartbeatTimeout)]
        );
    }

    #[test]
    fn test_placement_table() {
        let registry = Arc::new(NodeRegistry::default());
        registry.connect("n1", "127.0.0.1", 1).unwrap();
        registry.connect("n2", "127.0.0.1", 2).unwrap();
        registry.record_container("n1", container("c1")).unwrap();
        registry.record_container("n2", container("c2")).unwrap();

        assert_eq!(registry.locate_container("c2").unwrap(), "n2");
        assert_eq!(registry.containers_on("n1").unwrap().len(), 1);
        assert!(registry.forget_container("c1").unwrap().is_some());
        assert!(registry.forget_container("c1").unwrap().is_none());

        registry.disconnect("n2").unwrap();
        assert!(registry.locate_container("c2").is_err());
        assert!(matches!(registry.heartbeat("n2"), Err(FleetError::NodeNotFound(_))));
    }

    #[tokio::test]
    async fn test_supervisor_evicts_silent_node() {
        let registry = Arc::new(NodeRegistry::new(Supervision {
            check_interval: Duration::from_millis(10),
            degrade_after: Duration::from_millis(20),
            evict_after: Duration::from_millis(50),
        }));
        registry.connect("n1", "127.0.0.1", 1).unwrap();
        registry.connect("n2", "127.0.0.1", 2).unwrap();

        for _ in 0..20 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            registry.heartbeat("n2").unwrap();
        }
        assert!(registry.get("n1").is_err());
        assert!(registry.get("n2").is_ok());
    }
}
