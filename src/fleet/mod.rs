//! Control-node side of the fleet: node table, placement and transport

pub mod dispatch;
pub mod node;
pub mod registry;
pub mod transport;

pub use dispatch::{Dispatcher, FleetServer, Placement};
pub use node::{Liveness, Node, NodeEndpoint, NodeStatus, NodeSummary};
pub use registry::{DisconnectReason, FleetEvent, Health, NodeRegistry, PlacedContainer};
pub use transport::{HttpNodeTransport, LocalTransport, NodeTransport};
