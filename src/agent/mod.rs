//! Worker-node side: request handling, the server link and host probes

pub mod handler;
pub mod link;
pub mod probe;
pub mod stack;

pub use handler::NodeAgent;
pub use link::{ControlPlane, HttpControlPlane, LinkSettings, LocalControlPlane, NodeLink, StatusReporter};
pub use probe::{CpuSmoother, HostProbe, HostSample, StaticProbe, SysinfoProbe};
pub use stack::NodeStack;
