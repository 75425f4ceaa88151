//! Networks and the subnet pool that backs per-workload networks

pub mod config;
pub mod pool;

pub use config::{HostAllocator, Network, NetworkDriver, NetworkEndpoint, NetworkScope, NetworkSpec};
pub use pool::{AddressPool, PoolInit};
