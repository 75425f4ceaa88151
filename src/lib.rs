//! Flotilla - fleet orchestration for containerized workloads
//!
//! A control node tracks worker nodes through heartbeats and status pushes,
//! places work on the least-loaded node and drives long-running actions
//! through a create / poll / finish protocol. Each worker node wraps a
//! container runtime with:
//!
//! - Container and network orchestration with port proxying
//! - Image retention with per-image locking and usage-based eviction
//! - A CIDR address pool for per-workload networks
//! - Multi-container services with injected flags and atomic rollback
//! - Network monitor containers

pub mod agent;
pub mod config;
pub mod container;
pub mod error;
pub mod events;
pub mod fleet;
pub mod http;
pub mod image;
pub mod network;
pub mod operation;
pub mod protocol;
pub mod proxy;
pub mod runtime;
pub mod service;
pub mod store;

pub use error::{FleetError, Result};
