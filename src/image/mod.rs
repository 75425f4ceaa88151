//! Image presence, per-image locking and eviction

pub mod forest;
pub mod lifecycle;
pub mod lock;

pub use forest::DependencyForest;
pub use lifecycle::ImageLifecycleManager;
pub use lock::{KeyGuard, KeyedLock};
