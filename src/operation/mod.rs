//! Long-running operations: handles, progress and polling

pub mod poll;
pub mod registry;

pub use poll::poll_until_finished;
pub use registry::{OperationId, OperationRegistry, Progress, StatusSink, TaskOutcome};
