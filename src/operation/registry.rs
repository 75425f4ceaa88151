//! Registry of long-running operations
//!
//! A slow action gets an opaque handle from `create`. The worker appends
//! progress text and eventually calls `finish`. Callers `poll` the handle:
//! unfinished operations hand back (and clear) the text produced since the
//! previous poll, finished ones hand back the stored payload on every poll
//! until the sweeper reclaims the record.

use crate::error::{FleetError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Opaque operation handle
pub type OperationId = String;

/// Default number of sweeps a finished record survives
pub const DEFAULT_REMAINDER: u32 = 2;

#[derive(Debug)]
struct OperationRecord {
    status: String,
    payload: Option<Value>,
    remainder: u32,
}

/// What a poll observed
#[derive(Debug, Clone, PartialEq)]
pub enum Progress {
    /// Still running; carries text produced since the last poll
    Running { message: String },
    /// Done; carries the terminal payload
    Finished { payload: Value },
}

impl Progress {
    pub fn is_finished(&self) -> bool {
        matches!(self, Progress::Finished { .. })
    }
}

/// Terminal payload written by `OperationRegistry::run`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(serialize = "T: Serialize", deserialize = "T: Deserialize<'de>"))]
pub struct TaskOutcome<T> {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> TaskOutcome<T> {
    pub fn from_result(result: Result<T>) -> Self {
        match result {
            Ok(value) => Self { result: Some(value), error: None },
            Err(err) => Self { result: None, error: Some(err.to_string()) },
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self)
            .unwrap_or_else(|err| serde_json::json!({ "error": err.to_string() }))
    }
}

impl<T: serde::de::DeserializeOwned> TaskOutcome<T> {
    /// Interpret a terminal payload as a result
    pub fn decode(payload: Value) -> Result<T> {
        let outcome: TaskOutcome<T> = serde_json::from_value(payload)?;
        match (outcome.result, outcome.error) {
            (_, Some(error)) if !error.is_empty() => Err(FleetError::OperationFailed(error)),
            (Some(value), _) => Ok(value),
            (None, _) => Err(FleetError::OperationFailed("operation produced no result".to_string())),
        }
    }
}

/// Write side of an operation handed to a worker
#[derive(Clone)]
pub struct StatusSink {
    registry: Arc<OperationRegistry>,
    id: OperationId,
}

impl StatusSink {
    pub fn push(&self, text: &str) {
        self.registry.append_status(&self.id, text);
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

/// Table of pending and completed operations
#[derive(Debug)]
pub struct OperationRegistry {
    records: Mutex<HashMap<OperationId, OperationRecord>>,
    remainder: u32,
}

impl Default for OperationRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_REMAINDER)
    }
}

impl OperationRegistry {
    /// Create a registry whose finished records survive `remainder` sweeps
    pub fn new(remainder: u32) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            remainder: remainder.max(1),
        }
    }

    /// Register a new pending operation
    pub fn create(&self) -> Result<OperationId> {
        let id = Uuid::new_v4().simple().to_string();
        let mut records = self.records.lock()
            .map_err(|_| FleetError::Lock("Failed to acquire operation lock".to_string()))?;
        records.insert(id.clone(), OperationRecord {
            status: String::new(),
            payload: None,
            remainder: self.remainder,
        });
        Ok(id)
    }

    /// Append progress text. Unknown or finished operations drop the text.
    pub fn append_status(&self, id: &str, text: &str) -> bool {
        let Ok(mut records) = self.records.lock() else {
            return false;
        };
        match records.get_mut(id) {
            Some(record) if record.payload.is_none() => {
                record.status.push_str(text);
                true
            }
            _ => false,
        }
    }

    /// Store the terminal payload. Only the first call has an effect.
    pub fn finish(&self, id: &str, payload: Value) -> bool {
        let Ok(mut records) = self.records.lock() else {
            return false;
        };
        match records.get_mut(id) {
            Some(record) if record.payload.is_none() => {
                record.payload = Some(payload);
                record.status.clear();
                true
            }
            _ => false,
        }
    }

    /// Observe an operation
    pub fn poll(&self, id: &str) -> Result<Progress> {
        let mut records = self.records.lock()
            .map_err(|_| FleetError::Lock("Failed to acquire operation lock".to_string()))?;
        let record = records.get_mut(id)
            .ok_or_else(|| FleetError::OperationNotFound(id.to_string()))?;

        Ok(match &record.payload {
            Some(payload) => Progress::Finished { payload: payload.clone() },
            None => Progress::Running { message: std::mem::take(&mut record.status) },
        })
    }

    /// Age finished records and drop the ones whose window ran out
    pub fn sweep(&self) -> usize {
        let Ok(mut records) = self.records.lock() else {
            return 0;
        };
        let before = records.len();
        records.retain(|_, record| {
            if record.payload.is_none() {
                return true;
            }
            if record.remainder == 0 {
                return false;
            }
            record.remainder -= 1;
            true
        });
        before - records.len()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Periodically sweep until the registry is dropped elsewhere
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let registry = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                let removed = registry.sweep();
                if removed > 0 {
                    tracing::debug!("Swept {} finished operation(s)", removed);
                }
            }
        })
    }

    /// Status writer bound to an operation
    pub fn sink(self: &Arc<Self>, id: &str) -> StatusSink {
        StatusSink {
            registry: self.clone(),
            id: id.to_string(),
        }
    }

    /// Run blocking work in the background and return its handle at once.
    ///
    /// The operation finishes with a `TaskOutcome` payload once `work`
    /// returns.
    pub fn run<T, F>(self: &Arc<Self>, work: F) -> Result<OperationId>
    where
        T: Serialize + Send + 'static,
        F: FnOnce(&StatusSink) -> Result<T> + Send + 'static,
    {
        let id = self.create()?;
        let sink = self.sink(&id);
        let registry = self.clone();
        let finish_id = id.clone();
        tokio::task::spawn_blocking(move || {
            let outcome = TaskOutcome::from_result(work(&sink));
            if let Some(error) = &outcome.error {
                tracing::warn!("Operation {} failed: {}", finish_id, error);
            }
            registry.finish(&finish_id, outcome.to_value());
        });
        Ok(id)
    }

    /// Like `run`, but progress text goes to a separate message handle.
    ///
    /// Returns `(message_id, finish_id)`. Both are finished with the same
    /// outcome once the work returns.
    pub fn run_pair<T, F>(self: &Arc<Self>, work: F) -> Result<(OperationId, OperationId)>
    where
        T: Serialize + Send + 'static,
        F: FnOnce(&StatusSink) -> Result<T> + Send + 'static,
    {
        let message_id = self.create()?;
        let finish_id = self.create()?;
        let sink = self.sink(&message_id);
        let registry = self.clone();
        let (m, f) = (message_id.clone(), finish_id.clone());
        tokio::task::spawn_blocking(move || {
            let payload = TaskOutcome::from_result(work(&sink)).to_value();
            registry.finish(&m, payload.clone());
            registry.finish(&f, payload);
        });
        Ok((message_id, finish_id))
    }
}
