//! Per-container usage monitors

use super::config::Usage;
use crate::error::Result;
use crate::runtime::{ContainerRuntime, StatsSample};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Turn a raw sample into percentages
pub fn usage_from_sample(sample: &StatsSample) -> Usage {
    let cpu_delta = sample.cpu_total.saturating_sub(sample.precpu_total) as f64;
    let system_delta = sample.system_total.saturating_sub(sample.presystem_total) as f64;
    let cpu_percent = if system_delta > 0.0 {
        cpu_delta / system_delta * sample.online_cpus as f64 * 100.0
    } else {
        0.0
    };
    let memory_percent = if sample.memory_limit > 0 {
        sample.memory_usage as f64 / sample.memory_limit as f64 * 100.0
    } else {
        0.0
    };
    Usage { cpu_percent, memory_percent }
}

/// Latest usage per container, fed by one monitor thread per container
#[derive(Debug, Default)]
pub struct StatsTable {
    usage: RwLock<HashMap<String, Usage>>,
}

impl StatsTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start streaming samples for a container until its stream ends
    pub fn attach(self: &Arc<Self>, runtime: &Arc<dyn ContainerRuntime>, container_id: &str) -> Result<()> {
        let stream = runtime.stats(container_id)?;
        let table = self.clone();
        let id = container_id.to_string();
        std::thread::Builder::new()
            .name(format!("stats-{}", &id[..id.len().min(12)]))
            .spawn(move || {
                for sample in stream {
                    table.record(&id, usage_from_sample(&sample));
                }
                table.forget(&id);
                tracing::debug!("Stats stream for {} ended", id);
            })?;
        Ok(())
    }

    pub fn record(&self, container_id: &str, usage: Usage) {
        if let Ok(mut table) = self.usage.write() {
            table.insert(container_id.to_string(), usage);
        }
    }

    pub fn forget(&self, container_id: &str) {
        if let Ok(mut table) = self.usage.write() {
            table.remove(container_id);
        }
    }

    pub fn get(&self, container_id: &str) -> Option<Usage> {
        self.usage.read().ok()?.get(container_id).copied()
    }

    pub fn len(&self) -> usize {
        self.usage.read().map(|t| t.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
