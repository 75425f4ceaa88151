//! Checker containers attached to service networks
//!
//! A monitor is a container built from a caller-supplied context and
//! launched into a network so it can probe the other containers there.
//! Monitors are stopped automatically before their network is removed.

use super::config::{Container, LaunchRequest};
use super::orchestrator::ContainerOrchestrator;
use crate::error::{FleetError, Result};
use crate::network::Network;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, Weak};

const MONITOR_IMAGE_PREFIX: &str = "flotilla_network_monitor_";
const MONITOR_MODULE: &str = "checker";

/// Image tag used for the monitor of a network
pub fn monitor_image_tag(network_name: &str) -> String {
    format!("{}{}", MONITOR_IMAGE_PREFIX, network_name)
}

/// One probe to run from a monitor against a container
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkProbe {
    /// Container being probed
    pub container_id: String,
    /// Monitor container that runs the script
    pub monitor_id: String,
    /// Shell command; `$ip` becomes the probed container's address on the monitor's network
    pub script: String,
}

/// Output of one probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub container_id: String,
    pub exit_code: i64,
    pub output: String,
}

/// Results of a probe run; failed probes are reported, not fatal
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProbeReport {
    pub results: Vec<ProbeResult>,
    pub errors: Vec<String>,
}

/// Tracks monitor containers per network
pub struct NetworkMonitorManager {
    orchestrator: Arc<ContainerOrchestrator>,
    /// network ID -> monitor container IDs
    monitors: Mutex<HashMap<String, Vec<String>>>,
}

impl NetworkMonitorManager {
    pub fn new(orchestrator: Arc<ContainerOrchestrator>) -> Self {
        Self {
            orchestrator,
            monitors: Mutex::new(HashMap::new()),
        }
    }

    /// Stop a network's monitors whenever the orchestrator is about to remove it
    pub fn attach_guard(self: &Arc<Self>) {
        let manager: Weak<Self> = Arc::downgrade(self);
        self.orchestrator.network_guards().subscribe(move |network: &Network| {
            if let Some(manager) = manager.upgrade() {
                manager.stop_network(&network.id)?;
            }
            Ok(())
        });
    }

    /// Build the monitor image from `context` and launch it into `network_name`
    pub fn run(
        &self,
        network_name: &str,
        context: &Path,
        on_progress: &mut dyn FnMut(&str),
    ) -> Result<Container> {
        let network = self.orchestrator.network_by_name(network_name)?;
        let tag = monitor_image_tag(&network.name);

        let images = self.orchestrator.images();
        if self.orchestrator.runtime().inspect_image(&tag)?.is_some() {
            images.delete_image(&tag).map_err(|e| {
                FleetError::Image(format!("failed to remove previous monitor image {}: {}", tag, e))
            })?;
        }

        let mut build_progress = |line: &str| on_progress(&format!("build image {}: {}", tag, line));
        images.build_image(&tag, context, &mut build_progress)?;

        let request = LaunchRequest::new(&tag)
            .module(MONITOR_MODULE)
            .network(&network.name);
        let container = self.orchestrator.launch(&request, on_progress)?;

        self.register(&network.id, &container.id)?;
        tracing::info!("Network monitor {} running on {}", container.id, network.name);
        Ok(container)
    }

    /// Stop a monitor container and remove its image
    pub fn stop(&self, container_id: &str) -> Result<()> {
        let container = self.orchestrator.inspect(container_id)?;
        self.orchestrator.stop(&container.id)?;
        self.unregister(&container.id)?;
        if let Err(e) = self.orchestrator.images().delete_image(&container.image) {
            tracing::warn!("Failed to remove monitor image {}: {}", container.image, e);
        }
        Ok(())
    }

    /// Stop every monitor on a network, returning how many were stopped
    pub fn stop_network(&self, network_id: &str) -> Result<usize> {
        let ids = self.monitors_of(network_id);
        for id in &ids {
            self.stop(id)?;
        }
        Ok(ids.len())
    }

    /// Monitor containers registered on a network
    pub fn monitors_of(&self, network_id: &str) -> Vec<String> {
        self.monitors
            .lock()
            .ok()
            .and_then(|m| m.get(network_id).cloned())
            .unwrap_or_default()
    }

    /// Run probes concurrently, collecting outputs and failures
    pub fn probe(&self, probes: &[NetworkProbe]) -> ProbeReport {
        let outcomes: Vec<Result<ProbeResult>> = std::thread::scope(|scope| {
            let handles: Vec<_> = probes
                .iter()
                .map(|probe| scope.spawn(move || self.run_probe(probe)))
                .collect();
            handles
                .into_iter()
                .map(|h| {
                    h.join()
                        .unwrap_or_else(|_| Err(FleetError::Internal("probe thread panicked".to_string())))
                })
                .collect()
        });

        let mut report = ProbeReport::default();
        for outcome in outcomes {
            match outcome {
                Ok(result) => report.results.push(result),
                Err(e) => report.errors.push(e.to_string()),
            }
        }
        report
    }

    fn run_probe(&self, probe: &NetworkProbe) -> Result<ProbeResult> {
        let network_id = self.network_of(&probe.monitor_id)?;
        let network = self.orchestrator.network_by_name(&network_id)?;
        let target = self.orchestrator.inspect(&probe.container_id)?;
        let ip = target
            .networks
            .get(&network.name)
            .filter(|ip| !ip.is_empty())
            .ok_or_else(|| {
                FleetError::Network(format!(
                    "container {} is not on network {}",
                    probe.container_id, network.name
                ))
            })?;

        let command = probe.script.replace("$ip", ip);
        let output = self.orchestrator.exec(&probe.monitor_id, &command)?;
        Ok(ProbeResult {
            container_id: probe.container_id.clone(),
            exit_code: output.exit_code,
            output: output.output,
        })
    }

    fn network_of(&self, monitor_id: &str) -> Result<String> {
        let monitors = self.monitors.lock()
            .map_err(|_| FleetError::Lock("Failed to acquire monitor lock".to_string()))?;
        monitors
            .iter()
            .find(|(_, ids)| ids.iter().any(|id| id == monitor_id))
            .map(|(network, _)| network.clone())
            .ok_or_else(|| FleetError::ContainerNotFound(format!("monitor {}", monitor_id)))
    }

    fn register(&self, network_id: &str, container_id: &str) -> Result<()> {
        let mut monitors = self.monitors.lock()
            .map_err(|_| FleetError::Lock("Failed to acquire monitor lock".to_string()))?;
        let ids = monitors.entry(network_id.to_string()).or_default();
        if !ids.iter().any(|id| id == container_id) {
            ids.push(container_id.to_string());
        }
        Ok(())
    }

    fn unregister(&self, container_id: &str) -> Result<()> {
        let mut monitors = self.monitors.lock()
            .map_err(|_| FleetError::Lock("Failed to acquire monitor lock".to_string()))?;
        for ids in monitors.values_mut() {
            ids.retain(|id| id != container_id);
        }
        monitors.retain(|_, ids| !ids.is_empty());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ImagePolicy;
    use crate::container::orchestrator::OrchestratorSettings;
    use crate::image::ImageLifecycleManager;
    use crate::network::{AddressPool, NetworkDriver};
    use crate::proxy::LocalProxy;
    use crate::runtime::{ContainerRuntime, LocalRuntime};
    use crate::store::MemoryStore;
    use std::time::Duration;

    fn setup() -> (Arc<LocalRuntime>, Arc<NetworkMonitorManager>, tempfile::TempDir) {
        let runtime = Arc::new(LocalRuntime::new());
        runtime.add_image("alpine", None).unwrap();
        let store = Arc::new(MemoryStore::new());
        let images = Arc::new(ImageLifecycleManager::new(
            runtime.clone(),
            store.clone(),
            ImagePolicy::default(),
        ));
        let pool = Arc::new(AddressPool::from_expression("10.40.[0-1].0/24").unwrap());
        let orchestrator = ContainerOrchestrator::new(
            runtime.clone(),
            Arc::new(LocalProxy::default()),
            store,
            images,
            pool,
        )
        .with_settings(OrchestratorSettings {
            network_ready_delay: Duration::from_millis(1),
            network_drain_delay: Duration::from_millis(1),
            ..OrchestratorSettings::default()
        });
        let manager = Arc::new(NetworkMonitorManager::new(Arc::new(orchestrator)));

        let context = tempfile::tempdir().unwrap();
        std::fs::write(
            context.path().join("Dockerfile"),
            "FROM alpine\nRUN apk add curl\n",
        )
        .unwrap();
        (runtime, manager, context)
    }

    #[test]
    fn test_run_and_stop_monitor() {
        let (runtime, manager, context) = setup();
        let network = manager
            .orchestrator
            .create_pool_network(NetworkDriver::Bridge, true)
            .unwrap();

        let mut lines = Vec::new();
        let monitor = manager
            .run(&network.name, context.path(), &mut |l| lines.push(l.to_string()))
            .unwrap();
        assert!(lines.iter().any(|l| l.contains("Step 1/2")));
        assert_eq!(manager.monitors_of(&network.id), vec![monitor.id.clone()]);
        assert!(runtime.inspect_image(&monitor_image_tag(&network.name)).unwrap().is_some());

        manager.stop(&monitor.id).unwrap();
        assert!(manager.monitors_of(&network.id).is_empty());
        assert!(runtime.inspect_image(&monitor_image_tag(&network.name)).unwrap().is_none());
    }

    #[test]
    fn test_rerun_after_stop() {
        let (_runtime, manager, context) = setup();
        let network = manager
            .orchestrator
            .create_pool_network(NetworkDriver::Bridge, true)
            .unwrap();
        let first = manager.run(&network.name, context.path(), &mut |_| {}).unwrap();
        manager.stop(&first.id).unwrap();
        let second = manager.run(&network.name, context.path(), &mut |_| {}).unwrap();
        assert_eq!(manager.monitors_of(&network.id), vec![second.id]);
    }

    #[test]
    fn test_guard_stops_monitors_before_removal() {
        let (runtime, manager, context) = setup();
        manager.attach_guard();
        let network = manager
            .orchestrator
            .create_pool_network(NetworkDriver::Bridge, true)
            .unwrap();
        manager.run(&network.name, context.path(), &mut |_| {}).unwrap();

        manager.orchestrator.release_network(&network.id).unwrap();
        assert!(runtime.list_containers().unwrap().is_empty());
        assert!(manager.monitors_of(&network.id).is_empty());
    }

    #[test]
    fn test_probe_substitutes_address() {
        let (runtime, manager, context) = setup();
        let network = manager
            .orchestrator
            .create_pool_network(NetworkDriver::Bridge, true)
            .unwrap();
        let target = manager
            .orchestrator
            .launch(&LaunchRequest::new("alpine").network(&network.name), &mut |_| {})
            .unwrap();
        let monitor = manager.run(&network.name, context.path(), &mut |_| {}).unwrap();

        let report = manager.probe(&[
            NetworkProbe {
                container_id: target.id.clone(),
                monitor_id: monitor.id.clone(),
                script: "curl http://$ip/".to_string(),
            },
            NetworkProbe {
                container_id: target.id.clone(),
                monitor_id: "unknown".to_string(),
                script: "true".to_string(),
            },
        ]);

        assert_eq!(report.results.len(), 1);
        assert_eq!(report.results[0].exit_code, 0);
        assert_eq!(report.errors.len(), 1);
        let ip = &target.networks[&network.name];
        let log = runtime.exec_log(&monitor.id).unwrap();
        assert!(log.iter().any(|cmd| cmd.contains(&format!("curl http://{}/", ip))));
    }
}
