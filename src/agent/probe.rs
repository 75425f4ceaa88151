//! Host resource sampling

use sysinfo::{Disks, Networks, System};
use std::path::Path;
use std::time::Instant;

/// Slots in the CPU smoothing window
pub const CPU_WINDOW: usize = 10;

/// One reading of the host, every field a fraction in `[0, 1]`
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HostSample {
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub disk_usage: f64,
    /// Inbound traffic over link capacity
    pub network_usage: f64,
}

/// Source of host readings
pub trait HostProbe: Send {
    fn sample(&mut self) -> HostSample;
}

/// Reads the local machine through `sysinfo`
pub struct SysinfoProbe {
    system: System,
    networks: Networks,
    link_capacity_bytes: u64,
    last_refresh: Instant,
}

impl SysinfoProbe {
    /// `link_capacity_bytes` is the inbound bandwidth per second
    pub fn new(link_capacity_bytes: u64) -> Self {
        Self {
            system: System::new_all(),
            networks: Networks::new_with_refreshed_list(),
            link_capacity_bytes: link_capacity_bytes.max(1),
            last_refresh: Instant::now(),
        }
    }

    fn disk_usage() -> f64 {
        let disks = Disks::new_with_refreshed_list();
        let root = disks
            .list()
            .iter()
            .find(|d| d.mount_point() == Path::new("/"));
        let (total, available) = match root {
            Some(disk) => (disk.total_space(), disk.available_space()),
            None => disks.list().iter().fold((0, 0), |(t, a), d| {
                (t + d.total_space(), a + d.available_space())
            }),
        };
        if total == 0 {
            tracing::warn!("No disk information available");
            return 0.0;
        }
        total.saturating_sub(available) as f64 / total as f64
    }

    fn network_usage(&mut self) -> f64 {
        self.networks.refresh();
        let elapsed = self.last_refresh.elapsed().as_secs_f64().max(1.0);
        self.last_refresh = Instant::now();
        let received: u64 = self.networks.list().values().map(|n| n.received()).sum();
        received as f64 / (self.link_capacity_bytes as f64 * elapsed)
    }
}

impl HostProbe for SysinfoProbe {
    fn sample(&mut self) -> HostSample {
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();

        let total_memory = self.system.total_memory();
        let memory_usage = if total_memory == 0 {
            0.0
        } else {
            self.system.used_memory() as f64 / total_memory as f64
        };

        HostSample {
            cpu_usage: f64::from(self.system.global_cpu_usage()) / 100.0,
            memory_usage,
            disk_usage: Self::disk_usage(),
            network_usage: self.network_usage(),
        }
    }
}

/// Fixed readings, for tests and hosts without metrics
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticProbe(pub HostSample);

impl HostProbe for StaticProbe {
    fn sample(&mut self) -> HostSample {
        self.0
    }
}

/// Mean over the last [`CPU_WINDOW`] CPU readings
#[derive(Debug, Clone)]
pub struct CpuSmoother {
    samples: [f64; CPU_WINDOW],
    index: usize,
}

impl CpuSmoother {
    /// Start with every slot holding `initial`
    pub fn new(initial: f64) -> Self {
        Self {
            samples: [initial; CPU_WINDOW],
            index: 0,
        }
    }

    /// Record a reading and return the new mean
    pub fn push(&mut self, value: f64) -> f64 {
        self.index = (self.index + 1) % CPU_WINDOW;
        self.samples[self.index] = value;
        self.mean()
    }

    pub fn mean(&self) -> f64 {
        self.samples.iter().sum::<f64>() / CPU_WINDOW as f64
    }
}

/// Round to two decimals
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
