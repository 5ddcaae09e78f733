//! Resource usage sampling for `resource_report` messages.
//!
//! Wraps `sysinfo` behind a small sampler that keeps its `System` handle
//! alive between collections; CPU usage in particular needs two refreshes
//! spaced apart to produce a meaningful percentage.

use serde::Serialize;
use std::sync::Mutex as StdMutex;
use sysinfo::{Disks, Networks, System};

/// One sample of host resource usage.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceMetrics {
    pub timestamp: String,
    pub cpu_percent: f32,
    pub memory_total_bytes: u64,
    pub memory_used_bytes: u64,
    pub memory_percent: f32,
    pub disk_total_bytes: u64,
    pub disk_available_bytes: u64,
    pub disk_percent: f32,
    pub network_rx_bytes: u64,
    pub network_tx_bytes: u64,
    pub load_average_1m: f64,
}

/// Samples CPU, memory, disk and network counters.
pub struct ResourceMonitor {
    system: StdMutex<System>,
    networks: StdMutex<Networks>,
}

impl std::fmt::Debug for ResourceMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceMonitor").finish_non_exhaustive()
    }
}

impl Default for ResourceMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceMonitor {
    pub fn new() -> Self {
        let mut system = System::new();
        // Prime the CPU counters so the first real sample has a baseline.
        system.refresh_cpu_usage();
        Self {
            system: StdMutex::new(system),
            networks: StdMutex::new(Networks::new_with_refreshed_list()),
        }
    }

    /// Collects a fresh sample. Cheap enough to call on the report cadence.
    pub fn collect(&self) -> ResourceMetrics {
        let mut system = self.system.lock().expect("system lock poisoned");
        system.refresh_cpu_usage();
        system.refresh_memory();

        let memory_total = system.total_memory();
        let memory_used = system.used_memory();
        let memory_percent = if memory_total > 0 {
            (memory_used as f32 / memory_total as f32) * 100.0
        } else {
            0.0
        };

        let disks = Disks::new_with_refreshed_list();
        let (disk_total, disk_available) = disks
            .iter()
            .fold((0u64, 0u64), |(total, available), disk| {
                (total + disk.total_space(), available + disk.available_space())
            });
        let disk_percent = if disk_total > 0 {
            ((disk_total - disk_available) as f32 / disk_total as f32) * 100.0
        } else {
            0.0
        };

        let mut networks = self.networks.lock().expect("networks lock poisoned");
        networks.refresh(true);
        let (rx, tx) = networks.iter().fold((0u64, 0u64), |(rx, tx), (_, data)| {
            (rx + data.total_received(), tx + data.total_transmitted())
        });

        ResourceMetrics {
            timestamp: chrono::Utc::now().to_rfc3339(),
            cpu_percent: system.global_cpu_usage(),
            memory_total_bytes: memory_total,
            memory_used_bytes: memory_used,
            memory_percent,
            disk_total_bytes: disk_total,
            disk_available_bytes: disk_available,
            disk_percent,
            network_rx_bytes: rx,
            network_tx_bytes: tx,
            load_average_1m: System::load_average().one,
        }
    }
}
