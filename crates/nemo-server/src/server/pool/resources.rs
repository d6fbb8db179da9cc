//! Process resource sampling for Stage-1 performance figures.

use nemo_core::Performance;
use parking_lot::Mutex;
use std::time::Instant;
use sysinfo::{Pid, ProcessesToUpdate, System};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// A point-in-time reading of host CPU load and this process's RSS.
#[derive(Debug, Clone, Copy)]
pub struct Sample {
    at: Instant,
    cpu: f32,
    rss_bytes: u64,
}

/// Shared `sysinfo` handle used by every Stage-1 worker.
///
/// CPU usage is computed by `sysinfo` from the difference between two
/// refreshes, so a single long-lived [`System`] gives meaningful numbers
/// where a fresh one per call would always report zero.
pub struct ResourceMonitor {
    system: Mutex<System>,
    pid: Option<Pid>,
}

impl Default for ResourceMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceMonitor {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu_all();
        Self {
            system: Mutex::new(system),
            pid: sysinfo::get_current_pid().ok(),
        }
    }

    pub fn sample(&self) -> Sample {
        let mut system = self.system.lock();
        system.refresh_cpu_all();

        let rss_bytes = match self.pid {
            Some(pid) => {
                system.refresh_processes(ProcessesToUpdate::Some(&[pid]), false);
                system.process(pid).map_or(0, sysinfo::Process::memory)
            }
            None => 0,
        };

        Sample {
            at: Instant::now(),
            cpu: system.global_cpu_usage(),
            rss_bytes,
        }
    }

    /// Performance of the work done between `before` and now.
    pub fn measure_since(&self, before: Sample) -> Performance {
        let after = self.sample();
        let rss_delta = after.rss_bytes as f64 - before.rss_bytes as f64;

        Performance {
            time: round_to(after.at.duration_since(before.at).as_secs_f64(), 2),
            cpu: round_to(f64::from(before.cpu + after.cpu) / 2.0, 1),
            memory: round_to(rss_delta / BYTES_PER_MB, 2),
        }
    }
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10_f64.powi(decimals);
    (value * factor).round() / factor
}
