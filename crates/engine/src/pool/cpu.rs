//! CPU load sampling

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use sysinfo::{CpuRefreshKind, RefreshKind, System};

/// Source of system-wide CPU usage, in percent (0-100)
pub trait CpuSampler: Send + Sync + 'static {
    fn sample(&self) -> f64;
}

/// CPU usage from the operating system via `sysinfo`
///
/// Usage is computed between consecutive refreshes, so the first sample
/// after construction reflects the time since `new()`.
pub struct SystemCpuSampler {
    system: Mutex<System>,
}

impl SystemCpuSampler {
    pub fn new() -> Self {
        let mut system = System::new_with_specifics(
            RefreshKind::new().with_cpu(CpuRefreshKind::new().with_cpu_usage()),
        );
        system.refresh_cpu_usage();

        Self {
            system: Mutex::new(system),
        }
    }
}

impl Default for SystemCpuSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuSampler for SystemCpuSampler {
    fn sample(&self) -> f64 {
        let mut system = self.system.lock();
        system.refresh_cpu_usage();
        f64::from(system.global_cpu_usage()).clamp(0.0, 100.0)
    }
}

/// Sampler returning a settable value
///
/// Used to drive the pool from an external load signal, and in tests.
#[derive(Debug, Default)]
pub struct FixedCpuSampler {
    bits: AtomicU64,
}

impl FixedCpuSampler {
    pub fn new(percent: f64) -> Self {
        Self {
            bits: AtomicU64::new(percent.to_bits()),
        }
    }

    pub fn set(&self, percent: f64) {
        self.bits.store(percent.to_bits(), Ordering::Relaxed);
    }
}

impl CpuSampler for FixedCpuSampler {
    fn sample(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Relaxed))
    }
}

/// Suggested worker count for mixed CPU/IO work: 1.5x available cores
pub fn optimal_thread_count() -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4);
    (cores as f64 * 1.5) as usize
}
