//! Cumulative counter to utilization conversion.
//!
//! The counter source hands out monotonically increasing CPU times. Two
//! consecutive readings plus the theoretical capacity of one interval give
//! the utilization of that interval.

use std::time::Duration;

/// Raw cumulative readings taken in one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CumulativeSample {
    /// Busy CPU time summed over all logical cores (ms)
    pub total_cpu_time: u64,
    /// CPU time consumed by the tracked process (ms)
    pub process_cpu_time: u64,
    pub process_memory_bytes: u64,
    pub system_memory_used_bytes: u64,
    pub system_memory_total_bytes: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct UtilizationPair {
    pub total_cpu_fraction: f64,
    pub process_cpu_fraction: f64,
}

/// Previous tick's readings. `None` means there is no valid reference yet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Baseline {
    pub last_total_cpu_time: Option<u64>,
    pub last_process_cpu_time: Option<u64>,
}

impl Baseline {
    /// Forget the process reading. System CPU time stays valid across target changes.
    pub fn invalidate_process(&mut self) {
        self.last_process_cpu_time = None;
    }
}

/// Convert a baseline and a fresh sample into utilization fractions.
///
/// `elapsed_capacity` is the CPU time obtainable in one interval over all
/// cores, in the unit of the counters. Both fractions are clamped to `[0, 1]`:
/// scheduler jitter can stretch an interval slightly past its nominal length,
/// which would otherwise show up as a total above 1.
pub fn compute(
    baseline: Baseline,
    sample: &CumulativeSample,
    elapsed_capacity: u64,
) -> (UtilizationPair, Baseline) {
    let mut pair = UtilizationPair::default();
    let mut cpu_delta = 0u64;

    if let Some(last_total) = baseline.last_total_cpu_time {
        cpu_delta = sample.total_cpu_time.saturating_sub(last_total);
        if elapsed_capacity > 0 {
            pair.total_cpu_fraction = clamp_fraction(cpu_delta as f64 / elapsed_capacity as f64);
        }
    }

    if let Some(last_process) = baseline.last_process_cpu_time {
        // A new target may have less accumulated time than the previous one did.
        let proc_delta = sample.process_cpu_time.saturating_sub(last_process);
        if cpu_delta > 0 {
            pair.process_cpu_fraction = clamp_fraction(proc_delta as f64 / cpu_delta as f64);
        }
    }

    let next = Baseline {
        last_total_cpu_time: Some(sample.total_cpu_time),
        last_process_cpu_time: Some(sample.process_cpu_time),
    };

    (pair, next)
}

fn clamp_fraction(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Stateful wrapper around [`compute`] owned by the sampling worker.
#[derive(Debug, Clone)]
pub struct DeltaEngine {
    baseline: Baseline,
    elapsed_capacity: u64,
}

impl DeltaEngine {
    pub fn new(elapsed_capacity: u64) -> Self {
        Self {
            baseline: Baseline::default(),
            elapsed_capacity,
        }
    }

    /// Capacity for a sampling interval spread over `logical_cores` cores, in ms.
    pub fn for_interval(interval: Duration, logical_cores: usize) -> Self {
        let interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        Self::new(interval_ms.saturating_mul(logical_cores.max(1) as u64))
    }

    pub fn elapsed_capacity(&self) -> u64 {
        self.elapsed_capacity
    }

    pub fn baseline(&self) -> Baseline {
        self.baseline
    }

    pub fn invalidate_process_baseline(&mut self) {
        self.baseline.invalidate_process();
    }

    pub fn update(&mut self, sample: &CumulativeSample) -> UtilizationPair {
        let (pair, next) = compute(self.baseline, sample, self.elapsed_capacity);
        self.baseline = next;
        pair
    }
}
