//! Background sampler of system-wide and target-process utilization.
//!
//! A single worker resolves the tracked process, reads cumulative CPU and
//! memory counters, converts them to utilization fractions and publishes one
//! [`UtilizationSnapshot`] per tick for a presentation layer to display.

pub mod utils {
    pub mod errors;
    pub mod logger;
    pub mod psutils;
    pub mod trace_rotation;
}

pub mod collectors;
pub mod delta;
pub mod gpu_path;
pub mod target;
pub mod telemetry_group;

pub use delta::{Baseline, CumulativeSample, DeltaEngine, UtilizationPair};
pub use gpu_path::{GpuInstancePath, find_instance};
pub use target::{TargetIdentity, TargetTracker};
pub use telemetry_group::{
    CounterSource, GpuCounters, SamplerConfig, SamplerEvent, SamplerState, TargetChange,
    TelemetryGroup, UtilizationSnapshot,
};
pub use utils::errors::TelemetryError;
