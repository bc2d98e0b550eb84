//! Trace Rotation Module
//!
//! Rolling history of published utilization snapshots, kept in a polars
//! `DataFrame` and limited to a configurable time window (default: 1 hour)
//! so that a long running overlay does not grow without bound.
//!
//! # Examples
//!
//! ```ignore
//! let mut history = RotatingTrace::new(600); // Keep last 10 minutes
//! history.append_snapshots(&snapshots)?;
//! let plot = history.recent("total_cpu", 120)?;
//! ```

use crate::telemetry_group::UtilizationSnapshot;
use crate::utils::errors::TelemetryError;
use chrono::Utc;
use itertools::multiunzip;
use polars::prelude::*;

/// Column names of the history DataFrame
pub const TIMESTAMP: &str = "timestamp";
pub const TICK: &str = "tick";
pub const TOTAL_CPU: &str = "total_cpu";
pub const PROCESS_CPU: &str = "process_cpu";
pub const MEMORY_USED_KB: &str = "memory_used_kb";
pub const MEMORY_PROCESS_KB: &str = "memory_process_kb";
pub const GPU_3D: &str = "gpu_3d";

/// Configuration for trace rotation behavior
#[derive(Debug, Clone)]
pub struct RotationConfig {
    /// Time window to maintain in seconds (default: 3600 = 1 hour)
    pub retention_seconds: i64,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            retention_seconds: 3600,
        }
    }
}

impl RotationConfig {
    pub fn new(retention_seconds: i64) -> Self {
        Self { retention_seconds }
    }
}

/// History of snapshots: timestamp (ms) | tick | total_cpu | process_cpu |
/// memory_used_kb | memory_process_kb | gpu_3d
pub struct RotatingTrace {
    data: DataFrame,
    config: RotationConfig,
    /// Last cleanup timestamp in ms
    last_cleanup_time: i64,
    /// Minimum spacing between automatic cleanups in ms
    cleanup_interval_ms: i64,
}

impl RotatingTrace {
    pub fn new(retention_seconds: i64) -> Self {
        Self::with_config(RotationConfig::new(retention_seconds))
    }

    pub fn with_config(config: RotationConfig) -> Self {
        Self {
            data: DataFrame::default(),
            config,
            last_cleanup_time: current_timestamp_ms(),
            cleanup_interval_ms: 10_000,
        }
    }

    pub fn retention_seconds(&self) -> i64 {
        self.config.retention_seconds
    }

    pub fn row_count(&self) -> usize {
        self.data.height()
    }

    /// Convert snapshots to rows and append them.
    pub fn append_snapshots(&mut self, snapshots: &[UtilizationSnapshot]) -> Result<(), TelemetryError> {
        if snapshots.is_empty() {
            return Ok(());
        }

        let (timestamps, ticks, total, process, used_kb, process_kb, gpu): (
            Vec<i64>,
            Vec<u64>,
            Vec<f64>,
            Vec<f64>,
            Vec<u64>,
            Vec<u64>,
            Vec<Option<f64>>,
        ) = multiunzip(snapshots.iter().map(|s| {
            (
                s.sampled_at.timestamp_millis(),
                s.tick,
                s.total_cpu_fraction,
                s.process_cpu_fraction,
                s.memory_used_kb,
                s.memory_process_kb,
                s.gpu_3d_fraction,
            )
        }));

        let rows = df![
            TIMESTAMP => timestamps,
            TICK => ticks,
            TOTAL_CPU => total,
            PROCESS_CPU => process,
            MEMORY_USED_KB => used_kb,
            MEMORY_PROCESS_KB => process_kb,
            GPU_3D => gpu,
        ]
        .map_err(|e| TelemetryError::Trace(format!("Failed to build history rows: {}", e)))?;

        self.append(&rows)
    }

    /// Append rows that share the history schema.
    pub fn append(&mut self, new_data: &DataFrame) -> Result<(), TelemetryError> {
        if new_data.is_empty() {
            return Ok(());
        }

        if !new_data.get_column_names().iter().any(|name| name.as_str() == TIMESTAMP) {
            return Err(TelemetryError::Trace(
                "DataFrame must contain a 'timestamp' column for rotation".to_string(),
            ));
        }

        if self.data.is_empty() {
            self.data = new_data.clone();
        } else {
            self.data = self.data.vstack(new_data).map_err(|e| {
                TelemetryError::Trace(format!("Failed to append history rows: {}", e))
            })?;
        }

        let now = current_timestamp_ms();
        if now - self.last_cleanup_time >= self.cleanup_interval_ms {
            self.cleanup()?;
        }

        Ok(())
    }

    /// Remove rows older than the retention window
    pub fn cleanup(&mut self) -> Result<(), TelemetryError> {
        let now = current_timestamp_ms();
        self.last_cleanup_time = now;
        if self.data.is_empty() {
            return Ok(());
        }

        let cutoff_time = now - self.config.retention_seconds * 1000;

        let timestamps = self
            .data
            .column(TIMESTAMP)
            .map_err(|e| TelemetryError::Trace(format!("Failed to access timestamp column: {}", e)))?
            .i64()
            .map_err(|e| TelemetryError::Trace(format!("Timestamp column is not i64 type: {}", e)))?;

        let mask = timestamps
            .iter()
            .map(|opt_ts| opt_ts.map(|ts| ts > cutoff_time).unwrap_or(false))
            .collect::<Vec<_>>();

        let mask_series = Series::new("filter".into(), mask);
        let mask_bool = mask_series
            .bool()
            .map_err(|e| TelemetryError::Trace(format!("Failed to create boolean mask: {}", e)))?;

        self.data = self
            .data
            .filter(mask_bool)
            .map_err(|e| TelemetryError::Trace(format!("Failed to filter history: {}", e)))?;

        Ok(())
    }

    /// All non-null values of `column`, oldest first, as `f64`.
    pub fn values(&self, column: &str) -> Result<Vec<f64>, TelemetryError> {
        self.recent(column, self.row_count())
    }

    /// The newest `n` non-null values of `column`, oldest first.
    pub fn recent(&self, column: &str, n: usize) -> Result<Vec<f64>, TelemetryError> {
        if self.data.is_empty() {
            return Ok(Vec::new());
        }

        let tail = self.data.tail(Some(n));
        let values = tail
            .column(column)
            .map_err(|e| TelemetryError::Trace(format!("Unknown history column {}: {}", column, e)))?
            .cast(&DataType::Float64)
            .map_err(|e| TelemetryError::Trace(format!("Column {} is not numeric: {}", column, e)))?;
        let values = values
            .f64()
            .map_err(|e| TelemetryError::Trace(e.to_string()))?
            .iter()
            .flatten()
            .collect();
        Ok(values)
    }

    pub fn stats(&self) -> TraceStats {
        let timestamps = self
            .data
            .column(TIMESTAMP)
            .ok()
            .and_then(|col| col.i64().ok());

        TraceStats {
            row_count: self.data.height(),
            oldest_timestamp: timestamps.and_then(|s| s.iter().flatten().min()),
            newest_timestamp: timestamps.and_then(|s| s.iter().flatten().max()),
            retention_seconds: self.config.retention_seconds,
        }
    }

    pub fn clear(&mut self) {
        self.data = DataFrame::default();
        self.last_cleanup_time = current_timestamp_ms();
    }
}

/// Statistics about a rotating trace
#[derive(Debug, Clone)]
pub struct TraceStats {
    pub row_count: usize,
    /// ms since UNIX_EPOCH
    pub oldest_timestamp: Option<i64>,
    pub newest_timestamp: Option<i64>,
    pub retention_seconds: i64,
}

impl TraceStats {
    /// Span of the data in ms (newest - oldest)
    pub fn data_span_ms(&self) -> Option<i64> {
        match (self.oldest_timestamp, self.newest_timestamp) {
            (Some(oldest), Some(newest)) => Some(newest - oldest),
            _ => None,
        }
    }
}

fn current_timestamp_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn snapshot(tick: u64, age_secs: i64, total: f64, gpu: Option<f64>) -> UtilizationSnapshot {
        UtilizationSnapshot {
            tick,
            sampled_at: Utc::now() - Duration::seconds(age_secs),
            total_cpu_fraction: total,
            process_cpu_fraction: total / 2.0,
            memory_total_kb: 1024,
            memory_used_kb: 512,
            memory_process_kb: 64,
            gpu_3d_fraction: gpu,
            ..Default::default()
        }
    }

    #[test]
    fn test_rotating_trace_creation() {
        let trace = RotatingTrace::new(3600);
        assert_eq!(trace.retention_seconds(), 3600);
        assert_eq!(trace.row_count(), 0);
        assert!(trace.values(TOTAL_CPU).unwrap().is_empty());
    }

    #[test]
    fn test_append_snapshots() {
        let mut trace = RotatingTrace::new(3600);
        trace
            .append_snapshots(&[snapshot(1, 0, 0.0, None), snapshot(2, 0, 0.5, Some(0.25))])
            .unwrap();
        trace.append_snapshots(&[snapshot(3, 0, 0.75, Some(0.5))]).unwrap();

        assert_eq!(trace.row_count(), 3);
        assert_eq!(trace.values(TOTAL_CPU).unwrap(), vec![0.0, 0.5, 0.75]);
        assert_eq!(trace.values(GPU_3D).unwrap(), vec![0.25, 0.5]);
        assert_eq!(trace.values(TICK).unwrap(), vec![1.0, 2.0, 3.0]);
        assert_eq!(trace.recent(PROCESS_CPU, 2).unwrap(), vec![0.25, 0.375]);
    }

    #[test]
    fn test_unknown_column() {
        let mut trace = RotatingTrace::new(3600);
        trace.append_snapshots(&[snapshot(1, 0, 0.1, None)]).unwrap();
        assert!(trace.recent("energy", 1).is_err());
    }

    #[test]
    fn test_append_requires_timestamp() {
        let mut trace = RotatingTrace::new(3600);
        let data = df!["tick" => vec![1u64]].unwrap();
        assert!(trace.append(&data).is_err());
    }

    #[test]
    fn test_cleanup_old_entries() {
        let mut trace = RotatingTrace::new(100);
        trace
            .append_snapshots(&[
                snapshot(1, 200, 0.1, None),
                snapshot(2, 50, 0.2, None),
                snapshot(3, 0, 0.3, None),
            ])
            .unwrap();
        assert_eq!(trace.row_count(), 3);

        trace.cleanup().unwrap();
        assert_eq!(trace.row_count(), 2);
        assert_eq!(trace.values(TOTAL_CPU).unwrap(), vec![0.2, 0.3]);
    }

    #[test]
    fn test_stats() {
        let mut trace = RotatingTrace::new(3600);
        trace
            .append_snapshots(&[snapshot(1, 100, 0.1, None), snapshot(2, 0, 0.2, None)])
            .unwrap();
        let stats = trace.stats();

        assert_eq!(stats.row_count, 2);
        assert!(stats.data_span_ms().unwrap() >= 99_000);
        assert_eq!(stats.retention_seconds, 3600);

        trace.clear();
        assert_eq!(trace.stats().row_count, 0);
        assert!(trace.stats().oldest_timestamp.is_none());
    }
}
