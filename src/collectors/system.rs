//! Live counters for Linux, read through `sysinfo` and `/proc/stat`.

use crate::telemetry_group::CounterSource;
use crate::utils::errors::TelemetryError;
use crate::utils::psutils::{busiest_process, display_name, process_owner};
use log::{debug, trace};
use std::path::PathBuf;
use sysinfo::{CpuRefreshKind, Pid, Process, ProcessesToUpdate, System};
use users::UsersCache;

/// Kernel clock ticks per second used by `/proc/stat`.
const USER_HZ: u64 = 100;
const MS_PER_SEC: u64 = 1000;

/// Which process counts as the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TargetSelector {
    Pid(u32),
    CurrentProcess,
    /// The process with the highest CPU usage at each tick
    #[default]
    BusiestProcess,
}

/// Open reference to a process. The start time tells a live process apart
/// from a newer one that reuses its pid.
#[derive(Debug, PartialEq, Eq)]
pub struct ProcessHandle {
    pid: Pid,
    start_time: u64,
}

pub struct SystemCounters {
    system: System,
    users_cache: UsersCache,
    selector: TargetSelector,
    proc_stat_path: PathBuf,
}

impl SystemCounters {
    pub fn new(selector: TargetSelector) -> Self {
        Self {
            system: System::new(),
            users_cache: UsersCache::new(),
            selector,
            proc_stat_path: PathBuf::from("/proc/stat"),
        }
    }

    /// Like [`SystemCounters::new`] but fails when the counters cannot be read.
    pub fn open(selector: TargetSelector) -> Result<Self, TelemetryError> {
        let mut counters = Self::new(selector);
        counters.read_busy_time()?;

        if let TargetSelector::Pid(pid) = selector {
            let pid = Pid::from_u32(pid);
            if counters.refresh_pid(pid).is_none() {
                return Err(TelemetryError::ProcessDiscoveryError(format!(
                    "Process {} not found",
                    pid
                )));
            }
        }
        Ok(counters)
    }

    pub fn with_proc_stat_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.proc_stat_path = path.into();
        self
    }

    fn read_busy_time(&self) -> Result<u64, TelemetryError> {
        let stat = std::fs::read_to_string(&self.proc_stat_path).map_err(|e| {
            TelemetryError::SysinfoError(format!(
                "Failed to read {}: {}",
                self.proc_stat_path.display(),
                e
            ))
        })?;
        let jiffies = parse_busy_jiffies(&stat).ok_or_else(|| {
            TelemetryError::SysinfoError("No aggregate cpu line in /proc/stat".to_string())
        })?;
        Ok(jiffies.saturating_mul(MS_PER_SEC / USER_HZ))
    }

    fn refresh_pid(&mut self, pid: Pid) -> Option<&Process> {
        self.system
            .refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        self.system.process(pid)
    }

    /// The process behind `handle` as of the last refresh, if it is still the same one.
    fn cached(&self, handle: &ProcessHandle) -> Option<&Process> {
        self.system
            .process(handle.pid)
            .filter(|process| process.start_time() == handle.start_time)
    }
}

impl Default for SystemCounters {
    fn default() -> Self {
        Self::new(TargetSelector::default())
    }
}

/// Busy jiffies from the aggregate `cpu` line: user, nice, system, irq,
/// softirq and steal. Idle and iowait are excluded; guest time is already
/// part of user time.
pub fn parse_busy_jiffies(stat: &str) -> Option<u64> {
    let line = stat
        .lines()
        .find(|line| line.split_whitespace().next() == Some("cpu"))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .map(|field| field.parse().ok())
        .collect::<Option<Vec<_>>>()?;
    if fields.len() < 4 {
        return None;
    }
    // user nice system idle iowait irq softirq steal
    let busy = [0, 1, 2, 5, 6, 7]
        .iter()
        .filter_map(|&index| fields.get(index))
        .fold(0u64, |sum, &value| sum.saturating_add(value));
    Some(busy)
}

impl CounterSource for SystemCounters {
    type Handle = ProcessHandle;

    fn begin_tick(&mut self) {
        self.system.refresh_memory();
    }

    fn logical_core_count(&mut self) -> usize {
        self.system.refresh_cpu_list(CpuRefreshKind::nothing());
        match self.system.cpus().len() {
            0 => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            cores => cores,
        }
    }

    fn total_cpu_time(&mut self) -> u64 {
        match self.read_busy_time() {
            Ok(ms) => {
                trace!("Busy CPU time: {} ms", ms);
                ms
            }
            Err(e) => {
                debug!("{}", e);
                0
            }
        }
    }

    fn current_target_id(&mut self) -> Option<u64> {
        match self.selector {
            TargetSelector::Pid(pid) => Some(u64::from(pid)),
            TargetSelector::CurrentProcess => sysinfo::get_current_pid()
                .ok()
                .map(|pid| u64::from(pid.as_u32())),
            TargetSelector::BusiestProcess => {
                self.system.refresh_processes(ProcessesToUpdate::All, true);
                busiest_process(&self.system).map(|pid| u64::from(pid.as_u32()))
            }
        }
    }

    fn acquire_handle(&mut self, id: u64) -> Option<ProcessHandle> {
        let pid = Pid::from_u32(u32::try_from(id).ok()?);
        let start_time = self.refresh_pid(pid)?.start_time();
        Some(ProcessHandle { pid, start_time })
    }

    fn release_handle(&mut self, handle: ProcessHandle) {
        trace!("Released handle of process {}", handle.pid);
    }

    fn is_handle_alive(&mut self, handle: &ProcessHandle) -> bool {
        self.refresh_pid(handle.pid)
            .is_some_and(|process| process.start_time() == handle.start_time)
    }

    fn process_cpu_time(&mut self, handle: &ProcessHandle) -> Option<u64> {
        self.refresh_pid(handle.pid);
        self.cached(handle).map(|process| process.accumulated_cpu_time())
    }

    fn process_memory_bytes(&mut self, handle: &ProcessHandle) -> u64 {
        self.cached(handle).map(|process| process.memory()).unwrap_or(0)
    }

    fn process_name(&mut self, handle: &ProcessHandle) -> Option<String> {
        self.refresh_pid(handle.pid);
        self.cached(handle).map(display_name)
    }

    fn process_user(&mut self, handle: &ProcessHandle) -> Option<String> {
        let process = self.cached(handle)?;
        process_owner(process, &self.users_cache)
    }

    fn system_memory_total_bytes(&mut self) -> u64 {
        self.system.total_memory()
    }

    fn system_memory_available_bytes(&mut self) -> u64 {
        self.system.available_memory()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STAT: &str = "cpu  4705 356 584 3699 23 0 12 5 0 0\n\
                        cpu0 1393 280 297 1850 12 0 6 2 0 0\n\
                        intr 114930548 113199788 3 0 5 263 0 4\n";

    #[test]
    fn test_parse_busy_jiffies() {
        assert_eq!(parse_busy_jiffies(STAT), Some(4705 + 356 + 584 + 12 + 5));
    }

    #[test]
    fn test_parse_short_and_garbled_lines() {
        assert_eq!(parse_busy_jiffies("cpu 1 2 3 4\n"), Some(6));
        assert_eq!(parse_busy_jiffies("cpu 1 2\n"), None);
        assert_eq!(parse_busy_jiffies("cpu 1 x 3 4\n"), None);
        assert_eq!(parse_busy_jiffies("cpu0 1 2 3 4\n"), None);
        assert_eq!(parse_busy_jiffies(""), None);
    }

    #[test]
    fn test_huge_counters_saturate() {
        let stat = format!("cpu {} {} 0 0 0 0 0 0\n", u64::MAX, u64::MAX);
        assert_eq!(parse_busy_jiffies(&stat), Some(u64::MAX));

        let path = std::env::temp_dir().join(format!("hwoverlay-huge-stat-{}", std::process::id()));
        std::fs::write(&path, stat).unwrap();
        let mut counters = SystemCounters::new(TargetSelector::CurrentProcess)
            .with_proc_stat_path(&path);
        assert_eq!(counters.total_cpu_time(), u64::MAX);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_total_cpu_time_from_file() {
        let path = std::env::temp_dir().join(format!("hwoverlay-stat-{}", std::process::id()));
        std::fs::write(&path, STAT).unwrap();
        let mut counters = SystemCounters::new(TargetSelector::CurrentProcess)
            .with_proc_stat_path(&path);
        assert_eq!(counters.total_cpu_time(), (4705 + 356 + 584 + 12 + 5) * 10);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_missing_stat_file_reads_zero() {
        let mut counters = SystemCounters::new(TargetSelector::CurrentProcess)
            .with_proc_stat_path("/nonexistent/stat");
        assert_eq!(counters.total_cpu_time(), 0);
    }

    #[test]
    fn test_current_process_handle() {
        let mut counters = SystemCounters::new(TargetSelector::CurrentProcess);
        let id = counters.current_target_id().unwrap();
        assert_eq!(id, u64::from(std::process::id()));

        let handle = counters.acquire_handle(id).unwrap();
        assert!(counters.is_handle_alive(&handle));
        assert!(counters.process_cpu_time(&handle).is_some());
        assert!(counters.process_memory_bytes(&handle) > 0);
        assert!(counters.process_name(&handle).is_some());
        counters.release_handle(handle);
    }

    #[test]
    fn test_unknown_pid_has_no_handle() {
        let mut counters = SystemCounters::new(TargetSelector::Pid(u32::MAX - 1));
        let id = counters.current_target_id().unwrap();
        assert!(counters.acquire_handle(id).is_none());
        assert!(SystemCounters::open(TargetSelector::Pid(u32::MAX - 1)).is_err());
    }

    #[test]
    fn test_reused_pid_is_not_alive() {
        let mut counters = SystemCounters::new(TargetSelector::CurrentProcess);
        let id = counters.current_target_id().unwrap();
        let handle = counters.acquire_handle(id).unwrap();
        let impostor = ProcessHandle {
            pid: handle.pid,
            start_time: handle.start_time + 1,
        };
        assert!(!counters.is_handle_alive(&impostor));
        assert!(counters.process_cpu_time(&impostor).is_none());
        counters.release_handle(handle);
        counters.release_handle(impostor);
    }

    #[test]
    fn test_memory_and_cores() {
        let mut counters = SystemCounters::default();
        counters.begin_tick();
        assert!(counters.system_memory_total_bytes() > 0);
        assert!(counters.logical_core_count() >= 1);
    }
}
