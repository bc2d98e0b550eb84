use crate::gpu_path::{GpuInstancePath, MultiStringBuilder};
use crate::telemetry_group::{CounterSource, GpuCounters};
use log::trace;
use std::collections::{HashMap, HashSet, VecDeque};

/// Scripted counter source. Each counter replays its queue one value per
/// call and keeps repeating the last value once the queue is down to one.
#[derive(Debug)]
pub struct DummyCounters {
    pub total_cpu_times: VecDeque<u64>,
    pub process_cpu_times: VecDeque<u64>,
    pub targets: VecDeque<Option<u64>>,
    pub logical_cores: usize,
    pub process_memory_bytes: u64,
    pub memory_total_bytes: u64,
    pub memory_available_bytes: u64,
    pub names: HashMap<u64, String>,
    /// Targets whose handle cannot be opened
    pub denied: HashSet<u64>,
    /// Targets that have exited
    pub dead: HashSet<u64>,
    pub acquire_attempts: usize,
    pub acquired: usize,
    pub released: Vec<u64>,
}

#[derive(Debug, PartialEq, Eq)]
pub struct DummyHandle {
    pub id: u64,
}

impl Default for DummyCounters {
    fn default() -> Self {
        Self {
            total_cpu_times: VecDeque::new(),
            process_cpu_times: VecDeque::new(),
            targets: VecDeque::new(),
            logical_cores: 4,
            process_memory_bytes: 64 * 1024 * 1024,
            memory_total_bytes: 16 * 1024 * 1024 * 1024,
            memory_available_bytes: 8 * 1024 * 1024 * 1024,
            names: HashMap::new(),
            denied: HashSet::new(),
            dead: HashSet::new(),
            acquire_attempts: 0,
            acquired: 0,
            released: Vec::new(),
        }
    }
}

impl DummyCounters {
    pub fn with_targets(mut self, targets: Vec<Option<u64>>) -> Self {
        self.targets = targets.into();
        self
    }

    pub fn with_total_cpu_times(mut self, times: Vec<u64>) -> Self {
        self.total_cpu_times = times.into();
        self
    }

    pub fn with_process_cpu_times(mut self, times: Vec<u64>) -> Self {
        self.process_cpu_times = times.into();
        self
    }

    pub fn with_logical_cores(mut self, cores: usize) -> Self {
        self.logical_cores = cores;
        self
    }

    pub fn with_name(mut self, id: u64, name: &str) -> Self {
        self.names.insert(id, name.to_string());
        self
    }
}

fn step<T: Copy>(queue: &mut VecDeque<T>) -> Option<T> {
    if queue.len() > 1 {
        queue.pop_front()
    } else {
        queue.front().copied()
    }
}

impl CounterSource for DummyCounters {
    type Handle = DummyHandle;

    fn logical_core_count(&mut self) -> usize {
        self.logical_cores
    }

    fn total_cpu_time(&mut self) -> u64 {
        step(&mut self.total_cpu_times).unwrap_or(0)
    }

    fn current_target_id(&mut self) -> Option<u64> {
        step(&mut self.targets).flatten()
    }

    fn acquire_handle(&mut self, id: u64) -> Option<DummyHandle> {
        self.acquire_attempts += 1;
        if self.denied.contains(&id) || self.dead.contains(&id) {
            return None;
        }
        self.acquired += 1;
        Some(DummyHandle { id })
    }

    fn release_handle(&mut self, handle: DummyHandle) {
        trace!("Releasing dummy handle {}", handle.id);
        self.released.push(handle.id);
    }

    fn is_handle_alive(&mut self, handle: &DummyHandle) -> bool {
        !self.dead.contains(&handle.id)
    }

    fn process_cpu_time(&mut self, handle: &DummyHandle) -> Option<u64> {
        if self.dead.contains(&handle.id) {
            return None;
        }
        Some(step(&mut self.process_cpu_times).unwrap_or(0))
    }

    fn process_memory_bytes(&mut self, handle: &DummyHandle) -> u64 {
        if self.dead.contains(&handle.id) {
            0
        } else {
            self.process_memory_bytes
        }
    }

    fn process_name(&mut self, handle: &DummyHandle) -> Option<String> {
        self.names.get(&handle.id).cloned()
    }

    fn process_user(&mut self, _handle: &DummyHandle) -> Option<String> {
        Some("dummy".to_string())
    }

    fn system_memory_total_bytes(&mut self) -> u64 {
        self.memory_total_bytes
    }

    fn system_memory_available_bytes(&mut self) -> u64 {
        self.memory_available_bytes
    }
}

/// GPU source serving a fixed instance list.
#[derive(Debug, Default)]
pub struct DummyGpu {
    pub available: bool,
    pub instances: Vec<String>,
    pub utilization: HashMap<String, f64>,
    pub enumerations: usize,
}

impl DummyGpu {
    pub fn new() -> Self {
        Self {
            available: true,
            ..Default::default()
        }
    }

    pub fn with_instance(mut self, name: &str, utilization: f64) -> Self {
        self.instances.push(name.to_string());
        self.utilization.insert(name.to_string(), utilization);
        self
    }
}

impl GpuCounters for DummyGpu {
    fn is_available(&mut self) -> bool {
        self.available
    }

    fn enumerate_instances(&mut self) -> Vec<u8> {
        self.enumerations += 1;
        let mut builder = MultiStringBuilder::new();
        for name in &self.instances {
            builder.push(name);
        }
        builder.finish()
    }

    fn query_utilization(&mut self, path: GpuInstancePath) -> Option<f64> {
        self.utilization.get(path.as_str()).copied()
    }
}
