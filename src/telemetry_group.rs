use crate::delta::{CumulativeSample, DeltaEngine};
use crate::gpu_path::{GpuInstancePath, find_instance};
use crate::target::{TargetIdentity, TargetTracker};
use crate::utils::errors::TelemetryError;
use crate::utils::trace_rotation::RotatingTrace;
use chrono::{DateTime, Utc};
use log::{debug, info, trace, warn};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinHandle;

/// Default refresh interval
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(250);
const KB_DIVISOR: u64 = 1024;

#[derive(Debug, Clone)]
pub struct SamplerConfig {
    /// Time between two samples
    pub interval: Duration,
    /// Window kept by the snapshot history
    pub history_retention_seconds: i64,
    /// Capacity of the worker to owner event channel
    pub channel_capacity: usize,
    /// Sample GPU counters when a GPU source is attached and available
    pub gpu_enabled: bool,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            history_retention_seconds: 3600,
            channel_capacity: 64,
            gpu_enabled: true,
        }
    }
}

impl SamplerConfig {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            ..Self::default()
        }
    }

    pub fn with_history_retention_seconds(mut self, seconds: i64) -> Self {
        self.history_retention_seconds = seconds;
        self
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    pub fn with_gpu_enabled(mut self, enabled: bool) -> Self {
        self.gpu_enabled = enabled;
        self
    }

    fn validate(&self) -> Result<(), TelemetryError> {
        if self.interval.is_zero() {
            return Err(TelemetryError::Other("Sampling interval must be non-zero".to_string()));
        }
        if self.channel_capacity == 0 {
            return Err(TelemetryError::Other("Channel capacity must be non-zero".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplerState {
    Created,
    Running,
    StopRequested,
    Stopped,
}

/// Values published once per tick.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UtilizationSnapshot {
    /// 1-based tick counter, 0 before the first sample
    pub tick: u64,
    pub sampled_at: DateTime<Utc>,
    pub total_cpu_fraction: f64,
    pub process_cpu_fraction: f64,
    pub memory_total_kb: u64,
    /// Total minus available memory; may briefly exceed the total
    pub memory_used_kb: u64,
    pub memory_process_kb: u64,
    pub target_id: Option<u64>,
    pub target_name: Option<String>,
    /// `None` when GPU counters are unavailable or there is no target
    pub gpu_3d_fraction: Option<f64>,
}

impl UtilizationSnapshot {
    pub fn total_cpu_percent(&self) -> f64 {
        self.total_cpu_fraction * 100.0
    }

    pub fn process_cpu_percent(&self) -> f64 {
        self.process_cpu_fraction * 100.0
    }
}

impl fmt::Display for UtilizationSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cpu {:.1} % | {} {:.1} % | mem {}/{} KB | proc {} KB",
            self.total_cpu_percent(),
            self.target_name.as_deref().unwrap_or("-"),
            self.process_cpu_percent(),
            self.memory_used_kb,
            self.memory_total_kb,
            self.memory_process_kb,
        )?;
        if let Some(gpu) = self.gpu_3d_fraction {
            write!(f, " | 3D {:.1} %", gpu * 100.0)?;
        }
        Ok(())
    }
}

/// Notification that the tracked process changed. All fields are `None`
/// when there is no target any more.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetChange {
    pub id: Option<u64>,
    pub name: Option<String>,
    pub user: Option<String>,
}

#[derive(Debug, Clone)]
pub enum SamplerEvent {
    Sample(UtilizationSnapshot),
    TargetChanged(TargetChange),
}

/// Background sampler of system and target process utilization
/// # Type Parameters
/// * `S` - A counter source that implements `CounterSource`
pub struct TelemetryGroup<S: CounterSource> {
    config: SamplerConfig,
    state: SamplerState,
    /// Counter source; moved into the worker while running
    source: Option<S>,
    /// GPU source; moved into the worker on start
    gpu: Option<Box<dyn GpuCounters>>,
    gpu_available: bool,
    /// Snapshots received through `poll_data`
    history: RotatingTrace,
    is_running: Arc<AtomicBool>,
    stop_signal: Arc<Notify>,
    snapshot_tx: Option<watch::Sender<UtilizationSnapshot>>,
    snapshot_rx: watch::Receiver<UtilizationSnapshot>,
    task_handle: Option<JoinHandle<S>>,
    event_receiver: Option<mpsc::Receiver<SamplerEvent>>,
}

impl<S: CounterSource> TelemetryGroup<S> {
    pub fn create_with_source(source: S, config: SamplerConfig) -> Result<Self, TelemetryError> {
        config.validate()?;
        let (snapshot_tx, snapshot_rx) = watch::channel(UtilizationSnapshot::default());

        Ok(Self {
            history: RotatingTrace::new(config.history_retention_seconds),
            config,
            state: SamplerState::Created,
            source: Some(source),
            gpu: None,
            gpu_available: false,
            is_running: Arc::new(AtomicBool::new(false)),
            stop_signal: Arc::new(Notify::new()),
            snapshot_tx: Some(snapshot_tx),
            snapshot_rx,
            task_handle: None,
            event_receiver: None,
        })
    }

    /// Convenience constructor using the default source for `S`.
    pub fn new(config: SamplerConfig) -> Result<Self, TelemetryError>
    where
        S: Default,
    {
        Self::create_with_source(S::default(), config)
    }

    /// Attach GPU counters. Availability is checked once, in `start`.
    pub fn with_gpu(mut self, gpu: impl GpuCounters) -> Self {
        self.gpu = Some(Box::new(gpu));
        self
    }

    pub fn state(&self) -> SamplerState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Acquire)
    }

    pub fn refresh_interval(&self) -> Duration {
        self.config.interval
    }

    /// Whether GPU metrics are being sampled. Fixed at `start`.
    pub fn gpu_available(&self) -> bool {
        self.gpu_available
    }

    /// Most recently published snapshot. Never blocks on the worker.
    pub fn current_snapshot(&self) -> UtilizationSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    /// Receiver that is notified on every published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<UtilizationSnapshot> {
        self.snapshot_rx.clone()
    }

    pub fn history(&self) -> &RotatingTrace {
        &self.history
    }

    /// The counter source, unless the worker currently owns it.
    pub fn source(&self) -> Option<&S> {
        self.source.as_ref()
    }

    /// Spawn the sampling worker on the current tokio runtime.
    ///
    /// # Panics
    /// If the group is running or has already been stopped.
    pub fn start(&mut self) -> Result<(), TelemetryError> {
        match self.state {
            SamplerState::Created => {}
            SamplerState::Running | SamplerState::StopRequested => {
                panic!("TelemetryGroup::start called while already running")
            }
            SamplerState::Stopped => panic!("TelemetryGroup::start called after stop"),
        }

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| TelemetryError::Runtime(format!("No tokio runtime to sample on: {}", e)))?;
        let (Some(mut source), Some(snapshot_tx)) = (self.source.take(), self.snapshot_tx.take())
        else {
            return Err(TelemetryError::Other("Sampler is missing its counter source".to_string()));
        };

        let gpu = match self.gpu.take() {
            Some(_) if !self.config.gpu_enabled => None,
            Some(mut gpu) => {
                if gpu.is_available() {
                    Some(gpu)
                } else {
                    warn!("GPU counters unavailable, GPU utilization will not be reported");
                    None
                }
            }
            None => None,
        };
        self.gpu_available = gpu.is_some();

        let cores = source.logical_core_count();
        let engine = DeltaEngine::for_interval(self.config.interval, cores);

        let (tx, rx) = mpsc::channel(self.config.channel_capacity);
        self.event_receiver = Some(rx);

        let worker = Worker {
            source,
            gpu,
            tracker: TargetTracker::new(),
            engine,
            target_name: None,
            tick: 0,
            snapshot_tx,
            events: tx,
        };

        self.is_running.store(true, Ordering::Release);
        let handle = runtime.spawn(worker.run(
            Arc::clone(&self.is_running),
            Arc::clone(&self.stop_signal),
            self.config.interval,
        ));
        self.task_handle = Some(handle);
        self.state = SamplerState::Running;

        info!(
            "Sampling started every {:?} on {} logical cores (gpu: {})",
            self.config.interval, cores, self.gpu_available
        );
        Ok(())
    }

    /// Request a stop and wait until the worker has exited and released the
    /// target handle. Nothing is published after this returns.
    ///
    /// # Panics
    /// If the group is not running.
    pub async fn stop(&mut self) -> Result<(), TelemetryError> {
        if self.state != SamplerState::Running {
            panic!("TelemetryGroup::stop called in state {:?}", self.state);
        }
        self.state = SamplerState::StopRequested;
        self.is_running.store(false, Ordering::Release);
        self.stop_signal.notify_one();

        let joined = match self.task_handle.take() {
            Some(handle) => handle.await,
            None => {
                self.state = SamplerState::Stopped;
                return Err(TelemetryError::Other("Sampler has no worker to join".to_string()));
            }
        };
        self.state = SamplerState::Stopped;

        let source = joined.map_err(|e| TelemetryError::WorkerPanicked(e.to_string()))?;
        self.source = Some(source);
        info!("Sampling stopped");
        Ok(())
    }

    /// Drain events sent by the worker: samples go to the history, target
    /// changes are returned oldest first.
    pub fn poll_data(&mut self) -> Result<Vec<TargetChange>, TelemetryError> {
        let mut samples = Vec::new();
        let mut changes = Vec::new();

        if let Some(rx) = &mut self.event_receiver {
            while let Ok(event) = rx.try_recv() {
                match event {
                    SamplerEvent::Sample(snapshot) => samples.push(snapshot),
                    SamplerEvent::TargetChanged(change) => changes.push(change),
                }
            }
        }

        self.history.append_snapshots(&samples)?;
        Ok(changes)
    }
}

impl<S: CounterSource> Drop for TelemetryGroup<S> {
    /// Dropping a running group only signals the worker. If the runtime shuts
    /// down before the worker wakes, the task is cancelled and the target handle
    /// is never released; only `stop().await` guarantees the release.
    fn drop(&mut self) {
        if self.state == SamplerState::Running {
            debug!("TelemetryGroup dropped while running, signalling worker to exit");
            self.is_running.store(false, Ordering::Release);
            self.stop_signal.notify_one();
        }
    }
}

/// State owned by the background task. Nothing in here is shared.
struct Worker<S: CounterSource> {
    source: S,
    gpu: Option<Box<dyn GpuCounters>>,
    tracker: TargetTracker<S::Handle>,
    engine: DeltaEngine,
    target_name: Option<String>,
    tick: u64,
    snapshot_tx: watch::Sender<UtilizationSnapshot>,
    events: mpsc::Sender<SamplerEvent>,
}

impl<S: CounterSource> Worker<S> {
    async fn run(mut self, is_running: Arc<AtomicBool>, stop_signal: Arc<Notify>, interval: Duration) -> S {
        while is_running.load(Ordering::Acquire) {
            self.sample_once();

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = stop_signal.notified() => {}
            }
        }

        self.tracker.release(&mut self.source);
        debug!("Sampling worker exited after {} ticks", self.tick);
        self.source
    }

    /// One resolve, sample, compute, publish cycle.
    fn sample_once(&mut self) {
        self.tick += 1;

        let (mut identity, changed) = self.tracker.resolve(&mut self.source);
        if changed {
            // The previous process time is meaningless for the new target.
            self.engine.invalidate_process_baseline();
            self.announce_target(identity);
        }

        self.source.begin_tick();
        let total_cpu_time = self.source.total_cpu_time();

        let mut process_cpu_time = None;
        let mut process_memory_bytes = 0;
        let mut stale = false;
        if let Some(handle) = self.tracker.handle() {
            process_cpu_time = self.source.process_cpu_time(handle);
            if process_cpu_time.is_some() {
                process_memory_bytes = self.source.process_memory_bytes(handle);
            } else {
                stale = !self.source.is_handle_alive(handle);
            }
        }
        if stale {
            self.tracker.invalidate(&mut self.source);
            identity = TargetIdentity::NONE;
            self.announce_target(identity);
        }

        let memory_total = self.source.system_memory_total_bytes();
        let memory_available = self.source.system_memory_available_bytes();
        let sample = CumulativeSample {
            total_cpu_time,
            process_cpu_time: process_cpu_time.unwrap_or(0),
            process_memory_bytes,
            system_memory_used_bytes: memory_total.saturating_sub(memory_available),
            system_memory_total_bytes: memory_total,
        };
        trace!("Tick {}: {:?}", self.tick, sample);

        if process_cpu_time.is_none() {
            self.engine.invalidate_process_baseline();
        }
        let pair = self.engine.update(&sample);
        if process_cpu_time.is_none() {
            self.engine.invalidate_process_baseline();
        }

        let gpu_3d_fraction = self.sample_gpu(identity);

        let snapshot = UtilizationSnapshot {
            tick: self.tick,
            sampled_at: Utc::now(),
            total_cpu_fraction: pair.total_cpu_fraction,
            process_cpu_fraction: pair.process_cpu_fraction,
            memory_total_kb: sample.system_memory_total_bytes / KB_DIVISOR,
            memory_used_kb: sample.system_memory_used_bytes / KB_DIVISOR,
            memory_process_kb: sample.process_memory_bytes / KB_DIVISOR,
            target_id: identity.is_valid.then_some(identity.id),
            target_name: self.target_name.clone(),
            gpu_3d_fraction,
        };
        debug!("Tick {}: {}", self.tick, snapshot);

        self.snapshot_tx.send_replace(snapshot.clone());
        self.emit(SamplerEvent::Sample(snapshot));
    }

    fn sample_gpu(&mut self, identity: TargetIdentity) -> Option<f64> {
        let gpu = self.gpu.as_mut()?;
        if !identity.is_valid {
            return None;
        }

        let instances = gpu.enumerate_instances();
        let utilization = match find_instance(identity.id, &instances) {
            Some(path) => gpu.query_utilization(path).unwrap_or(0.0),
            None => 0.0,
        };
        Some(if utilization.is_nan() { 0.0 } else { utilization.clamp(0.0, 1.0) })
    }

    fn announce_target(&mut self, identity: TargetIdentity) {
        let change = match self.tracker.handle() {
            Some(handle) if identity.is_valid => TargetChange {
                id: Some(identity.id),
                name: self.source.process_name(handle),
                user: self.source.process_user(handle),
            },
            _ => TargetChange {
                id: (identity != TargetIdentity::NONE).then_some(identity.id),
                name: None,
                user: None,
            },
        };

        match (&change.id, &change.name) {
            (Some(id), Some(name)) => info!("Target changed to {} ({})", name, id),
            (Some(id), None) => info!("Target changed to process {} (not accessible)", id),
            _ => info!("No target process"),
        }

        self.target_name = change.name.clone();
        self.emit(SamplerEvent::TargetChanged(change));
    }

    /// Never waits: the inter-tick sleep is the only suspension point.
    fn emit(&self, event: SamplerEvent) {
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => debug!("Event channel full, dropping event"),
            Err(TrySendError::Closed(_)) => trace!("Event receiver gone"),
        }
    }
}

/// Raw counters consumed by the sampler. Every query may fail by returning
/// `None` or zero; failures are never fatal.
pub trait CounterSource: Send + 'static {
    /// Open reference to a target process, released through `release_handle`
    type Handle: Send + 'static;

    /// Called once per tick before any counter is read.
    fn begin_tick(&mut self) {}

    fn logical_core_count(&mut self) -> usize;

    /// Busy CPU time summed over all cores since boot
    fn total_cpu_time(&mut self) -> u64;

    /// Identifier of the process that should be tracked right now
    fn current_target_id(&mut self) -> Option<u64>;

    fn acquire_handle(&mut self, id: u64) -> Option<Self::Handle>;

    fn release_handle(&mut self, handle: Self::Handle);

    fn is_handle_alive(&mut self, handle: &Self::Handle) -> bool;

    /// CPU time consumed by the process, `None` if it cannot be read
    fn process_cpu_time(&mut self, handle: &Self::Handle) -> Option<u64>;

    fn process_memory_bytes(&mut self, handle: &Self::Handle) -> u64;

    fn process_name(&mut self, handle: &Self::Handle) -> Option<String>;

    fn process_user(&mut self, _handle: &Self::Handle) -> Option<String> {
        None
    }

    fn system_memory_total_bytes(&mut self) -> u64;

    fn system_memory_available_bytes(&mut self) -> u64;
}

/// Per-process GPU engine counters.
pub trait GpuCounters: Send + 'static {
    /// Check whether the counters can be read on this system
    fn is_available(&mut self) -> bool;

    /// Current instance names as a NUL delimited, doubly terminated list
    fn enumerate_instances(&mut self) -> Vec<u8>;

    /// Utilization in `[0, 1]` of an instance from the latest enumeration
    fn query_utilization(&mut self, path: GpuInstancePath) -> Option<f64>;
}
