use crate::telemetry_group::CounterSource;
use log::{debug, warn};

/// The process currently being measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetIdentity {
    pub id: u64,
    /// False when there is no target or its handle could not be acquired
    pub is_valid: bool,
}

impl TargetIdentity {
    pub const NONE: TargetIdentity = TargetIdentity {
        id: 0,
        is_valid: false,
    };
}

/// Follows the target reported by the counter source and owns the handle
/// opened for it.
///
/// The handle is released exactly once: when a different target replaces it,
/// when it is found stale, or through [`TargetTracker::release`] at shutdown.
pub struct TargetTracker<H> {
    current: TargetIdentity,
    handle: Option<H>,
}

impl<H> Default for TargetTracker<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H> TargetTracker<H> {
    pub fn new() -> Self {
        Self {
            current: TargetIdentity::NONE,
            handle: None,
        }
    }

    pub fn handle(&self) -> Option<&H> {
        self.handle.as_ref()
    }

    /// Resolve the current target. The flag is true when the identity differs
    /// from the one returned by the previous call.
    pub fn resolve<S>(&mut self, source: &mut S) -> (TargetIdentity, bool)
    where
        S: CounterSource<Handle = H>,
    {
        let previous = self.current;

        let Some(id) = source.current_target_id() else {
            self.release(source);
            self.current = TargetIdentity::NONE;
            return (self.current, previous.is_valid);
        };

        if previous.id == id && self.handle.is_some() {
            return (previous, false);
        }

        if previous.id != id {
            self.release(source);
        }

        self.handle = source.acquire_handle(id);
        if self.handle.is_none() {
            debug!("Could not open target process {}, retrying next tick", id);
        }
        self.current = TargetIdentity {
            id,
            is_valid: self.handle.is_some(),
        };

        (self.current, self.current != previous)
    }

    /// Drop a handle whose process has exited. The next `resolve` starts over.
    pub fn invalidate<S>(&mut self, source: &mut S)
    where
        S: CounterSource<Handle = H>,
    {
        debug!("Target process {} is gone", self.current.id);
        self.release(source);
        self.current = TargetIdentity::NONE;
    }

    /// Hand the cached handle back to the source, if one is held.
    pub fn release<S>(&mut self, source: &mut S)
    where
        S: CounterSource<Handle = H>,
    {
        if let Some(handle) = self.handle.take() {
            source.release_handle(handle);
        }
        self.current.is_valid = false;
    }
}

impl<H> Drop for TargetTracker<H> {
    fn drop(&mut self) {
        if self.handle.is_some() {
            warn!(
                "Target tracker dropped while holding the handle of process {}",
                self.current.id
            );
        }
    }
}
