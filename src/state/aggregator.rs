//! The running snapshot and its single critical section.

use crate::error::Result;
use crate::types::{Partial, Snapshot, Version};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, trace};

use super::operations::{merge, validate_keys};

/// Downstream receiver of every applied snapshot.
pub trait SnapshotSink: Send + Sync {
    /// Called inside the critical section with the new snapshot.
    ///
    /// Returns the number of consumers still attached; zero detaches the sink.
    fn on_snapshot(&self, snapshot: &Arc<Snapshot>) -> usize;
}

/// Outcome of an apply call.
#[derive(Clone, Debug)]
pub enum Applied {
    /// The update was folded in, producing this snapshot.
    Updated(Arc<Snapshot>),
    /// The owning scope has ended; nothing was applied.
    Ended,
}

impl Applied {
    pub fn is_ended(&self) -> bool {
        matches!(self, Applied::Ended)
    }
}

/// State guarded by the critical section.
struct Critical {
    sink: Option<Weak<dyn SnapshotSink>>,
}

/// Folds partial updates into the authoritative snapshot.
pub struct StateAggregator {
    name: String,
    /// Closed key set updates are validated against.
    keys: &'static [&'static str],
    /// Latest snapshot, read without entering the critical section.
    current: RwLock<Arc<Snapshot>>,
    /// Set under `critical`, readable without it.
    ended: AtomicBool,
    critical: Mutex<Critical>,
}

impl StateAggregator {
    pub fn new(name: impl Into<String>, keys: &'static [&'static str]) -> Self {
        Self {
            name: name.into(),
            keys,
            current: RwLock::new(Arc::new(Snapshot::default())),
            ended: AtomicBool::new(false),
            critical: Mutex::new(Critical { sink: None }),
        }
    }

    pub fn keys(&self) -> &'static [&'static str] {
        self.keys
    }

    /// Latest snapshot. Never blocks on in-flight producers.
    pub fn current(&self) -> Arc<Snapshot> {
        Arc::clone(&*self.current.read())
    }

    pub fn version(&self) -> Version {
        self.current.read().version()
    }

    /// Merge a literal partial.
    pub fn apply(&self, partial: Partial) -> Result<Applied> {
        self.apply_with(move |_| Ok(partial))
    }

    /// Compute a partial from the current snapshot and merge it atomically.
    ///
    /// `reduce` runs inside the critical section. It may call `current`,
    /// `version` and `is_ended`, but must not apply updates or attach a sink
    /// (`apply`, `apply_with`, `attach_with`), which would deadlock.
    pub fn apply_with<F>(&self, reduce: F) -> Result<Applied>
    where
        F: FnOnce(&Snapshot) -> Result<Partial>,
    {
        let mut critical = self.critical.lock();
        if self.ended.load(Ordering::SeqCst) {
            return Ok(Applied::Ended);
        }

        let previous = self.current();
        let partial = reduce(&previous)?;
        validate_keys(&partial, self.keys)?;

        let next = Arc::new(merge(&previous, partial));
        *self.current.write() = Arc::clone(&next);
        trace!(container = %self.name, version = %next.version(), "applied update");

        if let Some(weak) = critical.sink.as_ref() {
            let remaining = match weak.upgrade() {
                Some(sink) => sink.on_snapshot(&next),
                None => 0,
            };
            if remaining == 0 {
                critical.sink = None;
                debug!(container = %self.name, "distribution detached (no subscribers)");
            }
        }

        Ok(Applied::Updated(next))
    }

    /// Attach `sink` if not already attached, then run `register` with the
    /// current snapshot while no update can interleave.
    ///
    /// `register` receives `true` when this call performed the attachment.
    /// Returns `None` once the scope has ended.
    pub fn attach_with<R>(
        &self,
        sink: Weak<dyn SnapshotSink>,
        register: impl FnOnce(&Arc<Snapshot>, bool) -> R,
    ) -> Option<R> {
        let mut critical = self.critical.lock();
        if self.ended.load(Ordering::SeqCst) {
            return None;
        }

        let newly_attached = critical.sink.is_none();
        if newly_attached {
            critical.sink = Some(sink);
            debug!(container = %self.name, "distribution attached");
        }

        let current = self.current();
        Some(register(&current, newly_attached))
    }

    /// Detach the sink if `idle` still holds inside the critical section.
    pub fn detach_if(&self, idle: impl FnOnce() -> bool) -> bool {
        let mut critical = self.critical.lock();
        if critical.sink.is_some() && idle() {
            critical.sink = None;
            debug!(container = %self.name, "distribution detached (last subscriber left)");
            return true;
        }
        false
    }

    pub fn is_attached(&self) -> bool {
        self.critical.lock().sink.is_some()
    }

    /// Stop accepting updates. Returns true only for the first call.
    pub fn end(&self) -> bool {
        let mut critical = self.critical.lock();
        if self.ended.swap(true, Ordering::SeqCst) {
            return false;
        }
        critical.sink = None;
        true
    }

    /// Never takes the critical section, so reducers may call it.
    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }
}
