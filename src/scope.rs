//! Scope handles and the lifecycle binder.
//!
//! A [`Scope`] is whatever lifetime a container is bound to: a UI component,
//! a request, a session. The container registers exactly one end-of-scope
//! callback; the [`Binder`] owns every task spawned on the container's behalf
//! and aborts them all when that callback fires.

use crate::error::{Result, StateError};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::debug;

/// Callback run when a scope ends.
pub type EndCallback = Box<dyn FnOnce() + Send + 'static>;

/// A lifetime boundary that can notify when it ends.
pub trait Scope {
    /// Register `callback` to run once when the scope ends.
    ///
    /// Runs immediately if the scope has already ended.
    fn on_end(&self, callback: EndCallback);
}

struct ScopeState {
    ended: bool,
    callbacks: Vec<EndCallback>,
}

struct ScopeInner {
    state: Mutex<ScopeState>,
}

impl ScopeInner {
    fn end(&self) -> bool {
        let callbacks = {
            let mut state = self.state.lock();
            if state.ended {
                return false;
            }
            state.ended = true;
            std::mem::take(&mut state.callbacks)
        };
        for callback in callbacks {
            callback();
        }
        true
    }
}

impl Drop for ScopeInner {
    fn drop(&mut self) {
        self.end();
    }
}

/// In-process scope. Ends on [`ScopeHandle::end`] or when the last clone drops.
#[derive(Clone)]
pub struct ScopeHandle {
    inner: Arc<ScopeInner>,
}

impl ScopeHandle {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ScopeInner {
                state: Mutex::new(ScopeState {
                    ended: false,
                    callbacks: Vec::new(),
                }),
            }),
        }
    }

    /// End the scope, running registered callbacks. Returns false if it had
    /// already ended.
    pub fn end(&self) -> bool {
        self.inner.end()
    }

    pub fn is_ended(&self) -> bool {
        self.inner.state.lock().ended
    }
}

impl Default for ScopeHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl Scope for ScopeHandle {
    fn on_end(&self, callback: EndCallback) {
        {
            let mut state = self.inner.state.lock();
            if !state.ended {
                state.callbacks.push(callback);
                return;
            }
        }
        callback();
    }
}

/// Kind of task tracked by the binder.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskKind {
    Producer,
    Effect,
}

struct Tracked {
    kind: TaskKind,
    handle: JoinHandle<()>,
}

struct BinderState {
    released: bool,
    tasks: Vec<Tracked>,
}

/// Owns every task spawned for one container.
pub struct Binder {
    name: String,
    runtime: Option<Handle>,
    state: Mutex<BinderState>,
}

impl Binder {
    pub fn new(name: impl Into<String>, runtime: Option<Handle>) -> Self {
        Self {
            name: name.into(),
            runtime,
            state: Mutex::new(BinderState {
                released: false,
                tasks: Vec::new(),
            }),
        }
    }

    /// Spawn `task` and keep its handle until release.
    ///
    /// Returns `Ok(false)` without spawning once released.
    pub fn spawn<F>(&self, kind: TaskKind, task: F) -> Result<bool>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let runtime = match &self.runtime {
            Some(handle) => handle.clone(),
            None => Handle::try_current().map_err(|_| StateError::NoRuntime)?,
        };

        let mut state = self.state.lock();
        if state.released {
            return Ok(false);
        }
        state.tasks.retain(|t| !t.handle.is_finished());
        let handle = runtime.spawn(task);
        state.tasks.push(Tracked { kind, handle });
        Ok(true)
    }

    /// Tasks of `kind` still running.
    pub fn active(&self, kind: TaskKind) -> usize {
        self.state
            .lock()
            .tasks
            .iter()
            .filter(|t| t.kind == kind && !t.handle.is_finished())
            .count()
    }

    /// Abort every tracked task. Idempotent.
    pub fn release(&self) -> usize {
        let tasks = {
            let mut state = self.state.lock();
            state.released = true;
            std::mem::take(&mut state.tasks)
        };

        let count = tasks.len();
        for tracked in tasks {
            tracked.handle.abort();
        }
        if count > 0 {
            debug!(container = %self.name, tasks = count, "aborted tasks");
        }
        count
    }

    pub fn is_released(&self) -> bool {
        self.state.lock().released
    }
}
