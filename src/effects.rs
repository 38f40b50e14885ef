//! Effect runner: streams held purely for their side effects.

use crate::error::Result;
use crate::scope::{Binder, TaskKind};
use futures::stream::{TryStream, TryStreamExt};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Runs held effects, discarding whatever they emit.
pub struct EffectRunner {
    name: String,
    binder: Arc<Binder>,
    errors: Arc<AtomicU64>,
    next_effect: AtomicU64,
}

impl EffectRunner {
    pub fn new(name: impl Into<String>, binder: Arc<Binder>) -> Self {
        Self {
            name: name.into(),
            binder,
            errors: Arc::new(AtomicU64::new(0)),
            next_effect: AtomicU64::new(1),
        }
    }

    /// Subscribe to `effect` immediately and drain it until it completes,
    /// errors, or the scope ends. A failing effect only stops itself.
    pub fn hold<S>(&self, effect: S) -> Result<()>
    where
        S: TryStream + Send + 'static,
        S::Error: fmt::Display,
    {
        let id = self.next_effect.fetch_add(1, Ordering::SeqCst);
        let name = self.name.clone();
        let errors = Arc::clone(&self.errors);

        let task = async move {
            let effect = effect.into_stream();
            futures::pin_mut!(effect);
            loop {
                match effect.try_next().await {
                    Ok(Some(_)) => {}
                    Ok(None) => {
                        debug!(container = %name, effect = id, "effect completed");
                        return;
                    }
                    Err(e) => {
                        errors.fetch_add(1, Ordering::SeqCst);
                        warn!(container = %name, effect = id, error = %e, "effect failed");
                        return;
                    }
                }
            }
        };

        if !self.binder.spawn(TaskKind::Effect, task)? {
            debug!(container = %self.name, effect = id, "hold after scope end ignored");
        }
        Ok(())
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::SeqCst)
    }

    pub fn active(&self) -> usize {
        self.binder.active(TaskKind::Effect)
    }
}
