//! Funnel applying every slice to the aggregator.

use crate::error::Result;
use crate::scope::{Binder, TaskKind};
use crate::state::{Applied, StateAggregator};
use futures::StreamExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use super::slice::{Slice, SliceEvent, SliceStream};

/// Outcome counters for connected producers.
#[derive(Debug, Default)]
pub struct ProducerCounters {
    completed: AtomicU64,
    errors: AtomicU64,
}

impl ProducerCounters {
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::SeqCst)
    }
}

/// Accepts slices and applies them in arrival order.
pub struct SliceChannel {
    name: String,
    aggregator: Arc<StateAggregator>,
    binder: Arc<Binder>,
    counters: Arc<ProducerCounters>,
    next_producer: AtomicU64,
}

impl SliceChannel {
    pub fn new(name: impl Into<String>, aggregator: Arc<StateAggregator>, binder: Arc<Binder>) -> Self {
        Self {
            name: name.into(),
            aggregator,
            binder,
            counters: Arc::new(ProducerCounters::default()),
            next_producer: AtomicU64::new(1),
        }
    }

    /// Accept a slice. Literals are applied before this returns; producers
    /// are handed to their own task.
    pub fn submit(&self, slice: Slice) -> Result<()> {
        match slice {
            Slice::Literal(partial) => self.apply(SliceEvent::Merge(partial)).map(|_| ()),
            producer => self.drive(producer.into_events()),
        }
    }

    /// Apply one event synchronously.
    pub fn apply(&self, event: SliceEvent) -> Result<Applied> {
        let applied = apply_event(&self.aggregator, event)?;
        if applied.is_ended() {
            debug!(container = %self.name, "update after scope end ignored");
        }
        Ok(applied)
    }

    /// Drive a normalized event stream until it completes, fails, or the
    /// scope ends.
    pub fn drive(&self, events: SliceStream) -> Result<()> {
        if self.aggregator.is_ended() {
            debug!(container = %self.name, "connect after scope end ignored");
            return Ok(());
        }

        let producer = self.next_producer.fetch_add(1, Ordering::SeqCst);
        let task = run_producer(
            self.name.clone(),
            producer,
            Arc::clone(&self.aggregator),
            Arc::clone(&self.counters),
            events,
        );

        if self.binder.spawn(TaskKind::Producer, task)? {
            debug!(container = %self.name, producer, "producer connected");
        } else {
            debug!(container = %self.name, producer, "connect after scope end ignored");
        }
        Ok(())
    }

    pub fn counters(&self) -> &ProducerCounters {
        &self.counters
    }
}

fn apply_event(aggregator: &StateAggregator, event: SliceEvent) -> Result<Applied> {
    match event {
        SliceEvent::Merge(partial) => aggregator.apply(partial),
        SliceEvent::Reduce(reduce) => aggregator.apply_with(reduce),
    }
}

async fn run_producer(
    name: String,
    producer: u64,
    aggregator: Arc<StateAggregator>,
    counters: Arc<ProducerCounters>,
    mut events: SliceStream,
) {
    while let Some(item) = events.next().await {
        match item.and_then(|event| apply_event(&aggregator, event)) {
            Ok(Applied::Updated(_)) => {}
            Ok(Applied::Ended) => {
                debug!(container = %name, producer, "scope ended, producer stopped");
                return;
            }
            Err(e) => {
                counters.errors.fetch_add(1, Ordering::SeqCst);
                warn!(container = %name, producer, error = %e, "producer failed, keeping last good snapshot");
                return;
            }
        }
    }

    counters.completed.fetch_add(1, Ordering::SeqCst);
    debug!(container = %name, producer, "producer completed");
}
