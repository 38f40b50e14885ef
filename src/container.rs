//! Main StateContainer tying all components together.

use crate::effects::EffectRunner;
use crate::error::{Result, StateError};
use crate::scope::{Binder, Scope, TaskKind};
use crate::slices::{Slice, SliceChannel, SliceEvent};
use crate::state::{validate_keys, StateAggregator};
use crate::subscriptions::{Selection, SelectionHandle, SubscriptionHub};
use crate::types::{ContainerStats, Partial, Snapshot, StateShape};
use futures::future;
use futures::stream::{Stream, StreamExt, TryStream, TryStreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tracing::{debug, warn};

/// Container configuration.
#[derive(Clone, Debug)]
pub struct ContainerConfig {
    /// Label attached to every log event.
    pub name: String,

    /// Max buffered snapshots per subscriber. A subscriber further behind
    /// skips ahead to the newest snapshot.
    /// Default: 1024
    pub buffer_size: usize,

    /// Seed applied at construction (None = start empty).
    pub initial: Option<Partial>,

    /// Runtime for producer and effect tasks (None = ambient runtime at
    /// `connect`/`hold` time).
    pub runtime: Option<Handle>,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            name: "state".to_string(),
            buffer_size: 1024,
            initial: None,
            runtime: None,
        }
    }
}

/// Shared internals; end-of-scope teardown runs here.
struct Core {
    name: String,
    aggregator: Arc<StateAggregator>,
    hub: Arc<SubscriptionHub>,
    slices: SliceChannel,
    effects: EffectRunner,
    binder: Arc<Binder>,
}

impl Core {
    fn teardown(&self) {
        if !self.aggregator.end() {
            return;
        }
        let tasks = self.binder.release();
        self.hub.close();
        debug!(container = %self.name, tasks, "scope ended, container released");
    }
}

impl Drop for Core {
    // Last container handle gone before the scope ended
    fn drop(&mut self) {
        self.teardown();
    }
}

/// A scope-bound reactive state container.
///
/// Provides a unified interface for:
/// - Reading the current snapshot (`get`, `get_key`, `get_as`)
/// - Literal and reducer updates (`set`, `update`)
/// - Streaming updates from producers (`connect`, `connect_key`, `connect_with`)
/// - Multicast reads (`select`, `select_key`, `select_with`, `watch`)
/// - Side effects bound to the scope (`hold`)
///
/// Every method is a no-op once the owning scope has ended: writes return
/// `Ok(())` without effect and new selections end immediately. Dropping the
/// last handle before the scope ends releases the container the same way.
pub struct StateContainer<S: StateShape> {
    core: Arc<Core>,
    _shape: PhantomData<fn() -> S>,
}

impl<S: StateShape> Clone for StateContainer<S> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
            _shape: PhantomData,
        }
    }
}

impl<S: StateShape> StateContainer<S> {
    /// Create a container bound to `scope` with default configuration.
    pub fn new(scope: &impl Scope) -> Result<Self> {
        Self::with_config(scope, ContainerConfig::default())
    }

    /// Create a container bound to `scope`.
    pub fn with_config(scope: &impl Scope, config: ContainerConfig) -> Result<Self> {
        if let Some(initial) = config.initial.as_ref() {
            validate_keys(initial, S::KEYS)?;
        }

        let aggregator = Arc::new(StateAggregator::new(config.name.clone(), S::KEYS));
        let binder = Arc::new(Binder::new(config.name.clone(), config.runtime));
        let hub = Arc::new(SubscriptionHub::new(
            config.name.clone(),
            Arc::clone(&aggregator),
            config.buffer_size,
        ));
        let slices = SliceChannel::new(config.name.clone(), Arc::clone(&aggregator), Arc::clone(&binder));
        let effects = EffectRunner::new(config.name.clone(), Arc::clone(&binder));

        if let Some(initial) = config.initial {
            aggregator.apply(initial)?;
        }

        let core = Arc::new(Core {
            name: config.name,
            aggregator,
            hub,
            slices,
            effects,
            binder,
        });

        let weak: Weak<Core> = Arc::downgrade(&core);
        scope.on_end(Box::new(move || {
            if let Some(core) = weak.upgrade() {
                core.teardown();
            }
        }));

        Ok(Self {
            core,
            _shape: PhantomData,
        })
    }

    // --- Imperative Reads ---

    /// Current snapshot, possibly partially populated.
    pub fn get(&self) -> Arc<Snapshot> {
        self.core.aggregator.current()
    }

    /// Current value for `key`, `None` if never written.
    pub fn get_key(&self, key: &str) -> Option<Value> {
        self.get().get(key).cloned()
    }

    /// Current value for `key`, decoded.
    pub fn get_as<V: DeserializeOwned>(&self, key: &str) -> Result<Option<V>> {
        self.get().get_as(key)
    }

    /// Full typed state, once every key has been written.
    pub fn state(&self) -> Result<S> {
        self.get().decode()
    }

    // --- Writes ---

    /// Merge a literal partial. Applied before this returns.
    pub fn set(&self, partial: Partial) -> Result<()> {
        self.core.slices.submit(Slice::Literal(partial))
    }

    /// Merge one key.
    pub fn set_key<V: Serialize>(&self, key: &str, value: V) -> Result<()> {
        self.set(Partial::single(key, value)?)
    }

    /// Compute a partial from the current snapshot and merge it atomically.
    ///
    /// `reduce` runs inside the critical section. It may read this container
    /// (`get`, `is_ended`, `stats`) but must not call `set`, `update`,
    /// `select` or `watch` on it, which would deadlock.
    pub fn update<F>(&self, reduce: F) -> Result<()>
    where
        F: FnOnce(&Snapshot) -> Partial + Send + 'static,
    {
        self.core
            .slices
            .apply(SliceEvent::Reduce(Box::new(move |snapshot: &Snapshot| {
                Ok::<_, StateError>(reduce(snapshot))
            })))
            .map(|_| ())
    }

    /// Merge every partial `producer` emits, for as long as it emits.
    ///
    /// A producer that completes is dropped; its contributions stay. A
    /// producer that errors stops, and the error is logged and counted.
    pub fn connect<P>(&self, producer: P) -> Result<()>
    where
        P: TryStream<Ok = Partial> + Send + 'static,
        P::Error: fmt::Display,
    {
        self.core.slices.submit(Slice::stream(producer))
    }

    /// Merge every value `producer` emits under `key`.
    pub fn connect_key<P, V>(&self, key: &str, producer: P) -> Result<()>
    where
        P: TryStream<Ok = V> + Send + 'static,
        P::Error: fmt::Display,
        V: Serialize,
    {
        if self.is_ended() {
            debug!(container = %self.core.name, key, "connect after scope end ignored");
            return Ok(());
        }
        if !S::is_key(key) {
            return Err(StateError::UnknownKey(key.to_string()));
        }
        self.core.slices.submit(Slice::keyed(key, producer))
    }

    /// Merge `project(current, item)` for every item `producer` emits.
    ///
    /// Like [`update`](Self::update), `project` runs inside the critical
    /// section: it may read this container but must not call `set`,
    /// `update`, `select` or `watch` on it.
    pub fn connect_with<P, F>(&self, producer: P, project: F) -> Result<()>
    where
        P: TryStream + Send + 'static,
        P::Ok: Send + 'static,
        P::Error: fmt::Display,
        F: Fn(&Snapshot, P::Ok) -> Partial + Send + Sync + 'static,
    {
        let project = Arc::new(project);
        let events = producer
            .into_stream()
            .map(move |item| match item {
                Ok(value) => {
                    let project = Arc::clone(&project);
                    Ok(SliceEvent::Reduce(Box::new(move |snapshot: &Snapshot| {
                        Ok::<_, StateError>(project(snapshot, value))
                    })))
                }
                Err(e) => Err(StateError::Producer(e.to_string())),
            })
            .boxed();
        self.core.slices.drive(events)
    }

    // --- Reactive Reads ---

    /// Stream of full snapshots, replaying the current one first.
    pub fn select(&self) -> Selection {
        self.core.hub.select()
    }

    /// Stream of one key's value, derived from [`select`](Self::select).
    pub fn select_key(&self, key: &str) -> impl Stream<Item = Option<Value>> + Send + Unpin {
        let key = key.to_string();
        self.select().map(move |snapshot| snapshot.get(&key).cloned())
    }

    /// Stream of one key's decoded value. Undecodable values are logged and
    /// skipped.
    pub fn select_as<V>(&self, key: &str) -> impl Stream<Item = Option<V>> + Send + Unpin
    where
        V: DeserializeOwned + Send + 'static,
    {
        let key = key.to_string();
        let name = self.core.name.clone();
        self.select().filter_map(move |snapshot| {
            let decoded = match snapshot.get_as::<V>(&key) {
                Ok(value) => Some(value),
                Err(e) => {
                    warn!(container = %name, error = %e, "skipping undecodable value");
                    None
                }
            };
            future::ready(decoded)
        })
    }

    /// Stream of an arbitrary projection over snapshots.
    pub fn select_with<R, F>(&self, project: F) -> impl Stream<Item = R> + Send + Unpin
    where
        F: FnMut(&Snapshot) -> R + Send + Unpin + 'static,
    {
        let mut project = project;
        self.select().map(move |snapshot| project(snapshot.as_ref()))
    }

    /// Blocking subscription, for hosts without an async runtime.
    pub fn watch(&self) -> SelectionHandle {
        self.core.hub.watch()
    }

    // --- Effects ---

    /// Run `effect` for its side effects only; emitted items are discarded.
    pub fn hold<E>(&self, effect: E) -> Result<()>
    where
        E: TryStream + Send + 'static,
        E::Error: fmt::Display,
    {
        if self.core.aggregator.is_ended() {
            debug!(container = %self.core.name, "hold after scope end ignored");
            return Ok(());
        }
        self.core.effects.hold(effect)
    }

    // --- Lifecycle ---

    /// Whether the owning scope has ended.
    pub fn is_ended(&self) -> bool {
        self.core.aggregator.is_ended()
    }

    pub fn stats(&self) -> ContainerStats {
        let snapshot = self.get();
        let counters = self.core.slices.counters();
        ContainerStats {
            version: snapshot.version(),
            key_count: snapshot.len(),
            subscriber_count: self.core.hub.subscription_count(),
            active_producers: self.core.binder.active(TaskKind::Producer),
            active_effects: self.core.effects.active(),
            producers_completed: counters.completed(),
            producer_errors: counters.errors(),
            effect_errors: self.core.effects.errors(),
            hub_activations: self.core.hub.activations(),
            ended: self.is_ended(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::ScopeHandle;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Counter {
        count: i64,
        label: String,
    }

    impl StateShape for Counter {
        const KEYS: &'static [&'static str] = &["count", "label"];
    }

    #[test]
    fn test_set_and_get() {
        let scope = ScopeHandle::new();
        let container = StateContainer::<Counter>::new(&scope).unwrap();

        assert!(container.get().is_empty());
        assert_eq!(container.get_key("count"), None);

        container.set_key("count", 1).unwrap();
        container.set_key("label", "clicks").unwrap();

        assert_eq!(container.get_key("count"), Some(json!(1)));
        assert_eq!(container.get_as::<String>("label").unwrap(), Some("clicks".to_string()));
        assert_eq!(
            container.state().unwrap(),
            Counter {
                count: 1,
                label: "clicks".into()
            }
        );
    }

    #[test]
    fn test_update_reads_current() {
        let scope = ScopeHandle::new();
        let container = StateContainer::<Counter>::new(&scope).unwrap();
        container.set_key("count", 41).unwrap();

        container
            .update(|snapshot| {
                let count: i64 = snapshot.get_as("count").ok().flatten().unwrap_or(0);
                Partial::single("count", count + 1).unwrap_or_default()
            })
            .unwrap();

        assert_eq!(container.get_as::<i64>("count").unwrap(), Some(42));
    }

    #[test]
    fn test_initial_seed() {
        let scope = ScopeHandle::new();
        let config = ContainerConfig {
            initial: Some(Partial::single("label", "seed").unwrap()),
            ..Default::default()
        };
        let container = StateContainer::<Counter>::with_config(&scope, config).unwrap();

        assert_eq!(container.get_key("label"), Some(json!("seed")));
        assert_eq!(container.stats().version.0, 1);
    }

    #[test]
    fn test_initial_seed_with_unknown_key_fails() {
        let scope = ScopeHandle::new();
        let config = ContainerConfig {
            initial: Some(Partial::single("nope", 1).unwrap()),
            ..Default::default()
        };
        let result = StateContainer::<Counter>::with_config(&scope, config);
        assert!(matches!(result, Err(StateError::UnknownKey(_))));
    }

    #[test]
    fn test_connect_key_rejects_unknown_key() {
        let scope = ScopeHandle::new();
        let container = StateContainer::<Counter>::new(&scope).unwrap();
        let producer = futures::stream::iter(vec![Ok::<_, String>(1)]);

        assert!(matches!(
            container.connect_key("nope", producer),
            Err(StateError::UnknownKey(_))
        ));
    }

    #[test]
    fn test_connect_outside_runtime_fails() {
        let scope = ScopeHandle::new();
        let container = StateContainer::<Counter>::new(&scope).unwrap();
        let producer = futures::stream::iter(vec![Ok::<_, String>(1)]);

        assert!(matches!(
            container.connect_key("count", producer),
            Err(StateError::NoRuntime)
        ));
    }

    #[test]
    fn test_update_reducer_can_read_container() {
        let scope = ScopeHandle::new();
        let container = StateContainer::<Counter>::new(&scope).unwrap();
        container.set_key("count", 1).unwrap();

        let inner = container.clone();
        let (done_tx, done_rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let result = container.update(move |snapshot| {
                assert!(!inner.is_ended());
                let stats = inner.stats();
                assert_eq!(stats.version, snapshot.version());
                assert_eq!(inner.get_key("count"), Some(json!(1)));
                Partial::single("label", "read inside").unwrap_or_default()
            });
            let _ = done_tx.send((result.is_ok(), container.get_key("label")));
        });

        let (ok, label) = done_rx
            .recv_timeout(std::time::Duration::from_secs(2))
            .expect("update did not finish");
        assert!(ok);
        assert_eq!(label, Some(json!("read inside")));
    }

    #[test]
    fn test_connect_key_after_end_ignores_unknown_key() {
        let scope = ScopeHandle::new();
        let container = StateContainer::<Counter>::new(&scope).unwrap();
        scope.end();

        let producer = futures::stream::iter(vec![Ok::<_, String>(1)]);
        assert!(container.connect_key("nope", producer).is_ok());
    }

    #[test]
    fn test_scope_end_makes_container_inert() {
        let scope = ScopeHandle::new();
        let container = StateContainer::<Counter>::new(&scope).unwrap();
        container.set_key("count", 1).unwrap();

        scope.end();
        assert!(container.is_ended());

        container.set_key("count", 2).unwrap();
        assert_eq!(container.get_key("count"), Some(json!(1)));

        let stats = container.stats();
        assert!(stats.ended);
        assert_eq!(stats.version.0, 1);
    }
}
