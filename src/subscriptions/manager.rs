//! Multicast hub fanning the aggregated snapshot out to subscribers.

use crate::state::{SnapshotSink, StateAggregator};
use crate::types::Snapshot;
use crossbeam_channel::bounded;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, trace};

use super::types::{
    Delivery, DropReason, LagSlot, Outlet, Selection, SelectionHandle, SubscriptionGuard,
    SubscriptionId,
};

/// Hub state: latest-value cache plus subscriber list.
#[derive(Default)]
struct HubState {
    latest: Option<Arc<Snapshot>>,
    subscribers: HashMap<SubscriptionId, Outlet>,
}

/// Shares one attachment to the aggregator across any number of subscribers.
///
/// The hub attaches when its first subscriber arrives and detaches once the
/// last one leaves. A subscriber joining while attached is replayed the
/// cached latest snapshot; one joining while detached is replayed the
/// aggregator's current snapshot, read in the same critical section as the
/// attachment so no update is lost or duplicated.
pub struct SubscriptionHub {
    name: String,
    aggregator: Arc<StateAggregator>,
    state: RwLock<HubState>,
    /// Counter for generating subscription IDs.
    next_id: AtomicU64,
    /// Times the hub attached to the aggregator.
    activations: AtomicU64,
    /// Per-subscriber buffer size.
    buffer_size: usize,
}

impl SubscriptionHub {
    pub fn new(name: impl Into<String>, aggregator: Arc<StateAggregator>, buffer_size: usize) -> Self {
        Self {
            name: name.into(),
            aggregator,
            state: RwLock::new(HubState::default()),
            next_id: AtomicU64::new(1),
            activations: AtomicU64::new(0),
            buffer_size: buffer_size.max(1),
        }
    }

    /// Subscribe with an async stream.
    pub fn select(self: &Arc<Self>) -> Selection {
        let (sender, receiver) = tokio::sync::mpsc::channel(self.buffer_size);
        let lag: LagSlot = Arc::new(Mutex::new(None));
        let id = self.register(Outlet::new_async(sender, Arc::clone(&lag)));
        Selection::new(id, receiver, lag, self.guard(id))
    }

    /// Subscribe with a blocking handle.
    pub fn watch(self: &Arc<Self>) -> SelectionHandle {
        let (sender, receiver) = bounded(self.buffer_size);
        let lag: LagSlot = Arc::new(Mutex::new(None));
        let id = self.register(Outlet::new_blocking(sender, Arc::clone(&lag)));
        SelectionHandle::new(id, receiver, lag, self.guard(id))
    }

    fn guard(self: &Arc<Self>, id: SubscriptionId) -> SubscriptionGuard {
        SubscriptionGuard {
            id,
            hub: Arc::downgrade(self),
        }
    }

    /// Register an outlet, replaying the latest snapshot into it first.
    ///
    /// After the scope has ended the outlet is dropped immediately, which
    /// ends the subscriber's stream.
    fn register(self: &Arc<Self>, outlet: Outlet) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let sink: Weak<dyn SnapshotSink> = Arc::downgrade(self) as Weak<dyn SnapshotSink>;

        let registered = self.aggregator.attach_with(sink, |current, newly_attached| {
            let mut state = self.state.write();
            if newly_attached {
                self.activations.fetch_add(1, Ordering::SeqCst);
                state.latest = if current.version().is_initial() {
                    None
                } else {
                    Some(Arc::clone(current))
                };
            }

            if let Some(latest) = state.latest.as_ref() {
                // Fresh channel with capacity >= 1 always has room.
                if outlet.deliver(Arc::clone(latest)) != Delivery::Sent {
                    return false;
                }
            }
            state.subscribers.insert(id, outlet);
            true
        });

        match registered {
            Some(true) => debug!(container = %self.name, subscription = id.0, "subscribed"),
            Some(false) => debug!(container = %self.name, subscription = id.0, reason = ?DropReason::Disconnected, "subscriber dropped on replay"),
            None => debug!(container = %self.name, subscription = id.0, reason = ?DropReason::ScopeEnded, "subscribe after scope end"),
        }
        id
    }

    /// Unsubscribe and detach from the aggregator if this was the last one.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        let now_empty = {
            let mut state = self.state.write();
            if state.subscribers.remove(&id).is_none() {
                return;
            }
            state.subscribers.is_empty()
        };
        debug!(container = %self.name, subscription = id.0, reason = ?DropReason::Unsubscribed, "unsubscribed");

        if now_empty {
            self.aggregator
                .detach_if(|| self.state.read().subscribers.is_empty());
        }
    }

    /// Drop every subscriber and the cached snapshot. Their streams end.
    pub fn close(&self) {
        let mut state = self.state.write();
        let count = state.subscribers.len();
        state.subscribers.clear();
        state.latest = None;
        if count > 0 {
            debug!(container = %self.name, subscribers = count, reason = ?DropReason::ScopeEnded, "closed subscribers");
        }
    }

    /// Get subscription count.
    pub fn subscription_count(&self) -> usize {
        self.state.read().subscribers.len()
    }

    pub fn activations(&self) -> u64 {
        self.activations.load(Ordering::SeqCst)
    }
}

impl SnapshotSink for SubscriptionHub {
    fn on_snapshot(&self, snapshot: &Arc<Snapshot>) -> usize {
        let mut state = self.state.write();
        state.latest = Some(Arc::clone(snapshot));

        let mut dropped = Vec::new();
        for (id, outlet) in state.subscribers.iter() {
            match outlet.deliver(Arc::clone(snapshot)) {
                Delivery::Sent => {}
                Delivery::Lagged => {
                    trace!(container = %self.name, subscription = id.0, version = %snapshot.version(), "subscriber lagging, keeping latest only")
                }
                Delivery::Closed => dropped.push(*id),
            }
        }

        for id in dropped {
            state.subscribers.remove(&id);
            debug!(container = %self.name, subscription = id.0, reason = ?DropReason::Disconnected, "dropping subscriber");
        }

        state.subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Partial;
    use futures::StreamExt;
    use serde_json::json;
    use std::time::Duration;

    const KEYS: &[&str] = &["a", "b"];

    fn setup(buffer_size: usize) -> (Arc<StateAggregator>, Arc<SubscriptionHub>) {
        let aggregator = Arc::new(StateAggregator::new("test", KEYS));
        let hub = Arc::new(SubscriptionHub::new("test", Arc::clone(&aggregator), buffer_size));
        (aggregator, hub)
    }

    fn apply(aggregator: &StateAggregator, value: serde_json::Value) {
        aggregator
            .apply(Partial::from_json(value).unwrap())
            .unwrap();
    }

    #[test]
    fn test_subscribe_unsubscribe() {
        let (aggregator, hub) = setup(8);

        let handle = hub.watch();
        assert_eq!(hub.subscription_count(), 1);
        assert!(aggregator.is_attached());

        drop(handle);
        assert_eq!(hub.subscription_count(), 0);
        assert!(!aggregator.is_attached());
    }

    #[test]
    fn test_no_replay_before_first_update() {
        let (aggregator, hub) = setup(8);
        let handle = hub.watch();

        assert!(handle.try_recv().is_err());

        apply(&aggregator, json!({"a": 1}));
        let snapshot = handle.recv_timeout(Duration::from_millis(100)).unwrap();
        assert_eq!(snapshot.to_json(), json!({"a": 1}));
    }

    #[test]
    fn test_late_subscriber_gets_latest_first() {
        let (aggregator, hub) = setup(8);
        let early = hub.watch();

        apply(&aggregator, json!({"a": 1}));
        apply(&aggregator, json!({"b": 2}));

        let late = hub.watch();
        let first = late.recv_timeout(Duration::from_millis(100)).unwrap();
        assert_eq!(first.to_json(), json!({"a": 1, "b": 2}));

        apply(&aggregator, json!({"a": 3}));
        let next = late.recv_timeout(Duration::from_millis(100)).unwrap();
        assert_eq!(next.to_json(), json!({"a": 3, "b": 2}));

        // Early subscriber saw every update
        let versions: Vec<u64> = drain(&early).iter().map(|s| s.version().0).collect();
        assert_eq!(versions, vec![1, 2, 3]);
        assert_eq!(hub.activations(), 1);
    }

    #[test]
    fn test_reattach_replays_current_snapshot() {
        let (aggregator, hub) = setup(8);

        let first = hub.watch();
        apply(&aggregator, json!({"a": 1}));
        drop(first);
        assert!(!aggregator.is_attached());

        // Updates applied while detached are not lost to the next subscriber
        apply(&aggregator, json!({"a": 2}));

        let second = hub.watch();
        let replayed = second.recv_timeout(Duration::from_millis(100)).unwrap();
        assert_eq!(replayed.to_json(), json!({"a": 2}));
        assert_eq!(hub.activations(), 2);
    }

    #[test]
    fn test_slow_subscriber_skips_to_latest() {
        let (aggregator, hub) = setup(2);
        let handle = hub.watch();

        for i in 1..=10 {
            apply(&aggregator, json!({ "a": i }));
        }

        // Still subscribed: buffered snapshots, then the newest one
        assert_eq!(hub.subscription_count(), 1);
        assert!(aggregator.is_attached());
        let versions: Vec<u64> = drain(&handle).iter().map(|s| s.version().0).collect();
        assert_eq!(versions, vec![1, 2, 10]);

        apply(&aggregator, json!({"a": 11}));
        let next = handle.recv_timeout(Duration::from_millis(100)).unwrap();
        assert_eq!(next.get("a"), Some(&json!(11)));
    }

    #[tokio::test]
    async fn test_lagging_selection_stays_open() {
        let (aggregator, hub) = setup(2);
        let mut selection = hub.select();

        for i in 1..=5 {
            apply(&aggregator, json!({ "a": i }));
        }

        let mut versions = Vec::new();
        for _ in 0..3 {
            versions.push(selection.next().await.unwrap().version().0);
        }
        assert_eq!(versions, vec![1, 2, 5]);

        apply(&aggregator, json!({"b": 1}));
        assert_eq!(selection.next().await.unwrap().version().0, 6);
    }

    #[test]
    fn test_close_ends_streams() {
        let (aggregator, hub) = setup(8);
        let handle = hub.watch();
        apply(&aggregator, json!({"a": 1}));
        aggregator.end();
        hub.close();

        assert!(handle.recv_timeout(Duration::from_millis(100)).is_ok());
        assert!(matches!(
            handle.recv_timeout(Duration::from_millis(50)),
            Err(crossbeam_channel::RecvTimeoutError::Disconnected)
        ));
        assert_eq!(hub.subscription_count(), 0);
    }

    #[test]
    fn test_subscribe_after_end_yields_empty_stream() {
        let (aggregator, hub) = setup(8);
        apply(&aggregator, json!({"a": 1}));
        aggregator.end();

        let handle = hub.watch();
        assert!(matches!(
            handle.recv_timeout(Duration::from_millis(50)),
            Err(crossbeam_channel::RecvTimeoutError::Disconnected)
        ));
        assert_eq!(hub.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_async_selection_receives_updates() {
        let (aggregator, hub) = setup(8);
        apply(&aggregator, json!({"a": 1}));

        let mut selection = hub.select();
        apply(&aggregator, json!({"b": 2}));

        let first = selection.next().await.unwrap();
        let second = selection.next().await.unwrap();
        assert_eq!(first.to_json(), json!({"a": 1}));
        assert_eq!(second.to_json(), json!({"a": 1, "b": 2}));
    }

    fn drain(handle: &SelectionHandle) -> Vec<Arc<Snapshot>> {
        let mut out = Vec::new();
        while let Ok(snapshot) = handle.try_recv() {
            out.push(snapshot);
        }
        out
    }
}
