//! Subscription types for live snapshot updates.

use crate::types::Snapshot;
use futures::Stream;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use tokio_stream::wrappers::ReceiverStream;

use super::manager::SubscriptionHub;

/// Unique identifier for a subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Why a subscriber was dropped.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// Consumer went away.
    Disconnected,
    /// The owning scope ended.
    ScopeEnded,
    /// Explicitly unsubscribed.
    Unsubscribed,
}

/// Result of handing one snapshot to a subscriber.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Delivery {
    Sent,
    /// Buffer full; the snapshot was parked in the lag slot instead.
    Lagged,
    Closed,
}

/// Newest snapshot a lagging subscriber has not been sent yet.
///
/// Only ever set while the subscriber's buffer is full, so anything in the
/// slot is newer than everything still buffered.
pub(crate) type LagSlot = Arc<Mutex<Option<Arc<Snapshot>>>>;

enum Sender {
    Async(tokio::sync::mpsc::Sender<Arc<Snapshot>>),
    Blocking(crossbeam_channel::Sender<Arc<Snapshot>>),
}

/// Sending side of one subscriber.
pub(crate) struct Outlet {
    sender: Sender,
    lag: LagSlot,
}

impl Outlet {
    pub(crate) fn new_async(sender: tokio::sync::mpsc::Sender<Arc<Snapshot>>, lag: LagSlot) -> Self {
        Self {
            sender: Sender::Async(sender),
            lag,
        }
    }

    pub(crate) fn new_blocking(sender: crossbeam_channel::Sender<Arc<Snapshot>>, lag: LagSlot) -> Self {
        Self {
            sender: Sender::Blocking(sender),
            lag,
        }
    }

    /// Send `snapshot`, or park it in the lag slot when the buffer is full.
    ///
    /// A successful send supersedes whatever was parked.
    pub(crate) fn deliver(&self, snapshot: Arc<Snapshot>) -> Delivery {
        let mut lag = self.lag.lock();
        let rejected = match &self.sender {
            Sender::Async(sender) => match sender.try_send(snapshot) {
                Ok(()) => None,
                Err(tokio::sync::mpsc::error::TrySendError::Full(s)) => Some(s),
                Err(tokio::sync::mpsc::error::TrySendError::Closed(_)) => return Delivery::Closed,
            },
            Sender::Blocking(sender) => match sender.try_send(snapshot) {
                Ok(()) => None,
                Err(crossbeam_channel::TrySendError::Full(s)) => Some(s),
                Err(crossbeam_channel::TrySendError::Disconnected(_)) => return Delivery::Closed,
            },
        };
        match rejected {
            None => {
                *lag = None;
                Delivery::Sent
            }
            Some(snapshot) => {
                *lag = Some(snapshot);
                Delivery::Lagged
            }
        }
    }
}

/// Removes the subscription from the hub when dropped.
pub(crate) struct SubscriptionGuard {
    pub(crate) id: SubscriptionId,
    pub(crate) hub: Weak<SubscriptionHub>,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.unsubscribe(self.id);
        }
    }
}

/// Stream of snapshots, one per applied update.
///
/// If an update has already been applied when the selection is created, the
/// current snapshot is delivered first. A subscriber that falls more than the
/// configured buffer behind skips ahead to the newest snapshot once it catches
/// up. The stream ends only when the owning scope ends; dropping it
/// unsubscribes.
pub struct Selection {
    id: SubscriptionId,
    receiver: ReceiverStream<Arc<Snapshot>>,
    lag: LagSlot,
    _guard: SubscriptionGuard,
}

impl Selection {
    pub(crate) fn new(
        id: SubscriptionId,
        receiver: tokio::sync::mpsc::Receiver<Arc<Snapshot>>,
        lag: LagSlot,
        guard: SubscriptionGuard,
    ) -> Self {
        Self {
            id,
            receiver: ReceiverStream::new(receiver),
            lag,
            _guard: guard,
        }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }
}

impl Stream for Selection {
    type Item = Arc<Snapshot>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        // Buffered snapshots first, then the parked latest one
        match Pin::new(&mut self.receiver).poll_next(cx) {
            Poll::Ready(Some(snapshot)) => Poll::Ready(Some(snapshot)),
            Poll::Ready(None) => Poll::Ready(self.lag.lock().take()),
            Poll::Pending => match self.lag.lock().take() {
                Some(snapshot) => Poll::Ready(Some(snapshot)),
                None => Poll::Pending,
            },
        }
    }
}

/// Blocking counterpart of [`Selection`] for hosts without an async runtime.
pub struct SelectionHandle {
    pub id: SubscriptionId,
    receiver: crossbeam_channel::Receiver<Arc<Snapshot>>,
    lag: LagSlot,
    _guard: SubscriptionGuard,
}

impl SelectionHandle {
    pub(crate) fn new(
        id: SubscriptionId,
        receiver: crossbeam_channel::Receiver<Arc<Snapshot>>,
        lag: LagSlot,
        guard: SubscriptionGuard,
    ) -> Self {
        Self {
            id,
            receiver,
            lag,
            _guard: guard,
        }
    }

    fn take_lagged(&self) -> Option<Arc<Snapshot>> {
        self.lag.lock().take()
    }

    /// Receive the next snapshot (blocking).
    pub fn recv(&self) -> Result<Arc<Snapshot>, crossbeam_channel::RecvError> {
        match self.try_recv() {
            Ok(snapshot) => Ok(snapshot),
            Err(crossbeam_channel::TryRecvError::Empty) => self.receiver.recv(),
            Err(crossbeam_channel::TryRecvError::Disconnected) => Err(crossbeam_channel::RecvError),
        }
    }

    /// Try to receive a snapshot (non-blocking).
    pub fn try_recv(&self) -> Result<Arc<Snapshot>, crossbeam_channel::TryRecvError> {
        match self.receiver.try_recv() {
            Ok(snapshot) => Ok(snapshot),
            Err(e) => self.take_lagged().ok_or(e),
        }
    }

    /// Receive with timeout.
    pub fn recv_timeout(
        &self,
        timeout: std::time::Duration,
    ) -> Result<Arc<Snapshot>, crossbeam_channel::RecvTimeoutError> {
        match self.try_recv() {
            Ok(snapshot) => Ok(snapshot),
            Err(crossbeam_channel::TryRecvError::Empty) => self.receiver.recv_timeout(timeout),
            Err(crossbeam_channel::TryRecvError::Disconnected) => {
                Err(crossbeam_channel::RecvTimeoutError::Disconnected)
            }
        }
    }
}
