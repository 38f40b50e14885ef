//! Multicast distribution of snapshots.
//!
//! One [`SubscriptionHub`] per container fans every applied snapshot out to
//! any number of consumers:
//! - async consumers via [`Selection`] (a `futures::Stream`)
//! - blocking consumers via [`SelectionHandle`]
//!
//! Subscriptions support:
//! - Replay of the latest snapshot on subscribe
//! - Ref-counted attachment to the aggregator
//! - Bounded buffers; a lagging subscriber skips ahead to the newest snapshot
//!
//! # Example
//!
//! ```ignore
//! let mut selection = container.select();
//! while let Some(snapshot) = selection.next().await {
//!     println!("v{}: {}", snapshot.version(), snapshot.to_json());
//! }
//! ```

mod manager;
mod types;

pub use manager::SubscriptionHub;
pub use types::{DropReason, Selection, SelectionHandle, SubscriptionId};
