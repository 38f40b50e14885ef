//! # Scoped State
//!
//! A scope-bound reactive state container. Literal writes and streamed
//! partial updates are folded into one snapshot that can be read
//! imperatively or observed as a multicast stream, and every producer,
//! effect and subscription is released when the owning scope ends.
//!
//! ## Core Concepts
//!
//! - **Slices**: Literal partials or producers of partials, merged in arrival order
//! - **Snapshot**: The single current state, replaced on every update
//! - **Selections**: Multicast streams replaying the latest snapshot to late subscribers
//! - **Effects**: Streams held only for their side effects
//! - **Scope**: The lifetime boundary that tears everything down exactly once
//!
//! ## Example
//!
//! ```ignore
//! use scoped_state::{Partial, ScopeHandle, StateContainer, StateShape};
//!
//! #[derive(serde::Deserialize)]
//! struct Movies { query: String, results: Vec<String> }
//!
//! impl StateShape for Movies {
//!     const KEYS: &'static [&'static str] = &["query", "results"];
//! }
//!
//! let scope = ScopeHandle::new();
//! let state = StateContainer::<Movies>::new(&scope)?;
//!
//! state.set(Partial::single("query", "alien")?)?;
//! state.connect_key("results", search_results)?;
//! state.hold(analytics_pings)?;
//!
//! let mut results = state.select_as::<Vec<String>>("results");
//! while let Some(results) = results.next().await { /* render */ }
//!
//! scope.end(); // producers, effects and selections are released
//! ```

pub mod container;
pub mod effects;
pub mod error;
pub mod scope;
pub mod slices;
pub mod state;
pub mod subscriptions;
pub mod types;

// Re-exports
pub use container::{ContainerConfig, StateContainer};
pub use effects::EffectRunner;
pub use error::{Result, StateError};
pub use scope::{Binder, EndCallback, Scope, ScopeHandle, TaskKind};
pub use slices::{ProducerCounters, Slice, SliceChannel, SliceEvent, SliceStream};
pub use state::{merge, validate_keys, Applied, SnapshotSink, StateAggregator};
pub use subscriptions::{DropReason, Selection, SelectionHandle, SubscriptionHub, SubscriptionId};
pub use types::*;
