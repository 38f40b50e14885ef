//! The slice channel: the single entry point for state updates.
//!
//! Every contribution to the state arrives as a [`Slice`]:
//! - a literal [`Partial`](crate::Partial), applied synchronously
//! - a producer of partials, each emission applied as it arrives
//! - a keyed producer of single-field values
//!
//! Producers are normalized into one uniform stream of [`SliceEvent`]s and
//! driven on their own task until they complete, fail, or the scope ends.

mod channel;
mod slice;

pub use channel::{ProducerCounters, SliceChannel};
pub use slice::{Slice, SliceEvent, SliceStream};
