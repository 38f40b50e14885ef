//! Slice variants and their normalization.

use crate::error::{Result, StateError};
use crate::types::{Partial, Snapshot};
use futures::stream::{BoxStream, StreamExt, TryStream, TryStreamExt};
use serde::Serialize;
use std::fmt;

/// One normalized update.
pub enum SliceEvent {
    /// Merge this partial as-is.
    Merge(Partial),
    /// Compute the partial from the snapshot current at apply time.
    Reduce(Box<dyn FnOnce(&Snapshot) -> Result<Partial> + Send>),
}

impl fmt::Debug for SliceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SliceEvent::Merge(partial) => f.debug_tuple("Merge").field(partial).finish(),
            SliceEvent::Reduce(_) => f.write_str("Reduce(..)"),
        }
    }
}

/// Uniform stream every producer is normalized into.
pub type SliceStream = BoxStream<'static, Result<SliceEvent>>;

/// A contribution to the state.
pub enum Slice {
    Literal(Partial),
    Stream(BoxStream<'static, Result<Partial>>),
    Keyed {
        key: String,
        producer: BoxStream<'static, Result<serde_json::Value>>,
    },
}

impl Slice {
    /// Wrap a producer of partials.
    pub fn stream<S>(producer: S) -> Self
    where
        S: TryStream<Ok = Partial> + Send + 'static,
        S::Error: fmt::Display,
    {
        Slice::Stream(
            producer
                .into_stream()
                .map(|item| item.map_err(|e| StateError::Producer(e.to_string())))
                .boxed(),
        )
    }

    /// Wrap a producer of values for a single key.
    pub fn keyed<S, V>(key: impl Into<String>, producer: S) -> Self
    where
        S: TryStream<Ok = V> + Send + 'static,
        S::Error: fmt::Display,
        V: Serialize,
    {
        Slice::Keyed {
            key: key.into(),
            producer: producer
                .into_stream()
                .map(|item| match item {
                    Ok(value) => serde_json::to_value(value).map_err(StateError::from),
                    Err(e) => Err(StateError::Producer(e.to_string())),
                })
                .boxed(),
        }
    }

    pub fn is_literal(&self) -> bool {
        matches!(self, Slice::Literal(_))
    }

    /// Normalize into the uniform event stream.
    pub fn into_events(self) -> SliceStream {
        match self {
            Slice::Literal(partial) => {
                futures::stream::once(async move { Ok(SliceEvent::Merge(partial)) }).boxed()
            }
            Slice::Stream(producer) => producer.map_ok(SliceEvent::Merge).boxed(),
            Slice::Keyed { key, producer } => producer
                .map_ok(move |value| {
                    let mut partial = Partial::new();
                    partial.insert(key.clone(), value);
                    SliceEvent::Merge(partial)
                })
                .boxed(),
        }
    }
}

impl fmt::Debug for Slice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Slice::Literal(partial) => f.debug_tuple("Literal").field(partial).finish(),
            Slice::Stream(_) => f.write_str("Stream(..)"),
            Slice::Keyed { key, .. } => f.debug_struct("Keyed").field("key", key).finish(),
        }
    }
}
