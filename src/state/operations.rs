//! Snapshot reduction.

use crate::error::{Result, StateError};
use crate::types::{Partial, Snapshot};

/// Reject a partial that names keys outside `keys`.
pub fn validate_keys(partial: &Partial, keys: &[&str]) -> Result<()> {
    match partial.keys().find(|k| !keys.contains(k)) {
        Some(unknown) => Err(StateError::UnknownKey(unknown.to_string())),
        None => Ok(()),
    }
}

/// Fold a partial into the previous snapshot.
///
/// Keys present in `partial` overwrite; every other key carries over. The
/// result is a new snapshot one version ahead of `previous`.
pub fn merge(previous: &Snapshot, partial: Partial) -> Snapshot {
    let mut values = previous.values().clone();
    for (key, value) in partial.iter() {
        values.insert(key.clone(), value.clone());
    }
    Snapshot::from_parts(previous.version().next(), values)
}
