//! Core types for the state container.

use crate::error::{Result, StateError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// A record type whose fields form the container's closed key set.
///
/// The container stores field values as JSON and decodes them back through
/// serde, so `KEYS` must name the serialized field names of `Self`.
pub trait StateShape: DeserializeOwned + Send + Sync + 'static {
    /// Serialized field names making up the closed key set.
    const KEYS: &'static [&'static str];

    /// Whether `key` belongs to the key set.
    fn is_key(key: &str) -> bool {
        Self::KEYS.contains(&key)
    }
}

/// Number of updates applied to a snapshot (0 = nothing applied yet).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Version(pub u64);

impl fmt::Debug for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ver({})", self.0)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Version {
    pub fn next(self) -> Self {
        Version(self.0 + 1)
    }

    /// True until the first update has been applied.
    pub fn is_initial(self) -> bool {
        self.0 == 0
    }
}

/// A partial state update: a subset of the key set with new values.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Partial(Map<String, Value>);

impl Partial {
    /// Empty partial.
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Partial holding a single key.
    pub fn single<V: Serialize>(key: impl Into<String>, value: V) -> Result<Self> {
        Self::new().with(key, value)
    }

    /// Add a key, serializing `value` to JSON.
    pub fn with<V: Serialize>(mut self, key: impl Into<String>, value: V) -> Result<Self> {
        let value = serde_json::to_value(value)?;
        self.0.insert(key.into(), value);
        Ok(self)
    }

    /// Add an already-encoded value.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), value);
    }

    /// Build from a JSON object literal.
    pub fn from_json(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(StateError::NotAnObject(other.to_string())),
        }
    }

    /// Build from any serializable record (every serialized field becomes a key).
    pub fn from_state<T: Serialize>(state: &T) -> Result<Self> {
        Self::from_json(serde_json::to_value(state)?)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Keys not present in `S::KEYS`.
    pub fn unknown_keys<S: StateShape>(&self) -> Vec<String> {
        self.0
            .keys()
            .filter(|k| !S::is_key(k))
            .cloned()
            .collect()
    }
}

impl From<Map<String, Value>> for Partial {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// The materialized state at one point in time.
///
/// Snapshots are immutable; every applied update produces a new one.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Snapshot {
    version: Version,
    values: Map<String, Value>,
}

impl Snapshot {
    pub(crate) fn from_parts(version: Version, values: Map<String, Value>) -> Self {
        Self { version, values }
    }

    pub fn version(&self) -> Version {
        self.version
    }

    /// Raw value for `key`, `None` if never written.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Decode the value for `key`.
    pub fn get_as<V: DeserializeOwned>(&self, key: &str) -> Result<Option<V>> {
        match self.values.get(key) {
            None => Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|e| StateError::Decode {
                    key: key.to_string(),
                    reason: e.to_string(),
                }),
        }
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &Map<String, Value> {
        &self.values
    }

    /// The snapshot as a JSON object.
    pub fn to_json(&self) -> Value {
        Value::Object(self.values.clone())
    }

    /// Decode into the full state record.
    ///
    /// Fails with [`StateError::Incomplete`] while any key is still unset.
    pub fn decode<S: StateShape>(&self) -> Result<S> {
        let missing: Vec<String> = S::KEYS
            .iter()
            .filter(|k| !self.values.contains_key(**k))
            .map(|k| k.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(StateError::Incomplete(missing));
        }

        serde_json::from_value(self.to_json()).map_err(|e| StateError::Decode {
            key: "*".to_string(),
            reason: e.to_string(),
        })
    }
}

/// Container statistics.
#[derive(Clone, Debug, Default, Serialize)]
pub struct ContainerStats {
    pub version: Version,
    pub key_count: usize,
    pub subscriber_count: usize,
    pub active_producers: usize,
    pub active_effects: usize,
    pub producers_completed: u64,
    pub producer_errors: u64,
    pub effect_errors: u64,
    /// Times the distribution hub attached to the aggregator.
    pub hub_activations: u64,
    pub ended: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Pair {
        a: i64,
        b: Option<String>,
    }

    impl StateShape for Pair {
        const KEYS: &'static [&'static str] = &["a", "b"];
    }

    #[test]
    fn test_version_navigation() {
        let v = Version(5);
        assert_eq!(v.next(), Version(6));
        assert!(Version::default().is_initial());
        assert!(!v.is_initial());
    }

    #[test]
    fn test_partial_builder() {
        let partial = Partial::new().with("a", 1).unwrap().with("b", "x").unwrap();
        assert_eq!(partial.len(), 2);
        assert_eq!(partial.get("a"), Some(&json!(1)));
        assert_eq!(partial.keys().collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[test]
    fn test_partial_from_json_rejects_non_object() {
        assert!(matches!(
            Partial::from_json(json!([1, 2])),
            Err(StateError::NotAnObject(_))
        ));
    }

    #[test]
    fn test_unknown_keys() {
        let partial = Partial::from_json(json!({"a": 1, "zzz": 2})).unwrap();
        assert_eq!(partial.unknown_keys::<Pair>(), vec!["zzz".to_string()]);
    }

    #[test]
    fn test_snapshot_decode_incomplete() {
        let mut values = Map::new();
        values.insert("a".into(), json!(3));
        let snapshot = Snapshot::from_parts(Version(1), values);

        match snapshot.decode::<Pair>() {
            Err(StateError::Incomplete(missing)) => assert_eq!(missing, vec!["b".to_string()]),
            other => panic!("Expected Incomplete, got {:?}", other),
        }
        assert_eq!(snapshot.get_as::<i64>("a").unwrap(), Some(3));
        assert_eq!(snapshot.get_as::<i64>("b").unwrap(), None);
    }

    #[test]
    fn test_snapshot_decode_complete() {
        let mut values = Map::new();
        values.insert("a".into(), json!(3));
        values.insert("b".into(), Value::Null);
        let snapshot = Snapshot::from_parts(Version(2), values);

        assert_eq!(snapshot.decode::<Pair>().unwrap(), Pair { a: 3, b: None });
    }

    #[test]
    fn test_get_as_type_mismatch() {
        let mut values = Map::new();
        values.insert("a".into(), json!("not a number"));
        let snapshot = Snapshot::from_parts(Version(1), values);

        assert!(matches!(
            snapshot.get_as::<i64>("a"),
            Err(StateError::Decode { .. })
        ));
    }
}
