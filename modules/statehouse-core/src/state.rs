//! Container state and top-level change detection.
//!
//! A `State` is an ordered map of top-level attributes. Each attribute value
//! sits behind an `Arc`: replacing an attribute allocates a new reference,
//! leaving an attribute alone keeps the old one. That is what makes the two
//! comparison modes meaningful:
//!
//! - **shallow**: a scalar changed when its value changed, an array or
//!   object changed when its reference changed
//! - **deep**: an attribute changed when its serialized JSON changed
//!
//! Diffing only ever looks at the top level. A nested change is reported as
//! a change of the attribute that contains it.

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::warn;

use crate::error::{StoreError, StoreResult};

#[derive(Clone, Default)]
pub struct State {
    attributes: IndexMap<String, Arc<Value>>,
}

impl State {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a state from a JSON object. Anything else is rejected.
    pub fn from_value(value: Value) -> StoreResult<Self> {
        match value {
            Value::Object(map) => Ok(Self::from_map(map)),
            Value::Null => Err(StoreError::NotAnObject("null")),
            Value::Bool(_) => Err(StoreError::NotAnObject("boolean")),
            Value::Number(_) => Err(StoreError::NotAnObject("number")),
            Value::String(_) => Err(StoreError::NotAnObject("string")),
            Value::Array(_) => Err(StoreError::NotAnObject("array")),
        }
    }

    pub fn from_map(map: Map<String, Value>) -> Self {
        Self {
            attributes: map.into_iter().map(|(k, v)| (k, Arc::new(v))).collect(),
        }
    }

    /// Build a state from anything that serializes to a JSON object.
    pub fn from_serialize<T: Serialize>(value: &T) -> StoreResult<Self> {
        Self::from_value(serde_json::to_value(value)?)
    }

    pub fn get(&self, path: &str) -> Option<&Value> {
        self.attributes.get(path).map(Arc::as_ref)
    }

    /// Read an attribute as a typed value. `None` when missing or mistyped.
    pub fn get_as<T: DeserializeOwned>(&self, path: &str) -> Option<T> {
        self.get(path).and_then(|v| T::deserialize(v).ok())
    }

    /// The shared reference behind an attribute.
    pub fn attribute(&self, path: &str) -> Option<&Arc<Value>> {
        self.attributes.get(path)
    }

    /// Replace an attribute. Always installs a new reference.
    pub fn set(&mut self, path: impl Into<String>, value: impl Into<Value>) {
        self.attributes.insert(path.into(), Arc::new(value.into()));
    }

    /// Install an existing reference, e.g. one taken from another state.
    pub fn set_shared(&mut self, path: impl Into<String>, value: Arc<Value>) {
        self.attributes.insert(path.into(), value);
    }

    pub fn with(mut self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(path, value);
        self
    }

    pub fn remove(&mut self, path: &str) -> Option<Arc<Value>> {
        self.attributes.shift_remove(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.attributes.contains_key(path)
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.attributes.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }

    /// Lay `overlay` on top of this state, sharing its references.
    pub fn merge(&mut self, overlay: &State) {
        for (path, value) in &overlay.attributes {
            self.attributes.insert(path.clone(), Arc::clone(value));
        }
    }

    pub fn to_map(&self) -> Map<String, Value> {
        self.attributes
            .iter()
            .map(|(k, v)| (k.clone(), v.as_ref().clone()))
            .collect()
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.to_map())
    }

    /// Deserialize the whole state into a typed struct.
    pub fn deserialize<T: DeserializeOwned>(&self) -> StoreResult<T> {
        Ok(serde_json::from_value(self.to_value())?)
    }
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.attributes.iter().map(|(k, v)| (k, v.as_ref())))
            .finish()
    }
}

/// Value equality, attribute by attribute (order-insensitive).
impl PartialEq for State {
    fn eq(&self, other: &Self) -> bool {
        self.attributes.len() == other.attributes.len()
            && self
                .attributes
                .iter()
                .all(|(k, v)| other.attributes.get(k).is_some_and(|o| v == o))
    }
}

impl TryFrom<Value> for State {
    type Error = StoreError;

    fn try_from(value: Value) -> StoreResult<Self> {
        Self::from_value(value)
    }
}

// ---------------------------------------------------------------------------
// Change detection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Shallow,
    Deep,
}

impl Comparison {
    /// The action-level setting wins whenever it is given; otherwise the
    /// container's `protect_state` decides.
    pub fn evaluate(action_protect_state: Option<bool>, container_protect_state: bool) -> Self {
        let protect = action_protect_state.unwrap_or(container_protect_state);
        if protect {
            Comparison::Deep
        } else {
            Comparison::Shallow
        }
    }
}

/// Top-level attribute names that differ between `old` and `new`.
///
/// Keys are enumerated from `old` first, then keys only present in `new`.
/// In deep mode a key whose value fails to serialize is logged and skipped.
pub fn changed_paths(
    container_id: &str,
    comparison: Comparison,
    old: &State,
    new: &State,
) -> Vec<String> {
    let keys = old
        .attributes
        .keys()
        .chain(new.attributes.keys().filter(|k| !old.attributes.contains_key(*k)));

    let mut changed = Vec::new();
    for key in keys {
        let before = old.attributes.get(key);
        let after = new.attributes.get(key);
        let differs = match comparison {
            Comparison::Shallow => shallow_differs(before, after),
            Comparison::Deep => match deep_differs(before, after) {
                Ok(differs) => differs,
                Err(e) => {
                    warn!(container_id, path = key.as_str(), error = %e, "Failed to compare attribute");
                    continue;
                }
            },
        };
        if differs {
            changed.push(key.clone());
        }
    }
    changed
}

fn shallow_differs(before: Option<&Arc<Value>>, after: Option<&Arc<Value>>) -> bool {
    match (before, after) {
        (Some(a), Some(b)) => match (a.as_ref(), b.as_ref()) {
            (Value::Array(_) | Value::Object(_), _) | (_, Value::Array(_) | Value::Object(_)) => {
                !Arc::ptr_eq(a, b)
            }
            (x, y) => x != y,
        },
        (None, None) => false,
        _ => true,
    }
}

fn deep_differs(before: Option<&Arc<Value>>, after: Option<&Arc<Value>>) -> serde_json::Result<bool> {
    match (before, after) {
        (Some(a), Some(b)) => {
            if Arc::ptr_eq(a, b) {
                return Ok(false);
            }
            Ok(serde_json::to_string(a.as_ref())? != serde_json::to_string(b.as_ref())?)
        }
        (None, None) => Ok(false),
        _ => Ok(true),
    }
}
