//! Listener registry and notification delivery.
//!
//! Listeners are grouped by `ListenerKey` and kept per key in an ordered map
//! from listener id to callback. Re-registering an id replaces the callback in
//! its original position; unregistering removes it without disturbing the
//! order of the others.

use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use indexmap::IndexMap;
use tracing::error;

use crate::state::State;

pub const WILDCARD_PATH: &str = "*";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ListenerKey {
    /// A top-level attribute changed.
    StateChanged(String),
    /// Any attribute changed (and on every reducer run, changed or not).
    AnyStateChanged,
    /// An action with this name was executed, reducer or not.
    ActionDispatched(String),
    /// The attribute changed at some point during a burst that just finished.
    LateInvoke(String),
    /// A burst finished.
    AnyLateInvoke,
}

impl ListenerKey {
    /// Key for a state path, where `"*"` selects the wildcard variants.
    pub fn for_state_path(path: &str, late_invoke: bool) -> Self {
        match (path == WILDCARD_PATH, late_invoke) {
            (true, false) => ListenerKey::AnyStateChanged,
            (true, true) => ListenerKey::AnyLateInvoke,
            (false, false) => ListenerKey::StateChanged(path.to_string()),
            (false, true) => ListenerKey::LateInvoke(path.to_string()),
        }
    }
}

impl fmt::Display for ListenerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenerKey::StateChanged(path) => write!(f, "{path}"),
            ListenerKey::AnyStateChanged => f.write_str(WILDCARD_PATH),
            ListenerKey::ActionDispatched(name) => write!(f, "action:{name}"),
            ListenerKey::LateInvoke(path) => write!(f, "late-invoke:{path}"),
            ListenerKey::AnyLateInvoke => write!(f, "late-invoke:{WILDCARD_PATH}"),
        }
    }
}

/// What every listener callback receives.
#[derive(Debug, Clone)]
pub struct Notification<A> {
    pub action: A,
    pub changed_paths: Vec<String>,
    pub new_state: State,
    pub old_state: State,
}

pub type Listener<A> = Arc<dyn Fn(&Notification<A>) + Send + Sync>;

/// Whether a registration added a new slot or overwrote an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registered {
    Added,
    Replaced,
}

pub struct ListenerRegistry<A> {
    slots: HashMap<ListenerKey, IndexMap<String, Listener<A>>>,
}

impl<A> Default for ListenerRegistry<A> {
    fn default() -> Self {
        Self {
            slots: HashMap::new(),
        }
    }
}

impl<A> ListenerRegistry<A> {
    pub fn register(
        &mut self,
        key: ListenerKey,
        listener_id: impl Into<String>,
        listener: Listener<A>,
    ) -> Registered {
        match self.slots.entry(key).or_default().insert(listener_id.into(), listener) {
            Some(_) => Registered::Replaced,
            None => Registered::Added,
        }
    }

    /// Returns false when nothing was registered under `(key, listener_id)`.
    pub fn unregister(&mut self, key: &ListenerKey, listener_id: &str) -> bool {
        self.slots
            .get_mut(key)
            .and_then(|listeners| listeners.shift_remove(listener_id))
            .is_some()
    }

    pub fn count(&self, key: &ListenerKey) -> usize {
        self.slots.get(key).map_or(0, IndexMap::len)
    }

    /// Callbacks for the given keys, key by key, in registration order.
    pub fn collect<'k>(
        &self,
        keys: impl IntoIterator<Item = &'k ListenerKey>,
    ) -> Vec<(ListenerKey, String, Listener<A>)> {
        let mut out = Vec::new();
        for key in keys {
            if let Some(listeners) = self.slots.get(key) {
                out.extend(
                    listeners
                        .iter()
                        .map(|(id, cb)| (key.clone(), id.clone(), Arc::clone(cb))),
                );
            }
        }
        out
    }
}

/// Invoke each callback in order. A panicking callback is logged and the
/// pass continues with the next one.
pub(crate) fn deliver<A>(
    container_id: &str,
    listeners: &[(ListenerKey, String, Listener<A>)],
    notification: &Notification<A>,
) {
    for (key, id, listener) in listeners {
        if catch_unwind(AssertUnwindSafe(|| listener(notification))).is_err() {
            error!(container_id, listener = id.as_str(), path = %key, "Listener callback panicked");
        }
    }
}
