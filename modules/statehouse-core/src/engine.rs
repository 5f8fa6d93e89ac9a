//! Dispatch and the per-container drain loop.
//!
//! `dispatch` only enqueues. The first dispatch into an idle container marks
//! the head of the queue as executing and spawns a drain task; every other
//! dispatch lands behind it and is picked up by that same task. The drain
//! task runs actions one at a time until the queue is exhausted, then
//! normalizes the queue and exits. The container lock is never held across
//! an `.await` or while user code (reducer, hooks, listeners) runs, so any of
//! them may dispatch again.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::action::Action;
use crate::error::{StoreError, StoreResult};
use crate::hooks::HookContext;
use crate::listeners::{deliver, ListenerKey, Notification};
use crate::queue::{ActionQueue, Enqueued};
use crate::registry::{Container, ContainerInner, Registry};
use crate::state::{changed_paths, Comparison, State};

impl<A: Action> Registry<A> {
    /// Dispatch an action to a container.
    pub fn dispatch(&self, container_id: &str, action: A) -> StoreResult<()> {
        self.dispatch_action(container_id, action, None)
    }

    /// Dispatch an action, optionally with an immediate state overlay that
    /// readers see until the action's own state lands.
    ///
    /// Dispatching to an unknown container is logged and ignored. Must be
    /// called from within a tokio runtime.
    pub fn dispatch_action(
        &self,
        container_id: &str,
        action: A,
        immediate_state: Option<State>,
    ) -> StoreResult<()> {
        let Some(container) = self.container(container_id) else {
            warn!(container_id, action = action.name(), "Cannot dispatch action - container not found");
            return Ok(());
        };

        if action.bypass_reducer() && immediate_state.is_some() {
            return Err(StoreError::BypassWithImmediateState);
        }

        let runtime = tokio::runtime::Handle::try_current().map_err(|_| StoreError::NoRuntime)?;

        let start = {
            let mut inner = container.lock();
            enqueue_logged(&container.id, &mut inner, action)?;
            if let Some(overlay) = immediate_state {
                inner.immediate_state = Some(overlay);
            }

            if inner.queue.is_idle() {
                inner.queue.mark_executing();
                true
            } else {
                false
            }
        };

        if start {
            runtime.spawn(drain(container));
        }
        Ok(())
    }
}

/// Enqueue with the `debug.dispatching.queue` diagnostics.
pub(crate) fn enqueue_logged<A: Action>(
    container_id: &str,
    inner: &mut ContainerInner<A>,
    action: A,
) -> StoreResult<()> {
    let name = action.name().to_string();
    let enqueued = inner.queue.enqueue(action)?;

    if inner.config.debug.dispatching.queue && inner.config.tracks_action(&name) {
        match enqueued {
            Enqueued::Appended { index } => {
                debug!(container_id, action = name.as_str(), index, "Action enqueued")
            }
            Enqueued::Replaced { index } => {
                debug!(container_id, action = name.as_str(), index, "Evanescent action replaced")
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Drain loop
// ---------------------------------------------------------------------------

async fn drain<A: Action>(container: Arc<Container<A>>) {
    loop {
        let current = container.lock().queue.current_action().cloned();
        let Some(action) = current else {
            error!(container_id = %container.id, "Executing cursor points at an empty slot, resetting queue");
            let mut inner = container.lock();
            inner.queue = ActionQueue::new(inner.config.action_queue_max_length);
            return;
        };

        execute(&container, &action).await;

        if action.wait_for_full_ui_repaint() {
            tokio::task::yield_now().await;
        }

        next_steps(&container, &action).await;

        let more = {
            let mut inner = container.lock();
            if inner.queue.next_action().is_some() {
                inner.queue.mark_executing();
                true
            } else {
                let capacity = inner.config.action_queue_max_length;
                if let Err(e) = inner.queue.normalize(capacity) {
                    error!(container_id = %container.id, error = %e, "Failed to normalize action queue");
                }
                inner.late_invoke_changed_paths.clear();
                if inner.config.debug.dispatching.queue {
                    debug!(container_id = %container.id, "Action queue drained");
                }
                false
            }
        };
        if !more {
            return;
        }
    }
}

/// `state` with the async operation flag set to `value`, when the action is
/// async and the container manages such a flag. Otherwise `state` unchanged.
fn with_async_flag<A: Action>(action: &A, flag: Option<&str>, state: State, value: bool) -> State {
    match flag {
        Some(flag) if action.is_async() => state.with(flag, value),
        _ => state,
    }
}

async fn execute<A: Action>(container: &Container<A>, action: &A) {
    let container_id = container.id.as_str();

    let (old_state, comparison, flag, config) = {
        let mut inner = container.lock();
        inner.old_state = inner.new_state.clone();
        let comparison = Comparison::evaluate(action.protect_state(), inner.config.protect_state);
        let flag = inner.config.managed_attributes.async_operation_flag.clone();
        (inner.old_state.clone(), comparison, flag, inner.config.clone())
    };
    let flag = flag.as_deref();
    let tracked = config.tracks_action(action.name());

    // A bypass action never reaches the reducer, so nothing would lower the flag.
    let mut flag_value = false;
    if action.is_async() && flag.is_some() && !action.bypass_reducer() {
        flag_value = true;
        let busy = with_async_flag(action, flag, old_state.clone(), true);
        let changed = changed_paths(container_id, comparison, &old_state, &busy);
        {
            let mut inner = container.lock();
            inner.new_state = busy.clone();
            inner.immediate_state = None;
            inner.changed_paths = changed.clone();
        }
        notify(container, action, &changed, &old_state, &busy, None);
    }

    if config.debug.dispatching.active && tracked {
        debug!(container_id, action = action.name(), "Started dispatching");
    }

    if !action.bypass_reducer() {
        let reduced = run_reducer(container, &old_state, action).await;

        let next_is_async = container
            .lock()
            .queue
            .next_action()
            .is_some_and(|next| next.is_async());

        let flagged_old = with_async_flag(action, flag, old_state.clone(), flag_value);
        let derived = match &container.auto_state {
            Some(hook) => {
                let changed = changed_paths(container_id, comparison, &flagged_old, &reduced);
                let ctx = HookContext {
                    action,
                    changed_paths: &changed,
                    old_state: &old_state,
                    new_state: &reduced,
                };
                match catch_unwind(AssertUnwindSafe(|| hook.derive_state(&ctx))) {
                    Ok(state) => state,
                    Err(_) => {
                        error!(container_id, action = action.name(), "Auto state hook panicked, keeping reducer output");
                        reduced.clone()
                    }
                }
            }
            None => reduced,
        };

        let new_state = with_async_flag(action, flag, derived, next_is_async);
        let changed = changed_paths(container_id, comparison, &flagged_old, &new_state);

        if config.debug.reducer && tracked {
            debug!(
                container_id,
                action = action.name(),
                prev_state = ?old_state,
                next_state = ?new_state,
                changed_paths = ?changed,
                "Reducer finished"
            );
        }

        let (last, late) = {
            let mut inner = container.lock();
            inner.new_state = new_state.clone();
            inner.late_invoke_changed_paths.extend(changed.iter().cloned());
            inner.immediate_state = None;
            inner.changed_paths = changed.clone();

            let last = inner.queue.next_action().is_none() || inner.queue.only_bypass_reducer_left();
            let late: Vec<String> = if last {
                std::mem::take(&mut inner.late_invoke_changed_paths).into_iter().collect()
            } else {
                Vec::new()
            };
            (last, late)
        };

        notify(container, action, &changed, &old_state, &new_state, last.then_some(late.as_slice()));
    }

    let (listeners, old_state, new_state) = {
        let inner = container.lock();
        (
            inner
                .listeners
                .collect([&ListenerKey::ActionDispatched(action.name().to_string())]),
            inner.old_state.clone(),
            inner.new_state.clone(),
        )
    };
    if !listeners.is_empty() {
        if config.debug.dispatching.listeners && tracked {
            debug!(container_id, action = action.name(), count = listeners.len(), "Calling action listeners");
        }
        let notification = Notification {
            action: action.clone(),
            changed_paths: Vec::new(),
            new_state,
            old_state,
        };
        deliver(container_id, &listeners, &notification);
    }

    if config.debug.dispatching.active && tracked {
        debug!(container_id, action = action.name(), "Finished dispatching");
    }
}

/// Run the reducer on its own task so a panic cannot take the drain loop
/// down. Failures leave the state as it was.
async fn run_reducer<A: Action>(container: &Container<A>, old_state: &State, action: &A) -> State {
    let reducer = Arc::clone(&container.reducer);
    let input = old_state.clone();
    let owned = action.clone();

    match tokio::spawn(async move { reducer.reduce(input, &owned).await }).await {
        Ok(Ok(state)) => state,
        Ok(Err(e)) => {
            error!(container_id = %container.id, action = action.name(), error = %e, "Reducer failed, state unchanged");
            old_state.clone()
        }
        Err(e) => {
            error!(container_id = %container.id, action = action.name(), error = %e, "Reducer panicked, state unchanged");
            old_state.clone()
        }
    }
}

/// Notify state-changed listeners for `changed` plus the wildcard. With
/// `late` given, follow up with the late-invoke pass for those paths.
fn notify<A: Action>(
    container: &Container<A>,
    action: &A,
    changed: &[String],
    old_state: &State,
    new_state: &State,
    late: Option<&[String]>,
) {
    let container_id = container.id.as_str();

    let mut keys: Vec<ListenerKey> = changed
        .iter()
        .map(|p| ListenerKey::StateChanged(p.clone()))
        .collect();
    keys.push(ListenerKey::AnyStateChanged);

    let late_keys: Option<Vec<ListenerKey>> = late.map(|paths| {
        paths
            .iter()
            .map(|p| ListenerKey::LateInvoke(p.clone()))
            .chain(std::iter::once(ListenerKey::AnyLateInvoke))
            .collect()
    });

    let (listeners, late_listeners, log) = {
        let inner = container.lock();
        (
            inner.listeners.collect(&keys),
            late_keys.as_ref().map(|k| inner.listeners.collect(k)),
            inner.config.debug.dispatching.listeners && inner.config.tracks_action(action.name()),
        )
    };

    if log {
        debug!(container_id, action = action.name(), changed_paths = ?changed, count = listeners.len(), "Notifying state listeners");
    }
    deliver(
        container_id,
        &listeners,
        &Notification {
            action: action.clone(),
            changed_paths: changed.to_vec(),
            new_state: new_state.clone(),
            old_state: old_state.clone(),
        },
    );

    if let (Some(paths), Some(late_listeners)) = (late, late_listeners) {
        if log {
            debug!(container_id, action = action.name(), changed_paths = ?paths, count = late_listeners.len(), "Notifying late-invoke listeners");
        }
        deliver(
            container_id,
            &late_listeners,
            &Notification {
                action: action.clone(),
                changed_paths: paths.to_vec(),
                new_state: new_state.clone(),
                old_state: old_state.clone(),
            },
        );
    }
}

/// Auto-actions, persistence write-through.
async fn next_steps<A: Action>(container: &Container<A>, action: &A) {
    let container_id = container.id.as_str();
    let (changed, old_state, new_state) = {
        let inner = container.lock();
        (
            inner.changed_paths.clone(),
            inner.old_state.clone(),
            inner.new_state.clone(),
        )
    };

    if let Some(hook) = &container.auto_actions {
        let ctx = HookContext {
            action,
            changed_paths: &changed,
            old_state: &old_state,
            new_state: &new_state,
        };
        let derived = match catch_unwind(AssertUnwindSafe(|| hook.derive_actions(&ctx))) {
            Ok(actions) => actions,
            Err(_) => {
                error!(container_id, action = action.name(), "Auto actions hook panicked");
                Vec::new()
            }
        };

        let mut inner = container.lock();
        for derived_action in derived {
            let name = derived_action.name().to_string();
            if let Err(e) = enqueue_logged(container_id, &mut inner, derived_action) {
                error!(container_id, action = name.as_str(), error = %e, "Failed to enqueue auto action, dropping the rest");
                break;
            }
        }
    }

    if let Some(persistence) = &container.persistence {
        let key = persistence.key(container_id);
        let existing = match persistence.backend.get_envelope(&key).await {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(container_id, key = key.as_str(), error = %e, "Failed to read persisted envelope, skipping write");
                return;
            }
        };

        if let Some(envelope) = persistence.merge_changes(existing, &changed, &new_state) {
            match persistence.backend.set_envelope(&key, envelope).await {
                Ok(()) => debug!(container_id, key = key.as_str(), "Persisted container state"),
                Err(e) => {
                    error!(container_id, key = key.as_str(), error = %e, "Failed to persist container state")
                }
            }
        }
    }
}
