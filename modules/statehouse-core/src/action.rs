//! The action contract.

/// Actions carry a name and the flags that steer the queue and the engine.
///
/// The name doubles as the dedup/lookup key in the action queue and as the
/// key of action-dispatched listeners. Every flag defaults to off, so a plain
/// action only needs to name itself.
pub trait Action: Clone + Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Skip the reducer entirely. The state never changes, but
    /// action-dispatched listeners still fire.
    fn bypass_reducer(&self) -> bool {
        false
    }

    /// Raise the container's async-operation flag attribute while the reducer runs.
    fn is_async(&self) -> bool {
        false
    }

    /// Let the scheduler run other work before the next queued action starts.
    fn wait_for_full_ui_repaint(&self) -> bool {
        false
    }

    /// A pending (not yet executing) action with the same name is overwritten
    /// in place instead of being queued twice.
    fn evanescent(&self) -> bool {
        false
    }

    /// Per-action override of the container's `protect_state` setting.
    fn protect_state(&self) -> Option<bool> {
        None
    }
}
