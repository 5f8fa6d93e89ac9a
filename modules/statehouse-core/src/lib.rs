//! In-process state containers.
//!
//! A `Registry` holds named containers, each with its own state, reducer and
//! FIFO action queue. Dispatching enqueues; a single drain task per container
//! runs actions in order: reduce → derive → diff → notify → auto-actions →
//! persist, until the queue is empty.
//!
//! Listeners subscribe to top-level state paths (or `"*"`), to action names,
//! or to the end of a burst of actions (late invoke).

pub mod action;
pub mod config;
mod engine;
pub mod error;
pub mod hooks;
pub mod listeners;
pub mod persist;
pub mod queue;
pub mod registry;
pub mod state;

pub use action::Action;
pub use config::{load_config, ContainerConfig, DebugConfig, ACTION_QUEUE_DEFAULT_SIZE};
pub use error::{StoreError, StoreResult};
pub use hooks::{reducer_fn, AutoActions, AutoState, HookContext, Reducer};
pub use listeners::{Listener, ListenerKey, Notification, WILDCARD_PATH};
pub use persist::{
    FileBackend, MemoryBackend, Persistence, PersistenceBackend, PersistenceEnvelope,
};
pub use queue::{QueueSnapshot, QueueStatus};
pub use registry::{get_unique_id, InitialState, Registration, Registry};
pub use state::{Comparison, State};
