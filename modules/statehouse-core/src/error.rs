//! Typed errors for container registration, dispatch and queue maintenance.

use thiserror::Error;

/// Errors surfaced to callers of the registry.
///
/// Conditions the engine treats as non-fatal (dispatch against an unknown
/// container, refused unregistration) are logged instead and never show up here.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No container is registered under the id
    #[error("container {0} is unregistered")]
    Unregistered(String),

    /// Appending would place an action past the end of the pre-sized queue
    #[error("action queue buffer overrun (capacity {capacity}); increase action_queue_max_length")]
    QueueOverrun { capacity: usize },

    /// `bypass_reducer` and an immediate state overlay in one dispatch
    #[error("bypassing reducer and setting immediate state at the same time is not supported")]
    BypassWithImmediateState,

    /// Queue normalization requested while actions are still pending
    #[error("trying to normalize action queue while there are actions in queue (executing {executing:?}, last {last:?})")]
    QueueNotDrained {
        executing: Option<usize>,
        last: Option<usize>,
    },

    /// An initial state function needs a persistence configuration to read from
    #[error("container {0} uses an initial state function but has no persistence configured")]
    MissingPersistence(String),

    /// Container state must be a JSON object at the top level
    #[error("state must be a JSON object, got {0}")]
    NotAnObject(&'static str),

    /// Dispatch needs a tokio runtime to drive the queue on
    #[error("dispatching requires a running tokio runtime")]
    NoRuntime,

    /// Persistence backend failed while reading the envelope
    #[error("persistence error: {0}")]
    Persistence(#[source] anyhow::Error),

    /// State (de)serialization failed
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Result type alias for registry operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;
