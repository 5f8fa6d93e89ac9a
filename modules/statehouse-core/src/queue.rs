//! Fixed-capacity action queue.
//!
//! Slots are pre-sized to the configured capacity and addressed by index.
//! Two cursors describe a burst: `executing` (the running action) and `last`
//! (the most recently appended one). `None` stands for "nothing yet". The
//! queue only ever grows during a burst; once the executing cursor catches up
//! with the last one the engine normalizes it back to empty.

use std::collections::HashMap;

use crate::action::Action;
use crate::error::{StoreError, StoreResult};

/// Where an action name currently sits in a container's queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueStatus {
    NoContainer,
    /// Nothing is pending behind the executing action (if any).
    EmptyQueue,
    /// The executing action carries this name.
    CurrentlyExecuting,
    /// Most recent occurrence of the name is pending at `index`.
    EnqueuedForLaterExecution { index: usize },
    NotInQueue,
}

/// What `enqueue` did with an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    Appended { index: usize },
    /// An evanescent action overwrote a pending one with the same name.
    Replaced { index: usize },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActionsLeft {
    pub all: usize,
    pub bypass_reducer: usize,
}

/// Read-only copy of a queue, for inspection and tests.
#[derive(Debug, Clone)]
pub struct QueueSnapshot<A> {
    pub executing: Option<usize>,
    pub last: Option<usize>,
    pub capacity: usize,
    /// Occupied slots `0..=last`, in index order.
    pub actions: Vec<A>,
}

pub struct ActionQueue<A> {
    slots: Vec<Option<A>>,
    lookup: HashMap<String, usize>,
    executing: Option<usize>,
    last: Option<usize>,
    bypass_reducer_enqueued: bool,
}

impl<A: Action> ActionQueue<A> {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: empty_slots(capacity),
            lookup: HashMap::new(),
            executing: None,
            last: None,
            bypass_reducer_enqueued: false,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn executing_index(&self) -> Option<usize> {
        self.executing
    }

    pub fn last_index(&self) -> Option<usize> {
        self.last
    }

    /// No action is running.
    pub fn is_idle(&self) -> bool {
        self.executing.is_none()
    }

    /// Nothing was appended since the last normalization.
    pub fn is_empty(&self) -> bool {
        self.last.is_none()
    }

    /// True while any pending action of this burst bypasses the reducer.
    pub fn bypass_reducer_enqueued(&self) -> bool {
        self.bypass_reducer_enqueued
    }

    pub fn status(&self, name: &str) -> QueueStatus {
        if self.executing == self.last {
            return QueueStatus::EmptyQueue;
        }

        if self.current_action().is_some_and(|a| a.name() == name) {
            return QueueStatus::CurrentlyExecuting;
        }

        match self.lookup.get(name) {
            Some(&index) if self.executing.map_or(true, |e| index > e) => {
                QueueStatus::EnqueuedForLaterExecution { index }
            }
            _ => QueueStatus::NotInQueue,
        }
    }

    /// Append the action, or overwrite a pending evanescent one of the same name.
    ///
    /// Only actions that have not started can be replaced. A name that is
    /// currently executing is always appended again.
    pub fn enqueue(&mut self, action: A) -> StoreResult<Enqueued> {
        match self.status(action.name()) {
            QueueStatus::EnqueuedForLaterExecution { index } if action.evanescent() => {
                self.slots[index] = Some(action);
                Ok(Enqueued::Replaced { index })
            }
            _ => self.append(action),
        }
    }

    fn append(&mut self, action: A) -> StoreResult<Enqueued> {
        let index = self.last.map_or(0, |l| l + 1);
        if index >= self.slots.len() {
            return Err(StoreError::QueueOverrun {
                capacity: self.slots.len(),
            });
        }

        if action.bypass_reducer() {
            self.bypass_reducer_enqueued = true;
        }
        self.lookup.insert(action.name().to_string(), index);
        self.slots[index] = Some(action);
        self.last = Some(index);
        Ok(Enqueued::Appended { index })
    }

    /// Reset a fully drained queue to an empty one of `capacity` slots.
    pub fn normalize(&mut self, capacity: usize) -> StoreResult<()> {
        if self.executing != self.last {
            return Err(StoreError::QueueNotDrained {
                executing: self.executing,
                last: self.last,
            });
        }

        *self = Self::new(capacity);
        Ok(())
    }

    /// Advance the executing cursor to the next slot.
    pub fn mark_executing(&mut self) {
        let next = self.executing.map_or(0, |e| e + 1);
        debug_assert!(self.last.is_some_and(|l| next <= l), "no action to execute");
        self.executing = Some(next);
    }

    pub fn current_action(&self) -> Option<&A> {
        self.executing
            .and_then(|e| self.slots.get(e))
            .and_then(Option::as_ref)
    }

    pub fn next_action(&self) -> Option<&A> {
        let next = self.executing.map_or(0, |e| e + 1);
        if !self.last.is_some_and(|l| next <= l) {
            return None;
        }
        self.slots.get(next).and_then(Option::as_ref)
    }

    /// Pending actions behind the executing one.
    pub fn pending(&self) -> impl Iterator<Item = &A> {
        let start = self.executing.map_or(0, |e| e + 1);
        let end = self.last.map_or(0, |l| l + 1);
        self.slots
            .get(start..end.max(start))
            .unwrap_or(&[])
            .iter()
            .flatten()
    }

    pub fn actions_left(&self) -> ActionsLeft {
        self.pending().fold(ActionsLeft::default(), |mut left, action| {
            left.all += 1;
            if action.bypass_reducer() {
                left.bypass_reducer += 1;
            }
            left
        })
    }

    /// Everything still pending skips the reducer, so no further state change
    /// is coming in this burst.
    pub fn only_bypass_reducer_left(&self) -> bool {
        if !self.bypass_reducer_enqueued {
            return false;
        }
        let left = self.actions_left();
        left.all == left.bypass_reducer
    }

    /// Drop every pending action. A running action survives as the only
    /// entry, at index 0.
    pub fn clear(&mut self) {
        let current = self.executing.and_then(|e| self.slots[e].take());
        let capacity = self.slots.len();
        *self = Self::new(capacity);

        if let Some(action) = current {
            self.lookup.insert(action.name().to_string(), 0);
            self.slots[0] = Some(action);
            self.executing = Some(0);
            self.last = Some(0);
        }
    }

    pub fn snapshot(&self) -> QueueSnapshot<A> {
        let end = self.last.map_or(0, |l| l + 1);
        QueueSnapshot {
            executing: self.executing,
            last: self.last,
            capacity: self.slots.len(),
            actions: self.slots[..end].iter().flatten().cloned().collect(),
        }
    }
}

fn empty_slots<A>(capacity: usize) -> Vec<Option<A>> {
    (0..capacity).map(|_| None).collect()
}
