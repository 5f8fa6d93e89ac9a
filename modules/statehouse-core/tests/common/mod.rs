//! Shared fixtures: a small calculator container.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use statehouse_core::{Action, ContainerConfig, Notification, Registration, Reducer, Registry, State};

pub const CALC: &str = "calc";

// ---------------------------------------------------------------------------
// Test action
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum CalcAction {
    Add(i64),
    /// Evanescent: a pending `Move` is overwritten by a newer one.
    Move(i64),
    /// Bypasses the reducer.
    Ping,
    /// Async: raises the busy flag while it runs.
    Load(i64),
    Reset,
    Fail,
    /// Async but bypasses the reducer.
    Signal,
    /// Lets other tasks run before its follow-up steps.
    Repaint(i64),
    /// Rewrites the `tags` array.
    Tag(Vec<String>),
    /// Same as `Tag`, but always compared by reference.
    Retag(Vec<String>),
}

impl Action for CalcAction {
    fn name(&self) -> &str {
        match self {
            CalcAction::Add(_) => "add",
            CalcAction::Move(_) => "move",
            CalcAction::Ping => "ping",
            CalcAction::Load(_) => "load",
            CalcAction::Reset => "reset",
            CalcAction::Fail => "fail",
            CalcAction::Signal => "signal",
            CalcAction::Repaint(_) => "repaint",
            CalcAction::Tag(_) => "tag",
            CalcAction::Retag(_) => "retag",
        }
    }

    fn bypass_reducer(&self) -> bool {
        matches!(self, CalcAction::Ping | CalcAction::Signal)
    }

    fn is_async(&self) -> bool {
        matches!(self, CalcAction::Load(_) | CalcAction::Signal)
    }

    fn wait_for_full_ui_repaint(&self) -> bool {
        matches!(self, CalcAction::Repaint(_))
    }

    fn evanescent(&self) -> bool {
        matches!(self, CalcAction::Move(_))
    }

    fn protect_state(&self) -> Option<bool> {
        matches!(self, CalcAction::Retag(_)).then_some(false)
    }
}

// ---------------------------------------------------------------------------
// Test reducer: records every call
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
pub struct CalcReducer {
    pub calls: Arc<Mutex<Vec<CalcAction>>>,
}

impl CalcReducer {
    pub fn calls(&self) -> Vec<CalcAction> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Reducer<CalcAction> for CalcReducer {
    async fn reduce(&self, state: State, action: &CalcAction) -> Result<State> {
        self.calls.lock().unwrap().push(action.clone());
        let sum = state.get_as::<i64>("sum").unwrap_or(0);

        Ok(match action {
            CalcAction::Add(n) => state.with("sum", sum + n),
            CalcAction::Move(n) => state.with("position", *n),
            CalcAction::Load(n) => {
                tokio::time::sleep(Duration::from_millis(2)).await;
                state.with("sum", *n)
            }
            CalcAction::Reset => state.with("sum", 0),
            CalcAction::Repaint(n) => state.with("sum", *n),
            CalcAction::Tag(tags) | CalcAction::Retag(tags) => state.with("tags", tags.clone()),
            CalcAction::Ping | CalcAction::Signal => state,
            CalcAction::Fail => bail!("calculator is on fire"),
        })
    }
}

pub fn initial_state() -> State {
    State::new().with("sum", 0)
}

/// Register the calculator under `CALC` and hand back its reducer.
pub async fn calculator(registry: &Registry<CalcAction>, config: ContainerConfig) -> CalcReducer {
    let reducer = CalcReducer::default();
    registry
        .register(Registration::new(CALC, initial_state(), reducer.clone()).with_config(config))
        .await
        .unwrap();
    reducer
}

pub fn sum(registry: &Registry<CalcAction>) -> i64 {
    registry
        .get_container(CALC, false)
        .unwrap()
        .get_as::<i64>("sum")
        .unwrap()
}

// ---------------------------------------------------------------------------
// Recording listener
// ---------------------------------------------------------------------------

/// Collects every notification a listener receives.
#[derive(Clone, Default)]
pub struct Recorder {
    seen: Arc<Mutex<Vec<Notification<CalcAction>>>>,
}

impl Recorder {
    pub fn listener(&self) -> impl Fn(&Notification<CalcAction>) + Send + Sync + 'static {
        let seen = self.seen.clone();
        move |n: &Notification<CalcAction>| seen.lock().unwrap().push(n.clone())
    }

    pub fn count(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    pub fn all(&self) -> Vec<Notification<CalcAction>> {
        self.seen.lock().unwrap().clone()
    }

    pub fn actions(&self) -> Vec<CalcAction> {
        self.all().into_iter().map(|n| n.action).collect()
    }
}
