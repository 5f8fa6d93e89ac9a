//! User-supplied behavior plugged into a container: the reducer and the two
//! auto-derivation hooks.

use std::future::Future;

use anyhow::Result;
use async_trait::async_trait;

use crate::action::Action;
use crate::state::State;

/// Computes the next state from the current one and an action.
///
/// The reducer owns its input: it can rebuild attributes freely without ever
/// touching the state listeners were handed. Attributes that come back with
/// the same reference are treated as unchanged in shallow comparison mode.
///
/// An `Err` is logged and the action is treated as a no-op.
#[async_trait]
pub trait Reducer<A: Action>: Send + Sync {
    async fn reduce(&self, state: State, action: &A) -> Result<State>;
}

/// Adapter turning an async closure into a `Reducer`.
pub struct ReducerFn<F>(F);

pub fn reducer_fn<A, F, Fut>(f: F) -> ReducerFn<F>
where
    A: Action,
    F: Fn(State, A) -> Fut + Send + Sync,
    Fut: Future<Output = Result<State>> + Send,
{
    ReducerFn(f)
}

#[async_trait]
impl<A, F, Fut> Reducer<A> for ReducerFn<F>
where
    A: Action,
    F: Fn(State, A) -> Fut + Send + Sync,
    Fut: Future<Output = Result<State>> + Send,
{
    async fn reduce(&self, state: State, action: &A) -> Result<State> {
        (self.0)(state, action.clone()).await
    }
}

/// Everything an auto-derivation hook gets to look at.
#[derive(Debug)]
pub struct HookContext<'a, A> {
    pub action: &'a A,
    pub changed_paths: &'a [String],
    pub old_state: &'a State,
    pub new_state: &'a State,
}

/// Derives follow-up actions after an action has been applied.
///
/// Returned actions are enqueued like any other (evanescent replacement
/// included) and run later in the same burst.
pub trait AutoActions<A>: Send + Sync {
    fn derive_actions(&self, ctx: &HookContext<'_, A>) -> Vec<A>;
}

impl<A, F> AutoActions<A> for F
where
    F: Fn(&HookContext<'_, A>) -> Vec<A> + Send + Sync,
{
    fn derive_actions(&self, ctx: &HookContext<'_, A>) -> Vec<A> {
        self(ctx)
    }
}

/// Post-processes the reducer's output before listeners see it. Must be
/// synchronous and free of side effects.
pub trait AutoState<A>: Send + Sync {
    fn derive_state(&self, ctx: &HookContext<'_, A>) -> State;
}

impl<A, F> AutoState<A> for F
where
    F: Fn(&HookContext<'_, A>) -> State + Send + Sync,
{
    fn derive_state(&self, ctx: &HookContext<'_, A>) -> State {
        self(ctx)
    }
}
