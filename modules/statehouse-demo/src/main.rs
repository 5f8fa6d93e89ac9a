use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::info;
use tracing_subscriber::EnvFilter;

use statehouse_core::{
    load_config, Action, ContainerConfig, FileBackend, HookContext, Notification, Persistence,
    Reducer, Registration, Registry, State,
};

const TODOS: &str = "todos";

// ---------------------------------------------------------------------------
// Domain
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Todo {
    title: String,
    done: bool,
}

#[derive(Debug, Clone)]
enum TodoAction {
    Add(String),
    Toggle(usize),
    /// Typing into the filter box; only the latest pending value matters.
    SetFilter(String),
    /// Ask listeners to flush; the state itself does not change.
    Flush,
}

impl Action for TodoAction {
    fn name(&self) -> &str {
        match self {
            TodoAction::Add(_) => "add-todo",
            TodoAction::Toggle(_) => "toggle-todo",
            TodoAction::SetFilter(_) => "set-filter",
            TodoAction::Flush => "flush",
        }
    }

    fn evanescent(&self) -> bool {
        matches!(self, TodoAction::SetFilter(_))
    }

    fn bypass_reducer(&self) -> bool {
        matches!(self, TodoAction::Flush)
    }
}

struct TodoReducer;

#[async_trait]
impl Reducer<TodoAction> for TodoReducer {
    async fn reduce(&self, state: State, action: &TodoAction) -> Result<State> {
        let mut todos: Vec<Todo> = state.get_as("items").unwrap_or_default();
        match action {
            TodoAction::Add(title) => todos.push(Todo {
                title: title.clone(),
                done: false,
            }),
            TodoAction::Toggle(index) => {
                if let Some(todo) = todos.get_mut(*index) {
                    todo.done = !todo.done;
                }
            }
            TodoAction::SetFilter(filter) => return Ok(state.with("filter", filter.as_str())),
            TodoAction::Flush => return Ok(state),
        }
        Ok(state.with("items", serde_json::to_value(todos)?))
    }
}

/// Keeps `remaining` in sync with `items`.
fn count_remaining(ctx: &HookContext<'_, TodoAction>) -> State {
    if !ctx.changed_paths.iter().any(|p| p == "items") {
        return ctx.new_state.clone();
    }
    let todos: Vec<Todo> = ctx.new_state.get_as("items").unwrap_or_default();
    let remaining = todos.iter().filter(|t| !t.done).count();
    ctx.new_state.clone().with("remaining", remaining)
}

fn restore(persisted: Map<String, Value>) -> State {
    let mut state = State::new()
        .with("items", Value::Array(Vec::new()))
        .with("filter", "all")
        .with("remaining", 0);
    state.merge(&State::from_map(persisted));
    state
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("statehouse=info".parse()?))
        .init();

    let config = match std::env::var("STATEHOUSE_CONFIG") {
        Ok(path) => load_config(&PathBuf::from(path))?,
        Err(_) => ContainerConfig::default(),
    };
    let data_dir = std::env::var("STATEHOUSE_DATA_DIR").unwrap_or_else(|_| ".statehouse".into());
    info!(data_dir = data_dir.as_str(), "Statehouse demo starting...");

    let persistence = Persistence::new(Arc::new(FileBackend::new(&data_dir)), "1")
        .with_attributes(["items"]);

    let registry = Registry::new();
    registry
        .register(
            Registration::from_persisted(TODOS, restore, TodoReducer)
                .with_config(config)
                .with_persistence(persistence)
                .with_auto_state(count_remaining),
        )
        .await?;

    registry.register_state_changed_callback(TODOS, "summary", "*", true, |n: &Notification<TodoAction>| {
        info!(
            action = n.action.name(),
            changed = ?n.changed_paths,
            remaining = n.new_state.get_as::<usize>("remaining").unwrap_or(0),
            "Burst settled"
        );
    })?;
    registry.register_action_dispatched_callback(TODOS, "flush", "flush", |n: &Notification<TodoAction>| {
        info!(state = ?n.new_state, "Flush requested");
    })?;

    registry.dispatch(TODOS, TodoAction::Add("write the queue".into()))?;
    registry.dispatch(TODOS, TodoAction::SetFilter("a".into()))?;
    registry.dispatch(TODOS, TodoAction::Add("write the listeners".into()))?;
    registry.dispatch(TODOS, TodoAction::SetFilter("active".into()))?;
    registry.dispatch(TODOS, TodoAction::Toggle(0))?;
    registry.dispatch(TODOS, TodoAction::Flush)?;
    registry.finished_processing_queue(TODOS).await;

    let state = registry.get_container(TODOS, false)?;
    info!(
        filter = state.get_as::<String>("filter").unwrap_or_default().as_str(),
        remaining = state.get_as::<usize>("remaining").unwrap_or(0),
        "Statehouse demo complete"
    );
    Ok(())
}
