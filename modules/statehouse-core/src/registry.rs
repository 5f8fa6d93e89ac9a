//! Container registry: registration lifecycle, reads, listener bookkeeping
//! and queue maintenance. Dispatch and execution live in `engine`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use indexmap::IndexSet;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::action::Action;
use crate::config::ContainerConfig;
use crate::error::{StoreError, StoreResult};
use crate::hooks::{AutoActions, AutoState, Reducer};
use crate::listeners::{Listener, ListenerKey, ListenerRegistry, Notification, Registered};
use crate::persist::Persistence;
use crate::queue::{ActionQueue, QueueSnapshot, QueueStatus};
use crate::state::State;

// ---------------------------------------------------------------------------
// Container record
// ---------------------------------------------------------------------------

pub(crate) struct Container<A: Action> {
    pub(crate) id: String,
    pub(crate) reducer: Arc<dyn Reducer<A>>,
    pub(crate) auto_actions: Option<Arc<dyn AutoActions<A>>>,
    pub(crate) auto_state: Option<Arc<dyn AutoState<A>>>,
    pub(crate) persistence: Option<Persistence>,
    inner: Mutex<ContainerInner<A>>,
}

/// Mutable part of a container. Never held across an `.await` or while
/// user code runs.
pub(crate) struct ContainerInner<A: Action> {
    pub(crate) config: ContainerConfig,
    /// State before the in-flight action.
    pub(crate) old_state: State,
    /// Authoritative current state.
    pub(crate) new_state: State,
    /// Overlay for readers until the dispatched action's state lands.
    pub(crate) immediate_state: Option<State>,
    pub(crate) queue: ActionQueue<A>,
    pub(crate) listeners: ListenerRegistry<A>,
    pub(crate) changed_paths: Vec<String>,
    /// Union of changed paths across the current burst.
    pub(crate) late_invoke_changed_paths: IndexSet<String>,
}

impl<A: Action> Container<A> {
    pub(crate) fn lock(&self) -> MutexGuard<'_, ContainerInner<A>> {
        self.inner.lock().expect("container lock poisoned")
    }
}

impl<A: Action> ContainerInner<A> {
    /// Merged view handed to external readers.
    pub(crate) fn visible_state(&self) -> State {
        let mut state = self.new_state.clone();
        if let Some(overlay) = &self.immediate_state {
            state.merge(overlay);
        }
        state
    }
}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

pub type InitialStateFn = Arc<dyn Fn(Map<String, Value>) -> State + Send + Sync>;

pub enum InitialState {
    Value(State),
    /// Built from the persisted envelope contents (converted when the stored
    /// version differs). Requires persistence.
    FromPersisted(InitialStateFn),
}

/// Everything needed to register a container.
pub struct Registration<A: Action> {
    pub container_id: String,
    pub initial_state: InitialState,
    pub reducer: Arc<dyn Reducer<A>>,
    pub auto_actions: Option<Arc<dyn AutoActions<A>>>,
    pub auto_state: Option<Arc<dyn AutoState<A>>>,
    pub config: ContainerConfig,
    pub persistence: Option<Persistence>,
}

impl<A: Action> Registration<A> {
    pub fn new<R>(container_id: impl Into<String>, initial_state: State, reducer: R) -> Self
    where
        R: Reducer<A> + 'static,
    {
        Self {
            container_id: container_id.into(),
            initial_state: InitialState::Value(initial_state),
            reducer: Arc::new(reducer),
            auto_actions: None,
            auto_state: None,
            config: ContainerConfig::default(),
            persistence: None,
        }
    }

    pub fn from_persisted<F, R>(container_id: impl Into<String>, initial_state: F, reducer: R) -> Self
    where
        F: Fn(Map<String, Value>) -> State + Send + Sync + 'static,
        R: Reducer<A> + 'static,
    {
        Self {
            initial_state: InitialState::FromPersisted(Arc::new(initial_state)),
            ..Self::new(container_id, State::new(), reducer)
        }
    }

    pub fn with_config(mut self, config: ContainerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_persistence(mut self, persistence: Persistence) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn with_auto_actions(mut self, hook: impl AutoActions<A> + 'static) -> Self {
        self.auto_actions = Some(Arc::new(hook));
        self
    }

    pub fn with_auto_state(mut self, hook: impl AutoState<A> + 'static) -> Self {
        self.auto_state = Some(Arc::new(hook));
        self
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Named set of independent containers sharing one action type.
///
/// Cheap to clone; clones share the same containers. Several registries can
/// coexist in one process.
pub struct Registry<A: Action> {
    containers: Arc<RwLock<HashMap<String, Arc<Container<A>>>>>,
}

impl<A: Action> Clone for Registry<A> {
    fn clone(&self) -> Self {
        Self {
            containers: Arc::clone(&self.containers),
        }
    }
}

impl<A: Action> Default for Registry<A> {
    fn default() -> Self {
        Self {
            containers: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl<A: Action> Registry<A> {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn container(&self, container_id: &str) -> Option<Arc<Container<A>>> {
        self.containers
            .read()
            .expect("registry lock poisoned")
            .get(container_id)
            .cloned()
    }

    pub fn container_registered(&self, container_id: &str) -> bool {
        self.containers
            .read()
            .expect("registry lock poisoned")
            .contains_key(container_id)
    }

    /// Register (or re-register) a container.
    ///
    /// With `keep_state` set, registering an id that already exists leaves
    /// the existing container untouched.
    pub async fn register(&self, registration: Registration<A>) -> StoreResult<()> {
        let Registration {
            container_id,
            initial_state,
            reducer,
            auto_actions,
            auto_state,
            config,
            persistence,
        } = registration;

        if config.keep_state && self.container_registered(&container_id) {
            debug!(container_id = %container_id, "Container already registered, keeping state");
            return Ok(());
        }

        let state = match initial_state {
            InitialState::Value(state) => state,
            InitialState::FromPersisted(init) => {
                let persistence = persistence
                    .as_ref()
                    .ok_or_else(|| StoreError::MissingPersistence(container_id.clone()))?;
                let envelope = persistence
                    .backend
                    .get_envelope(&persistence.key(&container_id))
                    .await
                    .map_err(StoreError::Persistence)?;
                init(persistence.restore(envelope))
            }
        };

        if let Some(flag) = &config.managed_attributes.async_operation_flag {
            if config.debug.warnings && !state.contains(flag) {
                warn!(container_id = %container_id, flag = flag.as_str(), "Async operation flag is missing from the initial state");
            }
        }

        if config.debug.registration.container.registering {
            debug!(container_id = %container_id, "Container registered");
        }

        let container = Container {
            id: container_id.clone(),
            reducer,
            auto_actions,
            auto_state,
            persistence,
            inner: Mutex::new(ContainerInner {
                queue: ActionQueue::new(config.action_queue_max_length),
                config,
                old_state: state.clone(),
                new_state: state,
                immediate_state: None,
                listeners: ListenerRegistry::default(),
                changed_paths: Vec::new(),
                late_invoke_changed_paths: IndexSet::new(),
            }),
        };

        self.containers
            .write()
            .expect("registry lock poisoned")
            .insert(container_id, Arc::new(container));
        Ok(())
    }

    /// Remove a container. Refused (returns false) while actions are queued.
    pub fn unregister(&self, container_id: &str) -> bool {
        let mut containers = self.containers.write().expect("registry lock poisoned");
        let Some(container) = containers.get(container_id) else {
            return false;
        };

        let inner = container.lock();
        if let Some(last) = inner.queue.last_index() {
            warn!(
                container_id,
                enqueued = last + 1,
                "Failed to unregister container with actions enqueued"
            );
            return false;
        }
        let announce = inner.config.debug.registration.container.unregistering;
        drop(inner);

        containers.remove(container_id);
        if announce {
            debug!(container_id, "Container unregistered");
        }
        true
    }

    /// Current state with the immediate overlay applied.
    pub fn get_container(&self, container_id: &str, ignore_unregistered: bool) -> StoreResult<State> {
        match self.container(container_id) {
            Some(container) => Ok(container.lock().visible_state()),
            None if ignore_unregistered => Ok(State::new()),
            None => Err(StoreError::Unregistered(container_id.to_string())),
        }
    }

    pub fn get_container_config(
        &self,
        container_id: &str,
        ignore_unregistered: bool,
    ) -> StoreResult<ContainerConfig> {
        match self.container(container_id) {
            Some(container) => Ok(container.lock().config.clone()),
            None if ignore_unregistered => Ok(ContainerConfig::default()),
            None => Err(StoreError::Unregistered(container_id.to_string())),
        }
    }

    /// Modify a container silently: no reducer, no listeners.
    ///
    /// `state` is merged into the current state (and into a pending immediate
    /// overlay, so readers see it). A new config takes effect immediately,
    /// except for the queue capacity, which applies once the queue is drained.
    pub fn update_state_container(
        &self,
        container_id: &str,
        config: Option<ContainerConfig>,
        state: Option<State>,
    ) {
        let Some(container) = self.container(container_id) else {
            warn!(container_id, "Container not found");
            return;
        };

        let mut inner = container.lock();
        if let Some(config) = config {
            if inner.queue.is_idle() && inner.queue.is_empty() {
                inner.queue = ActionQueue::new(config.action_queue_max_length);
            }
            inner.config = config;
        }
        if let Some(state) = state {
            inner.new_state.merge(&state);
            if let Some(overlay) = inner.immediate_state.as_mut() {
                overlay.merge(&state);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Listeners
    // -----------------------------------------------------------------------

    fn register_listener(
        &self,
        container_id: &str,
        key: ListenerKey,
        listener_id: &str,
        listener: Listener<A>,
    ) -> StoreResult<()> {
        let container = self
            .container(container_id)
            .ok_or_else(|| StoreError::Unregistered(container_id.to_string()))?;

        let mut inner = container.lock();
        let announce = inner.config.debug.registration.listeners.registering;
        let path = key.to_string();
        let replaced = inner.listeners.register(key, listener_id, listener) == Registered::Replaced;
        if announce {
            debug!(
                container_id,
                listener = listener_id,
                path = path.as_str(),
                replaced,
                "Registered listener"
            );
        }
        Ok(())
    }

    fn unregister_listener(&self, container_id: &str, key: &ListenerKey, listener_id: &str) {
        let Some(container) = self.container(container_id) else {
            return;
        };

        let mut inner = container.lock();
        if !inner.listeners.unregister(key, listener_id) {
            if inner.config.debug.warnings {
                warn!(container_id, listener = listener_id, path = %key, "Unregistering problem: listener is not indexed");
            }
            return;
        }
        if inner.config.debug.registration.listeners.unregistering {
            debug!(container_id, listener = listener_id, path = %key, "Unregistered listener");
        }
    }

    /// Invoke `callback` after the state at `state_path` changes (`"*"` for
    /// any change). Late-invoke listeners fire once per burst, after its
    /// last state-changing action. Re-registering the same listener id for
    /// the same path replaces the callback.
    pub fn register_state_changed_callback<F>(
        &self,
        container_id: &str,
        listener_id: &str,
        state_path: &str,
        late_invoke: bool,
        callback: F,
    ) -> StoreResult<()>
    where
        F: Fn(&Notification<A>) + Send + Sync + 'static,
    {
        self.register_listener(
            container_id,
            ListenerKey::for_state_path(state_path, late_invoke),
            listener_id,
            Arc::new(callback),
        )
    }

    /// `late_invoke` must match the value used at registration.
    pub fn unregister_state_changed_callback(
        &self,
        container_id: &str,
        listener_id: &str,
        state_path: &str,
        late_invoke: bool,
    ) {
        self.unregister_listener(
            container_id,
            &ListenerKey::for_state_path(state_path, late_invoke),
            listener_id,
        );
    }

    /// Register one listener id for several paths at once.
    pub fn register_state_changed_callbacks<I, P>(
        &self,
        container_id: &str,
        listener_id: &str,
        callbacks: I,
    ) -> StoreResult<()>
    where
        I: IntoIterator<Item = (P, Listener<A>)>,
        P: AsRef<str>,
    {
        for (path, callback) in callbacks {
            self.register_listener(
                container_id,
                ListenerKey::for_state_path(path.as_ref(), false),
                listener_id,
                callback,
            )?;
        }
        Ok(())
    }

    pub fn unregister_state_changed_callbacks<P: AsRef<str>>(
        &self,
        container_id: &str,
        listener_id: &str,
        state_paths: &[P],
    ) {
        for path in state_paths {
            self.unregister_state_changed_callback(container_id, listener_id, path.as_ref(), false);
        }
    }

    /// Invoke `callback` every time an action named `action_name` executes,
    /// whether or not the reducer ran or changed anything.
    pub fn register_action_dispatched_callback<F>(
        &self,
        container_id: &str,
        listener_id: &str,
        action_name: &str,
        callback: F,
    ) -> StoreResult<()>
    where
        F: Fn(&Notification<A>) + Send + Sync + 'static,
    {
        self.register_listener(
            container_id,
            ListenerKey::ActionDispatched(action_name.to_string()),
            listener_id,
            Arc::new(callback),
        )
    }

    pub fn unregister_action_dispatched_callback(
        &self,
        container_id: &str,
        listener_id: &str,
        action_name: &str,
    ) {
        self.unregister_listener(
            container_id,
            &ListenerKey::ActionDispatched(action_name.to_string()),
            listener_id,
        );
    }

    // -----------------------------------------------------------------------
    // Queue maintenance
    // -----------------------------------------------------------------------

    pub fn action_in_queue_status(&self, container_id: &str, name: &str) -> QueueStatus {
        match self.container(container_id) {
            Some(container) => container.lock().queue.status(name),
            None => QueueStatus::NoContainer,
        }
    }

    /// Put an action into the queue without starting execution.
    pub fn enqueue_action(&self, container_id: &str, action: A) -> StoreResult<()> {
        let Some(container) = self.container(container_id) else {
            warn!(container_id, action = action.name(), "Cannot enqueue action - container not found");
            return Ok(());
        };
        let mut inner = container.lock();
        crate::engine::enqueue_logged(&container.id, &mut inner, action)
    }

    /// Drop every pending action of a container, keeping the running one.
    pub fn clear_all_enqueued_actions(&self, container_id: &str) {
        if let Some(container) = self.container(container_id) {
            container.lock().queue.clear();
        }
    }

    pub fn queue_snapshot(&self, container_id: &str) -> Option<QueueSnapshot<A>> {
        self.container(container_id)
            .map(|container| container.lock().queue.snapshot())
    }

    /// Resolves once no action is executing in the container (or it is gone).
    /// Meant for tests.
    pub async fn finished_processing_queue(&self, container_id: &str) {
        loop {
            match self.container(container_id) {
                Some(container) if !container.lock().queue.is_idle() => {}
                _ => return,
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }
}

/// 32 random hex characters, e.g. for listener ids.
pub fn get_unique_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}
