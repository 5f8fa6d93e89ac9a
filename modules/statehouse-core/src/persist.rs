//! Persistence envelope, backend contract and backend implementations.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::state::State;

pub const DEFAULT_PERSISTENCE_PREFIX: &str = "App.Container";

/// The persisted fragment of a container's state, tagged with a version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistenceEnvelope {
    pub contents: Map<String, Value>,
    pub version: String,
}

/// Key-value store holding envelopes.
///
/// Implemented by `MemoryBackend` (tests) and `FileBackend` (one JSON file
/// per key). Also implemented for `Arc<P>` so a backend can be shared for
/// assertions.
#[async_trait]
pub trait PersistenceBackend: Send + Sync {
    async fn get_envelope(&self, key: &str) -> Result<Option<PersistenceEnvelope>>;

    async fn set_envelope(&self, key: &str, envelope: PersistenceEnvelope) -> Result<()>;
}

/// `"{prefix}.{container_id}"`, prefix defaulting to `App.Container`.
pub fn persistence_key(prefix: Option<&str>, container_id: &str) -> String {
    format!(
        "{}.{}",
        prefix.unwrap_or(DEFAULT_PERSISTENCE_PREFIX),
        container_id
    )
}

pub type KeyFn = Arc<dyn Fn(&str, Option<&str>) -> String + Send + Sync>;

/// Migrates persisted contents written under an older `version`.
pub type Converter = Arc<dyn Fn(Map<String, Value>, &str) -> Map<String, Value> + Send + Sync>;

/// Persistence settings of one container.
#[derive(Clone)]
pub struct Persistence {
    pub backend: Arc<dyn PersistenceBackend>,
    /// Attributes written through to the envelope when they change.
    pub attributes: Vec<String>,
    pub version: String,
    pub prefix: Option<String>,
    pub key_fn: Option<KeyFn>,
    pub converter: Option<Converter>,
}

impl Persistence {
    pub fn new(backend: Arc<dyn PersistenceBackend>, version: impl Into<String>) -> Self {
        Self {
            backend,
            attributes: Vec::new(),
            version: version.into(),
            prefix: None,
            key_fn: None,
            converter: None,
        }
    }

    pub fn with_attributes<I, S>(mut self, attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.attributes = attributes.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    pub fn with_key_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, Option<&str>) -> String + Send + Sync + 'static,
    {
        self.key_fn = Some(Arc::new(f));
        self
    }

    pub fn with_converter<F>(mut self, f: F) -> Self
    where
        F: Fn(Map<String, Value>, &str) -> Map<String, Value> + Send + Sync + 'static,
    {
        self.converter = Some(Arc::new(f));
        self
    }

    pub fn key(&self, container_id: &str) -> String {
        match &self.key_fn {
            Some(f) => f(container_id, self.prefix.as_deref()),
            None => persistence_key(self.prefix.as_deref(), container_id),
        }
    }

    /// Stored contents in the current version's shape. A version mismatch
    /// goes through the converter when one is configured.
    pub(crate) fn restore(&self, envelope: Option<PersistenceEnvelope>) -> Map<String, Value> {
        match envelope {
            Some(envelope) if envelope.version != self.version => match &self.converter {
                Some(convert) => convert(envelope.contents, &envelope.version),
                None => envelope.contents,
            },
            Some(envelope) => envelope.contents,
            None => Map::new(),
        }
    }

    /// Merge the changed persisted attributes of `state` into `existing`.
    /// `None` when none of them changed.
    ///
    /// The result carries the current version, so an envelope restored from
    /// an older version keeps its old version in the backend until one of the
    /// persisted attributes changes.
    pub(crate) fn merge_changes(
        &self,
        existing: Option<PersistenceEnvelope>,
        changed_paths: &[String],
        state: &State,
    ) -> Option<PersistenceEnvelope> {
        let mut contents = existing.map(|e| e.contents).unwrap_or_default();
        let mut touched = false;
        for path in changed_paths.iter().filter(|p| self.attributes.contains(p)) {
            match state.get(path) {
                Some(value) => contents.insert(path.clone(), value.clone()),
                None => contents.remove(path),
            };
            touched = true;
        }

        (touched && !contents.is_empty()).then(|| PersistenceEnvelope {
            contents,
            version: self.version.clone(),
        })
    }
}

// ---------------------------------------------------------------------------
// MemoryBackend (tests)
// ---------------------------------------------------------------------------

/// In-memory envelope store. Thread-safe.
#[derive(Default)]
pub struct MemoryBackend {
    envelopes: Mutex<HashMap<String, PersistenceEnvelope>>,
    writes: Mutex<Vec<String>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_envelope(self, key: impl Into<String>, envelope: PersistenceEnvelope) -> Self {
        self.envelopes
            .lock()
            .expect("memory backend lock poisoned")
            .insert(key.into(), envelope);
        self
    }

    /// Read an envelope directly (for test assertions).
    pub fn envelope(&self, key: &str) -> Option<PersistenceEnvelope> {
        self.envelopes
            .lock()
            .expect("memory backend lock poisoned")
            .get(key)
            .cloned()
    }

    /// Keys in the order they were written.
    pub fn writes(&self) -> Vec<String> {
        self.writes
            .lock()
            .expect("memory backend lock poisoned")
            .clone()
    }
}

#[async_trait]
impl PersistenceBackend for MemoryBackend {
    async fn get_envelope(&self, key: &str) -> Result<Option<PersistenceEnvelope>> {
        Ok(self.envelope(key))
    }

    async fn set_envelope(&self, key: &str, envelope: PersistenceEnvelope) -> Result<()> {
        self.envelopes
            .lock()
            .expect("memory backend lock poisoned")
            .insert(key.to_string(), envelope);
        self.writes
            .lock()
            .expect("memory backend lock poisoned")
            .push(key.to_string());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FileBackend
// ---------------------------------------------------------------------------

/// Stores each envelope as `<dir>/<key>.json`.
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let file: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{file}.json"))
    }
}

#[async_trait]
impl PersistenceBackend for FileBackend {
    async fn get_envelope(&self, key: &str) -> Result<Option<PersistenceEnvelope>> {
        let path = self.path_for(key);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read envelope: {}", path.display()))
            }
        };
        let envelope = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse envelope: {}", path.display()))?;
        Ok(Some(envelope))
    }

    async fn set_envelope(&self, key: &str, envelope: PersistenceEnvelope) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create directory: {}", self.dir.display()))?;
        let path = self.path_for(key);
        let content = serde_json::to_string_pretty(&envelope)?;
        tokio::fs::write(&path, content)
            .await
            .with_context(|| format!("Failed to write envelope: {}", path.display()))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Arc<P> blanket impl
// ---------------------------------------------------------------------------

#[async_trait]
impl<P: PersistenceBackend + ?Sized> PersistenceBackend for Arc<P> {
    async fn get_envelope(&self, key: &str) -> Result<Option<PersistenceEnvelope>> {
        (**self).get_envelope(key).await
    }

    async fn set_envelope(&self, key: &str, envelope: PersistenceEnvelope) -> Result<()> {
        (**self).set_envelope(key, envelope).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn contents(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn default_key_uses_app_container_prefix() {
        assert_eq!(persistence_key(None, "todos"), "App.Container.todos");
        assert_eq!(persistence_key(Some("Mine"), "todos"), "Mine.todos");

        let persistence = Persistence::new(Arc::new(MemoryBackend::new()), "1")
            .with_key_fn(|id, _| format!("custom/{id}"));
        assert_eq!(persistence.key("todos"), "custom/todos");
    }

    #[test]
    fn only_changed_persisted_attributes_are_merged() {
        let persistence = Persistence::new(Arc::new(MemoryBackend::new()), "2")
            .with_attributes(["items", "filter"]);
        let existing = PersistenceEnvelope {
            contents: contents(json!({ "filter": "all" })),
            version: "1".into(),
        };
        let state = State::from_value(json!({ "items": [1], "filter": "done", "cursor": 4 })).unwrap();

        let merged = persistence
            .merge_changes(Some(existing), &["items".into(), "cursor".into()], &state)
            .unwrap();
        assert_eq!(merged.version, "2");
        assert_eq!(Value::Object(merged.contents), json!({ "filter": "all", "items": [1] }));

        assert!(persistence
            .merge_changes(None, &["cursor".into()], &state)
            .is_none());
    }

    #[test]
    fn older_version_is_restamped_only_on_a_persisted_change() {
        let persistence = Persistence::new(Arc::new(MemoryBackend::new()), "2")
            .with_attributes(["items"]);
        let existing = PersistenceEnvelope {
            contents: contents(json!({ "items": [0] })),
            version: "1".into(),
        };
        let state = State::from_value(json!({ "items": [0], "cursor": 9 })).unwrap();

        assert!(persistence
            .merge_changes(Some(existing.clone()), &["cursor".into()], &state)
            .is_none());

        let merged = persistence
            .merge_changes(Some(existing), &["items".into()], &state)
            .unwrap();
        assert_eq!(merged.version, "2");
    }

    #[test]
    fn version_mismatch_runs_the_converter() {
        let persistence = Persistence::new(Arc::new(MemoryBackend::new()), "2").with_converter(
            |mut contents, version| {
                assert_eq!(version, "1");
                if let Some(todos) = contents.remove("todos") {
                    contents.insert("items".into(), todos);
                }
                contents
            },
        );

        let restored = persistence.restore(Some(PersistenceEnvelope {
            contents: contents(json!({ "todos": ["a"] })),
            version: "1".into(),
        }));
        assert_eq!(Value::Object(restored), json!({ "items": ["a"] }));
        assert!(persistence.restore(None).is_empty());
    }

    #[tokio::test]
    async fn file_backend_round_trips_envelopes() {
        let dir = std::env::temp_dir().join(format!("statehouse-{}", uuid::Uuid::new_v4()));
        let backend = FileBackend::new(&dir);
        let envelope = PersistenceEnvelope {
            contents: contents(json!({ "sum": 3 })),
            version: "1".into(),
        };

        assert!(backend.get_envelope("App.Container.calc").await.unwrap().is_none());
        backend
            .set_envelope("App.Container.calc", envelope.clone())
            .await
            .unwrap();
        assert_eq!(
            backend.get_envelope("App.Container.calc").await.unwrap(),
            Some(envelope)
        );

        let _ = std::fs::remove_dir_all(dir);
    }
}
