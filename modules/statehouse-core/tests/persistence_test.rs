//! Restoring initial state from, and writing changes through to, a backend.

mod common;

use std::sync::Arc;

use common::{sum, CalcAction, CalcReducer, CALC};
use serde_json::{json, Map, Value};
use statehouse_core::{
    MemoryBackend, Persistence, PersistenceEnvelope, Registration, Registry, State, StoreError,
};

fn envelope(contents: Value, version: &str) -> PersistenceEnvelope {
    let Value::Object(contents) = contents else {
        panic!("envelope contents must be an object");
    };
    PersistenceEnvelope {
        contents,
        version: version.into(),
    }
}

fn restore(contents: Map<String, Value>) -> State {
    let mut state = State::new().with("sum", 0);
    state.merge(&State::from_map(contents));
    state
}

#[tokio::test]
async fn initial_state_is_built_from_the_stored_envelope() {
    let backend = Arc::new(
        MemoryBackend::new().with_envelope("App.Container.calc", envelope(json!({ "sum": 42 }), "1")),
    );
    let registry = Registry::new();
    registry
        .register(
            Registration::from_persisted(CALC, restore, CalcReducer::default())
                .with_persistence(Persistence::new(backend.clone(), "1").with_attributes(["sum"])),
        )
        .await
        .unwrap();

    assert_eq!(sum(&registry), 42);
}

#[tokio::test]
async fn missing_envelope_falls_back_to_defaults() {
    let registry = Registry::new();
    registry
        .register(
            Registration::from_persisted(CALC, restore, CalcReducer::default())
                .with_persistence(Persistence::new(Arc::new(MemoryBackend::new()), "1")),
        )
        .await
        .unwrap();

    assert_eq!(sum(&registry), 0);
}

#[tokio::test]
async fn outdated_envelope_goes_through_the_converter() {
    let backend = Arc::new(
        MemoryBackend::new().with_envelope("Calc.calc", envelope(json!({ "total": 7 }), "0")),
    );
    let persistence = Persistence::new(backend, "1")
        .with_prefix("Calc")
        .with_converter(|mut contents, _version| {
            if let Some(total) = contents.remove("total") {
                contents.insert("sum".into(), total);
            }
            contents
        });

    let registry = Registry::new();
    registry
        .register(
            Registration::from_persisted(CALC, restore, CalcReducer::default())
                .with_persistence(persistence),
        )
        .await
        .unwrap();

    assert_eq!(sum(&registry), 7);
}

#[tokio::test]
async fn initial_state_fn_needs_persistence() {
    let registry: Registry<CalcAction> = Registry::new();
    let result = registry
        .register(Registration::from_persisted(CALC, restore, CalcReducer::default()))
        .await;

    assert!(matches!(result, Err(StoreError::MissingPersistence(id)) if id == CALC));
    assert!(!registry.container_registered(CALC));
}

#[tokio::test]
async fn changed_attributes_are_written_through() {
    let backend = Arc::new(MemoryBackend::new());
    let registry = Registry::new();
    registry
        .register(
            Registration::new(CALC, State::new().with("sum", 0), CalcReducer::default())
                .with_persistence(Persistence::new(backend.clone(), "2").with_attributes(["sum"])),
        )
        .await
        .unwrap();

    registry.dispatch(CALC, CalcAction::Add(3)).unwrap();
    registry.dispatch(CALC, CalcAction::Move(1)).unwrap();
    registry.finished_processing_queue(CALC).await;

    assert_eq!(backend.writes(), vec!["App.Container.calc".to_string()]);
    assert_eq!(
        backend.envelope("App.Container.calc"),
        Some(envelope(json!({ "sum": 3 }), "2"))
    );

    registry.dispatch(CALC, CalcAction::Add(4)).unwrap();
    registry.finished_processing_queue(CALC).await;
    assert_eq!(backend.writes().len(), 2);
    assert_eq!(
        backend.envelope("App.Container.calc"),
        Some(envelope(json!({ "sum": 7 }), "2"))
    );
}

#[tokio::test]
async fn custom_key_fn_picks_the_storage_key() {
    let backend = Arc::new(MemoryBackend::new());
    let registry = Registry::new();
    registry
        .register(
            Registration::new(CALC, State::new().with("sum", 0), CalcReducer::default()).with_persistence(
                Persistence::new(backend.clone(), "1")
                    .with_attributes(["sum"])
                    .with_key_fn(|id, _prefix| format!("store/{id}")),
            ),
        )
        .await
        .unwrap();

    registry.dispatch(CALC, CalcAction::Add(1)).unwrap();
    registry.finished_processing_queue(CALC).await;

    assert_eq!(backend.writes(), vec!["store/calc".to_string()]);
}
