mod common;

use std::sync::Arc;

use serde_json::json;
use sssync::{EventDefinition, FieldKind, MaterializerAction, Schema, SyncEngine, SyncError};

use common::{host, page_row, pages_engine, pages_schema, raw};

#[test]
fn test_commit_materializes_batch_in_order() {
    let host = host("app");
    let mut engine = pages_engine("app", &host);

    let envelopes = engine
        .commit(vec![
            raw("pageCreated", json!({"id": "p1", "title": "Hello"})),
            raw("pageRenamed", json!({"id": "p1", "title": "World"})),
        ])
        .unwrap();

    assert_eq!(envelopes.len(), 2);
    assert_eq!(engine.events().len(), 2);
    assert_eq!(
        engine.tables()["pages"],
        vec![json!({"id": "p1", "title": "World"})]
    );
    // Sole handle holds the lock, so the merged row is already durable.
    assert!(engine.is_leader());
    assert_eq!(
        engine.storage().get_data("pages/p1").unwrap(),
        Some(json!({"id": "p1", "title": "World"}))
    );
}

#[test]
fn test_later_materializer_sees_earlier_rows() {
    let host = host("app");
    let mut engine = pages_engine("app", &host);

    engine
        .commit(vec![
            raw("pageCreated", json!({"id": "original", "title": "Hello"})),
            raw("pageCopied", json!({"id": "copy", "from": "original"})),
        ])
        .unwrap();

    assert_eq!(
        page_row(&engine, "copy"),
        Some(json!({"id": "copy", "title": "Hello"}))
    );
}

#[test]
fn test_validation_failure_leaves_tables_unchanged() {
    let host = host("app");
    let mut engine = pages_engine("app", &host);

    let result = engine.commit(vec![raw("pageCreated", json!({"id": "p1"}))]);

    assert!(matches!(result, Err(SyncError::Validation(_))));
    assert!(engine.tables()["pages"].is_empty());
    assert!(engine.events().is_empty());
    assert!(engine.storage().mutation_log().unwrap().is_empty());
}

#[test]
fn test_failed_event_keeps_committed_prefix() {
    let host = host("app");
    let mut engine = pages_engine("app", &host);

    let result = engine.commit(vec![
        raw("pageCreated", json!({"id": "p1", "title": "Hello"})),
        raw("pageRenamed", json!({"id": "p1", "title": 7})),
        raw("pageCreated", json!({"id": "p2", "title": "Never"})),
    ]);

    assert!(matches!(result, Err(SyncError::Validation(_))));
    assert_eq!(
        page_row(&engine, "p1"),
        Some(json!({"id": "p1", "title": "Hello"}))
    );
    assert_eq!(page_row(&engine, "p2"), None);
    assert_eq!(engine.events().len(), 1);
    assert_eq!(
        engine.storage().get_data("pages/p1").unwrap(),
        Some(json!({"id": "p1", "title": "Hello"}))
    );
    assert_eq!(engine.storage().mutation_log().unwrap().len(), 1);
}

#[test]
fn test_unknown_event_rejected() {
    let host = host("app");
    let mut engine = pages_engine("app", &host);

    let result = engine.commit(vec![raw("pageDeleted", json!({"id": "p1"}))]);
    assert!(matches!(result, Err(SyncError::UnknownEvent(name)) if name == "pageDeleted"));
}

#[test]
fn test_event_without_materializer_rejected() {
    let host = host("app");
    let mut engine = SyncEngine::builder("app")
        .table("pages", pages_schema())
        .event(EventDefinition::new("orphanEvent", Schema::object()))
        .storage(host.storage.clone())
        .bus(Arc::new(host.bus.clone()))
        .lock(Arc::new(host.lock.clone()))
        .open()
        .unwrap();

    let result = engine.commit(vec![raw("orphanEvent", json!({}))]);
    assert!(matches!(result, Err(SyncError::MissingMaterializer(name)) if name == "orphanEvent"));
}

#[test]
fn test_duplicate_create_is_noop_in_memory() {
    let host = host("app");
    let mut engine = pages_engine("app", &host);

    engine
        .commit(vec![raw("pageCreated", json!({"id": "p1", "title": "Hello"}))])
        .unwrap();
    engine
        .commit(vec![raw("pageCreated", json!({"id": "p1", "title": "Other"}))])
        .unwrap();

    // The table keeps the first row; the durable store takes the later
    // write, which wins once a rescan notice is pumped.
    assert_eq!(engine.tables()["pages"].len(), 1);
    assert_eq!(
        page_row(&engine, "p1"),
        Some(json!({"id": "p1", "title": "Hello"}))
    );
    assert_eq!(
        engine.storage().get_data("pages/p1").unwrap(),
        Some(json!({"id": "p1", "title": "Other"}))
    );

    engine.pump().unwrap();
    assert_eq!(
        page_row(&engine, "p1"),
        Some(json!({"id": "p1", "title": "Other"}))
    );
}

#[test]
fn test_update_without_row_is_noop() {
    let host = host("app");
    let mut engine = pages_engine("app", &host);

    engine
        .commit(vec![raw("pageRenamed", json!({"id": "ghost", "title": "X"}))])
        .unwrap();

    assert!(engine.tables()["pages"].is_empty());
    assert_eq!(engine.storage().get_data("pages/ghost").unwrap(), None);
}

#[test]
fn test_action_on_undeclared_table_rejected_without_partial_mutation() {
    let host = host("app");
    let mut engine = SyncEngine::builder("app")
        .table("pages", pages_schema())
        .event(EventDefinition::new(
            "ghostEvent",
            Schema::object().field("id", FieldKind::String),
        ))
        .materializer("ghostEvent", |payload, _ctx| {
            vec![
                MaterializerAction::create("pages", json!({"id": payload["id"], "title": "ok"})),
                MaterializerAction::create("ghosts", json!({"id": payload["id"]})),
            ]
        })
        .storage(host.storage.clone())
        .bus(Arc::new(host.bus.clone()))
        .lock(Arc::new(host.lock.clone()))
        .open()
        .unwrap();

    let result = engine.commit(vec![raw("ghostEvent", json!({"id": "g1"}))]);

    assert!(matches!(result, Err(SyncError::UnknownTable(table)) if table == "ghosts"));
    assert!(engine.tables()["pages"].is_empty());
}

#[test]
fn test_commit_after_destroy_is_rejected() {
    let host = host("app");
    let mut engine = pages_engine("app", &host);

    engine.destroy();
    let result = engine.commit(vec![raw("pageCreated", json!({"id": "p1", "title": "Hello"}))]);
    assert!(matches!(result, Err(SyncError::NotReady)));
}
