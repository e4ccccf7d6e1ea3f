//! Shared fixtures for the integration suites: a host (storage + bus +
//! lock) standing in for one logical client, a small pages domain and
//! counting fetchers.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::{json, Value};
use sssync::{
    EventDefinition, FieldKind, LocalBus, LocalLock, MaterializerAction, RawEvent, RemoteFetcher,
    Schema, Storage, SyncBuilder, SyncEngine, SyncError, SyncResult,
};
use ulid::Ulid;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// One logical client: every engine handle built against the same `Host`
/// plays the role of one process (tab/worker) of that client.
pub struct Host {
    pub bus: LocalBus,
    pub lock: LocalLock,
    pub storage: Storage,
    _dir: tempfile::TempDir,
}

pub fn host(instance: &str) -> Host {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let storage =
        Storage::open(dir.path().join(format!("{instance}.redb")), instance, 1000).unwrap();
    Host {
        bus: LocalBus::new(),
        lock: LocalLock::new(),
        storage,
        _dir: dir,
    }
}

pub fn pages_schema() -> Schema {
    Schema::row().field("title", FieldKind::String)
}

fn page_payload_schema() -> Schema {
    Schema::object()
        .field("id", FieldKind::String)
        .field("title", FieldKind::String)
}

/// Builder preloaded with the pages domain: `pageCreated`, `pageRenamed`
/// and `pageCopied` (whose materializer reads the current tables, to
/// exercise in-batch ordering).
pub fn pages_builder(instance: &str, host: &Host) -> SyncBuilder {
    SyncEngine::builder(instance)
        .table("pages", pages_schema())
        .event(EventDefinition::new("pageCreated", page_payload_schema()))
        .event(EventDefinition::new("pageRenamed", page_payload_schema()))
        .event(EventDefinition::new(
            "pageCopied",
            Schema::object()
                .field("id", FieldKind::String)
                .field("from", FieldKind::String),
        ))
        .materializer("pageCreated", |payload, _ctx| {
            vec![MaterializerAction::create("pages", payload.clone())]
        })
        .materializer("pageRenamed", |payload, _ctx| {
            vec![MaterializerAction::update("pages", payload.clone())]
        })
        .materializer("pageCopied", |payload, ctx| {
            let from = payload.get("from").and_then(Value::as_str).unwrap_or("");
            let title = ctx.tables["pages"]
                .iter()
                .find(|row| row.get("id").and_then(Value::as_str) == Some(from))
                .and_then(|row| row.get("title").and_then(Value::as_str))
                .unwrap_or("untitled");
            vec![MaterializerAction::create(
                "pages",
                json!({"id": payload["id"], "title": title}),
            )]
        })
        .storage(host.storage.clone())
        .bus(Arc::new(host.bus.clone()))
        .lock(Arc::new(host.lock.clone()))
}

pub fn pages_engine(instance: &str, host: &Host) -> SyncEngine {
    pages_builder(instance, host).open().unwrap()
}

pub fn raw(name: &str, payload: Value) -> RawEvent {
    RawEvent::new(Ulid::new().to_string(), name, payload, 100)
}

pub fn page_row(engine: &SyncEngine, id: &str) -> Option<Value> {
    engine.tables()["pages"]
        .iter()
        .find(|row| row.get("id").and_then(Value::as_str) == Some(id))
        .cloned()
}

/// Fetcher that counts how often the remote is actually hit.
pub struct CountingFetcher {
    hits: Arc<AtomicUsize>,
    response: Value,
}

impl CountingFetcher {
    pub fn new(response: Value) -> (Box<Self>, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        (
            Box::new(Self {
                hits: hits.clone(),
                response,
            }),
            hits,
        )
    }
}

impl RemoteFetcher for CountingFetcher {
    fn fetch(&self, _path: &str) -> SyncResult<Value> {
        self.hits.fetch_add(1, Ordering::SeqCst);
        Ok(self.response.clone())
    }
}

/// Fetcher standing in for a remote that always answers non-2xx.
pub struct FailingFetcher {
    pub status: u16,
}

impl RemoteFetcher for FailingFetcher {
    fn fetch(&self, path: &str) -> SyncResult<Value> {
        Err(SyncError::QueryFetch {
            path: path.to_string(),
            status: self.status,
        })
    }
}
