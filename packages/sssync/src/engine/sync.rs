//! The engine core: commit pipeline, cross-process rails, leadership and
//! layered queries.
//!
//! One `SyncEngine` is one "process" of a logical client. All handles of an
//! instance id share a [`Storage`] clone, a message bus and a leader lock;
//! whichever handle holds the lock persists, everyone else forwards. The
//! engine never spawns threads: rail traffic and leadership grants are
//! observed cooperatively through [`SyncEngine::pump`].

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;
use tracing::{debug, info, instrument, warn};
use ulid::Ulid;

use crate::cache::QueryCache;
use crate::coord::local::{LocalBus, LocalLock};
use crate::coord::{LeaderLock, MessageBus, RescanNotice, Subscription, SyncMessage, Topic};
use crate::engine::apply::{apply_event, AppliedEvent, EventRegistry};
use crate::engine::tables::{DefaultTableStore, TableStore};
use crate::engine::types::{
    split_record_key, EventDefinition, EventEnvelope, FastMap, MaterializerAction,
    MaterializerContext, Millis, RawEvent, SyncResponse, TableName, Tables,
};
use crate::error::{SyncError, SyncResult};
use crate::fetch::RemoteFetcher;
use crate::persist::{RowWrite, Storage, StoredQuery};
use crate::schema::{Schema, ValidationError};

fn now_millis() -> Millis {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as Millis)
        .unwrap_or(0)
}

/// Assembles a [`SyncEngine`]. `open` performs the initial load, so the
/// returned engine is ready.
pub struct SyncBuilder {
    instance_id: String,
    schemas: Vec<(TableName, Schema)>,
    registry: EventRegistry,
    storage: Option<Storage>,
    store: Option<Box<dyn TableStore>>,
    bus: Option<Arc<dyn MessageBus>>,
    lock: Option<Arc<dyn LeaderLock>>,
    fetcher: Option<Box<dyn RemoteFetcher>>,
    cache_ttl_ms: Option<u64>,
}

impl SyncBuilder {
    /// Declares a table and its fixed row schema.
    pub fn table(mut self, name: impl Into<TableName>, schema: Schema) -> Self {
        self.schemas.push((name.into(), schema));
        self
    }

    pub fn event(mut self, definition: EventDefinition) -> Self {
        self.registry.define(definition);
        self
    }

    pub fn materializer<F>(mut self, name: impl Into<TableName>, materializer: F) -> Self
    where
        F: Fn(&Value, &MaterializerContext<'_>) -> Vec<MaterializerAction>
            + Send
            + Sync
            + 'static,
    {
        self.registry.on(name, materializer);
        self
    }

    pub fn storage(mut self, storage: Storage) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Replaces the default table store with a caller-provided (e.g.
    /// reactive) implementation.
    pub fn table_store(mut self, store: Box<dyn TableStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn bus(mut self, bus: Arc<dyn MessageBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn lock(mut self, lock: Arc<dyn LeaderLock>) -> Self {
        self.lock = Some(lock);
        self
    }

    pub fn fetcher(mut self, fetcher: Box<dyn RemoteFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// TTL for the in-memory query cache. Absent means never expire.
    pub fn cache_ttl_ms(mut self, ttl_ms: u64) -> Self {
        self.cache_ttl_ms = Some(ttl_ms);
        self
    }

    /// Opens the engine: ensures the durable stores exist, loads and
    /// validates every stored row, hydrates the table store, joins both
    /// rails and enters the leader queue.
    pub fn open(self) -> SyncResult<SyncEngine> {
        let storage = self
            .storage
            .ok_or_else(|| SyncError::Config("a storage handle is required".to_string()))?;
        let bus: Arc<dyn MessageBus> = self.bus.unwrap_or_else(|| Arc::new(LocalBus::new()));
        let lock: Arc<dyn LeaderLock> = self.lock.unwrap_or_else(|| Arc::new(LocalLock::new()));

        let table_names: Vec<TableName> =
            self.schemas.iter().map(|(name, _)| name.clone()).collect();
        let mut schemas = FastMap::default();
        for (name, schema) in self.schemas {
            schemas.insert(name, schema);
        }

        let mut store = self
            .store
            .unwrap_or_else(|| Box::new(DefaultTableStore::new(table_names.clone())));

        let mut tables: Tables = table_names
            .iter()
            .map(|name| (name.clone(), Vec::new()))
            .collect();
        for (key, row) in storage.load_data()? {
            let Some((table, _)) = split_record_key(&key) else {
                warn!(key, "skipping stored row with malformed key");
                continue;
            };
            let Some(schema) = schemas.get(table) else {
                warn!(key, "skipping stored row for undeclared table");
                continue;
            };
            match schema.validate(&row) {
                Ok(valid) => {
                    if let Some(rows) = tables.get_mut(table) {
                        rows.push(valid);
                    }
                }
                // Stale-schema defense: rows written under an old schema are
                // dropped instead of poisoning the table store.
                Err(error) => warn!(key, %error, "dropping stored row that fails validation"),
            }
        }
        store.hydrate(tables);

        let instance_id = self.instance_id;
        let process_id = Ulid::new().to_string();
        let sync_rail = bus.subscribe(&instance_id, Topic::Sync);
        let rescan_rail = bus.subscribe(&instance_id, Topic::Rescan);
        lock.request(&instance_id, &process_id);

        let cache = match self.cache_ttl_ms {
            Some(ttl) => QueryCache::with_ttl(ttl),
            None => QueryCache::new(),
        };

        let mut engine = SyncEngine {
            instance_id,
            process_id,
            schemas,
            registry: self.registry,
            store,
            events: Vec::new(),
            cache,
            storage,
            bus,
            lock,
            fetcher: self.fetcher,
            sync_rail: Some(sync_rail),
            rescan_rail: Some(rescan_rail),
            leader: false,
            last_known_leader: None,
            destroyed: false,
        };
        engine.refresh_leadership();
        Ok(engine)
    }
}

pub struct SyncEngine {
    instance_id: String,
    process_id: String,
    schemas: FastMap<TableName, Schema>,
    registry: EventRegistry,
    store: Box<dyn TableStore>,
    events: Vec<EventEnvelope>,
    cache: QueryCache<SyncResponse>,
    storage: Storage,
    bus: Arc<dyn MessageBus>,
    lock: Arc<dyn LeaderLock>,
    fetcher: Option<Box<dyn RemoteFetcher>>,
    sync_rail: Option<Subscription>,
    rescan_rail: Option<Subscription>,
    leader: bool,
    last_known_leader: Option<String>,
    destroyed: bool,
}

impl SyncEngine {
    pub fn builder(instance_id: impl Into<String>) -> SyncBuilder {
        SyncBuilder {
            instance_id: instance_id.into(),
            schemas: Vec::new(),
            registry: EventRegistry::new(),
            storage: None,
            store: None,
            bus: None,
            lock: None,
            fetcher: None,
            cache_ttl_ms: None,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Unique id of this engine handle, used as its identity on the rails
    /// and in the leader queue.
    pub fn process_id(&self) -> &str {
        &self.process_id
    }

    pub fn is_leader(&self) -> bool {
        self.leader
    }

    pub fn tables(&self) -> &Tables {
        self.store.data()
    }

    /// Envelopes accepted by this handle, in commit order.
    pub fn events(&self) -> &[EventEnvelope] {
        &self.events
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Validates and materializes a batch in array order. Each event is
    /// fully applied before the next begins, so later materializers see rows
    /// written by earlier ones. On failure the already-applied prefix stays
    /// committed (and persisted/forwarded); the offending event's error is
    /// raised without processing anything after it.
    #[instrument(skip(self, raws), fields(instance = %self.instance_id, count = raws.len()))]
    pub fn commit(&mut self, raws: Vec<RawEvent>) -> SyncResult<Vec<EventEnvelope>> {
        if self.destroyed {
            return Err(SyncError::NotReady);
        }

        let mut applied: Vec<AppliedEvent> = Vec::new();
        let mut failure: Option<SyncError> = None;
        for raw in &raws {
            match apply_event(&self.registry, self.store.as_mut(), raw) {
                Ok(done) => applied.push(done),
                Err(error) => {
                    failure = Some(error);
                    break;
                }
            }
        }

        let envelopes: Vec<EventEnvelope> =
            applied.iter().map(|done| done.envelope.clone()).collect();
        self.events.extend(envelopes.iter().cloned());

        if self.leader {
            self.persist_applied(&applied)?;
        } else {
            self.forward_envelopes(&envelopes);
        }
        debug!(committed = envelopes.len(), leader = self.leader, "commit finished");

        match failure {
            Some(error) => Err(error),
            None => Ok(envelopes),
        }
    }

    /// Cooperatively drains both rails and observes leadership grants.
    /// Messages published while this call runs are picked up by the next
    /// one.
    pub fn pump(&mut self) -> SyncResult<()> {
        if self.destroyed {
            return Ok(());
        }
        self.refresh_leadership();

        let mut sync_messages = Vec::new();
        if let Some(rail) = &self.sync_rail {
            while let Some(message) = rail.try_next() {
                sync_messages.push(message);
            }
        }
        for message in sync_messages {
            match SyncMessage::parse(message) {
                Some(SyncMessage::Mutation { envelope, .. }) => {
                    // Own forwards matter too: a follower promoted mid-flight
                    // must persist the mutation it forwarded while the old
                    // leader was still in charge.
                    if self.leader {
                        self.absorb_forwarded(envelope)?;
                    }
                }
                Some(SyncMessage::Leader { source, leader }) => {
                    if leader {
                        self.last_known_leader = Some(source);
                    } else if self.last_known_leader.as_deref() == Some(source.as_str()) {
                        self.last_known_leader = None;
                    }
                }
                None => warn!("dropping malformed sync-rail message"),
            }
        }

        let mut notices = Vec::new();
        if let Some(rail) = &self.rescan_rail {
            while let Some(message) = rail.try_next() {
                notices.push(message);
            }
        }
        for message in notices {
            match RescanNotice::parse(message) {
                Some(notice) => self.rescan(&notice.key)?,
                None => warn!("dropping malformed rescan notice"),
            }
        }
        Ok(())
    }

    /// Re-reads one durable record key and upserts the row into the local
    /// table store. This is the cross-process reconciliation step: the last
    /// value to durably land wins everywhere.
    pub fn rescan(&mut self, key: &str) -> SyncResult<()> {
        let Some(stored) = self.storage.get_data(key)? else {
            return Ok(());
        };
        let Some((table, _)) = split_record_key(key) else {
            warn!(key, "ignoring rescan notice with malformed key");
            return Ok(());
        };
        let validated = match self.schemas.get(table) {
            Some(schema) => schema.validate(&stored),
            None => {
                warn!(table, "ignoring rescan for undeclared table");
                return Ok(());
            }
        };
        match validated {
            Ok(row) => self.store.upsert(table, row),
            Err(error) => {
                warn!(key, %error, "dropping rescanned row that fails validation");
                Ok(())
            }
        }
    }

    /// Cached remote query, layered as: in-memory cache, durable
    /// `query_cache` store, remote fetch.
    pub fn query(&mut self, path: &str) -> SyncResult<SyncResponse> {
        self.query_at(path, now_millis())
    }

    #[instrument(skip(self), fields(instance = %self.instance_id))]
    pub fn query_at(&mut self, path: &str, now: Millis) -> SyncResult<SyncResponse> {
        if self.destroyed {
            return Err(SyncError::NotReady);
        }
        let key = ["query", path];
        if let Some(cached) = self.cache.get(&key, now) {
            debug!(path, "query served from memory");
            return Ok(cached.clone());
        }

        if let Some(stored) = self.storage.get_query(path)? {
            // Values written under an old schema fail closed here.
            let validated = self.validate_response(&stored.value)?;
            self.cache.set(&key, validated.clone(), stored.updated_at);
            debug!(path, "query served from durable cache");
            return Ok(validated);
        }

        let fetcher = self.fetcher.as_ref().ok_or_else(|| SyncError::QueryFetch {
            path: path.to_string(),
            status: 0,
        })?;
        let body = fetcher.fetch(path)?;
        let validated = self.validate_response(&body)?;
        self.cache.set(&key, validated.clone(), now);
        self.storage.put_query(
            path,
            &StoredQuery {
                value: body,
                updated_at: now,
            },
        )?;
        self.broadcast_snapshot_keys(&validated);
        debug!(path, "query fetched remotely");
        Ok(validated)
    }

    /// Releases leadership, leaves both rails and marks the engine
    /// not-ready. Idempotent.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        if self.leader {
            self.leader = false;
            self.announce_leadership(false);
        }
        self.lock.release(&self.instance_id, &self.process_id);
        self.sync_rail = None;
        self.rescan_rail = None;
        info!(instance = %self.instance_id, process = %self.process_id, "engine destroyed");
    }

    fn refresh_leadership(&mut self) {
        let held = self.lock.is_held(&self.instance_id, &self.process_id);
        if held != self.leader {
            self.leader = held;
            info!(
                instance = %self.instance_id,
                process = %self.process_id,
                leader = held,
                "leadership changed"
            );
            self.announce_leadership(held);
        }
    }

    fn announce_leadership(&self, leader: bool) {
        let message = SyncMessage::Leader {
            source: self.process_id.clone(),
            leader,
        };
        if let Some(value) = message.to_value() {
            self.bus.publish(&self.instance_id, Topic::Sync, value);
        }
    }

    /// Leader path of the mutation rail: re-validate the forwarded envelope
    /// by replaying it through the normal application path, persist it, and
    /// re-broadcast rescans. Invalid envelopes are dropped, never fatal.
    /// Replay is idempotent (create no-ops, update re-merges), so a handle
    /// absorbing a mutation it forwarded itself before promotion is safe.
    fn absorb_forwarded(&mut self, envelope: EventEnvelope) -> SyncResult<()> {
        let raw = envelope.to_raw();
        let applied = match apply_event(&self.registry, self.store.as_mut(), &raw) {
            Ok(done) => done,
            Err(error) => {
                warn!(id = %raw.id, %error, "dropping invalid forwarded mutation");
                return Ok(());
            }
        };
        debug!(id = %applied.envelope.id, "absorbed forwarded mutation");
        // Own forwards are already in the event list from their commit.
        if !self.events.iter().any(|known| known.id == applied.envelope.id) {
            self.events.push(applied.envelope.clone());
        }
        self.persist_applied(std::slice::from_ref(&applied))
    }

    fn persist_applied(&mut self, applied: &[AppliedEvent]) -> SyncResult<()> {
        let mut writes = Vec::new();
        for done in applied {
            for action in &done.actions {
                let Some(key) = action.record_key() else {
                    continue;
                };
                match action {
                    MaterializerAction::Create { value, .. } => {
                        writes.push(RowWrite::Create {
                            key,
                            value: value.clone(),
                        });
                    }
                    MaterializerAction::Update { value, .. } => {
                        let fallback = action
                            .row_id()
                            .and_then(|id| self.current_row(action.table(), id));
                        writes.push(RowWrite::Update {
                            key,
                            patch: value.clone(),
                            fallback,
                        });
                    }
                }
            }
        }
        let envelopes: Vec<EventEnvelope> =
            applied.iter().map(|done| done.envelope.clone()).collect();
        let touched = self.storage.persist_commit(&writes, &envelopes)?;
        for key in &touched {
            self.broadcast_rescan(key);
        }
        Ok(())
    }

    fn current_row(&self, table: &str, id: &str) -> Option<Value> {
        self.store
            .data()
            .get(table)
            .and_then(|rows| {
                rows.iter()
                    .find(|row| row.get("id").and_then(Value::as_str) == Some(id))
            })
            .cloned()
    }

    fn forward_envelopes(&self, envelopes: &[EventEnvelope]) {
        for envelope in envelopes {
            let message = SyncMessage::Mutation {
                source: self.process_id.clone(),
                envelope: envelope.clone(),
            };
            if let Some(value) = message.to_value() {
                self.bus.publish(&self.instance_id, Topic::Sync, value);
            }
        }
    }

    fn broadcast_rescan(&self, key: &str) {
        let notice = RescanNotice {
            key: key.to_string(),
        };
        if let Some(value) = notice.to_value() {
            self.bus.publish(&self.instance_id, Topic::Rescan, value);
        }
    }

    /// Announces the row ids of a fetched snapshot for cross-process cache
    /// coherence. Receivers that find no durable row simply ignore the
    /// notice.
    fn broadcast_snapshot_keys(&self, response: &SyncResponse) {
        let SyncResponse::Snapshot { data } = response else {
            return;
        };
        for (table, rows) in data {
            for row in rows {
                if let Some(id) = row.get("id").and_then(Value::as_str) {
                    self.broadcast_rescan(&crate::engine::types::record_key(table, id));
                }
            }
        }
    }

    fn validate_response(&self, value: &Value) -> SyncResult<SyncResponse> {
        let response: SyncResponse = serde_json::from_value(value.clone()).map_err(|error| {
            ValidationError::single("", format!("malformed sync response: {error}"))
        })?;
        match &response {
            SyncResponse::Snapshot { data } => {
                for (table, rows) in data {
                    let schema = self
                        .schemas
                        .get(table.as_str())
                        .ok_or_else(|| SyncError::UnknownTable(table.to_string()))?;
                    for row in rows {
                        schema.validate(row)?;
                    }
                }
            }
            SyncResponse::Actions { data } => {
                for action in data {
                    let schema = self
                        .schemas
                        .get(action.table().as_str())
                        .ok_or_else(|| SyncError::UnknownTable(action.table().to_string()))?;
                    match action {
                        MaterializerAction::Create { value, .. } => {
                            schema.validate(value)?;
                        }
                        MaterializerAction::Update { value, .. } => {
                            schema.validate_partial(value)?;
                        }
                    }
                }
            }
        }
        Ok(response)
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        // Release-on-process-exit analog: a dropped handle must not keep
        // the leader lock.
        self.destroy();
    }
}
