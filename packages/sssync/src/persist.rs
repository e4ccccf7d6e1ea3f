//! Durable persistence: four logical stores in one redb database.
//!
//! `data` holds the most recently merged value per record key and is the
//! source of truth for reload and rescans. `mutation_log` is the append-only
//! audit trail (never replayed into tables). `query_cache` mirrors the
//! in-memory query cache. `meta` holds the single instance row whose
//! presence marks a completed initialization.
//!
//! A `Storage` handle is cheaply cloneable; every engine handle of one
//! instance id shares the same underlying database.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::engine::types::{record_key, shallow_merge, EventEnvelope, Millis};
use crate::error::{SyncError, SyncResult};

const DATA: TableDefinition<&str, &[u8]> = TableDefinition::new("data");
const MUTATION_LOG: TableDefinition<&str, &[u8]> = TableDefinition::new("mutation_log");
const QUERY_CACHE: TableDefinition<&str, &[u8]> = TableDefinition::new("query_cache");
const META: TableDefinition<&str, &[u8]> = TableDefinition::new("meta");

const META_INSTANCE_KEY: &str = "instance";

fn store_err(err: impl Into<redb::Error>) -> SyncError {
    SyncError::Storage(err.into())
}

/// The single `meta` row, written once on first open.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceMeta {
    pub id: String,
    pub created_at: Millis,
}

/// Durable mirror of one query-cache entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredQuery {
    pub value: Value,
    pub updated_at: Millis,
}

/// One row write inside a commit's persistence step.
#[derive(Debug, Clone)]
pub enum RowWrite {
    /// Full row for a create action.
    Create { key: String, value: Value },
    /// Partial row for an update action. The stored value is re-read inside
    /// the transaction so the persisted merge matches in-memory semantics
    /// even if a sibling process wrote the row in between; `fallback` is the
    /// committing process's in-memory row for when nothing is stored yet.
    Update {
        key: String,
        patch: Value,
        fallback: Option<Value>,
    },
}

#[derive(Clone)]
pub struct Storage {
    db: Arc<Database>,
}

impl Storage {
    /// Opens (or creates) the database file and its four stores, and writes
    /// the instance meta row if this is the first open.
    pub fn open(path: impl AsRef<Path>, instance_id: &str, now: Millis) -> SyncResult<Self> {
        let db = Database::create(path).map_err(store_err)?;
        let storage = Self { db: Arc::new(db) };
        storage.initialize(instance_id, now)?;
        Ok(storage)
    }

    fn initialize(&self, instance_id: &str, now: Millis) -> SyncResult<()> {
        let tx = self.db.begin_write().map_err(store_err)?;
        {
            let _ = tx.open_table(DATA).map_err(store_err)?;
            let _ = tx.open_table(MUTATION_LOG).map_err(store_err)?;
            let _ = tx.open_table(QUERY_CACHE).map_err(store_err)?;
            let mut meta = tx.open_table(META).map_err(store_err)?;
            let exists = meta
                .get(META_INSTANCE_KEY)
                .map_err(store_err)?
                .is_some();
            if !exists {
                let row = InstanceMeta {
                    id: instance_id.to_string(),
                    created_at: now,
                };
                let bytes = serde_json::to_vec(&row)?;
                meta.insert(META_INSTANCE_KEY, bytes.as_slice())
                    .map_err(store_err)?;
            }
        }
        tx.commit().map_err(store_err)?;
        Ok(())
    }

    pub fn instance_meta(&self) -> SyncResult<Option<InstanceMeta>> {
        let tx = self.db.begin_read().map_err(store_err)?;
        let meta = tx.open_table(META).map_err(store_err)?;
        let Some(guard) = meta.get(META_INSTANCE_KEY).map_err(store_err)? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_slice(guard.value())?))
    }

    /// Every stored `(record key, row)` pair, for the initial table load.
    /// Undecodable values are skipped, not fatal.
    pub fn load_data(&self) -> SyncResult<Vec<(String, Value)>> {
        let tx = self.db.begin_read().map_err(store_err)?;
        let data = tx.open_table(DATA).map_err(store_err)?;
        let mut rows = Vec::new();
        for entry in data.iter().map_err(store_err)? {
            let (key, value) = entry.map_err(store_err)?;
            match serde_json::from_slice(value.value()) {
                Ok(row) => rows.push((key.value().to_string(), row)),
                Err(error) => {
                    warn!(key = key.value(), %error, "skipping undecodable stored row");
                }
            }
        }
        Ok(rows)
    }

    pub fn get_data(&self, key: &str) -> SyncResult<Option<Value>> {
        let tx = self.db.begin_read().map_err(store_err)?;
        let data = tx.open_table(DATA).map_err(store_err)?;
        let Some(guard) = data.get(key).map_err(store_err)? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_slice(guard.value())?))
    }

    /// All rows of one table, by key prefix. Export-only surface for
    /// diagnostics and embedding layers; the engine itself loads the full
    /// set and rescans single keys.
    pub fn scan_data_prefix(&self, table: &str) -> SyncResult<Vec<(String, Value)>> {
        let start = record_key(table, "");
        let end = format!("{start}\u{10ffff}");
        let tx = self.db.begin_read().map_err(store_err)?;
        let data = tx.open_table(DATA).map_err(store_err)?;
        let mut rows = Vec::new();
        for entry in data
            .range(start.as_str()..end.as_str())
            .map_err(store_err)?
        {
            let (key, value) = entry.map_err(store_err)?;
            rows.push((
                key.value().to_string(),
                serde_json::from_slice(value.value())?,
            ));
        }
        Ok(rows)
    }

    /// Persists one commit: row writes plus mutation-log appends, inside a
    /// single read-write transaction so no partial write is observable.
    /// Returns the keys that actually changed, in write order.
    pub fn persist_commit(
        &self,
        writes: &[RowWrite],
        envelopes: &[EventEnvelope],
    ) -> SyncResult<Vec<String>> {
        if writes.is_empty() && envelopes.is_empty() {
            return Ok(Vec::new());
        }

        let mut touched: Vec<String> = Vec::new();
        let tx = self.db.begin_write().map_err(store_err)?;
        {
            let mut data = tx.open_table(DATA).map_err(store_err)?;
            for write in writes {
                let (key, merged) = match write {
                    RowWrite::Create { key, value } => (key, value.clone()),
                    RowWrite::Update {
                        key,
                        patch,
                        fallback,
                    } => {
                        let stored: Option<Value> = data
                            .get(key.as_str())
                            .map_err(store_err)?
                            .and_then(|guard| serde_json::from_slice(guard.value()).ok());
                        let Some(base) = stored.or_else(|| fallback.clone()) else {
                            // Nothing to merge onto anywhere: the update was
                            // a no-op in memory too.
                            continue;
                        };
                        (key, shallow_merge(&base, patch))
                    }
                };
                let bytes = serde_json::to_vec(&merged)?;
                data.insert(key.as_str(), bytes.as_slice())
                    .map_err(store_err)?;
                if !touched.contains(key) {
                    touched.push(key.clone());
                }
            }

            let mut log = tx.open_table(MUTATION_LOG).map_err(store_err)?;
            for envelope in envelopes {
                let bytes = serde_json::to_vec(envelope)?;
                log.insert(envelope.id.as_str(), bytes.as_slice())
                    .map_err(store_err)?;
            }
        }
        tx.commit().map_err(store_err)?;
        Ok(touched)
    }

    pub fn get_query(&self, path: &str) -> SyncResult<Option<StoredQuery>> {
        let tx = self.db.begin_read().map_err(store_err)?;
        let cache = tx.open_table(QUERY_CACHE).map_err(store_err)?;
        let Some(guard) = cache.get(path).map_err(store_err)? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_slice(guard.value())?))
    }

    pub fn put_query(&self, path: &str, entry: &StoredQuery) -> SyncResult<()> {
        let tx = self.db.begin_write().map_err(store_err)?;
        {
            let mut cache = tx.open_table(QUERY_CACHE).map_err(store_err)?;
            let bytes = serde_json::to_vec(entry)?;
            cache.insert(path, bytes.as_slice()).map_err(store_err)?;
        }
        tx.commit().map_err(store_err)?;
        Ok(())
    }

    /// Full mutation-log export, ordered by envelope id. Diagnostics only;
    /// tables are rebuilt from `data`, never from the log.
    pub fn mutation_log(&self) -> SyncResult<Vec<EventEnvelope>> {
        let tx = self.db.begin_read().map_err(store_err)?;
        let log = tx.open_table(MUTATION_LOG).map_err(store_err)?;
        let mut envelopes = Vec::new();
        for entry in log.iter().map_err(store_err)? {
            let (_, value) = entry.map_err(store_err)?;
            envelopes.push(serde_json::from_slice(value.value())?);
        }
        Ok(envelopes)
    }

    /// Whole-store reset of rows, log and cached queries. The meta row
    /// survives.
    pub fn clear(&self) -> SyncResult<()> {
        let tx = self.db.begin_write().map_err(store_err)?;
        for definition in [DATA, MUTATION_LOG, QUERY_CACHE] {
            tx.delete_table(definition).map_err(store_err)?;
            let _ = tx.open_table(definition).map_err(store_err)?;
        }
        tx.commit().map_err(store_err)?;
        Ok(())
    }
}
