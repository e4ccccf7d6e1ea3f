//! Core data model: event definitions, envelopes, materializer actions,
//! record keys and the remote response shape.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use smallvec::SmallVec;
use smol_str::SmolStr;

use crate::schema::Schema;

/// Milliseconds since the Unix epoch.
pub type Millis = u64;

/// Optimized string type for table names.
pub type TableName = SmolStr;

/// Fast non-cryptographic hash map used throughout the engine.
pub type FastMap<K, V> = rustc_hash::FxHashMap<K, V>;

/// Materialized tables as exposed to materializers and the UI layer.
/// Iteration order is declaration order; rows keep insertion order.
pub type Tables = IndexMap<TableName, Vec<Value>>;

/// Inline storage for the durable keys touched by one event (usually few).
pub type KeyList = SmallVec<[String; 4]>;

/// Derives a deduplication key from an event name and validated payload.
/// Declared on definitions, enforced by callers, never by the engine.
pub type DedupeFn = fn(name: &str, payload: &Value) -> String;

/// Immutable declaration of an event: its name and payload schema.
pub struct EventDefinition {
    pub name: SmolStr,
    pub schema: Schema,
    pub dedupe: Option<DedupeFn>,
}

impl EventDefinition {
    pub fn new(name: impl Into<SmolStr>, schema: Schema) -> Self {
        Self {
            name: name.into(),
            schema,
            dedupe: None,
        }
    }

    pub fn with_dedupe(mut self, dedupe: DedupeFn) -> Self {
        self.dedupe = Some(dedupe);
        self
    }

    pub fn dedupe_key(&self, payload: &Value) -> Option<String> {
        self.dedupe.map(|derive| derive(&self.name, payload))
    }
}

/// A caller-submitted event before validation. Consumed exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawEvent {
    pub id: String,
    pub name: SmolStr,
    pub payload: Value,
    pub timestamp: Millis,
}

impl RawEvent {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<SmolStr>,
        payload: Value,
        timestamp: Millis,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            payload,
            timestamp,
        }
    }
}

/// The validated, immutable record of an applied event. Appended to the
/// in-process event list and the durable mutation log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub id: String,
    pub name: SmolStr,
    pub payload: Value,
    pub timestamp: Millis,
}

impl EventEnvelope {
    /// Rebuilds the raw event this envelope was accepted from, for replay
    /// of forwarded mutations through the normal application path.
    pub fn to_raw(&self) -> RawEvent {
        RawEvent {
            id: self.id.clone(),
            name: self.name.clone(),
            payload: self.payload.clone(),
            timestamp: self.timestamp,
        }
    }
}

/// One table action produced by a materializer. The serde shape doubles as
/// the wire format of `SyncResponse::Actions`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MaterializerAction {
    Create {
        #[serde(rename = "tableName")]
        table: TableName,
        value: Value,
    },
    Update {
        #[serde(rename = "tableName")]
        table: TableName,
        value: Value,
    },
}

impl MaterializerAction {
    pub fn create(table: impl Into<TableName>, value: Value) -> Self {
        Self::Create {
            table: table.into(),
            value,
        }
    }

    pub fn update(table: impl Into<TableName>, value: Value) -> Self {
        Self::Update {
            table: table.into(),
            value,
        }
    }

    pub fn table(&self) -> &TableName {
        match self {
            Self::Create { table, .. } | Self::Update { table, .. } => table,
        }
    }

    pub fn value(&self) -> &Value {
        match self {
            Self::Create { value, .. } | Self::Update { value, .. } => value,
        }
    }

    pub fn row_id(&self) -> Option<&str> {
        self.value().get("id").and_then(Value::as_str)
    }

    /// Durable record key touched by this action, when the value carries an
    /// id.
    pub fn record_key(&self) -> Option<String> {
        self.row_id().map(|id| record_key(self.table(), id))
    }
}

/// The durable addressing scheme: `"{table}/{id}"`. Derived only from the
/// row's identity, never from insertion order, so replay is idempotent.
pub fn record_key(table: &str, id: &str) -> String {
    format!("{table}/{id}")
}

pub fn split_record_key(key: &str) -> Option<(&str, &str)> {
    key.split_once('/')
}

/// Shallow object merge: fields of `patch` overwrite fields of `base`.
/// Non-object inputs fall back to the patch.
pub fn shallow_merge(base: &Value, patch: &Value) -> Value {
    match (base.as_object(), patch.as_object()) {
        (Some(base), Some(patch)) => {
            let mut merged = base.clone();
            for (key, value) in patch {
                merged.insert(key.clone(), value.clone());
            }
            Value::Object(merged)
        }
        _ => patch.clone(),
    }
}

/// Body shape of a remote query response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum SyncResponse {
    Snapshot { data: IndexMap<TableName, Vec<Value>> },
    Actions { data: Vec<MaterializerAction> },
}

/// Read-only view handed to a materializer alongside the validated payload.
pub struct MaterializerContext<'a> {
    pub tables: &'a Tables,
    pub event: &'a EventEnvelope,
}

/// Pure function from a validated payload (+ read-only tables) to an ordered
/// list of actions. Must be deterministic: it can run once locally and again
/// during replay or on another process.
pub type Materializer =
    Box<dyn Fn(&Value, &MaterializerContext<'_>) -> Vec<MaterializerAction> + Send + Sync>;
