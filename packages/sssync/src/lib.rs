//! Local-first embedded data engine: validated events materialize into
//! typed in-memory tables, a single leader process persists rows and the
//! mutation log, and sibling processes converge through forwarded
//! mutations and rescan notices.

pub mod cache;
pub mod coord;
pub mod engine;
pub mod error;
pub mod fetch;
pub mod persist;
pub mod schema;

// Re-export commonly used types for convenience
pub use cache::{QueryCache, QueryResult};
pub use coord::local::{LocalBus, LocalLock};
pub use coord::{LeaderLock, MessageBus, RescanNotice, Subscription, SyncMessage, Topic};
pub use engine::apply::{apply_event, AppliedEvent, EventRegistry};
pub use engine::sync::{SyncBuilder, SyncEngine};
pub use engine::tables::{DefaultTableStore, TableStore};
pub use engine::types::{
    record_key, shallow_merge, split_record_key, EventDefinition, EventEnvelope, FastMap,
    MaterializerAction, MaterializerContext, Millis, RawEvent, SyncResponse, TableName, Tables,
};
pub use error::{SyncError, SyncResult};
pub use fetch::RemoteFetcher;
pub use persist::{InstanceMeta, RowWrite, Storage, StoredQuery};
pub use schema::{FieldIssue, FieldKind, Schema, ValidationError};
