//! Error taxonomy for the engine.
//!
//! Everything a caller of `commit`/`query` can observe is a variant here.
//! Malformed cross-process messages are deliberately *not* represented: the
//! channel is untrusted and lossy, so they are dropped where they arrive.

use thiserror::Error;

use crate::schema::ValidationError;

pub type SyncResult<T> = std::result::Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    /// The event name is not registered with the engine.
    #[error("unknown event: {0}")]
    UnknownEvent(String),

    /// A payload or row failed its schema, with field-level detail.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The event is registered but has no materializer.
    #[error("missing materializer for event: {0}")]
    MissingMaterializer(String),

    /// A materializer referenced an undeclared table. Programming error.
    #[error("unknown table: {0}")]
    UnknownTable(String),

    /// Operation invoked after `destroy` (or before the engine was opened).
    #[error("engine is not ready")]
    NotReady,

    /// Remote fetch returned a non-2xx status. Status 0 means no fetcher
    /// was configured, mirroring a network-level failure.
    #[error("query fetch failed: {path} (status {status})")]
    QueryFetch { path: String, status: u16 },

    /// Durable store failure. Not retried internally; the in-memory table
    /// mutation that preceded it is not rolled back.
    #[error("storage error: {0}")]
    Storage(#[from] redb::Error),

    /// A stored value could not be encoded or decoded.
    #[error("stored value codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// The engine was assembled with missing or inconsistent parts.
    #[error("configuration error: {0}")]
    Config(String),
}
