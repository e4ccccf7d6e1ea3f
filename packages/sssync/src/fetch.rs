//! Remote snapshot boundary.

use serde_json::Value;

use crate::error::SyncResult;

/// Issues the plain GET behind `query`. Implementations live at the
/// application edge (HTTP client, test double); the engine only consumes
/// the trait. A non-2xx response must surface as
/// [`SyncError::QueryFetch`](crate::error::SyncError::QueryFetch), a 2xx
/// body is returned as parsed JSON.
pub trait RemoteFetcher: Send + Sync {
    fn fetch(&self, path: &str) -> SyncResult<Value>;
}
