//! In-memory TTL query cache.
//!
//! Keys are ordered tuples joined into a single string. Expiry is lazy: an
//! entry older than the TTL is evicted by the `get` that observes it, there
//! is no background sweep.

use rustc_hash::FxHashMap;

use crate::engine::types::Millis;
use crate::schema::ValidationError;

/// A cached value with its write timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult<V> {
    pub value: V,
    pub updated_at: Millis,
}

#[derive(Debug)]
pub struct QueryCache<V> {
    entries: FxHashMap<String, QueryResult<V>>,
    ttl_ms: Option<u64>,
}

impl<V> Default for QueryCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> QueryCache<V> {
    /// Cache whose entries never expire.
    pub fn new() -> Self {
        Self {
            entries: FxHashMap::default(),
            ttl_ms: None,
        }
    }

    pub fn with_ttl(ttl_ms: u64) -> Self {
        Self {
            entries: FxHashMap::default(),
            ttl_ms: Some(ttl_ms),
        }
    }

    fn join(key: &[&str]) -> String {
        key.join("|")
    }

    fn expired(&self, entry: &QueryResult<V>, now: Millis) -> bool {
        match self.ttl_ms {
            Some(ttl) => now.saturating_sub(entry.updated_at) > ttl,
            None => false,
        }
    }

    pub fn get(&mut self, key: &[&str], now: Millis) -> Option<&V> {
        let joined = Self::join(key);
        match self.entries.get(&joined) {
            Some(entry) if self.expired(entry, now) => {
                self.entries.remove(&joined);
                None
            }
            Some(_) => self.entries.get(&joined).map(|entry| &entry.value),
            None => None,
        }
    }

    pub fn set(&mut self, key: &[&str], value: V, now: Millis) {
        self.entries.insert(
            Self::join(key),
            QueryResult {
                value,
                updated_at: now,
            },
        );
    }

    /// Validated insert: the value is checked before it is trusted, so a
    /// value written under an old schema fails closed instead of landing in
    /// the cache.
    pub fn set_validated<F>(
        &mut self,
        key: &[&str],
        value: V,
        check: F,
        now: Millis,
    ) -> Result<(), ValidationError>
    where
        F: FnOnce(&V) -> Result<(), ValidationError>,
    {
        check(&value)?;
        self.set(key, value, now);
        Ok(())
    }

    pub fn invalidate(&mut self, key: &[&str]) {
        self.entries.remove(&Self::join(key));
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
