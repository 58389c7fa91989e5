//! Local entitlement cache.
//!
//! Persisted key-value record of the last known entitlement verdict per
//! identity, plus the timestamp it was stored at. The cache stores; the
//! reconciliation engine judges freshness. Writes are last-write-wins per
//! identity key and always replace the whole entry, never individual fields.

mod file;

pub use file::FileCache;

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::identity::Identity;
use crate::verdict::EntitlementVerdict;

/// One cached verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub verdict: EntitlementVerdict,
    /// Unix ms at which the verdict was written to the cache.
    pub stored_at: u64,
}

impl CacheEntry {
    pub fn new(verdict: EntitlementVerdict, stored_at: u64) -> Self {
        Self { verdict, stored_at }
    }

    /// Entry age relative to `now`, in milliseconds.
    pub fn age_ms(&self, now: u64) -> u64 {
        now.saturating_sub(self.stored_at)
    }
}

/// Cache backend errors.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(String),
}

/// Storage backend for cached verdicts.
///
/// Read by the engine on every resolve; written only by the engine. Backends
/// must be cheap to call: both implementations here are in-memory maps, the
/// file-backed one flushing to disk on write.
pub trait VerdictCache: Send + Sync {
    fn get(&self, identity: &Identity) -> Result<Option<CacheEntry>, CacheError>;

    fn put(&self, identity: &Identity, entry: CacheEntry) -> Result<(), CacheError>;

    fn remove(&self, identity: &Identity) -> Result<(), CacheError>;

    /// Drop every entry (sign-out).
    fn clear(&self) -> Result<(), CacheError>;
}

/// In-memory cache for tests and ephemeral (no-persistence) mode.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl VerdictCache for MemoryCache {
    fn get(&self, identity: &Identity) -> Result<Option<CacheEntry>, CacheError> {
        Ok(self.entries.lock().get(&identity.cache_key()).cloned())
    }

    fn put(&self, identity: &Identity, entry: CacheEntry) -> Result<(), CacheError> {
        self.entries.lock().insert(identity.cache_key(), entry);
        Ok(())
    }

    fn remove(&self, identity: &Identity) -> Result<(), CacheError> {
        self.entries.lock().remove(&identity.cache_key());
        Ok(())
    }

    fn clear(&self) -> Result<(), CacheError> {
        self.entries.lock().clear();
        Ok(())
    }
}
