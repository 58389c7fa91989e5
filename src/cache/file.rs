//! File-backed verdict cache.
//!
//! Persists the whole cache as one versioned JSON document under the platform
//! data directory:
//! - Linux: `~/.local/share/kiosk/entitlements.json`
//! - macOS: `~/Library/Application Support/kiosk/entitlements.json`
//! - Windows: `%APPDATA%\kiosk\entitlements.json`
//!
//! The document is small (one entry per identity seen on this device), so each
//! write rewrites it in full. A parse failure on load is treated as an empty
//! cache rather than an error: a corrupt cache must never block reconciliation.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::{CacheEntry, CacheError, VerdictCache};
use crate::identity::Identity;
use crate::verdict::now_ms;

const CACHE_FORMAT_VERSION: u32 = 1;

/// On-disk document format.
#[derive(Debug, Serialize, Deserialize)]
struct CacheDocument {
    /// Format version for migration support.
    version: u32,
    /// Entries keyed by `Identity::cache_key()`.
    entries: HashMap<String, CacheEntry>,
    /// Unix ms of the last write.
    last_saved: u64,
}

impl Default for CacheDocument {
    fn default() -> Self {
        Self {
            version: CACHE_FORMAT_VERSION,
            entries: HashMap::new(),
            last_saved: 0,
        }
    }
}

/// Verdict cache persisted to a JSON file.
pub struct FileCache {
    path: PathBuf,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl FileCache {
    /// Default cache file path under the platform data directory.
    pub fn default_path() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("kiosk")
            .join("entitlements.json")
    }

    /// Open the cache at the default path.
    pub fn open() -> Self {
        Self::open_at(Self::default_path())
    }

    /// Open the cache at a specific path, loading any existing document.
    pub fn open_at(path: PathBuf) -> Self {
        let entries = Self::load_document(&path);
        Self {
            path,
            entries: Mutex::new(entries),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Snapshot of every cached entry, keyed by identity cache key.
    ///
    /// Diagnostic surface for the CLI; the engine itself only ever reads
    /// per-identity.
    pub fn entries(&self) -> Vec<(String, CacheEntry)> {
        let mut entries: Vec<(String, CacheEntry)> = self
            .entries
            .lock()
            .iter()
            .map(|(key, entry)| (key.clone(), entry.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    fn load_document(path: &Path) -> HashMap<String, CacheEntry> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(_) => {
                tracing::debug!("No verdict cache at {:?}, starting empty", path);
                return HashMap::new();
            }
        };

        match serde_json::from_str::<CacheDocument>(&content) {
            Ok(doc) if doc.version == CACHE_FORMAT_VERSION => doc.entries,
            Ok(doc) => {
                tracing::warn!(
                    "Verdict cache version {} unsupported (expected {}), discarding",
                    doc.version,
                    CACHE_FORMAT_VERSION
                );
                HashMap::new()
            }
            Err(e) => {
                tracing::warn!("Failed to parse verdict cache at {:?}: {}", path, e);
                HashMap::new()
            }
        }
    }

    fn flush(&self, entries: &HashMap<String, CacheEntry>) -> Result<(), CacheError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CacheError::Io(e.to_string()))?;
        }

        let doc = CacheDocument {
            version: CACHE_FORMAT_VERSION,
            entries: entries.clone(),
            last_saved: now_ms(),
        };
        let content =
            serde_json::to_string_pretty(&doc).map_err(|e| CacheError::Serialization(e.to_string()))?;
        std::fs::write(&self.path, content).map_err(|e| CacheError::Io(e.to_string()))?;

        tracing::debug!("Flushed {} verdict cache entries to {:?}", entries.len(), self.path);
        Ok(())
    }
}

impl VerdictCache for FileCache {
    fn get(&self, identity: &Identity) -> Result<Option<CacheEntry>, CacheError> {
        Ok(self.entries.lock().get(&identity.cache_key()).cloned())
    }

    fn put(&self, identity: &Identity, entry: CacheEntry) -> Result<(), CacheError> {
        let mut entries = self.entries.lock();
        entries.insert(identity.cache_key(), entry);
        self.flush(&entries)
    }

    fn remove(&self, identity: &Identity) -> Result<(), CacheError> {
        let mut entries = self.entries.lock();
        if entries.remove(&identity.cache_key()).is_some() {
            self.flush(&entries)?;
        }
        Ok(())
    }

    fn clear(&self) -> Result<(), CacheError> {
        let mut entries = self.entries.lock();
        entries.clear();
        self.flush(&entries)
    }
}
