//! RetryBackend trait — pluggable storage for the retry log
//!
//! The retry log is a single JSON array read fully and rewritten fully on
//! every mutation; backends only need to hold one value under one key:
//! - `SledBackend`: durable, survives restarts
//! - `InMemoryBackend`: tests and ephemeral deployments

use super::{RetryEntry, StoreError};
use std::path::Path;
use std::sync::RwLock;
use tracing::{debug, error, info};

/// Trait for pluggable retry-log backends
///
/// Implementations must be thread-safe (Send + Sync) for shared access
/// across async tasks.
pub trait RetryBackend: Send + Sync {
    /// Read the full persisted list, oldest first.
    fn load(&self) -> Result<Vec<RetryEntry>, StoreError>;

    /// Replace the persisted list.
    fn save(&self, entries: &[RetryEntry]) -> Result<(), StoreError>;

    /// Backend name for logging
    fn backend_name(&self) -> &'static str;
}

/// Durable backend: one sled key holding the JSON array.
pub struct SledBackend {
    db: sled::Db,
    key: String,
}

impl SledBackend {
    /// Open or create the store database at `path`.
    pub fn open<P: AsRef<Path>>(path: P, key: &str) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let db = sled::open(path).map_err(|e| StoreError::Storage(e.to_string()))?;
        info!(path = %path.display(), "Retry store opened");
        Ok(Self {
            db,
            key: key.to_string(),
        })
    }
}

impl RetryBackend for SledBackend {
    fn load(&self) -> Result<Vec<RetryEntry>, StoreError> {
        let Some(raw) = self
            .db
            .get(&self.key)
            .map_err(|e| StoreError::Storage(e.to_string()))?
        else {
            return Ok(Vec::new());
        };

        match serde_json::from_slice(&raw) {
            Ok(entries) => Ok(entries),
            Err(e) => {
                // A corrupt log must not wedge startup; start over empty.
                error!(error = %e, bytes = raw.len(), "Corrupted retry log, discarding");
                Ok(Vec::new())
            }
        }
    }

    fn save(&self, entries: &[RetryEntry]) -> Result<(), StoreError> {
        let json = serde_json::to_vec(entries).map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.db
            .insert(self.key.as_bytes(), json)
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        self.db
            .flush()
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        debug!(entries = entries.len(), "Retry log written");
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "sled"
    }
}

/// In-memory backend for testing and minimal deployments
///
/// Not durable — data lost on restart.
#[derive(Default)]
pub struct InMemoryBackend {
    entries: RwLock<Vec<RetryEntry>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RetryBackend for InMemoryBackend {
    fn load(&self) -> Result<Vec<RetryEntry>, StoreError> {
        let store = self
            .entries
            .read()
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        Ok(store.clone())
    }

    fn save(&self, entries: &[RetryEntry]) -> Result<(), StoreError> {
        let mut store = self
            .entries
            .write()
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        *store = entries.to_vec();
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "InMemory"
    }
}
