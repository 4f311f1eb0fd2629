//! Two-tier score cache: a process-local map in front of the persistent
//! filescore store.

use std::sync::Arc;

use dashmap::DashMap;

use sluice_model::{FileScoreEntry, ScanKey};

use crate::broker::{Broker, HashTable};
use crate::error::Result;

pub const FILESCORE_TABLE: &str = "filescore";

/// Which tier satisfied a probe; the ingester keys its hit counters on this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheTier {
    Local,
    Remote,
}

/// Score cache over a scan key.
///
/// The local tier is never authoritative: misses fall through to the store,
/// and remote hits are pulled into the local map. Expiry and staleness are
/// judged by the caller, which also owns eviction.
pub struct ScoreCache {
    local: DashMap<String, FileScoreEntry>,
    store: HashTable<FileScoreEntry>,
}

impl std::fmt::Debug for ScoreCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScoreCache")
            .field("local_entries", &self.local.len())
            .finish()
    }
}

impl ScoreCache {
    pub fn new(persistent: Arc<dyn Broker>) -> Self {
        ScoreCache {
            local: DashMap::new(),
            store: HashTable::new(persistent, FILESCORE_TABLE),
        }
    }

    pub async fn probe(
        &self,
        key: &ScanKey,
    ) -> Result<Option<(FileScoreEntry, CacheTier)>> {
        if let Some(entry) = self.local.get(key.as_str()) {
            return Ok(Some((entry.clone(), CacheTier::Local)));
        }

        match self.store.get(key.as_str()).await? {
            Some(entry) => {
                self.local.insert(key.as_str().to_string(), entry.clone());
                Ok(Some((entry, CacheTier::Remote)))
            }
            None => Ok(None),
        }
    }

    pub async fn save(
        &self,
        key: &ScanKey,
        entry: &FileScoreEntry,
    ) -> Result<()> {
        self.local.insert(key.as_str().to_string(), entry.clone());
        self.store.set(key.as_str(), entry).await
    }

    pub async fn evict(&self, key: &ScanKey) -> Result<()> {
        self.local.remove(key.as_str());
        self.store.remove(key.as_str()).await
    }

    /// Drop the local tier only; the store is untouched.
    pub fn clear_local(&self) {
        self.local.clear();
    }
}
