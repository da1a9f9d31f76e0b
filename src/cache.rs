//! Result cache for `get_homologs` with per-key request coalescing.
//!
//! Entries are bounded by count (LRU) and age (TTL). The gate map hands out
//! one async lock per key so concurrent identical requests run a single
//! live search and the rest pick up its stored result.

use crate::reference::ObjectReference;
use homology_protocol::HomologsResult;
use lru::LruCache;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// `bypass_caching` is deliberately not part of the key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub object: ObjectReference,
    pub n_max_results: u32,
}

impl CacheKey {
    pub fn new(object: ObjectReference, n_max_results: u32) -> Self {
        Self {
            object,
            n_max_results,
        }
    }
}

struct CacheEntry {
    result: Arc<HomologsResult>,
    inserted_at: Instant,
}

pub struct SearchCache {
    entries: Mutex<LruCache<CacheKey, CacheEntry>>,
    gates: Mutex<HashMap<CacheKey, Arc<AsyncMutex<()>>>>,
    ttl: Duration,
}

impl SearchCache {
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            gates: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Returns the stored result if present and younger than the TTL.
    /// Expired entries are dropped on access.
    pub fn lookup(&self, key: &CacheKey) -> Option<Arc<HomologsResult>> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = entries.get(key) {
            if entry.inserted_at.elapsed() < self.ttl {
                return Some(entry.result.clone());
            }
            entries.pop(key);
        }
        None
    }

    pub fn store(&self, key: CacheKey, result: Arc<HomologsResult>) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.put(
            key,
            CacheEntry {
                result,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Waits for exclusive use of `key`. Holders of different keys never
    /// wait on each other.
    pub async fn gate(&self, key: &CacheKey) -> OwnedMutexGuard<()> {
        let lock = {
            let mut gates = self.gates.lock().unwrap_or_else(PoisonError::into_inner);
            // only the map itself holds idle gates
            gates.retain(|_, gate| Arc::strong_count(gate) > 1);
            Arc::clone(
                gates
                    .entry(key.clone())
                    .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
            )
        };
        lock.lock_owned().await
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    fn gate_count(&self) -> usize {
        self.gates.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl std::fmt::Debug for SearchCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchCache")
            .field("len", &self.len())
            .field("ttl", &self.ttl)
            .finish()
    }
}
