//! Second-level cache invalidation seam
//!
//! Remote events only ever evict. [`CacheInvalidator`] is implemented by the
//! surrounding system's cache; [`MemoryCache`] is a region-per-table map used
//! by the `cohort` binary and in tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::types::PkValue;

/// Eviction callback honored by a local second-level cache
pub trait CacheInvalidator: Send + Sync {
    /// Evict the entries of `table` with the given primary keys
    fn evict_keys(&self, table: &str, keys: &[PkValue]) -> crate::Result<()>;

    /// Evict every entry of `table`
    fn evict_table(&self, table: &str) -> crate::Result<()>;
}

/// Eviction counters of a [`MemoryCache`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryCacheStats {
    pub entries: usize,
    /// Calls to `evict_keys`
    pub key_evictions: u64,
    /// Calls to `evict_table`
    pub table_evictions: u64,
    /// Entries actually removed
    pub entries_removed: u64,
}

/// In-memory cache with one region per table
#[derive(Debug)]
pub struct MemoryCache<V> {
    regions: RwLock<HashMap<String, HashMap<PkValue, V>>>,
    key_evictions: AtomicU64,
    table_evictions: AtomicU64,
    entries_removed: AtomicU64,
}

impl<V: Clone> Default for MemoryCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone> MemoryCache<V> {
    pub fn new() -> Self {
        Self {
            regions: RwLock::new(HashMap::new()),
            key_evictions: AtomicU64::new(0),
            table_evictions: AtomicU64::new(0),
            entries_removed: AtomicU64::new(0),
        }
    }

    pub fn put(&self, table: &str, key: impl Into<PkValue>, value: V) {
        self.regions
            .write()
            .entry(table.to_string())
            .or_default()
            .insert(key.into(), value);
    }

    pub fn get(&self, table: &str, key: &PkValue) -> Option<V> {
        self.regions.read().get(table)?.get(key).cloned()
    }

    pub fn contains(&self, table: &str, key: &PkValue) -> bool {
        self.regions
            .read()
            .get(table)
            .is_some_and(|region| region.contains_key(key))
    }

    /// Cached keys as `table:key`, sorted
    pub fn keys(&self) -> Vec<String> {
        let regions = self.regions.read();
        let mut keys: Vec<String> = regions
            .iter()
            .flat_map(|(table, region)| region.keys().map(move |k| format!("{}:{}", table, k)))
            .collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.regions.read().values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> MemoryCacheStats {
        MemoryCacheStats {
            entries: self.len(),
            key_evictions: self.key_evictions.load(Ordering::Relaxed),
            table_evictions: self.table_evictions.load(Ordering::Relaxed),
            entries_removed: self.entries_removed.load(Ordering::Relaxed),
        }
    }
}

impl<V: Send + Sync> CacheInvalidator for MemoryCache<V> {
    fn evict_keys(&self, table: &str, keys: &[PkValue]) -> crate::Result<()> {
        self.key_evictions.fetch_add(1, Ordering::Relaxed);

        let mut regions = self.regions.write();
        if let Some(region) = regions.get_mut(table) {
            let removed = keys.iter().filter(|k| region.remove(k).is_some()).count();
            self.entries_removed
                .fetch_add(removed as u64, Ordering::Relaxed);
        }
        Ok(())
    }

    fn evict_table(&self, table: &str) -> crate::Result<()> {
        self.table_evictions.fetch_add(1, Ordering::Relaxed);

        if let Some(region) = self.regions.write().remove(table) {
            self.entries_removed
                .fetch_add(region.len() as u64, Ordering::Relaxed);
        }
        Ok(())
    }
}
