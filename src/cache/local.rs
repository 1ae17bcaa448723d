//! Local Tier - In-Process Hot Cache
//!
//! Concurrent map of [`CacheEntry`] values keyed by [`CacheKey`].
//!
//! # Design
//!
//! - `DashMap` sharding, so unrelated keys never contend on one lock
//! - Frequency-weighted idle-time eviction between high/low watermarks
//! - Entries past their local expiration are absent and removed on sight
//! - An entry leaving the map is dropped, which releases its buffer count
//!   and disposes retained instances

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use super::entry::{CacheEntry, LocalHit};
use super::key::CacheKey;
use super::DEFAULT_LOCAL_CAPACITY;

/// Boundary to the in-process store
pub trait LocalStore: Send + Sync {
    /// Look up a live entry. Buffer payloads come back reserved.
    fn get(&self, key: &CacheKey) -> Option<LocalHit>;

    /// Insert or replace. Returns `false` if the entry was not admitted.
    fn set(&self, key: CacheKey, entry: CacheEntry) -> bool;

    /// Insert or replace only while `admit` holds. `admit` is evaluated
    /// under the key's lock, so a concurrent `set` or `remove` for the same
    /// key is ordered strictly before or after it.
    fn set_if(&self, key: CacheKey, entry: CacheEntry, admit: &(dyn Fn() -> bool + Sync)) -> bool;

    /// Remove an entry. Returns `true` if one was present.
    fn remove(&self, key: &CacheKey) -> bool;
}

/// Local tier configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalConfig {
    /// Maximum capacity in bytes
    pub capacity: u64,
    /// High watermark fraction (trigger eviction)
    pub high_watermark: f64,
    /// Low watermark fraction (stop eviction)
    pub low_watermark: f64,
    /// Eviction batch size
    pub eviction_batch_size: usize,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_LOCAL_CAPACITY,
            high_watermark: 0.90,
            low_watermark: 0.80,
            eviction_batch_size: 1000,
        }
    }
}

/// In-process cache tier
pub struct L1Cache {
    /// Storage
    storage: DashMap<CacheKey, CacheEntry>,
    /// Configuration
    config: LocalConfig,
    /// Current size in bytes
    current_size: AtomicU64,
    /// Hit count
    hits: AtomicU64,
    /// Miss count
    misses: AtomicU64,
    /// Eviction count
    evictions: AtomicU64,
    /// Entries dropped for being past expiry
    expirations: AtomicU64,
    /// Hits lost because the buffer was already recycled
    reservation_failures: AtomicU64,
}

impl L1Cache {
    /// Create a local tier with default configuration
    pub fn new() -> Self {
        Self::with_config(LocalConfig::default())
    }

    /// Create a local tier with custom configuration
    pub fn with_config(config: LocalConfig) -> Self {
        Self {
            storage: DashMap::new(),
            config,
            current_size: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
            reservation_failures: AtomicU64::new(0),
        }
    }

    /// Remove `key` only if it still holds the entry with `id`
    fn remove_exact(&self, key: &CacheKey, id: u64) -> Option<CacheEntry> {
        let (_, removed) = self.storage.remove_if(key, |_, entry| entry.id() == id)?;
        self.current_size.fetch_sub(removed.size(), Ordering::Relaxed);
        Some(removed)
    }

    fn admit(&self, key: CacheKey, entry: CacheEntry, admit: &(dyn Fn() -> bool + Sync)) -> bool {
        let size = entry.size();
        if size > self.config.capacity {
            return false;
        }

        if self.should_evict() {
            self.evict();
        }

        // Displaced entries are dropped after the shard lock is released
        let displaced = match self.storage.entry(key) {
            Entry::Occupied(mut occupied) => {
                if !admit() {
                    return false;
                }
                entry.mark_retained();
                Some(occupied.insert(entry))
            }
            Entry::Vacant(vacant) => {
                if !admit() {
                    return false;
                }
                entry.mark_retained();
                vacant.insert(entry);
                None
            }
        };

        self.current_size.fetch_add(size, Ordering::Relaxed);
        if let Some(old) = displaced {
            self.current_size.fetch_sub(old.size(), Ordering::Relaxed);
        }
        true
    }

    /// Check if cache contains a live key
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.storage
            .get(key)
            .map(|entry| !entry.is_expired())
            .unwrap_or(false)
    }

    /// Check if eviction should be triggered
    fn should_evict(&self) -> bool {
        let current = self.current_size.load(Ordering::Relaxed) as f64;
        let capacity = self.config.capacity as f64;
        current / capacity >= self.config.high_watermark
    }

    /// Check if eviction should continue
    fn should_continue_eviction(&self) -> bool {
        let current = self.current_size.load(Ordering::Relaxed) as f64;
        let capacity = self.config.capacity as f64;
        current / capacity > self.config.low_watermark
    }

    /// Evict entries until the low watermark is reached
    fn evict(&self) {
        let mut candidates: Vec<(CacheKey, u64, f64)> = self
            .storage
            .iter()
            .map(|item| {
                let entry = item.value();
                let score = if entry.is_expired() {
                    f64::MAX
                } else {
                    entry.metadata.eviction_score()
                };
                (item.key().clone(), entry.id(), score)
            })
            .collect();

        // Highest score first = most evictable
        candidates.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal));

        let mut evicted = 0;
        for (key, id, _) in candidates {
            if !self.should_continue_eviction() || evicted >= self.config.eviction_batch_size {
                break;
            }
            if self.remove_exact(&key, id).is_some() {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                evicted += 1;
            }
        }

        tracing::debug!(evicted, size = self.size(), "local tier eviction pass");
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let expired: Vec<(CacheKey, u64)> = self
            .storage
            .iter()
            .filter(|item| item.value().is_expired())
            .map(|item| (item.key().clone(), item.value().id()))
            .collect();

        let removed = expired
            .into_iter()
            .filter(|(key, id)| self.remove_exact(key, *id).is_some())
            .count();
        self.expirations.fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    /// Get current size in bytes
    pub fn size(&self) -> u64 {
        self.current_size.load(Ordering::Relaxed)
    }

    /// Get capacity
    pub fn capacity(&self) -> u64 {
        self.config.capacity
    }

    /// Get number of entries
    pub fn len(&self) -> usize {
        self.storage.len()
    }

    /// Check if cache is empty
    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    /// Get hit count
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Get miss count
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Get hit ratio
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits() as f64;
        let total = hits + self.misses() as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }

    /// Get eviction count
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Clear the cache
    pub fn clear(&self) {
        let keys: Vec<CacheKey> = self.storage.iter().map(|item| item.key().clone()).collect();
        for key in keys {
            LocalStore::remove(self, &key);
        }
    }

    /// Get utilization fraction
    pub fn utilization(&self) -> f64 {
        self.size() as f64 / self.capacity() as f64
    }
}

impl LocalStore for L1Cache {
    fn get(&self, key: &CacheKey) -> Option<LocalHit> {
        let expired_id = match self.storage.get(key) {
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            Some(entry) if entry.is_expired() => entry.id(),
            Some(entry) => {
                return match entry.read() {
                    Some(hit) => {
                        entry.record_access();
                        self.hits.fetch_add(1, Ordering::Relaxed);
                        Some(hit)
                    }
                    None => {
                        tracing::debug!(key = %key, "buffer already recycled, treating as miss");
                        self.reservation_failures.fetch_add(1, Ordering::Relaxed);
                        self.misses.fetch_add(1, Ordering::Relaxed);
                        None
                    }
                };
            }
        };

        if self.remove_exact(key, expired_id).is_some() {
            self.expirations.fetch_add(1, Ordering::Relaxed);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    fn set(&self, key: CacheKey, entry: CacheEntry) -> bool {
        self.admit(key, entry, &|| true)
    }

    fn set_if(&self, key: CacheKey, entry: CacheEntry, admit: &(dyn Fn() -> bool + Sync)) -> bool {
        self.admit(key, entry, admit)
    }

    fn remove(&self, key: &CacheKey) -> bool {
        match self.storage.remove(key) {
            Some((_, removed)) => {
                self.current_size.fetch_sub(removed.size(), Ordering::Relaxed);
                true
            }
            None => false,
        }
    }
}

impl Default for L1Cache {
    fn default() -> Self {
        Self::new()
    }
}

/// Local tier statistics
#[derive(Debug, Clone)]
pub struct LocalStats {
    /// Current size in bytes
    pub size: u64,
    /// Capacity in bytes
    pub capacity: u64,
    /// Number of entries
    pub entries: usize,
    /// Hit count
    pub hits: u64,
    /// Miss count
    pub misses: u64,
    /// Hit ratio (0.0 - 1.0)
    pub hit_ratio: f64,
    /// Eviction count
    pub evictions: u64,
    /// Expired entries removed
    pub expirations: u64,
    /// Hits lost to recycled buffers
    pub reservation_failures: u64,
    /// Utilization (0.0 - 1.0)
    pub utilization: f64,
}

impl L1Cache {
    /// Get cache statistics
    pub fn stats(&self) -> LocalStats {
        LocalStats {
            size: self.size(),
            capacity: self.capacity(),
            entries: self.len(),
            hits: self.hits(),
            misses: self.misses(),
            hit_ratio: self.hit_ratio(),
            evictions: self.evictions(),
            expirations: self.expirations.load(Ordering::Relaxed),
            reservation_failures: self.reservation_failures.load(Ordering::Relaxed),
            utilization: self.utilization(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
