//! Distributed Tier - Shared Out-of-Process Store
//!
//! The cache talks to the distributed store through [`DistributedStore`], a
//! byte-oriented boundary. Stores that can avoid contiguous allocations also
//! expose [`BufferedDistributedStore`]: reads write straight into a pooled
//! sink and writes accept a list of borrowed segments. [`DistributedTier`]
//! uses the extension when present and falls back to whole arrays otherwise.
//!
//! Store failures never fail a cache call. Reads degrade to a miss; writes
//! follow the configured [`DistributedWritePolicy`] and are then dropped.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;

use super::buffer::{BufferHandle, BufferPool, PooledWriter};
use super::key::CacheKey;
use super::metrics::{CacheMetrics, LatencyTracker};
use crate::config::DistributedWritePolicy;
use crate::error::{CacheError, Result};

/// Largest segment handed to a buffered store in one slice
pub const SEGMENT_SIZE: usize = 64 * 1024;

/// Per-write options passed to the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DistributedEntryOptions {
    /// Time to live in the store
    pub expiration: Duration,
}

/// Boundary to the distributed store
#[async_trait]
pub trait DistributedStore: Send + Sync {
    /// Read a whole value
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Write a whole value
    async fn set(&self, key: &str, value: Bytes, options: &DistributedEntryOptions) -> Result<()>;

    /// Delete a value
    async fn remove(&self, key: &str) -> Result<()>;

    /// Zero-copy extension, if this store supports it
    fn buffered(&self) -> Option<&dyn BufferedDistributedStore> {
        None
    }
}

/// Optional zero-copy extension of [`DistributedStore`]
#[async_trait]
pub trait BufferedDistributedStore: Send + Sync {
    /// Append the value for `key` to `sink`. Returns `false` on a miss.
    async fn try_get_into(&self, key: &str, sink: &mut PooledWriter) -> Result<bool>;

    /// Write a value supplied as consecutive segments
    async fn set_segments(
        &self,
        key: &str,
        segments: &[&[u8]],
        options: &DistributedEntryOptions,
    ) -> Result<()>;
}

/// In-memory store statistics
#[derive(Debug, Clone, Default)]
pub struct InMemoryStoreStats {
    /// Total objects stored
    pub object_count: u64,
    /// Total bytes stored
    pub total_bytes: u64,
    /// Read operations
    pub reads: u64,
    /// Write operations
    pub writes: u64,
    /// Delete operations
    pub deletes: u64,
}

struct StoredValue {
    data: Bytes,
    expire_at: Instant,
}

/// In-memory distributed store with TTLs and fault injection
pub struct InMemoryDistributedStore {
    /// Storage
    storage: DashMap<String, StoredValue>,
    /// Expose the buffered extension
    buffered: bool,
    /// Simulated round-trip latency
    latency: Duration,
    /// Fail every read
    fail_reads: AtomicBool,
    /// Remaining writes to fail
    fail_writes: AtomicU32,
    // Statistics
    total_bytes: AtomicU64,
    reads: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
}

impl Default for InMemoryDistributedStore {
    fn default() -> Self {
        Self {
            storage: DashMap::new(),
            buffered: true,
            latency: Duration::ZERO,
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicU32::new(0),
            total_bytes: AtomicU64::new(0),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
        }
    }
}

impl InMemoryDistributedStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self::default()
    }

    /// Hide the buffered extension, forcing whole-array transfers
    pub fn without_buffered(mut self) -> Self {
        self.buffered = false;
        self
    }

    /// Delay every operation by `latency`
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Make every read fail (or stop failing)
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Make every write fail (or stop failing)
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes
            .store(if fail { u32::MAX } else { 0 }, Ordering::SeqCst);
    }

    /// Fail only the next `count` writes
    pub fn fail_next_writes(&self, count: u32) {
        self.fail_writes.store(count, Ordering::SeqCst);
    }

    /// True if a live value is stored under `key`
    pub fn contains(&self, key: &str) -> bool {
        self.storage
            .get(key)
            .map(|value| Instant::now() < value.expire_at)
            .unwrap_or(false)
    }

    /// Get storage statistics
    pub fn stats(&self) -> InMemoryStoreStats {
        InMemoryStoreStats {
            object_count: self.storage.len() as u64,
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
        }
    }

    async fn round_trip(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }

    fn check_read(&self) -> Result<()> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(CacheError::Distributed("injected read failure".into()));
        }
        Ok(())
    }

    fn check_write(&self) -> Result<()> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        let failing = self
            .fail_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
                match remaining {
                    0 => None,
                    u32::MAX => Some(u32::MAX),
                    n => Some(n - 1),
                }
            })
            .is_ok();
        if failing {
            return Err(CacheError::Distributed("injected write failure".into()));
        }
        Ok(())
    }

    fn lookup(&self, key: &str) -> Option<Bytes> {
        {
            let value = self.storage.get(key)?;
            if Instant::now() < value.expire_at {
                return Some(value.data.clone());
            }
        }
        if let Some((_, old)) = self
            .storage
            .remove_if(key, |_, value| Instant::now() >= value.expire_at)
        {
            self.total_bytes
                .fetch_sub(old.data.len() as u64, Ordering::Relaxed);
        }
        None
    }

    fn store(&self, key: &str, data: Bytes, options: &DistributedEntryOptions) {
        let size = data.len() as u64;
        let value = StoredValue {
            data,
            expire_at: Instant::now() + options.expiration,
        };
        let old = self.storage.insert(key.to_string(), value);

        self.total_bytes.fetch_add(size, Ordering::Relaxed);
        if let Some(old) = old {
            self.total_bytes
                .fetch_sub(old.data.len() as u64, Ordering::Relaxed);
        }
    }

    fn delete(&self, key: &str) -> bool {
        match self.storage.remove(key) {
            Some((_, old)) => {
                self.total_bytes
                    .fetch_sub(old.data.len() as u64, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl DistributedStore for InMemoryDistributedStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.round_trip().await;
        self.check_read()?;
        Ok(self.lookup(key))
    }

    async fn set(&self, key: &str, value: Bytes, options: &DistributedEntryOptions) -> Result<()> {
        self.round_trip().await;
        self.check_write()?;
        self.store(key, value, options);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.round_trip().await;
        self.deletes.fetch_add(1, Ordering::Relaxed);
        self.delete(key);
        Ok(())
    }

    fn buffered(&self) -> Option<&dyn BufferedDistributedStore> {
        if self.buffered {
            Some(self)
        } else {
            None
        }
    }
}

#[async_trait]
impl BufferedDistributedStore for InMemoryDistributedStore {
    async fn try_get_into(&self, key: &str, sink: &mut PooledWriter) -> Result<bool> {
        self.round_trip().await;
        self.check_read()?;
        match self.lookup(key) {
            Some(data) => {
                sink.extend_from_slice(&data);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn set_segments(
        &self,
        key: &str,
        segments: &[&[u8]],
        options: &DistributedEntryOptions,
    ) -> Result<()> {
        self.round_trip().await;
        self.check_write()?;
        let total = segments.iter().map(|s| s.len()).sum();
        let mut data = Vec::with_capacity(total);
        for segment in segments {
            data.extend_from_slice(segment);
        }
        self.store(key, Bytes::from(data), options);
        Ok(())
    }
}

/// Distributed tier: a store plus failure policy and buffer plumbing
pub struct DistributedTier {
    /// Storage backend
    store: Arc<dyn DistributedStore>,
    /// Pool for read buffers
    pool: Arc<BufferPool>,
    /// Write failure handling
    write_policy: DistributedWritePolicy,
    /// Shared counters
    metrics: Arc<CacheMetrics>,
}

impl DistributedTier {
    /// Wrap a store
    pub fn new(
        store: Arc<dyn DistributedStore>,
        pool: Arc<BufferPool>,
        write_policy: DistributedWritePolicy,
        metrics: Arc<CacheMetrics>,
    ) -> Self {
        Self {
            store,
            pool,
            write_policy,
            metrics,
        }
    }

    /// Read `key` into a fresh pooled buffer. Failures read as a miss.
    pub async fn read(&self, key: &CacheKey) -> Option<BufferHandle> {
        let tracker = LatencyTracker::start();
        let result = match self.store.buffered() {
            Some(buffered) => {
                let mut sink = self.pool.writer();
                buffered
                    .try_get_into(key.as_str(), &mut sink)
                    .await
                    .map(|found| found.then(|| sink.into_handle()))
            }
            None => self
                .store
                .get(key.as_str())
                .await
                .map(|found| found.map(|bytes| self.pool.create(&bytes))),
        };
        self.metrics.record_l2_read_latency(tracker.elapsed());

        match result {
            Ok(Some(handle)) => {
                self.metrics.record_l2_hit();
                Some(handle)
            }
            Ok(None) => {
                self.metrics.record_l2_miss();
                None
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "distributed read failed, treating as miss");
                self.metrics.record_l2_read_failure();
                self.metrics.record_l2_miss();
                None
            }
        }
    }

    /// Write `payload` under `key`, retrying per policy.
    ///
    /// Returns `false` once every attempt failed; the failure is logged and
    /// counted, never raised.
    pub async fn write(&self, key: &CacheKey, payload: &[u8], expiration: Duration) -> bool {
        let options = DistributedEntryOptions { expiration };
        let attempts = self.write_policy.attempts().max(1);

        for attempt in 1..=attempts {
            if attempt > 1 {
                self.metrics.record_l2_write_retry();
                tokio::time::sleep(self.write_policy.backoff(attempt)).await;
            }

            let result = match self.store.buffered() {
                Some(buffered) => {
                    let segments: Vec<&[u8]> = payload.chunks(SEGMENT_SIZE).collect();
                    buffered.set_segments(key.as_str(), &segments, &options).await
                }
                None => {
                    self.store
                        .set(key.as_str(), Bytes::copy_from_slice(payload), &options)
                        .await
                }
            };

            match result {
                Ok(()) => {
                    self.metrics.record_l2_write();
                    return true;
                }
                Err(e) if attempt < attempts => {
                    tracing::debug!(key = %key, attempt, error = %e, "distributed write failed, retrying");
                }
                Err(e) => {
                    tracing::warn!(key = %key, attempts, error = %e, "distributed write failed, dropping");
                }
            }
        }

        self.metrics.record_l2_write_failure();
        false
    }

    /// Delete `key`. Failures are logged and counted.
    pub async fn remove(&self, key: &CacheKey) -> bool {
        match self.store.remove(key.as_str()).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "distributed remove failed");
                self.metrics.record_l2_write_failure();
                false
            }
        }
    }

    /// The wrapped store
    pub fn store(&self) -> &Arc<dyn DistributedStore> {
        &self.store
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn tier(store: Arc<InMemoryDistributedStore>, policy: DistributedWritePolicy) -> DistributedTier {
        DistributedTier::new(store, BufferPool::new(), policy, Arc::new(CacheMetrics::new()))
    }

    fn minutes(n: u64) -> DistributedEntryOptions {
        DistributedEntryOptions {
            expiration: Duration::from_secs(60 * n),
        }
    }

    fn read_all(handle: &BufferHandle) -> Vec<u8> {
        handle.reserve_for_read().unwrap().to_vec()
    }

    #[tokio::test]
    async fn test_in_memory_store_roundtrip() {
        let store = InMemoryDistributedStore::new();
        store
            .set("k", Bytes::from_static(b"value"), &minutes(1))
            .await
            .unwrap();

        assert_eq!(store.get("k").await.unwrap().unwrap(), Bytes::from_static(b"value"));
        store.remove("k").await.unwrap();
        assert!(store.get("k").await.unwrap().is_none());

        let stats = store.stats();
        assert_eq!(stats.writes, 1);
        assert_eq!(stats.deletes, 1);
        assert_eq!(stats.total_bytes, 0);
    }

    #[tokio::test]
    async fn test_in_memory_store_expiry() {
        let store = InMemoryDistributedStore::new();
        let options = DistributedEntryOptions {
            expiration: Duration::ZERO,
        };
        store.set("k", Bytes::from_static(b"v"), &options).await.unwrap();

        assert!(store.get("k").await.unwrap().is_none());
        assert_eq!(store.stats().object_count, 0);
    }

    #[tokio::test]
    async fn test_buffered_segments_reassemble() {
        let store = InMemoryDistributedStore::new();
        let buffered = store.buffered().unwrap();
        let segments: [&[u8]; 3] = [b"ab", b"cd", b"ef"];
        buffered
            .set_segments("k", &segments, &minutes(1))
            .await
            .unwrap();

        let pool = BufferPool::new();
        let mut sink = pool.writer();
        assert!(buffered.try_get_into("k", &mut sink).await.unwrap());
        assert_eq!(sink.as_slice(), b"abcdef");
        assert!(!buffered.try_get_into("missing", &mut pool.writer()).await.unwrap());
    }

    #[tokio::test]
    async fn test_tier_uses_extension_when_available() {
        let store = Arc::new(InMemoryDistributedStore::new());
        let tier = tier(store.clone(), DistributedWritePolicy::Drop);
        let key = CacheKey::new("big");
        let payload = vec![7u8; SEGMENT_SIZE * 2 + 10];

        assert!(tier.write(&key, &payload, Duration::from_secs(60)).await);
        let handle = tier.read(&key).await.unwrap();
        assert_eq!(read_all(&handle), payload);
    }

    #[tokio::test]
    async fn test_tier_falls_back_without_extension() {
        let store = Arc::new(InMemoryDistributedStore::new().without_buffered());
        assert!(store.buffered().is_none());

        let tier = tier(store.clone(), DistributedWritePolicy::Drop);
        let key = CacheKey::new("plain");
        assert!(tier.write(&key, b"whole", Duration::from_secs(60)).await);

        let handle = tier.read(&key).await.unwrap();
        assert_eq!(read_all(&handle), b"whole");
        assert_eq!(handle.ref_count(), 1);
    }

    #[tokio::test]
    async fn test_read_failure_is_a_miss() {
        let store = Arc::new(InMemoryDistributedStore::new());
        let metrics = Arc::new(CacheMetrics::new());
        let tier = DistributedTier::new(
            store.clone(),
            BufferPool::new(),
            DistributedWritePolicy::Drop,
            metrics.clone(),
        );
        let key = CacheKey::new("k");
        tier.write(&key, b"v", Duration::from_secs(60)).await;
        store.set_fail_reads(true);

        assert!(tier.read(&key).await.is_none());
        assert_eq!(metrics.l2_read_failures(), 1);
    }

    #[tokio::test]
    async fn test_drop_policy_gives_up_after_one_attempt() {
        let store = Arc::new(InMemoryDistributedStore::new());
        store.fail_next_writes(1);
        let tier = tier(store.clone(), DistributedWritePolicy::Drop);

        assert!(!tier.write(&CacheKey::new("k"), b"v", Duration::from_secs(60)).await);
        assert!(!store.contains("k"));
        assert_eq!(store.stats().writes, 1);
    }

    #[tokio::test]
    async fn test_retry_policy_recovers() {
        let store = Arc::new(InMemoryDistributedStore::new());
        store.fail_next_writes(2);
        let metrics = Arc::new(CacheMetrics::new());
        let tier = DistributedTier::new(
            store.clone(),
            BufferPool::new(),
            DistributedWritePolicy::Retry {
                max_attempts: 3,
                backoff_ms: 1,
            },
            metrics.clone(),
        );

        assert!(tier.write(&CacheKey::new("k"), b"v", Duration::from_secs(60)).await);
        assert!(store.contains("k"));
        assert_eq!(metrics.l2_write_retries(), 2);
        assert_eq!(metrics.l2_write_failures(), 0);
    }

    #[tokio::test]
    async fn test_retry_policy_exhausts() {
        let store = Arc::new(InMemoryDistributedStore::new());
        store.set_fail_writes(true);
        let tier = tier(
            store.clone(),
            DistributedWritePolicy::Retry {
                max_attempts: 2,
                backoff_ms: 1,
            },
        );

        assert!(!tier.write(&CacheKey::new("k"), b"v", Duration::from_secs(60)).await);
        assert_eq!(store.stats().writes, 2);
    }
}
