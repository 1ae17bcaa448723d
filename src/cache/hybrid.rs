//! Hybrid Cache - Two-Level Read-Through Facade
//!
//! Composes the local tier, the distributed tier and the stampede
//! coordinator into `get_or_create`, `set`, `remove_key` and `remove_keys`.
//!
//! # Read path
//!
//! ```text
//!   get_or_create(key)
//!     ├─ L1 hit ─────────────────────────────────────────► value
//!     └─ coordinator
//!          ├─ join running generation ──────────────────► shared outcome
//!          └─ own new generation (spawned task)
//!               ├─ L2 hit ──► L1 write ──────────────────► publish
//!               └─ factory ──► L2 write ──► L1 write ────► publish
//! ```
//!
//! Write-backs are skipped when the generation was superseded by a `set` or
//! `remove` for the same key, or when every caller detached.
//!
//! Values of immutable-shareable types are held once and handed out by
//! reference through [`HybridCache::get_or_create_shared`]; everything else is
//! deserialized per reader.

use std::any::TypeId;
use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn, Instrument};

use super::buffer::{BufferHandle, BufferPool, BufferPoolStats, PooledWriter};
use super::classify::{classify, CacheValue};
use super::distributed::{DistributedStore, DistributedTier};
use super::entry::{CacheEntry, LocalHit, SharedInstance};
use super::key::CacheKey;
use super::local::{L1Cache, LocalStore};
use super::metrics::{CacheMetrics, LatencyTracker, MetricsSnapshot};
use super::options::{EntryFlags, EntryOptions, ResolvedOptions};
use super::stampede::{Acquired, Coordinator, Outcome, Publisher, StampedeState};
use crate::config::HybridCacheConfig;
use crate::error::{CacheError, Result};

/// What a lookup resolved to, before materializing it for the caller
enum Fetched<T> {
    /// Hit or published outcome of a generation
    Hit(LocalHit),
    /// Produced for this caller alone, outside the cache
    Bypassed(T),
}

struct Inner {
    config: HybridCacheConfig,
    local: Arc<dyn LocalStore>,
    distributed: Option<DistributedTier>,
    coordinator: Coordinator,
    pool: Arc<BufferPool>,
    metrics: Arc<CacheMetrics>,
}

/// Two-level read-through cache with stampede suppression.
///
/// Cheap to clone; clones share every tier and the coordinator.
#[derive(Clone)]
pub struct HybridCache {
    inner: Arc<Inner>,
}

/// Builder for [`HybridCache`]
pub struct HybridCacheBuilder {
    config: HybridCacheConfig,
    local: Option<Arc<dyn LocalStore>>,
    distributed: Option<Arc<dyn DistributedStore>>,
}

impl HybridCacheBuilder {
    /// Use a custom local store instead of an [`L1Cache`] built from config
    pub fn local_store(mut self, store: Arc<dyn LocalStore>) -> Self {
        self.local = Some(store);
        self
    }

    /// Attach a distributed store
    pub fn distributed_store(mut self, store: Arc<dyn DistributedStore>) -> Self {
        self.distributed = Some(store);
        self
    }

    /// Validate the configuration and build the cache
    pub fn build(self) -> Result<HybridCache> {
        self.config.validate()?;

        let metrics = Arc::new(CacheMetrics::new());
        let pool = BufferPool::with_config(self.config.buffer_pool.clone());
        let local = match self.local {
            Some(local) => local,
            None => Arc::new(L1Cache::with_config(self.config.local.clone())) as Arc<dyn LocalStore>,
        };
        let distributed = self.distributed.map(|store| {
            DistributedTier::new(
                store,
                Arc::clone(&pool),
                self.config.distributed_write_policy,
                Arc::clone(&metrics),
            )
        });

        Ok(HybridCache {
            inner: Arc::new(Inner {
                coordinator: Coordinator::new(Arc::clone(&metrics)),
                config: self.config,
                local,
                distributed,
                pool,
                metrics,
            }),
        })
    }
}

impl HybridCache {
    /// Local-only cache with the given configuration
    pub fn new(config: HybridCacheConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    /// Start building a cache
    pub fn builder(config: HybridCacheConfig) -> HybridCacheBuilder {
        HybridCacheBuilder {
            config,
            local: None,
            distributed: None,
        }
    }

    /// [`get_or_create_with`](Self::get_or_create_with) with default options
    /// and no caller cancellation
    pub async fn get_or_create<T, F, Fut>(&self, key: &str, factory: F) -> Result<T>
    where
        T: CacheValue,
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        self.get_or_create_with(key, factory, &EntryOptions::default(), &CancellationToken::new())
            .await
    }

    /// Read `key` through both tiers, running `factory` at most once per
    /// generation on a full miss.
    ///
    /// Concurrent callers for the same key, value type and flags share one
    /// generation. The factory receives a token that is cancelled only when
    /// every caller waiting on the generation has detached. `cancel` is this
    /// caller's own token; when it fires this call returns
    /// [`CacheError::Cancelled`] carrying it, and the generation keeps
    /// running for other callers.
    ///
    /// The caller always gets an owned `T`. Use
    /// [`get_or_create_shared_with`](Self::get_or_create_shared_with) to
    /// receive shareable values by reference.
    #[instrument(skip(self, factory, options, cancel))]
    pub async fn get_or_create_with<T, F, Fut>(
        &self,
        key: &str,
        factory: F,
        options: &EntryOptions,
        cancel: &CancellationToken,
    ) -> Result<T>
    where
        T: CacheValue,
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        match self.fetch(key, factory, options, cancel).await? {
            Fetched::Hit(hit) => materialize(hit),
            Fetched::Bypassed(value) => Ok(value),
        }
    }

    /// [`get_or_create_shared_with`](Self::get_or_create_shared_with) with
    /// default options and no caller cancellation
    pub async fn get_or_create_shared<T, F, Fut>(&self, key: &str, factory: F) -> Result<Arc<T>>
    where
        T: CacheValue,
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        self.get_or_create_shared_with(key, factory, &EntryOptions::default(), &CancellationToken::new())
            .await
    }

    /// Like [`get_or_create_with`](Self::get_or_create_with), but returns an
    /// `Arc<T>`.
    ///
    /// For immutable-shareable types every reader of the same cached value,
    /// and every waiter of one generation, receives the same allocation.
    /// Other types are deserialized into a fresh `Arc` per reader.
    #[instrument(skip(self, factory, options, cancel))]
    pub async fn get_or_create_shared_with<T, F, Fut>(
        &self,
        key: &str,
        factory: F,
        options: &EntryOptions,
        cancel: &CancellationToken,
    ) -> Result<Arc<T>>
    where
        T: CacheValue,
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        match self.fetch(key, factory, options, cancel).await? {
            Fetched::Hit(hit) => materialize_shared(hit),
            Fetched::Bypassed(value) => Ok(Arc::new(value)),
        }
    }

    async fn fetch<T, F, Fut>(
        &self,
        key: &str,
        factory: F,
        options: &EntryOptions,
        cancel: &CancellationToken,
    ) -> Result<Fetched<T>>
    where
        T: CacheValue,
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        if cancel.is_cancelled() {
            return Err(CacheError::Cancelled {
                token: cancel.clone(),
            });
        }

        let options = options.resolve(&self.inner.config.default_entry_options);
        let key = match self.inner.validate_key(key) {
            Ok(key) => key,
            Err(e) => {
                warn!(error = %e, "bypassing cache");
                self.inner.metrics.record_invalid_key();
                return self
                    .inner
                    .run_uncached(key, factory, options.flags, cancel)
                    .await
                    .map(Fetched::Bypassed);
            }
        };

        if options.flags.local_read() {
            if let Some(hit) = self.inner.read_local::<T>(&key) {
                return Ok(Fetched::Hit(hit));
            }
        }

        let waiter = match self
            .inner
            .coordinator
            .acquire(&key, TypeId::of::<T>(), options.flags)
        {
            Acquired::Owner(waiter, publisher) => {
                let inner = Arc::clone(&self.inner);
                tokio::spawn(
                    async move { inner.run_generation(publisher, factory, options).await }
                        .in_current_span(),
                );
                waiter
            }
            Acquired::Joined(waiter) => {
                debug!(generation = waiter.state().generation(), "joined in-flight generation");
                waiter
            }
        };

        waiter.wait(cancel).await.map(Fetched::Hit)
    }

    /// Read `key` without ever running a value factory
    pub async fn get<T: CacheValue>(&self, key: &str, options: &EntryOptions) -> Result<Option<T>> {
        let options = options
            .clone()
            .with_flags(EntryFlags::DISABLE_UNDERLYING_DATA);
        let disabled = |_: CancellationToken| async {
            Err::<T, _>(anyhow::anyhow!("value factory disabled"))
        };

        match self
            .get_or_create_with(key, disabled, &options, &CancellationToken::new())
            .await
        {
            Ok(value) => Ok(Some(value)),
            Err(CacheError::Miss { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// [`set_with`](Self::set_with) with default options
    pub async fn set<T: CacheValue>(&self, key: &str, value: T) -> Result<()> {
        self.set_with(key, value, &EntryOptions::default()).await
    }

    /// Write `value` to every enabled tier, superseding any in-flight
    /// generation for the same key.
    #[instrument(skip(self, value, options))]
    pub async fn set_with<T: CacheValue>(&self, key: &str, value: T, options: &EntryOptions) -> Result<()> {
        let inner = &self.inner;
        let key = inner.validate_key(key)?;
        let options = options.resolve(&inner.config.default_entry_options);
        inner.supersede(&key).await;

        let write_local = options.flags.local_write();
        let write_distributed = options.flags.distributed_write() && inner.distributed.is_some();
        if !write_local && !write_distributed {
            return Ok(());
        }

        let mut writer = inner.pool.writer();
        value.encode(&mut writer)?;
        inner.check_payload(&key, &writer)?;

        if write_distributed {
            if let Some(tier) = &inner.distributed {
                tier.write(&key, writer.as_slice(), options.expiration).await;
            }
        }

        if write_local {
            let size = writer.len() as u64;
            let entry = if classify::<T>().is_immutable_shareable {
                CacheEntry::shared(value, size, options.local_expiration)
            } else {
                CacheEntry::buffered::<T>(writer.into_handle(), options.local_expiration)
            };
            if inner.local.set(key, entry) {
                inner.metrics.record_l1_write();
            }
        }
        Ok(())
    }

    /// Remove `key` from both tiers and suppress any in-flight write-back
    #[instrument(skip(self))]
    pub async fn remove_key(&self, key: &str) {
        let key = match self.inner.validate_key(key) {
            Ok(key) => key,
            Err(e) => {
                debug!(error = %e, "nothing to remove");
                return;
            }
        };

        self.inner.supersede(&key).await;
        self.inner.local.remove(&key);
        if let Some(tier) = &self.inner.distributed {
            tier.remove(&key).await;
        }
    }

    /// Remove every key in `keys`. An empty slice does nothing.
    pub async fn remove_keys<K: AsRef<str>>(&self, keys: &[K]) {
        for key in keys {
            self.remove_key(key.as_ref()).await;
        }
    }

    /// Metrics snapshot
    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Buffer pool statistics
    pub fn buffer_pool_stats(&self) -> BufferPoolStats {
        self.inner.pool.stats()
    }

    /// Number of generations in flight
    pub fn in_flight(&self) -> usize {
        self.inner.coordinator.in_flight()
    }

    /// Active configuration
    pub fn config(&self) -> &HybridCacheConfig {
        &self.inner.config
    }
}

fn materialize<T: CacheValue>(hit: LocalHit) -> Result<T> {
    hit.into_value::<T>()
        .unwrap_or_else(|| Err(CacheError::Internal("cached value has another type".into())))
}

fn materialize_shared<T: CacheValue>(hit: LocalHit) -> Result<Arc<T>> {
    hit.into_shared::<T>()
        .unwrap_or_else(|| Err(CacheError::Internal("cached value has another type".into())))
}

fn group_cancelled(key: &CacheKey) -> CacheError {
    CacheError::GroupCancelled {
        key: key.to_string(),
    }
}

impl Inner {
    fn validate_key(&self, key: &str) -> Result<CacheKey> {
        if key.is_empty() {
            return Err(CacheError::InvalidKey("key is empty".into()));
        }
        if key.len() > self.config.maximum_key_length {
            return Err(CacheError::InvalidKey(format!(
                "key of {} bytes exceeds maximum of {}",
                key.len(),
                self.config.maximum_key_length
            )));
        }
        Ok(CacheKey::new(key))
    }

    fn check_payload(&self, key: &CacheKey, writer: &PooledWriter) -> Result<()> {
        if writer.len() > self.config.maximum_payload_bytes {
            warn!(key = %key, size = writer.len(), "payload too large to cache");
            self.metrics.record_oversized_payload();
            return Err(CacheError::PayloadTooLarge {
                size: writer.len(),
                maximum: self.config.maximum_payload_bytes,
            });
        }
        Ok(())
    }

    /// Local hit usable as `T`, if any
    fn read_local<T: CacheValue>(&self, key: &CacheKey) -> Option<LocalHit> {
        let tracker = LatencyTracker::start();
        let hit = self.local.get(key).filter(|hit| {
            let serves = hit.serves::<T>();
            if !serves {
                debug!(key = %key, "local value has another type");
            }
            serves
        });

        match &hit {
            Some(_) => {
                self.metrics.record_l1_hit();
                self.metrics.record_l1_read_latency(tracker.elapsed());
            }
            None => self.metrics.record_l1_miss(),
        }
        hit
    }

    /// Mark in-flight generations for `key` stale and wait out any
    /// distributed write-back they already started
    async fn supersede(&self, key: &CacheKey) {
        for state in self.coordinator.supersede(key) {
            state.writeback_settled().await;
        }
    }

    /// Run a factory for a key the cache cannot hold. Nothing is written back.
    async fn run_uncached<T, F, Fut>(
        &self,
        key: &str,
        factory: F,
        flags: EntryFlags,
        cancel: &CancellationToken,
    ) -> Result<T>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        if !flags.underlying_data() {
            return Err(CacheError::Miss {
                key: key.to_string(),
            });
        }

        self.metrics.record_uncoordinated_execution();
        self.metrics.record_factory_execution();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.metrics.record_caller_cancellation();
                Err(CacheError::Cancelled { token: cancel.clone() })
            }
            result = factory(cancel.child_token()) => result.map_err(|e| {
                self.metrics.record_factory_failure();
                CacheError::factory(e)
            }),
        }
    }

    async fn run_generation<T, F, Fut>(&self, publisher: Publisher, factory: F, options: ResolvedOptions)
    where
        T: CacheValue,
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let state = Arc::clone(publisher.state());
        let outcome = self.produce(&state, factory, options).await;

        if let Err(e) = &outcome {
            match e {
                CacheError::GroupCancelled { .. } => {
                    debug!(key = %state.key(), generation = state.generation(), "all callers detached, nothing written");
                    self.metrics.record_group_cancellation();
                }
                CacheError::Factory(_) => self.metrics.record_factory_failure(),
                _ => {}
            }
        }
        publisher.publish(outcome);
    }

    async fn produce<T, F, Fut>(&self, state: &StampedeState, factory: F, options: ResolvedOptions) -> Outcome
    where
        T: CacheValue,
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let key = state.key();
        let token = state.token();

        // The previous generation may have landed between the caller's
        // lookup and this one registering
        if options.flags.local_read() {
            if let Some(hit) = self.local.get(key).filter(LocalHit::serves::<T>) {
                return Ok(hit);
            }
        }

        if options.flags.distributed_read() {
            if let Some(tier) = &self.distributed {
                let read = tokio::select! {
                    biased;
                    _ = token.cancelled() => None,
                    found = tier.read(key) => Some(found),
                };
                match read {
                    None => return Err(group_cancelled(key)),
                    Some(Some(handle)) => {
                        if let Some(hit) = self.admit_distributed::<T>(state, handle, options) {
                            return Ok(hit);
                        }
                    }
                    Some(None) => {}
                }
            }
        }

        if !options.flags.underlying_data() {
            return Err(CacheError::Miss {
                key: key.to_string(),
            });
        }

        self.metrics.record_factory_execution();
        let tracker = LatencyTracker::start();
        let result = factory(token.clone()).await;
        self.metrics.record_factory_latency(tracker.elapsed());

        if token.is_cancelled() {
            return Err(group_cancelled(key));
        }
        let value = result.map_err(CacheError::factory)?;
        let hit = self.store_produced(state, value, options).await;

        // The last caller may have left while the value was being stored
        if token.is_cancelled() {
            return Err(group_cancelled(key));
        }
        Ok(hit)
    }

    /// Turn an L2 buffer into a publishable hit and copy it into L1
    fn admit_distributed<T: CacheValue>(
        &self,
        state: &StampedeState,
        handle: BufferHandle,
        options: ResolvedOptions,
    ) -> Option<LocalHit> {
        let lease = handle.into_lease();
        let decoded = T::decode(&lease.bytes());
        let value = match decoded {
            Ok(value) => value,
            Err(e) => {
                warn!(key = %state.key(), error = %e, "distributed value failed to decode, treating as miss");
                return None;
            }
        };

        let ttl = options.local_expiration;
        if classify::<T>().is_immutable_shareable {
            let instance = SharedInstance::new(value);
            let entry = CacheEntry::shared_instance::<T>(instance.clone(), lease.len() as u64, ttl);
            self.write_local(state, entry, options.flags);
            Some(LocalHit::Shared(instance))
        } else {
            let entry = CacheEntry::buffered::<T>(lease.retain(), ttl);
            self.write_local(state, entry, options.flags);
            Some(LocalHit::Buffer(lease, TypeId::of::<T>()))
        }
    }

    /// Write a freshly produced value back to both tiers and build the hit
    /// every waiter receives
    async fn store_produced<T: CacheValue>(
        &self,
        state: &StampedeState,
        value: T,
        options: ResolvedOptions,
    ) -> LocalHit {
        let key = state.key();
        let shareable = classify::<T>().is_immutable_shareable;
        let write_local = options.flags.local_write();
        let write_distributed = options.flags.distributed_write() && self.distributed.is_some();

        if !write_local && !write_distributed {
            return LocalHit::Shared(SharedInstance::new(value));
        }

        let mut writer = self.pool.writer();
        if let Err(e) = value.encode(&mut writer) {
            warn!(key = %key, error = %e, "failed to serialize value, skipping write-back");
            return LocalHit::Shared(SharedInstance::new(value));
        }
        if self.check_payload(key, &writer).is_err() {
            return if shareable {
                LocalHit::Shared(SharedInstance::new(value))
            } else {
                LocalHit::Buffer(writer.into_handle().into_lease(), TypeId::of::<T>())
            };
        }

        if write_distributed {
            self.write_distributed(state, &writer, options).await;
        }

        let ttl = options.local_expiration;
        if shareable {
            let instance = SharedInstance::new(value);
            let entry = CacheEntry::shared_instance::<T>(instance.clone(), writer.len() as u64, ttl);
            self.write_local(state, entry, options.flags);
            LocalHit::Shared(instance)
        } else {
            let lease = writer.into_handle().into_lease();
            if write_local {
                let entry = CacheEntry::buffered::<T>(lease.retain(), ttl);
                self.write_local(state, entry, options.flags);
            }
            LocalHit::Buffer(lease, TypeId::of::<T>())
        }
    }

    async fn write_distributed(&self, state: &StampedeState, writer: &PooledWriter, options: ResolvedOptions) {
        let Some(tier) = &self.distributed else {
            return;
        };
        let key = state.key();

        // A superseding set or remove waits on this guard before touching
        // the distributed store, so its write lands after this one
        let _guard = state.lock_writeback().await;
        if !state.accepts_writeback() {
            self.skip_writeback(state, "distributed");
            return;
        }
        tier.write(key, writer.as_slice(), options.expiration).await;
    }

    fn write_local(&self, state: &StampedeState, entry: CacheEntry, flags: EntryFlags) {
        if !flags.local_write() {
            return;
        }
        let admitted = self
            .local
            .set_if(state.key().clone(), entry, &|| state.accepts_writeback());
        if admitted {
            self.metrics.record_l1_write();
        } else if !state.accepts_writeback() {
            self.skip_writeback(state, "local");
        }
    }

    fn skip_writeback(&self, state: &StampedeState, tier: &'static str) {
        if state.is_superseded() {
            debug!(key = %state.key(), tier, "skipping stale write-back");
            self.metrics.record_stale_writeback();
        } else {
            debug!(key = %state.key(), tier, "all callers detached, skipping write-back");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::classify::TypeShape;
    use crate::cache::distributed::InMemoryDistributedStore;
    use assert_matches::assert_matches;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Profile {
        name: String,
        visits: u32,
    }

    impl CacheValue for Profile {}

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Frozen(u64);

    impl CacheValue for Frozen {
        fn shape() -> TypeShape {
            TypeShape::IMMUTABLE
        }
    }

    fn cache_with_l2() -> (HybridCache, Arc<InMemoryDistributedStore>) {
        let store = Arc::new(InMemoryDistributedStore::new());
        let cache = HybridCache::builder(HybridCacheConfig::default())
            .distributed_store(store.clone())
            .build()
            .unwrap();
        (cache, store)
    }

    fn counting(calls: &Arc<AtomicUsize>, value: u32) -> impl FnOnce(CancellationToken) -> futures::future::Ready<anyhow::Result<u32>> {
        let calls = Arc::clone(calls);
        move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            futures::future::ready(Ok(value))
        }
    }

    #[tokio::test]
    async fn test_miss_runs_factory_then_hits() {
        let cache = HybridCache::new(HybridCacheConfig::default()).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));

        assert_eq!(cache.get_or_create("k", counting(&calls, 1)).await.unwrap(), 1);
        assert_eq!(cache.get_or_create("k", counting(&calls, 2)).await.unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.in_flight(), 0);

        let metrics = cache.metrics();
        assert_eq!(metrics.factory_executions, 1);
        assert_eq!(metrics.l1_hits, 1);
    }

    #[tokio::test]
    async fn test_copy_per_read_values_are_independent() {
        let cache = HybridCache::new(HybridCacheConfig::default()).unwrap();
        let profile = Profile {
            name: "ada".into(),
            visits: 1,
        };
        cache.set("p", profile.clone()).await.unwrap();

        let mut first: Profile = cache.get("p", &EntryOptions::new()).await.unwrap().unwrap();
        first.visits = 99;
        let second: Profile = cache.get("p", &EntryOptions::new()).await.unwrap().unwrap();
        assert_eq!(second, profile);
    }

    #[tokio::test]
    async fn test_factory_error_is_propagated_and_not_cached() {
        let cache = HybridCache::new(HybridCacheConfig::default()).unwrap();
        let result = cache
            .get_or_create("k", |_| async { Err::<u32, _>(anyhow::anyhow!("backend down")) })
            .await;
        assert_matches!(result, Err(CacheError::Factory(ref e)) if e.to_string() == "backend down");

        let value = cache.get_or_create("k", |_| async { Ok(5u32) }).await.unwrap();
        assert_eq!(value, 5);
    }

    #[tokio::test]
    async fn test_get_returns_none_on_miss() {
        let cache = HybridCache::new(HybridCacheConfig::default()).unwrap();
        let value: Option<u32> = cache.get("absent", &EntryOptions::new()).await.unwrap();
        assert_eq!(value, None);
        assert_eq!(cache.metrics().factory_executions, 0);
    }

    #[tokio::test]
    async fn test_disable_underlying_data_is_a_miss() {
        let cache = HybridCache::new(HybridCacheConfig::default()).unwrap();
        let options = EntryOptions::new().with_flags(EntryFlags::DISABLE_UNDERLYING_DATA);
        let result = cache
            .get_or_create_with("k", |_| async { Ok(1u32) }, &options, &CancellationToken::new())
            .await;
        assert_matches!(result, Err(CacheError::Miss { ref key }) if key == "k");
    }

    #[tokio::test]
    async fn test_l2_hit_populates_l1() {
        let (cache, store) = cache_with_l2();
        cache.set("k", Frozen(7)).await.unwrap();
        assert!(store.contains("k"));

        // A second cache instance shares only the distributed store
        let other = HybridCache::builder(HybridCacheConfig::default())
            .distributed_store(store.clone())
            .build()
            .unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let value = other
            .get_or_create("k", {
                let calls = calls.clone();
                move |_| async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(Frozen(0))
                }
            })
            .await
            .unwrap();

        assert_eq!(value, Frozen(7));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(other.metrics().l2_hits, 1);

        store.set_fail_reads(true);
        let again: Option<Frozen> = other.get("k", &EntryOptions::new()).await.unwrap();
        assert_eq!(again, Some(Frozen(7)));
    }

    #[tokio::test]
    async fn test_corrupt_l2_value_is_a_miss() {
        let (cache, store) = cache_with_l2();
        store
            .set(
                "k",
                bytes::Bytes::from_static(b"not json"),
                &crate::cache::distributed::DistributedEntryOptions {
                    expiration: Duration::from_secs(60),
                },
            )
            .await
            .unwrap();

        let value = cache.get_or_create("k", |_| async { Ok(11u32) }).await.unwrap();
        assert_eq!(value, 11);
    }

    #[tokio::test]
    async fn test_invalid_keys_bypass_the_cache() {
        let config = HybridCacheConfig {
            maximum_key_length: 8,
            ..Default::default()
        };
        let cache = HybridCache::new(config).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let value = cache
                .get_or_create("much-too-long-key", counting(&calls, 3))
                .await
                .unwrap();
            assert_eq!(value, 3);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.metrics().invalid_keys, 2);

        assert_matches!(cache.set("", 1u32).await, Err(CacheError::InvalidKey(_)));
    }

    #[tokio::test]
    async fn test_oversized_payload_is_returned_not_stored() {
        let config = HybridCacheConfig {
            maximum_payload_bytes: 16,
            ..Default::default()
        };
        let cache = HybridCache::new(config).unwrap();

        let big = vec![1u8; 64];
        let value = cache
            .get_or_create("big", {
                let big = big.clone();
                move |_| async move { Ok(big) }
            })
            .await
            .unwrap();
        assert_eq!(value, big);

        let cached: Option<Vec<u8>> = cache.get("big", &EntryOptions::new()).await.unwrap();
        assert!(cached.is_none());
        assert_eq!(cache.metrics().oversized_payloads, 1);

        assert_matches!(
            cache.set("big", big).await,
            Err(CacheError::PayloadTooLarge { maximum: 16, .. })
        );
    }

    #[tokio::test]
    async fn test_disable_local_cache_writes_only_l2() {
        let (cache, store) = cache_with_l2();
        let options = EntryOptions::new().with_flags(EntryFlags::DISABLE_LOCAL_CACHE);
        cache
            .get_or_create_with("k", |_| async { Ok(4u32) }, &options, &CancellationToken::new())
            .await
            .unwrap();

        assert!(store.contains("k"));
        assert_eq!(cache.metrics().l1_writes, 0);
    }

    #[tokio::test]
    async fn test_remove_key_clears_both_tiers() {
        let (cache, store) = cache_with_l2();
        cache.set("k", 1u32).await.unwrap();
        cache.remove_key("k").await;

        assert!(!store.contains("k"));
        let value: Option<u32> = cache.get("k", &EntryOptions::new()).await.unwrap();
        assert_eq!(value, None);
    }

    #[tokio::test]
    async fn test_buffers_return_to_pool() {
        let cache = HybridCache::new(HybridCacheConfig::default()).unwrap();
        let profile = Profile {
            name: "grace".into(),
            visits: 3,
        };
        cache.set("p", profile.clone()).await.unwrap();
        for _ in 0..10 {
            let read: Profile = cache.get("p", &EntryOptions::new()).await.unwrap().unwrap();
            assert_eq!(read, profile);
        }
        let idle_before = cache.buffer_pool_stats().idle;

        cache.remove_key("p").await;
        assert_eq!(cache.buffer_pool_stats().idle, idle_before + 1);
    }
}
