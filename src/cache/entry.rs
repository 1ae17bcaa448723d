//! Cache Entry Types
//!
//! One materialized value in the local tier: either a live shared instance
//! or a reference-counted serialized buffer, plus expiry and access metadata.
//!
//! An entry owns exactly one count on its buffer. Dropping the entry (after
//! eviction, expiry, removal or being superseded) releases that count and,
//! for retained disposable instances, runs the disposal hook once.

use std::any::{Any, TypeId};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;

use super::buffer::{BufferHandle, BufferLease};
use super::classify::{classify, CacheValue, Classification, Disposal};

static NEXT_ENTRY_ID: AtomicU64 = AtomicU64::new(1);

/// Type-erased retained instance
trait ErasedValue: Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn value_type(&self) -> TypeId;
    fn release(self: Arc<Self>) -> Option<BoxFuture<'static, ()>>;
}

struct Retained<T>(Arc<T>);

impl<T: CacheValue> ErasedValue for Retained<T> {
    fn as_any(&self) -> &dyn Any {
        &self.0
    }

    fn value_type(&self) -> TypeId {
        TypeId::of::<T>()
    }

    fn release(self: Arc<Self>) -> Option<BoxFuture<'static, ()>> {
        match T::shape().disposal {
            Disposal::None => None,
            Disposal::Sync => {
                self.0.dispose();
                None
            }
            Disposal::Async => Some(Box::pin(async move { self.0.dispose_async().await })),
        }
    }
}

/// A live instance shared by reference between readers
#[derive(Clone)]
pub struct SharedInstance(Arc<dyn ErasedValue>);

impl SharedInstance {
    /// Wrap a value
    pub fn new<T: CacheValue>(value: T) -> Self {
        Self::from_arc(Arc::new(value))
    }

    /// Wrap an already shared value without copying it
    pub fn from_arc<T: CacheValue>(value: Arc<T>) -> Self {
        Self(Arc::new(Retained(value)))
    }

    /// Borrow as `T`, if that is the stored type
    pub fn downcast_ref<T: CacheValue>(&self) -> Option<&T> {
        self.0.as_any().downcast_ref::<Arc<T>>().map(|value| &**value)
    }

    /// The stored `Arc<T>` itself, if that is the stored type
    pub fn downcast_arc<T: CacheValue>(&self) -> Option<Arc<T>> {
        self.0.as_any().downcast_ref::<Arc<T>>().cloned()
    }

    /// Type of the stored value
    pub fn value_type(&self) -> TypeId {
        self.0.value_type()
    }

    /// True if both refer to the same instance
    pub fn ptr_eq(&self, other: &SharedInstance) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    fn release(&self) -> Option<BoxFuture<'static, ()>> {
        Arc::clone(&self.0).release()
    }
}

impl std::fmt::Debug for SharedInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SharedInstance")
            .field(&self.value_type())
            .finish()
    }
}

/// Payload of a cache entry
#[derive(Debug)]
pub enum Payload {
    /// Live instance of an immutable-shareable type
    Shared(SharedInstance),
    /// Serialized bytes, deserialized per reader
    Buffer(BufferHandle),
}

/// What a local-tier read hands back
#[derive(Debug, Clone)]
pub enum LocalHit {
    /// Shared instance, handed out by reference
    Shared(SharedInstance),
    /// Reserved buffer holding bytes of the given type; released when the
    /// hit is dropped
    Buffer(BufferLease, TypeId),
}

impl LocalHit {
    /// Type the hit was produced for
    pub fn value_type(&self) -> TypeId {
        match self {
            LocalHit::Shared(instance) => instance.value_type(),
            LocalHit::Buffer(_, value_type) => *value_type,
        }
    }

    /// True if the hit was produced for `T`
    #[inline]
    pub fn serves<T: CacheValue>(&self) -> bool {
        self.value_type() == TypeId::of::<T>()
    }

    /// Materialize as an owned `T`. Shared instances are cloned.
    ///
    /// `None` means the stored value cannot serve this type and the read must
    /// be treated as a miss.
    pub fn into_value<T: CacheValue>(self) -> Option<crate::error::Result<T>> {
        match self {
            LocalHit::Shared(instance) => instance.downcast_ref::<T>().cloned().map(Ok),
            LocalHit::Buffer(lease, value_type) if value_type == TypeId::of::<T>() => {
                Some(T::decode(&lease.bytes()))
            }
            LocalHit::Buffer(..) => None,
        }
    }

    /// Materialize as an `Arc<T>`. Instances of immutable-shareable types
    /// are handed out by reference; anything else gets a fresh allocation.
    pub fn into_shared<T: CacheValue>(self) -> Option<crate::error::Result<Arc<T>>> {
        match self {
            LocalHit::Shared(instance) if classify::<T>().is_immutable_shareable => {
                instance.downcast_arc::<T>().map(Ok)
            }
            LocalHit::Shared(instance) => instance.downcast_ref::<T>().cloned().map(|v| Ok(Arc::new(v))),
            LocalHit::Buffer(lease, value_type) if value_type == TypeId::of::<T>() => {
                Some(T::decode(&lease.bytes()).map(Arc::new))
            }
            LocalHit::Buffer(..) => None,
        }
    }
}

/// Access metadata for an entry
#[derive(Debug)]
pub struct EntryMetadata {
    /// Creation time
    created_at: Instant,
    /// Last access, milliseconds after `created_at`
    last_access_ms: AtomicU64,
    /// Access count for frequency-based eviction
    access_count: AtomicU32,
}

impl EntryMetadata {
    fn new() -> Self {
        Self {
            created_at: Instant::now(),
            last_access_ms: AtomicU64::new(0),
            access_count: AtomicU32::new(1),
        }
    }

    /// Record an access and return the new count
    #[inline]
    pub fn record_access(&self) -> u32 {
        let elapsed = self.created_at.elapsed().as_millis() as u64;
        self.last_access_ms.store(elapsed, Ordering::Relaxed);
        self.access_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Get access count
    #[inline]
    pub fn access_count(&self) -> u32 {
        self.access_count.load(Ordering::Relaxed)
    }

    /// Creation time
    #[inline]
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Time since the last access
    pub fn idle(&self) -> Duration {
        let last = Duration::from_millis(self.last_access_ms.load(Ordering::Relaxed));
        self.created_at.elapsed().saturating_sub(last)
    }

    /// Calculate eviction score (higher = more likely to evict)
    pub fn eviction_score(&self) -> f64 {
        let age = self.idle().as_secs_f64();
        let frequency = self.access_count() as f64;
        age / (frequency + 1.0)
    }
}

/// One cached value in the local tier
pub struct CacheEntry {
    /// Unique id, used to detect supersession
    id: u64,
    /// Value or bytes
    payload: Payload,
    /// Classification of the value type
    classification: Classification,
    /// Type the entry was produced for
    value_type: TypeId,
    /// Entries past this instant are absent
    expire_at: Instant,
    /// Approximate footprint in bytes
    size: u64,
    /// Set once the local tier accepted the entry
    retained: AtomicBool,
    /// Access metadata
    pub metadata: EntryMetadata,
}

impl CacheEntry {
    fn build(
        payload: Payload,
        classification: Classification,
        value_type: TypeId,
        size: u64,
        ttl: Duration,
    ) -> Self {
        let metadata = EntryMetadata::new();
        let expire_at = metadata
            .created_at()
            .checked_add(ttl)
            .unwrap_or_else(|| metadata.created_at() + Duration::from_secs(u32::MAX as u64));
        Self {
            id: NEXT_ENTRY_ID.fetch_add(1, Ordering::Relaxed),
            payload,
            classification,
            value_type,
            expire_at,
            size,
            retained: AtomicBool::new(false),
            metadata,
        }
    }

    /// Entry holding a live shared instance
    pub fn shared<T: CacheValue>(value: T, size: u64, ttl: Duration) -> Self {
        Self::shared_instance::<T>(SharedInstance::new(value), size, ttl)
    }

    /// Entry holding an already wrapped shared instance
    pub fn shared_instance<T: CacheValue>(instance: SharedInstance, size: u64, ttl: Duration) -> Self {
        Self::build(
            Payload::Shared(instance),
            classify::<T>(),
            TypeId::of::<T>(),
            size,
            ttl,
        )
    }

    /// Entry holding serialized bytes; takes over the handle's creation count
    pub fn buffered<T: CacheValue>(handle: BufferHandle, ttl: Duration) -> Self {
        let size = handle.len() as u64;
        Self::build(
            Payload::Buffer(handle),
            classify::<T>(),
            TypeId::of::<T>(),
            size,
            ttl,
        )
    }

    /// Unique id
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Payload
    #[inline]
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Classification of the value type
    #[inline]
    pub fn classification(&self) -> Classification {
        self.classification
    }

    /// Type the entry was produced for
    #[inline]
    pub fn value_type(&self) -> TypeId {
        self.value_type
    }

    /// Expiry instant
    #[inline]
    pub fn expire_at(&self) -> Instant {
        self.expire_at
    }

    /// Approximate footprint in bytes
    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Check if expired
    #[inline]
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expire_at
    }

    /// Record access
    #[inline]
    pub fn record_access(&self) -> u32 {
        self.metadata.record_access()
    }

    /// Hand the value to a reader.
    ///
    /// Buffer payloads are reserved for the reader; `None` means the buffer
    /// was already recycled and the read is a miss.
    pub fn read(&self) -> Option<LocalHit> {
        match &self.payload {
            Payload::Shared(instance) => Some(LocalHit::Shared(instance.clone())),
            Payload::Buffer(handle) => handle
                .reserve_for_read()
                .map(|lease| LocalHit::Buffer(lease, self.value_type)),
        }
    }

    /// Mark the entry as held by the local tier
    pub(crate) fn mark_retained(&self) {
        self.retained.store(true, Ordering::Release);
    }

    fn dispose(&self) {
        let Payload::Shared(instance) = &self.payload else {
            return;
        };
        if !self.classification.needs_eviction_callback || !self.retained.load(Ordering::Acquire) {
            return;
        }
        if let Some(fut) = instance.release() {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(fut);
                }
                Err(_) => {
                    tracing::warn!(entry = self.id, "no runtime available for async disposal");
                }
            }
        }
    }
}

impl Drop for CacheEntry {
    fn drop(&mut self) {
        self.dispose();
        if let Payload::Buffer(handle) = &self.payload {
            handle.release();
        }
    }
}

impl std::fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEntry")
            .field("id", &self.id)
            .field("size", &self.size)
            .field("shareable", &self.classification.is_immutable_shareable)
            .field("access_count", &self.metadata.access_count())
            .field("is_expired", &self.is_expired())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
