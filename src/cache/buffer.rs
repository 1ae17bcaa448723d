//! Pooled Buffers with Reference-Counted Recycling
//!
//! Serialized cache payloads live in byte arrays rented from a [`BufferPool`].
//! A [`BufferHandle`] wraps one such array with an atomic reference count:
//!
//! ```text
//!   create ──► count = 1 (held by the cache entry)
//!                 │
//!   reserve_for_read ──► count + 1 ──► lease dropped ──► count - 1
//!                 │
//!   entry evicted ──► release ──► count - 1
//!                 │
//!              count == 0 ──► array returned to the pool, handle is dead
//! ```
//!
//! A dead handle can never be revived: reservation only succeeds while the
//! count is strictly positive. The raw array is never exposed except through
//! a live [`BufferLease`].

use std::io;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam::queue::ArrayQueue;
use parking_lot::{MappedRwLockReadGuard, RwLock, RwLockReadGuard};
use serde::{Deserialize, Serialize};

/// Buffer pool configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferPoolConfig {
    /// Maximum number of idle buffers kept for reuse
    pub max_pooled_buffers: usize,
    /// Buffers whose capacity grew beyond this are discarded, not pooled
    pub max_pooled_capacity: usize,
    /// Capacity of a freshly allocated buffer
    pub initial_capacity: usize,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self {
            max_pooled_buffers: 256,
            max_pooled_capacity: 1024 * 1024, // 1MB
            initial_capacity: 1024,
        }
    }
}

/// Pool of reusable byte arrays
#[derive(Debug)]
pub struct BufferPool {
    /// Idle buffers
    free: ArrayQueue<Vec<u8>>,
    /// Configuration
    config: BufferPoolConfig,
    /// Buffers handed out
    rented: AtomicU64,
    /// Buffers served from the free list
    reused: AtomicU64,
    /// Buffers accepted back into the free list
    returned: AtomicU64,
    /// Buffers dropped instead of pooled (oversized or pool full)
    discarded: AtomicU64,
}

impl BufferPool {
    /// Create a pool with default configuration
    pub fn new() -> Arc<Self> {
        Self::with_config(BufferPoolConfig::default())
    }

    /// Create a pool with custom configuration
    pub fn with_config(config: BufferPoolConfig) -> Arc<Self> {
        Arc::new(Self {
            free: ArrayQueue::new(config.max_pooled_buffers.max(1)),
            config,
            rented: AtomicU64::new(0),
            reused: AtomicU64::new(0),
            returned: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
        })
    }

    /// Rent an empty buffer with at least `min_capacity` bytes of capacity
    pub fn rent(&self, min_capacity: usize) -> Vec<u8> {
        self.rented.fetch_add(1, Ordering::Relaxed);
        match self.free.pop() {
            Some(mut buf) => {
                self.reused.fetch_add(1, Ordering::Relaxed);
                buf.reserve(min_capacity);
                buf
            }
            None => Vec::with_capacity(min_capacity.max(self.config.initial_capacity)),
        }
    }

    /// Return a buffer to the pool
    pub fn give_back(&self, mut buf: Vec<u8>) {
        if buf.capacity() == 0 || buf.capacity() > self.config.max_pooled_capacity {
            self.discarded.fetch_add(1, Ordering::Relaxed);
            return;
        }
        buf.clear();
        match self.free.push(buf) {
            Ok(()) => {
                self.returned.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.discarded.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Start a pooled output sink
    pub fn writer(self: &Arc<Self>) -> PooledWriter {
        PooledWriter {
            buf: Some(self.rent(self.config.initial_capacity)),
            pool: Arc::clone(self),
        }
    }

    /// Wrap already-filled bytes in a live handle
    pub fn create(self: &Arc<Self>, bytes: &[u8]) -> BufferHandle {
        let mut buf = self.rent(bytes.len());
        buf.extend_from_slice(bytes);
        BufferHandle::from_vec(buf, Arc::clone(self))
    }

    /// Number of idle buffers
    pub fn idle(&self) -> usize {
        self.free.len()
    }

    /// Pool statistics
    pub fn stats(&self) -> BufferPoolStats {
        BufferPoolStats {
            rented: self.rented.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            returned: self.returned.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            idle: self.idle(),
        }
    }
}

/// Buffer pool statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BufferPoolStats {
    /// Buffers handed out
    pub rented: u64,
    /// Rentals served from the free list
    pub reused: u64,
    /// Buffers accepted back
    pub returned: u64,
    /// Buffers dropped instead of pooled
    pub discarded: u64,
    /// Idle buffers right now
    pub idle: usize,
}

struct BufferInner {
    /// Live holders: the owning entry plus every outstanding lease
    ref_count: AtomicU32,
    /// Payload length, stable for the life of the handle
    len: usize,
    /// Backing array; `None` once recycled
    data: RwLock<Option<Vec<u8>>>,
    /// Where the array goes when the count reaches zero
    pool: Arc<BufferPool>,
}

/// Reference-counted view over a pooled byte array.
///
/// Cloning the handle copies the pointer only; it does not take a
/// reservation. Use [`reserve_for_read`](Self::reserve_for_read) to read.
#[derive(Clone)]
pub struct BufferHandle {
    inner: Arc<BufferInner>,
}

impl BufferHandle {
    pub(crate) fn from_vec(buf: Vec<u8>, pool: Arc<BufferPool>) -> Self {
        Self {
            inner: Arc::new(BufferInner {
                ref_count: AtomicU32::new(1),
                len: buf.len(),
                data: RwLock::new(Some(buf)),
                pool,
            }),
        }
    }

    /// Payload length in bytes
    #[inline]
    pub fn len(&self) -> usize {
        self.inner.len
    }

    /// True for an empty payload
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inner.len == 0
    }

    /// Current reference count (0 means recycled)
    #[inline]
    pub fn ref_count(&self) -> u32 {
        self.inner.ref_count.load(Ordering::Acquire)
    }

    /// True once the backing array has been returned to the pool
    #[inline]
    pub fn is_recycled(&self) -> bool {
        self.ref_count() == 0
    }

    /// Increment the count iff it is still positive.
    ///
    /// Returns `false` for a recycled buffer; the caller must treat that as
    /// a cache miss.
    pub fn try_reserve(&self) -> bool {
        let mut current = self.inner.ref_count.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return false;
            }
            match self.inner.ref_count.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    /// Reserve the buffer for the duration of a read
    pub fn reserve_for_read(&self) -> Option<BufferLease> {
        if self.try_reserve() {
            Some(BufferLease {
                handle: self.clone(),
            })
        } else {
            None
        }
    }

    /// Drop one count. The transition to zero recycles the array.
    ///
    /// Must be paired with the implicit count taken at creation or with a
    /// successful [`try_reserve`](Self::try_reserve). Returns `true` if this
    /// call recycled the buffer.
    pub fn release(&self) -> bool {
        let mut current = self.inner.ref_count.load(Ordering::Acquire);
        loop {
            if current == 0 {
                tracing::error!("buffer released more times than reserved");
                return false;
            }
            match self.inner.ref_count.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(1) => {
                    self.recycle();
                    return true;
                }
                Ok(_) => return false,
                Err(observed) => current = observed,
            }
        }
    }

    fn recycle(&self) {
        let taken = self.inner.data.write().take();
        if let Some(buf) = taken {
            self.inner.pool.give_back(buf);
        }
    }

    /// Turn the count this handle was created with into a lease
    pub fn into_lease(self) -> BufferLease {
        BufferLease { handle: self }
    }

    /// True if both handles refer to the same buffer
    pub fn ptr_eq(&self, other: &BufferHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for BufferHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferHandle")
            .field("len", &self.len())
            .field("ref_count", &self.ref_count())
            .finish()
    }
}

/// A live reservation on a [`BufferHandle`]; released on drop
pub struct BufferLease {
    handle: BufferHandle,
}

impl BufferLease {
    /// Borrow the payload bytes
    pub fn bytes(&self) -> MappedRwLockReadGuard<'_, [u8]> {
        RwLockReadGuard::map(self.handle.inner.data.read(), |data| {
            // A positive count keeps the array in place
            data.as_deref().unwrap_or(&[])
        })
    }

    /// Copy the payload into a new vector
    pub fn to_vec(&self) -> Vec<u8> {
        self.bytes().to_vec()
    }

    /// Payload length
    pub fn len(&self) -> usize {
        self.handle.len()
    }

    /// True for an empty payload
    pub fn is_empty(&self) -> bool {
        self.handle.is_empty()
    }

    /// The underlying handle
    pub fn handle(&self) -> &BufferHandle {
        &self.handle
    }

    /// Take one more count for a long-lived owner such as a cache entry.
    ///
    /// The returned handle carries that count; the owner must release it.
    pub fn retain(&self) -> BufferHandle {
        // This lease keeps the count positive
        let reserved = self.handle.try_reserve();
        debug_assert!(reserved);
        self.handle.clone()
    }
}

impl Clone for BufferLease {
    fn clone(&self) -> Self {
        // The existing lease keeps the count positive, so this cannot fail
        let reserved = self.handle.try_reserve();
        debug_assert!(reserved);
        Self {
            handle: self.handle.clone(),
        }
    }
}

impl Drop for BufferLease {
    fn drop(&mut self) {
        self.handle.release();
    }
}

impl std::fmt::Debug for BufferLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferLease")
            .field("handle", &self.handle)
            .finish()
    }
}

/// Growable output sink backed by a pooled array.
///
/// Serializers and distributed stores write into it directly; the filled
/// array then becomes a [`BufferHandle`] without another copy.
pub struct PooledWriter {
    buf: Option<Vec<u8>>,
    pool: Arc<BufferPool>,
}

impl PooledWriter {
    /// Bytes written so far
    pub fn len(&self) -> usize {
        self.buf.as_ref().map_or(0, Vec::len)
    }

    /// True if nothing was written
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Written bytes
    pub fn as_slice(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or(&[])
    }

    /// Append bytes
    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        if let Some(buf) = self.buf.as_mut() {
            buf.extend_from_slice(bytes);
        }
    }

    /// Discard everything written so far, keeping the allocation
    pub fn clear(&mut self) {
        if let Some(buf) = self.buf.as_mut() {
            buf.clear();
        }
    }

    /// Freeze the written bytes into a live handle with count 1
    pub fn into_handle(mut self) -> BufferHandle {
        let buf = self.buf.take().unwrap_or_default();
        BufferHandle::from_vec(buf, Arc::clone(&self.pool))
    }
}

impl io::Write for PooledWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for PooledWriter {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.give_back(buf);
        }
    }
}

impl std::fmt::Debug for PooledWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledWriter")
            .field("len", &self.len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_create_starts_with_one_count() {
        let pool = BufferPool::new();
        let handle = pool.create(b"payload");

        assert_eq!(handle.ref_count(), 1);
        assert_eq!(handle.len(), 7);
        assert!(!handle.is_recycled());
    }

    #[test]
    fn test_lease_reads_and_releases() {
        let pool = BufferPool::new();
        let handle = pool.create(b"hello");

        {
            let lease = handle.reserve_for_read().unwrap();
            assert_eq!(handle.ref_count(), 2);
            assert_eq!(&*lease.bytes(), b"hello");
        }
        assert_eq!(handle.ref_count(), 1);
    }

    #[test]
    fn test_release_to_zero_recycles() {
        let pool = BufferPool::new();
        let handle = pool.create(b"data");

        assert!(handle.release());
        assert!(handle.is_recycled());
        assert_eq!(pool.stats().returned, 1);
        assert!(handle.reserve_for_read().is_none());
    }

    #[test]
    fn test_entry_release_waits_for_readers() {
        let pool = BufferPool::new();
        let handle = pool.create(b"shared");
        let lease = handle.reserve_for_read().unwrap();

        // Entry evicted while a reader is active
        assert!(!handle.release());
        assert!(!handle.is_recycled());
        assert_eq!(&*lease.bytes(), b"shared");

        drop(lease);
        assert!(handle.is_recycled());
        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn test_lease_clone_takes_its_own_count() {
        let pool = BufferPool::new();
        let handle = pool.create(b"x");
        let lease = handle.reserve_for_read().unwrap();
        let second = lease.clone();

        assert_eq!(handle.ref_count(), 3);
        drop(lease);
        drop(second);
        assert_eq!(handle.ref_count(), 1);
    }

    #[test]
    fn test_into_lease_owns_creation_count() {
        let pool = BufferPool::new();
        let lease = pool.create(b"owned").into_lease();
        let handle = lease.handle().clone();
        assert_eq!(handle.ref_count(), 1);

        let retained = lease.retain();
        assert_eq!(handle.ref_count(), 2);
        drop(lease);
        assert!(!handle.is_recycled());

        assert!(retained.release());
        assert!(handle.is_recycled());
    }

    #[test]
    fn test_recycled_buffer_is_reused() {
        let pool = BufferPool::new();
        let handle = pool.create(&[7u8; 64]);
        handle.release();

        let buf = pool.rent(16);
        assert!(buf.is_empty());
        assert!(buf.capacity() >= 64);
        assert_eq!(pool.stats().reused, 1);
    }

    #[test]
    fn test_oversized_buffers_are_discarded() {
        let pool = BufferPool::with_config(BufferPoolConfig {
            max_pooled_capacity: 16,
            ..Default::default()
        });
        pool.give_back(Vec::with_capacity(1024));

        assert_eq!(pool.idle(), 0);
        assert_eq!(pool.stats().discarded, 1);
    }

    #[test]
    fn test_full_pool_discards() {
        let pool = BufferPool::with_config(BufferPoolConfig {
            max_pooled_buffers: 1,
            ..Default::default()
        });
        pool.give_back(Vec::with_capacity(8));
        pool.give_back(Vec::with_capacity(8));

        assert_eq!(pool.idle(), 1);
        assert_eq!(pool.stats().discarded, 1);
    }

    #[test]
    fn test_writer_into_handle() {
        let pool = BufferPool::new();
        let mut writer = pool.writer();
        writer.write_all(b"abc").unwrap();
        writer.extend_from_slice(b"def");
        assert_eq!(writer.as_slice(), b"abcdef");

        let handle = writer.into_handle();
        let lease = handle.reserve_for_read().unwrap();
        assert_eq!(&*lease.bytes(), b"abcdef");
    }

    #[test]
    fn test_dropped_writer_returns_buffer() {
        let pool = BufferPool::new();
        {
            let mut writer = pool.writer();
            writer.extend_from_slice(b"abandoned");
        }
        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn test_concurrent_reservations_balance() {
        let pool = BufferPool::new();
        let handle = pool.create(&[1u8; 128]);

        std::thread::scope(|scope| {
            for _ in 0..8 {
                let handle = handle.clone();
                scope.spawn(move || {
                    for _ in 0..1000 {
                        let lease = handle.reserve_for_read().unwrap();
                        assert_eq!(lease.len(), 128);
                    }
                });
            }
        });

        assert_eq!(handle.ref_count(), 1);
    }
}
