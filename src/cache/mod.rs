//! Two-Level Hybrid Cache
//!
//! Read-through caching over an in-process tier (L1) and an optional
//! distributed tier (L2), with at most one value factory running per key.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                           HybridCache                                    │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  L1 (LocalStore)        │ Coordinator            │ L2 (DistributedTier)  │
//! │  ┌──────────────────┐   │ ┌──────────────────┐   │ ┌──────────────────┐  │
//! │  │ DashMap entries  │   │ │ one generation   │   │ │ DistributedStore │  │
//! │  │ shared or pooled │   │ │ per key, shared  │   │ │ + write policy   │  │
//! │  │ buffers          │   │ │ outcome          │   │ │                  │  │
//! │  └──────────────────┘   │ └──────────────────┘   │ └──────────────────┘  │
//! │         │               │          │             │          │            │
//! │         └───────────────┴──────────┴─────────────┴──────────┘            │
//! │                              │                                           │
//! │               BufferPool (refcounted, recycled arrays)                   │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Guarantees
//!
//! - One factory execution per key generation, however many callers arrive
//! - A caller cancelling only detaches that caller
//! - The factory is cancelled only once every caller has detached
//! - Immutable values are shared by reference; everything else is decoded
//!   into a fresh copy per read
//! - A pooled buffer is never read after it has been recycled

pub mod buffer;
pub mod classify;
pub mod distributed;
pub mod entry;
pub mod hybrid;
pub mod key;
pub mod local;
pub mod metrics;
pub mod options;
pub mod stampede;

mod proptest;

pub use buffer::{BufferHandle, BufferLease, BufferPool, BufferPoolConfig, BufferPoolStats, PooledWriter};
pub use classify::{classify, CacheValue, Classification, Disposal, ShapeKind, TypeShape};
pub use distributed::{
    BufferedDistributedStore, DistributedEntryOptions, DistributedStore, DistributedTier,
    InMemoryDistributedStore,
};
pub use entry::{CacheEntry, LocalHit, SharedInstance};
pub use hybrid::{HybridCache, HybridCacheBuilder};
pub use key::CacheKey;
pub use local::{L1Cache, LocalConfig, LocalStats, LocalStore};
pub use metrics::{CacheMetrics, MetricsSnapshot, PrometheusExporter};
pub use options::{EntryFlags, EntryOptions, ResolvedOptions};

/// Default local tier capacity (256MB)
pub const DEFAULT_LOCAL_CAPACITY: u64 = 256 * 1024 * 1024;

/// Default maximum serialized payload (1MB)
pub const DEFAULT_MAXIMUM_PAYLOAD_BYTES: usize = 1024 * 1024;

/// Default maximum key length in bytes
pub const DEFAULT_MAXIMUM_KEY_LENGTH: usize = 1024;

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits() {
        assert_eq!(DEFAULT_LOCAL_CAPACITY, 256 * 1024 * 1024);
        assert_eq!(DEFAULT_MAXIMUM_PAYLOAD_BYTES, 1024 * 1024);
        assert_eq!(DEFAULT_MAXIMUM_KEY_LENGTH, 1024);
    }

    #[test]
    fn test_payload_limit_fits_pooled_buffers() {
        assert!(DEFAULT_MAXIMUM_PAYLOAD_BYTES <= BufferPoolConfig::default().max_pooled_capacity);
    }
}
