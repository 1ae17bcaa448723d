//! Hybrid Cache - Two-Level Read-Through Caching
//!
//! An in-process cache (L1) in front of an optional distributed cache (L2),
//! with a single value factory per key however many callers miss at once.
//!
//! # Architecture
//!
//! ```text
//! caller ─► L1 ─► stampede coordinator ─► L2 ─► value factory
//!                        │
//!                        └─► one shared outcome for every waiting caller
//! ```
//!
//! # Features
//!
//! - Stampede suppression with per-caller cancellation
//! - Shared instances for immutable types, fresh copies for everything else
//! - Pooled, reference-counted payload buffers
//! - Configurable distributed write failure policy
//! - Prometheus metrics
//!
//! # Modules
//!
//! - [`cache`] - Tiers, coordinator, classifier and the [`HybridCache`] facade
//! - [`config`] - Cache configuration
//! - [`error`] - Error types

pub mod cache;
pub mod config;
pub mod error;

// Re-export commonly used types
pub use cache::{
    CacheValue, DistributedStore, EntryFlags, EntryOptions, HybridCache, HybridCacheBuilder,
    InMemoryDistributedStore, LocalStore, MetricsSnapshot, TypeShape,
};
pub use config::{DistributedWritePolicy, HybridCacheConfig};
pub use error::{CacheError, Result};
pub use tokio_util::sync::CancellationToken;
