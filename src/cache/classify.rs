//! Value Type Classification
//!
//! Decides, once per type, whether cached instances may be handed to many
//! concurrent readers by reference (immutable-shareable) or must be
//! reconstructed from serialized bytes for every reader (copy-per-read).
//!
//! | Shape                         | Shareable | Notes                         |
//! |-------------------------------|-----------|-------------------------------|
//! | primitive / text              | yes       |                               |
//! | blittable plain data          | yes       | copied by value on every read |
//! | declared immutable, sealed    | yes       |                               |
//! | declared immutable, open      | no        | an extension may mutate       |
//! | anything else                 | no        |                               |
//!
//! A retained shared instance whose type declares a disposal contract must
//! be disposed by the cache when it leaves the local tier.

use std::any::TypeId;
use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::buffer::PooledWriter;
use crate::error::Result;

/// Structural category of a type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShapeKind {
    /// Fixed-size numeric, boolean or character types
    Primitive,
    /// Immutable text
    Text,
    /// Plain data copied on every pass-by-value access
    Blittable,
    /// A type that declares its own mutability contract
    Declared {
        /// Instances never change after construction
        immutable: bool,
        /// No foreign extension can alter the contract (no open trait
        /// objects or caller-supplied behaviour inside)
        sealed: bool,
    },
    /// Mutable or unknown
    Mutable,
}

/// Disposal contract exposed by a type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposal {
    /// Nothing to release
    None,
    /// [`CacheValue::dispose`] must be called
    Sync,
    /// [`CacheValue::dispose_async`] must be awaited
    Async,
}

/// Declared shape of a cacheable type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeShape {
    /// Structural category
    pub kind: ShapeKind,
    /// Disposal contract
    pub disposal: Disposal,
}

impl TypeShape {
    /// Fixed-size primitive
    pub const PRIMITIVE: TypeShape = TypeShape::new(ShapeKind::Primitive);
    /// Immutable text
    pub const TEXT: TypeShape = TypeShape::new(ShapeKind::Text);
    /// Plain data copied by value
    pub const BLITTABLE: TypeShape = TypeShape::new(ShapeKind::Blittable);
    /// Mutable or unknown (the default)
    pub const MUTABLE: TypeShape = TypeShape::new(ShapeKind::Mutable);
    /// Declared immutable with no extension points
    pub const IMMUTABLE: TypeShape = TypeShape::new(ShapeKind::Declared {
        immutable: true,
        sealed: true,
    });

    /// Shape with no disposal contract
    pub const fn new(kind: ShapeKind) -> Self {
        Self {
            kind,
            disposal: Disposal::None,
        }
    }

    /// Add a disposal contract
    pub const fn with_disposal(mut self, disposal: Disposal) -> Self {
        self.disposal = disposal;
        self
    }
}

/// Result of classifying a type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    /// Instances may be shared by reference between readers
    pub is_immutable_shareable: bool,
    /// The cache must dispose retained instances on eviction
    pub needs_eviction_callback: bool,
}

impl Classification {
    /// Classify a shape. Pure; see [`classify`] for the memoized form.
    pub const fn of_shape(shape: TypeShape) -> Self {
        let disposable = !matches!(shape.disposal, Disposal::None);
        let shareable = match shape.kind {
            ShapeKind::Primitive | ShapeKind::Text => true,
            // Plain data never carries a disposal contract
            ShapeKind::Blittable => !disposable,
            ShapeKind::Declared { immutable, sealed } => immutable && sealed,
            ShapeKind::Mutable => false,
        };

        Self {
            is_immutable_shareable: shareable,
            needs_eviction_callback: shareable && disposable,
        }
    }
}

/// Process-wide classification table, append-only
static CLASSIFICATIONS: Lazy<DashMap<TypeId, Classification>> = Lazy::new(DashMap::new);

/// Classify `T`, computing at most once per type for the process lifetime.
///
/// The first stored classification wins; every later call returns it.
pub fn classify<T: CacheValue>() -> Classification {
    let id = TypeId::of::<T>();
    if let Some(existing) = CLASSIFICATIONS.get(&id) {
        return *existing;
    }
    let computed = Classification::of_shape(T::shape());
    *CLASSIFICATIONS.entry(id).or_insert(computed)
}

/// Number of types classified so far
pub fn classified_types() -> usize {
    CLASSIFICATIONS.len()
}

/// A value that can be stored in the hybrid cache.
///
/// The default codec is JSON via `serde_json`; override [`encode`] and
/// [`decode`] for a different wire form.
///
/// [`encode`]: CacheValue::encode
/// [`decode`]: CacheValue::decode
#[async_trait]
pub trait CacheValue: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Declared shape used by the classifier
    fn shape() -> TypeShape
    where
        Self: Sized,
    {
        TypeShape::MUTABLE
    }

    /// Serialize into a pooled sink
    fn encode(&self, sink: &mut PooledWriter) -> Result<()> {
        serde_json::to_writer(sink, self)?;
        Ok(())
    }

    /// Deserialize from bytes
    fn decode(bytes: &[u8]) -> Result<Self>
    where
        Self: Sized,
    {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Synchronous disposal hook for [`Disposal::Sync`] types
    fn dispose(&self) {}

    /// Asynchronous disposal hook for [`Disposal::Async`] types
    async fn dispose_async(&self) {}
}

macro_rules! primitive_cache_value {
    ($($ty:ty),* $(,)?) => {
        $(
            impl CacheValue for $ty {
                fn shape() -> TypeShape {
                    TypeShape::PRIMITIVE
                }
            }
        )*
    };
}

primitive_cache_value!(
    u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128, isize, f32, f64, bool, char,
);

impl CacheValue for String {
    fn shape() -> TypeShape {
        TypeShape::TEXT
    }
}

impl CacheValue for Box<str> {
    fn shape() -> TypeShape {
        TypeShape::TEXT
    }
}

impl<T: CacheValue> CacheValue for Option<T> {
    fn shape() -> TypeShape {
        match T::shape() {
            TypeShape {
                kind: ShapeKind::Primitive | ShapeKind::Blittable,
                disposal: Disposal::None,
            } => TypeShape::BLITTABLE,
            _ => TypeShape::MUTABLE,
        }
    }
}

impl<T: CacheValue> CacheValue for Vec<T> {}

impl<V: CacheValue> CacheValue for HashMap<String, V> {}

impl<V: CacheValue> CacheValue for BTreeMap<String, V> {}

// =============================================================================
// Tests
// =============================================================================
