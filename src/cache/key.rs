//! Cache Keys
//!
//! Opaque string identifiers with a pre-computed hash. Equality is exact:
//! no case folding, trimming or other normalization.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Cache key - an immutable, cheaply cloned string
#[derive(Clone, Eq)]
pub struct CacheKey {
    /// Pre-computed FxHash of the key bytes
    hash: u64,
    /// Full key text
    text: Arc<str>,
}

impl CacheKey {
    /// Create a new cache key
    pub fn new(key: impl AsRef<str>) -> Self {
        let text: Arc<str> = Arc::from(key.as_ref());
        Self {
            hash: Self::fx_hash(text.as_bytes()),
            text,
        }
    }

    /// Fast non-cryptographic hash (FxHash algorithm)
    #[inline]
    fn fx_hash(bytes: &[u8]) -> u64 {
        const SEED: u64 = 0x517cc1b727220a95;
        let mut hash = SEED;
        for &byte in bytes {
            hash = hash.rotate_left(5) ^ (byte as u64);
            hash = hash.wrapping_mul(SEED);
        }
        hash
    }

    /// Key text
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Length of the key in bytes
    #[inline]
    pub fn len(&self) -> usize {
        self.text.len()
    }

    /// True for the empty key
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// Pre-computed hash
    #[inline]
    pub fn fingerprint(&self) -> u64 {
        self.hash
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        // Fast path: differing hashes can never be equal
        if self.hash != other.hash {
            return false;
        }
        self.text == other.text
    }
}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl From<&str> for CacheKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for CacheKey {
    fn from(key: String) -> Self {
        Self::new(key)
    }
}

impl From<&String> for CacheKey {
    fn from(key: &String) -> Self {
        Self::new(key)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CacheKey").field(&&*self.text).finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
