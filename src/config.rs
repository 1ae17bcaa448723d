//! Hybrid cache configuration
//!
//! Loaded from JSON (every field optional) or built in code, then checked
//! with [`HybridCacheConfig::validate`] before a cache is constructed.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::buffer::BufferPoolConfig;
use crate::cache::local::LocalConfig;
use crate::cache::options::{EntryOptions, DEFAULT_EXPIRATION};
use crate::cache::{DEFAULT_MAXIMUM_KEY_LENGTH, DEFAULT_MAXIMUM_PAYLOAD_BYTES};
use crate::error::{CacheError, Result};

/// What to do when a distributed write-back fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DistributedWritePolicy {
    /// Log and count the failure, then move on
    #[default]
    Drop,
    /// Retry with linear backoff before giving up
    Retry {
        /// Total attempts including the first
        max_attempts: u32,
        /// Delay before the second attempt; grows linearly
        backoff_ms: u64,
    },
}

impl DistributedWritePolicy {
    /// Total attempts allowed
    pub fn attempts(&self) -> u32 {
        match self {
            DistributedWritePolicy::Drop => 1,
            DistributedWritePolicy::Retry { max_attempts, .. } => *max_attempts,
        }
    }

    /// Delay before attempt number `attempt` (1-based, so attempt 1 has none)
    pub fn backoff(&self, attempt: u32) -> Duration {
        match self {
            DistributedWritePolicy::Drop => Duration::ZERO,
            DistributedWritePolicy::Retry { backoff_ms, .. } => {
                Duration::from_millis(backoff_ms.saturating_mul(attempt.saturating_sub(1) as u64))
            }
        }
    }
}

/// Hybrid cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HybridCacheConfig {
    /// Options applied under every per-call option
    pub default_entry_options: EntryOptions,
    /// Serialized payloads above this are returned but never stored
    pub maximum_payload_bytes: usize,
    /// Longer keys bypass the cache
    pub maximum_key_length: usize,
    /// Local tier
    pub local: LocalConfig,
    /// Buffer pool
    pub buffer_pool: BufferPoolConfig,
    /// Distributed write failure handling
    pub distributed_write_policy: DistributedWritePolicy,
}

impl Default for HybridCacheConfig {
    fn default() -> Self {
        Self {
            default_entry_options: EntryOptions::new()
                .with_expiration(DEFAULT_EXPIRATION)
                .with_local_expiration(DEFAULT_EXPIRATION),
            maximum_payload_bytes: DEFAULT_MAXIMUM_PAYLOAD_BYTES,
            maximum_key_length: DEFAULT_MAXIMUM_KEY_LENGTH,
            local: LocalConfig::default(),
            buffer_pool: BufferPoolConfig::default(),
            distributed_write_policy: DistributedWritePolicy::default(),
        }
    }
}

impl HybridCacheConfig {
    /// Parse and validate a JSON document
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| CacheError::Config(format!("invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| CacheError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_json(&json)
    }

    /// Reject settings the cache cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.maximum_payload_bytes == 0 {
            return Err(CacheError::Config("maximum_payload_bytes must be > 0".into()));
        }
        if self.maximum_key_length == 0 {
            return Err(CacheError::Config("maximum_key_length must be > 0".into()));
        }
        if self.local.capacity == 0 {
            return Err(CacheError::Config("local.capacity must be > 0".into()));
        }
        if !(0.0 < self.local.low_watermark
            && self.local.low_watermark <= self.local.high_watermark
            && self.local.high_watermark <= 1.0)
        {
            return Err(CacheError::Config(format!(
                "local watermarks must satisfy 0 < low ({}) <= high ({}) <= 1",
                self.local.low_watermark, self.local.high_watermark
            )));
        }
        if self.local.eviction_batch_size == 0 {
            return Err(CacheError::Config("local.eviction_batch_size must be > 0".into()));
        }
        if self.buffer_pool.max_pooled_buffers == 0 {
            return Err(CacheError::Config("buffer_pool.max_pooled_buffers must be > 0".into()));
        }
        if self.distributed_write_policy.attempts() == 0 {
            return Err(CacheError::Config("retry max_attempts must be > 0".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_defaults() {
        let config = HybridCacheConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.maximum_payload_bytes, 1024 * 1024);
        assert_eq!(config.maximum_key_length, 1024);
        assert_eq!(
            config.default_entry_options.local_expiration,
            Some(Duration::from_secs(300))
        );
        assert_eq!(config.distributed_write_policy, DistributedWritePolicy::Drop);
    }

    #[test]
    fn test_from_json_partial() {
        let config = HybridCacheConfig::from_json(
            r#"{
                "maximum_key_length": 64,
                "local": { "capacity": 4096 },
                "distributed_write_policy": { "mode": "retry", "max_attempts": 3, "backoff_ms": 10 }
            }"#,
        )
        .unwrap();

        assert_eq!(config.maximum_key_length, 64);
        assert_eq!(config.local.capacity, 4096);
        assert_eq!(config.local.high_watermark, 0.90);
        assert_eq!(config.distributed_write_policy.attempts(), 3);
        assert_eq!(
            config.distributed_write_policy.backoff(3),
            Duration::from_millis(20)
        );
    }

    #[test]
    fn test_from_json_rejects_garbage() {
        assert_matches!(
            HybridCacheConfig::from_json("{ not json"),
            Err(CacheError::Config(_))
        );
    }

    #[test]
    fn test_validate_rejects_inverted_watermarks() {
        let mut config = HybridCacheConfig::default();
        config.local.low_watermark = 0.95;
        assert_matches!(config.validate(), Err(CacheError::Config(msg)) if msg.contains("watermarks"));
    }

    #[test]
    fn test_validate_rejects_zero_attempts() {
        let config = HybridCacheConfig {
            distributed_write_policy: DistributedWritePolicy::Retry {
                max_attempts: 0,
                backoff_ms: 5,
            },
            ..Default::default()
        };
        assert_matches!(config.validate(), Err(CacheError::Config(_)));
    }

    #[test]
    fn test_drop_policy_has_no_backoff() {
        let policy = DistributedWritePolicy::Drop;
        assert_eq!(policy.attempts(), 1);
        assert_eq!(policy.backoff(5), Duration::ZERO);
    }
}
