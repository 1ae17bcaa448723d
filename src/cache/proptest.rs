//! Property-Based Tests for Pooled Buffers and Entry Options
//!
//! # Test Properties
//!
//! 1. **Monotonic death**: once the count reaches zero no reservation succeeds
//! 2. **Balance**: any interleaving of matched reserve/release returns the
//!    array to the pool exactly once
//! 3. **Payload integrity**: leased bytes equal the bytes the handle was
//!    created from, for as long as the lease lives
//! 4. **Option resolution**: local expiration never exceeds overall expiration

#![cfg(test)]

use std::time::Duration;

use proptest::prelude::*;

use super::buffer::{BufferPool, BufferPoolConfig};
use super::options::{EntryFlags, EntryOptions};

// =============================================================================
// Property Strategies
// =============================================================================

/// Payloads that fit comfortably in a pooled buffer
fn payload_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 1..4096)
}

/// A sequence of reader actions: `true` takes a lease, `false` drops the
/// oldest outstanding one
fn reader_ops_strategy() -> impl Strategy<Value = Vec<bool>> {
    prop::collection::vec(any::<bool>(), 0..64)
}

fn duration_strategy() -> impl Strategy<Value = Option<Duration>> {
    prop::option::of((1u64..100_000).prop_map(Duration::from_millis))
}

fn pool() -> std::sync::Arc<BufferPool> {
    BufferPool::with_config(BufferPoolConfig {
        max_pooled_buffers: 8,
        ..Default::default()
    })
}

// =============================================================================
// Refcount Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// After the final release, every further reservation fails
    #[test]
    fn prop_dead_buffer_stays_dead(payload in payload_strategy(), attempts in 1usize..16) {
        let pool = pool();
        let handle = pool.create(&payload);

        prop_assert!(handle.release());
        prop_assert!(handle.is_recycled());

        for _ in 0..attempts {
            prop_assert!(!handle.try_reserve());
            prop_assert!(handle.reserve_for_read().is_none());
            prop_assert_eq!(handle.ref_count(), 0);
        }
    }

    /// Matched reserve/release pairs in any order recycle exactly once
    #[test]
    fn prop_balanced_reservations_recycle_once(
        payload in payload_strategy(),
        ops in reader_ops_strategy(),
        release_entry_at in 0usize..64,
    ) {
        let pool = pool();
        let handle = pool.create(&payload);
        let mut leases = std::collections::VecDeque::new();
        let mut entry_alive = true;

        for (i, take) in ops.iter().enumerate() {
            if i == release_entry_at && entry_alive {
                handle.release();
                entry_alive = false;
            }
            if *take {
                match handle.reserve_for_read() {
                    Some(lease) => leases.push_back(lease),
                    None => prop_assert!(!entry_alive && leases.is_empty()),
                }
            } else {
                leases.pop_front();
            }
            prop_assert_eq!(handle.ref_count() as usize, leases.len() + entry_alive as usize);
        }

        if entry_alive {
            handle.release();
        }
        leases.clear();

        prop_assert!(handle.is_recycled());
        prop_assert_eq!(pool.idle(), 1);
        prop_assert_eq!(pool.stats().returned, 1);
    }

    /// A live lease always reads the original bytes, even after the entry
    /// released its own count
    #[test]
    fn prop_lease_outlives_entry(payload in payload_strategy()) {
        let pool = pool();
        let handle = pool.create(&payload);
        let lease = handle.reserve_for_read().unwrap();

        handle.release();
        prop_assert!(!handle.is_recycled());
        prop_assert_eq!(lease.to_vec(), payload);

        drop(lease);
        prop_assert!(handle.is_recycled());
    }
}

// =============================================================================
// Option Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn prop_local_expiration_bounded(
        expiration in duration_strategy(),
        local in duration_strategy(),
        default_expiration in duration_strategy(),
        default_local in duration_strategy(),
    ) {
        let options = EntryOptions { expiration, local_expiration: local, flags: EntryFlags::NONE };
        let defaults = EntryOptions {
            expiration: default_expiration,
            local_expiration: default_local,
            flags: EntryFlags::NONE,
        };

        let resolved = options.resolve(&defaults);
        prop_assert!(resolved.local_expiration <= resolved.expiration);
        if let Some(expiration) = expiration {
            prop_assert_eq!(resolved.expiration, expiration);
        }
    }

    #[test]
    fn prop_flags_are_combined(a in 0u8..32, b in 0u8..32) {
        let options = EntryOptions::new().with_flags(EntryFlags::from_bits_truncate(a));
        let defaults = EntryOptions::new().with_flags(EntryFlags::from_bits_truncate(b));

        let resolved = options.resolve(&defaults);
        prop_assert_eq!(resolved.flags.bits(), a | b);
    }
}
