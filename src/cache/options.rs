//! Per-Call Entry Options
//!
//! Expiration and tier-bypass flags for a single cache operation. Options
//! supplied on a call are merged over the configured defaults.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default overall expiration (5 minutes)
pub const DEFAULT_EXPIRATION: Duration = Duration::from_secs(5 * 60);

/// Tier-bypass flags
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryFlags(u8);

impl EntryFlags {
    /// No flags set
    pub const NONE: EntryFlags = EntryFlags(0);
    /// Do not read from the local (L1) tier
    pub const DISABLE_LOCAL_CACHE_READ: EntryFlags = EntryFlags(1 << 0);
    /// Do not write to the local (L1) tier
    pub const DISABLE_LOCAL_CACHE_WRITE: EntryFlags = EntryFlags(1 << 1);
    /// Bypass the local (L1) tier entirely
    pub const DISABLE_LOCAL_CACHE: EntryFlags = EntryFlags(0b0000_0011);
    /// Do not read from the distributed (L2) tier
    pub const DISABLE_DISTRIBUTED_CACHE_READ: EntryFlags = EntryFlags(1 << 2);
    /// Do not write to the distributed (L2) tier
    pub const DISABLE_DISTRIBUTED_CACHE_WRITE: EntryFlags = EntryFlags(1 << 3);
    /// Bypass the distributed (L2) tier entirely
    pub const DISABLE_DISTRIBUTED_CACHE: EntryFlags = EntryFlags(0b0000_1100);
    /// On a full miss, fail fast instead of invoking the value factory
    pub const DISABLE_UNDERLYING_DATA: EntryFlags = EntryFlags(1 << 4);

    const ALL: u8 = 0b0001_1111;

    /// Build from raw bits, dropping unknown bits
    pub const fn from_bits_truncate(bits: u8) -> Self {
        EntryFlags(bits & Self::ALL)
    }

    /// Raw bits
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// True when every bit of `other` is set in `self`
    pub const fn contains(self, other: EntryFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// True when no flag is set
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Union of two flag sets
    pub const fn union(self, other: EntryFlags) -> Self {
        EntryFlags(self.0 | other.0)
    }

    pub(crate) fn local_read(self) -> bool {
        !self.contains(Self::DISABLE_LOCAL_CACHE_READ)
    }

    pub(crate) fn local_write(self) -> bool {
        !self.contains(Self::DISABLE_LOCAL_CACHE_WRITE)
    }

    pub(crate) fn distributed_read(self) -> bool {
        !self.contains(Self::DISABLE_DISTRIBUTED_CACHE_READ)
    }

    pub(crate) fn distributed_write(self) -> bool {
        !self.contains(Self::DISABLE_DISTRIBUTED_CACHE_WRITE)
    }

    pub(crate) fn underlying_data(self) -> bool {
        !self.contains(Self::DISABLE_UNDERLYING_DATA)
    }
}

impl BitOr for EntryFlags {
    type Output = EntryFlags;

    fn bitor(self, rhs: EntryFlags) -> EntryFlags {
        self.union(rhs)
    }
}

impl BitOrAssign for EntryFlags {
    fn bitor_assign(&mut self, rhs: EntryFlags) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for EntryFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(EntryFlags, &str); 5] = [
            (EntryFlags::DISABLE_LOCAL_CACHE_READ, "DisableLocalCacheRead"),
            (EntryFlags::DISABLE_LOCAL_CACHE_WRITE, "DisableLocalCacheWrite"),
            (EntryFlags::DISABLE_DISTRIBUTED_CACHE_READ, "DisableDistributedCacheRead"),
            (EntryFlags::DISABLE_DISTRIBUTED_CACHE_WRITE, "DisableDistributedCacheWrite"),
            (EntryFlags::DISABLE_UNDERLYING_DATA, "DisableUnderlyingData"),
        ];

        if self.is_empty() {
            return f.write_str("None");
        }
        let mut first = true;
        for (flag, name) in NAMES {
            if self.contains(flag) {
                if !first {
                    f.write_str(" | ")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

/// Options for a single cache operation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntryOptions {
    /// Overall lifetime of the entry (distributed tier TTL)
    #[serde(with = "duration_ms")]
    pub expiration: Option<Duration>,
    /// Lifetime in the local tier; defaults to `expiration`
    #[serde(with = "duration_ms")]
    pub local_expiration: Option<Duration>,
    /// Tier-bypass flags
    pub flags: EntryFlags,
}

impl EntryOptions {
    /// Empty options (use configured defaults)
    pub fn new() -> Self {
        Self::default()
    }

    /// Set overall expiration
    pub fn with_expiration(mut self, expiration: Duration) -> Self {
        self.expiration = Some(expiration);
        self
    }

    /// Set local-tier expiration
    pub fn with_local_expiration(mut self, expiration: Duration) -> Self {
        self.local_expiration = Some(expiration);
        self
    }

    /// Add flags
    pub fn with_flags(mut self, flags: EntryFlags) -> Self {
        self.flags |= flags;
        self
    }

    /// Merge these options over `defaults`.
    ///
    /// Explicit values win; flags are combined. The local expiration never
    /// outlives the overall expiration.
    pub fn resolve(&self, defaults: &EntryOptions) -> ResolvedOptions {
        let expiration = self
            .expiration
            .or(defaults.expiration)
            .unwrap_or(DEFAULT_EXPIRATION);
        let local_expiration = self
            .local_expiration
            .or(defaults.local_expiration)
            .unwrap_or(expiration)
            .min(expiration);

        ResolvedOptions {
            expiration,
            local_expiration,
            flags: self.flags | defaults.flags,
        }
    }
}

/// Options after merging with defaults
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedOptions {
    /// Overall expiration
    pub expiration: Duration,
    /// Local-tier expiration
    pub local_expiration: Duration,
    /// Effective flags
    pub flags: EntryFlags,
}

/// Serde helper: `Option<Duration>` as whole milliseconds
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_composite_flags() {
        let local = EntryFlags::DISABLE_LOCAL_CACHE;
        assert!(local.contains(EntryFlags::DISABLE_LOCAL_CACHE_READ));
        assert!(local.contains(EntryFlags::DISABLE_LOCAL_CACHE_WRITE));
        assert!(!local.contains(EntryFlags::DISABLE_DISTRIBUTED_CACHE_READ));

        let l2 = EntryFlags::DISABLE_DISTRIBUTED_CACHE;
        assert!(!l2.distributed_read());
        assert!(!l2.distributed_write());
        assert!(l2.local_read());
    }

    #[test]
    fn test_flags_debug() {
        assert_eq!(format!("{:?}", EntryFlags::NONE), "None");
        assert_eq!(
            format!("{:?}", EntryFlags::DISABLE_LOCAL_CACHE_READ | EntryFlags::DISABLE_UNDERLYING_DATA),
            "DisableLocalCacheRead | DisableUnderlyingData"
        );
    }

    #[test]
    fn test_from_bits_truncate() {
        assert_eq!(EntryFlags::from_bits_truncate(0xFF).bits(), 0b0001_1111);
    }

    #[test]
    fn test_resolve_uses_defaults() {
        let defaults = EntryOptions::new()
            .with_expiration(Duration::from_secs(60))
            .with_flags(EntryFlags::DISABLE_DISTRIBUTED_CACHE_WRITE);
        let resolved = EntryOptions::new()
            .with_flags(EntryFlags::DISABLE_LOCAL_CACHE_READ)
            .resolve(&defaults);

        assert_eq!(resolved.expiration, Duration::from_secs(60));
        assert_eq!(resolved.local_expiration, Duration::from_secs(60));
        assert!(resolved.flags.contains(EntryFlags::DISABLE_DISTRIBUTED_CACHE_WRITE));
        assert!(resolved.flags.contains(EntryFlags::DISABLE_LOCAL_CACHE_READ));
    }

    #[test]
    fn test_resolve_clamps_local_expiration() {
        let resolved = EntryOptions::new()
            .with_expiration(Duration::from_secs(10))
            .with_local_expiration(Duration::from_secs(100))
            .resolve(&EntryOptions::default());

        assert_eq!(resolved.local_expiration, Duration::from_secs(10));
    }

    #[test]
    fn test_resolve_without_any_expiration() {
        let resolved = EntryOptions::new().resolve(&EntryOptions::new());
        assert_eq!(resolved.expiration, DEFAULT_EXPIRATION);
        assert_eq!(resolved.local_expiration, DEFAULT_EXPIRATION);
    }

    #[test]
    fn test_options_from_json() {
        let options: EntryOptions =
            serde_json::from_str(r#"{"expiration": 1500, "flags": 16}"#).unwrap();
        assert_eq!(options.expiration, Some(Duration::from_millis(1500)));
        assert_eq!(options.local_expiration, None);
        assert_eq!(options.flags, EntryFlags::DISABLE_UNDERLYING_DATA);
    }
}
