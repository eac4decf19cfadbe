// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Engine-wide constants and open-time options.
//!
//! All tunables and layout magics live here. **Never hardcode elsewhere!**

use std::time::Duration;

/// Layout magic of the shared lock-file header.
///
/// Session participants compare this against the value stamped at offset 6
/// of the lock file and refuse to join on mismatch. Must be bumped on any
/// change to the header layout beyond the frozen 8-byte prefix.
pub const SHARED_INFO_VERSION: u16 = 0x0A07;

/// Data file magic ("KRST")
pub const STORAGE_MAGIC: u32 = 0x4B52_5354;

/// Newest data file format this build can open and the format it creates.
pub const CURRENT_FILE_FORMAT_VERSION: u8 = 1;

/// Initial number of snapshot ring entries.
///
/// The ring grows in place when more concurrent snapshots are pinned; it
/// never shrinks for the lifetime of a session.
pub const RING_INIT_ENTRIES: u32 = 32;

/// Number of entries added per ring expansion.
pub const RING_EXPANSION_BATCH: u32 = 32;

/// Fairness window of the write-lock ticket scheduler.
///
/// A writer whose ticket has reached the head of the queue is served within
/// one such window even if an earlier ticket holder died without serving.
pub const WRITE_SCHEDULER_TIMEOUT: Duration = Duration::from_millis(500);

/// Attempts to (re)initialize or join the lock file before giving up with
/// `IncompatibleLockFile`. Retries use a bounded randomized back-off.
pub const ATTACH_MAX_RETRIES: u32 = 10;

/// Durability guarantee of commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Durability {
    /// Every commit is flushed to stable storage before it returns.
    Full,
    /// The data file is scratch backing for shared memory; it is deleted
    /// when the last participant closes and is never flushed.
    MemOnly,
    /// Commits skip the flush; a host crash may lose recent transactions
    /// but never corrupts the file.
    Unsafe,
}

impl Durability {
    /// Wire value stored in the lock-file header (offset 8)
    pub(crate) fn as_raw(self) -> u16 {
        match self {
            Self::Full => 0,
            Self::MemOnly => 1,
            Self::Unsafe => 2,
        }
    }

    pub(crate) fn from_raw(raw: u16) -> Option<Self> {
        match raw {
            0 => Some(Self::Full),
            1 => Some(Self::MemOnly),
            2 => Some(Self::Unsafe),
            _ => None,
        }
    }
}

/// Options controlling `Db::open`.
///
/// All concurrent participants of a session must open with the same
/// durability and history configuration; a disagreement is a logic error
/// surfaced at open time.
pub struct DbOptions {
    /// Durability mode, fixed for the whole session at creation.
    pub durability: Durability,
    /// Permit upgrading the data file format in place when an older file
    /// is opened. When `false`, an old-format file fails the open with
    /// `FileFormatUpgradeRequired`.
    pub allow_file_format_upgrade: bool,
    /// Start the background commit helper so write locks and flushes can
    /// be requested asynchronously.
    pub enable_async_writes: bool,
    /// Replication / history collaborator stamping commits, if any.
    pub replication: Option<std::sync::Arc<dyn crate::history::Replication>>,
}

impl Default for DbOptions {
    fn default() -> Self {
        Self {
            durability: Durability::Full,
            allow_file_format_upgrade: true,
            enable_async_writes: false,
            replication: None,
        }
    }
}

impl std::fmt::Debug for DbOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbOptions")
            .field("durability", &self.durability)
            .field("allow_file_format_upgrade", &self.allow_file_format_upgrade)
            .field("enable_async_writes", &self.enable_async_writes)
            .field("replication", &self.replication.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_durability_raw_roundtrip() {
        for d in [Durability::Full, Durability::MemOnly, Durability::Unsafe] {
            assert_eq!(Durability::from_raw(d.as_raw()), Some(d));
        }
        assert_eq!(Durability::from_raw(7), None);
    }

    #[test]
    fn test_default_options() {
        let opts = DbOptions::default();
        assert_eq!(opts.durability, Durability::Full);
        assert!(opts.allow_file_format_upgrade);
        assert!(!opts.enable_async_writes);
        assert!(opts.replication.is_none());
    }
}
