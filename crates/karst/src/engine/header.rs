// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The shared header at offset 0 of the lock file.
//!
//! Every process that has the database open maps this block and coordinates
//! through it. The layout is frozen:
//!
//! ```text
//! Off  Size  Field
//! 0    1     init_complete (atomic u8, 0/1)
//! 1    1     size_of_mutex
//! 2    1     size_of_condvar
//! 3    1     commit_in_critical_phase (atomic u8)
//! 4    1     file_format_version
//! 5    1     history_type (signed)
//! 6    2     shared_info_version (layout magic)
//! 8    2     durability
//! 10   2     reserved
//! 12   4     num_participants
//! 16   8     latest_version_number
//! 24   8     session_initiator_pid (0 while encryption is unsupported)
//! 32   8     number_of_versions
//! 40   1     sync_agent_present
//! 41   2     reserved (legacy daemon flags)
//! 43   1     filler
//! 44   2     history_schema_version
//! 46   2     filler
//! 48   ..    write mutex, control mutex, condvar words,
//!            next_ticket, next_served, version ring (tail)
//! ```
//!
//! The prefix up to and including offset 7 may never change — it is what a
//! joiner built from a different library version reads to decide whether
//! the rest of the layout can be trusted. Any change beyond the prefix
//! bumps `SHARED_INFO_VERSION`.
//!
//! # Publication
//!
//! The `init_complete` byte is the only publication signal for the whole
//! header. The initializer writes every other field first and then stores
//! 1 with Release; a joiner must observe `init_complete == 1` (Acquire)
//! before reading anything else. There is no other ordering between
//! initializer and joiners.
//!
//! Field access rules after publication: the frozen prefix and the
//! durability/history stamps are immutable; the counters are mutated only
//! under the control mutex (atomics with Relaxed suffice — the mutex
//! orders them); the ring has its own lock-free protocol.

use crate::config::{Durability, SHARED_INFO_VERSION};
use crate::engine::ring::VersionRing;
use crate::error::Result;
use crate::sys::{SharedCondVar, SharedMutexState};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};

#[repr(C, align(8))]
pub(crate) struct SharedHeader {
    /// Set to 1 (Release) once the rest of the header is fully written.
    /// CAUTION: must never move or change type.
    pub init_complete: AtomicU8,
    /// `size_of::<SharedMutexState>()` as built by the initializer, so all
    /// participants agree on the embedded mutex layout.
    pub size_of_mutex: u8,
    /// Like `size_of_mutex` for the condvar words.
    pub size_of_condvar: u8,
    /// Set while a commit is publishing into the ring. A crash with this
    /// flag set leaves the session unusable; every later `begin_write`
    /// fails until the lock file is reinitialized.
    pub commit_in_critical_phase: AtomicU8,
    /// Target data file format for this session.
    pub file_format_version: AtomicU8,
    /// History type of the attached replication collaborator.
    pub history_type: i8,
    /// Layout magic. CAUTION: must never move or change type.
    pub shared_info_version: u16,
    /// `Durability` wire value, fixed at session creation.
    pub durability: u16,
    pub _reserved_0: u16,
    /// Number of participants currently attached to the session.
    pub num_participants: AtomicU32,
    /// Version of the newest commit. Guarded by the control mutex; for a
    /// lock-free read use the ring's latest entry instead.
    pub latest_version_number: AtomicU64,
    /// Kept for layout compatibility; stays 0 (no encryption support).
    pub session_initiator_pid: AtomicU64,
    /// `latest_version - oldest_live_version + 1`, maintained at commit.
    pub number_of_versions: AtomicU64,
    /// 1 while a participant acts as the session's sync agent.
    pub sync_agent_present: AtomicU8,
    /// Legacy daemon handshake bytes, always 0.
    pub _reserved_1: [u8; 2],
    pub _filler_1: u8,
    /// History schema version of the replication collaborator.
    pub history_schema_version: u16,
    pub _filler_2: u16,
    /// Serializes all writes to the database (held for the duration of a
    /// write transaction).
    pub write_mutex: SharedMutexState,
    /// Protects session metadata, file resizing and attach/detach.
    pub control_mutex: SharedMutexState,
    /// Broadcast after each commit's bookkeeping (see `wait_for_change`).
    pub new_commit_available: SharedCondVar,
    /// Wakes write-ticket holders when the lock changes hands.
    pub pick_next_writer: SharedCondVar,
    /// Next write ticket to hand out.
    pub next_ticket: AtomicU32,
    /// Ticket currently allowed to take the write mutex.
    pub next_served: AtomicU32,
    /// IMPORTANT: the ring MUST be the last field — its entry block is
    /// extended in place when the lock file grows.
    pub ring: VersionRing,
}

impl SharedHeader {
    /// Size of the header including the initial ring block.
    pub(crate) const SIZE: usize = std::mem::size_of::<SharedHeader>();

    /// Initialize a freshly truncated, preallocated, zeroed mapping.
    ///
    /// Leaves `init_complete` at 0; the caller publishes with a Release
    /// store of 1 once this returns.
    ///
    /// # Safety
    ///
    /// `ptr` must point at a writable, zeroed region of at least `SIZE`
    /// bytes that no other participant can observe yet (the caller holds
    /// the exclusive file lock).
    pub(crate) unsafe fn init_at(
        ptr: *mut SharedHeader,
        durability: Durability,
        history_type: i8,
        history_schema_version: u16,
    ) -> Result<()> {
        (*ptr).size_of_mutex = std::mem::size_of::<SharedMutexState>() as u8;
        (*ptr).size_of_condvar = std::mem::size_of::<SharedCondVar>() as u8;
        (*ptr).shared_info_version = SHARED_INFO_VERSION;
        (*ptr).durability = durability.as_raw();
        (*ptr).history_type = history_type;
        (*ptr).history_schema_version = history_schema_version;
        (*ptr).write_mutex.init()?;
        (*ptr).control_mutex.init()?;
        (*ptr).new_commit_available.init();
        (*ptr).pick_next_writer.init();
        (*ptr).next_ticket.store(0, Ordering::Relaxed);
        (*ptr).next_served.store(0, Ordering::Relaxed);
        (*ptr).ring.init();
        Ok(())
    }

    /// True when the stamped layout matches this build.
    pub(crate) fn layout_matches(&self) -> bool {
        self.shared_info_version == SHARED_INFO_VERSION
            && usize::from(self.size_of_mutex) == std::mem::size_of::<SharedMutexState>()
            && usize::from(self.size_of_condvar) == std::mem::size_of::<SharedCondVar>()
    }

    /// Durability stamped at session creation.
    pub(crate) fn durability(&self) -> Option<Durability> {
        Durability::from_raw(self.durability)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::offset_of;

    #[test]
    fn test_frozen_prefix_offsets() {
        // These offsets may never change, not even with a layout bump.
        assert_eq!(offset_of!(SharedHeader, init_complete), 0);
        assert_eq!(offset_of!(SharedHeader, size_of_mutex), 1);
        assert_eq!(offset_of!(SharedHeader, size_of_condvar), 2);
        assert_eq!(offset_of!(SharedHeader, commit_in_critical_phase), 3);
        assert_eq!(offset_of!(SharedHeader, file_format_version), 4);
        assert_eq!(offset_of!(SharedHeader, history_type), 5);
        assert_eq!(offset_of!(SharedHeader, shared_info_version), 6);
    }

    #[test]
    fn test_versioned_layout_offsets() {
        // Changing any of these requires bumping SHARED_INFO_VERSION.
        assert_eq!(offset_of!(SharedHeader, durability), 8);
        assert_eq!(offset_of!(SharedHeader, _reserved_0), 10);
        assert_eq!(offset_of!(SharedHeader, num_participants), 12);
        assert_eq!(offset_of!(SharedHeader, latest_version_number), 16);
        assert_eq!(offset_of!(SharedHeader, session_initiator_pid), 24);
        assert_eq!(offset_of!(SharedHeader, number_of_versions), 32);
        assert_eq!(offset_of!(SharedHeader, sync_agent_present), 40);
        assert_eq!(offset_of!(SharedHeader, _reserved_1), 41);
        assert_eq!(offset_of!(SharedHeader, _filler_1), 43);
        assert_eq!(offset_of!(SharedHeader, history_schema_version), 44);
        assert_eq!(offset_of!(SharedHeader, _filler_2), 46);
        assert_eq!(offset_of!(SharedHeader, write_mutex), 48);
    }

    #[test]
    fn test_ring_is_last_and_entry_aligned() {
        let ring_off = offset_of!(SharedHeader, ring);
        assert_eq!(
            ring_off + std::mem::size_of::<VersionRing>(),
            SharedHeader::SIZE
        );
        assert_eq!(ring_off % 8, 0);
        // The header must not out-align a ring entry (the tail grows in
        // multiples of entries).
        assert_eq!(std::mem::align_of::<SharedHeader>(), 8);
    }

    #[test]
    fn test_init_publishes_nothing() {
        // SAFETY: zeroed bytes are the state init_at expects.
        let header: Box<SharedHeader> = unsafe { Box::new(std::mem::zeroed()) };
        let ptr = Box::into_raw(header);
        // SAFETY: exclusive heap allocation of full size.
        unsafe {
            SharedHeader::init_at(ptr, Durability::Full, 0, 3).expect("init");
            let h = &*ptr;
            assert_eq!(h.init_complete.load(Ordering::Acquire), 0);
            assert!(h.layout_matches());
            assert_eq!(h.durability(), Some(Durability::Full));
            assert_eq!(h.history_schema_version, 3);
            assert_eq!(h.num_participants.load(Ordering::Relaxed), 0);
            drop(Box::from_raw(ptr));
        }
    }

    #[test]
    fn test_layout_mismatch_detected() {
        // SAFETY: zeroed bytes are the state init_at expects.
        let header: Box<SharedHeader> = unsafe { Box::new(std::mem::zeroed()) };
        let ptr = Box::into_raw(header);
        // SAFETY: exclusive heap allocation of full size.
        unsafe {
            SharedHeader::init_at(ptr, Durability::Unsafe, 1, 0).expect("init");
            (*ptr).shared_info_version = 0x0001; // stale cross-version header
            assert!(!(*ptr).layout_matches());
            drop(Box::from_raw(ptr));
        }
    }
}
