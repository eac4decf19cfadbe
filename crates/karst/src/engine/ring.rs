// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Lock-free snapshot registry: a ring buffer of live versions in the
//! mapped lock file.
//!
//! # Memory Layout
//!
//! ```text
//! +--------------------------------------------------------------+
//! | entries | put_pos | old_pos | pad                            |
//! +--------------------------------------------------------------+
//! | ReadEntry[0]  {version, file_size, top_ref, count, next}     |
//! | ReadEntry[1]                                                 |
//! | ...                                                          |
//! | ReadEntry[entries-1]   (tail extended in place at run time)  |
//! +--------------------------------------------------------------+
//! ```
//!
//! The ring is a circular list threaded through the `next` fields. Entries
//! from `old_pos` through `put_pos` (inclusive) are live; entries after
//! `put_pos` up to but excluding `old_pos` are free. The entry at `put_pos`
//! always holds the latest published snapshot.
//!
//! # Synchronization Protocol
//!
//! Each entry packs two logical fields into one 32-bit atomic `count`:
//! bit 0 is the free flag (1 = free), bits 1.. are the number of readers
//! holding the entry. The packing makes the two racing operations single
//! atomic RMWs with step sizes that cannot interfere:
//!
//! - Reader acquire: `fetch_add(2, Acquire)`; if the old value was odd the
//!   entry was free and the reader backs out with `fetch_sub(2, Relaxed)`.
//! - Reader release: `fetch_sub(2, Release)`.
//! - Cleanup free: `fetch_add(1, Acquire)`; if the old value was non-zero
//!   (readers present, or already free) it backs out with
//!   `fetch_sub(1, Relaxed)`.
//! - Publish: `fetch_sub(1, Release)` clears the free flag on the zeroed
//!   next entry, then `put_pos` is stored with Release.
//!
//! Exactly one of a racing reader-increment and cleanup-free wins; the
//! loser observes the parity and retreats without side effects.
//!
//! # Memory Ordering
//!
//! The Acquire in a successful reader increment pairs with the Release the
//! publishing writer issued on `count`, so the reader sees consistent
//! `{version, top_ref, file_size}` (those are stored Relaxed *before* the
//! Release). The Release on reader decrement pairs with the Acquire of the
//! cleanup probe, so a writer never recycles storage a reader still reads.
//!
//! Mutation discipline: `put_pos`, `old_pos`, `entries` and the `next`
//! chain are only changed while holding the session write mutex (publish,
//! cleanup, expansion are writer-side); `count` is the single word readers
//! touch without any lock.

use crate::config::{RING_EXPANSION_BATCH, RING_INIT_ENTRIES};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// `count` value of a free entry: free flag set, zero readers.
pub(crate) const ENTRY_FREE: u32 = 1;

/// Reader acquire: add 2 with Acquire; back out if the free bit was set.
///
/// A success is an Acquire on the publishing writer's Release, making the
/// entry's payload fields safe to read.
#[inline]
pub(crate) fn acquire_if_even(count: &AtomicU32) -> bool {
    let old = count.fetch_add(2, Ordering::Acquire);
    if old & 1 != 0 {
        // was free, adjust
        count.fetch_sub(2, Ordering::Relaxed);
        return false;
    }
    true
}

/// Reader release: subtract 2 with Release so a later cleanup probe
/// observes all reads as completed.
#[inline]
pub(crate) fn release_shared(count: &AtomicU32) {
    count.fetch_sub(2, Ordering::Release);
}

/// Cleanup probe: set the free flag if and only if the entry is live with
/// zero readers.
#[inline]
pub(crate) fn free_if_unreferenced(count: &AtomicU32) -> bool {
    let old = count.fetch_add(1, Ordering::Acquire);
    if old != 0 {
        count.fetch_sub(1, Ordering::Relaxed);
        return false;
    }
    true
}

/// A snapshot descriptor in the ring.
///
/// `version`, `file_size` and `top_ref` are written by the publishing
/// writer before the Release that makes the entry visible, and never again
/// while the entry is live; readers load them Relaxed under the
/// happens-before edge established through `count`.
#[repr(C)]
pub(crate) struct ReadEntry {
    pub version: AtomicU64,
    pub file_size: AtomicU64,
    pub top_ref: AtomicU64,
    /// Bit 0: free flag. Bits 1..: reader refcount.
    pub count: AtomicU32,
    /// Index of the next entry in the circular list
    pub next: AtomicU32,
}

/// The ring buffer header plus the initial entry block.
///
/// IMPORTANT: the entry array MUST be the final field, and `VersionRing`
/// the final field of the shared header — the array is extended in place
/// beyond its declared length when the file grows. Entry access therefore
/// goes through raw pointer arithmetic, bounded by `entries`, which the
/// caller's mapping must cover.
#[repr(C)]
pub(crate) struct VersionRing {
    /// Number of allocated entries. Grown under the write mutex; readers
    /// observe growth through `put_pos` before ever indexing past the
    /// initial block.
    entries: AtomicU32,
    /// Latest published snapshot; the only store is writer-side Release
    put_pos: AtomicU32,
    /// Oldest live snapshot; advanced by cleanup under the write mutex
    old_pos: AtomicU32,
    _pad: u32,
    data: [ReadEntry; RING_INIT_ENTRIES as usize],
}

impl VersionRing {
    /// Bytes needed beyond `size_of::<VersionRing>()` for `num_entries`
    /// total entries.
    pub(crate) fn required_space(num_entries: u32) -> usize {
        std::mem::size_of::<ReadEntry>() * (num_entries as usize - RING_INIT_ENTRIES as usize)
    }

    /// Initialize a freshly mapped, zeroed ring.
    ///
    /// # Safety
    ///
    /// Caller must be the lock-file initializer with exclusive access to
    /// the (zeroed) mapping, which must cover the initial entry block.
    pub(crate) unsafe fn init(&self) {
        self.entries.store(RING_INIT_ENTRIES, Ordering::Relaxed);
        for i in 0..RING_INIT_ENTRIES {
            let e = self.entry(i);
            e.version.store(1, Ordering::Relaxed);
            e.file_size.store(0, Ordering::Relaxed);
            e.top_ref.store(0, Ordering::Relaxed);
            e.count.store(ENTRY_FREE, Ordering::Relaxed);
            e.next.store(i + 1, Ordering::Relaxed);
        }
        self.entry(RING_INIT_ENTRIES - 1).next.store(0, Ordering::Relaxed);
        // The first entry is live from the start; the session initiator
        // fills it via reinit_last().
        self.entry(0).count.store(0, Ordering::Relaxed);
        self.old_pos.store(0, Ordering::Relaxed);
        self.put_pos.store(0, Ordering::Release);
    }

    /// Current number of allocated entries
    #[inline]
    pub(crate) fn num_entries(&self) -> u32 {
        self.entries.load(Ordering::Relaxed)
    }

    /// Index of the latest published snapshot
    #[inline]
    pub(crate) fn last(&self) -> u32 {
        self.put_pos.load(Ordering::Acquire)
    }

    /// Index of the oldest live snapshot
    #[inline]
    pub(crate) fn oldest_pos(&self) -> u32 {
        self.old_pos.load(Ordering::Relaxed)
    }

    /// Access an entry by index.
    ///
    /// # Safety
    ///
    /// `idx` must be below `num_entries()` and the backing mapping must
    /// cover that many entries (grow the reader mapping first).
    #[inline]
    pub(crate) unsafe fn entry(&self, idx: u32) -> &ReadEntry {
        let base = std::ptr::addr_of!(self.data).cast::<ReadEntry>();
        &*base.add(idx as usize)
    }

    /// Re-open the latest entry for (re)seeding.
    ///
    /// # Safety
    ///
    /// Only the session initiator may call this, under the control mutex,
    /// while no other participant can possibly hold the entry.
    pub(crate) unsafe fn reinit_last(&self) -> &ReadEntry {
        let e = self.entry(self.last());
        e.count.store(0, Ordering::Relaxed);
        e
    }

    /// True when no free entry is available for the next publish.
    ///
    /// # Safety
    ///
    /// Caller holds the write mutex and the mapping covers all entries.
    pub(crate) unsafe fn is_full(&self) -> bool {
        self.entry(self.last()).next.load(Ordering::Relaxed) == self.oldest_pos()
    }

    /// Index the next publish will use.
    ///
    /// # Safety
    ///
    /// As `is_full`; must not be called when the ring is full.
    pub(crate) unsafe fn next_pos(&self) -> u32 {
        self.entry(self.last()).next.load(Ordering::Relaxed)
    }

    /// Publish the entry at `next_pos` as the latest snapshot.
    ///
    /// The entry must have been initialized with free flag set and zero
    /// readers (`count == ENTRY_FREE`) and its payload fields stored.
    ///
    /// # Safety
    ///
    /// Caller holds the write mutex; the ring is not full.
    pub(crate) unsafe fn publish_next(&self) {
        let next = self.next_pos();
        // Clears the free flag; Release pairs with reader Acquire so the
        // payload stores above become visible with it.
        self.entry(next).count.fetch_sub(1, Ordering::Release);
        self.put_pos.store(next, Ordering::Release);
    }

    /// Reclaim unreferenced entries from the tail of the live window.
    ///
    /// Stops at the first entry with readers and never reclaims the entry
    /// at `put_pos`.
    ///
    /// # Safety
    ///
    /// Caller holds the write mutex (single concurrent cleanup) and the
    /// mapping covers all entries.
    pub(crate) unsafe fn cleanup(&self) {
        while self.old_pos.load(Ordering::Relaxed) != self.put_pos.load(Ordering::Relaxed) {
            let e = self.entry(self.old_pos.load(Ordering::Relaxed));
            if !free_if_unreferenced(&e.count) {
                break;
            }
            let next = e.next.load(Ordering::Relaxed);
            self.old_pos.store(next, Ordering::Relaxed);
        }
    }

    /// Link `new_entries - num_entries()` freshly allocated entries into
    /// the free span.
    ///
    /// # Safety
    ///
    /// Caller holds the write mutex and has already preallocated and
    /// remapped the file to cover `new_entries`.
    pub(crate) unsafe fn expand_to(&self, new_entries: u32) {
        let old_entries = self.num_entries();
        for i in old_entries..new_entries {
            let e = self.entry(i);
            e.version.store(1, Ordering::Relaxed);
            e.file_size.store(0, Ordering::Relaxed);
            e.top_ref.store(0, Ordering::Relaxed);
            e.count.store(ENTRY_FREE, Ordering::Relaxed);
            e.next.store(i + 1, Ordering::Relaxed);
        }
        // Splice the new block between put_pos and the old free span.
        self.entry(new_entries - 1)
            .next
            .store(self.oldest_pos(), Ordering::Relaxed);
        self.entry(self.put_pos.load(Ordering::Relaxed))
            .next
            .store(old_entries, Ordering::Relaxed);
        self.entries.store(new_entries, Ordering::Relaxed);
        log::debug!("[RING] expanded from {old_entries} to {new_entries} entries");
    }

    /// Entry count after one expansion step
    pub(crate) fn expanded_size(&self) -> u32 {
        self.num_entries() + RING_EXPANSION_BATCH
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_ring() -> Box<VersionRing> {
        // SAFETY: zeroed bytes are a valid (pre-init) VersionRing image.
        let ring: Box<VersionRing> = unsafe { Box::new(std::mem::zeroed()) };
        // SAFETY: exclusive access, mapping (the box) covers the initial block.
        unsafe { ring.init() };
        ring
    }

    #[test]
    fn test_entry_size_and_alignment() {
        assert_eq!(std::mem::size_of::<ReadEntry>(), 32);
        assert_eq!(std::mem::align_of::<ReadEntry>(), 8);
        // The ring header must not out-align its entries (the tail is
        // extended in place at run time).
        assert!(std::mem::align_of::<VersionRing>() <= 8);
    }

    #[test]
    fn test_init_window() {
        let ring = fresh_ring();
        assert_eq!(ring.last(), 0);
        assert_eq!(ring.oldest_pos(), 0);
        assert_eq!(ring.num_entries(), RING_INIT_ENTRIES);
        unsafe {
            assert_eq!(ring.entry(0).count.load(Ordering::Relaxed), 0);
            for i in 1..RING_INIT_ENTRIES {
                assert_eq!(ring.entry(i).count.load(Ordering::Relaxed), ENTRY_FREE);
            }
            assert_eq!(
                ring.entry(RING_INIT_ENTRIES - 1).next.load(Ordering::Relaxed),
                0
            );
            assert!(!ring.is_full());
        }
    }

    #[test]
    fn test_acquire_live_entry() {
        let ring = fresh_ring();
        let e = unsafe { ring.entry(0) };
        assert!(acquire_if_even(&e.count));
        assert_eq!(e.count.load(Ordering::Relaxed), 2);
        assert!(acquire_if_even(&e.count));
        assert_eq!(e.count.load(Ordering::Relaxed), 4);
        release_shared(&e.count);
        release_shared(&e.count);
        assert_eq!(e.count.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_acquire_free_entry_backs_out() {
        let ring = fresh_ring();
        let e = unsafe { ring.entry(1) };
        assert!(!acquire_if_even(&e.count));
        assert_eq!(e.count.load(Ordering::Relaxed), ENTRY_FREE);
    }

    #[test]
    fn test_free_if_unreferenced_respects_readers() {
        let ring = fresh_ring();
        let e = unsafe { ring.entry(0) };
        assert!(acquire_if_even(&e.count));
        assert!(!free_if_unreferenced(&e.count));
        assert_eq!(e.count.load(Ordering::Relaxed), 2);
        release_shared(&e.count);
        assert!(free_if_unreferenced(&e.count));
        assert_eq!(e.count.load(Ordering::Relaxed), ENTRY_FREE);
    }

    #[test]
    fn test_publish_advances_window() {
        let ring = fresh_ring();
        unsafe {
            let next = ring.next_pos();
            let e = ring.entry(next);
            e.version.store(2, Ordering::Relaxed);
            e.top_ref.store(128, Ordering::Relaxed);
            e.file_size.store(256, Ordering::Relaxed);
            ring.publish_next();

            assert_eq!(ring.last(), next);
            let latest = ring.entry(ring.last());
            assert_eq!(latest.version.load(Ordering::Relaxed), 2);
            assert_eq!(latest.count.load(Ordering::Relaxed), 0);
        }
    }

    #[test]
    fn test_cleanup_reclaims_unreferenced_tail() {
        let ring = fresh_ring();
        unsafe {
            // Publish versions 2..=5.
            for v in 2..=5u64 {
                let next = ring.next_pos();
                let e = ring.entry(next);
                e.version.store(v, Ordering::Relaxed);
                ring.publish_next();
            }
            assert_eq!(ring.oldest_pos(), 0);

            ring.cleanup();
            // Everything but the latest entry is reclaimable.
            assert_eq!(ring.oldest_pos(), ring.last());
            assert_eq!(
                ring.entry(ring.last()).version.load(Ordering::Relaxed),
                5
            );
        }
    }

    #[test]
    fn test_cleanup_stops_at_pinned_entry() {
        let ring = fresh_ring();
        unsafe {
            for v in 2..=4u64 {
                let next = ring.next_pos();
                ring.entry(next).version.store(v, Ordering::Relaxed);
                ring.publish_next();
            }
            // Pin version 3 (index 2 in the untangled initial chain).
            let pinned_idx = 2;
            let pinned = ring.entry(pinned_idx);
            assert_eq!(pinned.version.load(Ordering::Relaxed), 3);
            assert!(acquire_if_even(&pinned.count));

            ring.cleanup();
            // Versions before the pin are reclaimed, the pin and everything
            // newer stay live.
            assert_eq!(ring.oldest_pos(), pinned_idx);

            release_shared(&pinned.count);
            ring.cleanup();
            assert_eq!(ring.oldest_pos(), ring.last());
        }
    }

    #[test]
    fn test_fills_up_after_all_entries_published() {
        let ring = fresh_ring();
        unsafe {
            // One slot is live initially; the remaining 31 fill the ring.
            for v in 0..RING_INIT_ENTRIES - 1 {
                let next = ring.next_pos();
                ring.entry(next).version.store(u64::from(v) + 2, Ordering::Relaxed);
                ring.publish_next();
            }
            assert!(ring.is_full());
        }
    }

    #[test]
    fn test_expansion_links_new_block() {
        // Allocate room for one expansion batch beyond the initial block.
        let total = RING_INIT_ENTRIES + RING_EXPANSION_BATCH;
        let bytes =
            std::mem::size_of::<VersionRing>() + VersionRing::required_space(total);
        // u64 backing keeps the buffer 8-byte aligned for the entry block.
        let mut buf = vec![0u64; bytes / 8 + 1];
        let ring = unsafe { &*(buf.as_mut_ptr().cast::<VersionRing>()) };
        unsafe {
            ring.init();
            for v in 0..RING_INIT_ENTRIES - 1 {
                let next = ring.next_pos();
                ring.entry(next).version.store(u64::from(v) + 2, Ordering::Relaxed);
                ring.publish_next();
            }
            assert!(ring.is_full());

            ring.expand_to(total);
            assert!(!ring.is_full());
            assert_eq!(ring.num_entries(), total);

            // The next publish lands in the new block.
            let next = ring.next_pos();
            assert!(next >= RING_INIT_ENTRIES);
            ring.entry(next).version.store(99, Ordering::Relaxed);
            ring.publish_next();
            assert_eq!(
                ring.entry(ring.last()).version.load(Ordering::Relaxed),
                99
            );
        }
    }

    #[test]
    fn test_concurrent_acquire_release_vs_cleanup() {
        use std::sync::atomic::AtomicBool;
        use std::sync::Arc;

        // The count word protocol itself is ring-agnostic; race readers
        // against a cleanup probe on one shared word.
        let count = Arc::new(AtomicU32::new(0));
        let stop = Arc::new(AtomicBool::new(false));

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let count = Arc::clone(&count);
                let stop = Arc::clone(&stop);
                std::thread::spawn(move || {
                    let mut acquired = 0u32;
                    while !stop.load(Ordering::Relaxed) {
                        if acquire_if_even(&count) {
                            acquired += 1;
                            std::hint::spin_loop();
                            release_shared(&count);
                        }
                    }
                    acquired
                })
            })
            .collect();

        let prober = {
            let count = Arc::clone(&count);
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || {
                let mut freed = 0u32;
                while !stop.load(Ordering::Relaxed) {
                    if free_if_unreferenced(&count) {
                        freed += 1;
                        // un-free so readers can continue
                        count.fetch_sub(1, Ordering::Release);
                    }
                }
                freed
            })
        };

        std::thread::sleep(std::time::Duration::from_millis(100));
        stop.store(true, Ordering::Relaxed);
        for r in readers {
            r.join().expect("reader");
        }
        prober.join().expect("prober");

        // Every transient state resolved: the word is back to fully idle.
        let residue = count.load(Ordering::Relaxed);
        assert!(residue == 0 || residue == 1, "leaked refcount: {residue}");
    }
}
