// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The commit pipeline.
//!
//! Entered with the write mutex held, after the ticket scheduler served
//! the caller. Phases:
//!
//! 1. Version assignment: latest ring version + 1, or whatever the
//!    replication collaborator stamps (history and main commit must
//!    agree).
//! 2. Oldest-live determination: ring cleanup under the local mutex; the
//!    oldest surviving version bounds history trimming and mapping
//!    retirement.
//! 3. Write phase: append the payload at the logical end of file, under
//!    the control mutex so no other process resizes the file.
//! 4. Durability: flush for `Full`, skip for `Unsafe` / `MemOnly`; an
//!    async commit (`commit_to_disk == false`) defers this entirely.
//! 5. Critical phase: with `commit_in_critical_phase` raised, expand the
//!    ring if full, fill the next entry and publish it. A crash inside
//!    this window poisons the session — the flag is deliberately left set
//!    on any failure here.
//! 6. Bookkeeping under the control mutex: version counters and the
//!    `new_commit_available` broadcast.
//!
//! Releasing the write lock is the caller's job (it may have to happen on
//! the async helper's thread).

use super::ring::VersionRing;
use super::{header::SharedHeader, Db};
use crate::config::Durability;
use crate::error::Result;
use crate::sys;
use std::sync::atomic::Ordering;

impl Db {
    /// Commit `payload` as the next snapshot. Requires the write mutex.
    ///
    /// Returns the new version. With `commit_to_disk == false` the data
    /// file header is not advanced; the caller keeps the previous durable
    /// version pinned until a later flush (see the async sub-states).
    pub(crate) fn do_commit(&self, payload: &[u8], commit_to_disk: bool) -> Result<u64> {
        let current_version = {
            let mut local = self.local.lock();
            loop {
                let idx = self.ring(&local).last();
                if !self.grow_reader_mapping(&mut local, idx)? {
                    // SAFETY: idx is mapped; the entry is the live latest,
                    // which cannot be recycled while we hold the write
                    // mutex.
                    break unsafe {
                        self.ring(&local).entry(idx).version.load(Ordering::Relaxed)
                    };
                }
            }
        };

        let new_version = match &self.replication {
            Some(repl) => {
                // If prepare_commit fails the entire transaction fails and
                // the file stays untouched; the caller rolls back.
                let stamped = repl.prepare_commit(current_version)?;
                self.low_level_commit(stamped, payload, commit_to_disk)?;
                repl.finalize_commit();
                stamped
            }
            None => {
                let v = current_version + 1;
                self.low_level_commit(v, payload, commit_to_disk)?;
                v
            }
        };
        Ok(new_version)
    }

    fn low_level_commit(
        &self,
        new_version: u64,
        payload: &[u8],
        commit_to_disk: bool,
    ) -> Result<()> {
        let hdr = self.hdr();

        // Phase 2: oldest live snapshot. Cleanup walks the whole ring, so
        // map all of it first.
        let (oldest_version, append_base) = {
            let mut local = self.local.lock();
            loop {
                let max = self.ring(&local).num_entries() - 1;
                if !self.grow_reader_mapping(&mut local, max)? {
                    break;
                }
            }
            let ring = self.ring(&local);
            // SAFETY: write mutex held (sole cleanup), full ring mapped.
            let (oldest, base) = unsafe {
                ring.cleanup();
                (
                    ring.entry(ring.oldest_pos()).version.load(Ordering::Relaxed),
                    ring.entry(ring.last()).file_size.load(Ordering::Relaxed),
                )
            };
            (oldest, base)
        };

        if let Some(repl) = &self.replication {
            repl.set_oldest_bound_version(oldest_version);
        }
        self.storage.purge_old_mappings(oldest_version, new_version);
        debug_assert!(oldest_version <= new_version);

        // Phase 3: write the payload to end-of-file. The control mutex
        // excludes any other process from resizing the file meanwhile.
        let (new_top_ref, new_file_size) = {
            let _guard = hdr.control_mutex.lock_guard()?;
            self.storage.write_snapshot(append_base, payload)?
        };

        {
            let mut local = self.local.lock();

            // Phase 4: durability.
            match hdr.durability().unwrap_or(Durability::Full) {
                Durability::Full | Durability::Unsafe if commit_to_disk => {
                    let sync = hdr.durability() == Some(Durability::Full);
                    self.storage
                        .commit_header(new_version, new_top_ref, new_file_size, sync)?;
                }
                // MemOnly: the file is scratch backing, never flushed; a
                // deferred async commit flushes later instead.
                _ => {}
            }

            // Phase 5: publish. From here until the flag clears, the ring
            // and the file can disagree; a crash is unrecoverable for the
            // session, so the flag stays set on any error path below.
            hdr.commit_in_critical_phase.store(1, Ordering::Release);
            // SAFETY (this phase): write mutex held, full ring mapped above.
            if unsafe { self.ring(&local).is_full() } {
                let entries = self.ring(&local).expanded_size();
                let new_size = SharedHeader::SIZE + VersionRing::required_space(entries);
                sys::prealloc(&self.lock_file, new_size as u64, &self.lockfile_path)?;
                local.reader_map.remap(&self.lock_file, new_size)?;
                local.local_max_entry = entries;
                unsafe { self.ring(&local).expand_to(entries) };
            }
            {
                let ring = self.ring(&local);
                unsafe {
                    let entry = ring.entry(ring.next_pos());
                    entry.top_ref.store(new_top_ref, Ordering::Relaxed);
                    entry.file_size.store(new_file_size, Ordering::Relaxed);
                    entry.version.store(new_version, Ordering::Relaxed);
                    debug_assert!(new_top_ref < new_file_size);
                    ring.publish_next();
                }
            }
            hdr.commit_in_critical_phase.store(0, Ordering::Release);
        }

        // Phase 6: session bookkeeping.
        {
            let _guard = hdr.control_mutex.lock_guard()?;
            hdr.number_of_versions
                .store(new_version - oldest_version + 1, Ordering::Relaxed);
            hdr.latest_version_number
                .store(new_version, Ordering::Relaxed);
            hdr.new_commit_available.notify_all();
        }
        log::debug!("[DB] committed version {new_version} ({} bytes)", payload.len());
        Ok(())
    }
}
