// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The database coordinator.
//!
//! A `Db` is one participant in a *session*: the set of temporally
//! overlapping opens of the same database file on this host. Participants
//! coordinate exclusively through the `.lock` file next to the data file —
//! its shared header carries the session's mutexes, counters and the
//! snapshot ring.
//!
//! # Session attach
//!
//! ```text
//! open ──► try exclusive flock ──success──► truncate, write header,
//!   │                                       init_complete = 1 (Release)
//!   └──fail (someone else holds a lock)──┐
//!                                        ▼
//!                      shared flock ◄────┘
//!                            │
//!            init_complete == 1 and layout matches?
//!               │yes                        │no
//!               ▼                           ▼
//!        join under control mutex     retry with randomized back-off,
//!        (participant count += 1)     then IncompatibleLockFile
//! ```
//!
//! A crashed initializer leaves `init_complete == 0`; the next exclusive
//! winner simply reinitializes. Stale headers from other library versions
//! are rejected, never reinterpreted.

pub(crate) mod async_commit;
pub(crate) mod commit;
pub(crate) mod header;
pub(crate) mod ring;
pub(crate) mod ticket;
pub(crate) mod txn;

use crate::config::{DbOptions, Durability, ATTACH_MAX_RETRIES};
use crate::error::{Error, LogicErrorKind, Result};
use crate::history::{Replication, HISTORY_NONE};
use crate::store::{StorageAttachCfg, StorageFile};
use crate::sys::{self, file_lock, FileMap};
use header::SharedHeader;
use parking_lot::Mutex;
use ring::VersionRing;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub use txn::{TransactStage, Transaction};

/// Byte offset of the ring inside the shared header.
pub(crate) const RING_OFFSET: usize = std::mem::offset_of!(SharedHeader, ring);

/// Identifies a snapshot: its version plus the ring slot it was read from.
///
/// The index makes re-pinning O(1); the version guards against the slot
/// having been recycled in the meantime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionId {
    pub version: u64,
    pub index: u32,
}

/// A held reference into a ring entry, released exactly once.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ReadLock {
    pub reader_idx: u32,
    pub version: u64,
    pub top_ref: u64,
    pub file_size: u64,
}

/// Companion files derived from the database path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreFileKind {
    /// The database file itself
    Storage,
    /// Per-session coordination file
    Lock,
    /// Directory for lock emulation fallbacks
    Management,
    Note,
    Log,
}

/// Map a base path to one of its companion files.
#[must_use]
pub fn core_file(base: &Path, kind: CoreFileKind) -> PathBuf {
    let append = |suffix: &str| {
        let mut s = base.as_os_str().to_os_string();
        s.push(suffix);
        PathBuf::from(s)
    };
    match kind {
        CoreFileKind::Storage => base.to_path_buf(),
        CoreFileKind::Lock => append(".lock"),
        CoreFileKind::Management => append(".management"),
        CoreFileKind::Note => append(".note"),
        CoreFileKind::Log => append(".log"),
    }
}

/// Per-process mutable state, under the local mutex.
pub(crate) struct LocalState {
    /// Mapping covering the header plus the ring tail; remapped on growth.
    /// The separate fixed `header_map` exists so the embedded mutexes
    /// never move while locked.
    pub reader_map: FileMap,
    /// Ring size this process has mapped; lags the shared count until
    /// `grow_reader_mapping` catches up.
    pub local_max_entry: u32,
    /// Read locks held by transactions of this process.
    pub locks_held: Vec<ReadLock>,
    /// Open transactions in this process.
    pub transaction_count: u32,
    /// A write transaction of this process holds the write mutex.
    pub write_transaction_open: bool,
}

/// One participant's handle on a database.
///
/// Cheap to share (`Arc`); every transaction keeps its `Db` alive. It is
/// illegal to close a database with open write transactions.
pub struct Db {
    pub(crate) path: PathBuf,
    pub(crate) lockfile_path: PathBuf,
    pub(crate) replication: Option<Arc<dyn Replication>>,
    /// Lock file; the shared flock on it marks us as a participant.
    pub(crate) lock_file: File,
    /// Fixed-size mapping of the shared header. Never remapped, so the
    /// embedded mutexes and condvars keep their addresses.
    pub(crate) header_map: FileMap,
    pub(crate) storage: StorageFile,
    pub(crate) local: Mutex<LocalState>,
    wait_for_change_enabled: AtomicBool,
    is_sync_agent: AtomicBool,
    pub(crate) attached: AtomicBool,
    pub(crate) commit_helper: Option<async_commit::AsyncCommitHelper>,
}

impl Db {
    /// Open the database at `path`, creating it unless `no_create`.
    ///
    /// Initializes the session's lock file or joins the running session.
    /// All participants must agree on durability and history
    /// configuration.
    pub fn open(path: impl AsRef<Path>, no_create: bool, options: DbOptions) -> Result<Arc<Self>> {
        let path = path.as_ref().to_path_buf();
        let lockfile_path = core_file(&path, CoreFileKind::Lock);
        let management_dir = core_file(&path, CoreFileKind::Management);
        let (hist_type, hist_schema) = options
            .replication
            .as_ref()
            .map_or((HISTORY_NONE, 0), |r| {
                (r.history_type(), r.history_schema_version())
            });

        let mut retries_left = ATTACH_MAX_RETRIES;
        let mut rng: Option<fastrand::Rng> = None;
        loop {
            if retries_left < ATTACH_MAX_RETRIES {
                // Bounded randomized back-off; the generator is seeded
                // from system entropy on the first retry.
                let rng = rng.get_or_insert_with(fastrand::Rng::new);
                let window = u64::from(ATTACH_MAX_RETRIES - retries_left) * 10;
                std::thread::sleep(Duration::from_millis(rng.u64(0..window.max(1))));
            }

            let lock_file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&lockfile_path)
                .map_err(|e| Error::io("open", &lockfile_path, e))?;

            if file_lock::try_lock_exclusive(&lock_file, &lockfile_path)? {
                // We are alone in the world: initialize the lock file.
                // Truncating first guarantees a zero-filled header region,
                // in particular init_complete == 0 until we publish.
                lock_file
                    .set_len(0)
                    .map_err(|e| Error::io("truncate", &lockfile_path, e))?;
                sys::prealloc(&lock_file, SharedHeader::SIZE as u64, &lockfile_path)?;
                let init_map = FileMap::map(&lock_file, SharedHeader::SIZE, &lockfile_path)?;
                let hp = init_map.as_ptr().cast::<SharedHeader>();
                // SAFETY: freshly truncated and preallocated region of
                // SIZE zeroed bytes, unobservable while we hold the
                // exclusive lock.
                unsafe {
                    SharedHeader::init_at(hp, options.durability, hist_type, hist_schema)?;
                    // Publication point: everything above becomes visible
                    // together with this flag, and never before.
                    (*hp).init_complete.store(1, Ordering::Release);
                }
                drop(init_map);
                file_lock::unlock(&lock_file, &lockfile_path)?;
                log::debug!("[DB] initialized lock file {}", lockfile_path.display());
            }

            // Joiner or initializer: from here on we hold the shared lock
            // until close.
            file_lock::lock_shared(&lock_file, &lockfile_path)?;

            // The management dir may be needed for lock emulation
            // fallbacks; creating it is racy but harmless.
            let _ = std::fs::create_dir_all(&management_dir);

            let file_len = lock_file
                .metadata()
                .map_err(|e| Error::io("stat", &lockfile_path, e))?
                .len() as usize;
            if file_len == 0 {
                // An initializer truncated but died before preallocating.
                file_lock::unlock(&lock_file, &lockfile_path)?;
                continue;
            }

            // Map at most the header; one byte suffices to read
            // init_complete.
            let map_len = file_len.min(SharedHeader::SIZE);
            let header_map = FileMap::map(&lock_file, map_len, &lockfile_path)?;
            // SAFETY: the mapping covers at least the frozen prefix; no
            // field beyond init_complete is read before the flag check.
            let hdr = unsafe { &*header_map.as_ptr().cast::<SharedHeader>() };

            if hdr.init_complete.load(Ordering::Acquire) == 0 {
                // Initialization in progress failed; retry to become the
                // initializer ourselves.
                drop(header_map);
                file_lock::unlock(&lock_file, &lockfile_path)?;
                continue;
            }

            if file_len < SharedHeader::SIZE || !hdr.layout_matches() {
                drop(header_map);
                file_lock::unlock(&lock_file, &lockfile_path)?;
                if retries_left > 0 {
                    retries_left -= 1;
                    continue;
                }
                return Err(Error::IncompatibleLockFile {
                    path: lockfile_path,
                    reason: if file_len < SharedHeader::SIZE {
                        format!("header is {file_len} bytes, expected {}", SharedHeader::SIZE)
                    } else {
                        "layout version or primitive sizes mismatch".to_string()
                    },
                });
            }

            // Sizes match, but the mutex implementation may still differ;
            // ask one of them.
            if !hdr.control_mutex.is_valid() {
                return Err(Error::IncompatibleLockFile {
                    path: lockfile_path,
                    reason: "control mutex is invalid".to_string(),
                });
            }

            return Self::join_session(
                path.clone(),
                lockfile_path.clone(),
                lock_file,
                header_map,
                no_create,
                &options,
                hist_type,
                hist_schema,
            );
        }
    }

    /// Complete the attach under the control mutex: map the ring, attach
    /// the data file, validate or seed session state, count ourselves in.
    #[allow(clippy::too_many_arguments)]
    fn join_session(
        path: PathBuf,
        lockfile_path: PathBuf,
        lock_file: File,
        header_map: FileMap,
        no_create: bool,
        options: &DbOptions,
        hist_type: i8,
        hist_schema: u16,
    ) -> Result<Arc<Self>> {
        // SAFETY: header_map covers the full validated header from here on.
        let hdr = unsafe { &*header_map.as_ptr().cast::<SharedHeader>() };
        let guard = hdr.control_mutex.lock_guard()?;

        // The ring may have been expanded by an earlier session
        // participant; map the full extent. A second mapping is needed
        // because remapping could move the mutexes we hold.
        let local_max_entry = hdr.ring.num_entries();
        let reader_size = SharedHeader::SIZE + VersionRing::required_space(local_max_entry);
        let reader_map = FileMap::map(&lock_file, reader_size, &lockfile_path)?;

        let begin_new_session = hdr.num_participants.load(Ordering::Relaxed) == 0;
        let durability = hdr.durability().ok_or_else(|| Error::IncompatibleLockFile {
            path: lockfile_path.clone(),
            reason: format!("unknown durability value {}", hdr.durability),
        })?;

        let cfg = StorageAttachCfg {
            session_initiator: begin_new_session,
            // Only the session initiator may create the database; joiners
            // must assume it exists.
            no_create: if begin_new_session { no_create } else { true },
            // A MemOnly file should have been deleted on last close; if a
            // crash left it behind, start over from empty.
            clear_file: durability == Durability::MemOnly && begin_new_session,
            history_type: hist_type,
            history_schema_version: hist_schema,
            allow_file_format_upgrade: options.allow_file_format_upgrade,
        };
        let (storage, sinfo) = StorageFile::attach(&path, &cfg)?;

        if begin_new_session {
            hdr.file_format_version
                .store(sinfo.file_format_version, Ordering::Relaxed);
            hdr.number_of_versions.store(1, Ordering::Relaxed);
            hdr.latest_version_number
                .store(sinfo.version, Ordering::Relaxed);
            storage.init_mapping_management(sinfo.version);

            // Seed the ring from the on-disk root. We are alone under the
            // control mutex with zero participants, so reopening the last
            // entry is race-free.
            let ring = ring_at(&reader_map);
            // SAFETY: sole participant, control mutex held, mapping
            // covers the ring.
            unsafe {
                let e = ring.reinit_last();
                e.version.store(sinfo.version, Ordering::Relaxed);
                e.top_ref.store(sinfo.top_ref, Ordering::Relaxed);
                e.file_size.store(sinfo.file_size, Ordering::Relaxed);
            }
            log::debug!(
                "[DB] session initiated at version {} ({})",
                sinfo.version,
                path.display()
            );
        } else {
            // Joining a running session: all stamps must agree.
            if durability != options.durability {
                return Err(Error::Logic(LogicErrorKind::MixedDurability));
            }
            if hdr.history_type != hist_type {
                return Err(Error::Logic(LogicErrorKind::MixedHistoryType));
            }
            if hdr.history_schema_version != hist_schema {
                return Err(Error::Logic(LogicErrorKind::MixedHistorySchemaVersion));
            }
            if hdr.file_format_version.load(Ordering::Relaxed) != sinfo.file_format_version {
                return Err(Error::IncompatibleLockFile {
                    path: lockfile_path,
                    reason: format!(
                        "session file format {} does not match {}",
                        hdr.file_format_version.load(Ordering::Relaxed),
                        sinfo.file_format_version
                    ),
                });
            }
            storage.init_mapping_management(hdr.latest_version_number.load(Ordering::Relaxed));
            log::debug!("[DB] joined session ({})", path.display());
        }

        hdr.num_participants.fetch_add(1, Ordering::Relaxed);
        drop(guard);

        let enable_async = options.enable_async_writes;
        let db = Arc::new_cyclic(|weak| Db {
            path,
            lockfile_path,
            replication: options.replication.clone(),
            lock_file,
            header_map,
            storage,
            local: Mutex::new(LocalState {
                reader_map,
                local_max_entry,
                locks_held: Vec::new(),
                transaction_count: 0,
                write_transaction_open: false,
            }),
            wait_for_change_enabled: AtomicBool::new(true),
            is_sync_agent: AtomicBool::new(false),
            attached: AtomicBool::new(true),
            commit_helper: enable_async
                .then(|| async_commit::AsyncCommitHelper::new(weak.clone())),
        });
        Ok(db)
    }

    /// The shared header (fixed mapping).
    #[inline]
    pub(crate) fn hdr(&self) -> &SharedHeader {
        // SAFETY: header_map covers SharedHeader::SIZE for the lifetime
        // of self and the header was validated at attach.
        unsafe { &*self.header_map.as_ptr().cast::<SharedHeader>() }
    }

    /// The ring through the (growable) reader mapping.
    #[inline]
    pub(crate) fn ring<'a>(&self, local: &'a LocalState) -> &'a VersionRing {
        ring_at(&local.reader_map)
    }

    fn ensure_attached(&self) -> Result<()> {
        if self.attached.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(Error::wrong_transact_state())
        }
    }

    /// Extend the reader mapping so `index` is addressable.
    ///
    /// Returns `true` if a remap happened — the caller should restart its
    /// probe with a fresh index, since remapping takes time.
    pub(crate) fn grow_reader_mapping(
        &self,
        local: &mut LocalState,
        index: u32,
    ) -> Result<bool> {
        if index >= local.local_max_entry {
            let entries = self.ring(local).num_entries();
            debug_assert!(index < entries);
            let size = SharedHeader::SIZE + VersionRing::required_space(entries);
            local.reader_map.remap(&self.lock_file, size)?;
            local.local_max_entry = entries;
            return Ok(true);
        }
        Ok(false)
    }

    /// Pin the latest snapshot (or a specific one) in the ring.
    pub(crate) fn grab_read_lock(&self, version: Option<VersionId>) -> Result<ReadLock> {
        let mut local = self.local.lock();
        self.ensure_attached()?;
        match version {
            None => loop {
                let idx = self.ring(&local).last();
                if self.grow_reader_mapping(&mut local, idx)? {
                    continue;
                }
                let ring = self.ring(&local);
                // SAFETY: idx <= local_max_entry - 1 after the grow check.
                let entry = unsafe { ring.entry(idx) };
                // The entry can have been recycled under our feet between
                // reading put_pos and getting here; extremely unlikely,
                // just start over.
                if !ring::acquire_if_even(&entry.count) {
                    continue;
                }
                let lock = ReadLock {
                    reader_idx: idx,
                    version: entry.version.load(Ordering::Relaxed),
                    top_ref: entry.top_ref.load(Ordering::Relaxed),
                    file_size: entry.file_size.load(Ordering::Relaxed),
                };
                local.locks_held.push(lock);
                local.transaction_count += 1;
                return Ok(lock);
            },
            Some(vid) => loop {
                let idx = vid.index;
                if self.grow_reader_mapping(&mut local, idx)? {
                    continue;
                }
                let ring = self.ring(&local);
                // SAFETY: idx < local_max_entry after the grow check.
                let entry = unsafe { ring.entry(idx) };
                while !ring::acquire_if_even(&entry.count) {
                    // The acquire can fail because the entry was freed, or
                    // because cleanup is probing it right now. While the
                    // ring tail still points at it, it is being probed and
                    // may come back; once the tail has moved on, the entry
                    // is gone for good.
                    if ring.oldest_pos() != idx {
                        return Err(Error::BadVersion(vid.version));
                    }
                }
                if entry.version.load(Ordering::Relaxed) != vid.version {
                    // Locked a recycled slot holding some newer snapshot.
                    ring::release_shared(&entry.count);
                    return Err(Error::BadVersion(vid.version));
                }
                let lock = ReadLock {
                    reader_idx: idx,
                    version: vid.version,
                    top_ref: entry.top_ref.load(Ordering::Relaxed),
                    file_size: entry.file_size.load(Ordering::Relaxed),
                };
                local.locks_held.push(lock);
                local.transaction_count += 1;
                return Ok(lock);
            },
        }
    }

    /// Release a held read lock. Idempotent against a racing `close` that
    /// already dropped the whole list.
    pub(crate) fn release_read_lock(&self, lock: &ReadLock) {
        let mut local = self.local.lock();
        // Linear scan with swap-remove; the per-process list is small.
        let Some(pos) = local
            .locks_held
            .iter()
            .position(|l| l.version == lock.version)
        else {
            debug_assert!(!self.attached.load(Ordering::Acquire));
            return;
        };
        local.locks_held.swap_remove(pos);
        local.transaction_count -= 1;
        let ring = self.ring(&local);
        // SAFETY: a held lock's index is always within the mapped ring.
        let entry = unsafe { ring.entry(lock.reader_idx) };
        ring::release_shared(&entry.count);
    }

    /// Forget a read lock without decrementing the ring entry. Used when
    /// an async commit failed and the pinned version must never be
    /// recycled (its storage is what the file header references).
    pub(crate) fn leak_read_lock(&self, lock: &ReadLock) {
        let mut local = self.local.lock();
        if let Some(pos) = local
            .locks_held
            .iter()
            .position(|l| l.version == lock.version)
        {
            local.locks_held.swap_remove(pos);
            local.transaction_count -= 1;
        }
    }

    /// Begin a snapshot-isolated read transaction.
    ///
    /// With a `VersionId`, pins that exact snapshot and fails with
    /// `BadVersion` if it has been reclaimed.
    pub fn start_read(self: &Arc<Self>, version: Option<VersionId>) -> Result<Transaction> {
        self.ensure_attached()?;
        let lock = self.grab_read_lock(version)?;
        Transaction::new(Arc::clone(self), lock, TransactStage::Reading)
    }

    /// Begin a frozen transaction: a read pinned to a snapshot, immune to
    /// later commits.
    pub fn start_frozen(self: &Arc<Self>, version: Option<VersionId>) -> Result<Transaction> {
        self.ensure_attached()?;
        let lock = self.grab_read_lock(version)?;
        Transaction::new(Arc::clone(self), lock, TransactStage::Frozen)
    }

    /// Begin a write transaction, blocking behind the fair write-lock
    /// scheduler.
    ///
    /// Fails with `SessionPoisoned` if a previous writer crashed in the
    /// critical phase of its commit.
    pub fn start_write(self: &Arc<Self>) -> Result<Transaction> {
        self.ensure_attached()?;
        self.begin_possibly_async_write()?;
        self.writer_transaction()
    }

    /// Non-blocking `start_write`: `Ok(None)` when the write lock is
    /// contended. Bypasses the fairness ticketing.
    pub fn try_start_write(self: &Arc<Self>) -> Result<Option<Transaction>> {
        self.ensure_attached()?;
        if !self.do_try_begin_write()? {
            return Ok(None);
        }
        self.writer_transaction().map(Some)
    }

    /// Build the transaction once the write lock is held.
    fn writer_transaction(self: &Arc<Self>) -> Result<Transaction> {
        let lock = match self.grab_read_lock(None) {
            Ok(lock) => lock,
            Err(e) => {
                self.end_write_on_correct_thread();
                return Err(e);
            }
        };
        if let Some(repl) = &self.replication {
            if let Err(e) = repl.initiate_transact(lock.version) {
                self.release_read_lock(&lock);
                self.end_write_on_correct_thread();
                return Err(e);
            }
        }
        match Transaction::new(Arc::clone(self), lock, TransactStage::Writing) {
            Ok(txn) => Ok(txn),
            Err(e) => {
                // Transaction::new released the lock on failure.
                self.end_write_on_correct_thread();
                Err(e)
            }
        }
    }

    /// Latest snapshot as `(version, ring index)` without holding it.
    pub fn version_id_of_latest_snapshot(&self) -> Result<VersionId> {
        let mut local = self.local.lock();
        self.ensure_attached()?;
        loop {
            let idx = self.ring(&local).last();
            if self.grow_reader_mapping(&mut local, idx)? {
                continue;
            }
            let ring = self.ring(&local);
            // SAFETY: idx is within the freshly grown mapping.
            let entry = unsafe { ring.entry(idx) };
            // Hold the entry just long enough to read a consistent version.
            if !ring::acquire_if_even(&entry.count) {
                continue;
            }
            let version = entry.version.load(Ordering::Relaxed);
            ring::release_shared(&entry.count);
            return Ok(VersionId { version, index: idx });
        }
    }

    /// Version of the latest snapshot.
    pub fn latest_version(&self) -> Result<u64> {
        Ok(self.version_id_of_latest_snapshot()?.version)
    }

    /// Number of snapshot versions the session currently retains.
    pub fn number_of_versions(&self) -> Result<u64> {
        self.ensure_attached()?;
        let hdr = self.hdr();
        let _guard = hdr.control_mutex.lock_guard()?;
        Ok(hdr.number_of_versions.load(Ordering::Relaxed))
    }

    /// True when a snapshot newer than the transaction's exists.
    pub fn has_changed(&self, txn: &Transaction) -> Result<bool> {
        Ok(txn.version() != self.latest_version()?)
    }

    /// Block until a version newer than the transaction's is committed by
    /// any participant. Returns `false` when released via
    /// [`wait_for_change_release`](Self::wait_for_change_release).
    pub fn wait_for_change(&self, txn: &Transaction) -> Result<bool> {
        self.ensure_attached()?;
        let hdr = self.hdr();
        let _guard = hdr.control_mutex.lock_guard()?;
        while txn.version() == hdr.latest_version_number.load(Ordering::Relaxed)
            && self.wait_for_change_enabled.load(Ordering::Acquire)
        {
            hdr.new_commit_available.wait(&hdr.control_mutex, None)?;
        }
        Ok(txn.version() != hdr.latest_version_number.load(Ordering::Relaxed))
    }

    /// Wake current and future `wait_for_change` callers until re-armed.
    pub fn wait_for_change_release(&self) -> Result<()> {
        self.ensure_attached()?;
        let hdr = self.hdr();
        let _guard = hdr.control_mutex.lock_guard()?;
        self.wait_for_change_enabled.store(false, Ordering::Release);
        hdr.new_commit_available.notify_all();
        Ok(())
    }

    /// Re-arm `wait_for_change` after a release.
    pub fn enable_wait_for_change(&self) -> Result<()> {
        self.ensure_attached()?;
        let hdr = self.hdr();
        let _guard = hdr.control_mutex.lock_guard()?;
        self.wait_for_change_enabled.store(true, Ordering::Release);
        Ok(())
    }

    /// Register this participant as the session's sync agent.
    ///
    /// At most one sync agent may exist per session.
    pub fn claim_sync_agent(&self) -> Result<()> {
        self.ensure_attached()?;
        let hdr = self.hdr();
        let _guard = hdr.control_mutex.lock_guard()?;
        if hdr.sync_agent_present.load(Ordering::Relaxed) != 0 {
            return Err(Error::MultipleSyncAgents);
        }
        hdr.sync_agent_present.store(1, Ordering::Relaxed);
        self.is_sync_agent.store(true, Ordering::Release);
        Ok(())
    }

    /// Release a previously claimed sync agent role. No-op when this
    /// participant is not the agent.
    pub fn release_sync_agent(&self) -> Result<()> {
        self.ensure_attached()?;
        if !self.is_sync_agent.load(Ordering::Acquire) {
            return Ok(());
        }
        let hdr = self.hdr();
        let _guard = hdr.control_mutex.lock_guard()?;
        hdr.sync_agent_present.store(0, Ordering::Relaxed);
        self.is_sync_agent.store(false, Ordering::Release);
        Ok(())
    }

    /// Rewrite the data file keeping only the latest snapshot.
    ///
    /// Requires being the sole participant with no open transactions;
    /// returns `Ok(false)` when other participants are attached.
    pub fn compact(&self) -> Result<bool> {
        self.ensure_attached()?;
        let hdr = self.hdr();
        let _guard = hdr.control_mutex.lock_guard()?;
        if hdr.num_participants.load(Ordering::Relaxed) != 1 {
            log::warn!(
                "[DB] compact refused: {} participants attached",
                hdr.num_participants.load(Ordering::Relaxed)
            );
            return Ok(false);
        }
        let mut local = self.local.lock();
        if local.transaction_count != 0 || local.write_transaction_open {
            return Err(Error::wrong_transact_state());
        }

        // Another (since departed) participant may have expanded the ring.
        loop {
            let idx = self.ring(&local).last();
            if !self.grow_reader_mapping(&mut local, idx)? {
                break;
            }
        }
        let ring = self.ring(&local);
        // SAFETY: sole participant with the control mutex held; the ring
        // cannot change under us.
        let (version, top_ref, file_size) = unsafe {
            let e = ring.entry(ring.last());
            (
                e.version.load(Ordering::Relaxed),
                e.top_ref.load(Ordering::Relaxed),
                e.file_size.load(Ordering::Relaxed),
            )
        };
        let payload = self.storage.read_snapshot(top_ref, file_size)?;
        let (new_top, new_size) =
            self.storage
                .rewrite(&payload, version, hdr.history_type, hdr.history_schema_version)?;

        // Re-seed the latest ring entry with the relocated root.
        // SAFETY: as above.
        unsafe {
            let e = ring.reinit_last();
            e.version.store(version, Ordering::Relaxed);
            e.top_ref.store(new_top, Ordering::Relaxed);
            e.file_size.store(new_size, Ordering::Relaxed);
        }
        drop(local);
        Ok(true)
    }

    /// Write a standalone copy of the latest snapshot to `dest`.
    pub fn write_copy(self: &Arc<Self>, dest: &Path) -> Result<()> {
        let txn = self.start_read(None)?;
        let hdr = self.hdr();
        StorageFile::export(
            dest,
            txn.data(),
            txn.version(),
            hdr.history_type,
            hdr.history_schema_version,
        )
    }

    /// Detach from the session.
    ///
    /// Fails with `wrong_transact_state` while a write transaction is
    /// open, or while read transactions are open and
    /// `allow_open_read_transactions` is false. The last participant of a
    /// `MemOnly` session deletes the data file.
    pub fn close(&self, allow_open_read_transactions: bool) -> Result<()> {
        if !self.attached.load(Ordering::Acquire) {
            return Ok(());
        }
        // The helper worker may hold the write mutex; stop it while the
        // Db is still fully alive so it can release cleanly.
        if let Some(helper) = &self.commit_helper {
            helper.shutdown();
        }
        {
            let local = self.local.lock();
            if local.write_transaction_open {
                return Err(Error::wrong_transact_state());
            }
            if !allow_open_read_transactions && local.transaction_count != 0 {
                return Err(Error::wrong_transact_state());
            }
        }
        let hdr = self.hdr();
        {
            let _guard = hdr.control_mutex.lock_guard()?;
            if self.is_sync_agent.swap(false, Ordering::AcqRel) {
                hdr.sync_agent_present.store(0, Ordering::Relaxed);
            }

            // Drop any read locks still registered (only possible with
            // allow_open_read_transactions).
            let mut local = self.local.lock();
            let held = std::mem::take(&mut local.locks_held);
            local.transaction_count = 0;
            for lock in &held {
                let ring = self.ring(&local);
                // SAFETY: held locks index mapped entries.
                let entry = unsafe { ring.entry(lock.reader_idx) };
                ring::release_shared(&entry.count);
            }
            self.attached.store(false, Ordering::Release);

            let remaining = hdr.num_participants.fetch_sub(1, Ordering::Relaxed) - 1;
            if remaining == 0 && hdr.durability() == Some(Durability::MemOnly) {
                // The file only ever backed shared memory; delete it.
                let _ = std::fs::remove_file(&self.path);
                log::debug!("[DB] removed MemOnly file {}", self.path.display());
            }
        }
        file_lock::unlock(&self.lock_file, &self.lockfile_path)?;
        log::debug!("[DB] closed {}", self.path.display());
        Ok(())
    }

    /// Run `callback` under the exclusive lock-file lock, i.e. only when
    /// no session is active for `path`. Returns `false` (without calling
    /// back) when a session exists.
    pub fn call_with_lock<F>(path: &Path, callback: F) -> Result<bool>
    where
        F: FnOnce(&Path),
    {
        let lockfile_path = core_file(path, CoreFileKind::Lock);
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lockfile_path)
            .map_err(|e| Error::io("open", &lockfile_path, e))?;
        if !file_lock::try_lock_exclusive(&lock_file, &lockfile_path)? {
            return Ok(false);
        }
        callback(path);
        file_lock::unlock(&lock_file, &lockfile_path)?;
        Ok(true)
    }

    /// Delete the files belonging to the database at `base`.
    ///
    /// Returns `true` when the data file existed and was removed. The
    /// caller is responsible for making sure no session is active (see
    /// [`call_with_lock`](Self::call_with_lock)).
    pub fn delete_files(base: &Path, delete_lockfile: bool) -> Result<bool> {
        let did_delete = std::fs::remove_file(core_file(base, CoreFileKind::Storage)).is_ok();
        let _ = std::fs::remove_file(core_file(base, CoreFileKind::Note));
        let _ = std::fs::remove_file(core_file(base, CoreFileKind::Log));
        if delete_lockfile {
            let _ = std::fs::remove_file(core_file(base, CoreFileKind::Lock));
            let _ = std::fs::remove_dir_all(core_file(base, CoreFileKind::Management));
        }
        Ok(did_delete)
    }

    /// Number of open transactions in this process (tests, diagnostics).
    pub fn local_transaction_count(&self) -> u32 {
        self.local.lock().transaction_count
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        // Transactions hold an Arc on the Db, so by the time we get here
        // none are left; stray registered locks cannot exist either.
        if let Err(e) = self.close(true) {
            log::warn!("[DB] close on drop failed: {e}");
        }
    }
}

/// View the ring inside a mapping that covers the shared header.
#[inline]
pub(crate) fn ring_at(map: &FileMap) -> &VersionRing {
    debug_assert!(map.size() >= SharedHeader::SIZE);
    // SAFETY: the mapping covers at least the header including the initial
    // ring block; entry accesses beyond it go through grow_reader_mapping.
    unsafe { &*map.as_ptr().add(RING_OFFSET).cast::<VersionRing>() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_file_derivation() {
        let base = Path::new("/tmp/objects.karst");
        assert_eq!(
            core_file(base, CoreFileKind::Lock),
            PathBuf::from("/tmp/objects.karst.lock")
        );
        assert_eq!(
            core_file(base, CoreFileKind::Management),
            PathBuf::from("/tmp/objects.karst.management")
        );
        assert_eq!(core_file(base, CoreFileKind::Storage), base.to_path_buf());
        assert_eq!(
            core_file(base, CoreFileKind::Note),
            PathBuf::from("/tmp/objects.karst.note")
        );
    }

    #[test]
    fn test_open_initializes_and_rejoins() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("db.karst");

        let db = Db::open(&path, false, DbOptions::default()).expect("open");
        assert_eq!(db.hdr().num_participants.load(Ordering::Relaxed), 1);

        // A second participant joins the same session.
        let db2 = Db::open(&path, false, DbOptions::default()).expect("open2");
        assert_eq!(db.hdr().num_participants.load(Ordering::Relaxed), 2);
        drop(db2);
        assert_eq!(db.hdr().num_participants.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_mixed_durability_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("db.karst");

        let _db = Db::open(&path, false, DbOptions::default()).expect("open");
        let result = Db::open(
            &path,
            false,
            DbOptions {
                durability: Durability::Unsafe,
                ..DbOptions::default()
            },
        );
        assert!(matches!(
            result,
            Err(Error::Logic(LogicErrorKind::MixedDurability))
        ));
    }

    #[test]
    fn test_stale_layout_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("db.karst");
        let lock_path = core_file(&path, CoreFileKind::Lock);

        {
            let _db = Db::open(&path, false, DbOptions::default()).expect("open");
        }
        // Corrupt the layout magic at offset 6 of the abandoned lock file.
        use std::os::unix::fs::FileExt;
        let f = OpenOptions::new()
            .write(true)
            .open(&lock_path)
            .expect("open lock");
        f.write_all_at(&[0xFF, 0xFF], 6).expect("scribble");
        // Keep a shared flock so the opener cannot become the initializer
        // and repair the file.
        file_lock::lock_shared(&f, &lock_path).expect("hold shared");

        let result = Db::open(&path, false, DbOptions::default());
        assert!(matches!(result, Err(Error::IncompatibleLockFile { .. })));
    }

    #[test]
    fn test_truncated_lock_file_reinitialized() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("db.karst");
        let lock_path = core_file(&path, CoreFileKind::Lock);

        // Simulate an initializer that died right after truncating.
        std::fs::write(&lock_path, b"").expect("create empty");
        let db = Db::open(&path, false, DbOptions::default()).expect("open");
        assert_eq!(db.hdr().num_participants.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_claim_sync_agent_exclusive() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("db.karst");

        let db = Db::open(&path, false, DbOptions::default()).expect("open");
        let db2 = Db::open(&path, false, DbOptions::default()).expect("open2");

        db.claim_sync_agent().expect("claim");
        assert!(matches!(
            db2.claim_sync_agent(),
            Err(Error::MultipleSyncAgents)
        ));
        db.release_sync_agent().expect("release");
        db2.claim_sync_agent().expect("claim after release");
    }

    #[test]
    fn test_call_with_lock_refused_while_open() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("db.karst");

        let db = Db::open(&path, false, DbOptions::default()).expect("open");
        let called = Db::call_with_lock(&path, |_| panic!("must not run")).expect("call");
        assert!(!called);
        drop(db);

        let mut ran = false;
        let called = Db::call_with_lock(&path, |_| ran = true).expect("call");
        assert!(called);
        assert!(ran);
    }

    #[test]
    fn test_delete_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("db.karst");
        {
            let _db = Db::open(&path, false, DbOptions::default()).expect("open");
        }
        assert!(path.exists());
        let deleted = Db::delete_files(&path, true).expect("delete");
        assert!(deleted);
        assert!(!path.exists());
        assert!(!core_file(&path, CoreFileKind::Lock).exists());
    }
}
