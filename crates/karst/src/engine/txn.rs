// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-handle transaction lifecycle.
//!
//! ```text
//!                  start_read / start_frozen
//! Ready ────────────────────────────────────► Reading | Frozen
//!   │                                              │
//!   │  start_write                                 │  end_read
//!   ▼                                              ▼
//! Writing ──rollback / commit─► Ready  ◄─────────  Ready
//!        └─ commit_and_continue_as_read ─► Reading
//!        └─ commit_and_continue_writing ─► Writing (new version)
//! ```
//!
//! While the root stage is `Reading` or `Writing`, an async sub-state
//! tracks the helper thread's involvement:
//!
//! ```text
//! Idle ─ request_write_lock_async ─► Requesting ─ worker acquires ─► HasLock
//! HasLock ─ commit w/o flush ─► HasCommits ─ async_complete_writes ─► Syncing ─► Idle
//! HasLock ─ sync commit / rollback ─► Idle
//! ```
//!
//! A commit with `commit_to_disk == false` publishes the snapshot to all
//! participants but leaves the data file header behind. The transaction
//! then pins the oldest un-persisted version with an ordinary read lock
//! until a durable commit (or the deferred flush) catches the file up —
//! the pin is what keeps that version's storage from being recycled while
//! the on-disk header still references it.

use super::{Db, ReadLock, VersionId};
use crate::config::Durability;
use crate::error::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

use self::TransactStage as Stage;

/// Transaction stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactStage {
    /// No snapshot attached
    Ready,
    /// Live read attached to a snapshot that tracks commits via
    /// `commit_and_continue_*` flows
    Reading,
    /// Write in progress on top of a snapshot
    Writing,
    /// Pinned to a snapshot, immune to later commits
    Frozen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AsyncStage {
    Idle,
    Requesting,
    HasLock,
    HasCommits,
    Syncing,
}

struct AsyncInner {
    stage: AsyncStage,
    waiting_for_write_lock: bool,
    waiting_for_sync: bool,
    commit_failed: bool,
    /// Read lock on the oldest version not yet persisted to the file
    /// header (see module docs).
    pinned: Option<ReadLock>,
}

/// Async sub-state shared between the transaction and the callbacks it
/// hands to the commit helper.
struct AsyncCtl {
    state: Mutex<AsyncInner>,
    cv: Condvar,
}

impl AsyncCtl {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(AsyncInner {
                stage: AsyncStage::Idle,
                waiting_for_write_lock: false,
                waiting_for_sync: false,
                commit_failed: false,
                pinned: None,
            }),
            cv: Condvar::new(),
        })
    }
}

/// Flush the newest published snapshot into the data file header and drop
/// the un-persisted pin. Runs on the helper thread (or inline during
/// close); `inner` is the already-locked async state.
fn complete_async_commit(db: &Db, inner: &mut AsyncInner) {
    let result = (|| -> Result<()> {
        let lock = db.grab_read_lock(None)?;
        let sync = db.hdr().durability() == Some(Durability::Full);
        let res = db
            .storage
            .commit_header(lock.version, lock.top_ref, lock.file_size, sync);
        db.release_read_lock(&lock);
        res
    })();
    match result {
        Ok(()) => {
            if let Some(pin) = inner.pinned.take() {
                db.release_read_lock(&pin);
            }
        }
        Err(e) => {
            // Keep the pin: the file header still references that
            // version, so its storage must never be recycled.
            log::error!("[ASYNC] deferred commit failed: {e}");
            inner.commit_failed = true;
        }
    }
}

/// A transaction handle. Owns at most one read lock; a write transaction
/// additionally holds the session write mutex until commit or rollback.
///
/// Dropping the handle rolls back an open write and releases all locks.
pub struct Transaction {
    db: Arc<Db>,
    stage: Stage,
    read_lock: Option<ReadLock>,
    /// Version of the attached (or last committed) snapshot; kept valid
    /// after locks are released so `wait_for_change` can compare.
    version: u64,
    /// Working copy of the snapshot payload (the object graph root's
    /// serialized form as far as this layer is concerned).
    payload: Vec<u8>,
    async_ctl: Arc<AsyncCtl>,
}

impl Transaction {
    pub(crate) fn new(db: Arc<Db>, lock: ReadLock, stage: Stage) -> Result<Self> {
        let payload = match db.storage.read_snapshot(lock.top_ref, lock.file_size) {
            Ok(p) => p,
            Err(e) => {
                db.release_read_lock(&lock);
                return Err(e);
            }
        };
        Ok(Self {
            db,
            stage,
            version: lock.version,
            read_lock: Some(lock),
            payload,
            async_ctl: AsyncCtl::new(),
        })
    }

    /// Current stage.
    #[must_use]
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Version of the snapshot this transaction sees.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Snapshot identity (version plus ring slot), usable with
    /// `start_read` / `start_frozen`.
    pub fn version_id(&self) -> Result<VersionId> {
        let lock = self.read_lock.as_ref().ok_or_else(Error::wrong_transact_state)?;
        Ok(VersionId {
            version: lock.version,
            index: lock.reader_idx,
        })
    }

    /// The snapshot payload.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.payload
    }

    /// Replace the payload. Only legal while writing.
    pub fn set_data(&mut self, data: impl Into<Vec<u8>>) -> Result<()> {
        if self.stage != Stage::Writing {
            return Err(Error::wrong_transact_state());
        }
        self.payload = data.into();
        Ok(())
    }

    /// Commit and detach, returning the new version.
    ///
    /// Atomic with respect to all other participants; the write mutex is
    /// always released. On failure the file is unchanged and the stage
    /// drops to `Ready`.
    pub fn commit(&mut self) -> Result<u64> {
        if self.stage != Stage::Writing {
            return Err(Error::wrong_transact_state());
        }
        let commit_result = self.db.do_commit(&self.payload, true);

        match commit_result {
            Ok(new_version) => {
                self.end_write_releasing_pin();
                self.detach_read();
                // The handle keeps tracking its own commit, so
                // wait_for_change on it compares against the right
                // version.
                self.version = new_version;
                Ok(new_version)
            }
            Err(e) => {
                if let Some(repl) = &self.db.replication {
                    repl.abort_transact();
                }
                self.end_write_releasing_pin();
                self.detach_read();
                Err(e)
            }
        }
    }

    /// Commit but keep the handle attached as a reader of the snapshot it
    /// just produced.
    ///
    /// With `commit_to_disk == false` the flush is deferred (async flow);
    /// the pre-commit version stays pinned until data reaches disk.
    pub fn commit_and_continue_as_read(&mut self, commit_to_disk: bool) -> Result<VersionId> {
        if self.stage != Stage::Writing {
            return Err(Error::wrong_transact_state());
        }
        let new_version = self.db.do_commit(&self.payload, commit_to_disk)?;

        // Under the write mutex still, the latest snapshot IS our commit.
        // Grab the new lock before releasing the old one so the local
        // transaction count never dips to zero.
        let new_lock = self.db.grab_read_lock(None)?;
        debug_assert_eq!(new_lock.version, new_version);

        let old_lock = self.read_lock.take();
        {
            let mut a = self.async_ctl.state.lock();
            if let Some(old) = old_lock {
                if commit_to_disk || a.pinned.is_some() {
                    // Durable, or an older version is already pinned:
                    // this historic version needs no pin of its own.
                    self.db.release_read_lock(&old);
                } else {
                    a.pinned = Some(old);
                }
            }
            if commit_to_disk {
                if let Some(pin) = a.pinned.take() {
                    self.db.release_read_lock(&pin);
                }
            }

            debug_assert!(a.stage != AsyncStage::Syncing);
            if commit_to_disk {
                if a.stage == AsyncStage::Requesting {
                    a.stage = AsyncStage::HasLock;
                } else {
                    a.stage = AsyncStage::Idle;
                    drop(a);
                    self.db.end_write_on_correct_thread();
                }
            } else {
                a.stage = AsyncStage::HasCommits;
            }
        }

        self.version = new_lock.version;
        self.read_lock = Some(new_lock);
        self.stage = Stage::Reading;
        Ok(VersionId {
            version: new_version,
            index: new_lock.reader_idx,
        })
    }

    /// Commit and immediately continue writing on top of the new version,
    /// without releasing the write mutex.
    pub fn commit_and_continue_writing(&mut self) -> Result<u64> {
        if self.stage != Stage::Writing {
            return Err(Error::wrong_transact_state());
        }
        let new_version = self.db.do_commit(&self.payload, true)?;

        let new_lock = self.db.grab_read_lock(None)?;
        if let Some(old) = self.read_lock.take() {
            self.db.release_read_lock(&old);
        }
        self.version = new_lock.version;
        self.read_lock = Some(new_lock);
        if let Some(repl) = &self.db.replication {
            repl.initiate_transact(new_lock.version)?;
        }
        Ok(new_version)
    }

    /// Abandon an open write. No observable change to the file.
    /// Idempotent on a `Ready` handle.
    pub fn rollback(&mut self) -> Result<()> {
        if self.stage == Stage::Ready {
            return Ok(());
        }
        if self.stage != Stage::Writing {
            return Err(Error::wrong_transact_state());
        }
        if let Some(repl) = &self.db.replication {
            repl.abort_transact();
        }
        // When the async sub-state owns the lock, prepare_for_close
        // releases it; otherwise do it here.
        let release_now = self.async_ctl.state.lock().stage == AsyncStage::Idle;
        if release_now {
            self.db.end_write_on_correct_thread();
        }
        self.stage = Stage::Reading;
        self.do_end_read();
        Ok(())
    }

    /// Detach a reader. Idempotent on a `Ready` handle; not legal while
    /// writing.
    pub fn end_read(&mut self) -> Result<()> {
        match self.stage {
            Stage::Ready => Ok(()),
            Stage::Writing => Err(Error::wrong_transact_state()),
            Stage::Reading | Stage::Frozen => {
                self.do_end_read();
                Ok(())
            }
        }
    }

    /// A frozen handle pinned to this transaction's snapshot. Cheap.
    pub fn freeze(&self) -> Result<Transaction> {
        if self.stage != Stage::Reading {
            return Err(Error::wrong_transact_state());
        }
        self.db.start_frozen(Some(self.version_id()?))
    }

    /// A second handle on the same snapshot, same stage.
    pub fn duplicate(&self) -> Result<Transaction> {
        match self.stage {
            Stage::Reading => self.db.start_read(Some(self.version_id()?)),
            Stage::Frozen => self.db.start_frozen(Some(self.version_id()?)),
            _ => Err(Error::wrong_transact_state()),
        }
    }

    /// Promote a reader to a writer on top of the latest snapshot.
    pub fn promote_to_write(&mut self) -> Result<()> {
        if self.stage != Stage::Reading {
            return Err(Error::wrong_transact_state());
        }
        self.acquire_write_lock()?;

        // Advance to the newest snapshot under the now-held write lock.
        let new_lock = match self.db.grab_read_lock(None) {
            Ok(lock) => lock,
            Err(e) => {
                self.end_write_releasing_pin();
                return Err(e);
            }
        };
        let payload = match self
            .db
            .storage
            .read_snapshot(new_lock.top_ref, new_lock.file_size)
        {
            Ok(p) => p,
            Err(e) => {
                self.db.release_read_lock(&new_lock);
                self.end_write_releasing_pin();
                return Err(e);
            }
        };
        if let Some(old) = self.read_lock.take() {
            self.db.release_read_lock(&old);
        }
        self.version = new_lock.version;
        self.read_lock = Some(new_lock);
        self.payload = payload;
        if let Some(repl) = &self.db.replication {
            repl.initiate_transact(new_lock.version)?;
        }
        self.stage = Stage::Writing;
        Ok(())
    }

    /// Ask the helper thread to acquire the write lock; `cb` fires on the
    /// worker once it is held (unless a blocking waiter got there first).
    pub fn request_write_lock_async(&mut self, cb: Box<dyn FnOnce() + Send>) -> Result<()> {
        if self.stage != Stage::Reading {
            return Err(Error::wrong_transact_state());
        }
        {
            let mut a = self.async_ctl.state.lock();
            if a.stage != AsyncStage::Idle {
                return Err(Error::wrong_transact_state());
            }
            a.stage = AsyncStage::Requesting;
        }
        let ctl = Arc::clone(&self.async_ctl);
        let result = self.db.async_begin_write(Box::new(move || {
            let mut a = ctl.state.lock();
            if a.stage == AsyncStage::Requesting {
                a.stage = AsyncStage::HasLock;
            }
            if a.waiting_for_write_lock {
                a.waiting_for_write_lock = false;
                ctl.cv.notify_all();
            } else {
                drop(a);
                cb();
            }
        }));
        if result.is_err() {
            self.async_ctl.state.lock().stage = AsyncStage::Idle;
        }
        result
    }

    /// Finish an async write burst: release the lock when nothing is
    /// pending, or schedule the deferred flush. `when_synchronized` fires
    /// on the worker after a scheduled flush completes.
    pub fn async_complete_writes(
        &mut self,
        when_synchronized: Option<Box<dyn FnOnce() + Send>>,
    ) -> Result<()> {
        let mut a = self.async_ctl.state.lock();
        match a.stage {
            AsyncStage::HasLock => {
                // Nothing was committed; just give the lock back.
                a.stage = AsyncStage::Idle;
                drop(a);
                self.db.async_end_write()
            }
            AsyncStage::HasCommits => {
                a.stage = AsyncStage::Syncing;
                a.commit_failed = false;
                drop(a);
                let ctl = Arc::clone(&self.async_ctl);
                let db = Arc::clone(&self.db);
                self.db.async_sync_to_disk(Box::new(move || {
                    let mut a = ctl.state.lock();
                    complete_async_commit(&db, &mut a);
                    a.stage = AsyncStage::Idle;
                    if a.waiting_for_sync {
                        a.waiting_for_sync = false;
                        ctl.cv.notify_all();
                    } else if let Some(cb) = when_synchronized {
                        drop(a);
                        cb();
                    }
                }))
            }
            _ => Ok(()),
        }
    }

    /// Blockingly acquire the write lock, respecting an in-flight async
    /// request instead of racing it.
    fn acquire_write_lock(&mut self) -> Result<()> {
        let mut a = self.async_ctl.state.lock();
        match a.stage {
            AsyncStage::Idle => {
                drop(a);
                self.db.begin_possibly_async_write()
            }
            AsyncStage::Requesting => {
                a.waiting_for_write_lock = true;
                while a.waiting_for_write_lock {
                    self.async_ctl.cv.wait(&mut a);
                }
                Ok(())
            }
            AsyncStage::HasLock | AsyncStage::HasCommits => Ok(()),
            AsyncStage::Syncing => {
                a.waiting_for_sync = true;
                while a.waiting_for_sync {
                    self.async_ctl.cv.wait(&mut a);
                }
                drop(a);
                self.db.begin_possibly_async_write()
            }
        }
    }

    /// Release the write lock and any un-persisted pin after a durable
    /// commit (or a failed one).
    fn end_write_releasing_pin(&mut self) {
        let mut a = self.async_ctl.state.lock();
        if let Some(pin) = a.pinned.take() {
            self.db.release_read_lock(&pin);
        }
        a.stage = AsyncStage::Idle;
        drop(a);
        self.db.end_write_on_correct_thread();
    }

    /// Settle the async sub-state before detaching: wait out in-flight
    /// worker activity, flush what must be flushed, release what we hold.
    fn prepare_for_close(&mut self) {
        let ctl = Arc::clone(&self.async_ctl);
        let mut a = ctl.state.lock();
        match a.stage {
            AsyncStage::Idle => {}
            AsyncStage::Requesting => {
                // The claim cannot be cancelled; wait for the worker to
                // acquire, then release.
                a.waiting_for_write_lock = true;
                while a.waiting_for_write_lock {
                    ctl.cv.wait(&mut a);
                }
                drop(a);
                self.db.end_write_on_correct_thread();
                a = ctl.state.lock();
            }
            AsyncStage::HasLock => {
                if self.stage == Stage::Writing {
                    self.stage = Stage::Reading;
                }
                if a.pinned.is_some() {
                    complete_async_commit(&self.db, &mut a);
                }
                drop(a);
                self.db.end_write_on_correct_thread();
                a = ctl.state.lock();
            }
            AsyncStage::HasCommits => {
                complete_async_commit(&self.db, &mut a);
                drop(a);
                self.db.end_write_on_correct_thread();
                a = ctl.state.lock();
            }
            AsyncStage::Syncing => {
                // The worker is flushing on our behalf; wait it out.
                a.waiting_for_sync = true;
                while a.waiting_for_sync {
                    ctl.cv.wait(&mut a);
                }
            }
        }
        a.stage = AsyncStage::Idle;
    }

    fn detach_read(&mut self) {
        if let Some(lock) = self.read_lock.take() {
            self.db.release_read_lock(&lock);
        }
        self.stage = Stage::Ready;
    }

    fn do_end_read(&mut self) {
        self.prepare_for_close();
        {
            let mut a = self.async_ctl.state.lock();
            if let Some(pin) = a.pinned.take() {
                if a.commit_failed {
                    // The file header references this version; recycling
                    // its storage would corrupt the database. Leak the
                    // ring slot instead.
                    self.db.leak_read_lock(&pin);
                } else {
                    self.db.release_read_lock(&pin);
                }
            }
        }
        self.detach_read();
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        match self.stage {
            Stage::Writing => {
                if let Err(e) = self.rollback() {
                    log::warn!("[DB] rollback on drop failed: {e}");
                }
            }
            Stage::Reading | Stage::Frozen => self.do_end_read(),
            Stage::Ready => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DbOptions;

    fn open_scratch() -> (tempfile::TempDir, Arc<Db>) {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Db::open(dir.path().join("db.karst"), false, DbOptions::default())
            .expect("open");
        (dir, db)
    }

    #[test]
    fn test_write_commit_read_roundtrip() {
        let (_dir, db) = open_scratch();
        let mut txn = db.start_write().expect("start_write");
        assert_eq!(txn.stage(), TransactStage::Writing);
        txn.set_data(b"the payload".to_vec()).expect("set_data");
        let v = txn.commit().expect("commit");
        assert_eq!(v, 1);
        assert_eq!(txn.stage(), TransactStage::Ready);

        let reader = db.start_read(None).expect("start_read");
        assert_eq!(reader.version(), 1);
        assert_eq!(reader.data(), b"the payload");
    }

    #[test]
    fn test_double_commit_rejected() {
        let (_dir, db) = open_scratch();
        let mut txn = db.start_write().expect("start_write");
        txn.set_data(b"x".to_vec()).expect("set_data");
        txn.commit().expect("commit");
        assert!(matches!(
            txn.commit(),
            Err(Error::Logic(crate::error::LogicErrorKind::WrongTransactState))
        ));
        assert_eq!(db.latest_version().expect("latest"), 1);
    }

    #[test]
    fn test_rollback_leaves_file_unchanged() {
        let (_dir, db) = open_scratch();
        {
            let mut txn = db.start_write().expect("w1");
            txn.set_data(b"kept".to_vec()).expect("set");
            txn.commit().expect("commit");
        }
        let mut txn = db.start_write().expect("w2");
        txn.set_data(b"discarded".to_vec()).expect("set");
        txn.rollback().expect("rollback");
        // Idempotent.
        txn.rollback().expect("rollback again");

        let reader = db.start_read(None).expect("read");
        assert_eq!(reader.version(), 1);
        assert_eq!(reader.data(), b"kept");
    }

    #[test]
    fn test_set_data_outside_write_rejected() {
        let (_dir, db) = open_scratch();
        let mut reader = db.start_read(None).expect("read");
        assert!(reader.set_data(b"nope".to_vec()).is_err());
    }

    #[test]
    fn test_freeze_pins_version() {
        let (_dir, db) = open_scratch();
        {
            let mut txn = db.start_write().expect("w");
            txn.set_data(b"v1".to_vec()).expect("set");
            txn.commit().expect("commit");
        }
        let reader = db.start_read(None).expect("read");
        let frozen = reader.freeze().expect("freeze");
        assert_eq!(frozen.stage(), TransactStage::Frozen);
        assert_eq!(frozen.version(), reader.version());
        drop(reader);

        // Later commits do not move the frozen handle.
        {
            let mut txn = db.start_write().expect("w");
            txn.set_data(b"v2".to_vec()).expect("set");
            txn.commit().expect("commit");
        }
        assert_eq!(frozen.version(), 1);
        assert_eq!(frozen.data(), b"v1");
    }

    #[test]
    fn test_duplicate_same_version() {
        let (_dir, db) = open_scratch();
        {
            let mut txn = db.start_write().expect("w");
            txn.set_data(b"v1".to_vec()).expect("set");
            txn.commit().expect("commit");
        }
        let reader = db.start_read(None).expect("read");
        let dup = reader.duplicate().expect("duplicate");
        assert_eq!(dup.version(), reader.version());
        assert_eq!(dup.stage(), TransactStage::Reading);
    }

    #[test]
    fn test_commit_and_continue_as_read() {
        let (_dir, db) = open_scratch();
        let mut txn = db.start_write().expect("w");
        txn.set_data(b"continued".to_vec()).expect("set");
        let vid = txn.commit_and_continue_as_read(true).expect("continue");
        assert_eq!(vid.version, 1);
        assert_eq!(txn.stage(), TransactStage::Reading);
        assert_eq!(txn.version(), 1);
        assert_eq!(txn.data(), b"continued");

        // The write lock was released: another writer proceeds.
        let mut w2 = db.start_write().expect("second writer");
        w2.set_data(b"after".to_vec()).expect("set");
        w2.commit().expect("commit");
    }

    #[test]
    fn test_commit_and_continue_writing() {
        let (_dir, db) = open_scratch();
        let mut txn = db.start_write().expect("w");
        txn.set_data(b"first".to_vec()).expect("set");
        let v1 = txn.commit_and_continue_writing().expect("continue");
        assert_eq!(v1, 1);
        assert_eq!(txn.stage(), TransactStage::Writing);

        txn.set_data(b"second".to_vec()).expect("set");
        let v2 = txn.commit().expect("commit");
        assert_eq!(v2, 2);

        let reader = db.start_read(None).expect("read");
        assert_eq!(reader.data(), b"second");
    }

    #[test]
    fn test_promote_to_write_advances() {
        let (_dir, db) = open_scratch();
        {
            let mut txn = db.start_write().expect("w");
            txn.set_data(b"v1".to_vec()).expect("set");
            txn.commit().expect("commit");
        }
        let mut reader = db.start_read(None).expect("read");
        {
            let mut txn = db.start_write().expect("w");
            txn.set_data(b"v2".to_vec()).expect("set");
            txn.commit().expect("commit");
        }
        assert_eq!(reader.version(), 1);
        reader.promote_to_write().expect("promote");
        assert_eq!(reader.stage(), TransactStage::Writing);
        // Promotion advanced to the latest snapshot.
        assert_eq!(reader.version(), 2);
        assert_eq!(reader.data(), b"v2");
        reader.rollback().expect("rollback");
    }

    #[test]
    fn test_end_read_while_writing_rejected() {
        let (_dir, db) = open_scratch();
        let mut txn = db.start_write().expect("w");
        assert!(txn.end_read().is_err());
        txn.rollback().expect("rollback");
        txn.end_read().expect("idempotent on ready");
    }

    #[test]
    fn test_drop_of_writer_rolls_back() {
        let (_dir, db) = open_scratch();
        {
            let mut txn = db.start_write().expect("w");
            txn.set_data(b"lost".to_vec()).expect("set");
            // dropped without commit
        }
        assert_eq!(db.latest_version().expect("latest"), 0);
        assert_eq!(db.local_transaction_count(), 0);
        // The write lock was released.
        let mut txn = db.start_write().expect("relock");
        txn.set_data(b"won".to_vec()).expect("set");
        txn.commit().expect("commit");
    }

    fn open_async() -> (tempfile::TempDir, Arc<Db>) {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Db::open(
            dir.path().join("db.karst"),
            false,
            DbOptions {
                enable_async_writes: true,
                ..DbOptions::default()
            },
        )
        .expect("open");
        (dir, db)
    }

    #[test]
    fn test_unpersisted_commit_pins_and_flush_releases() {
        let (dir, db) = open_async();
        let mut txn = db.start_write().expect("w");
        txn.set_data(b"deferred".to_vec()).expect("set");
        // Non-durable commit: the snapshot is published to everyone, but
        // the file header still names version 0, which stays pinned.
        txn.commit_and_continue_as_read(false).expect("continue");
        assert_eq!(txn.stage(), TransactStage::Reading);
        assert_eq!(db.latest_version().expect("latest"), 1);

        let path = dir.path().join("db.karst");
        let stored = |p: &std::path::Path| {
            let bytes = std::fs::read(p).expect("read file");
            u64::from_le_bytes(bytes[8..16].try_into().expect("slice"))
        };
        assert_eq!(stored(&path), 0);

        // Schedule the deferred flush and wait for the worker.
        txn.async_complete_writes(None).expect("complete");
        for _ in 0..200 {
            if stored(&path) == 1 {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert_eq!(stored(&path), 1);

        // The pin is gone and the write lock was released: a plain
        // writer gets through and the version count collapses.
        drop(txn);
        let mut w = db.start_write().expect("w2");
        w.set_data(b"next".to_vec()).expect("set");
        w.commit().expect("commit");
        let mut w = db.start_write().expect("w3");
        w.set_data(b"again".to_vec()).expect("set");
        w.commit().expect("commit");
        assert_eq!(db.number_of_versions().expect("count"), 1);
    }

    #[test]
    fn test_unpersisted_pin_flushed_on_close() {
        let (dir, db) = open_async();
        let path = dir.path().join("db.karst");
        {
            let mut txn = db.start_write().expect("w");
            txn.set_data(b"close flushes".to_vec()).expect("set");
            txn.commit_and_continue_as_read(false).expect("continue");
            // Dropped in HasCommits: close completes the deferred commit
            // inline and releases the write lock.
        }
        let bytes = std::fs::read(&path).expect("read file");
        let stored = u64::from_le_bytes(bytes[8..16].try_into().expect("slice"));
        assert_eq!(stored, 1);

        let mut w = db.start_write().expect("relock");
        w.set_data(b"after".to_vec()).expect("set");
        w.commit().expect("commit");
    }
}
