// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The async commit helper.
//!
//! A single lazily started background thread that acquires the write
//! mutex and performs deferred flushes on behalf of client threads, so
//! neither blocking on the lock nor fsync has to happen on a caller's
//! thread.
//!
//! The worker owns:
//!
//! - a FIFO of write-lock-claim callbacks (`begin_write`),
//! - at most one pending flush callback (`sync_to_disk`),
//! - a ticket counter for synchronous claimants (`blocking_begin_write`),
//!   which take priority over the async FIFO.
//!
//! Robust process-shared mutexes are owner-tracked
//! (`sys::IS_THREAD_CONFINED`), so a lock the worker acquired must be
//! released by the worker; callers hand the release back instead of
//! unlocking themselves. On platforms whose mutex allows cross-thread
//! unlock, an uncontended `blocking_begin_write` skips the worker
//! entirely.
//!
//! There is no cancellation: a claim in flight waits until the mutex is
//! acquired or the database closes; shutdown waits for in-flight work.

use super::Db;
use crate::error::{Error, Result};
use crate::sys;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::thread;

type Callback = Box<dyn FnOnce() + Send>;

struct HelperState {
    running: bool,
    shut_down: bool,
    thread: Option<thread::JoinHandle<()>>,
    pending_writes: VecDeque<Callback>,
    pending_sync: Option<Callback>,
    /// Tickets drawn by synchronous claimants
    write_lock_claim_ticket: u64,
    /// Tickets the worker has satisfied (or aborted)
    write_lock_claim_fulfilled: u64,
    /// Claims at or below this ticket failed; their waiters error out.
    claims_aborted_below: u64,
    pending_mx_release: bool,
    has_write_mutex: bool,
    /// The worker thread acquired the mutex (so it must release it).
    owns_write_mutex: bool,
    /// A caller is acquiring the mutex itself; the worker must not race it.
    waiting_for_write_mutex: bool,
}

struct HelperShared {
    db: Weak<Db>,
    state: Mutex<HelperState>,
    cv_worker: Condvar,
    cv_callers: Condvar,
}

impl HelperShared {
    fn has_pending_write_requests(st: &HelperState) -> bool {
        st.write_lock_claim_fulfilled < st.write_lock_claim_ticket || !st.pending_writes.is_empty()
    }
}

pub(crate) struct AsyncCommitHelper {
    shared: Arc<HelperShared>,
}

impl AsyncCommitHelper {
    pub(crate) fn new(db: Weak<Db>) -> Self {
        Self {
            shared: Arc::new(HelperShared {
                db,
                state: Mutex::new(HelperState {
                    running: false,
                    shut_down: false,
                    thread: None,
                    pending_writes: VecDeque::new(),
                    pending_sync: None,
                    write_lock_claim_ticket: 0,
                    write_lock_claim_fulfilled: 0,
                    claims_aborted_below: 0,
                    pending_mx_release: false,
                    has_write_mutex: false,
                    owns_write_mutex: false,
                    waiting_for_write_mutex: false,
                }),
                cv_worker: Condvar::new(),
                cv_callers: Condvar::new(),
            }),
        }
    }

    fn start_thread(shared: &Arc<HelperShared>, st: &mut HelperState) -> Result<()> {
        if st.running || st.shut_down {
            return Ok(());
        }
        st.running = true;
        let worker_shared = Arc::clone(shared);
        let handle = thread::Builder::new()
            .name("karst-async-commit".into())
            .spawn(move || worker_main(&worker_shared))
            .map_err(|e| Error::io("spawn", "async-commit-helper", e))?;
        st.thread = Some(handle);
        Ok(())
    }

    /// Enqueue a write-lock claim; `cb` runs on the worker thread once the
    /// lock is held.
    pub(crate) fn begin_write(&self, cb: Callback) -> Result<()> {
        let mut st = self.shared.state.lock();
        Self::start_thread(&self.shared, &mut st)?;
        st.pending_writes.push_back(cb);
        self.shared.cv_worker.notify_one();
        Ok(())
    }

    /// Acquire the write lock for the calling thread, through the worker
    /// when the mutex is thread-confined.
    pub(crate) fn blocking_begin_write(&self, db: &Db) -> Result<()> {
        let mut st = self.shared.state.lock();

        // When the mutex supports cross-thread unlock and nobody is
        // queued behind the worker, the caller can just take the lock
        // itself. With a claim already pending this would deadlock (we
        // would hold the lock while the worker waits for it to perform
        // our own later sync), so only the uncontended case qualifies.
        let can_lock_on_caller = !sys::IS_THREAD_CONFINED
            && !st.owns_write_mutex
            && st.pending_writes.is_empty()
            && st.write_lock_claim_ticket == st.write_lock_claim_fulfilled;

        if can_lock_on_caller {
            st.waiting_for_write_mutex = true;
            drop(st);
            let result = db.do_begin_write();
            let mut st = self.shared.state.lock();
            st.waiting_for_write_mutex = false;
            result?;
            st.has_write_mutex = true;
            st.owns_write_mutex = false;
            return Ok(());
        }

        // Ask the worker to acquire on our behalf and wait for hand-over.
        Self::start_thread(&self.shared, &mut st)?;
        st.write_lock_claim_ticket += 1;
        let ticket = st.write_lock_claim_ticket;
        self.shared.cv_worker.notify_one();
        while st.write_lock_claim_fulfilled < ticket {
            self.shared.cv_callers.wait(&mut st);
        }
        if ticket <= st.claims_aborted_below {
            return Err(Error::SessionPoisoned);
        }
        Ok(())
    }

    /// Release after `blocking_begin_write` / a fulfilled claim. Routed to
    /// the worker when it owns the mutex; returns `true` when handled
    /// (including the routed case), `false` when the helper never held it.
    pub(crate) fn blocking_end_write(&self, db: &Db) -> bool {
        let mut st = self.shared.state.lock();
        if !st.has_write_mutex {
            return false;
        }
        debug_assert!(st.owns_write_mutex || !sys::IS_THREAD_CONFINED);

        if st.owns_write_mutex {
            // Release on the thread that acquired.
            st.pending_mx_release = true;
            self.shared.cv_worker.notify_one();
            while st.pending_mx_release {
                self.shared.cv_callers.wait(&mut st);
            }
        } else {
            db.do_end_write();
            st.has_write_mutex = false;
            // The worker ignored claim requests while the caller held the
            // mutex; wake it in case any queued up.
            if HelperShared::has_pending_write_requests(&st) {
                drop(st);
                self.shared.cv_worker.notify_one();
            }
        }
        true
    }

    /// Fire-and-forget release from an async transaction.
    pub(crate) fn end_write(&self, db: &Db) {
        let mut st = self.shared.state.lock();
        debug_assert!(st.has_write_mutex);
        if st.owns_write_mutex {
            st.pending_mx_release = true;
            self.shared.cv_worker.notify_one();
        } else {
            db.do_end_write();
            st.has_write_mutex = false;
        }
    }

    /// Schedule a flush; `cb` runs on the worker with the write mutex
    /// held, after which the worker releases the mutex. At most one may
    /// be pending.
    pub(crate) fn sync_to_disk(&self, cb: Callback) -> Result<()> {
        let mut st = self.shared.state.lock();
        debug_assert!(st.pending_sync.is_none());
        Self::start_thread(&self.shared, &mut st)?;
        st.pending_sync = Some(cb);
        self.shared.cv_worker.notify_one();
        Ok(())
    }

    /// Stop the worker and join it. Idempotent; called from `Db::close`
    /// while the `Db` is still fully alive so the worker can release a
    /// held mutex.
    pub(crate) fn shutdown(&self) {
        let handle = {
            let mut st = self.shared.state.lock();
            st.shut_down = true;
            if !st.running {
                return;
            }
            st.running = false;
            self.shared.cv_worker.notify_one();
            st.thread.take()
        };
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::error!("[ASYNC] commit helper worker panicked");
            }
        }
    }
}

impl Drop for AsyncCommitHelper {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_main(shared: &Arc<HelperShared>) {
    let mut st = shared.state.lock();
    while st.running {
        if st.has_write_mutex {
            if let Some(cb) = st.pending_sync.take() {
                // Only one of sync_to_disk / end_write / blocking_end_write
                // is in flight per held lock.
                debug_assert!(!st.pending_mx_release);
                drop(st);
                cb();
                st = shared.state.lock();
                st.pending_mx_release = true;
            }
            if st.pending_mx_release {
                debug_assert!(!sys::IS_THREAD_CONFINED || st.owns_write_mutex);
                let Some(db) = shared.db.upgrade() else {
                    log::warn!("[ASYNC] database gone before lock release");
                    break;
                };
                db.do_end_write();
                st.pending_mx_release = false;
                st.has_write_mutex = false;
                st.owns_write_mutex = false;
                drop(st);
                shared.cv_callers.notify_all();
                st = shared.state.lock();
                continue;
            }
        } else {
            debug_assert!(st.pending_sync.is_none() && !st.pending_mx_release);

            // Acquire if anyone asked, but never while a caller is taking
            // the mutex itself: if the caller wins and then asks us to
            // sync, we would still be blocked on the lock it holds.
            if !st.waiting_for_write_mutex && HelperShared::has_pending_write_requests(&st) {
                drop(st);
                let Some(db) = shared.db.upgrade() else {
                    st = shared.state.lock();
                    break;
                };
                let acquired = db.do_begin_write();
                drop(db);
                st = shared.state.lock();

                match acquired {
                    Ok(()) => {
                        debug_assert!(!st.has_write_mutex);
                        st.has_write_mutex = true;
                        st.owns_write_mutex = true;

                        // Synchronous claimants take priority over the
                        // async FIFO.
                        if st.write_lock_claim_fulfilled < st.write_lock_claim_ticket {
                            st.write_lock_claim_fulfilled += 1;
                            drop(st);
                            shared.cv_callers.notify_all();
                            st = shared.state.lock();
                            continue;
                        }

                        let Some(cb) = st.pending_writes.pop_front() else {
                            continue;
                        };
                        drop(st);
                        cb();
                        st = shared.state.lock();
                        continue;
                    }
                    Err(e) => {
                        // Session-fatal (poisoned) or mutex failure: fail
                        // every outstanding claim and drop queued
                        // callbacks.
                        log::error!("[ASYNC] write lock acquisition failed: {e}");
                        st.claims_aborted_below = st.write_lock_claim_ticket;
                        st.write_lock_claim_fulfilled = st.write_lock_claim_ticket;
                        st.pending_writes.clear();
                        drop(st);
                        shared.cv_callers.notify_all();
                        st = shared.state.lock();
                        continue;
                    }
                }
            }
        }
        shared.cv_worker.wait(&mut st);
    }

    // Shutdown: release a lock we still own.
    if st.has_write_mutex && st.owns_write_mutex {
        if let Some(db) = shared.db.upgrade() {
            db.do_end_write();
            st.has_write_mutex = false;
            st.owns_write_mutex = false;
        } else {
            // Unreleasable; the robust mutex recovers the next locker.
            log::warn!("[ASYNC] exiting with the write mutex held");
        }
    }
}

impl Db {
    /// Begin a write through the helper when async writes are enabled.
    pub(crate) fn begin_possibly_async_write(&self) -> Result<()> {
        match &self.commit_helper {
            Some(helper) => helper.blocking_begin_write(self),
            None => self.do_begin_write(),
        }
    }

    /// End a write on whichever thread is allowed to release the mutex.
    pub(crate) fn end_write_on_correct_thread(&self) {
        let handled = self
            .commit_helper
            .as_ref()
            .is_some_and(|helper| helper.blocking_end_write(self));
        if !handled {
            self.do_end_write();
        }
    }

    /// Queue an asynchronous write-lock claim (async transactions).
    pub(crate) fn async_begin_write(&self, cb: Callback) -> Result<()> {
        let helper = self.commit_helper.as_ref().ok_or_else(Error::wrong_transact_state)?;
        helper.begin_write(cb)
    }

    /// Hand an async transaction's lock release to the worker.
    pub(crate) fn async_end_write(&self) -> Result<()> {
        let helper = self.commit_helper.as_ref().ok_or_else(Error::wrong_transact_state)?;
        helper.end_write(self);
        Ok(())
    }

    /// Queue an asynchronous flush (async transactions).
    pub(crate) fn async_sync_to_disk(&self, cb: Callback) -> Result<()> {
        let helper = self.commit_helper.as_ref().ok_or_else(Error::wrong_transact_state)?;
        helper.sync_to_disk(cb)
    }
}

#[cfg(test)]
mod tests {
    use crate::config::DbOptions;
    use crate::engine::Db;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

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
    fn test_blocking_begin_end_through_worker() {
        let (_dir, db) = open_async();
        db.begin_possibly_async_write().expect("begin");
        assert!(db.local.lock().write_transaction_open);
        db.end_write_on_correct_thread();
        assert!(!db.local.lock().write_transaction_open);
    }

    #[test]
    fn test_async_begin_write_runs_callback_with_lock() {
        let (_dir, db) = open_async();
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = Arc::clone(&ran);
        let db2 = Arc::clone(&db);
        db.async_begin_write(Box::new(move || {
            // The worker holds the write mutex on our behalf here.
            assert!(db2.local.lock().write_transaction_open);
            ran2.store(true, Ordering::Release);
        }))
        .expect("enqueue");

        // Wait for the callback, then release through the worker.
        for _ in 0..200 {
            if ran.load(Ordering::Acquire) {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(ran.load(Ordering::Acquire));
        db.async_end_write().expect("end");

        // The lock becomes available again for a plain writer.
        db.begin_possibly_async_write().expect("relock");
        db.end_write_on_correct_thread();
    }

    #[test]
    fn test_sync_claim_priority_and_fifo() {
        let (_dir, db) = open_async();
        let order = Arc::new(AtomicU32::new(0));

        // Park the lock in the worker via an async claim.
        let o = Arc::clone(&order);
        db.async_begin_write(Box::new(move || {
            o.fetch_add(1, Ordering::AcqRel);
        }))
        .expect("enqueue");

        for _ in 0..200 {
            if order.load(Ordering::Acquire) == 1 {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(order.load(Ordering::Acquire), 1);
        db.async_end_write().expect("end");

        // A blocking claim afterwards still goes through cleanly.
        db.begin_possibly_async_write().expect("begin");
        db.end_write_on_correct_thread();
    }

    #[test]
    fn test_shutdown_with_idle_worker() {
        let (_dir, db) = open_async();
        db.begin_possibly_async_write().expect("begin");
        db.end_write_on_correct_thread();
        // Drop closes the Db, which shuts the helper down first.
        drop(db);
    }

    #[test]
    fn test_async_sync_to_disk_runs_and_releases() {
        let (_dir, db) = open_async();
        db.begin_possibly_async_write().expect("begin");

        let synced = Arc::new(AtomicBool::new(false));
        let s2 = Arc::clone(&synced);
        db.async_sync_to_disk(Box::new(move || {
            s2.store(true, Ordering::Release);
        }))
        .expect("sync");

        for _ in 0..200 {
            if synced.load(Ordering::Acquire) {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(synced.load(Ordering::Acquire));

        // The worker released the mutex after the sync callback.
        for _ in 0..200 {
            if !db.local.lock().write_transaction_open {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(!db.local.lock().write_transaction_open);
    }
}
