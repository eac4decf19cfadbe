// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Robust process-shared mutexes embedded in the mapped lock file.
//!
//! The write mutex and the control mutex of a session are
//! `pthread_mutex_t` objects whose storage lives inside the shared header.
//! Two attributes matter:
//!
//! - `PTHREAD_PROCESS_SHARED`: the mutex works across the processes mapping
//!   the file, not just across threads.
//! - `PTHREAD_MUTEX_ROBUST`: when the owning process or thread dies while
//!   holding the lock, the next `lock()` returns `EOWNERDEAD` instead of
//!   hanging forever. We mark the state consistent and carry on; whether
//!   the protected data is actually usable is decided one level up by the
//!   `commit_in_critical_phase` flag.
//!
//! Robust mutexes are owner-tracked, so they must be unlocked on the thread
//! that locked them; `IS_THREAD_CONFINED` advertises that to the async
//! commit helper.

use crate::error::{Error, Result};
use std::cell::UnsafeCell;

/// Mutex storage placed at a fixed offset of the shared header.
///
/// The struct is exactly a `pthread_mutex_t`; its size is stamped into the
/// header (`size_of_mutex`) so joiners with a different libc layout are
/// rejected instead of corrupting the lock.
#[repr(C)]
pub struct SharedMutexState {
    inner: UnsafeCell<libc::pthread_mutex_t>,
}

// SAFETY: pthread mutexes are exactly the primitive that makes concurrent
// access from multiple threads (and processes) sound.
unsafe impl Send for SharedMutexState {}
unsafe impl Sync for SharedMutexState {}

/// Robust pthread mutexes track their owning thread; unlock must happen on
/// the thread that locked. The async commit helper consults this to decide
/// whether a caller may release a lock the worker thread acquired.
pub const IS_THREAD_CONFINED: bool = true;

impl SharedMutexState {
    /// Initialize the mutex in place.
    ///
    /// # Safety
    ///
    /// Must be called exactly once per session, by the lock-file
    /// initializer, while it holds the exclusive file lock (i.e. before any
    /// other participant can observe the bytes).
    pub unsafe fn init(&self) -> Result<()> {
        let mut attr: libc::pthread_mutexattr_t = std::mem::zeroed();
        let rc = libc::pthread_mutexattr_init(&mut attr);
        if rc != 0 {
            return Err(Error::Sync {
                op: "pthread_mutexattr_init",
                errno: rc,
            });
        }
        libc::pthread_mutexattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED);
        #[cfg(target_os = "linux")]
        libc::pthread_mutexattr_setrobust(&mut attr, libc::PTHREAD_MUTEX_ROBUST);
        let rc = libc::pthread_mutex_init(self.inner.get(), &attr);
        libc::pthread_mutexattr_destroy(&mut attr);
        if rc != 0 {
            return Err(Error::Sync {
                op: "pthread_mutex_init",
                errno: rc,
            });
        }
        Ok(())
    }

    /// Lock, recovering from a dead previous owner.
    pub fn lock(&self) -> Result<()> {
        // SAFETY: the mutex was initialized by the session initializer
        // before the header was published (init_complete release store).
        let rc = unsafe { libc::pthread_mutex_lock(self.inner.get()) };
        self.check_lock_result(rc)
    }

    /// Try to lock without blocking. `Ok(false)` means contended.
    pub fn try_lock(&self) -> Result<bool> {
        // SAFETY: as in lock().
        let rc = unsafe { libc::pthread_mutex_trylock(self.inner.get()) };
        if rc == libc::EBUSY {
            return Ok(false);
        }
        self.check_lock_result(rc)?;
        Ok(true)
    }

    fn check_lock_result(&self, rc: libc::c_int) -> Result<()> {
        match rc {
            0 => Ok(()),
            #[cfg(target_os = "linux")]
            libc::EOWNERDEAD => {
                // Previous owner died while holding the lock. Make the
                // mutex usable again; the caller now owns it.
                log::warn!("[LOCK] recovered mutex from dead owner");
                // SAFETY: EOWNERDEAD means this thread holds the lock.
                unsafe { libc::pthread_mutex_consistent(self.inner.get()) };
                Ok(())
            }
            errno => Err(Error::Sync {
                op: "pthread_mutex_lock",
                errno,
            }),
        }
    }

    /// Unlock. Must be called on the thread that locked (robust mutexes
    /// are owner-tracked).
    pub fn unlock(&self) {
        // SAFETY: caller holds the lock per the contract above.
        let rc = unsafe { libc::pthread_mutex_unlock(self.inner.get()) };
        debug_assert_eq!(rc, 0, "unlocking a mutex we do not own");
    }

    /// Lock and return a guard releasing on drop.
    pub fn lock_guard(&self) -> Result<SharedMutexGuard<'_>> {
        self.lock()?;
        Ok(SharedMutexGuard { mutex: self })
    }

    /// Zeroed storage awaiting `init`, for tests that need a mutex outside
    /// a mapped header.
    #[cfg(test)]
    pub(crate) fn new_zeroed() -> Self {
        Self {
            // SAFETY: zeroed bytes are valid storage for a mutex that is
            // about to be initialized.
            inner: UnsafeCell::new(unsafe { std::mem::zeroed() }),
        }
    }

    /// Probe that the initialized bytes look like a live mutex for this
    /// libc (joiners call this before trusting the lock file).
    pub fn is_valid(&self) -> bool {
        match self.try_lock() {
            Ok(true) => {
                self.unlock();
                true
            }
            Ok(false) => true, // locked by someone else, but functional
            Err(_) => false,
        }
    }
}

/// RAII guard for a `SharedMutexState`
pub struct SharedMutexGuard<'a> {
    mutex: &'a SharedMutexState,
}

impl Drop for SharedMutexGuard<'_> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::thread;

    fn fresh_mutex() -> Arc<SharedMutexState> {
        let state = Arc::new(SharedMutexState::new_zeroed());
        // SAFETY: single-threaded here, nothing has observed the bytes yet.
        unsafe { state.init().expect("init") };
        state
    }

    #[test]
    fn test_lock_unlock() {
        let m = fresh_mutex();
        m.lock().expect("lock");
        m.unlock();
    }

    #[test]
    fn test_try_lock_contended() {
        let m = fresh_mutex();
        m.lock().expect("lock");
        let m2 = Arc::clone(&m);
        let contended = thread::spawn(move || m2.try_lock().expect("try_lock"))
            .join()
            .expect("join");
        assert!(!contended);
        m.unlock();
    }

    #[test]
    fn test_mutual_exclusion() {
        let m = fresh_mutex();
        let counter = Arc::new(AtomicU32::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let m = Arc::clone(&m);
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    for _ in 0..500 {
                        m.lock().expect("lock");
                        let v = counter.load(Ordering::Relaxed);
                        thread::yield_now();
                        counter.store(v + 1, Ordering::Relaxed);
                        m.unlock();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().expect("join");
        }
        assert_eq!(counter.load(Ordering::Relaxed), 2000);
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn test_robust_recovery_from_dead_owner() {
        let m = fresh_mutex();
        let m2 = Arc::clone(&m);
        // The thread dies while holding the lock.
        thread::spawn(move || {
            m2.lock().expect("lock in dying thread");
        })
        .join()
        .expect("join");

        // Next lock observes EOWNERDEAD internally and recovers.
        m.lock().expect("robust recovery");
        m.unlock();
    }

    #[test]
    fn test_guard_releases() {
        let m = fresh_mutex();
        {
            let _g = m.lock_guard().expect("guard");
            assert!(!m.try_lock().expect("contended"));
        }
        assert!(m.try_lock().expect("free again"));
        m.unlock();
    }
}
