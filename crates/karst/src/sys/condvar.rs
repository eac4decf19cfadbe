// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Process-shared condition variables for the mapped lock file.
//!
//! The shared header embeds one 32-bit sequence word per condition
//! variable. A waiter snapshots the word *while holding the associated
//! process-shared mutex*, releases the mutex, sleeps until the word moves
//! on, and relocks. A notifier advances the word and wakes every sleeper.
//! A notification landing between the snapshot and the sleep changes the
//! word, so the sleep returns immediately — no lost wakeups. Spurious
//! wakeups are possible and callers re-check their predicate in a loop.
//!
//! Waits are bounded by an absolute deadline, the same convention the
//! write-lock scheduler uses for its fairness window; a caller looping on
//! a predicate passes the same deadline into every iteration and the
//! remaining time shrinks by itself.
//!
//! The sleep itself is a `SYS_futex` wait on the word. The kernel wait
//! queue must be the SHARED one: the `_PRIVATE` futex opcodes key the
//! queue per process and would silently strand sleepers in other session
//! participants. A 4-byte word has no platform-dependent layout, so
//! cross-process agreement reduces to the `size_of_condvar` stamp in the
//! header.

use super::shared_mutex::SharedMutexState;
use crate::error::Result;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

#[cfg(not(target_os = "linux"))]
use std::time::Duration;

/// Shared-queue futex opcodes. NOT the `_PRIVATE` variants (128/129).
#[cfg(target_os = "linux")]
const FUTEX_WAIT: libc::c_int = 0;
#[cfg(target_os = "linux")]
const FUTEX_WAKE: libc::c_int = 1;

/// Outcome of a bounded condvar wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    /// A notification (or a spurious wakeup) ended the wait; re-check the
    /// predicate.
    Notified,
    /// The deadline passed first.
    TimedOut,
}

/// The sequence word sleepers block on.
///
/// Lives inside the mapped lock file; every advance is a new "epoch" that
/// releases all current sleepers.
#[repr(transparent)]
struct SeqWord(AtomicU32);

impl SeqWord {
    /// Snapshot the current epoch. Taken under the mutex so a concurrent
    /// advance cannot slip between snapshot and sleep unobserved.
    #[inline]
    fn epoch(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }

    /// Sleep while the word still holds `seen`, or until `deadline`.
    #[cfg(target_os = "linux")]
    fn sleep_while_eq(&self, seen: u32, deadline: Option<Instant>) -> WaitStatus {
        let ts = match deadline {
            Some(d) => {
                let left = d.saturating_duration_since(Instant::now());
                if left.is_zero() {
                    return WaitStatus::TimedOut;
                }
                Some(libc::timespec {
                    tv_sec: left.as_secs() as libc::time_t,
                    tv_nsec: libc::c_long::from(left.subsec_nanos()),
                })
            }
            None => None,
        };
        let ts_ptr = ts
            .as_ref()
            .map_or(std::ptr::null(), |t| t as *const libc::timespec);

        // SAFETY: the word outlives the syscall (we hold &self), and the
        // timespec pointer is either null or points at the local above.
        // FUTEX_WAIT on the shared queue; returns immediately with EAGAIN
        // when the word already moved past `seen`.
        let rc = unsafe {
            libc::syscall(
                libc::SYS_futex,
                &self.0 as *const AtomicU32,
                FUTEX_WAIT,
                seen,
                ts_ptr,
                std::ptr::null::<u32>(),
                0i32,
            )
        };
        if rc == -1
            && std::io::Error::last_os_error().raw_os_error() == Some(libc::ETIMEDOUT)
        {
            WaitStatus::TimedOut
        } else {
            // Woken, interrupted, or the epoch had already advanced; all
            // of these mean "go re-check the predicate".
            WaitStatus::Notified
        }
    }

    /// Begin a new epoch and wake every sleeper.
    #[cfg(target_os = "linux")]
    fn advance_and_wake(&self) {
        self.0.fetch_add(1, Ordering::Release);
        // SAFETY: plain FUTEX_WAKE on the word; no pointers beyond the
        // word itself are passed.
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                &self.0 as *const AtomicU32,
                FUTEX_WAKE,
                i32::MAX,
                std::ptr::null::<libc::timespec>(),
                std::ptr::null::<u32>(),
                0i32,
            );
        }
    }

    // Polling stand-in so the crate stays testable on non-Linux hosts;
    // wakeups are observed through the epoch itself.
    #[cfg(not(target_os = "linux"))]
    fn sleep_while_eq(&self, seen: u32, deadline: Option<Instant>) -> WaitStatus {
        loop {
            if self.0.load(Ordering::Acquire) != seen {
                return WaitStatus::Notified;
            }
            if let Some(d) = deadline {
                if Instant::now() >= d {
                    return WaitStatus::TimedOut;
                }
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn advance_and_wake(&self) {
        self.0.fetch_add(1, Ordering::Release);
    }
}

/// Condition variable storage placed at a fixed offset of the shared
/// header.
#[repr(C)]
pub struct SharedCondVar {
    seq: SeqWord,
}

impl SharedCondVar {
    /// Initialize in place. Called only by the lock-file initializer while
    /// it holds the exclusive file lock.
    pub fn init(&self) {
        self.seq.0.store(0, Ordering::Relaxed);
    }

    /// Atomically release `mutex`, wait for a notification or `deadline`,
    /// and reacquire `mutex`.
    ///
    /// `TimedOut` is only reported when the deadline genuinely passed;
    /// everything else (wake, interrupt, epoch already advanced) comes
    /// back as `Notified` and the caller loops on its predicate.
    pub fn wait(
        &self,
        mutex: &SharedMutexState,
        deadline: Option<Instant>,
    ) -> Result<WaitStatus> {
        let seen = self.seq.epoch();
        mutex.unlock();
        let status = self.seq.sleep_while_eq(seen, deadline);
        mutex.lock()?;
        Ok(status)
    }

    /// Wake all current waiters.
    ///
    /// May be called with or without the mutex held.
    pub fn notify_all(&self) {
        self.seq.advance_and_wake();
    }
}
