// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! FIFO fairness on top of the shared write mutex.
//!
//! A bare mutex lets the scheduler starve writers arbitrarily. The ticket
//! pair `next_ticket` / `next_served` in the shared header restores FIFO
//! order: a contender draws a ticket, takes the mutex, and while its
//! ticket is still in the future yields the mutex back through the
//! `pick_next_writer` condvar.
//!
//! The yield wait is bounded (500 ms). On timeout the waiter makes it its
//! own turn by storing its ticket into `next_served` — a ticket holder
//! that died before being served can therefore stall the queue for at
//! most one window, at the price of momentarily losing fairness. Bypassed
//! waiters still make progress because the turn comparison is a signed
//! `>`, not equality.
//!
//! Ticket comparison is done on the signed 32-bit difference, which stays
//! correct across wraparound as long as fewer than 2^30 tickets are in
//! flight (one per thread at most, in practice a handful).

use super::Db;
use crate::config::WRITE_SCHEDULER_TIMEOUT;
use crate::error::{Error, Result};
use crate::sys::WaitStatus;
use std::sync::atomic::Ordering;
use std::time::Instant;

impl Db {
    /// Acquire the write lock with FIFO fairness. Blocks.
    pub(crate) fn do_begin_write(&self) -> Result<()> {
        let hdr = self.hdr();
        let my_ticket = hdr.next_ticket.fetch_add(1, Ordering::Relaxed);
        hdr.write_mutex.lock()?;

        // Signed distance supports comparison across ticket wraparound.
        let mut diff = my_ticket.wrapping_sub(hdr.next_served.load(Ordering::Relaxed)) as i32;
        if diff > 0 {
            let deadline = Instant::now() + WRITE_SCHEDULER_TIMEOUT;
            while diff > 0 {
                let status = hdr.pick_next_writer.wait(&hdr.write_mutex, Some(deadline))?;
                if status == WaitStatus::TimedOut {
                    // Either an earlier ticket holder died, or the queue
                    // is just slow; in both cases *make* it our turn,
                    // otherwise next_served would trail next_ticket
                    // forever.
                    break;
                }
                diff = my_ticket.wrapping_sub(hdr.next_served.load(Ordering::Relaxed)) as i32;
            }
        }
        hdr.next_served.store(my_ticket, Ordering::Relaxed);
        self.finish_begin_write()
    }

    /// Try to acquire the write lock without blocking.
    ///
    /// With no contention there is nothing to be fair about, so this
    /// bypasses the ticketing entirely.
    pub(crate) fn do_try_begin_write(&self) -> Result<bool> {
        if !self.hdr().write_mutex.try_lock()? {
            return Ok(false);
        }
        self.finish_begin_write()?;
        Ok(true)
    }

    /// Post-acquisition checks shared by both entry points.
    fn finish_begin_write(&self) -> Result<()> {
        let hdr = self.hdr();
        if hdr.commit_in_critical_phase.load(Ordering::Acquire) != 0 {
            hdr.write_mutex.unlock();
            return Err(Error::SessionPoisoned);
        }
        self.local.lock().write_transaction_open = true;
        Ok(())
    }

    /// Release the write lock and hand the turn to the next ticket.
    ///
    /// Must run on the thread that acquired the mutex (robust mutexes are
    /// owner-tracked); the async helper routes through its worker when
    /// needed.
    pub(crate) fn do_end_write(&self) {
        let hdr = self.hdr();
        hdr.next_served.fetch_add(1, Ordering::Relaxed);
        {
            let mut local = self.local.lock();
            debug_assert!(local.write_transaction_open);
            local.write_transaction_open = false;
            hdr.write_mutex.unlock();
        }
        hdr.pick_next_writer.notify_all();
    }
}
