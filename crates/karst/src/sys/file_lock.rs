// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Advisory whole-file locks on the lock file.
//!
//! The attach protocol relies on the exclusive/shared duality of `flock`:
//! whoever wins the exclusive lock is alone in the world and may initialize
//! the header; everyone else falls through to the shared lock and joins the
//! session. The shared lock is then held for as long as the database is
//! open, so a later exclusive winner knows no session is active.

use crate::error::{Error, Result};
use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::path::Path;

fn flock(file: &File, op: libc::c_int, name: &'static str, path: &Path) -> Result<bool> {
    loop {
        // SAFETY: fd is valid for the duration of the call; flock takes no
        // pointers.
        let rc = unsafe { libc::flock(file.as_raw_fd(), op) };
        if rc == 0 {
            return Ok(true);
        }
        let err = std::io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) => continue,
            Some(libc::EWOULDBLOCK) if op & libc::LOCK_NB != 0 => return Ok(false),
            _ => return Err(Error::io(name, path, err)),
        }
    }
}

/// Try to take the exclusive lock without blocking.
///
/// Success means no other participant holds any lock on the file: the
/// caller is the potential session initializer.
pub fn try_lock_exclusive(file: &File, path: &Path) -> Result<bool> {
    flock(file, libc::LOCK_EX | libc::LOCK_NB, "flock(LOCK_EX)", path)
}

/// Take the shared lock, blocking until the initializer releases its
/// exclusive lock.
pub fn lock_shared(file: &File, path: &Path) -> Result<()> {
    flock(file, libc::LOCK_SH, "flock(LOCK_SH)", path)?;
    Ok(())
}

/// Release any lock held on the file.
pub fn unlock(file: &File, path: &Path) -> Result<()> {
    flock(file, libc::LOCK_UN, "flock(LOCK_UN)", path)?;
    Ok(())
}
