// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Platform layer: mappings, advisory file locks, and the process-shared
//! synchronization primitives embedded in the lock file.

pub mod condvar;
pub mod file_lock;
pub mod mapping;
pub mod shared_mutex;

pub use condvar::{SharedCondVar, WaitStatus};
pub use mapping::{prealloc, FileMap};
pub use shared_mutex::{SharedMutexGuard, SharedMutexState, IS_THREAD_CONFINED};
