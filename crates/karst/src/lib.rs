// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # karst — embedded multi-process transactional storage engine
//!
//! Multiple processes (and threads) on one host open the same database
//! file concurrently. Each participant gets snapshot-isolated read
//! transactions and serialized write transactions with durable, atomic
//! commits — coordinated entirely through a memory-mapped `.lock` file
//! next to the data file.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use karst::{Db, DbOptions, Result};
//!
//! fn main() -> Result<()> {
//!     let db = Db::open("objects.karst", false, DbOptions::default())?;
//!
//!     let mut txn = db.start_write()?;
//!     txn.set_data(b"first object graph".to_vec())?;
//!     txn.commit()?;
//!
//!     let reader = db.start_read(None)?;
//!     assert_eq!(reader.data(), b"first object graph");
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------------+
//! |                        Transaction API                             |
//! |   start_read / start_frozen / start_write | commit | rollback      |
//! +--------------------------------------------------------------------+
//! |                        Db coordinator                              |
//! |   session attach | readers registry | fair write scheduler |       |
//! |   commit pipeline | async commit helper                            |
//! +--------------------------------------------------------------------+
//! |                   Shared lock file (mmap)                          |
//! |   header | robust mutexes | futex condvars | snapshot ring         |
//! +--------------------------------------------------------------------+
//! |                        Data file                                   |
//! |   immutable snapshot payloads, append-only, root in header         |
//! +--------------------------------------------------------------------+
//! ```
//!
//! Every commit produces a new immutable snapshot version published
//! through a lock-free ring buffer in the lock file; readers pin versions
//! with a single atomic increment and never block writers. Writers are
//! serialized by a robust process-shared mutex with FIFO fairness
//! ticketing. A crash while holding a lock is recovered by the next
//! locker; a crash inside the short critical phase of a commit poisons
//! the session, which the next writer detects.
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Db`] | One participant's handle on a database session |
//! | [`Transaction`] | Read / frozen / write transaction on a snapshot |
//! | [`DbOptions`] | Durability, async writes, replication collaborator |
//! | [`VersionId`] | A snapshot's version plus its ring slot |
//! | [`Replication`] | Commit-stamping contract for history logs |
//!
//! ## Modules Overview
//!
//! - [`engine`] - coordinator, ring, scheduler, transactions (start here)
//! - [`config`] - constants and open-time options
//! - [`sys`] - mappings, file locks, robust mutexes, futex condvars
//! - [`history`] - replication collaborator interface

pub mod config;
pub mod engine;
pub mod error;
pub mod history;
mod store;
pub mod sys;

pub use config::{DbOptions, Durability};
pub use engine::{core_file, CoreFileKind, Db, TransactStage, Transaction, VersionId};
pub use error::{Error, LogicErrorKind, Result};
pub use history::{Replication, HISTORY_NONE};
