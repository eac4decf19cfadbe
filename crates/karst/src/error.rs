// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error types for the storage engine.
//!
//! Setup-time errors abort `Db::open` and leave the lock file either
//! untouched or in a cleanly re-initializable state. Runtime errors from
//! read/write operations clean up any partial ring-buffer refcount changes
//! before they are returned. `SessionPoisoned` is the one non-recoverable
//! case: a writer crashed inside the critical phase of a commit and the
//! whole session must be restarted.

use std::fmt;
use std::io;
use std::path::PathBuf;

/// Misuse of the transactional API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicErrorKind {
    /// Operation is not legal in the transaction's current stage.
    WrongTransactState,
    /// Session participants disagree on the durability setting.
    MixedDurability,
    /// Session participants disagree on the history type.
    MixedHistoryType,
    /// Session participants disagree on the history schema version.
    MixedHistorySchemaVersion,
}

impl fmt::Display for LogicErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WrongTransactState => write!(f, "operation not valid in this transaction state"),
            Self::MixedDurability => write!(f, "durability setting differs from the active session"),
            Self::MixedHistoryType => write!(f, "history type differs from the active session"),
            Self::MixedHistorySchemaVersion => {
                write!(f, "history schema version differs from the active session")
            }
        }
    }
}

/// Errors that can occur while opening or operating on a database.
#[derive(Debug)]
pub enum Error {
    /// The lock file layout does not match this library build.
    IncompatibleLockFile { path: PathBuf, reason: String },

    /// The data file uses a format this library does not know.
    UnsupportedFileFormatVersion(u8),

    /// The data file needs a format upgrade but the caller disallowed it.
    FileFormatUpgradeRequired(u8),

    /// History type or schema version stored in the file disagrees with the opener.
    IncompatibleHistories { path: PathBuf, reason: String },

    /// The data file is not a database, or its root is damaged.
    InvalidDatabase { path: PathBuf, reason: String },

    /// API misuse.
    Logic(LogicErrorKind),

    /// The requested snapshot version has been reclaimed.
    BadVersion(u64),

    /// A sync agent is already registered for this session.
    MultipleSyncAgents,

    /// A writer died inside the critical phase of a commit; the session
    /// must be restarted (lock file reinitialized) before further writes.
    SessionPoisoned,

    /// An underlying file or mapping operation failed.
    Io {
        op: &'static str,
        path: PathBuf,
        source: io::Error,
    },

    /// A process-shared synchronization primitive failed irrecoverably.
    Sync { op: &'static str, errno: i32 },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IncompatibleLockFile { path, reason } => {
                write!(f, "incompatible lock file {}: {reason}", path.display())
            }
            Self::UnsupportedFileFormatVersion(v) => {
                write!(f, "unsupported file format version {v}")
            }
            Self::FileFormatUpgradeRequired(v) => {
                write!(
                    f,
                    "file format version {v} requires an upgrade, which the caller disallowed"
                )
            }
            Self::IncompatibleHistories { path, reason } => {
                write!(f, "incompatible histories on {}: {reason}", path.display())
            }
            Self::InvalidDatabase { path, reason } => {
                write!(f, "invalid database {}: {reason}", path.display())
            }
            Self::Logic(kind) => write!(f, "logic error: {kind}"),
            Self::BadVersion(v) => write!(f, "snapshot version {v} is no longer available"),
            Self::MultipleSyncAgents => {
                write!(f, "a sync agent is already present in this session")
            }
            Self::SessionPoisoned => {
                write!(
                    f,
                    "crash of another process detected during commit, session restart required"
                )
            }
            Self::Io { op, path, source } => {
                write!(f, "{op} failed on {}: {source}", path.display())
            }
            Self::Sync { op, errno } => {
                write!(f, "{op} failed: {}", io::Error::from_raw_os_error(*errno))
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Shorthand for the pervasive `WrongTransactState` misuse error
    pub(crate) fn wrong_transact_state() -> Self {
        Self::Logic(LogicErrorKind::WrongTransactState)
    }

    pub(crate) fn io(op: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            op,
            path: path.into(),
            source,
        }
    }
}
