// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The data-file collaborator.
//!
//! The engine treats the database file as an append-only sequence of
//! immutable snapshot payloads behind a fixed 64-byte header. A commit
//! appends the new payload at the current logical end of file (never
//! touching bytes reachable from a live snapshot) and publishes the
//! resulting `(top_ref, file_size)` through the version ring; the file
//! header is only rewritten when a commit is made durable, so it always
//! names the last snapshot that actually reached disk.
//!
//! # File Layout
//!
//! ```text
//! Off  Size  Field
//! 0    4     magic ("KRST")
//! 4    1     file_format_version
//! 5    1     history_type (signed)
//! 6    2     history_schema_version
//! 8    8     version   (last durable snapshot)
//! 16   8     top_ref   (0 = empty database)
//! 24   8     file_size (logical size at that snapshot)
//! 32   32    reserved
//! ```
//!
//! A snapshot record at `top_ref` is a little-endian u32 length followed
//! by the payload bytes.

use crate::config::{CURRENT_FILE_FORMAT_VERSION, STORAGE_MAGIC};
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

/// Size of the fixed data-file header.
pub(crate) const STORE_HEADER_SIZE: u64 = 64;

/// Open-time configuration for [`StorageFile::attach`].
pub(crate) struct StorageAttachCfg {
    /// The caller begins a new session and may create / validate the file.
    pub session_initiator: bool,
    /// Refuse to create a missing file.
    pub no_create: bool,
    /// Start from an empty file (`MemOnly` databases left behind by a
    /// crashed session).
    pub clear_file: bool,
    pub history_type: i8,
    pub history_schema_version: u16,
    pub allow_file_format_upgrade: bool,
}

/// What `attach` learned about the file.
#[derive(Debug, Clone, Copy)]
pub(crate) struct StorageInfo {
    pub version: u64,
    pub top_ref: u64,
    pub file_size: u64,
    pub file_format_version: u8,
}

/// Decoded fixed header.
#[derive(Debug, Clone, Copy)]
struct StoreHeader {
    file_format_version: u8,
    history_type: i8,
    history_schema_version: u16,
    version: u64,
    top_ref: u64,
    file_size: u64,
}

impl StoreHeader {
    fn fresh(history_type: i8, history_schema_version: u16) -> Self {
        Self {
            file_format_version: CURRENT_FILE_FORMAT_VERSION,
            history_type,
            history_schema_version,
            version: 0,
            top_ref: 0,
            file_size: STORE_HEADER_SIZE,
        }
    }

    fn encode(&self) -> [u8; STORE_HEADER_SIZE as usize] {
        let mut buf = [0u8; STORE_HEADER_SIZE as usize];
        buf[0..4].copy_from_slice(&STORAGE_MAGIC.to_le_bytes());
        buf[4] = self.file_format_version;
        buf[5] = self.history_type as u8;
        buf[6..8].copy_from_slice(&self.history_schema_version.to_le_bytes());
        buf[8..16].copy_from_slice(&self.version.to_le_bytes());
        buf[16..24].copy_from_slice(&self.top_ref.to_le_bytes());
        buf[24..32].copy_from_slice(&self.file_size.to_le_bytes());
        buf
    }

    fn decode(buf: &[u8; STORE_HEADER_SIZE as usize], path: &Path) -> Result<Self> {
        let magic = u32::from_le_bytes(buf[0..4].try_into().expect("slice len"));
        if magic != STORAGE_MAGIC {
            return Err(Error::InvalidDatabase {
                path: path.to_path_buf(),
                reason: format!("bad magic 0x{magic:08x}"),
            });
        }
        Ok(Self {
            file_format_version: buf[4],
            history_type: buf[5] as i8,
            history_schema_version: u16::from_le_bytes(buf[6..8].try_into().expect("slice len")),
            version: u64::from_le_bytes(buf[8..16].try_into().expect("slice len")),
            top_ref: u64::from_le_bytes(buf[16..24].try_into().expect("slice len")),
            file_size: u64::from_le_bytes(buf[24..32].try_into().expect("slice len")),
        })
    }
}

struct StoreInner {
    file: File,
    /// Oldest version whose mappings must stay intact; see
    /// `purge_old_mappings`.
    oldest_retained_version: u64,
}

/// Handle on the database file shared by all transactions of one `Db`.
pub(crate) struct StorageFile {
    path: PathBuf,
    inner: Mutex<StoreInner>,
}

impl StorageFile {
    /// Open (or create) and validate the data file.
    pub(crate) fn attach(path: &Path, cfg: &StorageAttachCfg) -> Result<(Self, StorageInfo)> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(!cfg.no_create)
            .open(path)
            .map_err(|e| Error::io("open", path, e))?;

        let len = file.metadata().map_err(|e| Error::io("stat", path, e))?.len();

        let header = if len == 0 || cfg.clear_file {
            // Only the session initiator creates content; joiners attach to
            // a session whose file already exists.
            let header = StoreHeader::fresh(cfg.history_type, cfg.history_schema_version);
            file.set_len(0).map_err(|e| Error::io("truncate", path, e))?;
            file.write_all_at(&header.encode(), 0)
                .map_err(|e| Error::io("write header", path, e))?;
            log::debug!("[STORE] created {} (fresh database)", path.display());
            header
        } else {
            let mut buf = [0u8; STORE_HEADER_SIZE as usize];
            file.read_exact_at(&mut buf, 0)
                .map_err(|e| Error::io("read header", path, e))?;
            let mut header = StoreHeader::decode(&buf, path)?;

            if header.file_format_version > CURRENT_FILE_FORMAT_VERSION {
                return Err(Error::UnsupportedFileFormatVersion(
                    header.file_format_version,
                ));
            }
            if header.file_format_version < CURRENT_FILE_FORMAT_VERSION {
                if !cfg.allow_file_format_upgrade {
                    return Err(Error::FileFormatUpgradeRequired(header.file_format_version));
                }
                if cfg.session_initiator {
                    header.file_format_version = CURRENT_FILE_FORMAT_VERSION;
                    file.write_all_at(&header.encode(), 0)
                        .map_err(|e| Error::io("write header", path, e))?;
                    log::debug!(
                        "[STORE] upgraded {} to file format {}",
                        path.display(),
                        CURRENT_FILE_FORMAT_VERSION
                    );
                }
            }

            if cfg.session_initiator {
                // History agreement is checked against the on-disk stamps
                // when starting a session; joiners are checked against the
                // lock-file header instead.
                if header.top_ref != 0 && header.history_type != cfg.history_type {
                    return Err(Error::IncompatibleHistories {
                        path: path.to_path_buf(),
                        reason: format!(
                            "expected history type {}, file has {}",
                            cfg.history_type, header.history_type
                        ),
                    });
                }
                if header.history_schema_version > cfg.history_schema_version {
                    return Err(Error::IncompatibleHistories {
                        path: path.to_path_buf(),
                        reason: format!(
                            "future history schema version {} (current {})",
                            header.history_schema_version, cfg.history_schema_version
                        ),
                    });
                }
            }
            header
        };

        let info = StorageInfo {
            version: header.version,
            top_ref: header.top_ref,
            file_size: header.file_size,
            file_format_version: header.file_format_version,
        };
        let storage = Self {
            path: path.to_path_buf(),
            inner: Mutex::new(StoreInner {
                file,
                oldest_retained_version: header.version,
            }),
        };
        Ok((storage, info))
    }

    /// Materialize the payload a snapshot's `top_ref` points at.
    pub(crate) fn read_snapshot(&self, top_ref: u64, file_size: u64) -> Result<Vec<u8>> {
        if top_ref == 0 {
            return Ok(Vec::new());
        }
        let inner = self.inner.lock();
        let mut len_buf = [0u8; 4];
        inner
            .file
            .read_exact_at(&mut len_buf, top_ref)
            .map_err(|e| Error::io("read snapshot", &self.path, e))?;
        let len = u64::from(u32::from_le_bytes(len_buf));
        if top_ref + 4 + len > file_size {
            return Err(Error::InvalidDatabase {
                path: self.path.clone(),
                reason: format!("snapshot at {top_ref} overruns logical size {file_size}"),
            });
        }
        let mut payload = vec![0u8; len as usize];
        inner
            .file
            .read_exact_at(&mut payload, top_ref + 4)
            .map_err(|e| Error::io("read snapshot", &self.path, e))?;
        Ok(payload)
    }

    /// Append a snapshot payload at the logical end of file `base` and
    /// return `(new_top_ref, new_file_size)`.
    ///
    /// Caller holds the control mutex, excluding any other process from
    /// resizing the file concurrently.
    pub(crate) fn write_snapshot(&self, base: u64, payload: &[u8]) -> Result<(u64, u64)> {
        let inner = self.inner.lock();
        let len = payload.len() as u32;
        inner
            .file
            .write_all_at(&len.to_le_bytes(), base)
            .map_err(|e| Error::io("write snapshot", &self.path, e))?;
        inner
            .file
            .write_all_at(payload, base + 4)
            .map_err(|e| Error::io("write snapshot", &self.path, e))?;
        Ok((base, base + 4 + u64::from(len)))
    }

    /// Make a published snapshot durable: flush the payload, point the
    /// file header at it, flush again.
    pub(crate) fn commit_header(
        &self,
        version: u64,
        top_ref: u64,
        file_size: u64,
        sync: bool,
    ) -> Result<()> {
        let inner = self.inner.lock();
        if sync {
            inner
                .file
                .sync_data()
                .map_err(|e| Error::io("fsync", &self.path, e))?;
        }
        let mut buf = [0u8; STORE_HEADER_SIZE as usize];
        inner
            .file
            .read_exact_at(&mut buf, 0)
            .map_err(|e| Error::io("read header", &self.path, e))?;
        let mut header = StoreHeader::decode(&buf, &self.path)?;
        header.version = version;
        header.top_ref = top_ref;
        header.file_size = file_size;
        inner
            .file
            .write_all_at(&header.encode(), 0)
            .map_err(|e| Error::io("write header", &self.path, e))?;
        if sync {
            inner
                .file
                .sync_data()
                .map_err(|e| Error::io("fsync", &self.path, e))?;
        }
        Ok(())
    }

    /// Drop everything but the latest snapshot: rewrite the file as a
    /// fresh header plus one payload. Caller guarantees exclusivity.
    pub(crate) fn rewrite(
        &self,
        payload: &[u8],
        version: u64,
        history_type: i8,
        history_schema_version: u16,
    ) -> Result<(u64, u64)> {
        {
            let inner = self.inner.lock();
            inner
                .file
                .set_len(STORE_HEADER_SIZE)
                .map_err(|e| Error::io("truncate", &self.path, e))?;
        }
        let (top_ref, file_size) = if payload.is_empty() {
            (0, STORE_HEADER_SIZE)
        } else {
            self.write_snapshot(STORE_HEADER_SIZE, payload)?
        };
        let inner = self.inner.lock();
        let mut header = StoreHeader::fresh(history_type, history_schema_version);
        header.version = version;
        header.top_ref = top_ref;
        header.file_size = file_size;
        inner
            .file
            .write_all_at(&header.encode(), 0)
            .map_err(|e| Error::io("write header", &self.path, e))?;
        inner
            .file
            .sync_data()
            .map_err(|e| Error::io("fsync", &self.path, e))?;
        log::debug!(
            "[STORE] rewrote {} at version {version}, {} payload bytes",
            self.path.display(),
            payload.len()
        );
        Ok((top_ref, file_size))
    }

    /// Write a standalone copy of one snapshot to `dest`.
    pub(crate) fn export(
        dest: &Path,
        payload: &[u8],
        version: u64,
        history_type: i8,
        history_schema_version: u16,
    ) -> Result<()> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(dest)
            .map_err(|e| Error::io("create", dest, e))?;
        let mut header = StoreHeader::fresh(history_type, history_schema_version);
        header.version = version;
        if !payload.is_empty() {
            let len = payload.len() as u32;
            file.write_all_at(&len.to_le_bytes(), STORE_HEADER_SIZE)
                .map_err(|e| Error::io("write snapshot", dest, e))?;
            file.write_all_at(payload, STORE_HEADER_SIZE + 4)
                .map_err(|e| Error::io("write snapshot", dest, e))?;
            header.top_ref = STORE_HEADER_SIZE;
            header.file_size = STORE_HEADER_SIZE + 4 + u64::from(len);
        }
        file.write_all_at(&header.encode(), 0)
            .map_err(|e| Error::io("write header", dest, e))?;
        file.sync_data().map_err(|e| Error::io("fsync", dest, e))?;
        Ok(())
    }

    /// Record the session's starting version for mapping retirement.
    pub(crate) fn init_mapping_management(&self, version: u64) {
        let mut inner = self.inner.lock();
        inner.oldest_retained_version = version;
    }

    /// The oldest live snapshot moved forward; mappings (and history) up
    /// to `oldest` may be retired.
    pub(crate) fn purge_old_mappings(&self, oldest: u64, newest: u64) {
        let mut inner = self.inner.lock();
        if oldest > inner.oldest_retained_version {
            log::debug!(
                "[STORE] retiring mappings below version {oldest} (newest {newest})"
            );
            inner.oldest_retained_version = oldest;
        }
    }

    #[cfg(test)]
    pub(crate) fn oldest_retained_version(&self) -> u64 {
        self.inner.lock().oldest_retained_version
    }
}
