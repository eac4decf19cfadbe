// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! File-backed shared memory mappings.
//!
//! A `FileMap` is a read-write `MAP_SHARED` view over a prefix of a regular
//! file, so every process mapping the same file observes the same bytes.
//! The mapping can be re-established at a larger size after the file has
//! grown (`remap`), and the file can be grown with real backing blocks via
//! `prealloc` so a later store into the mapping cannot raise `SIGBUS`.
//!
//! # Lifecycle
//!
//! 1. Open or create the file and size it (`prealloc`)
//! 2. `FileMap::map()` the wanted prefix
//! 3. `remap()` after growth; old pointers into the mapping become invalid
//! 4. Mapping is automatically unmapped on drop

use crate::error::{Error, Result};
use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::ptr;

/// Read-write shared mapping of a file prefix.
///
/// Automatically unmaps the region on drop. Does NOT own the file.
pub struct FileMap {
    /// Pointer to the mapped region
    ptr: *mut u8,
    /// Size of the mapping
    size: usize,
    /// Path of the backing file (for error reporting)
    path: PathBuf,
}

// SAFETY: the mapped region is shared memory accessed from multiple threads
// and processes; the structures placed in it synchronize through atomics
// and process-shared mutexes.
unsafe impl Send for FileMap {}
unsafe impl Sync for FileMap {}

impl FileMap {
    /// Map the first `size` bytes of `file` read-write and shared.
    ///
    /// # Errors
    ///
    /// Returns an error if the mmap syscall fails.
    pub fn map(file: &File, size: usize, path: &Path) -> Result<Self> {
        let ptr = Self::raw_map(file, size, path)?;
        Ok(Self {
            ptr,
            size,
            path: path.to_path_buf(),
        })
    }

    fn raw_map(file: &File, size: usize, path: &Path) -> Result<*mut u8> {
        // SAFETY:
        // - First argument is null, letting the kernel choose the address
        // - PROT_READ | PROT_WRITE match the read-write open mode of the file
        // - MAP_SHARED makes stores visible to every process mapping the file
        // - The fd is valid for the duration of the call (borrowed from `file`)
        // - mmap returns MAP_FAILED on error (checked below)
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(Error::io("mmap", path, std::io::Error::last_os_error()));
        }
        Ok(ptr.cast::<u8>())
    }

    /// Replace this mapping with a larger one over the same file.
    ///
    /// The file must already have been grown (see [`prealloc`]). All raw
    /// pointers previously derived from `as_ptr` are invalidated.
    pub fn remap(&mut self, file: &File, size: usize) -> Result<()> {
        debug_assert!(size >= self.size);
        let new_ptr = Self::raw_map(file, size, &self.path)?;
        // SAFETY: self.ptr/self.size describe the previous valid mapping,
        // which nothing references anymore (callers hold the local state
        // lock across remap).
        unsafe {
            libc::munmap(self.ptr.cast::<libc::c_void>(), self.size);
        }
        log::debug!(
            "[MAP] remapped {} from {} to {} bytes",
            self.path.display(),
            self.size,
            size
        );
        self.ptr = new_ptr;
        self.size = size;
        Ok(())
    }

    /// Get raw pointer to the mapped region
    #[inline]
    #[must_use]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// Get the size of the mapping
    #[inline]
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }
}

impl Drop for FileMap {
    fn drop(&mut self) {
        // SAFETY: ptr/size came from a successful mmap and Drop runs once.
        unsafe {
            libc::munmap(self.ptr.cast::<libc::c_void>(), self.size);
        }
    }
}

/// Grow `file` to at least `size` bytes with allocated backing blocks.
///
/// Plain `ftruncate` creates a sparse hole; a store into a hole can fail
/// with `SIGBUS` when the disk is full. `posix_fallocate` reserves the
/// blocks up front, turning disk exhaustion into a clean error here.
pub fn prealloc(file: &File, size: u64, path: &Path) -> Result<()> {
    #[cfg(target_os = "linux")]
    {
        // SAFETY: fd is valid for the duration of the call; size is a plain
        // value. posix_fallocate returns the error number directly.
        let rc = unsafe { libc::posix_fallocate(file.as_raw_fd(), 0, size as libc::off_t) };
        if rc != 0 {
            return Err(Error::io(
                "posix_fallocate",
                path,
                std::io::Error::from_raw_os_error(rc),
            ));
        }
        Ok(())
    }
    #[cfg(not(target_os = "linux"))]
    {
        file.set_len(size)
            .map_err(|e| Error::io("set_len", path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn scratch_file() -> (tempfile::TempDir, File, PathBuf) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("map.bin");
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .expect("open");
        (dir, file, path)
    }

    #[test]
    fn test_map_round_trip() {
        let (_dir, mut file, path) = scratch_file();
        file.write_all(&[0u8; 4096]).expect("fill");

        let map = FileMap::map(&file, 4096, &path).expect("map");
        assert_eq!(map.size(), 4096);

        // SAFETY: the mapping covers 4096 bytes; offsets 0 and 1 are in bounds.
        unsafe {
            *map.as_ptr() = 0x42;
            *map.as_ptr().add(1) = 0x43;
        }

        // A second independent mapping of the same file sees the stores.
        let map2 = FileMap::map(&file, 4096, &path).expect("map2");
        // SAFETY: same bounds as above.
        unsafe {
            assert_eq!(*map2.as_ptr(), 0x42);
            assert_eq!(*map2.as_ptr().add(1), 0x43);
        }
    }

    #[test]
    fn test_remap_preserves_contents() {
        let (_dir, mut file, path) = scratch_file();
        file.write_all(&[7u8; 1024]).expect("fill");

        let mut map = FileMap::map(&file, 1024, &path).expect("map");
        prealloc(&file, 8192, &path).expect("prealloc");
        map.remap(&file, 8192).expect("remap");

        assert_eq!(map.size(), 8192);
        // SAFETY: the remapped region covers 8192 bytes.
        unsafe {
            assert_eq!(*map.as_ptr(), 7);
            assert_eq!(*map.as_ptr().add(1023), 7);
            *map.as_ptr().add(8000) = 9;
            assert_eq!(*map.as_ptr().add(8000), 9);
        }
    }

    #[test]
    fn test_prealloc_extends_file() {
        let (_dir, file, path) = scratch_file();
        prealloc(&file, 65536, &path).expect("prealloc");
        assert_eq!(file.metadata().expect("meta").len(), 65536);
    }
}
