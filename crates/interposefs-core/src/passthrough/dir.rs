// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Directory handles: a second, readable descriptor opened from the
//! inode's path-only one, wrapped in a libc directory stream with a
//! resumable cursor.

use std::ffi::{CStr, OsString};
use std::io;
use std::os::fd::{IntoRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;

/// An entry pulled off the stream but not yet delivered to the kernel.
#[derive(Debug)]
pub struct StreamEntry {
    pub ino: u64,
    /// Offset of the entry *after* this one.
    pub next_offset: i64,
    pub file_type: u8,
    pub name: OsString,
}

impl StreamEntry {
    pub fn is_dot(&self) -> bool {
        let bytes = self.name.as_bytes();
        bytes == b"." || bytes == b".."
    }
}

/// Wrapper around `DIR*` with the cursor the readdir contract needs:
/// the offset the stream is positioned at and the entry that did not fit
/// in the previous reply buffer.
#[derive(Debug)]
pub struct DirStream {
    dir: *mut libc::DIR,
    pub offset: i64,
    pub pending: Option<StreamEntry>,
}

// The raw stream pointer is only touched under the handle's mutex.
unsafe impl Send for DirStream {}

impl DirStream {
    /// Takes ownership of `fd`; the descriptor is closed by `closedir`
    /// when the stream drops.
    pub fn from_fd(fd: OwnedFd) -> io::Result<Self> {
        let raw = fd.into_raw_fd();
        let dir = unsafe { libc::fdopendir(raw) };
        if dir.is_null() {
            let err = io::Error::last_os_error();
            unsafe { libc::close(raw) };
            return Err(err);
        }
        Ok(Self {
            dir,
            offset: 0,
            pending: None,
        })
    }

    pub fn seek(&mut self, offset: i64) {
        unsafe { libc::seekdir(self.dir, offset as libc::c_long) };
        self.offset = offset;
        self.pending = None;
    }

    /// Reads the next raw entry, `Ok(None)` at end of stream.
    pub fn next_entry(&mut self) -> io::Result<Option<StreamEntry>> {
        unsafe { *libc::__errno_location() = 0 };
        let ent = unsafe { libc::readdir(self.dir) };
        if ent.is_null() {
            return match io::Error::last_os_error().raw_os_error() {
                Some(0) | None => Ok(None),
                Some(errno) => Err(io::Error::from_raw_os_error(errno)),
            };
        }
        let ent = unsafe { &*ent };
        let name = unsafe { CStr::from_ptr(ent.d_name.as_ptr()) };
        Ok(Some(StreamEntry {
            ino: ent.d_ino,
            next_offset: ent.d_off,
            file_type: ent.d_type,
            name: OsString::from(std::ffi::OsStr::from_bytes(name.to_bytes())),
        }))
    }

    pub fn fd(&self) -> RawFd {
        unsafe { libc::dirfd(self.dir) }
    }
}

impl Drop for DirStream {
    fn drop(&mut self) {
        unsafe { libc::closedir(self.dir) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::passthrough::sys;
    use std::collections::HashSet;
    use std::ffi::OsStr;

    fn open_stream(path: &std::path::Path) -> DirStream {
        let fd = sys::open(path.as_os_str(), libc::O_RDONLY).unwrap();
        DirStream::from_fd(fd).unwrap()
    }

    #[test]
    fn walks_every_entry_including_dots() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("one"), b"").unwrap();
        std::fs::create_dir(dir.path().join("two")).unwrap();

        let mut stream = open_stream(dir.path());
        let mut names = HashSet::new();
        while let Some(ent) = stream.next_entry().unwrap() {
            names.insert(ent.name);
        }
        for expected in [".", "..", "one", "two"] {
            assert!(names.contains(OsStr::new(expected)), "missing {expected}");
        }
    }

    #[test]
    fn seek_resumes_from_a_saved_offset() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a", "b", "c", "d"] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }

        let mut stream = open_stream(dir.path());
        let first = stream.next_entry().unwrap().unwrap();
        let resume_at = first.next_offset;
        let second = stream.next_entry().unwrap().unwrap();

        stream.seek(resume_at);
        let replayed = stream.next_entry().unwrap().unwrap();
        assert_eq!(replayed.name, second.name);
    }
}
