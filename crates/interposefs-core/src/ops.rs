// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! The per-request dispatch surface shared by every layer.
//!
//! `FilesystemOps` has one method per low-level filesystem request kind.
//! The passthrough filesystem implements all of them against the source
//! directory; interception layers override a subset and delegate the rest
//! through [`FilesystemOps::next`]. Methods return typed results rather
//! than replying directly, so a wrapping layer can observe and adjust the
//! outcome of the layer beneath it before it is turned into a kernel
//! reply by the session adapter.

use std::ffi::OsStr;
use std::io;
use std::path::Path;
use std::time::Duration;

use fuser::{FileAttr, FileType, KernelConfig, TimeOrNow};

/// Identity of the process behind a request, copied off the kernel
/// request before it is handed to a worker.
#[derive(Clone, Copy, Debug)]
pub struct RequestCtx {
    pub unique: u64,
    pub uid: u32,
    pub gid: u32,
    pub pid: u32,
}

/// Result of `lookup` and the namespace-mutating operations that produce
/// a directory entry.
#[derive(Clone, Debug)]
pub struct Entry {
    pub ino: u64,
    pub generation: u64,
    pub attr: FileAttr,
    pub attr_ttl: Duration,
    pub entry_ttl: Duration,
}

/// Result of `open`, `create` and `opendir`: the file handle plus the
/// kernel open flags (direct-io, keep-cache, ...).
#[derive(Clone, Copy, Debug)]
pub struct OpenReply {
    pub fh: u64,
    pub flags: u32,
}

/// Attribute changes requested by `setattr`. Absent fields are left
/// untouched.
#[derive(Clone, Copy, Debug, Default)]
pub struct SetattrChanges {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime: Option<TimeOrNow>,
    pub mtime: Option<TimeOrNow>,
    pub fh: Option<u64>,
}

/// Filesystem statistics, mirroring `statvfs`.
#[derive(Clone, Copy, Debug, Default)]
pub struct StatFs {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub namelen: u32,
    pub frsize: u32,
}

/// Reply to `getxattr`/`listxattr`: the value length when the caller
/// probed with size zero, otherwise the value itself.
#[derive(Clone, Debug)]
pub enum XattrReply {
    Size(u32),
    Data(Vec<u8>),
}

/// A POSIX byte-range lock description.
#[derive(Clone, Copy, Debug)]
pub struct LockInfo {
    pub start: u64,
    pub end: u64,
    pub typ: i32,
    pub pid: u32,
}

/// One directory entry offered to a readdir sink.
#[derive(Debug)]
pub struct DirEntry<'a> {
    pub ino: u64,
    /// Offset at which the stream resumes after this entry.
    pub offset: i64,
    pub kind: FileType,
    pub name: &'a OsStr,
}

/// Sink for `readdir`. Returns `true` once the reply buffer is full; the
/// rejected entry must not be considered emitted.
pub type DirFill<'a> = dyn FnMut(DirEntry<'_>) -> bool + 'a;

/// Sink for `readdirplus`. The `Entry` is `None` for `.` and `..`, which
/// are emitted from the raw dirent without a lookup.
pub type DirPlusFill<'a> = dyn FnMut(DirEntry<'_>, Option<&Entry>) -> bool + 'a;

/// The full set of low-level operations. Every method not overridden by a
/// layer behaves exactly like the next layer's method; the passthrough
/// layer at the bottom overrides all of them and never delegates.
///
/// Contract: a method returns exactly one result (delegation counts), and
/// a method that returns an early error must not also delegate. The stack
/// is fixed once `init` has run.
pub trait FilesystemOps: Send + Sync + 'static {
    /// The layer beneath this one.
    fn next(&self) -> &dyn FilesystemOps;

    fn init(&self, config: &mut KernelConfig) -> io::Result<()> {
        self.next().init(config)
    }

    fn destroy(&self) {
        self.next().destroy()
    }

    fn lookup(&self, ctx: &RequestCtx, parent: u64, name: &OsStr) -> io::Result<Entry> {
        self.next().lookup(ctx, parent, name)
    }

    fn forget(&self, ctx: &RequestCtx, ino: u64, nlookup: u64) {
        self.next().forget(ctx, ino, nlookup)
    }

    fn batch_forget(&self, ctx: &RequestCtx, nodes: &[(u64, u64)]) {
        self.next().batch_forget(ctx, nodes)
    }

    fn getattr(
        &self,
        ctx: &RequestCtx,
        ino: u64,
        fh: Option<u64>,
    ) -> io::Result<(FileAttr, Duration)> {
        self.next().getattr(ctx, ino, fh)
    }

    fn setattr(
        &self,
        ctx: &RequestCtx,
        ino: u64,
        changes: &SetattrChanges,
    ) -> io::Result<(FileAttr, Duration)> {
        self.next().setattr(ctx, ino, changes)
    }

    fn readlink(&self, ctx: &RequestCtx, ino: u64) -> io::Result<Vec<u8>> {
        self.next().readlink(ctx, ino)
    }

    fn mknod(
        &self,
        ctx: &RequestCtx,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        rdev: u32,
    ) -> io::Result<Entry> {
        self.next().mknod(ctx, parent, name, mode, umask, rdev)
    }

    fn mkdir(
        &self,
        ctx: &RequestCtx,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
    ) -> io::Result<Entry> {
        self.next().mkdir(ctx, parent, name, mode, umask)
    }

    fn unlink(&self, ctx: &RequestCtx, parent: u64, name: &OsStr) -> io::Result<()> {
        self.next().unlink(ctx, parent, name)
    }

    fn rmdir(&self, ctx: &RequestCtx, parent: u64, name: &OsStr) -> io::Result<()> {
        self.next().rmdir(ctx, parent, name)
    }

    fn symlink(
        &self,
        ctx: &RequestCtx,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
    ) -> io::Result<Entry> {
        self.next().symlink(ctx, parent, link_name, target)
    }

    fn rename(
        &self,
        ctx: &RequestCtx,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
    ) -> io::Result<()> {
        self.next().rename(ctx, parent, name, newparent, newname, flags)
    }

    fn link(
        &self,
        ctx: &RequestCtx,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
    ) -> io::Result<Entry> {
        self.next().link(ctx, ino, newparent, newname)
    }

    fn open(&self, ctx: &RequestCtx, ino: u64, flags: i32) -> io::Result<OpenReply> {
        self.next().open(ctx, ino, flags)
    }

    fn create(
        &self,
        ctx: &RequestCtx,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
    ) -> io::Result<(Entry, OpenReply)> {
        self.next().create(ctx, parent, name, mode, umask, flags)
    }

    fn read(
        &self,
        ctx: &RequestCtx,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
    ) -> io::Result<Vec<u8>> {
        self.next().read(ctx, ino, fh, offset, size)
    }

    fn write(
        &self,
        ctx: &RequestCtx,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
    ) -> io::Result<u32> {
        self.next().write(ctx, ino, fh, offset, data)
    }

    fn flush(&self, ctx: &RequestCtx, ino: u64, fh: u64, lock_owner: u64) -> io::Result<()> {
        self.next().flush(ctx, ino, fh, lock_owner)
    }

    fn release(&self, ctx: &RequestCtx, ino: u64, fh: u64, flags: i32) -> io::Result<()> {
        self.next().release(ctx, ino, fh, flags)
    }

    fn fsync(&self, ctx: &RequestCtx, ino: u64, fh: u64, datasync: bool) -> io::Result<()> {
        self.next().fsync(ctx, ino, fh, datasync)
    }

    fn opendir(&self, ctx: &RequestCtx, ino: u64, flags: i32) -> io::Result<OpenReply> {
        self.next().opendir(ctx, ino, flags)
    }

    fn readdir(
        &self,
        ctx: &RequestCtx,
        ino: u64,
        fh: u64,
        offset: i64,
        fill: &mut DirFill<'_>,
    ) -> io::Result<()> {
        self.next().readdir(ctx, ino, fh, offset, fill)
    }

    fn readdirplus(
        &self,
        ctx: &RequestCtx,
        ino: u64,
        fh: u64,
        offset: i64,
        fill: &mut DirPlusFill<'_>,
    ) -> io::Result<()> {
        self.next().readdirplus(ctx, ino, fh, offset, fill)
    }

    fn releasedir(&self, ctx: &RequestCtx, ino: u64, fh: u64, flags: i32) -> io::Result<()> {
        self.next().releasedir(ctx, ino, fh, flags)
    }

    fn fsyncdir(&self, ctx: &RequestCtx, ino: u64, fh: u64, datasync: bool) -> io::Result<()> {
        self.next().fsyncdir(ctx, ino, fh, datasync)
    }

    fn statfs(&self, ctx: &RequestCtx, ino: u64) -> io::Result<StatFs> {
        self.next().statfs(ctx, ino)
    }

    fn setxattr(
        &self,
        ctx: &RequestCtx,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        flags: i32,
    ) -> io::Result<()> {
        self.next().setxattr(ctx, ino, name, value, flags)
    }

    fn getxattr(
        &self,
        ctx: &RequestCtx,
        ino: u64,
        name: &OsStr,
        size: u32,
    ) -> io::Result<XattrReply> {
        self.next().getxattr(ctx, ino, name, size)
    }

    fn listxattr(&self, ctx: &RequestCtx, ino: u64, size: u32) -> io::Result<XattrReply> {
        self.next().listxattr(ctx, ino, size)
    }

    fn removexattr(&self, ctx: &RequestCtx, ino: u64, name: &OsStr) -> io::Result<()> {
        self.next().removexattr(ctx, ino, name)
    }

    fn access(&self, ctx: &RequestCtx, ino: u64, mask: i32) -> io::Result<()> {
        self.next().access(ctx, ino, mask)
    }

    fn getlk(
        &self,
        ctx: &RequestCtx,
        ino: u64,
        fh: u64,
        lock_owner: u64,
        lock: &LockInfo,
    ) -> io::Result<LockInfo> {
        self.next().getlk(ctx, ino, fh, lock_owner, lock)
    }

    fn setlk(
        &self,
        ctx: &RequestCtx,
        ino: u64,
        fh: u64,
        lock_owner: u64,
        lock: &LockInfo,
        sleep: bool,
    ) -> io::Result<()> {
        self.next().setlk(ctx, ino, fh, lock_owner, lock, sleep)
    }

    fn fallocate(
        &self,
        ctx: &RequestCtx,
        ino: u64,
        fh: u64,
        offset: i64,
        length: i64,
        mode: i32,
    ) -> io::Result<()> {
        self.next().fallocate(ctx, ino, fh, offset, length, mode)
    }

    fn lseek(
        &self,
        ctx: &RequestCtx,
        ino: u64,
        fh: u64,
        offset: i64,
        whence: i32,
    ) -> io::Result<i64> {
        self.next().lseek(ctx, ino, fh, offset, whence)
    }

    #[allow(clippy::too_many_arguments)]
    fn copy_file_range(
        &self,
        ctx: &RequestCtx,
        ino_in: u64,
        fh_in: u64,
        offset_in: i64,
        ino_out: u64,
        fh_out: u64,
        offset_out: i64,
        len: u64,
        flags: u32,
    ) -> io::Result<u32> {
        self.next().copy_file_range(
            ctx, ino_in, fh_in, offset_in, ino_out, fh_out, offset_out, len, flags,
        )
    }
}

impl RequestCtx {
    /// Context for internally generated requests (tests, maintenance).
    pub fn internal() -> Self {
        Self {
            unique: 0,
            uid: 0,
            gid: 0,
            pid: 0,
        }
    }
}
