// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! The passthrough layer: maps every filesystem request onto the source
//! directory through descriptor-relative syscalls. Sits at the bottom of
//! the layer stack and never delegates.
//!
//! No path is ever resolved from the mount root. Each inode keeps an
//! `O_PATH` descriptor; operations that need a real handle re-open it
//! through `/proc/self/fd`, which preserves the no-symlink-follow
//! property of the original open.

pub mod dir;
pub mod inode;
pub mod sys;

use std::collections::HashMap;
use std::ffi::OsStr;
use std::io;
use std::os::fd::{AsRawFd, IntoRawFd, RawFd};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::consts::{FOPEN_DIRECT_IO, FOPEN_KEEP_CACHE};
use fuser::{FileAttr, FileType, KernelConfig, TimeOrNow};
use tracing::{debug, info, warn};

use crate::ops::{
    DirEntry, DirFill, DirPlusFill, Entry, FilesystemOps, LockInfo, OpenReply, RequestCtx,
    SetattrChanges, StatFs, XattrReply,
};
use dir::DirStream;
use inode::{InodeData, InodeKey, InodeTable};

/// FUSE capability bit for writeback caching (ABI 7.23+).
const FUSE_WRITEBACK_CACHE_FLAG: u32 = 1 << 16;

/// FUSE capability bit for BSD flock locks (ABI 7.17+).
const FUSE_FLOCK_LOCKS_FLAG: u32 = 1 << 10;

/// Kernel caching regime for file data and metadata.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CachePolicy {
    /// Direct I/O, no kernel caching.
    Never,
    #[default]
    Auto,
    /// Keep kernel caches across closes.
    Always,
}

impl CachePolicy {
    pub fn default_timeout(self) -> Duration {
        match self {
            CachePolicy::Never => Duration::ZERO,
            CachePolicy::Auto => Duration::from_secs(1),
            CachePolicy::Always => Duration::from_secs(86400),
        }
    }
}

/// Mount-option knobs of the passthrough layer.
#[derive(Clone, Debug, Default)]
pub struct PassthroughOptions {
    pub writeback: bool,
    pub flock: bool,
    pub xattr: bool,
    pub cache: CachePolicy,
    /// Explicit attr/entry timeout; defaults per cache policy.
    pub timeout: Option<Duration>,
}

#[derive(Debug)]
pub struct PassthroughFs {
    inodes: InodeTable,
    opts: PassthroughOptions,
    timeout: Duration,
    /// Set at `init` once the kernel has accepted the capability.
    writeback_active: AtomicBool,
    dir_handles: Mutex<HashMap<u64, Arc<Mutex<DirStream>>>>,
    next_dir_fh: AtomicU64,
}

impl PassthroughFs {
    pub fn new(source: &Path, opts: PassthroughOptions) -> io::Result<Self> {
        let root_fd = sys::open(source.as_os_str(), libc::O_PATH)?;
        let st = sys::fstatat_empty(root_fd.as_raw_fd())?;
        if st.st_mode & libc::S_IFMT != libc::S_IFDIR {
            return Err(io::Error::from_raw_os_error(libc::ENOTDIR));
        }
        let timeout = opts.timeout.unwrap_or_else(|| opts.cache.default_timeout());
        Ok(Self {
            inodes: InodeTable::new(root_fd, InodeKey::from_stat(&st)),
            opts,
            timeout,
            writeback_active: AtomicBool::new(false),
            dir_handles: Mutex::new(HashMap::new()),
            next_dir_fh: AtomicU64::new(1),
        })
    }

    pub fn inodes(&self) -> &InodeTable {
        &self.inodes
    }

    fn writeback(&self) -> bool {
        self.writeback_active.load(Ordering::Relaxed)
    }

    fn do_lookup(&self, parent: u64, name: &OsStr) -> io::Result<(Entry, Arc<InodeData>)> {
        let parent_data = self.inodes.get(parent)?;
        let fd = sys::openat(
            parent_data.fd(),
            name,
            libc::O_PATH | libc::O_NOFOLLOW,
            0,
        )?;
        let st = sys::fstatat_empty(fd.as_raw_fd())?;
        let reg = self.inodes.register(InodeKey::from_stat(&st), fd);
        let entry = Entry {
            ino: reg.ino,
            generation: reg.generation,
            attr: attr_from_stat(&st, reg.ino),
            attr_ttl: self.timeout,
            entry_ttl: self.timeout,
        };
        Ok((entry, reg.data))
    }

    fn dir_handle(&self, fh: u64) -> io::Result<Arc<Mutex<DirStream>>> {
        self.dir_handles
            .lock()
            .unwrap()
            .get(&fh)
            .cloned()
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EBADF))
    }

    fn open_flags_for(&self, flags: i32) -> u32 {
        let mut reply_flags = match self.opts.cache {
            CachePolicy::Never => FOPEN_DIRECT_IO,
            CachePolicy::Auto => 0,
            CachePolicy::Always => FOPEN_KEEP_CACHE,
        };
        if flags & libc::O_DIRECT != 0 {
            reply_flags |= FOPEN_DIRECT_IO;
        }
        reply_flags
    }
}

impl FilesystemOps for PassthroughFs {
    /// Bottom of the stack. Every handler is implemented here, so
    /// delegation never happens and this is never followed.
    fn next(&self) -> &dyn FilesystemOps {
        self
    }

    fn init(&self, config: &mut KernelConfig) -> io::Result<()> {
        if self.opts.writeback {
            match config.add_capabilities(FUSE_WRITEBACK_CACHE_FLAG) {
                Ok(()) => {
                    self.writeback_active.store(true, Ordering::Relaxed);
                    info!(target: "interposefs::session", "writeback cache enabled");
                }
                Err(missing) => warn!(
                    target: "interposefs::session",
                    "kernel rejected writeback cache capability (missing bits: {missing:#x})"
                ),
            }
        }
        if self.opts.flock {
            match config.add_capabilities(FUSE_FLOCK_LOCKS_FLAG) {
                Ok(()) => info!(target: "interposefs::session", "flock locks enabled"),
                Err(missing) => warn!(
                    target: "interposefs::session",
                    "kernel rejected flock capability (missing bits: {missing:#x})"
                ),
            }
        }
        Ok(())
    }

    fn destroy(&self) {
        self.dir_handles.lock().unwrap().clear();
        self.inodes.clear();
        debug!(target: "interposefs::session", "passthrough destroyed, descriptors closed");
    }

    fn lookup(&self, _ctx: &RequestCtx, parent: u64, name: &OsStr) -> io::Result<Entry> {
        let (entry, _) = self.do_lookup(parent, name)?;
        Ok(entry)
    }

    fn forget(&self, _ctx: &RequestCtx, ino: u64, nlookup: u64) {
        self.inodes.forget(ino, nlookup);
    }

    fn batch_forget(&self, _ctx: &RequestCtx, nodes: &[(u64, u64)]) {
        for &(ino, nlookup) in nodes {
            self.inodes.forget(ino, nlookup);
        }
    }

    fn getattr(
        &self,
        _ctx: &RequestCtx,
        ino: u64,
        fh: Option<u64>,
    ) -> io::Result<(FileAttr, Duration)> {
        let st = match fh {
            Some(fh) => sys::fstat(fh as RawFd)?,
            None => sys::fstatat_empty(self.inodes.get(ino)?.raw_fd())?,
        };
        Ok((attr_from_stat(&st, ino), self.timeout))
    }

    fn setattr(
        &self,
        ctx: &RequestCtx,
        ino: u64,
        changes: &SetattrChanges,
    ) -> io::Result<(FileAttr, Duration)> {
        let inode = self.inodes.get(ino)?;
        if let Some(mode) = changes.mode {
            match changes.fh {
                Some(fh) => sys::fchmod(fh as RawFd, mode)?,
                None => sys::chmod_proc(inode.raw_fd(), mode)?,
            }
        }
        if changes.uid.is_some() || changes.gid.is_some() {
            // -1 leaves the corresponding id untouched.
            sys::fchownat_empty(
                inode.raw_fd(),
                changes.uid.unwrap_or(u32::MAX),
                changes.gid.unwrap_or(u32::MAX),
            )?;
        }
        if let Some(size) = changes.size {
            match changes.fh {
                Some(fh) => sys::ftruncate(fh as RawFd, size as libc::off_t)?,
                None => sys::truncate_proc(inode.raw_fd(), size as libc::off_t)?,
            }
        }
        if changes.atime.is_some() || changes.mtime.is_some() {
            let times = [timespec_of(changes.atime), timespec_of(changes.mtime)];
            match changes.fh {
                Some(fh) => sys::futimens(fh as RawFd, &times)?,
                None => sys::utimensat_proc(inode.raw_fd(), &times)?,
            }
        }
        self.getattr(ctx, ino, changes.fh)
    }

    fn readlink(&self, _ctx: &RequestCtx, ino: u64) -> io::Result<Vec<u8>> {
        use std::os::unix::ffi::OsStringExt;
        let inode = self.inodes.get(ino)?;
        Ok(sys::readlinkat_empty(inode.raw_fd())?.into_vec())
    }

    fn mknod(
        &self,
        _ctx: &RequestCtx,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        rdev: u32,
    ) -> io::Result<Entry> {
        let parent_data = self.inodes.get(parent)?;
        match mode & libc::S_IFMT {
            libc::S_IFREG => {
                let fd = sys::openat(
                    parent_data.fd(),
                    name,
                    libc::O_CREAT | libc::O_EXCL | libc::O_WRONLY,
                    mode,
                )?;
                drop(fd);
            }
            libc::S_IFDIR => sys::mkdirat(parent_data.fd(), name, mode)?,
            libc::S_IFIFO => sys::mkfifoat(parent_data.fd(), name, mode)?,
            libc::S_IFSOCK => sys::bind_socket_at(parent_data.fd(), name)?,
            _ => sys::mknodat(parent_data.fd(), name, mode, rdev as libc::dev_t)?,
        }
        drop(parent_data);
        let (entry, _) = self.do_lookup(parent, name)?;
        Ok(entry)
    }

    fn mkdir(
        &self,
        _ctx: &RequestCtx,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
    ) -> io::Result<Entry> {
        let parent_data = self.inodes.get(parent)?;
        sys::mkdirat(parent_data.fd(), name, mode)?;
        drop(parent_data);
        let (entry, _) = self.do_lookup(parent, name)?;
        Ok(entry)
    }

    fn unlink(&self, _ctx: &RequestCtx, parent: u64, name: &OsStr) -> io::Result<()> {
        sys::unlinkat(self.inodes.get(parent)?.fd(), name, 0)
    }

    fn rmdir(&self, _ctx: &RequestCtx, parent: u64, name: &OsStr) -> io::Result<()> {
        sys::unlinkat(self.inodes.get(parent)?.fd(), name, libc::AT_REMOVEDIR)
    }

    fn symlink(
        &self,
        _ctx: &RequestCtx,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
    ) -> io::Result<Entry> {
        let parent_data = self.inodes.get(parent)?;
        sys::symlinkat(target.as_os_str(), parent_data.fd(), link_name)?;
        drop(parent_data);
        let (entry, _) = self.do_lookup(parent, link_name)?;
        Ok(entry)
    }

    fn rename(
        &self,
        _ctx: &RequestCtx,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
    ) -> io::Result<()> {
        if flags != 0 {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        let old = self.inodes.get(parent)?;
        let new = self.inodes.get(newparent)?;
        sys::renameat(old.fd(), name, new.fd(), newname)
    }

    fn link(
        &self,
        _ctx: &RequestCtx,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
    ) -> io::Result<Entry> {
        let inode = self.inodes.get(ino)?;
        let parent_data = self.inodes.get(newparent)?;
        sys::linkat_proc(inode.raw_fd(), parent_data.fd(), newname)?;
        let st = sys::fstatat_empty(inode.raw_fd())?;
        inode.inc_lookup();
        Ok(Entry {
            ino,
            generation: inode.generation(),
            attr: attr_from_stat(&st, ino),
            attr_ttl: self.timeout,
            entry_ttl: self.timeout,
        })
    }

    fn open(&self, _ctx: &RequestCtx, ino: u64, flags: i32) -> io::Result<OpenReply> {
        let inode = self.inodes.get(ino)?;
        let mut flags = flags;
        if self.writeback() {
            // The kernel may issue reads against write-only opens when it
            // owns the page cache, and handles O_APPEND itself.
            if flags & libc::O_ACCMODE == libc::O_WRONLY {
                flags = (flags & !libc::O_ACCMODE) | libc::O_RDWR;
            }
            flags &= !libc::O_APPEND;
        }
        let fd = sys::open_proc(inode.raw_fd(), flags & !libc::O_NOFOLLOW)?;
        inode.inc_open();
        Ok(OpenReply {
            fh: fd.into_raw_fd() as u64,
            flags: self.open_flags_for(flags),
        })
    }

    fn create(
        &self,
        _ctx: &RequestCtx,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
    ) -> io::Result<(Entry, OpenReply)> {
        let parent_data = self.inodes.get(parent)?;
        let fd = sys::openat(
            parent_data.fd(),
            name,
            (flags | libc::O_CREAT) & !libc::O_NOFOLLOW,
            mode,
        )?;
        drop(parent_data);
        let (entry, data) = self.do_lookup(parent, name)?;
        data.inc_open();
        Ok((
            entry,
            OpenReply {
                fh: fd.into_raw_fd() as u64,
                flags: self.open_flags_for(flags),
            },
        ))
    }

    fn read(
        &self,
        _ctx: &RequestCtx,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
    ) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; size as usize];
        let n = sys::pread(fh as RawFd, &mut buf, offset as libc::off_t)?;
        buf.truncate(n);
        Ok(buf)
    }

    fn write(
        &self,
        _ctx: &RequestCtx,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
    ) -> io::Result<u32> {
        let n = sys::pwrite(fh as RawFd, data, offset as libc::off_t)?;
        Ok(n as u32)
    }

    fn flush(&self, _ctx: &RequestCtx, _ino: u64, fh: u64, _lock_owner: u64) -> io::Result<()> {
        sys::close_dup(fh as RawFd)
    }

    fn release(&self, _ctx: &RequestCtx, ino: u64, fh: u64, _flags: i32) -> io::Result<()> {
        let result = sys::close(fh as RawFd);
        if let Ok(inode) = self.inodes.get(ino) {
            inode.dec_open();
        }
        result
    }

    fn fsync(&self, _ctx: &RequestCtx, _ino: u64, fh: u64, datasync: bool) -> io::Result<()> {
        sys::fsync(fh as RawFd, datasync)
    }

    fn opendir(&self, _ctx: &RequestCtx, ino: u64, _flags: i32) -> io::Result<OpenReply> {
        let inode = self.inodes.get(ino)?;
        let fd = sys::openat(inode.fd(), OsStr::new("."), libc::O_RDONLY, 0)?;
        let stream = DirStream::from_fd(fd)?;
        let fh = self.next_dir_fh.fetch_add(1, Ordering::Relaxed);
        self.dir_handles
            .lock()
            .unwrap()
            .insert(fh, Arc::new(Mutex::new(stream)));
        Ok(OpenReply { fh, flags: 0 })
    }

    fn readdir(
        &self,
        _ctx: &RequestCtx,
        _ino: u64,
        fh: u64,
        offset: i64,
        fill: &mut DirFill<'_>,
    ) -> io::Result<()> {
        let handle = self.dir_handle(fh)?;
        let mut stream = handle.lock().unwrap();
        if offset != stream.offset {
            stream.seek(offset);
        }
        let mut emitted = false;
        loop {
            let ent = match stream.pending.take() {
                Some(ent) => ent,
                None => match stream.next_entry() {
                    Ok(Some(ent)) => ent,
                    Ok(None) => break,
                    // Entries already in the buffer would leak state if
                    // discarded now; return what was collected.
                    Err(err) if !emitted => return Err(err),
                    Err(_) => break,
                },
            };
            let full = fill(DirEntry {
                ino: ent.ino,
                offset: ent.next_offset,
                kind: file_type_from_dirent(ent.file_type),
                name: &ent.name,
            });
            if full {
                stream.pending = Some(ent);
                break;
            }
            stream.offset = ent.next_offset;
            emitted = true;
        }
        Ok(())
    }

    fn readdirplus(
        &self,
        _ctx: &RequestCtx,
        ino: u64,
        fh: u64,
        offset: i64,
        fill: &mut DirPlusFill<'_>,
    ) -> io::Result<()> {
        let handle = self.dir_handle(fh)?;
        let mut stream = handle.lock().unwrap();
        if offset != stream.offset {
            stream.seek(offset);
        }
        let mut emitted = false;
        loop {
            let ent = match stream.pending.take() {
                Some(ent) => ent,
                None => match stream.next_entry() {
                    Ok(Some(ent)) => ent,
                    Ok(None) => break,
                    Err(err) if !emitted => return Err(err),
                    Err(_) => break,
                },
            };
            let dir_entry = DirEntry {
                ino: ent.ino,
                offset: ent.next_offset,
                kind: file_type_from_dirent(ent.file_type),
                name: &ent.name,
            };
            let full = if ent.is_dot() {
                fill(dir_entry, None)
            } else {
                let (entry, _) = match self.do_lookup(ino, &ent.name) {
                    Ok(found) => found,
                    Err(err) if !emitted => return Err(err),
                    Err(_) => break,
                };
                let full = fill(
                    DirEntry {
                        ino: entry.ino,
                        offset: ent.next_offset,
                        kind: file_type_from_dirent(ent.file_type),
                        name: &ent.name,
                    },
                    Some(&entry),
                );
                if full {
                    // The entry never reached the kernel; drop the
                    // reference the lookup just took.
                    self.inodes.forget(entry.ino, 1);
                }
                full
            };
            if full {
                stream.pending = Some(ent);
                break;
            }
            stream.offset = ent.next_offset;
            emitted = true;
        }
        Ok(())
    }

    fn releasedir(&self, _ctx: &RequestCtx, _ino: u64, fh: u64, _flags: i32) -> io::Result<()> {
        self.dir_handles.lock().unwrap().remove(&fh);
        Ok(())
    }

    fn fsyncdir(&self, _ctx: &RequestCtx, _ino: u64, fh: u64, datasync: bool) -> io::Result<()> {
        let handle = self.dir_handle(fh)?;
        let stream = handle.lock().unwrap();
        sys::fsync(stream.fd(), datasync)
    }

    fn statfs(&self, _ctx: &RequestCtx, ino: u64) -> io::Result<StatFs> {
        let st = sys::fstatvfs(self.inodes.get(ino)?.raw_fd())?;
        Ok(StatFs {
            blocks: st.f_blocks,
            bfree: st.f_bfree,
            bavail: st.f_bavail,
            files: st.f_files,
            ffree: st.f_ffree,
            bsize: st.f_bsize as u32,
            namelen: st.f_namemax as u32,
            frsize: st.f_frsize as u32,
        })
    }

    fn setxattr(
        &self,
        _ctx: &RequestCtx,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        flags: i32,
    ) -> io::Result<()> {
        if !self.opts.xattr {
            return Err(io::Error::from_raw_os_error(libc::ENOSYS));
        }
        sys::setxattr_proc(self.inodes.get(ino)?.raw_fd(), name, value, flags)
    }

    fn getxattr(
        &self,
        _ctx: &RequestCtx,
        ino: u64,
        name: &OsStr,
        size: u32,
    ) -> io::Result<XattrReply> {
        if !self.opts.xattr {
            return Err(io::Error::from_raw_os_error(libc::ENOSYS));
        }
        let inode = self.inodes.get(ino)?;
        if size == 0 {
            let len = sys::getxattr_proc(inode.raw_fd(), name, &mut [])?;
            Ok(XattrReply::Size(len as u32))
        } else {
            let mut buf = vec![0u8; size as usize];
            let len = sys::getxattr_proc(inode.raw_fd(), name, &mut buf)?;
            buf.truncate(len);
            Ok(XattrReply::Data(buf))
        }
    }

    fn listxattr(&self, _ctx: &RequestCtx, ino: u64, size: u32) -> io::Result<XattrReply> {
        if !self.opts.xattr {
            return Err(io::Error::from_raw_os_error(libc::ENOSYS));
        }
        let inode = self.inodes.get(ino)?;
        if size == 0 {
            let len = sys::listxattr_proc(inode.raw_fd(), &mut [])?;
            Ok(XattrReply::Size(len as u32))
        } else {
            let mut buf = vec![0u8; size as usize];
            let len = sys::listxattr_proc(inode.raw_fd(), &mut buf)?;
            buf.truncate(len);
            Ok(XattrReply::Data(buf))
        }
    }

    fn removexattr(&self, _ctx: &RequestCtx, ino: u64, name: &OsStr) -> io::Result<()> {
        if !self.opts.xattr {
            return Err(io::Error::from_raw_os_error(libc::ENOSYS));
        }
        sys::removexattr_proc(self.inodes.get(ino)?.raw_fd(), name)
    }

    fn access(&self, _ctx: &RequestCtx, ino: u64, mask: i32) -> io::Result<()> {
        sys::faccessat_proc(self.inodes.get(ino)?.raw_fd(), mask)
    }

    fn getlk(
        &self,
        _ctx: &RequestCtx,
        _ino: u64,
        fh: u64,
        _lock_owner: u64,
        lock: &LockInfo,
    ) -> io::Result<LockInfo> {
        let mut fl = flock_of(lock);
        sys::fcntl_getlk(fh as RawFd, &mut fl)?;
        Ok(lockinfo_of(&fl))
    }

    fn setlk(
        &self,
        _ctx: &RequestCtx,
        _ino: u64,
        fh: u64,
        _lock_owner: u64,
        lock: &LockInfo,
        sleep: bool,
    ) -> io::Result<()> {
        let fl = flock_of(lock);
        sys::fcntl_setlk(fh as RawFd, &fl, sleep)
    }

    fn fallocate(
        &self,
        _ctx: &RequestCtx,
        _ino: u64,
        fh: u64,
        offset: i64,
        length: i64,
        mode: i32,
    ) -> io::Result<()> {
        sys::fallocate(
            fh as RawFd,
            mode,
            offset as libc::off_t,
            length as libc::off_t,
        )
    }

    fn lseek(
        &self,
        _ctx: &RequestCtx,
        _ino: u64,
        fh: u64,
        offset: i64,
        whence: i32,
    ) -> io::Result<i64> {
        sys::lseek(fh as RawFd, offset as libc::off_t, whence)
    }

    fn copy_file_range(
        &self,
        _ctx: &RequestCtx,
        _ino_in: u64,
        fh_in: u64,
        offset_in: i64,
        _ino_out: u64,
        fh_out: u64,
        offset_out: i64,
        len: u64,
        flags: u32,
    ) -> io::Result<u32> {
        let copied = sys::copy_file_range(
            fh_in as RawFd,
            offset_in as libc::off_t,
            fh_out as RawFd,
            offset_out as libc::off_t,
            len as usize,
            flags,
        )?;
        Ok(copied as u32)
    }
}

fn attr_from_stat(st: &libc::stat, ino: u64) -> FileAttr {
    FileAttr {
        ino,
        size: st.st_size as u64,
        blocks: st.st_blocks as u64,
        atime: system_time(st.st_atime, st.st_atime_nsec),
        mtime: system_time(st.st_mtime, st.st_mtime_nsec),
        ctime: system_time(st.st_ctime, st.st_ctime_nsec),
        crtime: UNIX_EPOCH,
        kind: file_type_from_mode(st.st_mode),
        perm: (st.st_mode & 0o7777) as u16,
        nlink: st.st_nlink as u32,
        uid: st.st_uid,
        gid: st.st_gid,
        rdev: st.st_rdev as u32,
        blksize: st.st_blksize as u32,
        flags: 0,
    }
}

fn system_time(secs: i64, nsecs: i64) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::new(secs as u64, nsecs as u32)
    } else {
        UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs()) + Duration::from_nanos(nsecs as u64)
    }
}

fn file_type_from_mode(mode: libc::mode_t) -> FileType {
    match mode & libc::S_IFMT {
        libc::S_IFDIR => FileType::Directory,
        libc::S_IFLNK => FileType::Symlink,
        libc::S_IFIFO => FileType::NamedPipe,
        libc::S_IFSOCK => FileType::Socket,
        libc::S_IFCHR => FileType::CharDevice,
        libc::S_IFBLK => FileType::BlockDevice,
        _ => FileType::RegularFile,
    }
}

fn file_type_from_dirent(d_type: u8) -> FileType {
    match d_type {
        libc::DT_DIR => FileType::Directory,
        libc::DT_LNK => FileType::Symlink,
        libc::DT_FIFO => FileType::NamedPipe,
        libc::DT_SOCK => FileType::Socket,
        libc::DT_CHR => FileType::CharDevice,
        libc::DT_BLK => FileType::BlockDevice,
        _ => FileType::RegularFile,
    }
}

fn timespec_of(time: Option<TimeOrNow>) -> libc::timespec {
    match time {
        None => libc::timespec {
            tv_sec: 0,
            tv_nsec: libc::UTIME_OMIT,
        },
        Some(TimeOrNow::Now) => libc::timespec {
            tv_sec: 0,
            tv_nsec: libc::UTIME_NOW,
        },
        Some(TimeOrNow::SpecificTime(at)) => match at.duration_since(UNIX_EPOCH) {
            Ok(d) => libc::timespec {
                tv_sec: d.as_secs() as libc::time_t,
                tv_nsec: d.subsec_nanos() as libc::c_long,
            },
            Err(before) => libc::timespec {
                tv_sec: -(before.duration().as_secs() as libc::time_t),
                tv_nsec: 0,
            },
        },
    }
}

fn flock_of(lock: &LockInfo) -> libc::flock {
    let mut fl: libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = lock.typ as libc::c_short;
    fl.l_whence = libc::SEEK_SET as libc::c_short;
    fl.l_start = lock.start as libc::off_t;
    fl.l_len = if lock.end >= i64::MAX as u64 {
        0
    } else {
        (lock.end - lock.start + 1) as libc::off_t
    };
    fl.l_pid = 0;
    fl
}

fn lockinfo_of(fl: &libc::flock) -> LockInfo {
    let end = if fl.l_len == 0 {
        i64::MAX as u64
    } else {
        (fl.l_start + fl.l_len - 1) as u64
    };
    LockInfo {
        start: fl.l_start as u64,
        end,
        typ: fl.l_type as i32,
        pid: fl.l_pid as u32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsString;

    fn mount(dir: &Path) -> PassthroughFs {
        PassthroughFs::new(dir, PassthroughOptions::default()).unwrap()
    }

    fn ctx() -> RequestCtx {
        RequestCtx::internal()
    }

    const ROOT: u64 = fuser::FUSE_ROOT_ID;

    #[test]
    fn source_must_be_a_directory() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f");
        std::fs::write(&file, b"").unwrap();
        let err = PassthroughFs::new(&file, PassthroughOptions::default()).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOTDIR));
    }

    #[test]
    fn create_write_flush_release_then_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let fs = mount(dir.path());

        let (entry, open) = fs
            .create(&ctx(), ROOT, OsStr::new("hello"), 0o644, 0, libc::O_WRONLY)
            .unwrap();
        assert_eq!(entry.attr.kind, FileType::RegularFile);
        let written = fs.write(&ctx(), entry.ino, open.fh, 0, b"world").unwrap();
        assert_eq!(written, 5);
        fs.flush(&ctx(), entry.ino, open.fh, 0).unwrap();
        fs.release(&ctx(), entry.ino, open.fh, 0).unwrap();

        let reopened = fs.open(&ctx(), entry.ino, libc::O_RDONLY).unwrap();
        let data = fs.read(&ctx(), entry.ino, reopened.fh, 0, 5).unwrap();
        assert_eq!(data, b"world");
        fs.release(&ctx(), entry.ino, reopened.fh, 0).unwrap();

        assert_eq!(std::fs::read(dir.path().join("hello")).unwrap(), b"world");
    }

    #[test]
    fn lookup_twice_returns_the_same_ino() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a"), b"x").unwrap();
        let fs = mount(dir.path());

        let first = fs.lookup(&ctx(), ROOT, OsStr::new("a")).unwrap();
        let second = fs.lookup(&ctx(), ROOT, OsStr::new("a")).unwrap();
        assert_eq!(first.ino, second.ino);

        let inode = fs.inodes().get(first.ino).unwrap();
        assert_eq!(inode.lookup_count(), 2);
        drop(inode);

        fs.forget(&ctx(), first.ino, 2);
        assert!(fs.inodes().is_empty());
    }

    #[test]
    fn rename_rejects_nonzero_flags() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a"), b"x").unwrap();
        let fs = mount(dir.path());

        let err = fs
            .rename(&ctx(), ROOT, OsStr::new("a"), ROOT, OsStr::new("b"), 1)
            .unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EINVAL));
        assert!(dir.path().join("a").exists());

        fs.rename(&ctx(), ROOT, OsStr::new("a"), ROOT, OsStr::new("b"), 0)
            .unwrap();
        assert!(!dir.path().join("a").exists());
        assert!(dir.path().join("b").exists());
    }

    #[test]
    fn readdir_lists_the_tree() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("file"), b"x").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let fs = mount(dir.path());

        let open = fs.opendir(&ctx(), ROOT, libc::O_RDONLY).unwrap();
        let mut names = Vec::new();
        fs.readdir(&ctx(), ROOT, open.fh, 0, &mut |ent| {
            names.push(ent.name.to_os_string());
            false
        })
        .unwrap();
        fs.releasedir(&ctx(), ROOT, open.fh, 0).unwrap();

        for expected in [".", "..", "file", "sub"] {
            assert!(names.contains(&OsString::from(expected)), "missing {expected}");
        }
    }

    #[test]
    fn readdir_resumes_after_a_full_buffer() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a", "b", "c"] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        let fs = mount(dir.path());
        let open = fs.opendir(&ctx(), ROOT, libc::O_RDONLY).unwrap();

        // Accept exactly one entry per call, like a tiny reply buffer.
        let mut collected = Vec::new();
        let mut offset = 0;
        loop {
            let mut taken = false;
            let mut next_offset = offset;
            fs.readdir(&ctx(), ROOT, open.fh, offset, &mut |ent| {
                if taken {
                    return true;
                }
                taken = true;
                next_offset = ent.offset;
                collected.push(ent.name.to_os_string());
                false
            })
            .unwrap();
            if !taken {
                break;
            }
            offset = next_offset;
        }

        // 3 files plus the two dot entries, each seen exactly once.
        assert_eq!(collected.len(), 5);
    }

    #[test]
    fn readdirplus_forgets_entries_that_do_not_fit() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("only"), b"x").unwrap();
        let fs = mount(dir.path());
        let open = fs.opendir(&ctx(), ROOT, libc::O_RDONLY).unwrap();

        // Refuse every non-dot entry: each lookup must be undone.
        fs.readdirplus(&ctx(), ROOT, open.fh, 0, &mut |_, entry| entry.is_some())
            .unwrap();
        assert!(fs.inodes().is_empty());
    }

    #[test]
    fn readdirplus_counts_emitted_entries() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("kept"), b"x").unwrap();
        let fs = mount(dir.path());
        let open = fs.opendir(&ctx(), ROOT, libc::O_RDONLY).unwrap();

        let mut plus_entries = 0;
        fs.readdirplus(&ctx(), ROOT, open.fh, 0, &mut |_, entry| {
            if entry.is_some() {
                plus_entries += 1;
            }
            false
        })
        .unwrap();
        assert_eq!(plus_entries, 1);
        assert_eq!(fs.inodes().len(), 1);
    }

    #[test]
    fn setattr_truncates_and_chmods() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a"), b"0123456789").unwrap();
        let fs = mount(dir.path());
        let entry = fs.lookup(&ctx(), ROOT, OsStr::new("a")).unwrap();

        let changes = SetattrChanges {
            size: Some(4),
            mode: Some(0o600),
            ..Default::default()
        };
        let (attr, _) = fs.setattr(&ctx(), entry.ino, &changes).unwrap();
        assert_eq!(attr.size, 4);
        assert_eq!(attr.perm, 0o600);
        assert_eq!(std::fs::read(dir.path().join("a")).unwrap(), b"0123");
    }

    #[test]
    fn symlink_and_readlink_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let fs = mount(dir.path());

        let entry = fs
            .symlink(&ctx(), ROOT, OsStr::new("ln"), Path::new("target/path"))
            .unwrap();
        assert_eq!(entry.attr.kind, FileType::Symlink);
        let target = fs.readlink(&ctx(), entry.ino).unwrap();
        assert_eq!(target, b"target/path");
    }

    #[test]
    fn link_bumps_the_existing_lookup_count() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a"), b"x").unwrap();
        let fs = mount(dir.path());
        let entry = fs.lookup(&ctx(), ROOT, OsStr::new("a")).unwrap();

        let linked = fs.link(&ctx(), entry.ino, ROOT, OsStr::new("b")).unwrap();
        assert_eq!(linked.ino, entry.ino);
        assert_eq!(linked.attr.nlink, 2);
        assert_eq!(fs.inodes().get(entry.ino).unwrap().lookup_count(), 2);
    }

    #[test]
    fn unlink_and_rmdir_remove_nodes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f"), b"").unwrap();
        std::fs::create_dir(dir.path().join("d")).unwrap();
        let fs = mount(dir.path());

        fs.unlink(&ctx(), ROOT, OsStr::new("f")).unwrap();
        fs.rmdir(&ctx(), ROOT, OsStr::new("d")).unwrap();
        assert!(!dir.path().join("f").exists());
        assert!(!dir.path().join("d").exists());

        let err = fs.unlink(&ctx(), ROOT, OsStr::new("f")).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOENT));
    }

    #[test]
    fn mknod_creates_regular_files_and_fifos() {
        let dir = tempfile::tempdir().unwrap();
        let fs = mount(dir.path());

        let file = fs
            .mknod(&ctx(), ROOT, OsStr::new("reg"), libc::S_IFREG | 0o644, 0, 0)
            .unwrap();
        assert_eq!(file.attr.kind, FileType::RegularFile);

        let fifo = fs
            .mknod(&ctx(), ROOT, OsStr::new("pipe"), libc::S_IFIFO | 0o644, 0, 0)
            .unwrap();
        assert_eq!(fifo.attr.kind, FileType::NamedPipe);
    }

    #[test]
    fn statfs_reports_the_backing_filesystem() {
        let dir = tempfile::tempdir().unwrap();
        let fs = mount(dir.path());
        let st = fs.statfs(&ctx(), ROOT).unwrap();
        assert!(st.bsize > 0);
        assert!(st.namelen > 0);
    }

    #[test]
    fn xattr_requires_the_mount_option() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a"), b"x").unwrap();
        let fs = mount(dir.path());
        let entry = fs.lookup(&ctx(), ROOT, OsStr::new("a")).unwrap();

        let err = fs
            .getxattr(&ctx(), entry.ino, OsStr::new("user.k"), 0)
            .unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOSYS));
    }

    #[test]
    fn copy_file_range_copies_bytes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("src"), b"payload").unwrap();
        let fs = mount(dir.path());

        let src = fs.lookup(&ctx(), ROOT, OsStr::new("src")).unwrap();
        let src_open = fs.open(&ctx(), src.ino, libc::O_RDONLY).unwrap();
        let (dst, dst_open) = fs
            .create(&ctx(), ROOT, OsStr::new("dst"), 0o644, 0, libc::O_WRONLY)
            .unwrap();

        let copied = fs
            .copy_file_range(&ctx(), src.ino, src_open.fh, 0, dst.ino, dst_open.fh, 0, 7, 0)
            .unwrap();
        assert_eq!(copied, 7);
        fs.release(&ctx(), src.ino, src_open.fh, 0).unwrap();
        fs.release(&ctx(), dst.ino, dst_open.fh, 0).unwrap();
        assert_eq!(std::fs::read(dir.path().join("dst")).unwrap(), b"payload");
    }

    #[test]
    fn lseek_seeks_data() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a"), b"0123456789").unwrap();
        let fs = mount(dir.path());
        let entry = fs.lookup(&ctx(), ROOT, OsStr::new("a")).unwrap();
        let open = fs.open(&ctx(), entry.ino, libc::O_RDONLY).unwrap();

        let pos = fs
            .lseek(&ctx(), entry.ino, open.fh, 3, libc::SEEK_SET)
            .unwrap();
        assert_eq!(pos, 3);
        fs.release(&ctx(), entry.ino, open.fh, 0).unwrap();
    }

    #[test]
    fn destroy_closes_every_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a"), b"x").unwrap();
        let fs = mount(dir.path());
        fs.lookup(&ctx(), ROOT, OsStr::new("a")).unwrap();
        assert_eq!(fs.inodes().len(), 1);

        fs.destroy();
        assert!(fs.inodes().is_empty());
    }

    #[test]
    fn open_counts_follow_open_and_release() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a"), b"x").unwrap();
        let fs = mount(dir.path());
        let entry = fs.lookup(&ctx(), ROOT, OsStr::new("a")).unwrap();

        let open = fs.open(&ctx(), entry.ino, libc::O_RDONLY).unwrap();
        assert_eq!(fs.inodes().get(entry.ino).unwrap().open_count(), 1);
        fs.release(&ctx(), entry.ino, open.fh, 0).unwrap();
        assert_eq!(fs.inodes().get(entry.ino).unwrap().open_count(), 0);
    }
}
