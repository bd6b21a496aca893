// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Session adapter: implements `fuser::Filesystem` by packaging each
//! request (owned arguments, request context, one-shot reply) onto a
//! worker pool and converting the layer stack's typed results into
//! exactly one kernel reply.
//!
//! The pool exists so a request blocked in a throttle wait or an
//! injected delay does not stall the kernel channel reader; every
//! request is handled to completion on a single worker.

use std::ffi::OsStr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};

use crossbeam_queue::SegQueue;
use fuser::{
    KernelConfig, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyDirectoryPlus,
    ReplyEmpty, ReplyEntry, ReplyLock, ReplyLseek, ReplyOpen, ReplyStatfs, ReplyWrite,
    ReplyXattr, Request, TimeOrNow, fuse_forget_one,
};
use libc::c_int;
use tracing::{debug, info};

use interposefs_core::ops::{
    DirEntry, FilesystemOps, LockInfo, RequestCtx, SetattrChanges, XattrReply,
};

/// One packaged request, run on a worker against the top of the stack.
type Job = Box<dyn FnOnce(&dyn FilesystemOps) + Send>;

/// Bounded worker pool fed from a lock-free queue. Workers drain the
/// queue fully before honouring shutdown, so every accepted request is
/// answered.
struct Dispatcher {
    queue: Arc<SegQueue<Job>>,
    signal: Arc<(Mutex<bool>, Condvar)>,
    shutdown: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl Dispatcher {
    fn new(stack: Arc<dyn FilesystemOps>, worker_count: usize) -> Self {
        let queue = Arc::new(SegQueue::<Job>::new());
        let signal = Arc::new((Mutex::new(false), Condvar::new()));
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::with_capacity(worker_count);

        for _ in 0..worker_count {
            let queue = Arc::clone(&queue);
            let signal = Arc::clone(&signal);
            let shutdown = Arc::clone(&shutdown);
            let stack = Arc::clone(&stack);
            handles.push(thread::spawn(move || {
                loop {
                    match queue.pop() {
                        Some(job) => job(stack.as_ref()),
                        None => {
                            if shutdown.load(Ordering::Acquire) {
                                break;
                            }
                            let (lock, cvar) = &*signal;
                            let guard = lock.lock().unwrap();
                            let _ = cvar.wait_timeout(guard, Duration::from_millis(5)).unwrap();
                        }
                    }
                }
            }));
        }

        Self {
            queue,
            signal,
            shutdown,
            handles,
        }
    }

    fn submit(&self, job: Job) {
        self.queue.push(job);
        let (lock, cvar) = &*self.signal;
        if let Ok(mut pending) = lock.lock() {
            *pending = true;
            cvar.notify_one();
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        let (lock, cvar) = &*self.signal;
        if let Ok(mut pending) = lock.lock() {
            *pending = true;
            cvar.notify_all();
        }
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

pub struct InterposeFsAdapter {
    stack: Arc<dyn FilesystemOps>,
    dispatcher: Option<Dispatcher>,
}

impl InterposeFsAdapter {
    pub fn new(stack: Arc<dyn FilesystemOps>, worker_count: usize) -> Self {
        let worker_count = worker_count.max(1);
        info!(
            target: "interposefs::session",
            workers = worker_count,
            "request dispatcher started"
        );
        let dispatcher = Dispatcher::new(Arc::clone(&stack), worker_count);
        Self {
            stack,
            dispatcher: Some(dispatcher),
        }
    }

    fn dispatch(&self, job: Job) {
        match &self.dispatcher {
            Some(dispatcher) => dispatcher.submit(job),
            // After destroy only stray requests can arrive; answer them
            // inline rather than dropping the reply.
            None => job(self.stack.as_ref()),
        }
    }
}

fn ctx_of(req: &Request<'_>) -> RequestCtx {
    RequestCtx {
        unique: req.unique(),
        uid: req.uid(),
        gid: req.gid(),
        pid: req.pid(),
    }
}

fn errno_of(err: &std::io::Error) -> c_int {
    err.raw_os_error().unwrap_or(libc::EIO)
}

/// Attribute skeleton for `.` and `..` in readdirplus, which are emitted
/// from the raw dirent without a lookup and are never cached.
fn dot_attr(ino: u64, kind: fuser::FileType) -> fuser::FileAttr {
    fuser::FileAttr {
        ino,
        size: 0,
        blocks: 0,
        atime: SystemTime::UNIX_EPOCH,
        mtime: SystemTime::UNIX_EPOCH,
        ctime: SystemTime::UNIX_EPOCH,
        crtime: SystemTime::UNIX_EPOCH,
        kind,
        perm: 0,
        nlink: 1,
        uid: 0,
        gid: 0,
        rdev: 0,
        blksize: 512,
        flags: 0,
    }
}

impl fuser::Filesystem for InterposeFsAdapter {
    fn init(&mut self, _req: &Request<'_>, config: &mut KernelConfig) -> Result<(), c_int> {
        self.stack.init(config).map_err(|err| errno_of(&err))
    }

    fn destroy(&mut self) {
        // Joining the workers drains every queued request first.
        self.dispatcher.take();
        self.stack.destroy();
        debug!(target: "interposefs::session", "session destroyed");
    }

    fn lookup(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let ctx = ctx_of(req);
        let name = name.to_owned();
        self.dispatch(Box::new(move |fs| match fs.lookup(&ctx, parent, &name) {
            Ok(entry) => reply.entry(&entry.entry_ttl, &entry.attr, entry.generation),
            Err(err) => reply.error(errno_of(&err)),
        }));
    }

    fn forget(&mut self, req: &Request<'_>, ino: u64, nlookup: u64) {
        let ctx = ctx_of(req);
        self.dispatch(Box::new(move |fs| fs.forget(&ctx, ino, nlookup)));
    }

    fn batch_forget(&mut self, req: &Request<'_>, nodes: &[fuse_forget_one]) {
        let ctx = ctx_of(req);
        let nodes: Vec<(u64, u64)> = nodes.iter().map(|n| (n.nodeid, n.nlookup)).collect();
        self.dispatch(Box::new(move |fs| fs.batch_forget(&ctx, &nodes)));
    }

    fn getattr(&mut self, req: &Request<'_>, ino: u64, fh: Option<u64>, reply: ReplyAttr) {
        let ctx = ctx_of(req);
        self.dispatch(Box::new(move |fs| match fs.getattr(&ctx, ino, fh) {
            Ok((attr, ttl)) => reply.attr(&ttl, &attr),
            Err(err) => reply.error(errno_of(&err)),
        }));
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let ctx = ctx_of(req);
        let changes = SetattrChanges {
            mode,
            uid,
            gid,
            size,
            atime,
            mtime,
            fh,
        };
        self.dispatch(Box::new(move |fs| match fs.setattr(&ctx, ino, &changes) {
            Ok((attr, ttl)) => reply.attr(&ttl, &attr),
            Err(err) => reply.error(errno_of(&err)),
        }));
    }

    fn readlink(&mut self, req: &Request<'_>, ino: u64, reply: ReplyData) {
        let ctx = ctx_of(req);
        self.dispatch(Box::new(move |fs| match fs.readlink(&ctx, ino) {
            Ok(target) => reply.data(&target),
            Err(err) => reply.error(errno_of(&err)),
        }));
    }

    fn mknod(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        let ctx = ctx_of(req);
        let name = name.to_owned();
        self.dispatch(Box::new(move |fs| {
            match fs.mknod(&ctx, parent, &name, mode, umask, rdev) {
                Ok(entry) => reply.entry(&entry.entry_ttl, &entry.attr, entry.generation),
                Err(err) => reply.error(errno_of(&err)),
            }
        }));
    }

    fn mkdir(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        let ctx = ctx_of(req);
        let name = name.to_owned();
        self.dispatch(Box::new(move |fs| {
            match fs.mkdir(&ctx, parent, &name, mode, umask) {
                Ok(entry) => reply.entry(&entry.entry_ttl, &entry.attr, entry.generation),
                Err(err) => reply.error(errno_of(&err)),
            }
        }));
    }

    fn unlink(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let ctx = ctx_of(req);
        let name = name.to_owned();
        self.dispatch(Box::new(move |fs| match fs.unlink(&ctx, parent, &name) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(errno_of(&err)),
        }));
    }

    fn rmdir(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let ctx = ctx_of(req);
        let name = name.to_owned();
        self.dispatch(Box::new(move |fs| match fs.rmdir(&ctx, parent, &name) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(errno_of(&err)),
        }));
    }

    fn symlink(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let ctx = ctx_of(req);
        let link_name = link_name.to_owned();
        let target = target.to_path_buf();
        self.dispatch(Box::new(move |fs| {
            match fs.symlink(&ctx, parent, &link_name, &target) {
                Ok(entry) => reply.entry(&entry.entry_ttl, &entry.attr, entry.generation),
                Err(err) => reply.error(errno_of(&err)),
            }
        }));
    }

    #[allow(clippy::too_many_arguments)]
    fn rename(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        let ctx = ctx_of(req);
        let name = name.to_owned();
        let newname = newname.to_owned();
        self.dispatch(Box::new(move |fs| {
            match fs.rename(&ctx, parent, &name, newparent, &newname, flags) {
                Ok(()) => reply.ok(),
                Err(err) => reply.error(errno_of(&err)),
            }
        }));
    }

    fn link(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        let ctx = ctx_of(req);
        let newname = newname.to_owned();
        self.dispatch(Box::new(move |fs| {
            match fs.link(&ctx, ino, newparent, &newname) {
                Ok(entry) => reply.entry(&entry.entry_ttl, &entry.attr, entry.generation),
                Err(err) => reply.error(errno_of(&err)),
            }
        }));
    }

    fn open(&mut self, req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let ctx = ctx_of(req);
        self.dispatch(Box::new(move |fs| match fs.open(&ctx, ino, flags) {
            Ok(open) => reply.opened(open.fh, open.flags),
            Err(err) => reply.error(errno_of(&err)),
        }));
    }

    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let ctx = ctx_of(req);
        let name = name.to_owned();
        self.dispatch(Box::new(move |fs| {
            match fs.create(&ctx, parent, &name, mode, umask, flags) {
                Ok((entry, open)) => reply.created(
                    &entry.entry_ttl,
                    &entry.attr,
                    entry.generation,
                    open.fh,
                    open.flags,
                ),
                Err(err) => reply.error(errno_of(&err)),
            }
        }));
    }

    #[allow(clippy::too_many_arguments)]
    fn read(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let ctx = ctx_of(req);
        self.dispatch(Box::new(move |fs| {
            match fs.read(&ctx, ino, fh, offset, size) {
                Ok(data) => reply.data(&data),
                Err(err) => reply.error(errno_of(&err)),
            }
        }));
    }

    #[allow(clippy::too_many_arguments)]
    fn write(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let ctx = ctx_of(req);
        let data = data.to_vec();
        self.dispatch(Box::new(move |fs| {
            match fs.write(&ctx, ino, fh, offset, &data) {
                Ok(written) => reply.written(written),
                Err(err) => reply.error(errno_of(&err)),
            }
        }));
    }

    fn flush(&mut self, req: &Request<'_>, ino: u64, fh: u64, lock_owner: u64, reply: ReplyEmpty) {
        let ctx = ctx_of(req);
        self.dispatch(Box::new(move |fs| {
            match fs.flush(&ctx, ino, fh, lock_owner) {
                Ok(()) => reply.ok(),
                Err(err) => reply.error(errno_of(&err)),
            }
        }));
    }

    fn release(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        fh: u64,
        flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let ctx = ctx_of(req);
        self.dispatch(Box::new(move |fs| {
            match fs.release(&ctx, ino, fh, flags) {
                Ok(()) => reply.ok(),
                Err(err) => reply.error(errno_of(&err)),
            }
        }));
    }

    fn fsync(&mut self, req: &Request<'_>, ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        let ctx = ctx_of(req);
        self.dispatch(Box::new(move |fs| {
            match fs.fsync(&ctx, ino, fh, datasync) {
                Ok(()) => reply.ok(),
                Err(err) => reply.error(errno_of(&err)),
            }
        }));
    }

    fn opendir(&mut self, req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let ctx = ctx_of(req);
        self.dispatch(Box::new(move |fs| match fs.opendir(&ctx, ino, flags) {
            Ok(open) => reply.opened(open.fh, open.flags),
            Err(err) => reply.error(errno_of(&err)),
        }));
    }

    fn readdir(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        reply: ReplyDirectory,
    ) {
        let ctx = ctx_of(req);
        self.dispatch(Box::new(move |fs| {
            let mut reply = reply;
            let result = fs.readdir(&ctx, ino, fh, offset, &mut |ent: DirEntry<'_>| {
                reply.add(ent.ino, ent.offset, ent.kind, ent.name)
            });
            match result {
                Ok(()) => reply.ok(),
                Err(err) => reply.error(errno_of(&err)),
            }
        }));
    }

    fn readdirplus(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        reply: ReplyDirectoryPlus,
    ) {
        let ctx = ctx_of(req);
        self.dispatch(Box::new(move |fs| {
            let mut reply = reply;
            let result = fs.readdirplus(&ctx, ino, fh, offset, &mut |ent: DirEntry<'_>, entry| {
                match entry {
                    Some(entry) => reply.add(
                        entry.ino,
                        ent.offset,
                        ent.name,
                        &entry.attr_ttl,
                        &entry.attr,
                        entry.generation,
                    ),
                    None => reply.add(
                        ent.ino,
                        ent.offset,
                        ent.name,
                        &Duration::ZERO,
                        &dot_attr(ent.ino, ent.kind),
                        0,
                    ),
                }
            });
            match result {
                Ok(()) => reply.ok(),
                Err(err) => reply.error(errno_of(&err)),
            }
        }));
    }

    fn releasedir(&mut self, req: &Request<'_>, ino: u64, fh: u64, flags: i32, reply: ReplyEmpty) {
        let ctx = ctx_of(req);
        self.dispatch(Box::new(move |fs| {
            match fs.releasedir(&ctx, ino, fh, flags) {
                Ok(()) => reply.ok(),
                Err(err) => reply.error(errno_of(&err)),
            }
        }));
    }

    fn fsyncdir(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        fh: u64,
        datasync: bool,
        reply: ReplyEmpty,
    ) {
        let ctx = ctx_of(req);
        self.dispatch(Box::new(move |fs| {
            match fs.fsyncdir(&ctx, ino, fh, datasync) {
                Ok(()) => reply.ok(),
                Err(err) => reply.error(errno_of(&err)),
            }
        }));
    }

    fn statfs(&mut self, req: &Request<'_>, ino: u64, reply: ReplyStatfs) {
        let ctx = ctx_of(req);
        self.dispatch(Box::new(move |fs| match fs.statfs(&ctx, ino) {
            Ok(st) => reply.statfs(
                st.blocks, st.bfree, st.bavail, st.files, st.ffree, st.bsize, st.namelen,
                st.frsize,
            ),
            Err(err) => reply.error(errno_of(&err)),
        }));
    }

    fn setxattr(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        let ctx = ctx_of(req);
        let name = name.to_owned();
        let value = value.to_vec();
        self.dispatch(Box::new(move |fs| {
            match fs.setxattr(&ctx, ino, &name, &value, flags) {
                Ok(()) => reply.ok(),
                Err(err) => reply.error(errno_of(&err)),
            }
        }));
    }

    fn getxattr(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        size: u32,
        reply: ReplyXattr,
    ) {
        let ctx = ctx_of(req);
        let name = name.to_owned();
        self.dispatch(Box::new(move |fs| {
            match fs.getxattr(&ctx, ino, &name, size) {
                Ok(XattrReply::Size(len)) => reply.size(len),
                Ok(XattrReply::Data(data)) => reply.data(&data),
                Err(err) => reply.error(errno_of(&err)),
            }
        }));
    }

    fn listxattr(&mut self, req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        let ctx = ctx_of(req);
        self.dispatch(Box::new(move |fs| match fs.listxattr(&ctx, ino, size) {
            Ok(XattrReply::Size(len)) => reply.size(len),
            Ok(XattrReply::Data(data)) => reply.data(&data),
            Err(err) => reply.error(errno_of(&err)),
        }));
    }

    fn removexattr(&mut self, req: &Request<'_>, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        let ctx = ctx_of(req);
        let name = name.to_owned();
        self.dispatch(Box::new(move |fs| {
            match fs.removexattr(&ctx, ino, &name) {
                Ok(()) => reply.ok(),
                Err(err) => reply.error(errno_of(&err)),
            }
        }));
    }

    fn access(&mut self, req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        let ctx = ctx_of(req);
        self.dispatch(Box::new(move |fs| match fs.access(&ctx, ino, mask) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(errno_of(&err)),
        }));
    }

    #[allow(clippy::too_many_arguments)]
    fn getlk(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        fh: u64,
        lock_owner: u64,
        start: u64,
        end: u64,
        typ: i32,
        pid: u32,
        reply: ReplyLock,
    ) {
        let ctx = ctx_of(req);
        let lock = LockInfo {
            start,
            end,
            typ,
            pid,
        };
        self.dispatch(Box::new(move |fs| {
            match fs.getlk(&ctx, ino, fh, lock_owner, &lock) {
                Ok(found) => reply.locked(found.start, found.end, found.typ, found.pid),
                Err(err) => reply.error(errno_of(&err)),
            }
        }));
    }

    #[allow(clippy::too_many_arguments)]
    fn setlk(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        fh: u64,
        lock_owner: u64,
        start: u64,
        end: u64,
        typ: i32,
        pid: u32,
        sleep: bool,
        reply: ReplyEmpty,
    ) {
        let ctx = ctx_of(req);
        let lock = LockInfo {
            start,
            end,
            typ,
            pid,
        };
        self.dispatch(Box::new(move |fs| {
            match fs.setlk(&ctx, ino, fh, lock_owner, &lock, sleep) {
                Ok(()) => reply.ok(),
                Err(err) => reply.error(errno_of(&err)),
            }
        }));
    }

    fn fallocate(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        length: i64,
        mode: i32,
        reply: ReplyEmpty,
    ) {
        let ctx = ctx_of(req);
        self.dispatch(Box::new(move |fs| {
            match fs.fallocate(&ctx, ino, fh, offset, length, mode) {
                Ok(()) => reply.ok(),
                Err(err) => reply.error(errno_of(&err)),
            }
        }));
    }

    fn lseek(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        whence: i32,
        reply: ReplyLseek,
    ) {
        let ctx = ctx_of(req);
        self.dispatch(Box::new(move |fs| {
            match fs.lseek(&ctx, ino, fh, offset, whence) {
                Ok(pos) => reply.offset(pos),
                Err(err) => reply.error(errno_of(&err)),
            }
        }));
    }

    #[allow(clippy::too_many_arguments)]
    fn copy_file_range(
        &mut self,
        req: &Request<'_>,
        ino_in: u64,
        fh_in: u64,
        offset_in: i64,
        ino_out: u64,
        fh_out: u64,
        offset_out: i64,
        len: u64,
        flags: u32,
        reply: ReplyWrite,
    ) {
        let ctx = ctx_of(req);
        self.dispatch(Box::new(move |fs| {
            match fs.copy_file_range(
                &ctx, ino_in, fh_in, offset_in, ino_out, fh_out, offset_out, len, flags,
            ) {
                Ok(copied) => reply.written(copied),
                Err(err) => reply.error(errno_of(&err)),
            }
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_defaults_to_eio() {
        let plain = std::io::Error::new(std::io::ErrorKind::Other, "no errno");
        assert_eq!(errno_of(&plain), libc::EIO);
        let with_errno = std::io::Error::from_raw_os_error(libc::ENOENT);
        assert_eq!(errno_of(&with_errno), libc::ENOENT);
    }
}
