// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Metrics layer: per-operation call and error counters plus a latency
//! histogram, recorded after the result comes back up the stack.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use fuser::FileAttr;

use crate::ops::{
    DirFill, DirPlusFill, Entry, FilesystemOps, OpenReply, RequestCtx, SetattrChanges,
};
use crate::telemetry::{Counter, Histogram, TelemetryProvider};

const COVERED_OPS: &[&str] = &[
    "lookup",
    "getattr",
    "setattr",
    "mkdir",
    "unlink",
    "rmdir",
    "rename",
    "open",
    "create",
    "read",
    "write",
    "flush",
    "release",
    "fsync",
    "opendir",
    "readdir",
    "readdirplus",
];

struct OpInstruments {
    calls: Arc<dyn Counter>,
    errors: Arc<dyn Counter>,
    latency: Arc<dyn Histogram>,
}

pub struct MetricsLayer {
    next: Box<dyn FilesystemOps>,
    ops: HashMap<&'static str, OpInstruments>,
}

impl MetricsLayer {
    pub fn new(next: Box<dyn FilesystemOps>, telemetry: Arc<dyn TelemetryProvider>) -> Self {
        let ops = COVERED_OPS
            .iter()
            .map(|op| {
                (
                    *op,
                    OpInstruments {
                        calls: telemetry.counter(&format!("fs.{op}.calls")),
                        errors: telemetry.counter(&format!("fs.{op}.errors")),
                        latency: telemetry.histogram(&format!("fs.{op}.duration")),
                    },
                )
            })
            .collect();
        Self { next, ops }
    }

    fn observe<T>(&self, op: &str, run: impl FnOnce() -> io::Result<T>) -> io::Result<T> {
        let started = Instant::now();
        let result = run();
        if let Some(instruments) = self.ops.get(op) {
            instruments.calls.add(1);
            instruments.latency.record(started.elapsed().as_secs_f64());
            if result.is_err() {
                instruments.errors.add(1);
            }
        }
        result
    }
}

impl FilesystemOps for MetricsLayer {
    fn next(&self) -> &dyn FilesystemOps {
        &*self.next
    }

    fn lookup(&self, ctx: &RequestCtx, parent: u64, name: &OsStr) -> io::Result<Entry> {
        self.observe("lookup", || self.next.lookup(ctx, parent, name))
    }

    fn getattr(
        &self,
        ctx: &RequestCtx,
        ino: u64,
        fh: Option<u64>,
    ) -> io::Result<(FileAttr, Duration)> {
        self.observe("getattr", || self.next.getattr(ctx, ino, fh))
    }

    fn setattr(
        &self,
        ctx: &RequestCtx,
        ino: u64,
        changes: &SetattrChanges,
    ) -> io::Result<(FileAttr, Duration)> {
        self.observe("setattr", || self.next.setattr(ctx, ino, changes))
    }

    fn mkdir(
        &self,
        ctx: &RequestCtx,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
    ) -> io::Result<Entry> {
        self.observe("mkdir", || self.next.mkdir(ctx, parent, name, mode, umask))
    }

    fn unlink(&self, ctx: &RequestCtx, parent: u64, name: &OsStr) -> io::Result<()> {
        self.observe("unlink", || self.next.unlink(ctx, parent, name))
    }

    fn rmdir(&self, ctx: &RequestCtx, parent: u64, name: &OsStr) -> io::Result<()> {
        self.observe("rmdir", || self.next.rmdir(ctx, parent, name))
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
        self.observe("rename", || {
            self.next.rename(ctx, parent, name, newparent, newname, flags)
        })
    }

    fn open(&self, ctx: &RequestCtx, ino: u64, flags: i32) -> io::Result<OpenReply> {
        self.observe("open", || self.next.open(ctx, ino, flags))
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
        self.observe("create", || {
            self.next.create(ctx, parent, name, mode, umask, flags)
        })
    }

    fn read(
        &self,
        ctx: &RequestCtx,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
    ) -> io::Result<Vec<u8>> {
        self.observe("read", || self.next.read(ctx, ino, fh, offset, size))
    }

    fn write(
        &self,
        ctx: &RequestCtx,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
    ) -> io::Result<u32> {
        self.observe("write", || self.next.write(ctx, ino, fh, offset, data))
    }

    fn flush(&self, ctx: &RequestCtx, ino: u64, fh: u64, lock_owner: u64) -> io::Result<()> {
        self.observe("flush", || self.next.flush(ctx, ino, fh, lock_owner))
    }

    fn release(&self, ctx: &RequestCtx, ino: u64, fh: u64, flags: i32) -> io::Result<()> {
        self.observe("release", || self.next.release(ctx, ino, fh, flags))
    }

    fn fsync(&self, ctx: &RequestCtx, ino: u64, fh: u64, datasync: bool) -> io::Result<()> {
        self.observe("fsync", || self.next.fsync(ctx, ino, fh, datasync))
    }

    fn opendir(&self, ctx: &RequestCtx, ino: u64, flags: i32) -> io::Result<OpenReply> {
        self.observe("opendir", || self.next.opendir(ctx, ino, flags))
    }

    fn readdir(
        &self,
        ctx: &RequestCtx,
        ino: u64,
        fh: u64,
        offset: i64,
        fill: &mut DirFill<'_>,
    ) -> io::Result<()> {
        self.observe("readdir", || self.next.readdir(ctx, ino, fh, offset, fill))
    }

    fn readdirplus(
        &self,
        ctx: &RequestCtx,
        ino: u64,
        fh: u64,
        offset: i64,
        fill: &mut DirPlusFill<'_>,
    ) -> io::Result<()> {
        self.observe("readdirplus", || {
            self.next.readdirplus(ctx, ino, fh, offset, fill)
        })
    }
}
