// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Tracing layer: one span per covered operation, opened before the
//! request travels down the stack and ended after the result comes back,
//! so the span duration covers throttle waits and injected delays below
//! it.

use std::ffi::OsStr;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use fuser::FileAttr;

use crate::ops::{
    DirFill, DirPlusFill, Entry, FilesystemOps, OpenReply, RequestCtx, SetattrChanges,
};
use crate::telemetry::{AttrValue, Span, TelemetryProvider};

pub struct TraceLayer {
    next: Box<dyn FilesystemOps>,
    telemetry: Arc<dyn TelemetryProvider>,
}

impl TraceLayer {
    pub fn new(next: Box<dyn FilesystemOps>, telemetry: Arc<dyn TelemetryProvider>) -> Self {
        Self { next, telemetry }
    }

    fn span(&self, op: &str, ctx: &RequestCtx, ino: u64) -> Box<dyn Span> {
        let mut span = self.telemetry.start_span(op);
        span.set_attribute("inode_number", AttrValue::U64(ino));
        span.set_attribute("uid", AttrValue::U64(ctx.uid as u64));
        span.set_attribute("pid", AttrValue::U64(ctx.pid as u64));
        span
    }

    fn finish<T>(mut span: Box<dyn Span>, result: io::Result<T>) -> io::Result<T> {
        if let Err(err) = &result {
            span.set_attribute(
                "errno",
                AttrValue::I64(err.raw_os_error().unwrap_or(libc::EIO) as i64),
            );
        }
        span.end();
        result
    }
}

impl FilesystemOps for TraceLayer {
    fn next(&self) -> &dyn FilesystemOps {
        &*self.next
    }

    fn lookup(&self, ctx: &RequestCtx, parent: u64, name: &OsStr) -> io::Result<Entry> {
        let span = self.span("lookup", ctx, parent);
        Self::finish(span, self.next.lookup(ctx, parent, name))
    }

    fn getattr(
        &self,
        ctx: &RequestCtx,
        ino: u64,
        fh: Option<u64>,
    ) -> io::Result<(FileAttr, Duration)> {
        let span = self.span("getattr", ctx, ino);
        Self::finish(span, self.next.getattr(ctx, ino, fh))
    }

    fn setattr(
        &self,
        ctx: &RequestCtx,
        ino: u64,
        changes: &SetattrChanges,
    ) -> io::Result<(FileAttr, Duration)> {
        let span = self.span("setattr", ctx, ino);
        Self::finish(span, self.next.setattr(ctx, ino, changes))
    }

    fn mkdir(
        &self,
        ctx: &RequestCtx,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
    ) -> io::Result<Entry> {
        let span = self.span("mkdir", ctx, parent);
        Self::finish(span, self.next.mkdir(ctx, parent, name, mode, umask))
    }

    fn unlink(&self, ctx: &RequestCtx, parent: u64, name: &OsStr) -> io::Result<()> {
        let span = self.span("unlink", ctx, parent);
        Self::finish(span, self.next.unlink(ctx, parent, name))
    }

    fn rmdir(&self, ctx: &RequestCtx, parent: u64, name: &OsStr) -> io::Result<()> {
        let span = self.span("rmdir", ctx, parent);
        Self::finish(span, self.next.rmdir(ctx, parent, name))
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
        let span = self.span("rename", ctx, parent);
        Self::finish(
            span,
            self.next.rename(ctx, parent, name, newparent, newname, flags),
        )
    }

    fn open(&self, ctx: &RequestCtx, ino: u64, flags: i32) -> io::Result<OpenReply> {
        let span = self.span("open", ctx, ino);
        Self::finish(span, self.next.open(ctx, ino, flags))
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
        let span = self.span("create", ctx, parent);
        Self::finish(span, self.next.create(ctx, parent, name, mode, umask, flags))
    }

    fn read(
        &self,
        ctx: &RequestCtx,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
    ) -> io::Result<Vec<u8>> {
        let mut span = self.span("read", ctx, ino);
        span.set_attribute("offset", AttrValue::I64(offset));
        span.set_attribute("size", AttrValue::U64(size as u64));
        Self::finish(span, self.next.read(ctx, ino, fh, offset, size))
    }

    fn write(
        &self,
        ctx: &RequestCtx,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
    ) -> io::Result<u32> {
        let mut span = self.span("write", ctx, ino);
        span.set_attribute("offset", AttrValue::I64(offset));
        span.set_attribute("size", AttrValue::U64(data.len() as u64));
        Self::finish(span, self.next.write(ctx, ino, fh, offset, data))
    }

    fn flush(&self, ctx: &RequestCtx, ino: u64, fh: u64, lock_owner: u64) -> io::Result<()> {
        let span = self.span("flush", ctx, ino);
        Self::finish(span, self.next.flush(ctx, ino, fh, lock_owner))
    }

    fn release(&self, ctx: &RequestCtx, ino: u64, fh: u64, flags: i32) -> io::Result<()> {
        let span = self.span("release", ctx, ino);
        Self::finish(span, self.next.release(ctx, ino, fh, flags))
    }

    fn fsync(&self, ctx: &RequestCtx, ino: u64, fh: u64, datasync: bool) -> io::Result<()> {
        let span = self.span("fsync", ctx, ino);
        Self::finish(span, self.next.fsync(ctx, ino, fh, datasync))
    }

    fn opendir(&self, ctx: &RequestCtx, ino: u64, flags: i32) -> io::Result<OpenReply> {
        let span = self.span("opendir", ctx, ino);
        Self::finish(span, self.next.opendir(ctx, ino, flags))
    }

    fn readdir(
        &self,
        ctx: &RequestCtx,
        ino: u64,
        fh: u64,
        offset: i64,
        fill: &mut DirFill<'_>,
    ) -> io::Result<()> {
        let mut span = self.span("readdir", ctx, ino);
        span.set_attribute("offset", AttrValue::I64(offset));
        Self::finish(span, self.next.readdir(ctx, ino, fh, offset, fill))
    }

    fn readdirplus(
        &self,
        ctx: &RequestCtx,
        ino: u64,
        fh: u64,
        offset: i64,
        fill: &mut DirPlusFill<'_>,
    ) -> io::Result<()> {
        let mut span = self.span("readdirplus", ctx, ino);
        span.set_attribute("offset", AttrValue::I64(offset));
        Self::finish(span, self.next.readdirplus(ctx, ino, fh, offset, fill))
    }

    fn releasedir(&self, ctx: &RequestCtx, ino: u64, fh: u64, flags: i32) -> io::Result<()> {
        let span = self.span("releasedir", ctx, ino);
        Self::finish(span, self.next.releasedir(ctx, ino, fh, flags))
    }
}
