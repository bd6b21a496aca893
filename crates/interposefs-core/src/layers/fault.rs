// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Fault-injection layer: randomised errors, delays and truncations on
//! selected operations, each emitted as a span event and appended to a
//! plain-text fault log. With every die disabled the layer is a
//! transparent passthrough.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::FileAttr;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tracing::warn;

use crate::config::FaultyIoConfig;
use crate::ops::{
    DirFill, DirPlusFill, FilesystemOps, OpenReply, RequestCtx, SetattrChanges,
};
use crate::telemetry::{AttrValue, Span, TelemetryProvider};

/// Shortened read length bounds. Preserved from the original fault
/// model; a policy knob, not a config key.
const TRUNCATED_READ_MIN: u32 = 5;
const TRUNCATED_READ_MAX: u32 = 14;

/// Maximum forward shift applied to a truncated read's offset.
const TRUNCATED_READ_SHIFT_MAX: i64 = 9;

/// Per-class odds: a die with rate `n` comes up once in `n` rolls, zero
/// never fires.
#[derive(Clone, Copy, Debug, Default)]
struct Dice {
    abrupt: u32,
    delay: u32,
    truncate: u32,
}

impl Dice {
    fn uniform(rate: u32) -> Self {
        Self {
            abrupt: rate,
            delay: rate,
            truncate: rate,
        }
    }
}

pub struct FaultLayer {
    next: Box<dyn FilesystemOps>,
    file: Dice,
    dir: Dice,
    delay: Duration,
    rng: Mutex<SmallRng>,
    log: FaultLog,
    telemetry: Arc<dyn TelemetryProvider>,
}

impl FaultLayer {
    pub fn new(
        next: Box<dyn FilesystemOps>,
        config: &FaultyIoConfig,
        telemetry: Arc<dyn TelemetryProvider>,
    ) -> Self {
        let seed = if config.use_seednum {
            config.seed
        } else {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or(0)
        };
        Self {
            next,
            file: Dice::uniform(config.file_fail_rate),
            dir: Dice::uniform(config.directory_fail_rate),
            delay: Duration::from_secs(config.delay_time),
            rng: Mutex::new(SmallRng::seed_from_u64(seed)),
            log: FaultLog::new(config.local_log_path.clone()),
            telemetry,
        }
    }

    fn roll(&self, rate: u32) -> bool {
        if rate == 0 {
            return false;
        }
        self.rng.lock().unwrap().gen_range(0..rate) == 0
    }

    fn draw_truncation(&self) -> (u32, i64) {
        let mut rng = self.rng.lock().unwrap();
        let size = rng.gen_range(TRUNCATED_READ_MIN..=TRUNCATED_READ_MAX);
        let shift = rng.gen_range(0..=TRUNCATED_READ_SHIFT_MAX);
        (size, shift)
    }

    fn span(&self, name: &str, operation: &str, ino: u64, offset: Option<i64>) -> Box<dyn Span> {
        let mut span = self.telemetry.start_span(name);
        span.set_attribute("operation", operation.into());
        span.set_attribute("inode_number", AttrValue::U64(ino));
        if let Some(offset) = offset {
            span.set_attribute("file_offset", AttrValue::I64(offset));
        }
        span
    }

    /// The abrupt-exit fault: one span with the exit event, a log line,
    /// and the synthesised error instead of forwarding.
    fn abrupt_exit(
        &self,
        span_name: &str,
        operation: &str,
        op: &str,
        ino: u64,
        offset: Option<i64>,
        errno: i32,
        errno_name: &str,
    ) -> io::Error {
        let mut span = self.span(span_name, operation, ino, offset);
        span.add_event(
            "Abrupt Exit Simulated",
            vec![
                ("timestamp".to_string(), timestamp().into()),
                ("error_type".to_string(), errno_name.into()),
            ],
        );
        span.end();
        self.log.append(op, "An unexpected failure occurred", ino);
        io::Error::from_raw_os_error(errno)
    }

    fn delay_event(&self, span: &mut dyn Span, event: &str, op: &str, ino: u64) {
        std::thread::sleep(self.delay);
        self.log.append(op, "An unexpected delay occurred", ino);
        span.add_event(
            event,
            vec![
                ("timestamp".to_string(), timestamp().into()),
                ("delay_seconds".to_string(), AttrValue::U64(self.delay.as_secs())),
            ],
        );
    }
}

impl FilesystemOps for FaultLayer {
    fn next(&self) -> &dyn FilesystemOps {
        &*self.next
    }

    fn getattr(
        &self,
        ctx: &RequestCtx,
        ino: u64,
        fh: Option<u64>,
    ) -> io::Result<(FileAttr, Duration)> {
        if self.roll(self.file.abrupt) {
            return Err(self.abrupt_exit(
                "faulty_getattr",
                "file.getattr",
                "getattr",
                ino,
                None,
                libc::EIO,
                "EIO",
            ));
        }
        if self.roll(self.file.delay) {
            let mut span = self.span("faulty_getattr", "file.getattr", ino, None);
            self.delay_event(&mut *span, "Delayed Getattr Simulated", "getattr", ino);
            span.end();
        }
        self.next.getattr(ctx, ino, fh)
    }

    fn setattr(
        &self,
        ctx: &RequestCtx,
        ino: u64,
        changes: &SetattrChanges,
    ) -> io::Result<(FileAttr, Duration)> {
        if self.roll(self.file.abrupt) {
            return Err(self.abrupt_exit(
                "faulty_setattr",
                "file.setattr",
                "setattr",
                ino,
                None,
                libc::EIO,
                "EIO",
            ));
        }
        if self.roll(self.file.delay) {
            let mut span = self.span("faulty_setattr", "file.setattr", ino, None);
            self.delay_event(&mut *span, "Delayed Setattr Simulated", "setattr", ino);
            span.end();
        }
        self.next.setattr(ctx, ino, changes)
    }

    fn open(&self, ctx: &RequestCtx, ino: u64, flags: i32) -> io::Result<OpenReply> {
        if self.roll(self.file.abrupt) {
            return Err(self.abrupt_exit(
                "faulty_open",
                "file.open",
                "open",
                ino,
                None,
                libc::ENOENT,
                "ENOENT",
            ));
        }
        if self.roll(self.file.delay) {
            let mut span = self.span("faulty_open", "file.open", ino, None);
            self.delay_event(&mut *span, "Delayed Open Simulated", "open", ino);
            span.end();
        }
        self.next.open(ctx, ino, flags)
    }

    fn read(
        &self,
        ctx: &RequestCtx,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
    ) -> io::Result<Vec<u8>> {
        if self.roll(self.file.abrupt) {
            return Err(self.abrupt_exit(
                "faulty_read",
                "file.read",
                "read",
                ino,
                Some(offset),
                libc::EIO,
                "EIO",
            ));
        }
        let mut span: Option<Box<dyn Span>> = None;
        if self.roll(self.file.delay) {
            let span = span
                .get_or_insert_with(|| self.span("faulty_read", "file.read", ino, Some(offset)));
            self.delay_event(&mut **span, "Delayed Read Simulated", "read", ino);
        }
        let (mut offset, mut size) = (offset, size);
        if self.roll(self.file.truncate) {
            let (short_size, shift) = self.draw_truncation();
            size = short_size.min(size);
            offset += shift;
            self.log.append("read", "Truncated read occurred", ino);
            let span = span
                .get_or_insert_with(|| self.span("faulty_read", "file.read", ino, Some(offset)));
            span.add_event(
                "Truncated Read Simulated",
                vec![
                    ("timestamp".to_string(), timestamp().into()),
                    ("size".to_string(), AttrValue::U64(size as u64)),
                ],
            );
        }
        if let Some(mut span) = span {
            span.end();
        }
        self.next.read(ctx, ino, fh, offset, size)
    }

    fn write(
        &self,
        ctx: &RequestCtx,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
    ) -> io::Result<u32> {
        if self.roll(self.file.abrupt) {
            return Err(self.abrupt_exit(
                "faulty_write",
                "file.write",
                "write",
                ino,
                Some(offset),
                libc::EIO,
                "EIO",
            ));
        }
        let mut span: Option<Box<dyn Span>> = None;
        if self.roll(self.file.delay) {
            let span = span
                .get_or_insert_with(|| self.span("faulty_write", "file.write", ino, Some(offset)));
            self.delay_event(&mut **span, "Delayed Write Simulated", "write", ino);
        }
        // The full buffer is written; only the reported count is cut.
        let mut written = self.next.write(ctx, ino, fh, offset, data)?;
        if self.roll(self.file.truncate) {
            written /= 2;
            self.log.append("write", "Truncated write occurred", ino);
            let span = span
                .get_or_insert_with(|| self.span("faulty_write", "file.write", ino, Some(offset)));
            span.add_event(
                "Truncated Write Simulated",
                vec![
                    ("timestamp".to_string(), timestamp().into()),
                    ("size".to_string(), AttrValue::U64(written as u64)),
                ],
            );
        }
        if let Some(mut span) = span {
            span.end();
        }
        Ok(written)
    }

    fn flush(&self, ctx: &RequestCtx, ino: u64, fh: u64, lock_owner: u64) -> io::Result<()> {
        if self.roll(self.file.abrupt) {
            return Err(self.abrupt_exit(
                "faulty_flush",
                "file.flush",
                "flush",
                ino,
                None,
                libc::ENOSPC,
                "ENOSPC",
            ));
        }
        if self.roll(self.file.delay) {
            let mut span = self.span("faulty_flush", "file.flush", ino, None);
            self.delay_event(&mut *span, "Delayed Flush Simulated", "flush", ino);
            span.end();
        }
        self.next.flush(ctx, ino, fh, lock_owner)
    }

    fn fsync(&self, ctx: &RequestCtx, ino: u64, fh: u64, datasync: bool) -> io::Result<()> {
        if self.roll(self.file.abrupt) {
            return Err(self.abrupt_exit(
                "faulty_fsync",
                "file.fsync",
                "fsync",
                ino,
                None,
                libc::EIO,
                "EIO",
            ));
        }
        if self.roll(self.file.delay) {
            let mut span = self.span("faulty_fsync", "file.fsync", ino, None);
            self.delay_event(&mut *span, "Delayed Fsync Simulated", "fsync", ino);
            span.end();
        }
        self.next.fsync(ctx, ino, fh, datasync)
    }

    fn opendir(&self, ctx: &RequestCtx, ino: u64, flags: i32) -> io::Result<OpenReply> {
        if self.roll(self.dir.abrupt) {
            return Err(self.abrupt_exit(
                "faulty_opendir",
                "directory.open",
                "opendir",
                ino,
                None,
                libc::ENOENT,
                "ENOENT",
            ));
        }
        if self.roll(self.dir.delay) {
            let mut span = self.span("faulty_opendir", "directory.open", ino, None);
            self.delay_event(&mut *span, "Delayed Opendir Simulated", "opendir", ino);
            span.end();
        }
        self.next.opendir(ctx, ino, flags)
    }

    fn readdir(
        &self,
        ctx: &RequestCtx,
        ino: u64,
        fh: u64,
        offset: i64,
        fill: &mut DirFill<'_>,
    ) -> io::Result<()> {
        if self.roll(self.dir.abrupt) {
            return Err(self.abrupt_exit(
                "faulty_readdir",
                "directory.read",
                "readdir",
                ino,
                Some(offset),
                libc::EIO,
                "EIO",
            ));
        }
        if self.roll(self.dir.delay) {
            let mut span = self.span("faulty_readdir", "directory.read", ino, Some(offset));
            self.delay_event(&mut *span, "Delayed Directory Read Simulated", "readdir", ino);
            span.end();
        }
        self.next.readdir(ctx, ino, fh, offset, fill)
    }

    fn readdirplus(
        &self,
        ctx: &RequestCtx,
        ino: u64,
        fh: u64,
        offset: i64,
        fill: &mut DirPlusFill<'_>,
    ) -> io::Result<()> {
        if self.roll(self.dir.abrupt) {
            return Err(self.abrupt_exit(
                "faulty_readdirplus",
                "directory.read",
                "readdirplus",
                ino,
                Some(offset),
                libc::EIO,
                "EIO",
            ));
        }
        if self.roll(self.dir.delay) {
            let mut span = self.span("faulty_readdirplus", "directory.read", ino, Some(offset));
            self.delay_event(
                &mut *span,
                "Delayed Directory Read Simulated",
                "readdirplus",
                ino,
            );
            span.end();
        }
        self.next.readdirplus(ctx, ino, fh, offset, fill)
    }
}

fn timestamp() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Append-only plain-text fault log. Strictly best-effort: failures to
/// open or write never fail the enclosing request.
struct FaultLog {
    path: PathBuf,
}

impl FaultLog {
    fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn append(&self, op: &str, message: &str, ino: u64) {
        let line = format!(
            "[{}] ERROR: {op}: {message}. Inode Number: {ino}\n",
            timestamp()
        );
        match OpenOptions::new().create(true).append(true).open(&self.path) {
            Ok(mut file) => {
                if let Err(err) = file.write_all(line.as_bytes()) {
                    warn!(
                        target: "interposefs::fault",
                        path = %self.path.display(),
                        %err,
                        "fault log write failed"
                    );
                }
            }
            Err(err) => warn!(
                target: "interposefs::fault",
                path = %self.path.display(),
                %err,
                "fault log open failed"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::passthrough::{PassthroughFs, PassthroughOptions};
    use crate::testing::RecordingTelemetry;
    use std::os::fd::IntoRawFd;
    use std::time::Instant;

    fn passthrough(dir: &std::path::Path) -> Box<dyn FilesystemOps> {
        Box::new(PassthroughFs::new(dir, PassthroughOptions::default()).unwrap())
    }

    fn layer_with_dice(
        dir: &std::path::Path,
        file: Dice,
        dir_dice: Dice,
        log: PathBuf,
        telemetry: &RecordingTelemetry,
    ) -> FaultLayer {
        FaultLayer {
            next: passthrough(dir),
            file,
            dir: dir_dice,
            delay: Duration::from_millis(30),
            rng: Mutex::new(SmallRng::seed_from_u64(7)),
            log: FaultLog::new(log),
            telemetry: Arc::new(telemetry.clone()),
        }
    }

    fn open_raw(path: &std::path::Path) -> u64 {
        std::fs::File::open(path).unwrap().into_raw_fd() as u64
    }

    fn ctx() -> RequestCtx {
        RequestCtx::internal()
    }

    #[test]
    fn abrupt_read_fails_with_eio_and_logs_one_line() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f"), vec![1u8; 100]).unwrap();
        let log = dir.path().join("error_log.txt");
        let telemetry = RecordingTelemetry::new();
        let layer = layer_with_dice(
            dir.path(),
            Dice {
                abrupt: 1,
                delay: 0,
                truncate: 0,
            },
            Dice::default(),
            log.clone(),
            &telemetry,
        );

        let fh = open_raw(&dir.path().join("f"));
        let err = layer.read(&ctx(), 42, fh, 0, 100).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EIO));

        let contents = std::fs::read_to_string(&log).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("ERROR: read: An unexpected failure occurred"));
        assert!(lines[0].contains("Inode Number: 42"));

        let events = telemetry.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name, "Abrupt Exit Simulated");
    }

    #[test]
    fn truncated_read_shortens_and_shifts() {
        let dir = tempfile::tempdir().unwrap();
        let bytes: Vec<u8> = (0..100u8).collect();
        std::fs::write(dir.path().join("f"), &bytes).unwrap();
        let telemetry = RecordingTelemetry::new();
        let layer = layer_with_dice(
            dir.path(),
            Dice {
                abrupt: 0,
                delay: 0,
                truncate: 1,
            },
            Dice::default(),
            dir.path().join("error_log.txt"),
            &telemetry,
        );

        let fh = open_raw(&dir.path().join("f"));
        let data = layer.read(&ctx(), 1, fh, 0, 100).unwrap();
        assert!((5..=14).contains(&data.len()), "len {}", data.len());
        // The backing bytes equal their offsets, so the first byte
        // reveals the shifted start.
        assert!(data[0] <= 9, "shift {}", data[0]);
        for (i, b) in data.iter().enumerate() {
            assert_eq!(*b, data[0] + i as u8);
        }
        assert!(telemetry
            .events()
            .iter()
            .any(|e| e.name == "Truncated Read Simulated"));
    }

    #[test]
    fn truncated_write_halves_the_count_but_writes_everything() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f"), b"").unwrap();
        let telemetry = RecordingTelemetry::new();
        let layer = layer_with_dice(
            dir.path(),
            Dice {
                abrupt: 0,
                delay: 0,
                truncate: 1,
            },
            Dice::default(),
            dir.path().join("error_log.txt"),
            &telemetry,
        );

        let fh = std::fs::OpenOptions::new()
            .write(true)
            .open(dir.path().join("f"))
            .unwrap()
            .into_raw_fd() as u64;
        let written = layer.write(&ctx(), 1, fh, 0, b"0123456789").unwrap();
        assert_eq!(written, 5);
        assert_eq!(std::fs::read(dir.path().join("f")).unwrap(), b"0123456789");
    }

    #[test]
    fn delay_sleeps_and_emits_the_event() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f"), vec![0u8; 16]).unwrap();
        let telemetry = RecordingTelemetry::new();
        let layer = layer_with_dice(
            dir.path(),
            Dice {
                abrupt: 0,
                delay: 1,
                truncate: 0,
            },
            Dice::default(),
            dir.path().join("error_log.txt"),
            &telemetry,
        );

        let fh = open_raw(&dir.path().join("f"));
        let started = Instant::now();
        let data = layer.read(&ctx(), 1, fh, 0, 16).unwrap();
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert_eq!(data.len(), 16);
        assert!(telemetry
            .events()
            .iter()
            .any(|e| e.name == "Delayed Read Simulated"));
    }

    #[test]
    fn flush_fault_reports_no_space() {
        let dir = tempfile::tempdir().unwrap();
        let telemetry = RecordingTelemetry::new();
        let layer = layer_with_dice(
            dir.path(),
            Dice {
                abrupt: 1,
                delay: 0,
                truncate: 0,
            },
            Dice::default(),
            dir.path().join("error_log.txt"),
            &telemetry,
        );

        let err = layer.flush(&ctx(), 9, 0, 0).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOSPC));
    }

    #[test]
    fn opendir_fault_reports_no_entry() {
        let dir = tempfile::tempdir().unwrap();
        let telemetry = RecordingTelemetry::new();
        let layer = layer_with_dice(
            dir.path(),
            Dice::default(),
            Dice {
                abrupt: 1,
                delay: 0,
                truncate: 0,
            },
            dir.path().join("error_log.txt"),
            &telemetry,
        );

        let err = layer
            .opendir(&ctx(), fuser::FUSE_ROOT_ID, libc::O_RDONLY)
            .unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOENT));
    }

    #[test]
    fn zero_rates_leave_operations_untouched() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f"), b"stable").unwrap();
        let telemetry = RecordingTelemetry::new();
        let layer = layer_with_dice(
            dir.path(),
            Dice::default(),
            Dice::default(),
            dir.path().join("error_log.txt"),
            &telemetry,
        );

        let fh = open_raw(&dir.path().join("f"));
        for _ in 0..50 {
            assert_eq!(layer.read(&ctx(), 1, fh, 0, 6).unwrap(), b"stable");
        }
        assert!(telemetry.events().is_empty());
        assert!(!dir.path().join("error_log.txt").exists());
    }

    #[test]
    fn fixed_seeds_reproduce_the_fault_sequence() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f"), vec![0u8; 32]).unwrap();

        let run = |seed: u64| -> Vec<bool> {
            let telemetry = RecordingTelemetry::new();
            let layer = FaultLayer {
                next: passthrough(dir.path()),
                file: Dice {
                    abrupt: 3,
                    delay: 0,
                    truncate: 0,
                },
                dir: Dice::default(),
                delay: Duration::ZERO,
                rng: Mutex::new(SmallRng::seed_from_u64(seed)),
                log: FaultLog::new(dir.path().join("error_log.txt")),
                telemetry: Arc::new(telemetry),
            };
            let fh = open_raw(&dir.path().join("f"));
            (0..40)
                .map(|_| layer.read(&ctx(), 1, fh, 0, 8).is_err())
                .collect()
        };

        assert_eq!(run(99), run(99));
    }

    #[test]
    fn unwritable_log_path_does_not_fail_the_request() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f"), vec![0u8; 8]).unwrap();
        let telemetry = RecordingTelemetry::new();
        let layer = layer_with_dice(
            dir.path(),
            Dice {
                abrupt: 1,
                delay: 0,
                truncate: 0,
            },
            Dice::default(),
            PathBuf::from("/nonexistent/dir/error_log.txt"),
            &telemetry,
        );

        let fh = open_raw(&dir.path().join("f"));
        // The injected error still comes back cleanly.
        let err = layer.read(&ctx(), 1, fh, 0, 8).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EIO));
    }
}
