// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Throttling layer: token buckets bounding read and write throughput.
//!
//! A dedicated replenisher thread ticks every interval and tops up every
//! registered bucket, waking all waiters. Consumers loop on an atomic
//! compare-and-swap and block on the bucket's condition variable until
//! enough tokens are available. All waiters wake on each tick; strict
//! FIFO between them is not guaranteed, and a steady stream of small
//! requests can starve a very large one.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::debug;

use crate::config::ThrottleIoConfig;
use crate::ops::{FilesystemOps, RequestCtx};

/// Replenishment tick.
const REPLENISH_INTERVAL: Duration = Duration::from_millis(100);

/// Capacity-bounded token counter with a fixed fill rate, in bytes.
pub struct TokenBucket {
    capacity: u64,
    fill_rate: u64,
    tokens: AtomicU64,
    lock: Mutex<()>,
    cv: Condvar,
}

impl TokenBucket {
    /// A bucket starts full.
    pub fn new(capacity: u64, fill_rate: u64) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            fill_rate,
            tokens: AtomicU64::new(capacity),
            lock: Mutex::new(()),
            cv: Condvar::new(),
        })
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn fill_rate(&self) -> u64 {
        self.fill_rate
    }

    pub fn available(&self) -> u64 {
        self.tokens.load(Ordering::Acquire)
    }

    /// Blocks until `n` tokens have been taken. Requests larger than the
    /// bucket capacity drain the bucket in full-capacity instalments
    /// across replenishments; the enclosing I/O is never split.
    pub fn consume(&self, n: u64) {
        let mut remaining = n;
        while remaining > 0 {
            let want = remaining.min(self.capacity);
            self.consume_within_capacity(want);
            remaining -= want;
        }
    }

    fn consume_within_capacity(&self, n: u64) {
        let mut guard = self.lock.lock().unwrap();
        loop {
            let current = self.tokens.load(Ordering::Acquire);
            if current >= n {
                if self
                    .tokens
                    .compare_exchange(current, current - n, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return;
                }
                continue;
            }
            guard = self.cv.wait(guard).unwrap();
        }
    }

    /// Adds tokens, clamped to capacity, and wakes every waiter. Safe to
    /// run concurrently with consumers.
    pub fn replenish(&self, amount: u64) {
        let _guard = self.lock.lock().unwrap();
        loop {
            let current = self.tokens.load(Ordering::Acquire);
            let refilled = current.saturating_add(amount).min(self.capacity);
            if self
                .tokens
                .compare_exchange(current, refilled, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }
        self.cv.notify_all();
    }
}

/// Periodic refill task for a set of buckets. The thread is joined when
/// the handle drops.
pub struct Replenisher {
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Replenisher {
    pub fn spawn(buckets: Vec<Arc<TokenBucket>>, interval: Duration) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let stop = Arc::clone(&shutdown);
        let handle = thread::spawn(move || {
            // Sub-token residue per bucket, in rate-milliseconds, so low
            // fill rates still make progress at fine intervals.
            let mut residue = vec![0u128; buckets.len()];
            let interval_ms = interval.as_millis().max(1);
            while !stop.load(Ordering::Acquire) {
                thread::sleep(interval);
                for (bucket, carry) in buckets.iter().zip(residue.iter_mut()) {
                    *carry += bucket.fill_rate() as u128 * interval_ms;
                    let amount = (*carry / 1000) as u64;
                    *carry %= 1000;
                    if amount > 0 {
                        bucket.replenish(amount);
                    }
                }
            }
        });
        Self {
            shutdown,
            handle: Some(handle),
        }
    }
}

impl Drop for Replenisher {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

pub struct ThrottleLayer {
    next: Box<dyn FilesystemOps>,
    read_bucket: Arc<TokenBucket>,
    write_bucket: Arc<TokenBucket>,
    _replenisher: Replenisher,
}

impl ThrottleLayer {
    pub fn new(next: Box<dyn FilesystemOps>, config: &ThrottleIoConfig) -> Self {
        Self::with_interval(next, config, REPLENISH_INTERVAL)
    }

    pub fn with_interval(
        next: Box<dyn FilesystemOps>,
        config: &ThrottleIoConfig,
        interval: Duration,
    ) -> Self {
        // Capacity equals one second of traffic at the configured rate.
        let read_bucket = TokenBucket::new(config.read_bps, config.read_bps);
        let write_bucket = TokenBucket::new(config.write_bps, config.write_bps);
        debug!(
            target: "interposefs::throttle",
            read_bps = config.read_bps,
            write_bps = config.write_bps,
            interval_ms = interval.as_millis() as u64,
            "throttle layer active"
        );
        let replenisher = Replenisher::spawn(
            vec![Arc::clone(&read_bucket), Arc::clone(&write_bucket)],
            interval,
        );
        Self {
            next,
            read_bucket,
            write_bucket,
            _replenisher: replenisher,
        }
    }
}

impl FilesystemOps for ThrottleLayer {
    fn next(&self) -> &dyn FilesystemOps {
        &*self.next
    }

    fn read(
        &self,
        ctx: &RequestCtx,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
    ) -> io::Result<Vec<u8>> {
        self.read_bucket.consume(size as u64);
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
        self.write_bucket.consume(data.len() as u64);
        self.next.write(ctx, ino, fh, offset, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::passthrough::{PassthroughFs, PassthroughOptions};
    use std::os::fd::IntoRawFd;
    use std::time::Instant;

    #[test]
    fn bucket_starts_full_and_consume_decrements() {
        let bucket = TokenBucket::new(100, 10);
        assert_eq!(bucket.available(), 100);
        bucket.consume(30);
        assert_eq!(bucket.available(), 70);
    }

    #[test]
    fn replenish_never_exceeds_capacity() {
        let bucket = TokenBucket::new(50, 10);
        bucket.consume(20);
        bucket.replenish(1000);
        assert_eq!(bucket.available(), bucket.capacity());
    }

    #[test]
    fn consume_blocks_until_tokens_arrive() {
        let bucket = TokenBucket::new(10, 0);
        bucket.consume(10);

        let feeder = Arc::clone(&bucket);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            feeder.replenish(10);
        });

        let started = Instant::now();
        bucket.consume(5);
        assert!(started.elapsed() >= Duration::from_millis(40));
        handle.join().unwrap();
    }

    #[test]
    fn oversized_requests_complete_across_replenishments() {
        let bucket = TokenBucket::new(4, 0);
        let feeder = Arc::clone(&bucket);
        let handle = thread::spawn(move || {
            for _ in 0..5 {
                thread::sleep(Duration::from_millis(10));
                feeder.replenish(4);
            }
        });

        // Needs three full drains of a 4-token bucket.
        bucket.consume(12);
        handle.join().unwrap();
        assert!(bucket.available() <= bucket.capacity());
    }

    #[test]
    fn replenisher_refills_on_its_own() {
        let bucket = TokenBucket::new(1000, 1000);
        bucket.consume(1000);
        assert_eq!(bucket.available(), 0);

        let _replenisher = Replenisher::spawn(vec![Arc::clone(&bucket)], Duration::from_millis(10));
        let started = Instant::now();
        bucket.consume(100);
        // 100 tokens at 1000/s is about 100ms of refill.
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn sustained_reads_converge_to_the_fill_rate() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("big"), vec![7u8; 4096]).unwrap();
        let next: Box<dyn FilesystemOps> =
            Box::new(PassthroughFs::new(dir.path(), PassthroughOptions::default()).unwrap());
        let layer = ThrottleLayer::with_interval(
            next,
            &ThrottleIoConfig {
                enabled: true,
                read_bps: 1024,
                write_bps: 1024,
            },
            Duration::from_millis(10),
        );

        let fh = std::fs::File::open(dir.path().join("big"))
            .unwrap()
            .into_raw_fd() as u64;
        let ctx = RequestCtx::internal();

        let started = Instant::now();
        for _ in 0..4 {
            let data = layer.read(&ctx, 1, fh, 0, 1024).unwrap();
            assert_eq!(data.len(), 1024);
        }
        // First read drains the initial capacity; the remaining three
        // each wait for roughly a second of refill.
        assert!(
            started.elapsed() >= Duration::from_millis(2500),
            "elapsed {:?}",
            started.elapsed()
        );
    }

    #[test]
    fn writes_pass_through_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f"), b"").unwrap();
        let next: Box<dyn FilesystemOps> =
            Box::new(PassthroughFs::new(dir.path(), PassthroughOptions::default()).unwrap());
        let layer = ThrottleLayer::with_interval(
            next,
            &ThrottleIoConfig {
                enabled: true,
                read_bps: 1 << 20,
                write_bps: 1 << 20,
            },
            Duration::from_millis(10),
        );

        let fh = std::fs::OpenOptions::new()
            .write(true)
            .open(dir.path().join("f"))
            .unwrap()
            .into_raw_fd() as u64;
        let written = layer
            .write(&RequestCtx::internal(), 1, fh, 0, b"throttled")
            .unwrap();
        assert_eq!(written, 9);
        assert_eq!(std::fs::read(dir.path().join("f")).unwrap(), b"throttled");
    }
}
