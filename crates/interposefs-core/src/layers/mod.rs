// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Interception layers and the stack builder.
//!
//! The stack grows leaf-first: passthrough at the bottom, then fault
//! injection, throttling, metrics and tracing, each wrapping the one
//! below. Layers whose config section is disabled are left out entirely,
//! and nothing can be inserted or removed once the session is mounted.

pub mod fault;
pub mod metrics;
pub mod throttle;
pub mod trace;

use std::sync::Arc;

use tracing::info;

use crate::config::Config;
use crate::ops::FilesystemOps;
use crate::passthrough::PassthroughFs;
use crate::telemetry::TelemetryProvider;

pub use fault::FaultLayer;
pub use metrics::MetricsLayer;
pub use throttle::{Replenisher, ThrottleLayer, TokenBucket};
pub use trace::TraceLayer;

/// Builds the configured layer stack over the passthrough filesystem and
/// returns the top.
pub fn build_stack(
    passthrough: PassthroughFs,
    config: &Config,
    telemetry: Arc<dyn TelemetryProvider>,
) -> Box<dyn FilesystemOps> {
    let mut stack: Box<dyn FilesystemOps> = Box::new(passthrough);
    let mut layers = vec!["passthrough"];
    if config.faulty_io.enabled {
        stack = Box::new(FaultLayer::new(
            stack,
            &config.faulty_io,
            Arc::clone(&telemetry),
        ));
        layers.push("fault");
    }
    if config.throttle_io.enabled {
        stack = Box::new(ThrottleLayer::new(stack, &config.throttle_io));
        layers.push("throttle");
    }
    if config.metrics.enabled {
        stack = Box::new(MetricsLayer::new(stack, Arc::clone(&telemetry)));
        layers.push("metrics");
    }
    if config.traces.enabled {
        stack = Box::new(TraceLayer::new(stack, telemetry));
        layers.push("trace");
    }
    info!(target: "interposefs::session", stack = layers.join(" -> "), "layer stack assembled");
    stack
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FaultyIoConfig;
    use crate::ops::RequestCtx;
    use crate::passthrough::PassthroughOptions;
    use crate::telemetry::NoopTelemetry;
    use crate::testing::RecordingTelemetry;
    use std::ffi::OsStr;
    use std::os::fd::IntoRawFd;

    fn passthrough(dir: &std::path::Path) -> PassthroughFs {
        PassthroughFs::new(dir, PassthroughOptions::default()).unwrap()
    }

    #[test]
    fn all_layers_disabled_is_a_plain_passthrough() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f"), b"plain").unwrap();
        let stack = build_stack(
            passthrough(dir.path()),
            &Config::default(),
            Arc::new(NoopTelemetry),
        );

        let ctx = RequestCtx::internal();
        let entry = stack.lookup(&ctx, fuser::FUSE_ROOT_ID, OsStr::new("f")).unwrap();
        let open = stack.open(&ctx, entry.ino, libc::O_RDONLY).unwrap();
        assert_eq!(stack.read(&ctx, entry.ino, open.fh, 0, 5).unwrap(), b"plain");
        stack.release(&ctx, entry.ino, open.fh, 0).unwrap();
    }

    #[test]
    fn certain_fault_rate_turns_reads_into_io_errors() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f"), b"doomed").unwrap();
        let config = Config {
            faulty_io: FaultyIoConfig {
                enabled: true,
                file_fail_rate: 1,
                use_seednum: true,
                local_log_path: dir.path().join("error_log.txt"),
                ..Default::default()
            },
            ..Default::default()
        };
        let stack = build_stack(passthrough(dir.path()), &config, Arc::new(NoopTelemetry));

        let fh = std::fs::File::open(dir.path().join("f"))
            .unwrap()
            .into_raw_fd() as u64;
        let err = stack
            .read(&RequestCtx::internal(), 1, fh, 0, 6)
            .unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EIO));
    }

    #[test]
    fn trace_over_fault_sees_both_spans() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f"), b"unlucky").unwrap();
        let telemetry = RecordingTelemetry::new();
        let config = Config {
            traces: crate::config::SectionToggle { enabled: true },
            faulty_io: FaultyIoConfig {
                enabled: true,
                file_fail_rate: 1,
                use_seednum: true,
                local_log_path: dir.path().join("error_log.txt"),
                ..Default::default()
            },
            ..Default::default()
        };
        let stack = build_stack(
            passthrough(dir.path()),
            &config,
            Arc::new(telemetry.clone()),
        );

        let fh = std::fs::File::open(dir.path().join("f"))
            .unwrap()
            .into_raw_fd() as u64;
        stack
            .read(&RequestCtx::internal(), 1, fh, 0, 7)
            .unwrap_err();

        let spans = telemetry.spans();
        assert!(spans.iter().any(|s| s.name == "read"));
        assert!(spans.iter().any(|s| s.name == "faulty_read"));
        assert!(telemetry
            .events()
            .iter()
            .any(|e| e.name == "Abrupt Exit Simulated"));
    }

    #[test]
    fn trace_over_throttle_spans_cover_the_wait() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f"), vec![0u8; 64]).unwrap();
        let telemetry = RecordingTelemetry::new();

        let throttled: Box<dyn FilesystemOps> = Box::new(ThrottleLayer::with_interval(
            Box::new(passthrough(dir.path())),
            &crate::config::ThrottleIoConfig {
                enabled: true,
                read_bps: 64,
                write_bps: 64,
            },
            std::time::Duration::from_millis(10),
        ));
        let stack = TraceLayer::new(throttled, Arc::new(telemetry.clone()));

        let fh = std::fs::File::open(dir.path().join("f"))
            .unwrap()
            .into_raw_fd() as u64;
        let ctx = RequestCtx::internal();
        // Drain the bucket, then trace a read that has to wait.
        crate::ops::FilesystemOps::read(&stack, &ctx, 1, fh, 0, 64).unwrap();
        crate::ops::FilesystemOps::read(&stack, &ctx, 1, fh, 0, 64).unwrap();

        let spans = telemetry.spans();
        assert_eq!(spans.len(), 2);
        let waited = spans[1].ended.unwrap() - spans[1].started;
        assert!(waited >= std::time::Duration::from_millis(500), "waited {waited:?}");
        // No fault layer in the stack, so no fault events anywhere.
        assert!(telemetry.events().is_empty());
    }
}
