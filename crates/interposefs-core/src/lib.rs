// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! interposefs core — a composable stack of filesystem interception
//! layers over a passthrough to a host directory.
//!
//! The bottom [`passthrough::PassthroughFs`] maps every low-level
//! request onto the source tree through descriptor-relative syscalls and
//! an inode table of path-only descriptors. Interception layers
//! ([`layers::FaultLayer`], [`layers::ThrottleLayer`],
//! [`layers::MetricsLayer`], [`layers::TraceLayer`]) each wrap the layer
//! beneath them behind the shared [`ops::FilesystemOps`] trait; the
//! session adapter in the `interposefs-fuse-host` binary installs the
//! top of the stack into the kernel session.

pub mod config;
pub mod layers;
pub mod ops;
pub mod passthrough;
pub mod telemetry;
pub mod testing;

pub use config::{Config, ConfigError};
pub use layers::build_stack;
pub use ops::{Entry, FilesystemOps, OpenReply, RequestCtx, SetattrChanges, StatFs, XattrReply};
pub use passthrough::{CachePolicy, PassthroughFs, PassthroughOptions};
pub use telemetry::{LogTelemetry, NoopTelemetry, TelemetryProvider};
