// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! interposefs FUSE host — mounts the layer stack over a source
//! directory.
//!
//! The stack is assembled once from the JSON configuration (path from
//! `--config` or the `CONFIG` environment variable), installed into a
//! `fuser` session, and served until signal or unmount. Exit code 0 on a
//! clean unmount, 1 on usage, configuration or mount failure.

mod adapter;
mod opts;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use clap::error::ErrorKind;
use tracing::{debug, info};

use adapter::InterposeFsAdapter;
use interposefs_core::telemetry::TelemetryProvider;
use interposefs_core::{Config, LogTelemetry, PassthroughFs, build_stack};
use opts::MountOpts;

#[derive(Parser)]
#[command(author, version, about = "Layered interposer filesystem over a source directory")]
struct Args {
    /// Mount point for the filesystem
    mountpoint: PathBuf,

    /// Mount options: writeback|no_writeback, flock|no_flock,
    /// xattr|no_xattr, timeout=<seconds>, cache={never|auto|always},
    /// source=<path>
    #[arg(short = 'o', value_name = "OPTIONS")]
    options: Vec<String>,

    /// Layer configuration file (JSON); falls back to $CONFIG
    #[arg(long)]
    config: Option<PathBuf>,

    /// Stay attached to the terminal
    #[arg(long)]
    foreground: bool,

    /// Verbose logging
    #[arg(long)]
    debug: bool,

    /// Handle requests on a single worker
    #[arg(long)]
    single_threaded: bool,

    /// Clone the kernel channel per worker (accepted for compatibility)
    #[arg(long)]
    clone_fd: bool,

    /// Worker threads handling requests
    #[arg(long, default_value_t = 4)]
    max_threads: usize,
}

fn main() -> Result<()> {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err)
            if matches!(
                err.kind(),
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion
            ) =>
        {
            let _ = err.print();
            return Ok(());
        }
        Err(err) => {
            let _ = err.print();
            std::process::exit(1);
        }
    };

    let default_level = if args.debug { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mount_opts = MountOpts::parse(&args.options)?;

    let source_meta = std::fs::metadata(&mount_opts.source)
        .with_context(|| format!("failed to stat source \"{}\"", mount_opts.source.display()))?;
    if !source_meta.is_dir() {
        bail!("source \"{}\" is not a directory", mount_opts.source.display());
    }

    let config = Config::load(args.config.as_deref())?;
    info!(
        source = %mount_opts.source.display(),
        mountpoint = %args.mountpoint.display(),
        traces = config.traces.enabled,
        metrics = config.metrics.enabled,
        faulty_io = config.faulty_io.enabled,
        throttle_io = config.throttle_io.enabled,
        "starting interposefs"
    );

    // Read once; the value is opaque here and handed to the telemetry
    // collaborator verbatim.
    let otlp_endpoint = std::env::var("OTLP_ENDPOINT").ok();
    let telemetry: Arc<dyn TelemetryProvider> = Arc::new(LogTelemetry::new(otlp_endpoint));

    let passthrough = PassthroughFs::new(&mount_opts.source, mount_opts.passthrough_options())
        .with_context(|| format!("failed to open source \"{}\"", mount_opts.source.display()))?;
    let stack = build_stack(passthrough, &config, telemetry);

    let workers = if args.single_threaded {
        1
    } else {
        args.max_threads.max(1)
    };
    if args.clone_fd {
        // A single session thread reads the kernel channel; concurrency
        // comes from the worker pool.
        debug!("clone_fd requested; ignored with a single channel reader");
    }
    if !args.foreground {
        info!("running attached; use a service manager to daemonize");
    }

    let filesystem = InterposeFsAdapter::new(Arc::from(stack), workers);
    let mount_options = vec![
        fuser::MountOption::FSName("interposefs".to_string()),
        fuser::MountOption::Subtype("interposefs".to_string()),
    ];

    info!("mounting filesystem");
    fuser::mount2(filesystem, &args.mountpoint, &mount_options)
        .with_context(|| format!("mount on \"{}\" failed", args.mountpoint.display()))?;
    info!("session ended cleanly");
    Ok(())
}
