// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Binary-level checks that do not require a kernel mount: help output
//! and the exit-code contract for usage and configuration errors.

#![allow(clippy::disallowed_methods)]

#[cfg(target_os = "linux")]
mod linux_tests {
    use std::path::PathBuf;
    use std::process::Command;

    fn binary_path() -> Option<PathBuf> {
        let crate_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
        let workspace_root = crate_dir.parent().and_then(|p| p.parent())?.to_path_buf();
        let bin = workspace_root.join("target").join("debug").join("interposefs-fuse-host");
        bin.exists().then_some(bin)
    }

    #[test]
    fn help_exits_zero_without_mounting() {
        let Some(bin) = binary_path() else {
            eprintln!("Skipping: binary not built");
            return;
        };
        let status = Command::new(&bin).arg("--help").status().expect("able to run binary");
        assert!(status.success(), "--help should succeed");
    }

    #[test]
    fn missing_mountpoint_is_a_usage_error() {
        let Some(bin) = binary_path() else {
            eprintln!("Skipping: binary not built");
            return;
        };
        let status = Command::new(&bin).status().expect("able to run binary");
        assert_eq!(status.code(), Some(1));
    }

    #[test]
    fn unknown_mount_option_exits_one() {
        let Some(bin) = binary_path() else {
            eprintln!("Skipping: binary not built");
            return;
        };
        let mountpoint = tempfile::tempdir().unwrap();
        let status = Command::new(&bin)
            .arg(mountpoint.path())
            .args(["-o", "bogus_option"])
            .status()
            .expect("able to run binary");
        assert_eq!(status.code(), Some(1));
    }

    #[test]
    fn missing_source_exits_one() {
        let Some(bin) = binary_path() else {
            eprintln!("Skipping: binary not built");
            return;
        };
        let mountpoint = tempfile::tempdir().unwrap();
        let status = Command::new(&bin)
            .arg(mountpoint.path())
            .args(["-o", "source=/definitely/not/here"])
            .status()
            .expect("able to run binary");
        assert_eq!(status.code(), Some(1));
    }

    #[test]
    fn invalid_config_file_exits_one() {
        let Some(bin) = binary_path() else {
            eprintln!("Skipping: binary not built");
            return;
        };
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("config.json");
        std::fs::write(&config, "{ not json").unwrap();
        let mountpoint = tempfile::tempdir().unwrap();
        let status = Command::new(&bin)
            .arg(mountpoint.path())
            .args(["-o", &format!("source={}", dir.path().display())])
            .arg("--config")
            .arg(&config)
            .status()
            .expect("able to run binary");
        assert_eq!(status.code(), Some(1));
    }
}
