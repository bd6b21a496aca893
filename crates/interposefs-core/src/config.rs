// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! JSON configuration controlling which interception layers are stacked
//! and how they behave. Loaded once at startup from an explicit path or
//! the `CONFIG` environment variable; a missing file means every layer
//! is off and the mount is a plain passthrough.

use std::io;
use std::path::{Path, PathBuf};

use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not read configuration file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("could not parse configuration file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Top-level layer selection. Unknown keys are ignored.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub traces: SectionToggle,
    #[serde(default)]
    pub metrics: SectionToggle,
    #[serde(default, rename = "faultyIO")]
    pub faulty_io: FaultyIoConfig,
    #[serde(default, rename = "throttleIO")]
    pub throttle_io: ThrottleIoConfig,
}

#[derive(Clone, Copy, Debug, Default, Deserialize)]
pub struct SectionToggle {
    #[serde(default)]
    pub enabled: bool,
}

/// `faultyIO` section. A fail rate of `n` means each die comes up once
/// in `n` checks; zero disables that class of faults entirely.
#[derive(Clone, Debug, Deserialize)]
pub struct FaultyIoConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub file_fail_rate: u32,
    #[serde(default)]
    pub directory_fail_rate: u32,
    /// Injected delay, in whole seconds.
    #[serde(default = "default_delay_time")]
    pub delay_time: u64,
    /// When set, the dice are seeded with `seed` for reproducible runs;
    /// otherwise the seed is time-derived at layer construction.
    #[serde(default)]
    pub use_seednum: bool,
    #[serde(default)]
    pub seed: u64,
    /// Fault log destination, resolved relative to the working directory
    /// when not absolute.
    #[serde(default = "default_log_path")]
    pub local_log_path: PathBuf,
}

fn default_delay_time() -> u64 {
    3
}

fn default_log_path() -> PathBuf {
    PathBuf::from("error_log.txt")
}

impl Default for FaultyIoConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            file_fail_rate: 0,
            directory_fail_rate: 0,
            delay_time: default_delay_time(),
            use_seednum: false,
            seed: 0,
            local_log_path: default_log_path(),
        }
    }
}

/// `throttleIO` section. Bucket capacity equals the per-second rate, so
/// a full bucket holds one second of traffic.
#[derive(Clone, Copy, Debug, Deserialize)]
pub struct ThrottleIoConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_bps")]
    pub read_bps: u64,
    #[serde(default = "default_bps")]
    pub write_bps: u64,
}

fn default_bps() -> u64 {
    1 << 20
}

impl Default for ThrottleIoConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            read_bps: default_bps(),
            write_bps: default_bps(),
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Resolves the configuration from an explicit path, then the
    /// `CONFIG` environment variable, then built-in defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }
        if let Ok(env_path) = std::env::var("CONFIG") {
            return Self::from_file(Path::new(&env_path));
        }
        Ok(Self::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_the_full_key_set() {
        let json = r#"{
            "traces": { "enabled": true },
            "metrics": { "enabled": false },
            "faultyIO": {
                "enabled": true,
                "file_fail_rate": 10,
                "directory_fail_rate": 20,
                "delay_time": 5,
                "use_seednum": true,
                "seed": 42,
                "local_log_path": "/tmp/faults.txt"
            },
            "throttleIO": {
                "enabled": true,
                "read_bps": 4096,
                "write_bps": 8192
            }
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert!(config.traces.enabled);
        assert!(!config.metrics.enabled);
        assert!(config.faulty_io.enabled);
        assert_eq!(config.faulty_io.file_fail_rate, 10);
        assert_eq!(config.faulty_io.directory_fail_rate, 20);
        assert_eq!(config.faulty_io.delay_time, 5);
        assert!(config.faulty_io.use_seednum);
        assert_eq!(config.faulty_io.seed, 42);
        assert_eq!(
            config.faulty_io.local_log_path,
            PathBuf::from("/tmp/faults.txt")
        );
        assert!(config.throttle_io.enabled);
        assert_eq!(config.throttle_io.read_bps, 4096);
        assert_eq!(config.throttle_io.write_bps, 8192);
    }

    #[test]
    fn missing_sections_fall_back_to_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert!(!config.traces.enabled);
        assert!(!config.faulty_io.enabled);
        assert_eq!(config.faulty_io.delay_time, 3);
        assert_eq!(config.faulty_io.file_fail_rate, 0);
        assert!(!config.throttle_io.enabled);
        assert_eq!(config.throttle_io.read_bps, 1 << 20);
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let config: Config =
            serde_json::from_str(r#"{ "unrelated": { "x": 1 }, "traces": { "enabled": true } }"#)
                .unwrap();
        assert!(config.traces.enabled);
    }

    #[test]
    fn invalid_json_is_a_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"{ not json").unwrap();
        file.flush().unwrap();
        let err = Config::from_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let err = Config::from_file(Path::new("/nonexistent/config.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
