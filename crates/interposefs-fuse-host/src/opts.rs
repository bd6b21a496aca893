// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! `-o` mount-option parsing: the classic passthrough option set
//! (writeback, flock, xattr, timeout, cache regime, source directory).

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, bail};

use interposefs_core::passthrough::{CachePolicy, PassthroughOptions};

#[derive(Clone, Debug)]
pub struct MountOpts {
    pub writeback: bool,
    pub flock: bool,
    pub xattr: bool,
    pub cache: CachePolicy,
    pub timeout: Option<Duration>,
    pub source: PathBuf,
}

impl Default for MountOpts {
    fn default() -> Self {
        Self {
            writeback: false,
            flock: false,
            xattr: false,
            cache: CachePolicy::Auto,
            timeout: None,
            source: PathBuf::from("/"),
        }
    }
}

impl MountOpts {
    /// Parses a list of `-o` values, each possibly comma-separated.
    pub fn parse(options: &[String]) -> Result<Self> {
        let mut opts = Self::default();
        for group in options {
            for option in group.split(',').filter(|o| !o.is_empty()) {
                match option {
                    "writeback" => opts.writeback = true,
                    "no_writeback" => opts.writeback = false,
                    "flock" => opts.flock = true,
                    "no_flock" => opts.flock = false,
                    "xattr" => opts.xattr = true,
                    "no_xattr" => opts.xattr = false,
                    "cache=never" => opts.cache = CachePolicy::Never,
                    "cache=auto" => opts.cache = CachePolicy::Auto,
                    "cache=always" => opts.cache = CachePolicy::Always,
                    _ => {
                        if let Some(value) = option.strip_prefix("timeout=") {
                            let seconds: f64 = value
                                .parse()
                                .map_err(|_| anyhow::anyhow!("invalid timeout '{value}'"))?;
                            if seconds < 0.0 {
                                bail!("timeout is negative ({seconds})");
                            }
                            opts.timeout = Some(Duration::from_secs_f64(seconds));
                        } else if let Some(value) = option.strip_prefix("source=") {
                            opts.source = PathBuf::from(value);
                        } else {
                            bail!("unknown mount option '{option}'");
                        }
                    }
                }
            }
        }
        Ok(opts)
    }

    pub fn passthrough_options(&self) -> PassthroughOptions {
        PassthroughOptions {
            writeback: self.writeback,
            flock: self.flock,
            xattr: self.xattr,
            cache: self.cache,
            timeout: self.timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn defaults_match_a_bare_mount() {
        let opts = MountOpts::parse(&[]).unwrap();
        assert!(!opts.writeback);
        assert!(!opts.flock);
        assert!(!opts.xattr);
        assert_eq!(opts.cache, CachePolicy::Auto);
        assert_eq!(opts.timeout, None);
        assert_eq!(opts.source, PathBuf::from("/"));
    }

    #[test]
    fn comma_separated_groups_parse() {
        let opts =
            MountOpts::parse(&strings(&["writeback,xattr", "cache=always", "source=/srv/data"]))
                .unwrap();
        assert!(opts.writeback);
        assert!(opts.xattr);
        assert_eq!(opts.cache, CachePolicy::Always);
        assert_eq!(opts.source, PathBuf::from("/srv/data"));
    }

    #[test]
    fn negative_options_win_when_later() {
        let opts = MountOpts::parse(&strings(&["writeback", "no_writeback"])).unwrap();
        assert!(!opts.writeback);
    }

    #[test]
    fn timeout_parses_fractional_seconds() {
        let opts = MountOpts::parse(&strings(&["timeout=2.5"])).unwrap();
        assert_eq!(opts.timeout, Some(Duration::from_millis(2500)));
    }

    #[test]
    fn negative_timeout_is_rejected() {
        assert!(MountOpts::parse(&strings(&["timeout=-1"])).is_err());
    }

    #[test]
    fn unknown_options_are_rejected() {
        assert!(MountOpts::parse(&strings(&["ludicrous_speed"])).is_err());
    }
}
