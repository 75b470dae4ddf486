// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Runtime configuration of an [`crate::Overlay`].
//!
//! Configuration is read from TOML. Every field is optional and falls back
//! to the value of [`Config::default`].

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors when loading a [`Config`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config file failed")]
    Io(#[from] std::io::Error),
    #[error("parsing config failed")]
    Parse(#[from] toml::de::Error),
    #[error("branching factor must be positive")]
    ZeroBranching,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Branching factor of trees built by the overlay's own protocols.
    pub branching_factor: usize,
    /// How long a propagation instance waits for its first data message.
    pub initial_wait_ms: u64,
    /// Timeout used by callers that do not pick their own.
    pub default_timeout_ms: u64,
    /// Overrides the Byzantine default of `floor((n - 1) / 3)`.
    pub allowed_failures: Option<usize>,
    /// How long late messages for a retired instance are recognized and dropped.
    pub retired_ttl_ms: u64,
    /// How long envelopes wait for the announcement of their tree.
    pub pending_ttl_ms: u64,
    /// Maximum number of envelopes held back per unknown tree.
    pub max_pending_per_tree: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            branching_factor: 8,
            initial_wait_ms: 100_000,
            default_timeout_ms: 5_000,
            allowed_failures: None,
            retired_ttl_ms: 60_000,
            pending_ttl_ms: 30_000,
            max_pending_per_tree: 1024,
        }
    }
}

impl Config {
    /// Parses a configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] on malformed TOML and
    /// [`ConfigError::ZeroBranching`] if the branching factor is zero.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        if config.branching_factor == 0 {
            return Err(ConfigError::ZeroBranching);
        }
        Ok(config)
    }

    /// Reads and parses the configuration file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read, otherwise
    /// as [`Config::from_toml_str`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let s = std::fs::read_to_string(path)?;
        Self::from_toml_str(&s)
    }

    #[must_use]
    pub const fn initial_wait(&self) -> Duration {
        Duration::from_millis(self.initial_wait_ms)
    }

    #[must_use]
    pub const fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    #[must_use]
    pub const fn retired_ttl(&self) -> Duration {
        Duration::from_millis(self.retired_ttl_ms)
    }

    #[must_use]
    pub const fn pending_ttl(&self) -> Duration {
        Duration::from_millis(self.pending_ttl_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.branching_factor, 8);
        assert_eq!(config.initial_wait(), Duration::from_secs(100));
        assert_eq!(config.default_timeout(), Duration::from_secs(5));
        assert_eq!(config.allowed_failures, None);
        assert_eq!(config.retired_ttl(), Duration::from_secs(60));
        assert_eq!(config.pending_ttl(), Duration::from_secs(30));
        assert_eq!(config.max_pending_per_tree, 1024);
    }

    #[test]
    fn partial() {
        let config = Config::from_toml_str("branching_factor = 2\nallowed_failures = 1\n").unwrap();
        assert_eq!(config.branching_factor, 2);
        assert_eq!(config.allowed_failures, Some(1));
        assert_eq!(config.initial_wait_ms, 100_000);
    }

    #[test]
    fn invalid() {
        assert!(matches!(
            Config::from_toml_str("branching_factor = 0"),
            Err(ConfigError::ZeroBranching)
        ));
        assert!(matches!(
            Config::from_toml_str("branching_factor = \"many\""),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            Config::load("/nonexistent/arbor.toml"),
            Err(ConfigError::Io(_))
        ));
    }
}
