// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: TOML configuration for the RPC subsystem
//! OWNERS: @runtime
//!
//! Every field is optional; missing fields take the platform defaults.
//!
//! ```toml
//! timeout_ms = 2000          # 0 waits forever
//! poll_interval_us = 1000
//! channels = 16
//! remote_processor = "display-m3"
//! line_id = 0
//! command_event = 12
//! reply_event = 13
//! priority = "normal"        # or "urgent"
//! # shm_base = 0xA0000000
//! # shm_size = 0x200000
//! ```

use core::time::Duration;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::transport::{LineId, Priority};
use crate::wait::RpcTimeout;

/// Upper bound on the channel pool.
pub const MAX_CHANNELS: usize = 64;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to access {path}: {source}")]
    Io {
        /// File that was read.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The configuration is not valid TOML for [`RprocConfig`].
    #[error("failed to parse rproc config {path}: {source}")]
    Parse {
        /// File that was parsed, `<inline>` for strings.
        path: PathBuf,
        /// Error returned by the TOML deserializer.
        source: toml::de::Error,
    },
    /// A field is out of range.
    #[error("invalid rproc config: {0}")]
    Invalid(String),
}

/// Subsystem configuration.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RprocConfig {
    /// Per-request timeout in milliseconds; `0` waits forever.
    pub timeout_ms: u64,
    /// Upper bound on a single doorbell wait, in microseconds.
    pub poll_interval_us: u64,
    /// Physical base of the shared region; platform default when unset.
    pub shm_base: Option<u32>,
    /// Size of the shared region in bytes; platform default when unset.
    pub shm_size: Option<usize>,
    /// Number of pooled channels.
    pub channels: usize,
    /// Name of the remote processor, resolved at start.
    pub remote_processor: String,
    /// Notification line.
    pub line_id: LineId,
    /// Event used to post command envelopes.
    pub command_event: u32,
    /// Event on which the remote signals completions.
    pub reply_event: u32,
    /// Send priority for command events.
    pub priority: Priority,
}

impl Default for RprocConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 2000,
            poll_interval_us: 1000,
            shm_base: None,
            shm_size: None,
            channels: 16,
            remote_processor: "display-m3".to_string(),
            line_id: 0,
            command_event: 12,
            reply_event: 13,
            priority: Priority::Normal,
        }
    }
}

impl RprocConfig {
    /// Parses and validates a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Self::parse(text, Path::new("<inline>"))
    }

    /// Reads, parses and validates the file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
        Self::parse(&text, path)
    }

    fn parse(text: &str, path: &Path) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)
            .map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })?;
        config.validate()?;
        Ok(config)
    }

    /// Checks ranges that deserialization cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.channels == 0 || self.channels > MAX_CHANNELS {
            return Err(ConfigError::Invalid(format!(
                "channels must be within 1..={MAX_CHANNELS}, got {}",
                self.channels
            )));
        }
        if self.poll_interval_us == 0 {
            return Err(ConfigError::Invalid("poll_interval_us must be non-zero".into()));
        }
        if self.command_event == self.reply_event {
            return Err(ConfigError::Invalid(format!(
                "command_event and reply_event share event {}",
                self.command_event
            )));
        }
        if self.remote_processor.trim().is_empty() {
            return Err(ConfigError::Invalid("remote_processor is empty".into()));
        }
        Ok(())
    }

    /// Request timeout.
    pub fn timeout(&self) -> RpcTimeout {
        RpcTimeout::from_millis(self.timeout_ms)
    }

    /// Doorbell wait slice.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_micros(self.poll_interval_us)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        assert_eq!(RprocConfig::from_toml_str("").unwrap(), RprocConfig::default());
    }

    #[test]
    fn fields_override_defaults() {
        let config = RprocConfig::from_toml_str(
            "timeout_ms = 0\nchannels = 4\npriority = \"urgent\"\nshm_base = 0x90000000\n",
        )
        .unwrap();
        assert_eq!(config.timeout(), RpcTimeout::Forever);
        assert_eq!(config.channels, 4);
        assert_eq!(config.priority, Priority::Urgent);
        assert_eq!(config.shm_base, Some(0x9000_0000));
    }

    #[test]
    fn rejects_unknown_fields_and_bad_ranges() {
        assert!(matches!(
            RprocConfig::from_toml_str("timeout = 5"),
            Err(ConfigError::Parse { .. })
        ));
        assert!(matches!(
            RprocConfig::from_toml_str("channels = 65"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            RprocConfig::from_toml_str("reply_event = 12"),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn load_reports_path() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "channels = 2").unwrap();
        assert_eq!(RprocConfig::load(file.path()).unwrap().channels, 2);

        let missing = file.path().with_extension("missing");
        match RprocConfig::load(&missing) {
            Err(ConfigError::Io { path, .. }) => assert_eq!(path, missing),
            other => panic!("unexpected {other:?}"),
        }
    }
}
