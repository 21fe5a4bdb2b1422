//! Service configuration.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_ACCEPT_POLL: Duration = Duration::from_secs(1);
const DEFAULT_NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_MAX_LINE_LENGTH: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Runtime settings for the acceptor and the SCP negotiation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// How long one accept call may block before the stop signal is checked
    #[serde(with = "humantime_duration")]
    pub accept_poll_interval: Duration,

    /// How long a new channel may take to issue its scp exec request
    #[serde(with = "humantime_duration")]
    pub negotiation_timeout: Duration,

    /// Longest control line accepted from a peer, in bytes
    pub max_line_length: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            accept_poll_interval: DEFAULT_ACCEPT_POLL,
            negotiation_timeout: DEFAULT_NEGOTIATION_TIMEOUT,
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
        }
    }
}

impl Config {
    /// Parse a JSON document, filling omitted fields with defaults
    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a JSON file
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.accept_poll_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "accept_poll_interval must be greater than zero".to_string(),
            ));
        }
        if self.negotiation_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "negotiation_timeout must be greater than zero".to_string(),
            ));
        }
        // Shortest valid control line is "C0000 0 x\n"
        if self.max_line_length < 10 {
            return Err(ConfigError::Invalid(format!(
                "max_line_length {} is too small to hold a control line",
                self.max_line_length
            )));
        }
        Ok(())
    }
}

mod humantime_duration {
    use super::*;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
