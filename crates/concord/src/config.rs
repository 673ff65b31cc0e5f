//! Tunables for the consistency core.
//!
//! Configuration is plain JSON. Every section and field is optional; anything
//! left out takes its default. [`CollabConfig::load`] is lenient and never
//! fails on a bad file, while [`CollabConfig::from_json`] reports errors.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Errors raised when configuration cannot be read or does not make sense.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(String),

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Activity sequencer settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SequencerConfig {
    /// How long a gap may stay open before retransmission is requested.
    pub gap_timeout_ms: u64,
    /// Out-of-order envelopes buffered per sender before new ones are dropped.
    pub max_buffered: usize,
    /// Sent envelopes kept per recipient for retransmission.
    pub history_limit: usize,
    /// How often the runtime polls for stale gaps.
    pub tick_interval_ms: u64,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            gap_timeout_ms: 2000,
            max_buffered: 1024,
            history_limit: 4096,
            tick_interval_ms: 250,
        }
    }
}

/// Jupiter protocol settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JupiterConfig {
    /// Requests parked per (document, peer) while waiting for a predecessor.
    pub max_pending_requests: usize,
}

impl Default for JupiterConfig {
    fn default() -> Self {
        Self {
            max_pending_requests: 256,
        }
    }
}

/// Consistency watchdog settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    /// How often participants report checksums.
    pub interval_ms: u64,
    /// Skip reports identical to the previous one for the same document.
    pub suppress_unchanged: bool,
    /// Consecutive reports that may be skipped before one is sent anyway.
    pub max_suppressed: u32,
    /// How long a resync may stay unconfirmed before another may start.
    pub resync_timeout_ms: u64,
    /// Detected inconsistencies kept for inspection, newest last.
    pub history_limit: usize,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5000,
            suppress_unchanged: true,
            max_suppressed: 12,
            resync_timeout_ms: 30_000,
            history_limit: 256,
        }
    }
}

/// Top-level configuration.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollabConfig {
    pub sequencer: SequencerConfig,
    pub jupiter: JupiterConfig,
    pub watchdog: WatchdogConfig,
}

impl CollabConfig {
    /// Load configuration from a JSON file.
    ///
    /// A missing file yields the defaults. So does a file that cannot be read
    /// or parsed, after logging a warning.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            tracing::debug!("No config at {}, using defaults", path.display());
            return Self::default();
        }

        let parsed = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(e.to_string()))
            .and_then(|content| Self::from_json(&content));
        match parsed {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config file, using defaults: {}", e);
                Self::default()
            }
        }
    }

    /// Parse and validate configuration from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        serde_json::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Reject settings that would stall the protocol.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            (self.sequencer.gap_timeout_ms == 0, "sequencer.gap_timeout_ms"),
            (self.sequencer.max_buffered == 0, "sequencer.max_buffered"),
            (self.sequencer.history_limit == 0, "sequencer.history_limit"),
            (self.sequencer.tick_interval_ms == 0, "sequencer.tick_interval_ms"),
            (self.jupiter.max_pending_requests == 0, "jupiter.max_pending_requests"),
            (self.watchdog.interval_ms == 0, "watchdog.interval_ms"),
            (self.watchdog.resync_timeout_ms == 0, "watchdog.resync_timeout_ms"),
        ];
        match checks.iter().find(|(bad, _)| *bad) {
            Some((_, field)) => Err(ConfigError::Invalid(format!("{field} must be non-zero"))),
            None => Ok(()),
        }
    }
}
