//! Configuration structures for the DCP slave engine and daemon.
//!
//! Supports TOML deserialization with defaults that match the
//! behaviour of a stock DCP slave.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Path to the slave description (TOML).
    pub description: Option<PathBuf>,

    /// Sequence number supervision.
    pub sequence: SequenceConfig,

    /// Heartbeat supervision.
    pub heartbeat: HeartbeatConfig,

    /// Real-time stepping.
    pub realtime: RealtimeConfig,

    /// Protocol log routing.
    pub logging: LoggingConfig,

    /// Value store limits.
    pub values: ValueConfig,

    /// Transport used by the daemon.
    pub transport: TransportConfig,
}

/// Sequence number supervision.
///
/// DCP masters number control PDUs and every data channel separately.
/// Checking is off by default because several masters in the field
/// restart their counters on reconfiguration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SequenceConfig {
    /// Drop duplicate or out-of-date PDUs and report gaps.
    pub check_sequence_ids: bool,
}

/// Heartbeat supervision.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Move on to ERROR_RESOLVED right after a missed heartbeat.
    pub auto_resolve: bool,

    /// Lower bound for the monitor's check period.
    #[serde(with = "humantime_serde")]
    pub min_check_interval: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            auto_resolve: true,
            min_check_interval: Duration::from_millis(1),
        }
    }
}

/// Policy for handling step overruns in real-time mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OverrunPolicy {
    /// Log a warning and resynchronize to the next deadline.
    #[default]
    Warn,
    /// Keep the original deadline grid and catch up silently.
    Ignore,
}

/// Real-time stepping configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    /// How to react when a step takes longer than the time resolution.
    pub on_overrun: OverrunPolicy,

    /// Number of step durations retained for percentiles.
    pub histogram_size: usize,

    /// Maximum time to wait for an asynchronous step callback to finish
    /// before re-checking for cancellation.
    #[serde(with = "humantime_serde")]
    pub async_poll_interval: Duration,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            on_overrun: OverrunPolicy::Warn,
            histogram_size: 1_000,
            async_poll_interval: Duration::from_millis(10),
        }
    }
}

/// Protocol log routing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Maximum payload of a single `RSP_log_ack`.
    pub response_buffer_size: usize,

    /// Entries retained per category for `INF_log`.
    pub buffer_capacity: usize,

    /// Render templates into text for the tracing output.
    pub generate_log_strings: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            response_buffer_size: 900,
            buffer_capacity: 1_024,
            generate_log_strings: true,
        }
    }
}

/// Value store limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValueConfig {
    /// Capacity of string and binary values without a declared max size.
    pub default_max_size: u32,
    /// Largest element count of a numeric value, including shapes taken
    /// from structural parameters.
    pub max_elements: usize,
}

impl Default for ValueConfig {
    fn default() -> Self {
        Self {
            default_max_size: 1_024,
            max_elements: 65_536,
        }
    }
}

/// Transport configuration for the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Local address the control channel binds to (host:port).
    pub bind: String,

    /// Largest PDU accepted or sent.
    pub max_pdu_size: usize,

    /// Socket read timeout, used to poll for shutdown.
    #[serde(with = "humantime_serde")]
    pub read_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            bind: String::from("127.0.0.1:8080"),
            max_pdu_size: 65_507,
            read_timeout: Duration::from_millis(100),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(ConfigError::Parse)
    }

    /// Serialize configuration to TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File I/O error.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// TOML parsing error.
    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize TOML: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Serde helper module for `Duration` using humantime format.
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
