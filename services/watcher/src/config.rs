//! Configuration management for the film watcher.
//!
//! This module handles loading and validating configuration from environment
//! variables and configuration files.

use crate::frame::ReadPosition;
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::num::NonZeroU64;
use std::time::Duration;

/// Main configuration for the watcher service.
#[derive(Debug, Clone, Deserialize)]
pub struct WatcherConfig {
    /// Video stream configuration
    pub stream: StreamConfig,

    /// Frame sampling and upload configuration
    pub sampling: SamplingConfig,

    /// Poll loop configuration
    #[serde(default)]
    pub polling: PollingConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Where a new session starts reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartSelector {
    #[default]
    Now,
    Earliest,
}

impl From<StartSelector> for ReadPosition {
    fn from(selector: StartSelector) -> Self {
        match selector {
            StartSelector::Now => ReadPosition::Now,
            StartSelector::Earliest => ReadPosition::Earliest,
        }
    }
}

/// Kinesis video stream configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    /// Stream name
    pub name: String,

    /// AWS region of the stream and the bucket
    pub region: String,

    /// Where to start reading
    #[serde(default)]
    pub start: StartSelector,

    /// Pre-defined Kinesis Video endpoint (e.g. a VPC endpoint)
    #[serde(default)]
    pub endpoint_url: Option<String>,

    /// Attempts at resolving the GET_MEDIA data endpoint
    #[serde(default = "default_endpoint_attempts")]
    pub endpoint_attempts: u32,

    /// Idle time in seconds after which a read returns what it has
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,

    /// Maximum bytes buffered per chunk
    #[serde(default = "default_max_chunk_bytes")]
    pub max_chunk_bytes: usize,
}

/// Frame sampling and S3 upload configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SamplingConfig {
    /// Persist every Nth frame (1 = every frame)
    #[serde(default = "default_save_nth_frame")]
    pub save_nth_frame: u64,

    /// Target bucket
    pub bucket: String,

    /// Prefix of the dated folder frames are stored under
    #[serde(default = "default_folder_prefix")]
    pub folder_prefix: String,

    /// JPEG quality (1-100)
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,

    /// Pre-defined S3 endpoint (VPC endpoint, MinIO, LocalStack)
    #[serde(default)]
    pub endpoint_url: Option<String>,

    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
}

/// How the poll loop reacts to a class of error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Log the error and keep polling.
    Skip,
    /// End the session.
    Terminate,
}

/// Poll loop configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PollingConfig {
    /// Seconds to wait after a poll returned no frames
    #[serde(default = "default_retry_interval_secs")]
    pub retry_interval_secs: u64,

    /// Reaction to a malformed fragment
    #[serde(default = "default_fragment_errors")]
    pub fragment_errors: FailurePolicy,

    /// Reaction to a sink failing on a frame
    #[serde(default = "default_sink_errors")]
    pub sink_errors: FailurePolicy,

    /// Open the playback gate as soon as the watcher starts
    #[serde(default = "default_true")]
    pub begin_on_start: bool,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_endpoint_attempts() -> u32 {
    5
}
fn default_read_timeout_secs() -> u64 {
    3
}
fn default_max_chunk_bytes() -> usize {
    16 * 1024 * 1024
}
fn default_save_nth_frame() -> u64 {
    30
}
fn default_folder_prefix() -> String {
    "source-images".to_string()
}
fn default_jpeg_quality() -> u8 {
    90
}
fn default_retry_interval_secs() -> u64 {
    5
}
fn default_fragment_errors() -> FailurePolicy {
    FailurePolicy::Skip
}
fn default_sink_errors() -> FailurePolicy {
    FailurePolicy::Terminate
}
fn default_true() -> bool {
    true
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "json".to_string()
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            retry_interval_secs: default_retry_interval_secs(),
            fragment_errors: default_fragment_errors(),
            sink_errors: default_sink_errors(),
            begin_on_start: default_true(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl WatcherConfig {
    /// Load configuration from file and environment variables.
    ///
    /// Configuration is loaded in the following order (later sources override earlier):
    /// 1. Default config file (config/default.toml)
    /// 2. Environment-specific config (config/{env}.toml)
    /// 3. Environment variables (prefixed with WATCHER_)
    pub fn load() -> Result<Self, ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let config = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // e.g. WATCHER_STREAM__NAME, WATCHER_SAMPLING__SAVE_NTH_FRAME
            .add_source(
                Environment::with_prefix("WATCHER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Create configuration from environment variables only.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(
                Environment::with_prefix("WATCHER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.stream.name.is_empty() {
            return Err(ConfigValidationError::MissingField("stream.name".to_string()));
        }

        if self.stream.region.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "stream.region".to_string(),
            ));
        }

        if self.stream.max_chunk_bytes == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "stream.max_chunk_bytes".to_string(),
                message: "Chunk size must be greater than 0".to_string(),
            });
        }

        if self.sampling.bucket.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "sampling.bucket".to_string(),
            ));
        }

        if self.sampling.save_nth_frame == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "sampling.save_nth_frame".to_string(),
                message: "Sampling interval must be at least 1".to_string(),
            });
        }

        if !(1..=100).contains(&self.sampling.jpeg_quality) {
            return Err(ConfigValidationError::InvalidValue {
                field: "sampling.jpeg_quality".to_string(),
                message: "Quality must be between 1 and 100".to_string(),
            });
        }

        if self.polling.retry_interval_secs == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "polling.retry_interval_secs".to_string(),
                message: "Retry interval must be at least one second".to_string(),
            });
        }

        Ok(())
    }
}

impl StreamConfig {
    /// Get read idle timeout as Duration.
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

impl SamplingConfig {
    /// Sampling interval; zero is treated as "every frame".
    pub fn every_nth(&self) -> NonZeroU64 {
        NonZeroU64::new(self.save_nth_frame).unwrap_or(NonZeroU64::MIN)
    }
}

impl PollingConfig {
    /// Get empty-read retry interval as Duration.
    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}
