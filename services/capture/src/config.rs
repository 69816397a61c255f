//! Configuration management for the capture client.
//!
//! This module handles loading and validating configuration from environment
//! variables and configuration files.

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::time::Duration;

use crate::gate::GatePolicy;

/// Main configuration for the capture client.
#[derive(Debug, Clone, Deserialize)]
pub struct CaptureConfig {
    /// Ingest API client configuration
    #[serde(default)]
    pub api: ApiClientConfig,

    /// Upload reliability policy
    #[serde(default)]
    pub upload: UploadConfig,

    /// Quality gate thresholds and weights
    #[serde(default)]
    pub gate: GatePolicy,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Ingest API connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiClientConfig {
    /// Base URL of the ingest API (e.g., "http://localhost:8080")
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Timeout for control requests (upload targets, completion) in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Size of body chunks streamed during a PUT
    #[serde(default = "default_chunk_size")]
    pub chunk_size_bytes: usize,
}

/// Upload watchdog and retry configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    /// Abort an attempt after this long without new bytes
    #[serde(default = "default_stall_timeout_ms")]
    pub stall_timeout_ms: u64,

    /// Abort an attempt older than this
    #[serde(default = "default_overall_timeout_ms")]
    pub overall_timeout_ms: u64,

    /// Abort an attempt that has sent nothing after this long
    #[serde(default = "default_no_progress_timeout_ms")]
    pub no_progress_timeout_ms: u64,

    /// Attempts per photo (clamped to 1..=5)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// First backoff delay between attempts
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,

    /// Backoff delay cap
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// Watchdog polling interval
    #[serde(default = "default_watchdog_interval_ms")]
    pub watchdog_interval_ms: u64,

    /// Resolve a download URL after each successful upload
    #[serde(default)]
    pub include_download_url: bool,
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

    /// Whether to include source code location
    #[serde(default)]
    pub include_location: bool,
}

// Default value functions
fn default_base_url() -> String {
    "http://localhost:8080".to_string()
}
fn default_request_timeout() -> u64 {
    30
}
fn default_chunk_size() -> usize {
    64 * 1024
}
fn default_stall_timeout_ms() -> u64 {
    15_000
}
fn default_overall_timeout_ms() -> u64 {
    90_000
}
fn default_no_progress_timeout_ms() -> u64 {
    4_000
}
fn default_max_retries() -> u32 {
    3
}
fn default_backoff_initial_ms() -> u64 {
    500
}
fn default_backoff_max_ms() -> u64 {
    8_000
}
fn default_watchdog_interval_ms() -> u64 {
    1_000
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for ApiClientConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            request_timeout_secs: default_request_timeout(),
            chunk_size_bytes: default_chunk_size(),
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            stall_timeout_ms: default_stall_timeout_ms(),
            overall_timeout_ms: default_overall_timeout_ms(),
            no_progress_timeout_ms: default_no_progress_timeout_ms(),
            max_retries: default_max_retries(),
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            watchdog_interval_ms: default_watchdog_interval_ms(),
            include_download_url: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            include_location: false,
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            api: ApiClientConfig::default(),
            upload: UploadConfig::default(),
            gate: GatePolicy::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl CaptureConfig {
    /// Load configuration from file and environment variables.
    ///
    /// Configuration is loaded in the following order (later sources override earlier):
    /// 1. Local config file (config/capture.toml)
    /// 2. System config file (/etc/bodyscan/capture.toml)
    /// 3. Environment variables (prefixed with CAPTURE__)
    pub fn load() -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name("config/capture").required(false))
            .add_source(File::with_name("/etc/bodyscan/capture").required(false))
            // e.g. CAPTURE__UPLOAD__STALL_TIMEOUT_MS=20000
            .add_source(
                Environment::with_prefix("CAPTURE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.api.base_url.is_empty() {
            return Err(ConfigValidationError::MissingField("api.base_url".to_string()));
        }
        if !self.api.base_url.starts_with("http://") && !self.api.base_url.starts_with("https://") {
            return Err(ConfigValidationError::InvalidValue {
                field: "api.base_url".to_string(),
                message: "URL must start with http:// or https://".to_string(),
            });
        }
        if self.api.chunk_size_bytes == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "api.chunk_size_bytes".to_string(),
                message: "Chunk size must be greater than 0".to_string(),
            });
        }

        let upload = &self.upload;
        if upload.stall_timeout_ms == 0
            || upload.overall_timeout_ms == 0
            || upload.no_progress_timeout_ms == 0
        {
            return Err(ConfigValidationError::InvalidValue {
                field: "upload.*_timeout_ms".to_string(),
                message: "Timeouts must be greater than 0".to_string(),
            });
        }
        if upload.watchdog_interval_ms == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "upload.watchdog_interval_ms".to_string(),
                message: "Interval must be greater than 0".to_string(),
            });
        }
        if upload.backoff_initial_ms > upload.backoff_max_ms {
            return Err(ConfigValidationError::InvalidValue {
                field: "upload.backoff_initial_ms".to_string(),
                message: "Initial backoff must not exceed backoff_max_ms".to_string(),
            });
        }

        if !(0.0..=1.0).contains(&self.gate.pass_score) {
            return Err(ConfigValidationError::InvalidValue {
                field: "gate.pass_score".to_string(),
                message: "Pass score must be within 0..=1".to_string(),
            });
        }

        Ok(())
    }
}

impl ApiClientConfig {
    /// Get request timeout as Duration.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
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
