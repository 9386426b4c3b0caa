//! Configuration management for the camera fleet worker.
//!
//! This module handles loading and validating configuration from environment
//! variables and configuration files.

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for the worker process.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// Job selection (request document, user, shard)
    #[serde(default)]
    pub job: JobConfig,

    /// Worker pool configuration
    #[serde(default)]
    pub dispatcher: DispatcherConfig,

    /// Camera transport configuration
    #[serde(default)]
    pub camera: CameraConfig,

    /// Sampling loop configuration
    #[serde(default)]
    pub sampling: SamplingConfig,

    /// Result storage configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Metrics exporter configuration
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Which job this process runs.
#[derive(Debug, Clone, Deserialize)]
pub struct JobConfig {
    /// Path of the JSON request document
    #[serde(default)]
    pub request_file: String,

    /// Submitting user, used to scope stored results
    #[serde(default = "default_username")]
    pub username: String,

    /// Index of the camera shard handled by this process
    #[serde(default)]
    pub shard_index: usize,

    /// Total number of shards the fleet is split into
    #[serde(default = "default_shard_count")]
    pub shard_count: usize,
}

/// Worker pool configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DispatcherConfig {
    /// Maximum number of camera tasks running at once (0 = one per camera)
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
}

/// Camera transport configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CameraConfig {
    /// Timeout for downloading a single snapshot, in seconds
    #[serde(default = "default_download_timeout")]
    pub download_timeout_secs: u64,

    /// Number of attempts made to open a stream before giving up
    #[serde(default = "default_open_attempts")]
    pub open_attempts: u32,

    /// Base delay between open attempts in milliseconds
    #[serde(default = "default_reopen_base_delay_ms")]
    pub reopen_base_delay_ms: u64,

    /// Maximum delay between open attempts in milliseconds
    #[serde(default = "default_reopen_max_delay_ms")]
    pub reopen_max_delay_ms: u64,

    /// Frames narrower than this are treated as corrupted
    #[serde(default = "default_min_frame_dimension")]
    pub min_frame_width: u32,

    /// Frames shorter than this are treated as corrupted
    #[serde(default = "default_min_frame_dimension")]
    pub min_frame_height: u32,

    /// Largest partial MJPEG image kept while waiting for its end marker
    #[serde(default = "default_max_mjpeg_frame_bytes")]
    pub max_mjpeg_frame_bytes: usize,
}

/// Sampling loop configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SamplingConfig {
    /// Abort a task after this many corrupted frames in a row (unset = retry forever)
    #[serde(default)]
    pub max_consecutive_corrupted_frames: Option<u32>,
}

/// Result storage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Storage backend (local or s3)
    #[serde(default = "default_storage_backend")]
    pub backend: String,

    /// Root directory for the local backend
    #[serde(default = "default_local_root")]
    pub local_root: PathBuf,

    /// S3 settings, required when backend = s3
    #[serde(default)]
    pub s3: Option<S3Config>,
}

/// S3 result store configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// Bucket receiving analysis results
    pub bucket: String,

    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,

    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,

    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
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

/// Prometheus exporter configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Enable Prometheus metrics export
    #[serde(default)]
    pub enabled: bool,

    /// Port for the metrics HTTP listener
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_username() -> String {
    "anonymous".to_string()
}
fn default_shard_count() -> usize {
    1
}
fn default_max_concurrent_tasks() -> usize {
    64
}
fn default_download_timeout() -> u64 {
    5
}
fn default_open_attempts() -> u32 {
    5
}
fn default_reopen_base_delay_ms() -> u64 {
    1000
}
fn default_reopen_max_delay_ms() -> u64 {
    5000
}
fn default_min_frame_dimension() -> u32 {
    32
}
fn default_max_mjpeg_frame_bytes() -> usize {
    8 * 1024 * 1024
}
fn default_storage_backend() -> String {
    "local".to_string()
}
fn default_local_root() -> PathBuf {
    PathBuf::from("results")
}
fn default_region() -> String {
    "us-east-1".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "json".to_string()
}
fn default_metrics_port() -> u16 {
    9090
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            request_file: String::new(),
            username: default_username(),
            shard_index: 0,
            shard_count: default_shard_count(),
        }
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: default_max_concurrent_tasks(),
        }
    }
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            download_timeout_secs: default_download_timeout(),
            open_attempts: default_open_attempts(),
            reopen_base_delay_ms: default_reopen_base_delay_ms(),
            reopen_max_delay_ms: default_reopen_max_delay_ms(),
            min_frame_width: default_min_frame_dimension(),
            min_frame_height: default_min_frame_dimension(),
            max_mjpeg_frame_bytes: default_max_mjpeg_frame_bytes(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            local_root: default_local_root(),
            s3: None,
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

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

impl WorkerConfig {
    /// Load configuration from file and environment variables.
    ///
    /// Configuration is loaded in the following order (later sources override earlier):
    /// 1. Default config file (config/default.toml)
    /// 2. Environment-specific config (config/{env}.toml)
    /// 3. Environment variables (prefixed with CAMFLEET_)
    pub fn load() -> Result<Self, ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let config = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // e.g. CAMFLEET__STORAGE__BACKEND
            .add_source(
                Environment::with_prefix("CAMFLEET")
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
                Environment::with_prefix("CAMFLEET")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.job.request_file.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "job.request_file".to_string(),
            ));
        }

        if self.job.shard_count == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "job.shard_count".to_string(),
                message: "Shard count must be greater than 0".to_string(),
            });
        }
        if self.job.shard_index >= self.job.shard_count {
            return Err(ConfigValidationError::InvalidValue {
                field: "job.shard_index".to_string(),
                message: format!(
                    "Shard index must be lower than shard count ({})",
                    self.job.shard_count
                ),
            });
        }

        if self.camera.download_timeout_secs == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "camera.download_timeout_secs".to_string(),
                message: "Timeout must be greater than 0".to_string(),
            });
        }
        if self.camera.open_attempts == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "camera.open_attempts".to_string(),
                message: "At least one open attempt is required".to_string(),
            });
        }

        match self.storage.backend.as_str() {
            "local" => {}
            "s3" => match &self.storage.s3 {
                None => {
                    return Err(ConfigValidationError::MissingField("storage.s3".to_string()))
                }
                Some(s3) if s3.bucket.is_empty() => {
                    return Err(ConfigValidationError::MissingField(
                        "storage.s3.bucket".to_string(),
                    ))
                }
                Some(_) => {}
            },
            other => {
                return Err(ConfigValidationError::InvalidValue {
                    field: "storage.backend".to_string(),
                    message: format!("Unknown backend '{}', expected local or s3", other),
                })
            }
        }

        Ok(())
    }
}

impl CameraConfig {
    /// Get download timeout as Duration.
    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }

    /// Get base reopen delay as Duration.
    pub fn reopen_base_delay(&self) -> Duration {
        Duration::from_millis(self.reopen_base_delay_ms)
    }

    /// Get maximum reopen delay as Duration.
    pub fn reopen_max_delay(&self) -> Duration {
        Duration::from_millis(self.reopen_max_delay_ms)
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
