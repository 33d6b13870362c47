//! Configuration management for the IMU pipeline service.
//!
//! Configuration is loaded from files and environment variables and then
//! validated before any component is built.

use crate::calibration::{CALIBRATION_KEY, PROGRESS_EVERY, REQUIRED_SAMPLES};
use crate::chart_feed::{DISPLAY_HZ, SENSOR_HZ, WINDOW_SECONDS};
use crate::log_writer::{
    DIRECTORY_NAME, FLUSH_INTERVAL_MS, INTERVAL_MINUTES, MAX_RETAINED_ON_FAILURE,
};
use crate::uploader::{BATCH_SIZE, CHECK_INTERVAL_MS, DEFAULT_DEVICE_ID, UPLOAD_INTERVAL_MS};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Highest display rate with a non-zero millisecond tick
const MAX_DISPLAY_HZ: u32 = 1000;

/// Main configuration for the pipeline service.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub service: ServiceConfig,

    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub calibration: CalibrationConfig,

    #[serde(default)]
    pub chart: ChartConfig,

    #[serde(default)]
    pub log: LogConfig,

    #[serde(default)]
    pub upload: UploadConfig,

    #[serde(default)]
    pub recording: RecordingConfig,
}

/// Service-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Output format (json, pretty)
    #[serde(default = "default_log_format")]
    pub log_format: String,

    /// Prometheus exporter port (0 disables the exporter)
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    /// Interval between statistics log lines in seconds
    #[serde(default = "default_stats_interval")]
    pub stats_interval_secs: u64,
}

/// Frame transport configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TransportConfig {
    /// UDP address frames are received on, one frame per datagram
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

/// Calibration engine configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CalibrationConfig {
    /// Samples collected per calibration run
    #[serde(default = "default_required_samples")]
    pub required_samples: usize,

    /// Emit a progress event every N samples
    #[serde(default = "default_progress_every")]
    pub progress_every: usize,

    /// Directory holding the persisted calibration record
    #[serde(default = "default_calibration_dir")]
    pub store_dir: PathBuf,

    /// Key of the persisted calibration record
    #[serde(default = "default_calibration_key")]
    pub store_key: String,

    /// Start a calibration run as soon as the service is up
    #[serde(default)]
    pub run_on_start: bool,
}

/// Chart feed (window downsampler) configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ChartConfig {
    /// Length of the displayed window in seconds
    #[serde(default = "default_window_seconds")]
    pub window_seconds: u32,

    /// Display rate in points per second
    #[serde(default = "default_display_hz")]
    pub display_hz: u32,

    /// Nominal sensor rate in samples per second
    #[serde(default = "default_sensor_hz")]
    pub sensor_hz: u32,
}

/// Time zone used to evaluate partition boundaries and file names.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionTimezone {
    #[default]
    Local,
    Utc,
}

/// Partitioned CSV log configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    /// Application data directory
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Subfolder of `data_dir` holding the partitions
    #[serde(default = "default_log_subdir")]
    pub subdir: String,

    /// Partition length in minutes
    #[serde(default = "default_interval_minutes")]
    pub interval_minutes: u32,

    /// Interval between buffered flushes in milliseconds
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// Samples kept for retry after a failed flush
    #[serde(default = "default_max_retained")]
    pub max_retained_on_failure: usize,

    #[serde(default)]
    pub timezone: PartitionTimezone,
}

/// Batch uploader configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    /// Device identifier attached to every uploaded document
    #[serde(default = "default_device_id")]
    pub device_id: String,

    /// Upload when this much time passed since the last upload (ms)
    #[serde(default = "default_upload_interval_ms")]
    pub upload_interval_ms: u64,

    /// Upload when this many samples are pending
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Interval of the periodic upload check (ms)
    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,

    /// Concurrent document writes per batch
    #[serde(default = "default_upload_concurrency")]
    pub concurrency: usize,

    #[serde(default)]
    pub s3: S3Config,
}

/// S3 document store configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// S3 bucket name for uploaded documents
    #[serde(default)]
    pub bucket: String,

    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,

    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,

    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,

    /// Key prefix (collection name)
    #[serde(default = "default_collection")]
    pub prefix: String,
}

/// Recording mode configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RecordingConfig {
    /// Enable recording as soon as the service is up
    #[serde(default)]
    pub start_on_launch: bool,
}

// Default value functions
fn default_service_name() -> String {
    "imu-pipeline".to_string()
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
fn default_stats_interval() -> u64 {
    30
}
fn default_bind_addr() -> String {
    "0.0.0.0:7400".to_string()
}
fn default_required_samples() -> usize {
    REQUIRED_SAMPLES
}
fn default_progress_every() -> usize {
    PROGRESS_EVERY
}
fn default_calibration_dir() -> PathBuf {
    PathBuf::from("data/prefs")
}
fn default_calibration_key() -> String {
    CALIBRATION_KEY.to_string()
}
fn default_window_seconds() -> u32 {
    WINDOW_SECONDS
}
fn default_display_hz() -> u32 {
    DISPLAY_HZ
}
fn default_sensor_hz() -> u32 {
    SENSOR_HZ
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}
fn default_log_subdir() -> String {
    DIRECTORY_NAME.to_string()
}
fn default_interval_minutes() -> u32 {
    INTERVAL_MINUTES
}
fn default_flush_interval_ms() -> u64 {
    FLUSH_INTERVAL_MS
}
fn default_max_retained() -> usize {
    MAX_RETAINED_ON_FAILURE
}
fn default_device_id() -> String {
    DEFAULT_DEVICE_ID.to_string()
}
fn default_upload_interval_ms() -> u64 {
    UPLOAD_INTERVAL_MS
}
fn default_batch_size() -> usize {
    BATCH_SIZE
}
fn default_check_interval_ms() -> u64 {
    CHECK_INTERVAL_MS
}
fn default_upload_concurrency() -> usize {
    16
}
fn default_region() -> String {
    "us-east-1".to_string()
}
fn default_collection() -> String {
    "imu_data".to_string()
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            metrics_port: default_metrics_port(),
            stats_interval_secs: default_stats_interval(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
        }
    }
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            required_samples: default_required_samples(),
            progress_every: default_progress_every(),
            store_dir: default_calibration_dir(),
            store_key: default_calibration_key(),
            run_on_start: false,
        }
    }
}

impl Default for ChartConfig {
    fn default() -> Self {
        Self {
            window_seconds: default_window_seconds(),
            display_hz: default_display_hz(),
            sensor_hz: default_sensor_hz(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            subdir: default_log_subdir(),
            interval_minutes: default_interval_minutes(),
            flush_interval_ms: default_flush_interval_ms(),
            max_retained_on_failure: default_max_retained(),
            timezone: PartitionTimezone::default(),
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            device_id: default_device_id(),
            upload_interval_ms: default_upload_interval_ms(),
            batch_size: default_batch_size(),
            check_interval_ms: default_check_interval_ms(),
            concurrency: default_upload_concurrency(),
            s3: S3Config::default(),
        }
    }
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            region: default_region(),
            endpoint_url: None,
            force_path_style: false,
            prefix: default_collection(),
        }
    }
}

impl PipelineConfig {
    /// Load configuration from file and environment variables.
    ///
    /// Sources, later overriding earlier:
    /// 1. config/default.toml
    /// 2. config/{RUN_MODE}.toml
    /// 3. Environment variables prefixed with IMU_ (e.g. IMU__UPLOAD__S3__BUCKET)
    pub fn load() -> Result<Self, ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let config = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            .add_source(
                Environment::with_prefix("IMU")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.calibration.required_samples == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "calibration.required_samples".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }

        if self.calibration.store_key.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "calibration.store_key".to_string(),
            ));
        }

        if self.chart.window_seconds == 0 || self.chart.display_hz == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "chart.window_seconds/display_hz".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }

        if self.chart.display_hz > MAX_DISPLAY_HZ {
            return Err(ConfigValidationError::InvalidValue {
                field: "chart.display_hz".to_string(),
                message: format!("Display rate must be at most {MAX_DISPLAY_HZ} Hz"),
            });
        }

        if self.chart.sensor_hz < self.chart.display_hz {
            return Err(ConfigValidationError::InvalidValue {
                field: "chart.sensor_hz".to_string(),
                message: "Sensor rate must be at least the display rate".to_string(),
            });
        }

        if self.log.interval_minutes == 0 || 60 % self.log.interval_minutes != 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "log.interval_minutes".to_string(),
                message: "Interval must divide an hour evenly".to_string(),
            });
        }

        if self.log.flush_interval_ms == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "log.flush_interval_ms".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }

        if self.upload.device_id.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "upload.device_id".to_string(),
            ));
        }

        if self.upload.batch_size == 0
            || self.upload.check_interval_ms == 0
            || self.upload.concurrency == 0
        {
            return Err(ConfigValidationError::InvalidValue {
                field: "upload.batch_size/check_interval_ms/concurrency".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }

        if self.upload.s3.bucket.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "upload.s3.bucket".to_string(),
            ));
        }

        Ok(())
    }
}

impl ChartConfig {
    /// Raw samples per displayed point.
    pub fn decimation(&self) -> usize {
        (self.sensor_hz / self.display_hz).max(1) as usize
    }

    /// Points kept per channel.
    pub fn max_points(&self) -> usize {
        (self.window_seconds * self.display_hz) as usize
    }

    /// Interval between display ticks.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(1000 / self.display_hz as u64)
    }

    /// Spacing of the synthetic time axis in seconds.
    pub fn point_spacing_secs(&self) -> f64 {
        1.0 / self.display_hz as f64
    }
}

impl LogConfig {
    /// Directory the partitions are written to.
    pub fn directory(&self) -> PathBuf {
        self.data_dir.join(&self.subdir)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

impl UploadConfig {
    pub fn upload_interval(&self) -> Duration {
        Duration::from_millis(self.upload_interval_ms)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }
}

impl ServiceConfig {
    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs.max(1))
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
