use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::frame::PixelFormat;
use crate::naming::NamingScheme;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub camera: CameraConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub burst: BurstConfig,
    #[serde(default)]
    pub time: TimeConfig,
    #[serde(default)]
    pub housekeeping: HousekeepingConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CameraConfig {
    #[serde(default = "default_pixel_format")]
    pub pixel_format: PixelFormat,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    /// Quality used when frames are encoded to JPEG in software.
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
    /// Number of driver frame buffers; bounds concurrent frame ownership.
    #[serde(default = "default_fb_count")]
    pub fb_count: usize,
    /// Upper bound on waiting for a frame. Absent means wait indefinitely.
    #[serde(default)]
    pub grab_timeout_ms: Option<u64>,
    #[serde(default = "default_frame_interval_ms")]
    pub frame_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_mount_point")]
    pub mount_point: PathBuf,
    #[serde(default = "default_base_dir")]
    pub base_dir: String,
    #[serde(default)]
    pub naming: NamingScheme,
    #[serde(default = "default_true")]
    pub format_if_mount_failed: bool,
    #[serde(default = "default_max_files")]
    pub max_files: u32,
    #[serde(default = "default_allocation_unit_size")]
    pub allocation_unit_size: u32,
    #[serde(default = "default_spi_max_freq_khz")]
    pub spi_max_freq_khz: u32,
    #[serde(default = "default_spi_max_transfer_size")]
    pub spi_max_transfer_size: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_control_port")]
    pub control_port: u16,
    #[serde(default = "default_stream_port")]
    pub stream_port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BurstConfig {
    #[serde(default = "default_burst_duration")]
    pub duration_secs: f64,
    #[serde(default = "default_burst_fps")]
    pub fps: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimeConfig {
    #[serde(default = "default_sync_retries")]
    pub sync_retries: u32,
    #[serde(default = "default_sync_interval")]
    pub sync_interval_secs: u64,
    #[serde(default = "default_min_valid_year")]
    pub min_valid_year: i32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HousekeepingConfig {
    #[serde(default = "default_housekeeping_interval")]
    pub interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CaptureConfig {
    #[serde(default = "default_stream_url")]
    pub stream_url: String,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_every_nth")]
    pub every_nth: u64,
    #[serde(default = "default_capture_naming")]
    pub naming: NamingScheme,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            pixel_format: default_pixel_format(),
            width: default_width(),
            height: default_height(),
            jpeg_quality: default_jpeg_quality(),
            fb_count: default_fb_count(),
            grab_timeout_ms: None,
            frame_interval_ms: default_frame_interval_ms(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            mount_point: default_mount_point(),
            base_dir: default_base_dir(),
            naming: NamingScheme::default(),
            format_if_mount_failed: true,
            max_files: default_max_files(),
            allocation_unit_size: default_allocation_unit_size(),
            spi_max_freq_khz: default_spi_max_freq_khz(),
            spi_max_transfer_size: default_spi_max_transfer_size(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            control_port: default_control_port(),
            stream_port: default_stream_port(),
        }
    }
}

impl Default for BurstConfig {
    fn default() -> Self {
        Self {
            duration_secs: default_burst_duration(),
            fps: default_burst_fps(),
        }
    }
}

impl Default for TimeConfig {
    fn default() -> Self {
        Self {
            sync_retries: default_sync_retries(),
            sync_interval_secs: default_sync_interval(),
            min_valid_year: default_min_valid_year(),
        }
    }
}

impl Default for HousekeepingConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_housekeeping_interval(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            stream_url: default_stream_url(),
            output_dir: default_output_dir(),
            every_nth: default_every_nth(),
            naming: default_capture_naming(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl StorageConfig {
    /// Full path of the photo directory on the mounted card.
    pub fn photo_dir(&self) -> PathBuf {
        self.mount_point.join(&self.base_dir)
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFile(path.display().to_string(), e))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.camera.fb_count == 0 {
            return Err(ConfigError::Invalid("camera.fb_count must be at least 1".into()));
        }
        if self.camera.width == 0 || self.camera.height == 0 {
            return Err(ConfigError::Invalid("camera frame size must be non-zero".into()));
        }
        if !(1..=100).contains(&self.camera.jpeg_quality) {
            return Err(ConfigError::Invalid(format!(
                "camera.jpeg_quality must be within 1..=100, got {}",
                self.camera.jpeg_quality
            )));
        }
        let positive = |v: f64| v.is_finite() && v > 0.0;
        if !positive(self.burst.fps) || !positive(self.burst.duration_secs) {
            return Err(ConfigError::Invalid(
                "burst fps and duration must be finite and positive".into(),
            ));
        }
        if self.housekeeping.interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "housekeeping.interval_secs must be at least 1".into(),
            ));
        }
        if self.http.control_port == self.http.stream_port {
            return Err(ConfigError::Invalid(format!(
                "control and stream listeners cannot share port {}",
                self.http.control_port
            )));
        }
        if self.capture.every_nth == 0 {
            return Err(ConfigError::Invalid("capture.every_nth must be at least 1".into()));
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    ReadFile(String, std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

// Default value functions
fn default_pixel_format() -> PixelFormat {
    PixelFormat::Rgb565
}
fn default_width() -> u32 {
    320
}
fn default_height() -> u32 {
    240
}
fn default_jpeg_quality() -> u8 {
    80
}
fn default_fb_count() -> usize {
    1
}
fn default_frame_interval_ms() -> u64 {
    33
}
fn default_mount_point() -> PathBuf {
    PathBuf::from("/sdcard")
}
fn default_base_dir() -> String {
    "BeeSense".into()
}
fn default_true() -> bool {
    true
}
fn default_max_files() -> u32 {
    5
}
fn default_allocation_unit_size() -> u32 {
    16 * 1024
}
fn default_spi_max_freq_khz() -> u32 {
    5000
}
fn default_spi_max_transfer_size() -> u32 {
    4000
}
fn default_bind_address() -> String {
    "0.0.0.0".into()
}
fn default_control_port() -> u16 {
    80
}
fn default_stream_port() -> u16 {
    81
}
fn default_burst_duration() -> f64 {
    5.0
}
fn default_burst_fps() -> f64 {
    3.0
}
fn default_sync_retries() -> u32 {
    10
}
fn default_sync_interval() -> u64 {
    2
}
fn default_min_valid_year() -> i32 {
    2024
}
fn default_housekeeping_interval() -> u64 {
    10
}
fn default_stream_url() -> String {
    "http://192.168.4.1:81/stream".into()
}
fn default_output_dir() -> PathBuf {
    PathBuf::from("traindata")
}
fn default_every_nth() -> u64 {
    1
}
fn default_capture_naming() -> NamingScheme {
    NamingScheme::Timestamp
}
fn default_log_level() -> String {
    "info".into()
}
