use crate::frame::PixelFormat;
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub camera: CameraConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Which device and stream format to negotiate.
#[derive(Debug, Clone, Deserialize)]
pub struct CameraConfig {
    /// Case-sensitive substring matched against enumerated device names.
    #[serde(default = "default_name_match")]
    pub name_match: String,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_format")]
    pub format: PixelFormat,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutputConfig {
    /// Directory snapshots are written to. Must already exist.
    #[serde(default = "default_output_dir")]
    pub dir: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CaptureConfig {
    /// Wall-clock window the reader runs for before being stopped.
    #[serde(default = "default_duration_secs")]
    pub duration_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            name_match: default_name_match(),
            width: default_width(),
            height: default_height(),
            format: default_format(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: default_output_dir(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            duration_secs: default_duration_secs(),
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

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFile(path.display().to_string(), e))?;
        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Ok(config)
    }

    /// Load from `path` if it exists, otherwise fall back to the built-in
    /// defaults (the program runs with no config file at all).
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    ReadFile(String, std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(String),
}

// Default value functions
fn default_name_match() -> String {
    "Surface".into()
}
fn default_width() -> u32 {
    1280
}
fn default_height() -> u32 {
    720
}
fn default_format() -> PixelFormat {
    PixelFormat::Nv12
}
fn default_output_dir() -> String {
    "video_frames".into()
}
fn default_duration_secs() -> u64 {
    10
}
fn default_log_level() -> String {
    "info".into()
}
