use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Highest camera rate accepted in `[camera] fps`.
pub const MAX_FPS: f64 = 1000.0;

/// Client configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub camera: CameraConfig,
    pub endpoint: EndpointConfig,
    #[serde(default)]
    pub media: MediaConfig,
    #[serde(default)]
    pub display: DisplayConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Echo server configuration. Reads the same file as [`Config`] but only
/// needs `[server]` and `[logging]`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServeConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CameraConfig {
    pub url: String,
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(default = "default_fps")]
    pub fps: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    pub url: String,
    /// Header sent with every upload to skip the tunnel provider's interstitial page.
    #[serde(default = "default_bypass_header")]
    pub bypass_header: String,
    #[serde(default = "default_bypass_value")]
    pub bypass_value: String,
    /// Connect-phase timeout only; the request itself uses the HTTP client default.
    #[serde(default)]
    pub connect_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MediaConfig {
    #[serde(default = "default_media_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_authorized")]
    pub authorized: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DisplayConfig {
    #[serde(default = "default_display_path")]
    pub path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_annotate")]
    pub annotate: bool,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            dir: default_media_dir(),
            authorized: default_authorized(),
        }
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            path: default_display_path(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            annotate: default_annotate(),
            max_body_bytes: default_max_body_bytes(),
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
        Self::parse(&read_file(path)?)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Self = parse_toml(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let fps = self.camera.fps;
        if fps.is_nan() || fps <= 0.0 || fps > MAX_FPS {
            return Err(ConfigError::Invalid(format!(
                "camera.fps must be in (0, {MAX_FPS}], got {fps}"
            )));
        }
        Ok(())
    }
}

impl ServeConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Self::parse(&read_file(path)?)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        parse_toml(content)
    }
}

fn read_file(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path)
        .map_err(|e| ConfigError::ReadFile(path.display().to_string(), e))
}

fn parse_toml<T: DeserializeOwned>(content: &str) -> Result<T, ConfigError> {
    toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
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
fn default_mode() -> String {
    "mjpeg".into()
}
fn default_fps() -> f64 {
    10.0
}
fn default_bypass_header() -> String {
    "bypass-tunnel-reminder".into()
}
fn default_bypass_value() -> String {
    "any-value".into()
}
fn default_media_dir() -> PathBuf {
    PathBuf::from("saved")
}
fn default_authorized() -> bool {
    true
}
fn default_display_path() -> PathBuf {
    PathBuf::from("detection.jpg")
}
fn default_bind() -> String {
    "127.0.0.1:8000".into()
}
fn default_annotate() -> bool {
    true
}
fn default_max_body_bytes() -> usize {
    16 * 1024 * 1024
}
fn default_log_level() -> String {
    "info".into()
}
