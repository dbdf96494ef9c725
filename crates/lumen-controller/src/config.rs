//! Configuration management for the lumen CLI
//!
//! Configuration is stored in TOML format.
//!
//! # Configuration File Locations
//!
//! - Unix: `~/.config/lumen/config.toml`
//! - Windows: `%APPDATA%\lumen\config\config.toml`

use std::path::{Path, PathBuf};
use std::time::Duration;

use lumen_core::capabilities::DeviceCapabilities;
use lumen_core::resolver::StreamPreferences;
use lumen_core::SessionConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    /// Failed to parse config file
    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Failed to serialize config
    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Lumen configuration
///
/// # Example TOML
///
/// ```toml
/// [connection]
/// probe_timeout_seconds = 10
/// pairing_timeout_seconds = 120
///
/// [stream]
/// resolution = "1920x1080"
/// fps = 60
/// bitrate_kbps = 0  # 0 = derive from resolution and fps
/// format = "auto"   # "auto" | "h264" | "hevc" | "av1"
/// hdr = false
/// full_range = false
/// audio = "stereo"  # "stereo" | "5.1" | "7.1"
///
/// [credentials]
/// db_path = ""  # Empty = default location
///
/// [settings]
/// path = ""  # Empty = default location
///
/// [output]
/// format = "table"  # "table" | "json" | "quiet"
/// verbose = false
///
/// [logging]
/// level = "warn"
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Stream preferences applied to new sessions
    #[serde(default)]
    pub stream: StreamPreferences,

    #[serde(default)]
    pub credentials: CredentialsConfig,

    #[serde(default)]
    pub settings: SettingsConfig,

    #[serde(default)]
    pub output: OutputConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Bound on pairing-state and server-info queries
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_seconds: u64,

    /// Bound on the PIN handshake, which waits for the user at the server
    #[serde(default = "default_pairing_timeout")]
    pub pairing_timeout_seconds: u64,
}

fn default_probe_timeout() -> u64 {
    10
}

fn default_pairing_timeout() -> u64 {
    120
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            probe_timeout_seconds: default_probe_timeout(),
            pairing_timeout_seconds: default_pairing_timeout(),
        }
    }
}

/// Credential store configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CredentialsConfig {
    /// Path to the credentials database (empty = default location)
    #[serde(default)]
    pub db_path: Option<PathBuf>,
}

/// Settings store configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SettingsConfig {
    /// Path to the settings file (empty = default location)
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Output configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Output format: "table", "json", "quiet"
    #[serde(default = "default_format")]
    pub format: String,

    #[serde(default)]
    pub verbose: bool,
}

fn default_format() -> String {
    "table".to_string()
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            format: default_format(),
            verbose: false,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: "error", "warn", "info", "debug", "trace"
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "warn".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from default location
    pub fn load_default() -> Result<Self, ConfigError> {
        if let Some(path) = Self::default_path() {
            if path.exists() {
                return Self::load(&path);
            }
        }
        Ok(Self::default())
    }

    /// Load configuration from custom path or default
    pub fn load_from(custom_path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = custom_path {
            Self::load(path)
        } else {
            Self::load_default()
        }
    }

    fn project_dirs() -> Option<directories::ProjectDirs> {
        directories::ProjectDirs::from("io", "lumen", "lumen")
    }

    /// Get default configuration file path
    pub fn default_path() -> Option<PathBuf> {
        Self::project_dirs().map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Get the data directory path (credentials, settings)
    pub fn data_dir() -> Option<PathBuf> {
        Self::project_dirs().map(|dirs| dirs.data_dir().to_path_buf())
    }

    /// Credentials database path, configured or default
    pub fn credentials_path(&self) -> Option<PathBuf> {
        self.credentials
            .db_path
            .clone()
            .or_else(|| Self::data_dir().map(|dir| dir.join("credentials.db")))
    }

    /// Settings file path, configured or default
    pub fn settings_path(&self) -> Option<PathBuf> {
        self.settings
            .path
            .clone()
            .or_else(|| Self::data_dir().map(|dir| dir.join("settings.json")))
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Create default configuration file if it doesn't exist
    pub fn create_default_if_missing() -> Result<bool, ConfigError> {
        if let Some(path) = Self::default_path() {
            if !path.exists() {
                Self::default().save(&path)?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_formats = ["table", "json", "quiet"];
        if !valid_formats.contains(&self.output.format.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid output format '{}'. Valid values: {:?}",
                self.output.format, valid_formats
            )));
        }

        let valid_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log level '{}'. Valid values: {:?}",
                self.logging.level, valid_levels
            )));
        }

        if self.connection.probe_timeout_seconds == 0 {
            return Err(ConfigError::ValidationError(
                "probe_timeout_seconds must be greater than 0".to_string(),
            ));
        }
        if self.connection.pairing_timeout_seconds == 0 {
            return Err(ConfigError::ValidationError(
                "pairing_timeout_seconds must be greater than 0".to_string(),
            ));
        }

        self.stream
            .validate()
            .map_err(|e| ConfigError::ValidationError(format!("[stream] {e}")))?;

        Ok(())
    }

    /// Session controller configuration derived from this file
    pub fn session_config(&self, device: DeviceCapabilities) -> SessionConfig {
        SessionConfig {
            probe_timeout: Duration::from_secs(self.connection.probe_timeout_seconds),
            pairing_timeout: Duration::from_secs(self.connection.pairing_timeout_seconds),
            preferences: self.stream.clone(),
            device,
        }
    }

    /// Generate a sample configuration file content
    pub fn sample_toml() -> &'static str {
        r#"# Lumen Configuration

[connection]
# Pairing-state and server-info query timeout in seconds
probe_timeout_seconds = 10
# PIN pairing timeout in seconds
pairing_timeout_seconds = 120

[stream]
resolution = "1280x720"
fps = 60
# 0 = derive from resolution and frame rate
bitrate_kbps = 0
# "auto", "h264", "hevc", "av1"
format = "auto"
hdr = false
full_range = false
# "stereo", "5.1", "7.1"
audio = "stereo"

[credentials]
# Path to the credentials database (empty = default location)
# db_path = ""

[settings]
# Path to the settings file (empty = default location)
# path = ""

[output]
# Output format: "table", "json", "quiet"
format = "table"
verbose = false

[logging]
# Log level: "error", "warn", "info", "debug", "trace"
level = "warn"
"#
    }
}

/// CLI configuration overrides
///
/// Command-line arguments take precedence over config file values.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub output_format: Option<String>,
    pub verbose: Option<bool>,
    pub debug: Option<bool>,
    pub credentials_db: Option<PathBuf>,
}

impl Config {
    /// Apply CLI overrides to configuration
    pub fn with_overrides(mut self, overrides: &CliOverrides) -> Self {
        if let Some(ref format) = overrides.output_format {
            self.output.format = format.clone();
        }
        if let Some(verbose) = overrides.verbose {
            self.output.verbose = verbose;
        }
        if let Some(true) = overrides.debug {
            self.logging.level = "debug".to_string();
        }
        if let Some(ref path) = overrides.credentials_db {
            self.credentials.db_path = Some(path.clone());
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumen_core::formats::{AudioConfig, FormatOption};
    use lumen_core::resolver::Resolution;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.connection.probe_timeout_seconds, 10);
        assert_eq!(config.connection.pairing_timeout_seconds, 120);

        assert_eq!(config.stream, StreamPreferences::default());
        assert!(config.credentials.db_path.is_none());
        assert!(config.settings.path.is_none());

        assert_eq!(config.output.format, "table");
        assert!(!config.output.verbose);
        assert_eq!(config.logging.level, "warn");
    }

    #[test]
    fn test_validate_valid_config() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_validate_invalid_output_format() {
        let mut config = Config::default();
        config.output.format = "xml".to_string();

        let result = config.validate();
        assert!(result.unwrap_err().to_string().contains("Invalid output format"));
    }

    #[test]
    fn test_validate_invalid_log_level() {
        let mut config = Config::default();
        config.logging.level = "verbose".to_string();

        let result = config.validate();
        assert!(result.unwrap_err().to_string().contains("Invalid log level"));
    }

    #[test]
    fn test_validate_zero_timeouts() {
        let mut config = Config::default();
        config.connection.probe_timeout_seconds = 0;
        assert!(config
            .validate()
            .unwrap_err()
            .to_string()
            .contains("probe_timeout_seconds"));

        let mut config = Config::default();
        config.connection.pairing_timeout_seconds = 0;
        assert!(config
            .validate()
            .unwrap_err()
            .to_string()
            .contains("pairing_timeout_seconds"));
    }

    #[test]
    fn test_validate_zero_fps() {
        let mut config = Config::default();
        config.stream.fps = 0;
        assert!(config.validate().unwrap_err().to_string().contains("[stream]"));
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");

        let mut config = Config::default();
        config.stream.resolution = Resolution::R1440;
        config.stream.format = FormatOption::Hevc;
        config.stream.audio = AudioConfig::Surround71;
        config.save(&config_path).unwrap();

        let loaded = Config::load(&config_path).unwrap();
        assert_eq!(loaded.stream, config.stream);
        assert_eq!(loaded.output.format, config.output.format);
        assert_eq!(loaded.logging.level, config.logging.level);
    }

    #[test]
    fn test_cli_overrides() {
        let overrides = CliOverrides {
            output_format: Some("json".to_string()),
            verbose: Some(true),
            debug: Some(true),
            credentials_db: Some(PathBuf::from("/tmp/creds.db")),
        };

        let config = Config::default().with_overrides(&overrides);

        assert_eq!(config.output.format, "json");
        assert!(config.output.verbose);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.credentials_path(), Some(PathBuf::from("/tmp/creds.db")));
    }

    #[test]
    fn test_debug_false_keeps_level() {
        let overrides = CliOverrides {
            debug: Some(false),
            ..Default::default()
        };
        let config = Config::default().with_overrides(&overrides);
        assert_eq!(config.logging.level, "warn");
    }

    #[test]
    fn test_toml_parsing() {
        let toml_content = r#"
[connection]
probe_timeout_seconds = 5

[stream]
resolution = "3840x2160"
fps = 120
format = "hevc"
hdr = true
audio = "5.1"

[output]
format = "json"

[logging]
level = "debug"
"#;

        let config: Config = toml::from_str(toml_content).unwrap();

        assert_eq!(config.connection.probe_timeout_seconds, 5);
        assert_eq!(config.connection.pairing_timeout_seconds, 120);
        assert_eq!(config.stream.resolution, Resolution::R2160);
        assert_eq!(config.stream.fps, 120);
        assert_eq!(config.stream.format, FormatOption::Hevc);
        assert!(config.stream.hdr);
        assert!(!config.stream.full_range);
        assert_eq!(config.stream.audio, AudioConfig::Surround51);
        assert_eq!(config.output.format, "json");
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_bad_resolution_is_a_parse_error() {
        let result: Result<Config, _> = toml::from_str("[stream]\nresolution = \"wide\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_sample_toml_is_valid() {
        let config: Config = toml::from_str(Config::sample_toml()).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.stream, StreamPreferences::default());
    }

    #[test]
    fn test_session_config_uses_timeouts() {
        let mut config = Config::default();
        config.connection.probe_timeout_seconds = 3;
        config.stream.hdr = true;

        let session = config.session_config(DeviceCapabilities::default());
        assert_eq!(session.probe_timeout, Duration::from_secs(3));
        assert_eq!(session.pairing_timeout, Duration::from_secs(120));
        assert!(session.preferences.hdr);
    }

    #[test]
    fn test_load_from_custom_path() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("custom.toml");

        Config::default().save(&config_path).unwrap();

        let loaded = Config::load_from(Some(&config_path)).unwrap();
        assert_eq!(loaded.connection.probe_timeout_seconds, 10);
    }

    #[test]
    fn test_load_rejects_invalid_values() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("bad.toml");
        std::fs::write(&config_path, "[logging]\nlevel = \"loud\"\n").unwrap();

        assert!(matches!(
            Config::load(&config_path),
            Err(ConfigError::ValidationError(_))
        ));
    }
}
