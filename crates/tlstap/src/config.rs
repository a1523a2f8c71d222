//! Configuration for tlstap
//!
//! Provides:
//! - Config file discovery (CLI flag, env var, standard paths)
//! - TOML parsing with serde
//! - Environment variable overrides
//! - Validation of the capacities fixed at load time

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tlstap_common::{CapturedEvent, DEFAULT_CHANNEL_BYTES, DEFAULT_STORE_CAPACITY};
use tracing::{debug, info, warn};

/// Page size the kernel ring buffer must be a multiple of
const PAGE_SIZE: u32 = 4096;

/// Upper bound on in-flight calls tracked at once
pub const MAX_STORE_CAPACITY: u32 = 1 << 20;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Complete tlstap configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TapConfig {
    /// Log level: trace, debug, info, warn, error
    pub log_level: String,

    /// Capture settings
    pub capture: CaptureSettings,
}

impl Default for TapConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            capture: CaptureSettings::default(),
        }
    }
}

/// Capture settings, all fixed once the program is loaded
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    /// Path to the eBPF object (auto-detected if not specified)
    pub ebpf_path: Option<PathBuf>,

    /// Path to libssl.so (auto-detected if not specified)
    pub libssl_path: Option<PathBuf>,

    /// Only attach to this PID (None = all processes)
    pub pid: Option<u32>,

    /// Maximum in-flight calls held by the correlation store
    pub store_capacity: u32,

    /// Byte size of the event ring buffer (power of two, page multiple)
    pub channel_bytes: u32,

    /// Consumer poll interval in milliseconds
    pub poll_interval_ms: u64,

    /// Capacity of the userspace queue between the poller and the renderer
    pub queue_capacity: usize,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            ebpf_path: None,
            libssl_path: None,
            pid: None,
            store_capacity: DEFAULT_STORE_CAPACITY,
            channel_bytes: DEFAULT_CHANNEL_BYTES,
            poll_interval_ms: 10,
            queue_capacity: 1024,
        }
    }
}

impl CaptureSettings {
    /// Check the capacities that become immutable once the program is loaded
    pub fn validate(&self) -> ConfigResult<()> {
        if self.store_capacity == 0 || self.store_capacity > MAX_STORE_CAPACITY {
            return Err(ConfigError::ValidationError(format!(
                "store_capacity must be in 1..={}, got {}",
                MAX_STORE_CAPACITY, self.store_capacity
            )));
        }

        if !self.channel_bytes.is_power_of_two() || self.channel_bytes % PAGE_SIZE != 0 {
            return Err(ConfigError::ValidationError(format!(
                "channel_bytes must be a power of two and a multiple of {}, got {}",
                PAGE_SIZE, self.channel_bytes
            )));
        }

        // Each ring record carries an 8 byte header in front of the event
        let min_bytes = 2 * (CapturedEvent::SIZE as u32 + 8);
        if self.channel_bytes < min_bytes {
            return Err(ConfigError::ValidationError(format!(
                "channel_bytes must hold at least two records ({} bytes), got {}",
                min_bytes, self.channel_bytes
            )));
        }

        if self.poll_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "poll_interval_ms cannot be 0".to_string(),
            ));
        }

        if self.queue_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "queue_capacity cannot be 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Number of whole records the configured ring can hold at once
    pub fn channel_records(&self) -> u32 {
        self.channel_bytes / (CapturedEvent::SIZE as u32 + 8)
    }
}

/// Configuration loader
#[derive(Default)]
pub struct ConfigLoader {
    /// Path to config file (if specified via CLI)
    cli_path: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new config loader
    pub fn new() -> Self {
        Self { cli_path: None }
    }

    /// Set the config path from CLI argument
    pub fn with_cli_path(mut self, path: Option<PathBuf>) -> Self {
        self.cli_path = path;
        self
    }

    /// Load configuration with the following precedence:
    /// 1. CLI --config flag
    /// 2. TLSTAP_CONFIG environment variable
    /// 3. ~/.config/tlstap/config.toml
    /// 4. /etc/tlstap/config.toml
    /// 5. Default values
    ///
    /// Environment overrides are applied on top, then the result is validated.
    pub fn load(&self) -> ConfigResult<TapConfig> {
        let mut config = match self.find_config_file()? {
            Some(path) => {
                info!("Loading configuration from: {}", path.display());
                Self::load_from_file(&path)?
            }
            None => {
                debug!("No config file found, using defaults");
                TapConfig::default()
            }
        };

        Self::apply_env_overrides(&mut config);
        Self::validate(&config)?;

        Ok(config)
    }

    /// Find the config file to use
    fn find_config_file(&self) -> ConfigResult<Option<PathBuf>> {
        // An explicit path that does not exist is an error, not a fallback
        if let Some(path) = &self.cli_path {
            if path.exists() {
                return Ok(Some(path.clone()));
            }
            return Err(ConfigError::NotFound(path.clone()));
        }

        if let Ok(env_path) = std::env::var("TLSTAP_CONFIG") {
            let path = PathBuf::from(&env_path);
            if path.exists() {
                return Ok(Some(path));
            }
            warn!("TLSTAP_CONFIG path does not exist: {}", env_path);
        }

        if let Some(config_dir) = dirs::config_dir() {
            let path = config_dir.join("tlstap").join("config.toml");
            if path.exists() {
                return Ok(Some(path));
            }
        }

        let path = PathBuf::from("/etc/tlstap/config.toml");
        if path.exists() {
            return Ok(Some(path));
        }

        Ok(None)
    }

    /// Load configuration from a TOML file
    pub fn load_from_file(path: &Path) -> ConfigResult<TapConfig> {
        let content = std::fs::read_to_string(path)?;
        let config: TapConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(config: &mut TapConfig) {
        if let Ok(val) = std::env::var("TLSTAP_LOG_LEVEL") {
            config.log_level = val;
        }
        if let Ok(val) = std::env::var("TLSTAP_EBPF_PATH") {
            config.capture.ebpf_path = Some(PathBuf::from(val));
        }
        if let Ok(val) = std::env::var("TLSTAP_LIBSSL_PATH") {
            config.capture.libssl_path = Some(PathBuf::from(val));
        }
        if let Ok(val) = std::env::var("TLSTAP_STORE_CAPACITY") {
            match val.parse() {
                Ok(capacity) => config.capture.store_capacity = capacity,
                Err(_) => warn!("Ignoring invalid TLSTAP_STORE_CAPACITY: {}", val),
            }
        }
        if let Ok(val) = std::env::var("TLSTAP_CHANNEL_BYTES") {
            match val.parse() {
                Ok(bytes) => config.capture.channel_bytes = bytes,
                Err(_) => warn!("Ignoring invalid TLSTAP_CHANNEL_BYTES: {}", val),
            }
        }
    }

    /// Validate configuration
    pub fn validate(config: &TapConfig) -> ConfigResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&config.log_level.to_lowercase().as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log level: {}. Must be one of: {:?}",
                config.log_level, valid_levels
            )));
        }

        config.capture.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = TapConfig::default();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.capture.store_capacity, 1024);
        assert_eq!(config.capture.channel_bytes, 256 * 1024);
        assert!(config.capture.pid.is_none());
        assert!(ConfigLoader::validate(&config).is_ok());
    }

    #[test]
    fn test_parse_minimal_toml() {
        let toml_str = r#"
            log_level = "debug"
        "#;
        let config: TapConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.log_level, "debug");
        // Other fields should be default
        assert_eq!(config.capture.store_capacity, DEFAULT_STORE_CAPACITY);
    }

    #[test]
    fn test_parse_full_toml() {
        let toml_str = r#"
            log_level = "trace"

            [capture]
            ebpf_path = "/usr/lib/tlstap/tlstap-ebpf"
            libssl_path = "/usr/lib/x86_64-linux-gnu/libssl.so.3"
            pid = 4242
            store_capacity = 4096
            channel_bytes = 1048576
            poll_interval_ms = 5
        "#;

        let config: TapConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.log_level, "trace");
        assert_eq!(
            config.capture.ebpf_path,
            Some(PathBuf::from("/usr/lib/tlstap/tlstap-ebpf"))
        );
        assert_eq!(config.capture.pid, Some(4242));
        assert_eq!(config.capture.store_capacity, 4096);
        assert_eq!(config.capture.channel_bytes, 1 << 20);
        assert_eq!(config.capture.poll_interval_ms, 5);
        assert!(ConfigLoader::validate(&config).is_ok());
    }

    #[test]
    fn test_rejects_zero_store_capacity() {
        let settings = CaptureSettings {
            store_capacity: 0,
            ..Default::default()
        };
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn test_rejects_odd_channel_size() {
        let settings = CaptureSettings {
            channel_bytes: 300_000,
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_rejects_channel_smaller_than_two_records() {
        let settings = CaptureSettings {
            channel_bytes: 8192,
            ..Default::default()
        };
        assert!(settings.validate().is_err());

        let settings = CaptureSettings {
            channel_bytes: 16384,
            ..Default::default()
        };
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_rejects_unknown_log_level() {
        let config = TapConfig {
            log_level: "chatty".to_string(),
            ..Default::default()
        };
        assert!(ConfigLoader::validate(&config).is_err());
    }

    #[test]
    fn test_channel_records() {
        let settings = CaptureSettings::default();
        assert_eq!(settings.channel_records(), 262144 / 4160);
    }

    #[test]
    fn test_load_from_cli_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[capture]\nstore_capacity = 64").unwrap();

        let config = ConfigLoader::new()
            .with_cli_path(Some(file.path().to_path_buf()))
            .load()
            .unwrap();
        assert_eq!(config.capture.store_capacity, 64);
    }

    #[test]
    fn test_missing_cli_path_is_an_error() {
        let result = ConfigLoader::new()
            .with_cli_path(Some(PathBuf::from("/nonexistent/tlstap.toml")))
            .load();
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn test_invalid_file_fails_validation() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[capture]\nchannel_bytes = 1000").unwrap();

        let result = ConfigLoader::new()
            .with_cli_path(Some(file.path().to_path_buf()))
            .load();
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_env_config_path_falls_back_when_missing() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "log_level = \"warn\"").unwrap();

        std::env::set_var("TLSTAP_CONFIG", file.path());
        let found = ConfigLoader::new().find_config_file().unwrap();
        assert_eq!(found.as_deref(), Some(file.path()));

        // A stale variable is not fatal, unlike a bad --config
        std::env::set_var("TLSTAP_CONFIG", "/nonexistent/tlstap.toml");
        let found = ConfigLoader::new().find_config_file();
        std::env::remove_var("TLSTAP_CONFIG");

        let found = found.unwrap();
        assert_ne!(found, Some(PathBuf::from("/nonexistent/tlstap.toml")));
    }
}
