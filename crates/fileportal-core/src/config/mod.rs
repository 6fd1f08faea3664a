//! Configuration management for FilePortal.
//!
//! ## Configuration File Locations
//!
//! | Platform | Path |
//! |----------|------|
//! | Linux | `~/.config/fileportal/config.toml` |
//! | macOS | `~/Library/Application Support/com.fileportal.FilePortal/config.toml` |
//! | Windows | `%APPDATA%\fileportal\FilePortal\config\config.toml` |
//!
//! A missing file means defaults. Sections missing from the file are filled
//! in with their defaults too.
//!
//! ## Example
//!
//! ```rust,ignore
//! use fileportal_core::config::Config;
//!
//! let config = Config::load()?;
//! println!("Chunk size: {}", config.transfer.chunk_size);
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::channel::tcp::LinkOptions;
use crate::error::{Error, Result};

/// Main configuration struct for FilePortal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Transfer settings
    pub transfer: TransferConfig,
    /// Network settings
    pub network: NetworkConfig,
    /// Receiving settings
    pub receive: ReceiveConfig,
}

/// Transfer configuration options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Maximum bytes per chunk
    pub chunk_size: usize,
    /// Number of transfer channels (the metadata channel is extra)
    pub channel_count: u32,
    /// Bound of each channel's outgoing queue
    pub queue_depth: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: crate::DEFAULT_CHUNK_SIZE,
            channel_count: u32::from(crate::DEFAULT_CHANNEL_COUNT),
            queue_depth: crate::DEFAULT_QUEUE_DEPTH,
        }
    }
}

impl TransferConfig {
    /// Channel count as a label range bound.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the count is zero or does not fit
    /// a channel label.
    pub fn transfer_count(&self) -> Result<u16> {
        match u16::try_from(self.channel_count) {
            Ok(n) if n > 0 => Ok(n),
            _ => Err(Error::InvalidConfig {
                key: "transfer.channel_count".to_string(),
                reason: format!("must be between 1 and {}", u16::MAX),
            }),
        }
    }
}

/// Network configuration options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// TCP port `host` listens on
    pub port: u16,
    /// Time allowed for each connection of a link once it has started
    #[serde(with = "humantime_serde")]
    pub handshake_timeout: Duration,
    /// Enable TCP keep-alive on channel connections
    pub keepalive: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            port: crate::DEFAULT_PORT,
            handshake_timeout: Duration::from_secs(10),
            keepalive: true,
        }
    }
}

/// Receiving configuration options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiveConfig {
    /// Where received files are written (current directory if unset)
    pub output_dir: Option<PathBuf>,
    /// Accept incoming files without asking
    pub auto_accept: bool,
}

impl Config {
    /// Load configuration from the default location.
    ///
    /// If the configuration file doesn't exist, returns the default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Load configuration from `path`, falling back to defaults if it is absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigError(format!("Failed to read config: {e}")))?;

        toml::from_str(&content)
            .map_err(|e| Error::ConfigError(format!("Failed to parse config: {e}")))
    }

    /// Save configuration to the default location.
    ///
    /// Creates the configuration directory if it doesn't exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be written.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path())
    }

    /// Save configuration to `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be written.
    pub fn save_to(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::ConfigError(format!("Failed to create config directory: {e}"))
            })?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| Error::ConfigError(format!("Failed to write config: {e}")))
    }

    /// Check values that serde cannot.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] naming the first offending key.
    pub fn validate(&self) -> Result<()> {
        let invalid = |key: &str, reason: String| Error::InvalidConfig {
            key: key.to_string(),
            reason,
        };

        if self.transfer.chunk_size == 0 || self.transfer.chunk_size > crate::MAX_CHUNK_SIZE {
            return Err(invalid(
                "transfer.chunk_size",
                format!("must be between 1 and {}", crate::MAX_CHUNK_SIZE),
            ));
        }
        self.transfer.transfer_count()?;
        if self.transfer.queue_depth == 0 {
            return Err(invalid(
                "transfer.queue_depth",
                "must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// TCP link options derived from this configuration.
    #[must_use]
    pub fn link_options(&self) -> LinkOptions {
        LinkOptions {
            queue_depth: self.transfer.queue_depth,
            handshake_timeout: self.network.handshake_timeout,
            keepalive: self.network.keepalive,
        }
    }

    /// Get the default configuration directory path.
    #[must_use]
    pub fn config_dir() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "fileportal", "FilePortal")
            .map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the full path to the configuration file.
    #[must_use]
    pub fn config_path() -> PathBuf {
        Self::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("config.toml")
    }
}

mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}s", duration.as_secs()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.strip_suffix('s')
            .map(|secs| {
                secs.parse()
                    .map(Duration::from_secs)
                    .map_err(serde::de::Error::custom)
            })
            .or_else(|| {
                s.strip_suffix('m').map(|mins| {
                    mins.parse::<u64>()
                        .map(|m| Duration::from_secs(m * 60))
                        .map_err(serde::de::Error::custom)
                })
            })
            .unwrap_or_else(|| Err(serde::de::Error::custom("invalid duration format")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_config_default() {
        let config = Config::default();

        assert_eq!(config.transfer.chunk_size, 262_144);
        assert_eq!(config.transfer.channel_count, 511);
        assert_eq!(config.network.port, crate::DEFAULT_PORT);
        assert_eq!(config.network.handshake_timeout, Duration::from_secs(10));
        assert!(!config.receive.auto_accept);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_roundtrip() {
        let temp_dir = TempDir::new().expect("temp dir");
        let path = temp_dir.path().join("nested").join("config.toml");

        let mut original = Config::default();
        original.transfer.channel_count = 16;
        original.network.port = 12345;
        original.receive.output_dir = Some(PathBuf::from("/tmp/incoming"));

        original.save_to(&path).expect("save");
        let loaded = Config::load_from(&path).expect("load");

        assert_eq!(loaded, original);
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let temp_dir = TempDir::new().expect("temp dir");
        let loaded = Config::load_from(&temp_dir.path().join("absent.toml")).expect("load");
        assert_eq!(loaded, Config::default());
    }

    #[test]
    fn test_config_deserialization_partial() {
        let partial_toml = r#"
[network]
port = 9999
handshake_timeout = "2m"
"#;

        let config: Config = toml::from_str(partial_toml).expect("parse partial config");

        assert_eq!(config.network.port, 9999);
        assert_eq!(config.network.handshake_timeout, Duration::from_secs(120));
        assert!(config.network.keepalive);
        assert_eq!(config.transfer.chunk_size, crate::DEFAULT_CHUNK_SIZE);
    }

    #[test]
    fn test_invalid_duration_rejected() {
        let bad = "[network]\nhandshake_timeout = \"soon\"\n";
        assert!(toml::from_str::<Config>(bad).is_err());
    }

    #[test]
    fn test_humantime_duration_serialization() {
        let toml_str = toml::to_string_pretty(&Config::default()).expect("serialize");
        assert!(toml_str.contains("handshake_timeout = \"10s\""));
        assert!(toml_str.contains("[transfer]"));
        assert!(toml_str.contains("[receive]"));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.transfer.chunk_size = 0;
        assert!(matches!(
            config.validate(),
            Err(Error::InvalidConfig { key, .. }) if key == "transfer.chunk_size"
        ));

        let mut config = Config::default();
        config.transfer.chunk_size = crate::MAX_CHUNK_SIZE + 1;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.transfer.channel_count = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.transfer.channel_count = 70_000;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.transfer.queue_depth = 0;
        assert!(matches!(
            config.validate(),
            Err(Error::InvalidConfig { key, .. }) if key == "transfer.queue_depth"
        ));
    }

    #[test]
    fn test_link_options() {
        let mut config = Config::default();
        config.network.keepalive = false;
        config.transfer.queue_depth = 8;

        let options = config.link_options();
        assert_eq!(options.queue_depth, 8);
        assert!(!options.keepalive);
        assert_eq!(options.handshake_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_config_path() {
        assert!(Config::config_path().ends_with("config.toml"));
    }
}
