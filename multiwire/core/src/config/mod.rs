//! TOML Configuration File Support
//!
//! Loads transport settings from `multiwire.toml`, by default at
//! `$XDG_CONFIG_HOME/multiwire/multiwire.toml`.
//!
//! # Configuration Priority
//!
//! Highest first:
//! 1. Environment variables (`MULTIWIRE_*`)
//! 2. TOML configuration file
//! 3. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [transport]
//! connect_timeout_ms = 5000
//! reconnect_delay_ms = 3000
//! replay_buffer_capacity = 500
//! global_rate_limit = 2000
//! all_idle_ms = 60000
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::transport::config::TransportConfig;
use crate::transport::frame::FRAME_HEADER_SIZE;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Where the loaded values came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Nothing overrode the defaults
    Defaults,
    /// A config file and no environment overrides
    File,
    /// Environment overrides and no config file
    Environment,
    /// A config file with environment overrides on top
    FileAndEnvironment,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Defaults => write!(f, "defaults"),
            Self::File => write!(f, "config file"),
            Self::Environment => write!(f, "environment"),
            Self::FileAndEnvironment => write!(f, "config file + environment"),
        }
    }
}

// =============================================================================
// Loaded Configuration
// =============================================================================

/// Top-level layout of `multiwire.toml`
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MultiwireToml {
    /// `[transport]` table; missing keys keep their defaults
    pub transport: TransportConfig,
}

/// Configuration after every source has been applied
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoadedConfig {
    /// Effective transport settings
    pub transport: TransportConfig,
    /// Path of the file that was read, if any
    pub config_file_path: Option<PathBuf>,
    /// Which sources contributed
    pub source: ConfigSource,
}

/// Default configuration file path
///
/// `$XDG_CONFIG_HOME/multiwire/multiwire.toml`, or the platform equivalent.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("multiwire").join("multiwire.toml"))
}

/// Load configuration from the default path, the environment and defaults
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be read, parsed or
/// validated. A missing file is not an error.
pub fn load_config() -> Result<LoadedConfig, ConfigError> {
    load_config_from_path(default_config_path().as_deref())
}

/// Load configuration from a specific path
///
/// With `None`, only defaults and environment variables are used.
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be read, parsed or
/// validated.
pub fn load_config_from_path(path: Option<&Path>) -> Result<LoadedConfig, ConfigError> {
    let mut transport = TransportConfig::default();
    let mut config_file_path = None;

    if let Some(config_path) = path {
        if config_path.exists() {
            let content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.to_path_buf(),
                    source: e,
                })?;
            transport = parse_toml(&content)?.transport;
            config_file_path = Some(config_path.to_path_buf());
            tracing::info!(path = %config_path.display(), "Loaded configuration from file");
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    let overridden = transport.apply_env();
    validate(&transport)?;

    let source = match (config_file_path.is_some(), overridden > 0) {
        (false, false) => ConfigSource::Defaults,
        (true, false) => ConfigSource::File,
        (false, true) => ConfigSource::Environment,
        (true, true) => ConfigSource::FileAndEnvironment,
    };
    tracing::debug!(%source, overridden, "Configuration resolved");

    Ok(LoadedConfig {
        transport,
        config_file_path,
        source,
    })
}

/// Parse the contents of a `multiwire.toml`
///
/// # Errors
///
/// Returns [`ConfigError::ParseError`] for malformed TOML or mistyped keys.
pub fn parse_toml(content: &str) -> Result<MultiwireToml, ConfigError> {
    Ok(toml::from_str(content)?)
}

/// Reject settings no carrier can run with
///
/// # Errors
///
/// Returns [`ConfigError::ValidationError`] naming the offending key.
pub fn validate(config: &TransportConfig) -> Result<(), ConfigError> {
    if config.connect_timeout_ms == 0 {
        return Err(ConfigError::ValidationError(
            "connect_timeout_ms must be greater than 0".to_string(),
        ));
    }
    if config.max_frame_size <= FRAME_HEADER_SIZE {
        return Err(ConfigError::ValidationError(format!(
            "max_frame_size must exceed the {FRAME_HEADER_SIZE}-byte frame header"
        )));
    }
    if config.max_connections == 0 {
        return Err(ConfigError::ValidationError(
            "max_connections must be greater than 0".to_string(),
        ));
    }
    if config.replay_buffer_capacity == 0 {
        return Err(ConfigError::ValidationError(
            "replay_buffer_capacity must be greater than 0".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_default_path_ends_with_multiwire_toml() {
        if let Some(path) = default_config_path() {
            assert!(path.ends_with("multiwire/multiwire.toml"));
        }
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = load_config_from_path(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(loaded.config_file_path, None);
        assert_eq!(loaded.transport.replay_buffer_capacity, 500);
    }

    #[test]
    fn test_file_values_override_defaults() {
        let file = write_config(
            r#"
            [transport]
            connect_timeout_ms = 5000
            reconnect_delay_ms = 250
            global_rate_limit = 10
            "#,
        );
        let loaded = load_config_from_path(Some(file.path())).unwrap();

        assert_eq!(loaded.config_file_path.as_deref(), Some(file.path()));
        assert!(matches!(
            loaded.source,
            ConfigSource::File | ConfigSource::FileAndEnvironment
        ));
        assert_eq!(loaded.transport.connect_timeout_ms, 5000);
        assert_eq!(loaded.transport.reconnect_delay_ms, 250);
        assert_eq!(loaded.transport.global_rate_limit, 10);
        assert_eq!(loaded.transport.max_connections, 1_024);
    }

    #[test]
    fn test_empty_file_parses() {
        assert_eq!(parse_toml("").unwrap(), MultiwireToml::default());
    }

    #[test]
    fn test_malformed_toml_is_parse_error() {
        let file = write_config("[transport]\nconnect_timeout_ms = \"soon\"\n");
        let err = load_config_from_path(Some(file.path())).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)), "{err}");
    }

    #[test]
    fn test_zero_max_connections_rejected() {
        let file = write_config("[transport]\nmax_connections = 0\n");
        let err = load_config_from_path(Some(file.path())).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)), "{err}");
        assert!(err.to_string().contains("max_connections"));
    }

    #[test]
    fn test_zero_replay_buffer_capacity_rejected() {
        let file = write_config("[transport]\nreplay_buffer_capacity = 0\n");
        let err = load_config_from_path(Some(file.path())).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)), "{err}");
        assert!(err.to_string().contains("replay_buffer_capacity"));
    }

    #[test]
    fn test_validate_frame_size() {
        let config = TransportConfig {
            max_frame_size: FRAME_HEADER_SIZE,
            ..TransportConfig::default()
        };
        assert!(validate(&config).is_err());
        assert!(validate(&TransportConfig::strict()).is_ok());
    }

    #[test]
    fn test_environment_overrides_file() {
        // Only this test touches MULTIWIRE_COMPRESSION
        let file = write_config("[transport]\ncompression = false\n");
        std::env::set_var("MULTIWIRE_COMPRESSION", "true");
        let loaded = load_config_from_path(Some(file.path()));
        std::env::remove_var("MULTIWIRE_COMPRESSION");

        let loaded = loaded.unwrap();
        assert!(loaded.transport.compression);
        assert_eq!(loaded.source, ConfigSource::FileAndEnvironment);
    }

    #[test]
    fn test_source_display() {
        assert_eq!(ConfigSource::FileAndEnvironment.to_string(), "config file + environment");
        assert_eq!(ConfigSource::Defaults.to_string(), "defaults");
    }
}
