//! # Configuration Management
//!
//! Centralized configuration for the peer communication core.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - Direct instantiation with defaults
//! - Environment-variable overrides via `from_env()`
//!
//! Validation is a two-step affair: `validate()` collects every problem
//! as a string, `validate_strict()` turns a non-empty list into an
//! error.

use crate::error::{PeermuxError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::Level;

/// Max allowed frame length (16 MB). Anything larger on the wire is a
/// protocol violation.
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Default RSA modulus size for generated server identities.
pub const DEFAULT_IDENTITY_BITS: usize = 2048;

/// Main configuration structure containing all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct NetworkConfig {
    /// Server-specific configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Client-specific configuration
    #[serde(default)]
    pub client: ClientConfig,

    /// Transport configuration
    #[serde(default)]
    pub transport: TransportConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl NetworkConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| PeermuxError::ConfigError(format!("Failed to read config file: {e}")))?;
        Self::from_toml(&contents)
    }

    /// Load configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| PeermuxError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("PEERMUX_SERVER_ADDRESS") {
            config.server.address = addr;
        }

        if let Ok(addr) = std::env::var("PEERMUX_CLIENT_ADDRESS") {
            config.client.address = addr;
        }

        if let Ok(bits) = std::env::var("PEERMUX_IDENTITY_BITS") {
            if let Ok(val) = bits.parse::<usize>() {
                config.server.identity_bits = val;
            }
        }

        if let Ok(len) = std::env::var("PEERMUX_MAX_FRAME_LEN") {
            if let Ok(val) = len.parse::<usize>() {
                config.transport.max_frame_len = val;
            }
        }

        Ok(config)
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Validate the configuration for common misconfigurations.
    ///
    /// Returns a list of validation errors. Empty list means the
    /// configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.server.validate());
        errors.extend(self.client.validate());
        errors.extend(self.transport.validate());
        errors.extend(self.logging.validate());
        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(PeermuxError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

/// Server-specific configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Server listen address (e.g., "127.0.0.1:9000"; port 0 binds an
    /// ephemeral port)
    pub address: String,

    /// RSA modulus size for the generated identity
    pub identity_bits: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: String::from("127.0.0.1:0"),
            identity_bits: DEFAULT_IDENTITY_BITS,
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.address.is_empty() {
            errors.push("Server address cannot be empty".to_string());
        } else if self.address.parse::<std::net::SocketAddr>().is_err() {
            errors.push(format!(
                "Invalid server address format: '{}' (expected format: '0.0.0.0:8080')",
                self.address
            ));
        }

        if self.identity_bits < 2048 {
            errors.push(format!(
                "Identity modulus too small: {} bits (minimum: 2048)",
                self.identity_bits
            ));
        } else if self.identity_bits > 8192 {
            errors.push(format!(
                "Identity modulus too large: {} bits (maximum: 8192)",
                self.identity_bits
            ));
        }

        errors
    }
}

/// Client-specific configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    /// Target server address
    pub address: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: String::from("127.0.0.1:9000"),
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.address.is_empty() {
            errors.push("Client address cannot be empty".to_string());
        } else if self.address.parse::<std::net::SocketAddr>().is_err() {
            errors.push(format!(
                "Invalid client address format: '{}' (expected format: 'example.com:8080')",
                self.address
            ));
        }

        errors
    }
}

/// Transport configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransportConfig {
    /// Maximum allowed frame length in bytes
    pub max_frame_len: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

impl TransportConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.max_frame_len == 0 {
            errors.push("Max frame length cannot be 0".to_string());
        } else if self.max_frame_len < 1024 {
            errors.push("Max frame length too small (minimum: 1 KB)".to_string());
        } else if self.max_frame_len > 100 * 1024 * 1024 {
            errors.push(format!(
                "Max frame length too large: {} bytes (maximum recommended: 100 MB)",
                self.max_frame_len
            ));
        }

        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Log level
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("peermux"),
            log_level: Level::INFO,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        } else if self.app_name.len() > 64 {
            errors.push(format!(
                "Application name too long: {} characters (maximum: 64)",
                self.app_name.len()
            ));
        }

        errors
    }
}

/// Helper module for tracing::Level serialization/deserialization
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let level_str = match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        };
        level_str.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(NetworkConfig::default().validate().is_empty());
    }

    #[test]
    fn toml_roundtrip() {
        let toml = r#"
            [server]
            address = "0.0.0.0:7777"
            identity_bits = 2048

            [transport]
            max_frame_len = 1048576

            [logging]
            app_name = "replication-node"
            log_level = "debug"
            json_format = true
        "#;
        let config = NetworkConfig::from_toml(toml).unwrap();
        assert_eq!(config.server.address, "0.0.0.0:7777");
        assert_eq!(config.transport.max_frame_len, 1_048_576);
        assert_eq!(config.logging.log_level, Level::DEBUG);
        assert!(config.validate().is_empty());
    }

    #[test]
    fn bad_address_reported() {
        let config = NetworkConfig::default_with_overrides(|c| {
            c.server.address = "not-an-address".to_string();
        });
        let errors = config.validate();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("Invalid server address"));
        assert!(config.validate_strict().is_err());
    }

    #[test]
    fn weak_identity_reported() {
        let config = NetworkConfig::default_with_overrides(|c| {
            c.server.identity_bits = 512;
        });
        assert!(config
            .validate()
            .iter()
            .any(|e| e.contains("Identity modulus too small")));
    }

    #[test]
    fn tiny_frame_limit_reported() {
        let config = NetworkConfig::default_with_overrides(|c| {
            c.transport.max_frame_len = 16;
        });
        assert!(config
            .validate()
            .iter()
            .any(|e| e.contains("Max frame length too small")));
    }
}
