//! # Configuration Management
//!
//! Centralized configuration for the OPC UA server core.
//!
//! This module provides structured configuration for the server: endpoint
//! URL, transport-handshake parameters, secure-channel security settings,
//! and the application description served by the discovery handlers.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - Direct instantiation with defaults
//! - Environment-variable overrides via `from_env()`
//!
//! Configuration is an explicit, immutable struct: every tunable is a named
//! field, assembled before serving begins and never mutated afterwards.

use crate::error::{Result, UaError};
use crate::security::SecurityMode;
use crate::utils::timeout;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// UACP protocol version spoken by this implementation.
pub const PROTOCOL_VERSION: u32 = 0;

/// Default receive buffer size proposed during the transport handshake.
pub const DEFAULT_RECEIVE_BUFFER_SIZE: u32 = 0xFFFF;

/// Default send buffer size proposed during the transport handshake.
pub const DEFAULT_SEND_BUFFER_SIZE: u32 = 0xFFFF;

/// Default maximum size of a reassembled message.
pub const DEFAULT_MAX_MESSAGE_SIZE: u32 = 1 << 16;

/// Default maximum number of chunks a single message may span.
pub const DEFAULT_MAX_CHUNK_COUNT: u32 = 256;

/// Default OPC UA TCP port.
pub const DEFAULT_PORT: u16 = 4840;

/// Default security-token lifetime.
pub const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(3600);

/// Top-level server configuration. Immutable once the server starts serving.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Endpoint URL the server binds to, e.g. `opc.tcp://0.0.0.0:4840/plant`.
    pub endpoint_url: String,

    /// Transport-handshake parameters proposed to peers
    #[serde(default)]
    pub transport: TransportConfig,

    /// Secure-channel security settings
    #[serde(default)]
    pub security: SecurityConfig,

    /// Application description returned by the discovery services
    #[serde(default)]
    pub application: ApplicationConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            endpoint_url: format!("opc.tcp://127.0.0.1:{DEFAULT_PORT}"),
            transport: TransportConfig::default(),
            security: SecurityConfig::default(),
            application: ApplicationConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Configuration with defaults for the given endpoint URL.
    pub fn new(endpoint_url: impl Into<String>) -> Self {
        Self {
            endpoint_url: endpoint_url.into(),
            ..Self::default()
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| UaError::Config(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| UaError::Config(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| UaError::Config(format!("Failed to parse TOML: {e}")))
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("OPCUA_ENDPOINT_URL") {
            config.endpoint_url = url;
        }

        if let Ok(size) = std::env::var("OPCUA_MAX_MESSAGE_SIZE") {
            if let Ok(val) = size.parse::<u32>() {
                config.transport.max_message_size = val;
            }
        }

        if let Ok(count) = std::env::var("OPCUA_MAX_CHUNK_COUNT") {
            if let Ok(val) = count.parse::<u32>() {
                config.transport.max_chunk_count = val;
            }
        }

        if let Ok(lifetime) = std::env::var("OPCUA_TOKEN_LIFETIME_MS") {
            if let Ok(val) = lifetime.parse::<u64>() {
                config.security.token_lifetime = Duration::from_millis(val);
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

    /// Validate the configuration for common issues and misconfigurations.
    ///
    /// Returns a list of validation errors. Empty list means the
    /// configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.endpoint_url.is_empty() {
            errors.push("Endpoint URL cannot be empty".to_string());
        } else if crate::transport::uri::EndpointUrl::parse(&self.endpoint_url).is_err() {
            errors.push(format!(
                "Invalid endpoint URL: '{}' (expected format: 'opc.tcp://host:port[/name]')",
                self.endpoint_url
            ));
        }

        errors.extend(self.transport.validate());
        errors.extend(self.security.validate());
        errors.extend(self.application.validate());
        errors.extend(self.logging.validate());

        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(UaError::Config(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

/// Transport-handshake parameters proposed to each connecting peer.
///
/// The effective per-connection limits are the field-wise minimum of the two
/// sides' proposals (see `protocol::handshake`).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransportConfig {
    /// Receive buffer size in bytes
    pub receive_buffer_size: u32,

    /// Send buffer size in bytes
    pub send_buffer_size: u32,

    /// Maximum size of a reassembled message in bytes
    pub max_message_size: u32,

    /// Maximum number of chunks a message may span
    pub max_chunk_count: u32,

    /// Time allowed for the Hello/Acknowledge exchange before the raw
    /// connection is dropped
    #[serde(with = "duration_serde")]
    pub handshake_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            receive_buffer_size: DEFAULT_RECEIVE_BUFFER_SIZE,
            send_buffer_size: DEFAULT_SEND_BUFFER_SIZE,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_chunk_count: DEFAULT_MAX_CHUNK_COUNT,
            handshake_timeout: timeout::HANDSHAKE_TIMEOUT,
        }
    }
}

impl TransportConfig {
    /// Validate transport configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.receive_buffer_size < 8192 {
            errors.push("Receive buffer size too small (minimum: 8192 bytes)".to_string());
        }

        if self.send_buffer_size < 8192 {
            errors.push("Send buffer size too small (minimum: 8192 bytes)".to_string());
        }

        if self.max_message_size < self.receive_buffer_size {
            errors.push(
                "Max message size cannot be smaller than the receive buffer size".to_string(),
            );
        }

        if self.max_chunk_count == 0 {
            errors.push("Max chunk count must be greater than 0".to_string());
        }

        if self.handshake_timeout.as_millis() < 100 {
            errors.push("Handshake timeout too short (minimum: 100ms)".to_string());
        } else if self.handshake_timeout.as_secs() > 60 {
            errors.push("Handshake timeout too long (maximum: 60s)".to_string());
        }

        errors
    }
}

/// Secure-channel security settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SecurityConfig {
    /// Message security mode offered on the endpoint
    pub mode: SecurityMode,

    /// URI of the security policy the server accepts
    pub policy_uri: String,

    /// Hex-encoded 32-byte pre-shared key for the symmetric policy.
    /// Required when `mode` is not `None`.
    pub secret_key: Option<String>,

    /// Lifetime of each issued security token
    #[serde(with = "duration_serde")]
    pub token_lifetime: Duration,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            mode: SecurityMode::None,
            policy_uri: crate::security::POLICY_URI_NONE.to_string(),
            secret_key: None,
            token_lifetime: DEFAULT_TOKEN_LIFETIME,
        }
    }
}

impl SecurityConfig {
    /// Validate security configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.policy_uri.is_empty() {
            errors.push("Security policy URI cannot be empty".to_string());
        }

        match self.mode {
            SecurityMode::None => {
                if self.policy_uri != crate::security::POLICY_URI_NONE {
                    errors.push(format!(
                        "Security mode None requires policy '{}'",
                        crate::security::POLICY_URI_NONE
                    ));
                }
            }
            SecurityMode::SignAndEncrypt => match &self.secret_key {
                None => errors
                    .push("secret_key is required when security mode is not None".to_string()),
                Some(key) => {
                    if decode_hex_key(key).is_none() {
                        errors.push(
                            "secret_key must be 64 hex characters (32 bytes)".to_string(),
                        );
                    }
                }
            },
        }

        if self.token_lifetime.as_secs() < 10 {
            errors.push("Token lifetime too short (minimum: 10s)".to_string());
        } else if self.token_lifetime.as_secs() > 24 * 3600 {
            errors.push("Token lifetime too long (maximum: 24h)".to_string());
        }

        errors
    }

    /// Decoded pre-shared key, if one is configured and well-formed.
    pub fn key_bytes(&self) -> Option<[u8; 32]> {
        self.secret_key.as_deref().and_then(decode_hex_key)
    }
}

fn decode_hex_key(s: &str) -> Option<[u8; 32]> {
    if s.len() != 64 {
        return None;
    }
    let mut out = [0u8; 32];
    for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
        let hi = (chunk[0] as char).to_digit(16)?;
        let lo = (chunk[1] as char).to_digit(16)?;
        out[i] = ((hi << 4) | lo) as u8;
    }
    Some(out)
}

/// Description of this server application, served verbatim by the
/// FindServers and GetEndpoints handlers.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApplicationConfig {
    /// Globally unique application URI
    pub application_uri: String,

    /// Product URI of the software
    pub product_uri: String,

    /// Human-readable application name
    pub application_name: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            application_uri: String::from("urn:opcua-protocol:server"),
            product_uri: String::from("urn:opcua-protocol"),
            application_name: String::from("opcua-protocol server"),
        }
    }
}

impl ApplicationConfig {
    /// Validate application configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.application_uri.is_empty() {
            errors.push("Application URI cannot be empty".to_string());
        }

        if self.application_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        } else if self.application_name.len() > 128 {
            errors.push(format!(
                "Application name too long: {} characters (maximum: 128)",
                self.application_name.len()
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

    /// Whether to log to console
    pub log_to_console: bool,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("opcua-protocol"),
            log_level: Level::INFO,
            log_to_console: true,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    /// Validate logging configuration
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

/// Helper module for Duration serialization/deserialization
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis() as u64;
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Helper module for tracing::Level serialization/deserialization
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        level.to_string().to_lowercase().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
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
        let config = ServerConfig::default();
        assert!(config.validate().is_empty(), "{:?}", config.validate());
    }

    #[test]
    fn default_transport_parameters() {
        let transport = TransportConfig::default();
        assert_eq!(transport.receive_buffer_size, 0xFFFF);
        assert_eq!(transport.send_buffer_size, 0xFFFF);
        assert_eq!(transport.max_message_size, 65536);
        assert_eq!(transport.max_chunk_count, 256);
    }

    #[test]
    fn bad_endpoint_url_is_rejected() {
        let config = ServerConfig::new("http://example.com");
        assert!(config.validate_strict().is_err());
    }

    #[test]
    fn sign_and_encrypt_requires_key() {
        let mut config = ServerConfig::default();
        config.security.mode = SecurityMode::SignAndEncrypt;
        config.security.policy_uri = crate::security::POLICY_URI_CHACHA20POLY1305.to_string();
        assert!(config.validate_strict().is_err());

        config.security.secret_key = Some("ab".repeat(32));
        assert!(config.validate_strict().is_ok());
        assert_eq!(config.security.key_bytes().unwrap()[0], 0xAB);
    }

    #[test]
    fn toml_roundtrip() {
        let config = ServerConfig::new("opc.tcp://0.0.0.0:4840/factory");
        let toml = toml::to_string_pretty(&config).unwrap();
        let parsed = ServerConfig::from_toml(&toml).unwrap();
        assert_eq!(parsed.endpoint_url, config.endpoint_url);
        assert_eq!(
            parsed.transport.max_message_size,
            config.transport.max_message_size
        );
        assert_eq!(parsed.logging.log_level, config.logging.log_level);
    }

    #[test]
    fn env_overrides_apply() {
        std::env::set_var("OPCUA_ENDPOINT_URL", "opc.tcp://env-host:4841/plant");
        std::env::set_var("OPCUA_MAX_MESSAGE_SIZE", "131072");
        let config = ServerConfig::from_env().unwrap();
        std::env::remove_var("OPCUA_ENDPOINT_URL");
        std::env::remove_var("OPCUA_MAX_MESSAGE_SIZE");

        assert_eq!(config.endpoint_url, "opc.tcp://env-host:4841/plant");
        assert_eq!(config.transport.max_message_size, 131_072);
        // Untouched fields keep their defaults.
        assert_eq!(config.transport.max_chunk_count, DEFAULT_MAX_CHUNK_COUNT);
    }

    #[test]
    fn overrides_apply_on_top_of_defaults() {
        let config = ServerConfig::default_with_overrides(|c| {
            c.transport.max_chunk_count = 16;
        });
        assert_eq!(config.transport.max_chunk_count, 16);
        assert_eq!(config.transport.max_message_size, DEFAULT_MAX_MESSAGE_SIZE);
    }
}
