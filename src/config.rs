//! # Configuration Management
//!
//! Centralized configuration for the controller and the agent.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()` / `from_toml()`
//! - Direct instantiation with defaults
//! - Environment overrides via `from_env()`
//!
//! ## Policy Switches
//! Two behaviours are deliberately left to configuration:
//! - `server.registration_policy`: whether re-registering a known hardware id returns
//!   the existing identity (`reuse_existing`) or mints a new one (`always_mint`)
//! - `transport.key_mode`: whether frames stay encrypted with the shared key for the
//!   whole session (`shared`) or switch to the identity's session key after
//!   authentication (`per_identity`)

use crate::error::{ChannelError, Result};
use crate::utils::crypto::{Cipher, KEY_SIZE};
use crate::utils::timeout;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Max allowed frame size (16 MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Whether whole-message encryption is on by default
pub const ENABLE_ENCRYPTION: bool = true;

/// Shared key used when none is configured. `validate()` flags it.
pub const DEFAULT_SHARED_KEY: &str = "1234567897654321";

/// Upper bound for `server.max_connections`
pub const MAX_CONNECTIONS_LIMIT: usize = 1_000_000;

/// Main configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ControlConfig {
    /// Controller-specific configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Agent-specific configuration
    #[serde(default)]
    pub client: ClientConfig,

    /// Wire and encryption configuration
    #[serde(default)]
    pub transport: TransportConfig,

    /// Identity store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Loopback admin channel configuration
    #[serde(default)]
    pub admin: AdminConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ControlConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| ChannelError::Config(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| ChannelError::Config(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ChannelError::Config(format!("Failed to parse TOML: {e}")))
    }

    /// Defaults overridden by environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env();
        Ok(config)
    }

    /// Apply environment overrides on top of the current values
    pub fn apply_env(&mut self) {
        if let Ok(addr) = std::env::var("CONTROL_CHANNEL_SERVER_ADDRESS") {
            self.server.address = addr;
        }

        if let Ok(addr) = std::env::var("CONTROL_CHANNEL_CLIENT_ADDRESS") {
            self.client.address = addr;
        }

        if let Ok(key) = std::env::var("CONTROL_CHANNEL_SHARED_KEY") {
            self.transport.shared_key = key;
        }

        if let Ok(path) = std::env::var("CONTROL_CHANNEL_STORE_PATH") {
            self.store.path = Some(path);
        }

        if let Ok(delay) = std::env::var("CONTROL_CHANNEL_RECONNECT_DELAY_MS") {
            if let Ok(val) = delay.parse::<u64>() {
                self.client.reconnect_delay = Duration::from_millis(val);
            }
        }
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

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ChannelError::Config(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| ChannelError::Config(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.server.validate());
        errors.extend(self.client.validate());
        errors.extend(self.transport.validate());
        errors.extend(self.admin.validate());
        errors.extend(self.logging.validate());
        errors
    }

    /// Validate and return Result. Entries prefixed with `WARNING:` do not fail.
    pub fn validate_strict(&self) -> Result<()> {
        let errors: Vec<String> = self
            .validate()
            .into_iter()
            .filter(|e| !e.starts_with("WARNING:"))
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ChannelError::Config(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

/// What happens when a device that is already known sends `Register` again
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationPolicy {
    /// Return the identity already bound to the hardware id and rotate its key
    #[default]
    ReuseExisting,
    /// Always allocate a fresh identity
    AlwaysMint,
}

/// Which wire protocol a listener speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WireMode {
    /// Length-prefixed, whole-message encrypted frames
    #[default]
    Framed,
    /// Stream-delimited JSON with per-field encryption
    Legacy,
}

/// Which key encrypts frames after authentication
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum KeyMode {
    /// The configured shared key for every identity
    #[default]
    Shared,
    /// The identity's session key once Auth succeeds
    PerIdentity,
}

/// Controller configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address (e.g., "127.0.0.1:9000")
    pub address: String,

    /// Maximum number of concurrent connections
    pub max_connections: usize,

    /// Deadline for an unauthenticated connection to finish its handshake
    #[serde(with = "duration_serde")]
    pub connection_timeout: Duration,

    /// How often each connection checks for a pending command
    #[serde(with = "duration_serde")]
    pub command_poll_interval: Duration,

    /// Timeout for graceful server shutdown
    #[serde(with = "duration_serde")]
    pub shutdown_timeout: Duration,

    /// Periodically enqueue "PING" for every authenticated online identity
    pub ping_enabled: bool,

    /// Interval of the PING broadcast
    #[serde(with = "duration_serde")]
    pub ping_interval: Duration,

    /// Behaviour on re-registration of a known hardware id
    #[serde(default)]
    pub registration_policy: RegistrationPolicy,

    /// Validity reported with each issued OTP
    #[serde(with = "duration_serde")]
    pub otp_ttl: Duration,

    /// JSON-lines archive of agent log lines (None = tracing only)
    #[serde(default)]
    pub log_archive_path: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: String::from("127.0.0.1:9000"),
            max_connections: 1000,
            connection_timeout: timeout::DEFAULT_TIMEOUT,
            command_poll_interval: timeout::COMMAND_POLL_INTERVAL,
            shutdown_timeout: timeout::SHUTDOWN_TIMEOUT,
            ping_enabled: false,
            ping_interval: Duration::from_secs(10),
            registration_policy: RegistrationPolicy::default(),
            otp_ttl: Duration::from_secs(60),
            log_archive_path: None,
        }
    }
}

impl ServerConfig {
    /// Validate server configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.address.is_empty() {
            errors.push("Server address cannot be empty".to_string());
        } else if self.address.parse::<std::net::SocketAddr>().is_err() {
            errors.push(format!(
                "Invalid server address format: '{}' (expected format: '0.0.0.0:9000')",
                self.address
            ));
        }

        if self.max_connections == 0 {
            errors.push("Max connections must be greater than 0".to_string());
        } else if self.max_connections > MAX_CONNECTIONS_LIMIT {
            errors.push(format!(
                "Max connections too large: {} (maximum: {MAX_CONNECTIONS_LIMIT})",
                self.max_connections
            ));
        }

        if self.connection_timeout.as_millis() < 100 {
            errors.push("Connection timeout too short (minimum: 100ms)".to_string());
        }

        if self.command_poll_interval.as_millis() < 10 {
            errors.push("Command poll interval too short (minimum: 10ms)".to_string());
        } else if self.command_poll_interval.as_secs() > 60 {
            errors.push("Command poll interval too long (maximum: 60s)".to_string());
        }

        if self.shutdown_timeout.as_secs() > 60 {
            errors.push("Shutdown timeout too long (maximum: 60s)".to_string());
        }

        if self.ping_enabled && self.ping_interval.as_millis() < 100 {
            errors.push("Ping interval too short (minimum: 100ms)".to_string());
        }

        errors
    }
}

/// Agent configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Controller address
    pub address: String,

    /// Timeout for connection attempts (TCP + TLS + handshake)
    #[serde(with = "duration_serde")]
    pub connection_timeout: Duration,

    /// Deadline for each request/response exchange
    #[serde(with = "duration_serde")]
    pub request_timeout: Duration,

    /// Fixed backoff between reconnect attempts
    #[serde(with = "duration_serde")]
    pub reconnect_delay: Duration,

    /// Interval for heartbeat (Hello) messages
    #[serde(with = "duration_serde")]
    pub heartbeat_interval: Duration,

    /// Where the issued identity and key are cached (None = memory only)
    #[serde(default)]
    pub identity_cache_path: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: String::from("127.0.0.1:9000"),
            connection_timeout: timeout::DEFAULT_TIMEOUT,
            request_timeout: timeout::REQUEST_TIMEOUT,
            reconnect_delay: timeout::RECONNECT_DELAY,
            heartbeat_interval: timeout::HEARTBEAT_INTERVAL,
            identity_cache_path: Some(String::from("agent_identity.json")),
        }
    }
}

impl ClientConfig {
    /// Validate client configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.address.is_empty() {
            errors.push("Client address cannot be empty".to_string());
        }

        if self.connection_timeout.as_millis() < 100 {
            errors.push("Connection timeout too short (minimum: 100ms)".to_string());
        }

        if self.request_timeout.as_millis() < 10 {
            errors.push("Request timeout too short (minimum: 10ms)".to_string());
        }

        if self.reconnect_delay.as_millis() < 10 {
            errors.push("Reconnect delay too short (minimum: 10ms)".to_string());
        } else if self.reconnect_delay.as_secs() > 300 {
            errors.push("Reconnect delay too long (maximum: 300s)".to_string());
        }

        if self.heartbeat_interval.as_millis() < 100 {
            errors.push("Heartbeat interval too short (minimum: 100ms)".to_string());
        }

        errors
    }
}

/// Wire and encryption configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Wrap the TCP stream in TLS
    pub tls_enabled: bool,

    /// Server certificate chain (PEM)
    #[serde(default)]
    pub tls_cert_path: Option<String>,

    /// Server private key (PKCS8 PEM)
    #[serde(default)]
    pub tls_key_path: Option<String>,

    /// Extra CA certificate the agent trusts (PEM)
    #[serde(default)]
    pub tls_ca_path: Option<String>,

    /// Agent skips certificate verification
    pub tls_insecure: bool,

    /// Name the agent expects in the server certificate
    pub server_name: String,

    /// Framed or legacy wire protocol
    #[serde(default)]
    pub wire_mode: WireMode,

    /// Whole-message encryption (framed) or per-field encryption (legacy)
    pub encryption_enabled: bool,

    /// Shared key for every identity, or per-identity session keys after Auth
    #[serde(default)]
    pub key_mode: KeyMode,

    /// Shared AES key material (first 16 bytes are used)
    pub shared_key: String,

    /// Maximum allowed frame size in bytes
    pub max_frame_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            tls_enabled: false,
            tls_cert_path: None,
            tls_key_path: None,
            tls_ca_path: None,
            tls_insecure: false,
            server_name: String::from("localhost"),
            wire_mode: WireMode::default(),
            encryption_enabled: ENABLE_ENCRYPTION,
            key_mode: KeyMode::default(),
            shared_key: String::from(DEFAULT_SHARED_KEY),
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

impl TransportConfig {
    /// Cipher for the shared key, or None when encryption is disabled
    pub fn shared_cipher(&self) -> Result<Option<Cipher>> {
        if !self.encryption_enabled {
            return Ok(None);
        }
        Cipher::new(self.shared_key.as_bytes()).map(Some)
    }

    /// Validate transport configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.max_frame_size < 1024 {
            errors.push("Max frame size too small (minimum: 1 KB)".to_string());
        } else if self.max_frame_size > 100 * 1024 * 1024 {
            errors.push(format!(
                "Max frame size too large: {} bytes (maximum recommended: 100 MB)",
                self.max_frame_size
            ));
        }

        if self.encryption_enabled && self.shared_key.len() < KEY_SIZE {
            errors.push(format!(
                "Shared key too short: {} bytes (minimum: {KEY_SIZE})",
                self.shared_key.len()
            ));
        }

        if self.tls_enabled && self.server_name.is_empty() {
            errors.push("server_name is required when TLS is enabled".to_string());
        }

        if self.wire_mode == WireMode::Legacy && self.key_mode == KeyMode::PerIdentity {
            errors.push(
                "WARNING: legacy wire mode always uses per-client keys; key_mode is ignored"
                    .to_string(),
            );
        }

        if !self.encryption_enabled && !self.tls_enabled {
            errors.push(
                "WARNING: Neither encryption nor TLS is enabled - not recommended for production"
                    .to_string(),
            );
        }

        if self.encryption_enabled && self.shared_key == DEFAULT_SHARED_KEY {
            errors.push("WARNING: Using the built-in default shared key".to_string());
        }

        errors
    }
}

/// Identity store configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    /// JSON file holding every identity (None = memory only)
    #[serde(default)]
    pub path: Option<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: Some(String::from("identities.json")),
        }
    }
}

/// Loopback admin channel configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Whether the controller opens the admin channel
    pub enabled: bool,

    /// `127.0.0.1:<port>` or `unix:<socket path>`
    pub address: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            address: String::from("127.0.0.1:9001"),
        }
    }
}

impl AdminConfig {
    /// Validate admin configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if !self.enabled || self.address.starts_with("unix:") {
            return errors;
        }
        match self.address.parse::<std::net::SocketAddr>() {
            Ok(addr) if !addr.ip().is_loopback() => errors.push(format!(
                "Admin address must be a loopback address: '{}'",
                self.address
            )),
            Ok(_) => {}
            Err(_) => errors.push(format!("Invalid admin address: '{}'", self.address)),
        }
        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Log level
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to log to console
    pub log_to_console: bool,

    /// Whether to log to file
    pub log_to_file: bool,

    /// Path to log file (if log_to_file is true)
    pub log_file_path: Option<String>,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("control-channel"),
            log_level: Level::INFO,
            log_to_console: true,
            log_to_file: false,
            log_file_path: None,
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
        }

        if self.log_to_file {
            if let Some(ref path) = self.log_file_path {
                if let Some(parent) = std::path::Path::new(path).parent() {
                    if !parent.as_os_str().is_empty() && !parent.exists() {
                        errors.push(format!(
                            "Log file directory does not exist: {}",
                            parent.display()
                        ));
                    }
                }
            } else {
                errors.push("log_file_path must be specified when log_to_file is true".to_string());
            }
        }

        if !self.log_to_console && !self.log_to_file {
            errors
                .push("At least one logging output (console or file) must be enabled".to_string());
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
        let level_str = match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        };
        level_str.serialize(serializer)
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
