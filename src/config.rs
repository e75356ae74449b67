//! Connector configuration
//!
//! Two layers live here. [`ConnectorConfig`] is the TOML file as written by an
//! operator: optional fields, broker presets and credential indirection through
//! environment variables. [`ConnectionConfig`] is the resolved, immutable set of
//! per-session parameters the connection manager works with.

use crate::connector::RetryPolicy;
use crate::transport::{ConnectOptions, SessionTarget};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

pub const DEFAULT_HOST: &str = "broker.hivemq.com";
pub const DEFAULT_PORT: u16 = 8000;
pub const DEFAULT_PATH: &str = "/mqtt";
pub const DEFAULT_TOPIC: &str = "psu/drone";

/// Mosquitto's conventional WebSocket listener port
pub const MOSQUITTO_WS_PORT: u16 = 9001;

/// Largest keep-alive the MQTT CONNECT packet can carry (a 16-bit seconds field)
pub const MAX_KEEP_ALIVE_SECS: u64 = u16::MAX as u64;

/// Top-level configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConnectorConfig {
    #[serde(default)]
    pub broker: BrokerSection,
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub buffer: BufferSection,
    #[serde(default)]
    pub topics: TopicsSection,
}

/// Broker section. Every field is optional so a preset can fill the gaps.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BrokerSection {
    /// Named broker profile used for fields not given explicitly
    pub preset: Option<BrokerPreset>,
    pub host: Option<String>,
    /// Kept wider than `u16` so out-of-range values are reported as such
    pub port: Option<u32>,
    pub path: Option<String>,
    pub use_tls: Option<bool>,
    /// Generated with a random suffix when absent
    pub client_id: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Environment variable holding the username (used when `username` is unset)
    pub username_env: Option<String>,
    /// Environment variable holding the password (used when `password` is unset)
    pub password_env: Option<String>,
}

/// Handshake and keep-alive timing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionSection {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            keep_alive_secs: default_keep_alive_secs(),
        }
    }
}

/// Automatic retry behaviour
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrySection {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
    /// Per-attempt delays in milliseconds; `delay_ms` applies once exhausted
    #[serde(default)]
    pub backoff_pattern: Vec<u64>,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            delay_ms: default_delay_ms(),
            backoff_pattern: Vec::new(),
        }
    }
}

/// Inbound message history
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BufferSection {
    /// Unset keeps every message; otherwise the oldest are evicted first
    pub max_messages: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TopicsSection {
    #[serde(default = "default_topic")]
    pub default: String,
}

impl Default for TopicsSection {
    fn default() -> Self {
        Self {
            default: default_topic(),
        }
    }
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_keep_alive_secs() -> u64 {
    60
}

fn default_max_attempts() -> u32 {
    5
}

fn default_delay_ms() -> u64 {
    3000
}

fn default_topic() -> String {
    DEFAULT_TOPIC.to_string()
}

/// Well-known broker profiles
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum BrokerPreset {
    /// Public HiveMQ broker, no authentication
    Hivemq,
    /// Local Mosquitto through its WebSocket listener (`listener 9001` with
    /// `protocol websockets`), not the plain TCP listener on 1883
    Mosquitto,
    /// Self-hosted Mosquitto with password authentication. `host` must be set;
    /// credentials come from `MQTT_USERNAME` and `MQTT_PASSWORD` unless the
    /// broker section names them.
    MosquittoAuth,
    /// AWS IoT Core; the account-specific endpoint must be supplied as `host`
    AwsIot,
}

/// Values a preset contributes to the broker section
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresetDefaults {
    pub host: Option<&'static str>,
    pub port: u16,
    pub path: &'static str,
    pub use_tls: bool,
    /// Environment variables read for credentials when none are configured
    pub username_env: Option<&'static str>,
    pub password_env: Option<&'static str>,
}

impl BrokerPreset {
    pub fn defaults(self) -> PresetDefaults {
        match self {
            BrokerPreset::Hivemq => PresetDefaults {
                host: Some(DEFAULT_HOST),
                port: DEFAULT_PORT,
                path: DEFAULT_PATH,
                use_tls: false,
                username_env: None,
                password_env: None,
            },
            BrokerPreset::Mosquitto => PresetDefaults {
                host: Some("localhost"),
                port: MOSQUITTO_WS_PORT,
                path: "/",
                use_tls: false,
                username_env: None,
                password_env: None,
            },
            BrokerPreset::MosquittoAuth => PresetDefaults {
                host: None,
                port: MOSQUITTO_WS_PORT,
                path: "/",
                use_tls: false,
                username_env: Some("MQTT_USERNAME"),
                password_env: Some("MQTT_PASSWORD"),
            },
            BrokerPreset::AwsIot => PresetDefaults {
                host: None,
                port: 8883,
                path: DEFAULT_PATH,
                use_tls: true,
                username_env: None,
                password_env: None,
            },
        }
    }

    /// Parse a preset name as accepted on the command line
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_lowercase().replace('_', "-").as_str() {
            "hivemq" => Some(BrokerPreset::Hivemq),
            "mosquitto" => Some(BrokerPreset::Mosquitto),
            "mosquitto-auth" | "mosquittoauth" => Some(BrokerPreset::MosquittoAuth),
            "aws-iot" | "awsiot" => Some(BrokerPreset::AwsIot),
            _ => None,
        }
    }
}

/// Configuration loading and validation errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Broker host must not be empty")]
    EmptyHost,
    #[error("Invalid broker port {0}: must be between 1 and 65535")]
    InvalidPort(u32),
    #[error("Invalid retry policy: {0}")]
    InvalidRetryPolicy(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ConnectorConfig {
    /// Load configuration from a TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from TOML text and validate it
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: ConnectorConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Structural checks that do not depend on the environment.
    /// An empty host is deliberately left to [`ConnectionConfig::validate`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(port) = self.broker.port {
            validate_port(port)?;
        }
        if self.session.timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "session.timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.session.keep_alive_secs > MAX_KEEP_ALIVE_SECS {
            return Err(ConfigError::InvalidConfig(format!(
                "session.keep_alive_secs must not exceed {MAX_KEEP_ALIVE_SECS}"
            )));
        }
        if self.buffer.max_messages == Some(0) {
            return Err(ConfigError::InvalidConfig(
                "buffer.max_messages must be greater than 0 when set".to_string(),
            ));
        }
        self.retry_policy().validate()?;
        Ok(())
    }

    /// Resolve the broker section into per-session connection parameters
    pub fn connection_config(&self) -> Result<ConnectionConfig, ConfigError> {
        let broker = &self.broker;
        let preset = broker.preset.unwrap_or(BrokerPreset::Hivemq).defaults();

        let host = broker
            .host
            .clone()
            .or_else(|| preset.host.map(str::to_string))
            .unwrap_or_default();
        let port = match broker.port {
            Some(port) => validate_port(port)?,
            None => preset.port,
        };

        let mut config = ConnectionConfig::new(host)
            .with_port(port)
            .with_path(broker.path.clone().unwrap_or_else(|| preset.path.to_string()))
            .with_tls(broker.use_tls.unwrap_or(preset.use_tls))
            .with_timeout(Duration::from_secs(self.session.timeout_secs))
            .with_keep_alive(Duration::from_secs(self.session.keep_alive_secs));

        if let Some(client_id) = broker.client_id.as_ref().filter(|id| !id.is_empty()) {
            config = config.with_client_id(client_id.clone());
        }

        let username = Self::resolve_secret(
            &broker.username,
            broker.username_env.as_deref().or(preset.username_env),
        )?;
        let password = Self::resolve_secret(
            &broker.password,
            broker.password_env.as_deref().or(preset.password_env),
        )?;
        if let Some(username) = username {
            config = config.with_credentials(username, password.unwrap_or_default());
        }

        Ok(config)
    }

    /// Retry policy described by the `[retry]` section
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            delay_ms: self.retry.delay_ms,
            backoff_pattern: self.retry.backoff_pattern.clone(),
        }
    }

    /// Upper bound on the wait for a first connection when every attempt is
    /// used: each handshake may take the full timeout, plus every retry delay.
    /// Saturates instead of overflowing on extreme settings.
    pub fn connect_deadline(&self) -> Duration {
        Duration::from_secs(self.session.timeout_secs)
            .saturating_mul(self.retry.max_attempts.max(1))
            .saturating_add(self.retry_policy().calculate_max_total_time())
    }

    /// Explicit value first, then the named environment variable
    fn resolve_secret(
        explicit: &Option<String>,
        env_name: Option<&str>,
    ) -> Result<Option<String>, ConfigError> {
        if let Some(value) = explicit {
            return Ok(Some(value.clone()));
        }
        match env_name {
            Some(name) => std::env::var(name)
                .map(Some)
                .map_err(|_| ConfigError::EnvVarNotFound(name.to_string())),
            None => Ok(None),
        }
    }
}

fn validate_port(port: u32) -> Result<u16, ConfigError> {
    match u16::try_from(port) {
        Ok(valid) if valid != 0 => Ok(valid),
        _ => Err(ConfigError::InvalidPort(port)),
    }
}

/// Generate a broker-unique client identifier
pub fn generate_client_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("mqtt-connector-{}", &suffix[..8])
}

/// Immutable per-session connection parameters
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    /// Routing path of the WebSocket endpoint
    pub path: String,
    pub use_tls: bool,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Handshake timeout
    pub timeout: Duration,
    pub keep_alive: Duration,
}

impl ConnectionConfig {
    /// Build a configuration for `host` with default port, path and a generated client id
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_PORT,
            path: DEFAULT_PATH.to_string(),
            use_tls: false,
            client_id: generate_client_id(),
            username: None,
            password: None,
            timeout: Duration::from_secs(default_timeout_secs()),
            keep_alive: Duration::from_secs(default_keep_alive_secs()),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn with_tls(mut self, use_tls: bool) -> Self {
        self.use_tls = use_tls;
        self
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Must pass before any connection attempt is issued
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::EmptyHost);
        }
        if self.port == 0 {
            return Err(ConfigError::InvalidPort(0));
        }
        if self.client_id.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "client identifier must not be empty".to_string(),
            ));
        }
        if self.keep_alive > Duration::from_secs(MAX_KEEP_ALIVE_SECS) {
            return Err(ConfigError::InvalidConfig(format!(
                "keep-alive must not exceed {MAX_KEEP_ALIVE_SECS}s"
            )));
        }
        Ok(())
    }

    /// Address of a session opened with this configuration
    pub fn target(&self) -> SessionTarget {
        SessionTarget {
            host: self.host.clone(),
            port: self.port,
            path: self.path.clone(),
            client_id: self.client_id.clone(),
        }
    }

    /// Handshake options for this configuration
    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            use_tls: self.use_tls,
            username: self.username.clone(),
            password: self.password.clone(),
            timeout: self.timeout,
            keep_alive: self.keep_alive,
        }
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("path", &self.path)
            .field("use_tls", &self.use_tls)
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("timeout", &self.timeout)
            .field("keep_alive", &self.keep_alive)
            .finish()
    }
}
