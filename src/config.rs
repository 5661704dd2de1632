use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Broker endpoint and reconnection settings for a node.
///
/// All fields are required. Values are not range-checked here: an unreachable
/// host or a bad port shows up as a connection failure once the node connects.
#[derive(Deserialize, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    pub username: String,
    pub password: String,
    /// Keep-alive interval in seconds.
    pub keepalive: u64,
    pub hostname: String,
    pub port: u16,
    /// Seconds to wait between reconnect attempts, also the per-attempt connect wait.
    pub timeout: u64,
    /// Maximum connect attempts per `ensure_connection` call.
    pub reconnect_attempts: u32,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Environment variable {0} is missing or invalid.")]
    MissingOrInvalid(String),
    #[error("Parsing error: {0}")]
    ParsingError(String),
}

impl BrokerConfig {
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    /// How long a single connect attempt may wait for the broker's CONNACK.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout.max(1))
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }

    /// Load the configuration from the process environment (and `.env`).
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv().ok(); // Load environment variables from .env file

        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup using the
    /// `MQTT_*` variable names.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| lookup(key).ok_or_else(|| ConfigError::MissingOrInvalid(key.to_string()));

        Ok(Self {
            username: required("MQTT_USERNAME")?,
            password: required("MQTT_PASSWORD")?,
            keepalive: required("MQTT_KEEPALIVE")?
                .parse::<u64>()
                .map_err(|_| ConfigError::ParsingError("MQTT_KEEPALIVE must be a valid number".to_string()))?,
            hostname: required("MQTT_HOSTNAME")?,
            port: required("MQTT_PORT")?
                .parse::<u16>()
                .map_err(|_| ConfigError::ParsingError("MQTT_PORT must be a valid number".to_string()))?,
            timeout: required("MQTT_TIMEOUT")?
                .parse::<u64>()
                .map_err(|_| ConfigError::ParsingError("MQTT_TIMEOUT must be a valid number".to_string()))?,
            reconnect_attempts: required("MQTT_RECONNECT_ATTEMPTS")?
                .parse::<u32>()
                .map_err(|_| {
                    ConfigError::ParsingError("MQTT_RECONNECT_ATTEMPTS must be a non-negative integer".to_string())
                })?,
        })
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(|e| ConfigError::ParsingError(e.to_string()))
    }
}

impl fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("keepalive", &self.keepalive)
            .field("hostname", &self.hostname)
            .field("port", &self.port)
            .field("timeout", &self.timeout)
            .field("reconnect_attempts", &self.reconnect_attempts)
            .finish()
    }
}
