//! Process configuration, read from the environment (and `.env` when present).

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

use pharmastock_observability::{LogConfig, LogFormat};
use pharmastock_purchasing::IntakePolicy;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{key}: invalid value '{value}': {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    fn invalid(key: &'static str, value: &str, reason: impl ToString) -> Self {
        ConfigError::Invalid {
            key,
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    /// Postgres connection string. `None` runs on the in-memory store.
    pub database_url: Option<String>,
    /// How long a transaction waits for row locks before giving up.
    pub lock_timeout: Duration,
    /// Upper bound on one request; expiry rolls the request back.
    pub request_timeout: Duration,
    pub log: LogConfig,
    pub intake: IntakePolicy,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            database_url: None,
            lock_timeout: Duration::from_millis(5_000),
            request_timeout: Duration::from_millis(30_000),
            log: LogConfig::default(),
            intake: IntakePolicy::default(),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unset keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = AppConfig::default();

        if let Some(v) = lookup("PHARMASTOCK_BIND_ADDR") {
            config.bind_addr = v
                .parse()
                .map_err(|e| ConfigError::invalid("PHARMASTOCK_BIND_ADDR", &v, e))?;
        }
        config.database_url = lookup("DATABASE_URL").filter(|v| !v.trim().is_empty());
        if let Some(v) = lookup("PHARMASTOCK_LOCK_TIMEOUT_MS") {
            config.lock_timeout = millis("PHARMASTOCK_LOCK_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = lookup("PHARMASTOCK_REQUEST_TIMEOUT_MS") {
            config.request_timeout = millis("PHARMASTOCK_REQUEST_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = lookup("PHARMASTOCK_LOG_FORMAT") {
            config.log.format = v
                .parse::<LogFormat>()
                .map_err(|e| ConfigError::invalid("PHARMASTOCK_LOG_FORMAT", &v, e))?;
        }
        if let Some(v) = lookup("PHARMASTOCK_REQUIRE_EXPIRY") {
            config.intake.require_expiry = flag("PHARMASTOCK_REQUIRE_EXPIRY", &v)?;
        }

        Ok(config)
    }
}

fn millis(key: &'static str, value: &str) -> Result<Duration, ConfigError> {
    match value.trim().parse::<u64>() {
        Ok(0) => Err(ConfigError::invalid(key, value, "must be greater than zero")),
        Ok(ms) => Ok(Duration::from_millis(ms)),
        Err(e) => Err(ConfigError::invalid(key, value, e)),
    }
}

fn flag(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        _ => Err(ConfigError::invalid(key, value, "expected true or false")),
    }
}
