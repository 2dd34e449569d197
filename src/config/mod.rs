//! Server configuration.
//!
//! Every field has a default, so an empty TOML document is a valid
//! configuration. Deserialization handles syntax; [`Config::validate`]
//! handles semantic checks and is run by the server builder before binding.
//!
//! ```toml
//! host = "0.0.0.0"
//! port = 8080
//! body_limit_bytes = 1048576
//! jwt_secret = "change me"
//!
//! [rate_limit]
//! capacity = 100
//! refill_per_sec = 10.0
//! key = { header = "x-api-key" }
//!
//! [cors]
//! origin = ["https://app.example.com"]
//! ```

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::security::KeyStrategy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// Log request headers (credentials masked) at `debug` level.
    pub log_headers: bool,
    pub cors: Option<CorsConfig>,
    pub rate_limit: Option<RateLimitConfig>,
    pub body_limit_bytes: Option<usize>,
    /// HS256 secret for bearer tokens. Required when any route is protected.
    pub jwt_secret: Option<String>,
    /// How long in-flight requests get to finish after shutdown starts.
    pub drain_timeout_ms: u64,
    /// Per-request deadline covering middleware and handler. Off when unset.
    pub request_timeout_ms: Option<u64>,
    pub operational: OperationalConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_owned(),
            port: 8000,
            log_headers: false,
            cors: None,
            rate_limit: None,
            body_limit_bytes: None,
            jwt_secret: None,
            drain_timeout_ms: 30_000,
            request_timeout_ms: None,
            operational: OperationalConfig::default(),
        }
    }
}

impl Config {
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and validates a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let source = fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(rate_limit) = &self.rate_limit {
            if rate_limit.capacity == 0 {
                return Err(invalid("rate_limit.capacity must be at least 1"));
            }
            if !rate_limit.refill_per_sec.is_finite() || rate_limit.refill_per_sec < 0.0 {
                return Err(invalid("rate_limit.refill_per_sec must be a finite, non-negative number"));
            }
            if rate_limit.stale_after_secs == 0 {
                return Err(invalid("rate_limit.stale_after_secs must be at least 1"));
            }
            if let KeyStrategy::Header(name) = &rate_limit.key {
                if name.trim().is_empty() {
                    return Err(invalid("rate_limit.key header name is empty"));
                }
            }
        }
        if self.body_limit_bytes == Some(0) {
            return Err(invalid("body_limit_bytes must be at least 1"));
        }
        if self.jwt_secret.as_deref().is_some_and(str::is_empty) {
            return Err(invalid("jwt_secret is empty"));
        }
        if self.drain_timeout_ms == 0 {
            return Err(invalid("drain_timeout_ms must be at least 1"));
        }
        if self.request_timeout_ms == Some(0) {
            return Err(invalid("request_timeout_ms must be at least 1"));
        }
        let ops = &self.operational;
        if ops.enabled {
            for path in [&ops.health_path, &ops.routes_path] {
                if !path.starts_with('/') {
                    return Err(ConfigError::Invalid(format!(
                        "operational path {path:?} must start with '/'"
                    )));
                }
            }
            if ops.health_path == ops.routes_path {
                return Err(invalid("operational health_path and routes_path must differ"));
            }
        }
        Ok(())
    }

    /// `host:port`, as passed to the listener.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }
}

fn invalid(message: &str) -> ConfigError {
    ConfigError::Invalid(message.to_owned())
}

/// One allowed origin or a list of them.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Origins {
    One(String),
    Many(Vec<String>),
}

impl Origins {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            Origins::One(origin) => vec![origin.clone()],
            Origins::Many(origins) => origins.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CorsConfig {
    pub origin: Origins,
    #[serde(default)]
    pub methods: Option<Vec<String>>,
    #[serde(default)]
    pub headers: Option<Vec<String>>,
    #[serde(default = "default_max_age")]
    pub max_age_secs: u64,
}

fn default_max_age() -> u64 {
    3600
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitConfig {
    pub capacity: u32,
    pub refill_per_sec: f64,
    #[serde(default)]
    pub key: KeyStrategy,
    /// Idle time after which a full bucket may be dropped.
    #[serde(default = "default_stale_after")]
    pub stale_after_secs: u64,
}

fn default_stale_after() -> u64 {
    600
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OperationalConfig {
    pub enabled: bool,
    pub health_path: String,
    pub routes_path: String,
}

impl Default for OperationalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            health_path: "/health".to_owned(),
            routes_path: "/routes".to_owned(),
        }
    }
}
