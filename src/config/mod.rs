//! Typed configuration from environment variables or a TOML file.
//!
//! Loads once at startup and fails fast on malformed values. Every field
//! has a default, so an empty environment yields a usable config.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::engine::PoolConfig;
use crate::error::{Error, Result};
use crate::model::{JoinMode, Policy};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub workers: usize,
    /// "structured" or "unstructured".
    pub policy: String,
    /// Join mode for the unstructured policy: "first", "all" or "detach".
    pub join: JoinMode,
    /// Structured-policy episode deadline.
    pub deadline_ms: Option<u64>,
    /// `None` means an unbounded queue.
    pub queue_capacity: Option<usize>,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: 4,
            policy: "structured".to_string(),
            join: JoinMode::First,
            deadline_ms: None,
            queue_capacity: None,
            otel_endpoint: None,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let config = Self {
            workers: parse_var("WORKPOOL_WORKERS")?.unwrap_or(defaults.workers),
            policy: std::env::var("WORKPOOL_POLICY").unwrap_or(defaults.policy),
            join: parse_var("WORKPOOL_JOIN")?.unwrap_or(defaults.join),
            deadline_ms: parse_var("WORKPOOL_DEADLINE_MS")?,
            queue_capacity: parse_var("WORKPOOL_QUEUE_CAPACITY")?,
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or(defaults.log_level),
        };
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document. Missing keys take their defaults.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| Error::Config(format!("bad config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML config file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read config {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }

    fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::Config("workers must be at least 1".to_string()));
        }
        if self.queue_capacity == Some(0) {
            return Err(Error::Config(
                "queue_capacity must be at least 1 (omit it for an unbounded queue)".to_string(),
            ));
        }
        self.to_policy().map(|_| ())
    }

    /// The coordination policy this config selects.
    pub fn to_policy(&self) -> Result<Policy> {
        match self.policy.as_str() {
            "structured" => Ok(Policy::Structured {
                deadline: self.deadline_ms.map(Duration::from_millis),
            }),
            "unstructured" => Ok(Policy::Unstructured { join: self.join }),
            other => Err(Error::Config(format!("unknown policy: {other}"))),
        }
    }

    /// Pool settings derived from this config.
    pub fn pool_config(&self) -> Result<PoolConfig> {
        Ok(PoolConfig {
            worker_count: self.workers,
            policy: self.to_policy()?,
            queue_capacity: self.queue_capacity,
        })
    }
}

/// Read an optional variable and parse it, failing on malformed values.
fn parse_var<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|e| Error::Config(format!("invalid {name}={raw}: {e}"))),
        Err(_) => Ok(None),
    }
}
