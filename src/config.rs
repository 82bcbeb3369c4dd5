//! Configuration management for Ratekeeper.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{RatekeeperError, Result};
use crate::ratelimit::{Algorithm, RouteRule, ScopeKind};

/// Prefix for environment overrides, e.g. `RATEKEEPER__STORE__CONNECTION_STRING`.
const ENV_PREFIX: &str = "RATEKEEPER";

/// Main configuration for the Ratekeeper service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RatekeeperConfig {
    /// Shared store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,
}

/// Shared store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Redis connection string. Required.
    #[serde(default)]
    pub connection_string: String,

    /// Deadline for a single store round trip, in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Directory holding replacement Lua sources
    #[serde(default)]
    pub scripts_dir: Option<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            connection_string: String::new(),
            timeout_ms: default_timeout_ms(),
            scripts_dir: None,
        }
    }
}

impl StoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_timeout_ms() -> u64 {
    250
}

/// Rate limiting defaults and per-route overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Algorithm used when a route does not choose one
    #[serde(default)]
    pub algorithm: Algorithm,

    /// Calls allowed per window
    #[serde(default = "default_limit")]
    pub limit: u32,

    /// Window length in seconds
    #[serde(default = "default_window_secs")]
    pub window_secs: u32,

    /// Scope used when a route does not choose one
    #[serde(default)]
    pub scope: ScopeKind,

    /// Allow requests while the store is unavailable
    #[serde(default = "default_fail_open")]
    pub fail_open: bool,

    /// Tokens seeded into the global bucket at startup
    #[serde(default = "default_warm_up_capacity")]
    pub warm_up_capacity: u32,

    /// Per-route overrides
    #[serde(default)]
    pub routes: Vec<RouteRule>,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::default(),
            limit: default_limit(),
            window_secs: default_window_secs(),
            scope: ScopeKind::default(),
            fail_open: default_fail_open(),
            warm_up_capacity: default_warm_up_capacity(),
            routes: Vec::new(),
        }
    }
}

fn default_limit() -> u32 {
    100
}

fn default_window_secs() -> u32 {
    60
}

fn default_fail_open() -> bool {
    true
}

fn default_warm_up_capacity() -> u32 {
    100
}

impl RatekeeperConfig {
    /// Load configuration from an optional YAML file layered with
    /// `RATEKEEPER__*` environment variables, then validate it.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: RatekeeperConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| RatekeeperError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string and validate it.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: RatekeeperConfig = serde_yaml::from_str(yaml)
            .map_err(|e| RatekeeperError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check everything the store needs before it can be constructed.
    pub fn validate(&self) -> Result<()> {
        if self.store.connection_string.trim().is_empty() {
            return Err(RatekeeperError::Config(
                "store.connection_string is required".to_string(),
            ));
        }
        if self.store.timeout_ms == 0 {
            return Err(RatekeeperError::Config(
                "store.timeout_ms must be greater than zero".to_string(),
            ));
        }

        let limits = &self.rate_limiting;
        if limits.limit == 0 || limits.window_secs == 0 {
            return Err(RatekeeperError::Config(
                "rate_limiting.limit and rate_limiting.window_secs must be greater than zero"
                    .to_string(),
            ));
        }
        if limits.warm_up_capacity == 0 {
            return Err(RatekeeperError::Config(
                "rate_limiting.warm_up_capacity must be greater than zero".to_string(),
            ));
        }
        for route in &limits.routes {
            route.validate()?;
        }

        Ok(())
    }
}
