//! Per-route limit resolution and the admission check used by request
//! pipelines.
//!
//! A pipeline resolves a [`LimitPolicy`] for the route being served, builds
//! the caller's [`Identity`], and asks [`Admission::check`] whether to
//! continue. A rejection carries the window as the retry hint; rendering it
//! (for example as a 429 with `Retry-After`) is up to the pipeline.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use super::algorithm::Algorithm;
use super::backend::ScriptBackend;
use super::key::{Identity, ScopeKind};
use super::store::RateLimitStore;
use crate::config::RateLimitingConfig;
use crate::error::{RatekeeperError, Result};

/// Override of the default limit for a path prefix.
///
/// Unset fields inherit the configured defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRule {
    /// Path prefix, matched on segment boundaries
    pub path: String,
    #[serde(default)]
    pub algorithm: Option<Algorithm>,
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub window_secs: Option<u32>,
    #[serde(default)]
    pub scope: Option<ScopeKind>,
    /// Optional name, used in logs
    #[serde(default)]
    pub name: Option<String>,
}

impl RouteRule {
    pub fn validate(&self) -> Result<()> {
        if !self.path.starts_with('/') {
            return Err(RatekeeperError::Config(format!(
                "route path '{}' must start with '/'",
                self.path
            )));
        }
        if self.limit == Some(0) || self.window_secs == Some(0) {
            return Err(RatekeeperError::Config(format!(
                "route '{}' must use a positive limit and window",
                self.path
            )));
        }
        Ok(())
    }

    /// `/api` matches `/api` and `/api/users` but not `/apis`.
    fn matches(&self, path: &str) -> bool {
        let prefix = self.path.trim_end_matches('/');
        if prefix.is_empty() {
            return true;
        }
        match path.strip_prefix(prefix) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }
}

/// The fully resolved limit for one decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitPolicy {
    pub algorithm: Algorithm,
    pub limit: u32,
    pub window_secs: u32,
    pub scope: ScopeKind,
}

impl LimitPolicy {
    /// Hint returned to rejected callers.
    pub fn retry_after(&self) -> Duration {
        Duration::from_secs(self.window_secs as u64)
    }

    fn with_overrides(self, rule: &RouteRule) -> Self {
        Self {
            algorithm: rule.algorithm.unwrap_or(self.algorithm),
            limit: rule.limit.unwrap_or(self.limit),
            window_secs: rule.window_secs.unwrap_or(self.window_secs),
            scope: rule.scope.unwrap_or(self.scope),
        }
    }
}

impl From<&RateLimitingConfig> for LimitPolicy {
    fn from(config: &RateLimitingConfig) -> Self {
        Self {
            algorithm: config.algorithm,
            limit: config.limit,
            window_secs: config.window_secs,
            scope: config.scope,
        }
    }
}

/// Defaults plus route overrides.
#[derive(Debug, Clone)]
pub struct RoutePolicies {
    defaults: LimitPolicy,
    routes: Vec<RouteRule>,
}

impl RoutePolicies {
    pub fn new(defaults: LimitPolicy, routes: Vec<RouteRule>) -> Self {
        Self { defaults, routes }
    }

    pub fn from_config(config: &RateLimitingConfig) -> Self {
        Self::new(LimitPolicy::from(config), config.routes.clone())
    }

    pub fn defaults(&self) -> LimitPolicy {
        self.defaults
    }

    /// Resolve the policy for a request path. The longest matching prefix wins.
    pub fn resolve(&self, path: &str) -> LimitPolicy {
        let rule = self
            .routes
            .iter()
            .filter(|rule| rule.matches(path))
            .max_by_key(|rule| rule.path.trim_end_matches('/').len());

        match rule {
            Some(rule) => {
                let route = rule.name.as_deref().unwrap_or(&rule.path);
                debug!(path, route, "Matched route rule");
                self.defaults.with_overrides(rule)
            }
            None => self.defaults,
        }
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    Rejected { retry_after: Duration },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed)
    }

    /// Decide whether the caller may proceed under `policy`.
    pub async fn check<B: ScriptBackend + 'static>(
        store: &RateLimitStore<B>,
        identity: &Identity,
        policy: &LimitPolicy,
    ) -> Self {
        let key = identity.scope(policy.scope).base_key();
        let allowed = store
            .try_decide(&key, policy.limit, policy.window_secs, policy.algorithm)
            .await;

        if allowed {
            Admission::Allowed
        } else {
            Admission::Rejected {
                retry_after: policy.retry_after(),
            }
        }
    }
}
