//! The rate limit store: script registration, decision dispatch and the
//! failure policy.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use super::algorithm::{Algorithm, Invocation, ScriptKind, Verdict};
use super::backend::ScriptBackend;
use super::distributed::RedisBackend;
use super::key::GLOBAL_WARM_UP_KEY;
use super::scripts::ScriptSet;
use crate::config::RatekeeperConfig;
use crate::error::{RatekeeperError, Result, StoreError};

/// Orchestrates decisions against the shared store.
///
/// Construct once at startup and share it (it is cheap to clone). All
/// per-call failures are absorbed here and turned into the configured
/// fail-open / fail-close verdict; nothing downstream inspects store errors.
pub struct RateLimitStore<B: ScriptBackend = RedisBackend> {
    backend: Arc<B>,
    scripts: Arc<ScriptSet>,
    fail_open: bool,
    timeout: Duration,
    /// Store clock minus local clock, sampled at startup.
    clock_offset: i64,
    /// Set while a background re-registration of that script is running.
    reloading: Arc<HashMap<ScriptKind, AtomicBool>>,
}

impl<B: ScriptBackend> Clone for RateLimitStore<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            scripts: Arc::clone(&self.scripts),
            fail_open: self.fail_open,
            timeout: self.timeout,
            clock_offset: self.clock_offset,
            reloading: Arc::clone(&self.reloading),
        }
    }
}

impl RateLimitStore<RedisBackend> {
    /// Validate the configuration, connect to Redis and start the store.
    pub async fn connect(config: &RatekeeperConfig) -> Result<Self> {
        config.validate()?;
        let scripts = ScriptSet::resolve(config.store.scripts_dir.as_deref())?;
        let backend =
            RedisBackend::connect(&config.store.connection_string, config.store.timeout()).await?;

        Self::start(backend, scripts, config).await
    }
}

impl<B: ScriptBackend + 'static> RateLimitStore<B> {
    /// Start a store on an already connected backend.
    ///
    /// Registers every script, samples the store clock and seeds the global
    /// warm-up bucket. Any failure here is fatal.
    pub async fn start(backend: B, scripts: ScriptSet, config: &RatekeeperConfig) -> Result<Self> {
        config.validate()?;

        let backend = Arc::new(backend);
        let timeout = config.store.timeout();

        for kind in ScriptKind::ALL {
            with_deadline(timeout, backend.register(kind, scripts.source(kind))).await?;
        }
        info!(scripts = ScriptKind::ALL.len(), "Rate limit scripts registered");

        let server_now = with_deadline(timeout, backend.server_time()).await?;
        let clock_offset = server_now - local_now();
        if clock_offset != 0 {
            debug!(offset_secs = clock_offset, "Store clock differs from local clock");
        }

        let store = Self {
            backend,
            scripts: Arc::new(scripts),
            fail_open: config.rate_limiting.fail_open,
            timeout,
            clock_offset,
            reloading: Arc::new(
                ScriptKind::ALL
                    .into_iter()
                    .map(|kind| (kind, AtomicBool::new(false)))
                    .collect(),
            ),
        };

        let limits = &config.rate_limiting;
        let seeded = store
            .warm_up(GLOBAL_WARM_UP_KEY, limits.warm_up_capacity, limits.window_secs)
            .await?;
        info!(
            key = GLOBAL_WARM_UP_KEY,
            capacity = limits.warm_up_capacity,
            seeded,
            fail_open = store.fail_open,
            "Rate limit store ready"
        );

        Ok(store)
    }

    /// Decide whether a call under `key` is admitted.
    ///
    /// Never fails: if the store cannot produce a verdict, the configured
    /// fail-open flag is returned instead.
    pub async fn try_decide(
        &self,
        key: &str,
        limit: u32,
        window_secs: u32,
        algorithm: Algorithm,
    ) -> bool {
        match self.decide(key, limit, window_secs, algorithm).await {
            Ok(verdict) => {
                if !verdict.allowed {
                    debug!(
                        key = %key,
                        algorithm = %algorithm,
                        limit,
                        window_secs,
                        counters = ?verdict.counters,
                        "Rate limit exceeded"
                    );
                }
                verdict.allowed
            }
            Err(e) => {
                let retryable = match &e {
                    RatekeeperError::Store(store_err) => store_err.is_retryable(),
                    _ => false,
                };
                warn!(
                    key = %key,
                    algorithm = %algorithm,
                    error = %e,
                    retryable,
                    fail_open = self.fail_open,
                    "Rate limit decision failed, applying failure policy"
                );
                self.fail_open
            }
        }
    }

    /// Run one decision and return the decoded verdict, surfacing failures.
    ///
    /// A zero `limit` or `window_secs` is clamped to 1.
    pub async fn decide(
        &self,
        key: &str,
        limit: u32,
        window_secs: u32,
        algorithm: Algorithm,
    ) -> Result<Verdict> {
        if key.trim().is_empty() {
            return Err(RatekeeperError::InvalidInput(
                "rate limit key must not be blank".to_string(),
            ));
        }
        let limit = at_least_one("limit", limit);
        let window_secs = at_least_one("window_secs", window_secs);

        let invocation = algorithm.invocation(key, limit, window_secs, self.now_hint());
        trace!(
            key = %key,
            algorithm = %algorithm,
            limit,
            window_secs,
            "Checking rate limit"
        );

        Ok(self.run(&invocation).await?)
    }

    /// Seed `bucket_key` with `capacity` tokens unless it already exists.
    ///
    /// Returns whether the bucket was seeded. A live bucket is never reset.
    pub async fn warm_up(&self, bucket_key: &str, capacity: u32, expiry_secs: u32) -> Result<bool> {
        if bucket_key.trim().is_empty() {
            return Err(RatekeeperError::InvalidInput(
                "bucket key must not be blank".to_string(),
            ));
        }
        let capacity = at_least_one("capacity", capacity);
        let expiry_secs = at_least_one("expiry_secs", expiry_secs);

        let invocation = Invocation::warm_up(bucket_key, capacity, expiry_secs, self.now_hint());
        let verdict = self.run(&invocation).await?;

        debug!(key = %bucket_key, capacity, expiry_secs, seeded = verdict.allowed, "Warm-up");
        Ok(verdict.allowed)
    }

    pub fn fail_open(&self) -> bool {
        self.fail_open
    }

    #[cfg(test)]
    pub(crate) fn backend(&self) -> &B {
        &self.backend
    }

    async fn run(&self, invocation: &Invocation) -> std::result::Result<Verdict, StoreError> {
        match with_deadline(self.timeout, self.backend.eval(invocation)).await {
            Ok(reply) => Verdict::from_reply(invocation.script, reply),
            Err(StoreError::ScriptNotLoaded(kind)) => {
                self.reregister(kind);
                Err(StoreError::ScriptNotLoaded(kind))
            }
            Err(e) => Err(e),
        }
    }

    /// Load a script the store has forgotten, off the request path.
    ///
    /// At most one load per script is in flight; callers that hit `NOSCRIPT`
    /// meanwhile only get the failure policy.
    fn reregister(&self, kind: ScriptKind) {
        let Some(flag) = self.reloading.get(&kind) else {
            return;
        };
        if flag.swap(true, Ordering::AcqRel) {
            trace!(script = %kind, "Re-registration already in flight");
            return;
        }

        let backend = Arc::clone(&self.backend);
        let reloading = Arc::clone(&self.reloading);
        let source = self.scripts.source(kind).to_string();
        let timeout = self.timeout;

        tokio::spawn(async move {
            match with_deadline(timeout, backend.register(kind, &source)).await {
                Ok(()) => info!(script = %kind, "Re-registered rate limit script"),
                Err(e) => {
                    warn!(script = %kind, error = %e, "Failed to re-register rate limit script")
                }
            }
            if let Some(flag) = reloading.get(&kind) {
                flag.store(false, Ordering::Release);
            }
        });
    }

    /// Best estimate of the store clock, passed to scripts as a fallback.
    fn now_hint(&self) -> i64 {
        local_now() + self.clock_offset
    }
}

async fn with_deadline<T, F>(timeout: Duration, fut: F) -> std::result::Result<T, StoreError>
where
    F: std::future::Future<Output = std::result::Result<T, StoreError>>,
{
    tokio::time::timeout(timeout, fut)
        .await
        .unwrap_or(Err(StoreError::Timeout(timeout)))
}

fn at_least_one(name: &str, value: u32) -> u32 {
    if value == 0 {
        warn!(parameter = name, "Zero rate limit parameter clamped to 1");
        return 1;
    }
    value
}

fn local_now() -> i64 {
    chrono::Utc::now().timestamp()
}
