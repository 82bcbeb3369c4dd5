//! Script backend trait for abstracting the shared store.

use async_trait::async_trait;

use super::algorithm::{Invocation, ScriptKind};
use crate::error::StoreError;

/// A store that can execute the rate limit scripts atomically.
///
/// This trait abstracts over the Redis backend used in production and the
/// in-process `LocalBackend` used for development and tests, so the
/// orchestration in `RateLimitStore` works with either.
#[async_trait]
pub trait ScriptBackend: Send + Sync {
    /// Register a script so later invocations can refer to it by kind.
    async fn register(&self, kind: ScriptKind, source: &str) -> Result<(), StoreError>;

    /// Execute one invocation as a single atomic step and return the raw
    /// integer reply.
    ///
    /// Returns `StoreError::ScriptNotLoaded` when the store has forgotten
    /// the script.
    async fn eval(&self, invocation: &Invocation) -> Result<Vec<i64>, StoreError>;

    /// The store's clock in Unix seconds.
    async fn server_time(&self) -> Result<i64, StoreError>;
}
