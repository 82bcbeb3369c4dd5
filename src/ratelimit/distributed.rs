//! Redis-backed script execution.
//!
//! Every decision is a single `EVALSHA` on one long-lived multiplexed
//! connection. The scripts themselves carry all read-modify-write logic, so
//! concurrent callers in any number of processes are serialized by Redis.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use redis::aio::ConnectionManager;
use redis::{ErrorKind, Script};
use tracing::{debug, info};

use super::algorithm::{Invocation, ScriptKind};
use super::backend::ScriptBackend;
use crate::error::{RatekeeperError, Result, StoreError};

/// Production [`ScriptBackend`] talking to Redis.
pub struct RedisBackend {
    /// Shared, clonable handle; reconnects on its own after a drop.
    conn: ConnectionManager,
    /// SHA1 digests of the registered scripts.
    hashes: RwLock<HashMap<ScriptKind, String>>,
}

impl RedisBackend {
    /// Open the connection, giving up after `timeout`.
    pub async fn connect(connection_string: &str, timeout: Duration) -> Result<Self> {
        let client = redis::Client::open(connection_string).map_err(|e| {
            RatekeeperError::Config(format!("invalid store connection string: {}", e))
        })?;

        let conn = tokio::time::timeout(timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| StoreError::Timeout(timeout))?
            .map_err(StoreError::Transport)?;

        info!(addr = %redact(connection_string), "Connected to rate limit store");

        Ok(Self {
            conn,
            hashes: RwLock::new(HashMap::new()),
        })
    }

    fn hash(&self, kind: ScriptKind) -> Option<String> {
        self.hashes.read().get(&kind).cloned()
    }
}

#[async_trait]
impl ScriptBackend for RedisBackend {
    async fn register(
        &self,
        kind: ScriptKind,
        source: &str,
    ) -> std::result::Result<(), StoreError> {
        let script = Script::new(source);
        let mut conn = self.conn.clone();

        let sha = script.prepare_invoke().load_async(&mut conn).await?;
        debug!(script = %kind, sha = %sha, "Registered script");

        self.hashes.write().insert(kind, sha);
        Ok(())
    }

    async fn eval(&self, invocation: &Invocation) -> std::result::Result<Vec<i64>, StoreError> {
        let script = invocation.script;
        let sha = self.hash(script).ok_or(StoreError::ScriptNotLoaded(script))?;
        let mut conn = self.conn.clone();

        let mut cmd = redis::cmd("EVALSHA");
        cmd.arg(&sha)
            .arg(invocation.keys.len())
            .arg(&invocation.keys)
            .arg(&invocation.args);

        cmd.query_async::<Vec<i64>>(&mut conn)
            .await
            .map_err(|e| match e.kind() {
                ErrorKind::NoScriptError => StoreError::ScriptNotLoaded(script),
                ErrorKind::TypeError => StoreError::UnexpectedReply {
                    script,
                    detail: e.to_string(),
                },
                _ => StoreError::Transport(e),
            })
    }

    async fn server_time(&self) -> std::result::Result<i64, StoreError> {
        let mut conn = self.conn.clone();
        let (secs, _micros): (i64, i64) = redis::cmd("TIME").query_async(&mut conn).await?;
        Ok(secs)
    }
}

/// Strip credentials from a connection string before logging it.
fn redact(connection_string: &str) -> String {
    match (connection_string.find("://"), connection_string.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}***{}", &connection_string[..scheme_end + 3], &connection_string[at..])
        }
        _ => connection_string.to_string(),
    }
}
