//! In-process emulation of the rate limit scripts.
//!
//! `LocalBackend` executes the same invocations the Redis scripts receive,
//! against a keyspace held in this process. Every invocation runs under one
//! lock, which gives the same atomicity the store gives a Lua script. It is
//! meant for development and tests: its state is private to the process, so
//! it never enforces a limit across a fleet.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;
#[cfg(test)]
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::trace;

use super::algorithm::{Invocation, ScriptKind};
use super::backend::ScriptBackend;
use crate::error::StoreError;

/// Source of "now" for the local keyspace, in Unix seconds.
pub trait Clock: Send + Sync {
    fn now(&self) -> i64;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }
}

/// A clock that only moves when told to.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

#[cfg(test)]
impl ManualClock {
    pub fn new(start: i64) -> Self {
        Self {
            now: AtomicI64::new(start),
        }
    }

    pub fn advance(&self, secs: i64) {
        self.now.fetch_add(secs, Ordering::SeqCst);
    }

    pub fn set(&self, secs: i64) {
        self.now.store(secs, Ordering::SeqCst);
    }
}

#[cfg(test)]
impl Clock for ManualClock {
    fn now(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
enum Value {
    Int(i64),
    /// Sorted set, ordered by (score, member)
    Log(Vec<(i64, String)>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<i64>,
}

/// Keyspace with Redis-like expiry: a key is gone once `now >= expires_at`.
#[derive(Debug, Default)]
struct Keyspace {
    entries: HashMap<String, Entry>,
}

impl Keyspace {
    fn live(&mut self, key: &str, now: i64) -> Option<&mut Entry> {
        let expired = self
            .entries
            .get(key)
            .and_then(|e| e.expires_at)
            .is_some_and(|at| at <= now);
        if expired {
            self.entries.remove(key);
        }
        self.entries.get_mut(key)
    }

    fn get_int(&mut self, key: &str, now: i64) -> Option<i64> {
        match self.live(key, now) {
            Some(Entry {
                value: Value::Int(v),
                ..
            }) => Some(*v),
            _ => None,
        }
    }

    fn set_int(&mut self, key: &str, value: i64, ttl: i64, now: i64) {
        self.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Int(value),
                expires_at: Some(now + ttl),
            },
        );
    }

    /// `SET key value NX EX ttl`
    fn set_int_nx(&mut self, key: &str, value: i64, ttl: i64, now: i64) -> bool {
        if self.live(key, now).is_some() {
            return false;
        }
        self.set_int(key, value, ttl, now);
        true
    }

    /// `INCR`, keeping any existing expiry.
    fn incr(&mut self, key: &str, now: i64) -> i64 {
        if let Some(Entry {
            value: Value::Int(v),
            ..
        }) = self.live(key, now)
        {
            *v += 1;
            return *v;
        }
        self.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Int(1),
                expires_at: None,
            },
        );
        1
    }

    fn expire(&mut self, key: &str, ttl: i64, now: i64) {
        if let Some(entry) = self.live(key, now) {
            entry.expires_at = Some(now + ttl);
        }
    }

    fn log(&mut self, key: &str, now: i64) -> Option<&mut Vec<(i64, String)>> {
        match self.live(key, now) {
            Some(Entry {
                value: Value::Log(members),
                ..
            }) => Some(members),
            _ => None,
        }
    }

    /// `ZCOUNT key min +inf`
    fn log_count_from(&mut self, key: &str, min_score: i64, now: i64) -> i64 {
        self.log(key, now)
            .map(|members| members.iter().filter(|(score, _)| *score >= min_score).count() as i64)
            .unwrap_or(0)
    }

    /// `ZREMRANGEBYSCORE key -inf (cutoff`; an emptied set disappears.
    fn log_evict_before(&mut self, key: &str, cutoff: i64, now: i64) {
        let emptied = match self.log(key, now) {
            Some(members) => {
                members.retain(|(score, _)| *score >= cutoff);
                members.is_empty()
            }
            None => false,
        };
        if emptied {
            self.entries.remove(key);
        }
    }

    fn log_add(&mut self, key: &str, score: i64, member: String, now: i64) {
        if let Some(members) = self.log(key, now) {
            members.retain(|(_, m)| *m != member);
            let at = members.partition_point(|(s, m)| (*s, m.as_str()) < (score, member.as_str()));
            members.insert(at, (score, member));
            return;
        }
        self.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Log(vec![(score, member)]),
                expires_at: None,
            },
        );
    }
}

/// In-process [`ScriptBackend`].
///
/// Registration only records which scripts are known; the behavior of each
/// kind is built in and mirrors the Lua sources shipped with the crate.
#[derive(Clone)]
pub struct LocalBackend {
    keyspace: Arc<Mutex<Keyspace>>,
    registered: Arc<Mutex<HashSet<ScriptKind>>>,
    clock: Arc<dyn Clock>,
}

impl LocalBackend {
    /// Create a backend on the wall clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            keyspace: Arc::new(Mutex::new(Keyspace::default())),
            registered: Arc::new(Mutex::new(HashSet::new())),
            clock,
        }
    }

    /// Forget every registered script, like `SCRIPT FLUSH`.
    #[cfg(test)]
    pub(crate) fn flush_scripts(&self) {
        self.registered.lock().clear();
    }

    /// Read an integer key, if it exists and has not expired.
    #[cfg(test)]
    pub(crate) fn integer(&self, key: &str) -> Option<i64> {
        let now = self.clock.now();
        self.keyspace.lock().get_int(key, now)
    }

    /// Members of a log key in score order.
    #[cfg(test)]
    pub(crate) fn members(&self, key: &str) -> Vec<String> {
        let now = self.clock.now();
        self.keyspace
            .lock()
            .log(key, now)
            .map(|members| members.iter().map(|(_, m)| m.clone()).collect())
            .unwrap_or_default()
    }

    #[cfg(test)]
    pub(crate) fn contains_key(&self, key: &str) -> bool {
        let now = self.clock.now();
        self.keyspace.lock().live(key, now).is_some()
    }

    fn execute(&self, invocation: &Invocation) -> Result<Vec<i64>, StoreError> {
        let now = self.clock.now();
        let mut keyspace = self.keyspace.lock();
        let call = Call { invocation, now };

        trace!(script = %invocation.script, keys = ?invocation.keys, now, "Executing local script");

        match invocation.script {
            ScriptKind::FixedWindow => call.fixed_window(&mut keyspace),
            ScriptKind::SlidingLog => call.sliding_log(&mut keyspace),
            ScriptKind::TokenBucket => call.token_bucket(&mut keyspace),
            ScriptKind::Hybrid => call.hybrid(&mut keyspace),
            ScriptKind::WarmUp => call.warm_up(&mut keyspace),
        }
    }
}

impl Default for LocalBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ScriptBackend for LocalBackend {
    async fn register(&self, kind: ScriptKind, _source: &str) -> Result<(), StoreError> {
        self.registered.lock().insert(kind);
        Ok(())
    }

    async fn eval(&self, invocation: &Invocation) -> Result<Vec<i64>, StoreError> {
        if !self.registered.lock().contains(&invocation.script) {
            return Err(StoreError::ScriptNotLoaded(invocation.script));
        }
        self.execute(invocation)
    }

    async fn server_time(&self) -> Result<i64, StoreError> {
        Ok(self.clock.now())
    }
}

/// One invocation being executed against the keyspace.
struct Call<'a> {
    invocation: &'a Invocation,
    now: i64,
}

impl Call<'_> {
    fn key(&self, index: usize) -> Result<&str, StoreError> {
        self.invocation
            .keys
            .get(index)
            .map(String::as_str)
            .ok_or_else(|| self.bad_call(format!("missing KEYS[{}]", index + 1)))
    }

    fn arg<T: FromStr>(&self, index: usize) -> Result<T, StoreError> {
        self.invocation
            .args
            .get(index)
            .and_then(|raw| raw.parse().ok())
            .ok_or_else(|| self.bad_call(format!("missing or malformed ARGV[{}]", index + 1)))
    }

    fn bad_call(&self, detail: String) -> StoreError {
        StoreError::UnexpectedReply {
            script: self.invocation.script,
            detail,
        }
    }

    fn fixed_window(&self, ks: &mut Keyspace) -> Result<Vec<i64>, StoreError> {
        let base = self.key(0)?;
        let limit: i64 = self.arg(0)?;
        let window: i64 = self.arg(1)?;
        if window <= 0 {
            return Err(self.bad_call(format!("window {} must be positive", window)));
        }

        let counter = format!("{}:fw:{}", base, self.now.div_euclid(window));
        let count = ks.incr(&counter, self.now);
        if count == 1 {
            ks.expire(&counter, window, self.now);
        }

        Ok(vec![(count <= limit) as i64, count])
    }

    fn sliding_log(&self, ks: &mut Keyspace) -> Result<Vec<i64>, StoreError> {
        let (log_key, seq_key) = (self.key(0)?, self.key(1)?);
        let limit: i64 = self.arg(0)?;
        let window: i64 = self.arg(1)?;

        ks.log_evict_before(log_key, self.now - window, self.now);
        let count = ks.log_count_from(log_key, i64::MIN, self.now);
        if count >= limit {
            return Ok(vec![0, count]);
        }

        self.append(ks, log_key, seq_key, window);
        Ok(vec![1, count + 1])
    }

    fn token_bucket(&self, ks: &mut Keyspace) -> Result<Vec<i64>, StoreError> {
        let (bucket_key, ts_key) = (self.key(0)?, self.key(1)?);
        let capacity: i64 = self.arg(0)?;
        let rate: f64 = self.arg(1)?;
        let ttl: i64 = self.arg(2)?;

        let (mut tokens, last) = self.refill(ks, bucket_key, ts_key, capacity, rate);
        let allowed = tokens > 0;
        if allowed {
            tokens -= 1;
        }

        ks.set_int(bucket_key, tokens, ttl, self.now);
        ks.set_int(ts_key, last, ttl, self.now);
        Ok(vec![allowed as i64, tokens])
    }

    fn hybrid(&self, ks: &mut Keyspace) -> Result<Vec<i64>, StoreError> {
        let (bucket_key, ts_key) = (self.key(0)?, self.key(1)?);
        let (log_key, seq_key) = (self.key(2)?, self.key(3)?);
        let capacity: i64 = self.arg(0)?;
        let rate: i64 = self.arg(1)?;
        let window: i64 = self.arg(2)?;

        let (mut tokens, last) = self.refill(ks, bucket_key, ts_key, capacity, rate as f64);
        let cutoff = self.now - window;
        let mut count = ks.log_count_from(log_key, cutoff, self.now);

        let allowed = tokens > 0 && count < capacity;
        if allowed {
            tokens -= 1;
            ks.log_evict_before(log_key, cutoff, self.now);
            self.append(ks, log_key, seq_key, window);
            count += 1;
        }

        ks.set_int(bucket_key, tokens, window, self.now);
        ks.set_int(ts_key, last, window, self.now);
        Ok(vec![allowed as i64, tokens, count])
    }

    fn warm_up(&self, ks: &mut Keyspace) -> Result<Vec<i64>, StoreError> {
        let (bucket_key, ts_key) = (self.key(0)?, self.key(1)?);
        let capacity: i64 = self.arg(0)?;
        let expiry: i64 = self.arg(1)?;

        let seeded = ks.set_int_nx(bucket_key, capacity, expiry, self.now);
        ks.set_int_nx(ts_key, self.now, expiry, self.now);
        Ok(vec![seeded as i64])
    }

    /// Lazy refill, whole tokens only. The timestamp only advances when at
    /// least one token was earned so partial progress carries over.
    fn refill(
        &self,
        ks: &mut Keyspace,
        bucket_key: &str,
        ts_key: &str,
        capacity: i64,
        rate: f64,
    ) -> (i64, i64) {
        let mut tokens = ks.get_int(bucket_key, self.now).unwrap_or(capacity);
        let mut last = ks.get_int(ts_key, self.now).unwrap_or(self.now);

        let add = ((self.now - last).max(0) as f64 * rate).floor() as i64;
        if add > 0 {
            tokens = tokens.saturating_add(add);
            last = self.now;
        }

        (tokens.clamp(0, capacity), last)
    }

    fn append(&self, ks: &mut Keyspace, log_key: &str, seq_key: &str, window: i64) {
        let seq = ks.incr(seq_key, self.now);
        ks.log_add(log_key, self.now, format!("{}:{}", self.now, seq), self.now);
        ks.expire(log_key, window, self.now);
        ks.expire(seq_key, window, self.now);
    }
}
