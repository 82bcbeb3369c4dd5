//! Throttling algorithms and their script invocations.

use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Throttling semantics for a decision.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    /// Counter per aligned window. Allows up to twice the limit across a boundary.
    #[default]
    FixedWindow,
    /// Timestamped log of allowed calls within the trailing window.
    SlidingLog,
    /// Lazily refilled bucket with fractional refill rate.
    TokenBucket,
    /// Token bucket and sliding log that must both agree.
    Hybrid,
}

impl Algorithm {
    pub const ALL: [Algorithm; 4] = [
        Algorithm::FixedWindow,
        Algorithm::SlidingLog,
        Algorithm::TokenBucket,
        Algorithm::Hybrid,
    ];

    /// The script that executes this algorithm.
    pub fn script(&self) -> ScriptKind {
        match self {
            Algorithm::FixedWindow => ScriptKind::FixedWindow,
            Algorithm::SlidingLog => ScriptKind::SlidingLog,
            Algorithm::TokenBucket => ScriptKind::TokenBucket,
            Algorithm::Hybrid => ScriptKind::Hybrid,
        }
    }

    /// Build the key set and argument vector for one decision.
    ///
    /// `now_hint` is the caller's estimate of the store clock in Unix seconds;
    /// scripts only use it when they cannot read the store clock themselves.
    pub fn invocation(
        &self,
        base_key: &str,
        limit: u32,
        window_secs: u32,
        now_hint: i64,
    ) -> Invocation {
        let (keys, args) = match self {
            // The window index is derived from the store clock inside the script.
            Algorithm::FixedWindow => (
                vec![base_key.to_string()],
                vec![limit.to_string(), window_secs.to_string()],
            ),
            Algorithm::SlidingLog => (
                vec![format!("{}:log", base_key), format!("{}:log:seq", base_key)],
                vec![limit.to_string(), window_secs.to_string()],
            ),
            Algorithm::TokenBucket => (
                vec![format!("{}:tb", base_key), format!("{}:tb:ts", base_key)],
                vec![
                    limit.to_string(),
                    token_bucket_refill_rate(limit, window_secs).to_string(),
                    window_secs.to_string(),
                ],
            ),
            Algorithm::Hybrid => (
                vec![
                    format!("{}:bucket", base_key),
                    format!("{}:bucket:ts", base_key),
                    format!("{}:log", base_key),
                    format!("{}:log:seq", base_key),
                ],
                vec![
                    limit.to_string(),
                    hybrid_refill_rate(limit, window_secs).to_string(),
                    window_secs.to_string(),
                ],
            ),
        };

        Invocation::new(self.script(), keys, args, now_hint)
    }
}

impl std::str::FromStr for Algorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "fixed_window" | "fixedwindow" => Ok(Algorithm::FixedWindow),
            "sliding_log" | "slidinglog" => Ok(Algorithm::SlidingLog),
            "token_bucket" | "tokenbucket" => Ok(Algorithm::TokenBucket),
            "hybrid" => Ok(Algorithm::Hybrid),
            other => Err(format!("unknown algorithm '{}'", other)),
        }
    }
}

impl std::fmt::Display for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.script().name())
    }
}

/// Fractional refill rate for the pure token bucket: a full bucket per window.
pub fn token_bucket_refill_rate(limit: u32, window_secs: u32) -> f64 {
    limit as f64 / window_secs as f64
}

/// Integer refill rate for the hybrid path: `ceil(limit / window)`, at least 1.
pub fn hybrid_refill_rate(limit: u32, window_secs: u32) -> u32 {
    limit.div_ceil(window_secs).max(1)
}

/// The server-side scripts registered at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScriptKind {
    FixedWindow,
    SlidingLog,
    TokenBucket,
    Hybrid,
    WarmUp,
}

impl ScriptKind {
    pub const ALL: [ScriptKind; 5] = [
        ScriptKind::FixedWindow,
        ScriptKind::SlidingLog,
        ScriptKind::TokenBucket,
        ScriptKind::Hybrid,
        ScriptKind::WarmUp,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ScriptKind::FixedWindow => "fixed_window",
            ScriptKind::SlidingLog => "sliding_log",
            ScriptKind::TokenBucket => "token_bucket",
            ScriptKind::Hybrid => "hybrid",
            ScriptKind::WarmUp => "warm_up",
        }
    }

    /// Number of integers in a well-formed reply.
    fn reply_len(&self) -> usize {
        match self {
            ScriptKind::Hybrid => 3,
            ScriptKind::WarmUp => 1,
            _ => 2,
        }
    }
}

impl std::fmt::Display for ScriptKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One script call: which script, its KEYS and its ARGV.
///
/// The clock hint is always the last ARGV entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub script: ScriptKind,
    pub keys: Vec<String>,
    pub args: Vec<String>,
}

impl Invocation {
    pub fn new(
        script: ScriptKind,
        keys: Vec<String>,
        mut args: Vec<String>,
        now_hint: i64,
    ) -> Self {
        args.push(now_hint.to_string());
        Self { script, keys, args }
    }

    /// Seed `bucket_key` and `bucket_key:ts` if absent.
    pub fn warm_up(bucket_key: &str, capacity: u32, expiry_secs: u32, now_hint: i64) -> Self {
        Self::new(
            ScriptKind::WarmUp,
            vec![bucket_key.to_string(), format!("{}:ts", bucket_key)],
            vec![capacity.to_string(), expiry_secs.to_string()],
            now_hint,
        )
    }
}

/// Decoded script reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub allowed: bool,
    /// Diagnostic counters following the verdict flag: the window count for
    /// fixed window and sliding log, the remaining tokens for token bucket,
    /// and `[tokens, log_count]` for hybrid.
    pub counters: Vec<i64>,
}

impl Verdict {
    /// Decode the `{allowed, ...}` integer array a decision script returns.
    pub fn from_reply(script: ScriptKind, reply: Vec<i64>) -> Result<Self, StoreError> {
        let unexpected = |detail: String| StoreError::UnexpectedReply { script, detail };

        if reply.len() != script.reply_len() {
            return Err(unexpected(format!(
                "expected {} integers, got {:?}",
                script.reply_len(),
                reply
            )));
        }

        let allowed = match reply[0] {
            0 => false,
            1 => true,
            other => return Err(unexpected(format!("verdict flag {} is not 0 or 1", other))),
        };

        Ok(Self {
            allowed,
            counters: reply[1..].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_window_invocation() {
        let inv = Algorithm::FixedWindow.invocation("rl:ip:1.2.3.4", 5, 10, 1_700_000_000);
        assert_eq!(inv.script, ScriptKind::FixedWindow);
        assert_eq!(inv.keys, vec!["rl:ip:1.2.3.4"]);
        assert_eq!(inv.args, vec!["5", "10", "1700000000"]);
    }

    #[test]
    fn test_sliding_log_keys() {
        let inv = Algorithm::SlidingLog.invocation("rl:user:7", 3, 10, 0);
        assert_eq!(inv.keys, vec!["rl:user:7:log", "rl:user:7:log:seq"]);
        assert_eq!(inv.args, vec!["3", "10", "0"]);
    }

    #[test]
    fn test_token_bucket_uses_fractional_rate() {
        let inv = Algorithm::TokenBucket.invocation("rl:global", 3, 10, 0);
        assert_eq!(inv.keys, vec!["rl:global:tb", "rl:global:tb:ts"]);
        assert_eq!(inv.args, vec!["3", "0.3", "10", "0"]);
    }

    #[test]
    fn test_hybrid_uses_integer_rate() {
        let inv = Algorithm::Hybrid.invocation("rl:global", 3, 10, 0);
        assert_eq!(
            inv.keys,
            vec![
                "rl:global:bucket",
                "rl:global:bucket:ts",
                "rl:global:log",
                "rl:global:log:seq"
            ]
        );
        assert_eq!(inv.args, vec!["3", "1", "10", "0"]);
    }

    #[test]
    fn test_refill_rate_rounding_differs() {
        assert_eq!(token_bucket_refill_rate(3, 10), 0.3);
        assert_eq!(hybrid_refill_rate(3, 10), 1);
        assert_eq!(hybrid_refill_rate(100, 60), 2);
        assert_eq!(hybrid_refill_rate(120, 60), 2);
        assert_eq!(hybrid_refill_rate(1, 3600), 1);
    }

    #[test]
    fn test_warm_up_invocation() {
        let inv = Invocation::warm_up("rl:bucket", 100, 60, 42);
        assert_eq!(inv.script, ScriptKind::WarmUp);
        assert_eq!(inv.keys, vec!["rl:bucket", "rl:bucket:ts"]);
        assert_eq!(inv.args, vec!["100", "60", "42"]);
    }

    #[test]
    fn test_verdict_decoding() {
        let verdict = Verdict::from_reply(ScriptKind::Hybrid, vec![1, 2, 1]).unwrap();
        assert!(verdict.allowed);
        assert_eq!(verdict.counters, vec![2, 1]);

        let verdict = Verdict::from_reply(ScriptKind::FixedWindow, vec![0, 6]).unwrap();
        assert!(!verdict.allowed);
    }

    #[test]
    fn test_verdict_rejects_bad_shapes() {
        assert!(Verdict::from_reply(ScriptKind::FixedWindow, vec![]).is_err());
        assert!(Verdict::from_reply(ScriptKind::FixedWindow, vec![1, 2, 3]).is_err());
        assert!(Verdict::from_reply(ScriptKind::SlidingLog, vec![2, 1]).is_err());
    }

    #[test]
    fn test_algorithm_parse_and_display() {
        assert_eq!("token-bucket".parse::<Algorithm>().unwrap(), Algorithm::TokenBucket);
        assert_eq!("FixedWindow".parse::<Algorithm>().unwrap(), Algorithm::FixedWindow);
        assert!("leaky_bucket".parse::<Algorithm>().is_err());
        assert_eq!(Algorithm::SlidingLog.to_string(), "sliding_log");
    }
}
