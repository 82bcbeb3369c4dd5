//! Runs the Lua scripts against a live Redis.
//!
//! Skipped unless `REDIS_URL` is set, e.g.
//! `REDIS_URL=redis://127.0.0.1:6379 cargo test --test redis_store`.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use ratekeeper::config::RatekeeperConfig;
use ratekeeper::ratelimit::{Algorithm, RateLimitStore, RedisBackend};

async fn store(fail_open: bool) -> Option<RateLimitStore<RedisBackend>> {
    let url = std::env::var("REDIS_URL").ok()?;

    let mut config = RatekeeperConfig::default();
    config.store.connection_string = url;
    config.store.timeout_ms = 2_000;
    config.rate_limiting.fail_open = fail_open;

    Some(RateLimitStore::<RedisBackend>::connect(&config).await.unwrap())
}

/// A key no other test run has used.
fn unique_key(name: &str) -> String {
    let nanos = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
    format!("rl:test:{}:{}:{}", name, std::process::id(), nanos)
}

/// Sleep until just after the next multiple of `window_secs` on the wall clock.
async fn sleep_to_window_start(window_secs: u64) {
    let now_ms = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_millis() as u64;
    let window_ms = window_secs * 1_000;
    let wait = window_ms - now_ms % window_ms + 50;
    tokio::time::sleep(Duration::from_millis(wait)).await;
}

#[tokio::test]
async fn test_limit_plus_one_denies() {
    let Some(store) = store(true).await else {
        return;
    };

    for algorithm in Algorithm::ALL {
        let key = unique_key(&algorithm.to_string());
        for i in 1..=5 {
            assert!(
                store.try_decide(&key, 5, 60, algorithm).await,
                "{} call {} should be allowed",
                algorithm,
                i
            );
        }
        assert!(!store.try_decide(&key, 5, 60, algorithm).await, "{} call 6", algorithm);
    }
}

#[tokio::test]
async fn test_sliding_log_counts_rapid_calls_separately() {
    let Some(store) = store(true).await else {
        return;
    };
    let key = unique_key("log");

    for expected in 1..=3 {
        let verdict = store.decide(&key, 3, 60, Algorithm::SlidingLog).await.unwrap();
        assert!(verdict.allowed);
        assert_eq!(verdict.counters, vec![expected]);
    }
    let verdict = store.decide(&key, 3, 60, Algorithm::SlidingLog).await.unwrap();
    assert!(!verdict.allowed);
    assert_eq!(verdict.counters, vec![3]);
}

#[tokio::test]
async fn test_hybrid_denial_leaves_log_count() {
    let Some(store) = store(true).await else {
        return;
    };
    let key = unique_key("hybrid");

    for _ in 0..2 {
        assert!(store.try_decide(&key, 2, 60, Algorithm::Hybrid).await);
    }
    let verdict = store.decide(&key, 2, 60, Algorithm::Hybrid).await.unwrap();
    assert!(!verdict.allowed);
    assert_eq!(verdict.counters[1], 2);

    let verdict = store.decide(&key, 2, 60, Algorithm::Hybrid).await.unwrap();
    assert_eq!(verdict.counters[1], 2);
}

#[tokio::test]
async fn test_warm_up_does_not_reset_live_bucket() {
    let Some(store) = store(false).await else {
        return;
    };
    let key = unique_key("warm");
    let bucket = format!("{}:tb", key);

    assert!(store.warm_up(&bucket, 3, 60).await.unwrap());
    let verdict = store.decide(&key, 3, 60, Algorithm::TokenBucket).await.unwrap();
    assert_eq!(verdict.counters, vec![2]);

    assert!(!store.warm_up(&bucket, 3, 60).await.unwrap());
    let verdict = store.decide(&key, 3, 60, Algorithm::TokenBucket).await.unwrap();
    assert_eq!(verdict.counters, vec![1]);
}

#[tokio::test]
async fn test_concurrent_fixed_window() {
    let Some(store) = store(true).await else {
        return;
    };
    let key = unique_key("race");

    let calls = (0..40).map(|_| {
        let store = store.clone();
        let key = key.clone();
        tokio::spawn(async move { store.try_decide(&key, 15, 60, Algorithm::FixedWindow).await })
    });
    let results = futures::future::join_all(calls).await;
    let allowed = results.into_iter().filter(|r| *r.as_ref().unwrap()).count();

    // a window boundary during the burst can only add to the count
    assert!(allowed >= 15, "only {} calls admitted", allowed);
    assert!(allowed <= 30, "{} calls admitted", allowed);
}

#[tokio::test]
async fn test_fixed_window_resets_in_next_window() {
    let Some(store) = store(true).await else {
        return;
    };
    let key = unique_key("fw-reset");

    sleep_to_window_start(2).await;
    for expected in 1..=2 {
        let verdict = store.decide(&key, 2, 2, Algorithm::FixedWindow).await.unwrap();
        assert!(verdict.allowed);
        assert_eq!(verdict.counters, vec![expected]);
    }
    let verdict = store.decide(&key, 2, 2, Algorithm::FixedWindow).await.unwrap();
    assert!(!verdict.allowed);
    assert_eq!(verdict.counters, vec![3]);

    tokio::time::sleep(Duration::from_secs(2)).await;
    let verdict = store.decide(&key, 2, 2, Algorithm::FixedWindow).await.unwrap();
    assert!(verdict.allowed);
    assert_eq!(verdict.counters, vec![1]);
}

#[tokio::test]
async fn test_sliding_log_oldest_member_ages_out() {
    let Some(store) = store(true).await else {
        return;
    };
    let key = unique_key("log-age");

    assert!(store.decide(&key, 2, 3, Algorithm::SlidingLog).await.unwrap().allowed);
    tokio::time::sleep(Duration::from_millis(2_500)).await;

    let verdict = store.decide(&key, 2, 3, Algorithm::SlidingLog).await.unwrap();
    assert!(verdict.allowed);
    assert_eq!(verdict.counters, vec![2]);
    assert!(!store.decide(&key, 2, 3, Algorithm::SlidingLog).await.unwrap().allowed);

    // the first member is now older than the window, the second is not
    tokio::time::sleep(Duration::from_millis(2_100)).await;
    let verdict = store.decide(&key, 2, 3, Algorithm::SlidingLog).await.unwrap();
    assert!(verdict.allowed);
    assert_eq!(verdict.counters, vec![2]);

    let verdict = store.decide(&key, 2, 3, Algorithm::SlidingLog).await.unwrap();
    assert!(!verdict.allowed);
    assert_eq!(verdict.counters, vec![2]);
}

#[tokio::test]
async fn test_token_bucket_floor_refill() {
    let Some(store) = store(true).await else {
        return;
    };
    let key = unique_key("tb-floor");

    for _ in 0..3 {
        assert!(store.try_decide(&key, 3, 10, Algorithm::TokenBucket).await);
    }
    assert!(!store.try_decide(&key, 3, 10, Algorithm::TokenBucket).await);

    // at most floor(3 * 0.3) = 0 tokens earned
    tokio::time::sleep(Duration::from_millis(1_100)).await;
    assert!(!store.try_decide(&key, 3, 10, Algorithm::TokenBucket).await);

    // between floor(4 * 0.3) and floor(6 * 0.3): exactly one token
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(store.try_decide(&key, 3, 10, Algorithm::TokenBucket).await);
    assert!(!store.try_decide(&key, 3, 10, Algorithm::TokenBucket).await);
}

#[tokio::test]
async fn test_token_bucket_never_exceeds_capacity() {
    let Some(store) = store(true).await else {
        return;
    };
    let key = unique_key("tb-cap");

    let verdict = store.decide(&key, 3, 3, Algorithm::TokenBucket).await.unwrap();
    assert_eq!(verdict.counters, vec![2]);

    // two or three tokens earned at 1/s, capped at 3 before taking one
    tokio::time::sleep(Duration::from_millis(2_200)).await;
    let verdict = store.decide(&key, 3, 3, Algorithm::TokenBucket).await.unwrap();
    assert!(verdict.allowed);
    assert_eq!(verdict.counters, vec![2]);
}

#[tokio::test]
async fn test_warm_up_expiry_falls_back_to_full_bucket() {
    let Some(store) = store(false).await else {
        return;
    };
    let key = unique_key("warm-expiry");
    let bucket = format!("{}:tb", key);

    assert!(store.warm_up(&bucket, 1, 1).await.unwrap());
    tokio::time::sleep(Duration::from_millis(1_500)).await;

    let verdict = store.decide(&key, 3, 60, Algorithm::TokenBucket).await.unwrap();
    assert!(verdict.allowed);
    assert_eq!(verdict.counters, vec![2]);
}

#[tokio::test]
async fn test_hybrid_refill_alone_is_not_enough() {
    let Some(store) = store(true).await else {
        return;
    };
    let key = unique_key("hybrid-refill");

    for _ in 0..3 {
        assert!(store.try_decide(&key, 3, 3, Algorithm::Hybrid).await);
    }

    tokio::time::sleep(Duration::from_millis(1_500)).await;
    let verdict = store.decide(&key, 3, 3, Algorithm::Hybrid).await.unwrap();
    assert!(!verdict.allowed);
    assert!(verdict.counters[0] >= 1, "bucket did not refill: {:?}", verdict.counters);
    assert_eq!(verdict.counters[1], 3);
}
