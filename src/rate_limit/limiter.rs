use super::clock::Clock;
use super::types::{Bucket, Decision, RateLimitConfig};
use crate::metrics;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

/// In-memory token bucket rate limiter keyed by client identity
pub struct RateLimiter {
    /// One bucket per identity
    buckets: DashMap<String, Bucket>,
    config: RateLimitConfig,
}

impl RateLimiter {
    /// Create a new rate limiter with no tracked identities
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            buckets: DashMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Refill the identity's bucket for `now_ms`, then take one token if any is left.
    ///
    /// The whole read-modify-write runs under the map entry's shard lock, so
    /// concurrent calls for one identity are serialized.
    pub fn check_and_consume(&self, identity: &str, now_ms: u64) -> Decision {
        let identity = self.resolve_identity(identity);
        let max_tokens = self.config.max_tokens;
        let window_ms = self.config.window_ms;
        let reset_at_ms = now_ms.saturating_add(window_ms);

        let mut bucket = self
            .buckets
            .entry(identity.to_string())
            .or_insert_with(|| {
                debug!(identity, "Creating new bucket");
                Bucket::full(max_tokens, now_ms)
            });

        bucket.refill(now_ms, window_ms, max_tokens);

        if bucket.tokens == 0 {
            debug!(identity, "Bucket empty, rejecting");
            return Decision::denied(max_tokens, window_ms, reset_at_ms);
        }

        bucket.tokens -= 1;
        debug!(identity, remaining = bucket.tokens, "Rate limit check passed");

        Decision::allowed(bucket.tokens, max_tokens, reset_at_ms)
    }

    /// Tokens the identity would hold at `now_ms`, without consuming or refilling
    pub fn remaining(&self, identity: &str, now_ms: u64) -> u32 {
        let identity = self.resolve_identity(identity);

        match self.buckets.get(identity) {
            Some(bucket) => {
                let mut preview = *bucket;
                preview.refill(now_ms, self.config.window_ms, self.config.max_tokens);
                preview.tokens
            }
            None => self.config.max_tokens,
        }
    }

    /// Drop buckets untouched for the configured idle threshold plus one window.
    ///
    /// A request whose clock reading trails the sweep's `now_ms` by up to the
    /// idle threshold is still at least a full window past the dropped
    /// bucket's last refill, so a fresh bucket yields the same decision.
    pub fn evict_idle(&self, now_ms: u64) -> usize {
        let window_ms = self.config.window_ms;
        let threshold = self
            .config
            .idle_threshold_ms()
            .max(window_ms)
            .saturating_add(window_ms);
        let before = self.buckets.len();

        self.buckets
            .retain(|_, bucket| now_ms.saturating_sub(bucket.last_refill_ms) < threshold);

        before.saturating_sub(self.buckets.len())
    }

    /// Get the number of tracked identities (for monitoring)
    pub fn tracked_identities(&self) -> usize {
        self.buckets.len()
    }

    /// Snapshot of one identity's bucket
    pub fn bucket(&self, identity: &str) -> Option<Bucket> {
        self.buckets.get(identity).map(|b| *b)
    }

    fn resolve_identity<'a>(&'a self, identity: &'a str) -> &'a str {
        if identity.is_empty() {
            &self.config.fallback_identity
        } else {
            identity
        }
    }

    /// Clear all buckets (for testing)
    #[cfg(test)]
    pub fn clear(&self) {
        self.buckets.clear();
    }
}

/// Periodically evict idle buckets, once per window
pub fn spawn_eviction_task(limiter: Arc<RateLimiter>, clock: Arc<dyn Clock>) -> JoinHandle<()> {
    let period = limiter.config().window();

    info!(
        period_ms = limiter.config().window_ms,
        idle_windows = limiter.config().eviction.idle_windows,
        "Starting idle bucket eviction"
    );

    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;

            let evicted = limiter.evict_idle(clock.now_ms());
            let tracked = limiter.tracked_identities();

            if evicted > 0 {
                debug!(evicted, tracked, "Evicted idle buckets");
                metrics::record_evicted_buckets(evicted);
            }
            metrics::record_tracked_identities(tracked);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::clock::ManualClock;
    use std::time::Duration;

    const WINDOW: u64 = 300_000;

    fn limiter() -> RateLimiter {
        RateLimiter::new(RateLimitConfig::new(5, WINDOW))
    }

    #[test]
    fn test_allows_exactly_capacity_then_denies() {
        let limiter = limiter();

        for expected in (0..5).rev() {
            let decision = limiter.check_and_consume("10.0.0.1", 1_000);
            assert!(decision.allowed);
            assert_eq!(decision.remaining, expected);
            assert_eq!(decision.limit, 5);
            assert_eq!(decision.reset_at_ms, 1_000 + WINDOW);
        }

        let decision = limiter.check_and_consume("10.0.0.1", 1_000);
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
    }

    #[test]
    fn test_denied_decision_metadata() {
        let limiter = limiter();
        for _ in 0..5 {
            limiter.check_and_consume("1.2.3.4", 0);
        }

        let decision = limiter.check_and_consume("1.2.3.4", 100);
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
        assert_eq!(decision.limit, 5);
        assert_eq!(decision.retry_after_ms, Some(WINDOW));
        assert_eq!(decision.reset_at_ms, 300_100);
    }

    #[test]
    fn test_denial_does_not_go_negative() {
        let limiter = limiter();
        for _ in 0..20 {
            limiter.check_and_consume("10.0.0.1", 0);
        }

        let bucket = limiter.bucket("10.0.0.1").unwrap();
        assert_eq!(bucket.tokens, 0);
    }

    #[test]
    fn test_refill_after_one_window() {
        let limiter = limiter();
        for _ in 0..5 {
            assert!(limiter.check_and_consume("10.0.0.1", 0).allowed);
        }

        assert!(!limiter.check_and_consume("10.0.0.1", WINDOW - 1).allowed);

        // Drained again at WINDOW - 1, so the next full window starts there
        let decision = limiter.check_and_consume("10.0.0.1", 2 * WINDOW - 1);
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 4);
    }

    #[test]
    fn test_refill_at_exact_window_boundary() {
        let limiter = limiter();
        for _ in 0..5 {
            limiter.check_and_consume("10.0.0.1", 0);
        }

        let decision = limiter.check_and_consume("10.0.0.1", WINDOW);
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 4);
    }

    #[test]
    fn test_one_ms_short_of_window_is_denied() {
        let limiter = limiter();
        for _ in 0..5 {
            limiter.check_and_consume("10.0.0.1", 0);
        }

        assert!(!limiter.check_and_consume("10.0.0.1", WINDOW - 1).allowed);
    }

    #[test]
    fn test_multi_window_idle_caps_at_capacity() {
        let limiter = limiter();
        for _ in 0..5 {
            limiter.check_and_consume("10.0.0.1", 0);
        }

        assert_eq!(limiter.remaining("10.0.0.1", 3 * WINDOW), 5);

        let decision = limiter.check_and_consume("10.0.0.1", 3 * WINDOW);
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 4);

        for _ in 0..4 {
            assert!(limiter.check_and_consume("10.0.0.1", 3 * WINDOW).allowed);
        }
        assert!(!limiter.check_and_consume("10.0.0.1", 3 * WINDOW).allowed);
    }

    #[test]
    fn test_trickle_below_window_never_refills() {
        let limiter = limiter();
        for _ in 0..5 {
            limiter.check_and_consume("10.0.0.1", 0);
        }

        // Each call resets the refill clock, so sub-window spacing never accrues a window
        let mut now = 0;
        for _ in 0..10 {
            now += WINDOW - 1;
            assert!(!limiter.check_and_consume("10.0.0.1", now).allowed);
        }
    }

    #[test]
    fn test_drain_reject_recover_sequence() {
        let limiter = limiter();

        let remaining: Vec<u32> = (0..5)
            .map(|_| limiter.check_and_consume("1.2.3.4", 0))
            .inspect(|d| assert!(d.allowed))
            .map(|d| d.remaining)
            .collect();
        assert_eq!(remaining, vec![4, 3, 2, 1, 0]);

        let denied = limiter.check_and_consume("1.2.3.4", 100);
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after_ms, Some(300_000));
        assert_eq!(denied.reset_at_ms, 300_100);

        // The rejected call at t=100 moved the refill clock to 100
        assert!(!limiter.check_and_consume("1.2.3.4", 300_001).allowed);

        let decision = limiter.check_and_consume("1.2.3.4", 600_001);
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 4);
    }

    #[test]
    fn test_different_identities_are_isolated() {
        let limiter = RateLimiter::new(RateLimitConfig::new(2, WINDOW));

        for _ in 0..2 {
            assert!(limiter.check_and_consume("192.168.1.1", 0).allowed);
        }
        assert!(!limiter.check_and_consume("192.168.1.1", 0).allowed);

        let decision = limiter.check_and_consume("192.168.1.2", 0);
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 1);

        assert_eq!(limiter.tracked_identities(), 2);
    }

    #[test]
    fn test_empty_identity_uses_fallback_bucket() {
        let limiter = RateLimiter::new(RateLimitConfig::new(1, WINDOW));

        assert!(limiter.check_and_consume("", 0).allowed);
        assert!(!limiter.check_and_consume("anonymous", 0).allowed);
        assert!(limiter.bucket("anonymous").is_some());
        assert!(limiter.bucket("").is_none());
    }

    #[test]
    fn test_capacity_bound_over_random_schedule() {
        let limiter = RateLimiter::new(RateLimitConfig::new(3, 1_000));
        let mut now = 0;

        // Deterministic pseudo-random step sizes
        let mut seed: u64 = 0x2545_F491_4F6C_DD1D;
        for _ in 0..1_000 {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            now += seed % 2_500;

            let decision = limiter.check_and_consume("client", now);
            assert!(decision.remaining <= 3);

            let bucket = limiter.bucket("client").unwrap();
            assert!(bucket.tokens <= 3);
            assert_eq!(bucket.last_refill_ms, now);
        }
    }

    #[test]
    fn test_remaining_does_not_mutate() {
        let limiter = limiter();
        assert_eq!(limiter.remaining("10.0.0.1", 0), 5);
        assert_eq!(limiter.tracked_identities(), 0);

        limiter.check_and_consume("10.0.0.1", 0);
        let before = limiter.bucket("10.0.0.1").unwrap();
        assert_eq!(limiter.remaining("10.0.0.1", 10), 4);
        assert_eq!(limiter.bucket("10.0.0.1").unwrap(), before);
    }

    #[test]
    fn test_evict_idle_removes_only_stale_buckets() {
        let limiter = limiter();
        limiter.check_and_consume("stale", 0);
        limiter.check_and_consume("fresh", WINDOW);

        assert_eq!(limiter.evict_idle(2 * WINDOW - 1), 0);

        let evicted = limiter.evict_idle(2 * WINDOW);
        assert_eq!(evicted, 1);
        assert!(limiter.bucket("stale").is_none());
        assert!(limiter.bucket("fresh").is_some());
    }

    #[test]
    fn test_eviction_does_not_change_decisions() {
        let evicting = limiter();
        let keeping = limiter();

        for limiter in [&evicting, &keeping] {
            for _ in 0..5 {
                limiter.check_and_consume("10.0.0.1", 0);
            }
        }

        evicting.evict_idle(2 * WINDOW);
        assert_eq!(evicting.tracked_identities(), 0);

        // The request read its clock a full idle threshold before the sweep
        let a = evicting.check_and_consume("10.0.0.1", WINDOW);
        let b = keeping.check_and_consume("10.0.0.1", WINDOW);
        assert_eq!(a, b);
    }

    #[test]
    fn test_sweep_racing_earlier_request_keeps_drained_bucket() {
        let evicting = limiter();
        let keeping = limiter();

        for limiter in [&evicting, &keeping] {
            for _ in 0..5 {
                limiter.check_and_consume("a", 0);
            }
        }

        // The sweep runs at WINDOW, a request stamped just before it lands after
        assert_eq!(evicting.evict_idle(WINDOW), 0);

        let a = evicting.check_and_consume("a", WINDOW - 1);
        let b = keeping.check_and_consume("a", WINDOW - 1);
        assert!(!a.allowed);
        assert_eq!(a, b);
    }

    #[test]
    fn test_evict_respects_idle_windows() {
        let mut config = RateLimitConfig::new(5, 1_000);
        config.eviction.idle_windows = 3;
        let limiter = RateLimiter::new(config);

        limiter.check_and_consume("10.0.0.1", 0);
        assert_eq!(limiter.evict_idle(3_999), 0);
        assert_eq!(limiter.evict_idle(4_000), 1);
    }

    #[test]
    fn test_clear() {
        let limiter = limiter();
        limiter.check_and_consume("10.0.0.1", 0);
        limiter.clear();
        assert_eq!(limiter.tracked_identities(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_task_sweeps_each_window() {
        let limiter = Arc::new(RateLimiter::new(RateLimitConfig::new(5, 1_000)));
        let clock = Arc::new(ManualClock::new(0));

        limiter.check_and_consume("10.0.0.1", 0);
        let handle = spawn_eviction_task(limiter.clone(), clock.clone());

        clock.set(2_000);
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        tokio::task::yield_now().await;

        assert_eq!(limiter.tracked_identities(), 0);
        handle.abort();
    }
}
