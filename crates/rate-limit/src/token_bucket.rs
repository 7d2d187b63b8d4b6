use std::sync::Arc;
use std::time::Duration;

use ratekeeper_common::{LimiterConfig, RatekeeperError, RatekeeperResult};
use tokio::time::Instant;
use tracing::{trace, warn};

use crate::bucket::{Bucket, Verdict};
use crate::store::{BucketStore, Loaded};

/// Longest a bucket is assumed to sit untouched before its next refill.
/// Bounds `token_rate * elapsed` so it cannot overflow the token counter.
const REFILL_HORIZON: Duration = Duration::from_secs(5000);

/// Tuning knobs besides rate and burst.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimiterOptions {
    /// How often the sweeper scans for idle buckets.
    pub sweep_interval: Duration,
    /// Buckets with no allowed request for this long are evicted.
    pub idle_timeout: Duration,
    /// Attempts before [`TokenBucketLimiter::allow`] gives up and denies.
    pub max_cas_retries: u32,
}

impl Default for LimiterOptions {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(5 * 60),
            idle_timeout: Duration::from_secs(60 * 60),
            max_cas_retries: 100,
        }
    }
}

impl From<&LimiterConfig> for LimiterOptions {
    fn from(config: &LimiterConfig) -> Self {
        Self {
            sweep_interval: Duration::from_secs(config.sweep_interval_secs),
            idle_timeout: Duration::from_secs(config.idle_timeout_secs),
            max_cas_retries: config.max_cas_retries,
        }
    }
}

/// A concurrent token bucket rate limiter.
///
/// Each key gets its own bucket holding up to `burst_size` whole tokens,
/// refilled at `token_rate` tokens per second. Every allowed request spends
/// one token. Buckets live in a shared [`BucketStore`] and are updated with
/// compare-and-swap, never under a lock held across the refill computation.
#[derive(Debug)]
pub struct TokenBucketLimiter {
    store: Arc<BucketStore>,
    token_rate: f64,
    burst_size: u64,
    max_cas_retries: u32,
}

impl TokenBucketLimiter {
    /// Create a limiter over `store` after validating the parameters.
    ///
    /// * `token_rate` - tokens per second, must not be negative
    /// * `burst_size` - bucket capacity and initial grant for a new key
    pub fn new(
        store: Arc<BucketStore>,
        token_rate: f64,
        burst_size: u64,
        options: &LimiterOptions,
    ) -> RatekeeperResult<Self> {
        validate(token_rate, burst_size, options)?;
        Ok(Self {
            store,
            token_rate,
            burst_size,
            max_cas_retries: options.max_cas_retries,
        })
    }

    /// Tokens granted per second.
    pub fn token_rate(&self) -> f64 {
        self.token_rate
    }

    /// Bucket capacity and the grant for a newly seen key.
    pub fn burst_size(&self) -> u64 {
        self.burst_size
    }

    /// Check whether a request identified by `key` is allowed, consuming one
    /// token if so.
    ///
    /// Gives up and denies once `max_cas_retries` attempts have lost the
    /// compare-and-swap race.
    pub fn allow(&self, key: &str) -> bool {
        if self.burst_size == 0 {
            return false;
        }

        for attempt in 0..self.max_cas_retries {
            let now = Instant::now();

            let current = match self.store.load(key) {
                Some(bucket) => bucket,
                None => {
                    let fresh = Arc::new(Bucket::fresh(self.burst_size, now));
                    match self.store.load_or_store(key, fresh) {
                        Loaded::Stored(_) => return true,
                        Loaded::Existing(bucket) => bucket,
                    }
                }
            };

            let next = match current.refill_and_consume(now, self.token_rate, self.burst_size) {
                Verdict::Allow(next) => next,
                Verdict::Deny => return false,
            };

            if self.store.compare_and_swap(key, &current, Arc::new(next)) {
                return true;
            }
            trace!(key, attempt, "bucket changed concurrently, retrying");
        }

        warn!(
            key,
            retries = self.max_cas_retries,
            "compare-and-swap retries exhausted, denying request"
        );
        false
    }
}

fn validate(token_rate: f64, burst_size: u64, options: &LimiterOptions) -> RatekeeperResult<()> {
    if token_rate.is_nan() || token_rate < 0.0 {
        return Err(RatekeeperError::NegativeTokenRate);
    }

    // token_rate * horizon + burst_size <= u64::MAX
    let horizon = REFILL_HORIZON
        .max(options.idle_timeout.saturating_add(options.sweep_interval))
        .as_secs_f64();
    let max_rate = (u64::MAX - burst_size) as f64 / horizon;
    if token_rate > max_rate {
        return Err(RatekeeperError::TokenRateOverflow {
            token_rate,
            burst_size,
        });
    }

    if options.sweep_interval.is_zero() {
        return Err(RatekeeperError::InvalidOption(
            "sweep_interval must be greater than zero".to_string(),
        ));
    }
    if options.max_cas_retries == 0 {
        return Err(RatekeeperError::InvalidOption(
            "max_cas_retries must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;

    fn limiter(token_rate: f64, burst_size: u64) -> TokenBucketLimiter {
        TokenBucketLimiter::new(
            Arc::new(BucketStore::new()),
            token_rate,
            burst_size,
            &LimiterOptions::default(),
        )
        .unwrap()
    }

    fn check(token_rate: f64, burst_size: u64) -> RatekeeperResult<()> {
        validate(token_rate, burst_size, &LimiterOptions::default())
    }

    #[test]
    fn validation_cases() {
        let max_rate = (u64::MAX / 5000) as f64;

        assert!(check(21.0, 32).is_ok());
        assert!(check(23.0, 20).is_ok());
        assert!(check(0.0, 0).is_ok());
        assert!(check(max_rate, 0).is_ok());

        assert!(matches!(
            check(-2.34, 23),
            Err(RatekeeperError::NegativeTokenRate)
        ));
        assert!(matches!(
            check(f64::NAN, 1),
            Err(RatekeeperError::NegativeTokenRate)
        ));
        assert!(matches!(
            check(max_rate + 1.0, 0),
            Err(RatekeeperError::TokenRateOverflow { .. })
        ));
        assert!(matches!(
            check(u64::MAX as f64, u64::MAX),
            Err(RatekeeperError::TokenRateOverflow { .. })
        ));
        assert!(check(f64::INFINITY, 0).is_err());
    }

    #[test]
    fn burst_shrinks_the_allowed_rate() {
        // leaves exactly 1000 tokens/s of headroom over 5000 seconds
        let burst = u64::MAX - 5_000_000;
        assert!(check(1000.0, burst).is_ok());
        assert!(check(1000.5, burst).is_err());
    }

    #[test]
    fn long_idle_timeout_widens_the_horizon() {
        let options = LimiterOptions {
            idle_timeout: Duration::from_secs(9_700),
            sweep_interval: Duration::from_secs(300),
            ..LimiterOptions::default()
        };
        let max_rate = (u64::MAX / 5000) as f64;
        assert!(validate(max_rate, 0, &LimiterOptions::default()).is_ok());
        assert!(validate(max_rate, 0, &options).is_err());
        assert!(validate(max_rate / 2.0, 0, &options).is_ok());
    }

    #[test]
    fn rejects_degenerate_options() {
        let zero_interval = LimiterOptions {
            sweep_interval: Duration::ZERO,
            ..LimiterOptions::default()
        };
        assert!(matches!(
            validate(1.0, 1, &zero_interval),
            Err(RatekeeperError::InvalidOption(_))
        ));

        let no_retries = LimiterOptions {
            max_cas_retries: 0,
            ..LimiterOptions::default()
        };
        assert!(matches!(
            validate(1.0, 1, &no_retries),
            Err(RatekeeperError::InvalidOption(_))
        ));
    }

    #[test]
    fn allows_up_to_burst() {
        let limiter = limiter(10.0, 10);
        for i in 0..10 {
            assert!(limiter.allow("k"), "request {} should be allowed", i);
        }
        assert!(!limiter.allow("k"), "11th request should be denied");
    }

    #[test]
    fn rate_above_burst_still_caps_at_burst() {
        let limiter = limiter(11.0, 10);
        let allowed = (0..11).filter(|_| limiter.allow("key")).count();
        assert_eq!(allowed, 10);
    }

    #[test]
    fn zero_burst_denies_without_creating_buckets() {
        let store = Arc::new(BucketStore::new());
        let limiter =
            TokenBucketLimiter::new(Arc::clone(&store), 10.0, 0, &LimiterOptions::default())
                .unwrap();
        for _ in 0..5 {
            assert!(!limiter.allow("any-key"));
        }
        assert!(store.is_empty());
    }

    #[test]
    fn independent_keys() {
        let limiter = limiter(10.0, 2);

        assert!(limiter.allow("a"));
        assert!(limiter.allow("a"));
        assert!(!limiter.allow("a"));

        assert!(limiter.allow("b"));
    }

    #[test]
    fn denial_does_not_refresh_activity() {
        let store = Arc::new(BucketStore::new());
        let limiter =
            TokenBucketLimiter::new(Arc::clone(&store), 0.0, 1, &LimiterOptions::default())
                .unwrap();

        assert!(limiter.allow("k"));
        let after_allow = store.load("k").unwrap();
        assert!(!limiter.allow("k"));
        let after_deny = store.load("k").unwrap();

        assert!(Arc::ptr_eq(&after_allow, &after_deny));
    }

    #[test]
    fn exhausted_retries_deny_without_spending() {
        let store = Arc::new(BucketStore::new());
        let options = LimiterOptions {
            max_cas_retries: 3,
            ..LimiterOptions::default()
        };
        let limiter = TokenBucketLimiter::new(Arc::clone(&store), 0.0, 5, &options).unwrap();

        // creation goes through load_or_store, not compare_and_swap
        assert!(limiter.allow("k"));
        let before = store.load("k").unwrap();

        store.set_reject_swaps(true);
        for _ in 0..10 {
            assert!(!limiter.allow("k"), "lost races must deny");
        }
        assert!(Arc::ptr_eq(&before, &store.load("k").unwrap()));

        store.set_reject_swaps(false);
        let allowed = (0..10).filter(|_| limiter.allow("k")).count();
        assert_eq!(allowed, 4);
    }

    #[test]
    fn contended_single_retry_never_overspends() {
        const THREADS: usize = 32;
        const CALLS: usize = 200;
        const BURST: u64 = 1000;

        let options = LimiterOptions {
            max_cas_retries: 1,
            ..LimiterOptions::default()
        };
        let limiter =
            TokenBucketLimiter::new(Arc::new(BucketStore::new()), 0.0, BURST, &options).unwrap();
        let barrier = Barrier::new(THREADS);

        let allowed: usize = thread::scope(|s| {
            let handles: Vec<_> = (0..THREADS)
                .map(|_| {
                    s.spawn(|| {
                        barrier.wait();
                        (0..CALLS).filter(|_| limiter.allow("hot")).count()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });

        // uncontended, every remaining token is still there to take
        let remaining = (0..BURST).filter(|_| limiter.allow("hot")).count();
        assert_eq!(allowed + remaining, BURST as usize);
        assert!(!limiter.allow("hot"));
    }

    #[tokio::test(start_paused = true)]
    async fn refills_with_elapsed_time() {
        let limiter = limiter(1.0, 10);
        for _ in 0..10 {
            assert!(limiter.allow("user1"));
        }
        assert!(!limiter.allow("user1"));

        tokio::time::advance(Duration::from_secs(5)).await;

        for _ in 0..5 {
            assert!(limiter.allow("user1"));
        }
        assert!(!limiter.allow("user1"));
    }

    #[tokio::test(start_paused = true)]
    async fn steady_traffic_refills_half_burst() {
        let limiter = limiter(10.0, 10);
        for _ in 0..10 {
            assert!(limiter.allow("key"));
        }
        assert!(!limiter.allow("key"));

        tokio::time::advance(Duration::from_millis(500)).await;

        for _ in 0..5 {
            assert!(limiter.allow("key"));
        }
        assert!(!limiter.allow("key"));
    }

    #[test]
    fn concurrent_callers_never_double_spend() {
        const THREADS: usize = 64;
        // zero rate so wall-clock time cannot add tokens mid-test
        let limiter = limiter(0.0, THREADS as u64);
        let barrier = Barrier::new(THREADS * 2);

        let allowed = thread::scope(|s| {
            let handles: Vec<_> = (0..THREADS * 2)
                .map(|_| {
                    s.spawn(|| {
                        barrier.wait();
                        limiter.allow("shared")
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|allowed| *allowed)
                .count()
        });

        assert_eq!(allowed, THREADS);
    }
}
