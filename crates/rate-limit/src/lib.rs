//! Per-key token bucket rate limiting.
//!
//! Every key (a client address, an account id, ...) gets its own bucket that
//! holds up to `burst_size` whole tokens and refills at `token_rate` tokens
//! per second. [`RateLimiter::allow`] answers immediately: `true` spends a
//! token, `false` means the key is over its limit.
//!
//! - **Lock-free updates** -- buckets are immutable snapshots in a sharded
//!   [`DashMap`](dashmap::DashMap). A request reads a snapshot, computes the
//!   refilled and consumed bucket, and installs it with compare-and-swap,
//!   retrying a bounded number of times before failing closed.
//!
//! - **Idle eviction** -- a background sweeper removes buckets that have not
//!   had an allowed request for an hour. A key that comes back afterwards is
//!   treated as new and gets its full burst again. Denied requests never
//!   keep a bucket alive.

mod bucket;
mod store;
mod sweeper;
pub mod token_bucket;

use std::sync::Arc;

use ratekeeper_common::{LimiterConfig, RateLimitConfig, RatekeeperResult};
use tracing::info;

pub use bucket::{Bucket, Verdict};
pub use store::{BucketStore, Loaded};
pub use token_bucket::{LimiterOptions, TokenBucketLimiter};

use crate::sweeper::Sweeper;

/// Token bucket rate limiter with background eviction of idle keys.
///
/// Construct it with [`RateLimiter::new`] and call
/// [`allow`](RateLimiter::allow) on every incoming request.
///
/// The limiter is cheaply cloneable (backed by `Arc`) and safe to share across
/// tasks and threads. The sweeper stops on [`close`](RateLimiter::close) or
/// once the last clone is dropped.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    inner: Arc<RateLimiterInner>,
}

#[derive(Debug)]
struct RateLimiterInner {
    limiter: TokenBucketLimiter,
    sweeper: Sweeper,
}

impl RateLimiter {
    /// Create a rate limiter with the default sweep interval (5 minutes),
    /// idle timeout (1 hour) and retry bound (100).
    ///
    /// * `token_rate` - tokens granted per second, must not be negative
    /// * `burst_size` - bucket capacity and the grant for a new key
    ///
    /// A `burst_size` of zero rejects every request. A `token_rate` of zero
    /// never refills, so each key gets `burst_size` requests until it is
    /// evicted.
    ///
    /// When called inside a tokio runtime the sweeper runs as a task on that
    /// runtime; otherwise it gets its own thread. The task does not outlive
    /// its runtime: a limiter built inside a short-lived runtime (say, a
    /// temporary `Runtime::block_on`) keeps answering [`allow`](Self::allow)
    /// after that runtime is dropped, but idle buckets are no longer evicted
    /// and the map only grows. Build long-lived limiters outside any runtime
    /// or on the runtime that outlives them.
    pub fn new(token_rate: f64, burst_size: u64) -> RatekeeperResult<Self> {
        Self::with_options(token_rate, burst_size, LimiterOptions::default())
    }

    /// Create a rate limiter with explicit sweep interval, idle timeout and
    /// retry bound.
    ///
    /// Fails with [`RatekeeperError::InvalidOption`] for a zero sweep
    /// interval or a zero retry bound, in addition to the rate checks done
    /// by [`new`](Self::new). Sweeper placement follows the same rules as
    /// `new`.
    ///
    /// [`RatekeeperError::InvalidOption`]: ratekeeper_common::RatekeeperError::InvalidOption
    pub fn with_options(
        token_rate: f64,
        burst_size: u64,
        options: LimiterOptions,
    ) -> RatekeeperResult<Self> {
        let store = Arc::new(BucketStore::new());
        let limiter = TokenBucketLimiter::new(Arc::clone(&store), token_rate, burst_size, &options)?;
        let sweeper = Sweeper::spawn(store, options.sweep_interval, options.idle_timeout)?;

        info!(
            token_rate,
            burst_size,
            sweep_interval_secs = options.sweep_interval.as_secs(),
            idle_timeout_secs = options.idle_timeout.as_secs(),
            "creating token bucket rate limiter"
        );

        Ok(Self {
            inner: Arc::new(RateLimiterInner { limiter, sweeper }),
        })
    }

    /// Create a rate limiter from a configured limit and limiter settings.
    pub fn from_config(limit: &RateLimitConfig, settings: &LimiterConfig) -> RatekeeperResult<Self> {
        Self::with_options(limit.token_rate, limit.burst_size, settings.into())
    }

    /// Check whether a request identified by `key` is allowed.
    ///
    /// Returns `true` if a token was available and consumed, `false` if the
    /// caller should be rate limited.
    pub fn allow(&self, key: &str) -> bool {
        self.inner.limiter.allow(key)
    }

    /// Stop evicting idle buckets.
    ///
    /// The limiter keeps working; buckets just stay around until the
    /// limiter is dropped. Calling this more than once is harmless.
    pub fn close(&self) {
        self.inner.sweeper.stop();
    }

    /// Tokens granted per second.
    pub fn token_rate(&self) -> f64 {
        self.inner.limiter.token_rate()
    }

    /// Bucket capacity and the grant for a newly seen key.
    pub fn burst_size(&self) -> u64 {
        self.inner.limiter.burst_size()
    }
}
