use std::time::Duration;

use tokio::time::Instant;

/// One version of a key's token bucket.
///
/// Buckets are never mutated in place: every update builds a new value and
/// installs it in the store with a compare-and-swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bucket {
    /// Whole tokens available, always within `0..=burst_size`.
    pub tokens: u64,
    /// When tokens were last granted to this bucket.
    pub last_refill: Instant,
    /// When the key last had a request allowed. Denials never touch this.
    pub last_activity: Instant,
}

/// Outcome of running refill-then-consume against a bucket snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// A token was consumed; the caller must install the new bucket.
    Allow(Bucket),
    /// No token available. Nothing to write.
    Deny,
}

impl Bucket {
    /// Bucket for a key seen for the first time, with the triggering
    /// request's token already taken.
    pub fn fresh(burst_size: u64, now: Instant) -> Self {
        Self {
            tokens: burst_size.saturating_sub(1),
            last_refill: now,
            last_activity: now,
        }
    }

    /// Time since the last allowed request, zero if `now` is earlier.
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    /// Refill by whole tokens for the time elapsed since the last refill,
    /// then try to take one.
    ///
    /// The fractional part of `token_rate * elapsed` is dropped on every
    /// call. `last_refill` only moves when at least one token was granted,
    /// so elapsed time keeps counting towards the next whole token.
    pub fn refill_and_consume(&self, now: Instant, token_rate: f64, burst_size: u64) -> Verdict {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        // float to int casts saturate, NaN becomes 0
        let grantable = (token_rate * elapsed) as u64;
        let tokens = burst_size.min(self.tokens.saturating_add(grantable));

        let last_refill = if tokens != self.tokens {
            now
        } else {
            self.last_refill
        };

        if tokens == 0 {
            return Verdict::Deny;
        }

        Verdict::Allow(Bucket {
            tokens: tokens - 1,
            last_refill,
            last_activity: now,
        })
    }
}
