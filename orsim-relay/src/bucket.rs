//! Global token buckets for relay-wide rate limiting.
//!
//! A relay owns two buckets, one gating reads and one gating writes.
//! The host refills them on a fixed cadence; the scheduler spends them
//! as it moves bytes.  A bucket's level is signed: it reports empty as
//! zero or less, and the refill path uses the previous level to detect
//! the empty-to-nonempty transition that triggers connection wake-ups.

use std::time::Duration;

/// A byte-denominated token bucket.
#[derive(Debug, Clone)]
pub(crate) struct TokenBucket {
    /// Current balance, in bytes.
    level: i64,
    /// Refill rate, in bytes per second.
    rate: u64,
    /// Maximum balance, in bytes.
    burst: u64,
}

impl TokenBucket {
    /// Create a bucket that starts full.
    pub(crate) fn new(rate: u64, burst: u64) -> Self {
        TokenBucket {
            level: burst as i64,
            rate,
            burst,
        }
    }

    /// Return the current balance.
    pub(crate) fn level(&self) -> i64 {
        self.level
    }

    /// Spend `n` bytes from the bucket.
    pub(crate) fn decrement(&mut self, n: u64) {
        self.level -= n as i64;
    }

    /// Change the refill rate.
    pub(crate) fn set_rate(&mut self, rate: u64) {
        self.rate = rate;
    }

    /// Change the burst ceiling.  The balance is clamped down to the
    /// new ceiling immediately.
    pub(crate) fn set_burst(&mut self, burst: u64) {
        self.burst = burst;
        self.level = std::cmp::min(self.level, burst as i64);
    }

    /// Set the balance directly.  This is the host's knob: scenario
    /// setups use it to start a bucket empty.
    pub(crate) fn set_level(&mut self, level: i64) {
        self.level = level;
    }

    /// Add `rate × interval` bytes of credit, capped at the burst
    /// ceiling, and return the balance from before the refill.
    pub(crate) fn refill(&mut self, interval: Duration) -> i64 {
        let prev = self.level;
        let add = (self.rate as u128 * interval.as_nanos() / 1_000_000_000) as i64;
        self.level = std::cmp::min(self.level.saturating_add(add), self.burst as i64);
        prev
    }
}
