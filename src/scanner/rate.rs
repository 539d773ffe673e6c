//! Send pacing.
//!
//! A token bucket refilled from elapsed wall time. Refill is computed from
//! the actual clock on every call rather than from the requested sleep, so
//! timer granularity and scheduling jitter never accumulate into drift.
//! Capacity is bounded so a stalled sender cannot catch up in a burst.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::probe::PROBE_WIRE_LEN;

/// Seconds of tokens the bucket may hold.
const BURST_WINDOW_SECS: f64 = 0.05;

/// Minimum capacity. Two tokens absorb sub-token rounding from coarse timers.
const MIN_CAPACITY: f64 = 2.0;

/// Effective packet rate from an optional packet rate and an optional
/// bandwidth cap in bytes/sec. The stricter limit wins; `None` means unpaced.
pub fn effective_rate(rate: Option<u64>, bandwidth: Option<u64>) -> Option<f64> {
    let from_bandwidth = bandwidth
        .filter(|&b| b > 0)
        .map(|b| (b as f64 / PROBE_WIRE_LEN as f64).max(1.0));
    let from_rate = rate.filter(|&r| r > 0).map(|r| r as f64);
    match (from_rate, from_bandwidth) {
        (Some(r), Some(b)) => Some(r.min(b)),
        (r, b) => r.or(b),
    }
}

/// Token bucket state. Time is passed in so callers and tests control the clock.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    rate: f64,
    capacity: f64,
    tokens: f64,
    last: Instant,
}

impl TokenBucket {
    /// Bucket for `rate` permits per second, starting with one permit available.
    pub fn new(rate: f64, now: Instant) -> Self {
        Self {
            rate,
            capacity: (rate * BURST_WINDOW_SECS).max(MIN_CAPACITY),
            tokens: 1.0,
            last: now,
        }
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
        self.last = now;
    }

    /// Take one permit, or report how long until one is available.
    pub fn try_acquire(&mut self, now: Instant) -> Result<(), Duration> {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            Err(Duration::from_secs_f64((1.0 - self.tokens) / self.rate))
        }
    }
}

/// Proof that the sending flow may emit one probe.
#[derive(Debug)]
pub struct Permit(());

/// Paces the sending flow. Unconfigured limits grant permits immediately.
#[derive(Debug)]
pub struct RateLimiter {
    bucket: Option<TokenBucket>,
}

impl RateLimiter {
    pub fn new(rate: Option<u64>, bandwidth: Option<u64>) -> Self {
        Self {
            bucket: effective_rate(rate, bandwidth).map(|r| TokenBucket::new(r, Instant::now())),
        }
    }

    pub fn unlimited() -> Self {
        Self { bucket: None }
    }

    /// Configured permits per second, if any.
    pub fn rate(&self) -> Option<f64> {
        self.bucket.as_ref().map(TokenBucket::rate)
    }

    /// Wait until the next probe may be sent.
    ///
    /// Returns `None` once `cancel` fires; cancellation is checked on every call.
    pub async fn acquire(&mut self, cancel: &CancellationToken) -> Option<Permit> {
        if cancel.is_cancelled() {
            return None;
        }
        let Some(bucket) = self.bucket.as_mut() else {
            return Some(Permit(()));
        };
        loop {
            match bucket.try_acquire(Instant::now()) {
                Ok(()) => return Some(Permit(())),
                Err(wait) => {
                    tokio::select! {
                        _ = cancel.cancelled() => return None,
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
            }
        }
    }
}
