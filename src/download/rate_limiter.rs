//! Throughput limiting for transfers and throttling for status updates.
//!
//! This module provides the [`SpeedLimiter`] struct, a token bucket that
//! bounds bytes per second across every worker holding it, and the
//! [`UpdateThrottle`], which enforces a minimum interval between status
//! updates for the same key.
//!
//! # Overview
//!
//! The aggregate limiter is shared (via `Arc`) by all active transfers. A
//! per-file limiter, when configured, is a second independent bucket owned
//! by a single worker. Each chunk write requests tokens equal to its size.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use media_intake::download::SpeedLimiter;
//!
//! # async fn example() {
//! // 8 Mbps shared ceiling
//! let limiter = Arc::new(SpeedLimiter::from_mbps(8.0));
//!
//! // Each worker debits its chunk before writing it
//! limiter.acquire(1024 * 1024).await;
//! # }
//! ```

use std::hash::Hash;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, instrument, trace};

/// Bytes per second in one megabit per second.
const BYTES_PER_MEGABIT: f64 = 125_000.0;

/// Token bucket bounding transfer throughput.
///
/// Grants use reservation semantics: a request always debits the budget, and
/// the caller sleeps for whatever deficit it created. Requests are serialized
/// by one mutex, so concurrent workers are granted in lock order and none can
/// starve, even when a chunk is larger than the bucket.
///
/// # Thread Safety
///
/// `SpeedLimiter` is `Send + Sync`; wrap it in `Arc` to share it across
/// spawned Tokio tasks.
#[derive(Debug)]
pub struct SpeedLimiter {
    /// Refill rate in bytes per second; zero disables limiting.
    bytes_per_sec: u64,

    /// Shared budget. Tokens may go negative while a reservation is paid off.
    bucket: Mutex<Bucket>,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl SpeedLimiter {
    /// Creates a limiter refilling at `bytes_per_sec`, with one second of burst.
    ///
    /// A rate of zero yields a disabled limiter.
    #[must_use]
    #[instrument(skip_all, fields(bytes_per_sec))]
    pub fn new(bytes_per_sec: u64) -> Self {
        debug!("creating speed limiter");
        #[allow(clippy::cast_precision_loss)]
        let capacity = bytes_per_sec as f64;
        Self {
            bytes_per_sec,
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Creates a limiter from a megabits-per-second ceiling (`0` = unlimited).
    #[must_use]
    pub fn from_mbps(mbps: f64) -> Self {
        if mbps <= 0.0 || !mbps.is_finite() {
            return Self::disabled();
        }
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let bytes_per_sec = (mbps * BYTES_PER_MEGABIT).round() as u64;
        Self::new(bytes_per_sec.max(1))
    }

    /// Creates a disabled limiter that grants every request immediately.
    #[must_use]
    pub fn disabled() -> Self {
        Self::new(0)
    }

    /// Returns whether limiting is disabled.
    #[must_use]
    pub fn is_disabled(&self) -> bool {
        self.bytes_per_sec == 0
    }

    /// Returns the configured rate in bytes per second (zero when disabled).
    #[must_use]
    pub fn bytes_per_sec(&self) -> u64 {
        self.bytes_per_sec
    }

    /// Debits `bytes` from the budget, waiting until the debt is paid off.
    pub async fn acquire(&self, bytes: u64) {
        if self.is_disabled() || bytes == 0 {
            return;
        }

        #[allow(clippy::cast_precision_loss)]
        let rate = self.bytes_per_sec as f64;

        let wait = {
            let mut bucket = self.bucket.lock().await;
            let now = Instant::now();
            let refill = now.duration_since(bucket.last_refill).as_secs_f64() * rate;
            bucket.tokens = (bucket.tokens + refill).min(rate);
            bucket.last_refill = now;

            #[allow(clippy::cast_precision_loss)]
            {
                bucket.tokens -= bytes as f64;
            }

            if bucket.tokens >= 0.0 {
                Duration::ZERO
            } else {
                Duration::from_secs_f64(-bucket.tokens / rate)
            }
        };

        if !wait.is_zero() {
            trace!(bytes, wait_ms = wait.as_millis(), "throttling chunk");
            tokio::time::sleep(wait).await;
        }
    }
}

/// Per-key minimum interval between status updates.
///
/// Messaging transports rate-limit message edits, so progress updates for the
/// same item are dropped when they arrive faster than `min_interval`.
#[derive(Debug)]
pub struct UpdateThrottle<K>
where
    K: Eq + Hash,
{
    min_interval: Duration,
    last_update: DashMap<K, Instant>,
}

impl<K> UpdateThrottle<K>
where
    K: Eq + Hash,
{
    /// Creates a throttle allowing one update per key every `min_interval`.
    #[must_use]
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_update: DashMap::new(),
        }
    }

    /// Returns true (and records the update) when `key` may update now.
    ///
    /// The first update for any key is always allowed.
    pub fn try_acquire(&self, key: K) -> bool {
        let now = Instant::now();
        match self.last_update.entry(key) {
            Entry::Vacant(slot) => {
                slot.insert(now);
                true
            }
            Entry::Occupied(mut slot) => {
                if now.duration_since(*slot.get()) >= self.min_interval {
                    slot.insert(now);
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Forgets `key`, so its next update is allowed immediately.
    pub fn forget(&self, key: &K) {
        self.last_update.remove(key);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_from_mbps_converts_to_bytes() {
        let limiter = SpeedLimiter::from_mbps(8.0);
        assert_eq!(limiter.bytes_per_sec(), 1_000_000);
        assert!(!limiter.is_disabled());
    }

    #[test]
    fn test_from_mbps_zero_is_disabled() {
        assert!(SpeedLimiter::from_mbps(0.0).is_disabled());
        assert!(SpeedLimiter::from_mbps(-3.0).is_disabled());
        assert!(SpeedLimiter::disabled().is_disabled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_limiter_never_waits() {
        let limiter = SpeedLimiter::disabled();
        let start = Instant::now();
        for _ in 0..100 {
            limiter.acquire(10 * 1024 * 1024).await;
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_within_capacity_is_immediate() {
        let limiter = SpeedLimiter::new(1000);
        let start = Instant::now();
        limiter.acquire(1000).await;
        assert!(start.elapsed() < Duration::from_millis(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deficit_is_paid_by_waiting() {
        let limiter = SpeedLimiter::new(1000);
        let start = Instant::now();
        limiter.acquire(1000).await; // drains the bucket
        limiter.acquire(500).await; // needs another half second
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(500), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_millis(600), "elapsed {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_chunk_larger_than_bucket_is_granted() {
        let limiter = SpeedLimiter::new(1000);
        let start = Instant::now();
        limiter.acquire(3000).await;
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shared_budget_bounds_aggregate_rate() {
        let limiter = Arc::new(SpeedLimiter::new(10_000));
        let start = Instant::now();
        let mut handles = Vec::new();
        for _ in 0..4 {
            let limiter = Arc::clone(&limiter);
            handles.push(tokio::spawn(async move {
                for _ in 0..10 {
                    limiter.acquire(1000).await;
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        // 40_000 bytes at 10_000 B/s with a 10_000 byte head start
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(3), "elapsed {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_throttle_enforces_interval_per_key() {
        let throttle = UpdateThrottle::new(Duration::from_secs(2));
        assert!(throttle.try_acquire(1_u64));
        assert!(!throttle.try_acquire(1_u64));
        assert!(throttle.try_acquire(2_u64), "other keys are independent");

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(throttle.try_acquire(1_u64));
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_throttle_forget_resets_key() {
        let throttle = UpdateThrottle::new(Duration::from_secs(60));
        assert!(throttle.try_acquire("a"));
        assert!(!throttle.try_acquire("a"));
        throttle.forget(&"a");
        assert!(throttle.try_acquire("a"));
    }
}
