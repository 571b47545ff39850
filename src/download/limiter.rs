//! Token-bucket throughput limiter.
//!
//! One [`SpeedLimiter`] is created per transfer episode and shared between the
//! episode's throttle stage and the owning file, so [`SpeedLimiter::set_limit`]
//! retunes a live transfer without restarting it.
//!
//! Tokens are bytes. They accumulate at `rate` bytes per second up to a
//! capacity of one second's worth. A limit of `0` means unlimited and is
//! modelled as an infinite refill rate, so the same admission path runs either
//! way.
//!
//! # Example
//!
//! ```
//! use rangeload::download::SpeedLimiter;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() {
//! let limiter = SpeedLimiter::new(1024 * 1024);
//! let cancel = CancellationToken::new();
//!
//! // Waits until 64 KiB worth of tokens are available.
//! limiter.wait_n(64 * 1024, &cancel).await.ok();
//!
//! // Lift the cap for everyone sharing this limiter.
//! limiter.set_limit(0);
//! # }
//! ```

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::constants::{LIMITER_WAIT_SLICE, UNLIMITED};

/// Floor for a single sleep; a sub-tick deficit must still let time pass.
const MIN_WAIT: Duration = Duration::from_millis(1);

/// Returned by [`SpeedLimiter::wait_n`] when the episode was cancelled while
/// waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("limiter wait cancelled")]
pub struct Cancelled;

/// Token-bucket limiter shared by a transfer episode.
#[derive(Debug)]
pub struct SpeedLimiter {
    bucket: Mutex<Bucket>,
}

#[derive(Debug)]
struct Bucket {
    /// Configured limit as given (`0` = unlimited).
    limit: u64,
    /// Refill rate in tokens per second; infinite when unlimited.
    rate: f64,
    /// Maximum tokens; equal to `rate`.
    capacity: f64,
    /// Never negative; requests are taken at most `capacity` at a time.
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn refill(&mut self, now: Instant) {
        if self.rate.is_infinite() {
            self.tokens = self.capacity;
        } else {
            let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
            self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
        }
        self.last_refill = now;
    }
}

#[allow(clippy::cast_precision_loss)]
fn rate_for(limit: u64) -> f64 {
    if limit == UNLIMITED {
        f64::INFINITY
    } else {
        limit as f64
    }
}

impl SpeedLimiter {
    /// Creates a limiter admitting `bytes_per_sec` bytes per second
    /// (`0` = unlimited). The bucket starts empty.
    #[must_use]
    pub fn new(bytes_per_sec: u64) -> Self {
        let rate = rate_for(bytes_per_sec);
        Self {
            bucket: Mutex::new(Bucket {
                limit: bytes_per_sec,
                rate,
                capacity: rate,
                tokens: if rate.is_infinite() { rate } else { 0.0 },
                last_refill: Instant::now(),
            }),
        }
    }

    fn bucket(&self) -> MutexGuard<'_, Bucket> {
        self.bucket.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the configured limit in bytes per second (`0` = unlimited).
    #[must_use]
    pub fn limit(&self) -> u64 {
        self.bucket().limit
    }

    /// Changes rate and capacity together.
    ///
    /// Tokens earned under the old rate are kept up to the new capacity. Going
    /// from unlimited to limited starts from an empty bucket.
    pub fn set_limit(&self, bytes_per_sec: u64) {
        let mut bucket = self.bucket();
        bucket.refill(Instant::now());

        let was_unlimited = bucket.rate.is_infinite();
        let rate = rate_for(bytes_per_sec);
        bucket.limit = bytes_per_sec;
        bucket.rate = rate;
        bucket.capacity = rate;
        if was_unlimited && rate.is_finite() {
            bucket.tokens = 0.0;
        } else {
            bucket.tokens = bucket.tokens.min(rate);
        }
        debug!(bytes_per_sec, "speed limit changed");
    }

    /// Largest request admitted in one step, or `None` when unlimited.
    ///
    /// Callers that can split their data should hand it over in pieces of at
    /// most this size so each piece leaves the limiter as soon as it is paid
    /// for.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn max_piece(&self) -> Option<usize> {
        let bucket = self.bucket();
        if bucket.capacity.is_infinite() {
            return None;
        }
        Some((bucket.capacity as usize).max(1))
    }

    /// Waits until `n` tokens have been taken.
    ///
    /// A request larger than the capacity is paid for in capacity-sized
    /// installments, so the total admitted since the bucket was empty never
    /// exceeds the limit times the elapsed time. The bucket is re-evaluated at
    /// least every [`LIMITER_WAIT_SLICE`], so a rate change applies mid-wait.
    ///
    /// # Errors
    ///
    /// Returns [`Cancelled`] as soon as `cancel` fires. Installments already
    /// taken are not refunded.
    #[allow(clippy::cast_precision_loss)]
    pub async fn wait_n(&self, n: usize, cancel: &CancellationToken) -> Result<(), Cancelled> {
        let mut owed = n as f64;

        while owed > 0.0 {
            if cancel.is_cancelled() {
                return Err(Cancelled);
            }

            let delay = {
                let mut bucket = self.bucket();
                bucket.refill(Instant::now());
                let installment = owed.min(bucket.capacity);
                if bucket.tokens >= installment {
                    bucket.tokens -= installment;
                    owed -= installment;
                    None
                } else {
                    let deficit = installment - bucket.tokens;
                    Some(
                        Duration::try_from_secs_f64(deficit / bucket.rate)
                            .unwrap_or(LIMITER_WAIT_SLICE)
                            .clamp(MIN_WAIT, LIMITER_WAIT_SLICE),
                    )
                }
            };

            if let Some(delay) = delay {
                tokio::select! {
                    () = cancel.cancelled() => return Err(Cancelled),
                    () = tokio::time::sleep(delay) => {}
                }
            }
        }
        Ok(())
    }
}
