//! Token-bucket rate limiter.
//!
//! Utility module: nothing in the engine consumes it, but embedders
//! throttling a backend (bytes per window, ops per window) can wrap
//! their calls in one. The bucket refills proportionally to wall-clock
//! time elapsed since the last call, capped at a burst ceiling; a
//! request larger than the bucket drains it and comes back with the
//! delay the residual is worth.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Rate limiter admitting `limit` units per `window`.
pub struct Limiter {
    limit: u64,
    window: Duration,
    state: Mutex<State>,
}

struct State {
    bucket: u64,
    max_bucket: u64,
    last_time: Instant,
}

impl Limiter {
    /// Create a limiter admitting `limit` units per `window`, with a
    /// burst ceiling of `burst_fraction * limit` units.
    pub fn new(limit: u64, window: Duration, burst_fraction: f64) -> Self {
        let max_bucket = (limit as f64 * burst_fraction) as u64;
        Self {
            limit,
            window,
            state: Mutex::new(State {
                bucket: max_bucket,
                max_bucket,
                last_time: Instant::now(),
            }),
        }
    }

    fn refill(&self, state: &mut State, now: Instant) {
        if state.bucket < state.max_bucket && now > state.last_time {
            let elapsed = now - state.last_time;
            let refill =
                (self.limit as f64 * (elapsed.as_secs_f64() / self.window.as_secs_f64())) as u64;
            state.bucket = (state.bucket + refill).min(state.max_bucket);
        }
    }

    /// Account for `val` units, returning how long the caller should
    /// wait before proceeding.
    ///
    /// A request covered by the bucket drains it and returns zero.
    /// Otherwise the bucket empties and the residual converts to a
    /// delay of `residual / limit × window`; the refill clock advances
    /// past the delay so back-to-back oversized requests queue up
    /// rather than double-count.
    pub fn add(&self, val: u64) -> Duration {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();
        self.refill(&mut state, now);

        if val <= state.bucket {
            state.bucket -= val;
            state.last_time = now;
            return Duration::ZERO;
        }

        let residual = val - state.bucket;
        state.bucket = 0;
        let delay = self.window.mul_f64(residual as f64 / self.limit as f64);
        state.last_time = now + delay;
        delay
    }

    /// Account for `val` units and sleep out the returned delay.
    pub async fn throttle(&self, val: u64) {
        let delay = self.add(val);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    /// Units currently available in the bucket.
    pub fn available(&self) -> u64 {
        let mut state = self.state.lock().unwrap();
        self.refill(&mut state, Instant::now());
        state.bucket
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_with_full_burst() {
        let limiter = Limiter::new(1000, Duration::from_secs(1), 0.5);
        assert_eq!(limiter.available(), 500);
    }

    #[test]
    fn drains_within_burst_without_delay() {
        let limiter = Limiter::new(1000, Duration::from_secs(1), 1.0);
        assert_eq!(limiter.add(400), Duration::ZERO);
        assert_eq!(limiter.add(600), Duration::ZERO);
    }

    #[test]
    fn oversized_request_returns_residual_delay() {
        let limiter = Limiter::new(1000, Duration::from_secs(1), 1.0);
        assert_eq!(limiter.add(1000), Duration::ZERO);
        // Bucket is empty; 250 residual units at 1000/s is 250ms.
        let delay = limiter.add(250);
        assert!(
            delay >= Duration::from_millis(245) && delay <= Duration::from_millis(260),
            "delay was {:?}",
            delay
        );
        assert_eq!(limiter.available(), 0);
    }

    #[test]
    fn delays_accumulate_across_calls() {
        let limiter = Limiter::new(1000, Duration::from_secs(1), 1.0);
        limiter.add(1000);
        let first = limiter.add(500);
        let second = limiter.add(500);
        // The refill clock advanced past the first delay, so the
        // second request pays full price again.
        assert!(first >= Duration::from_millis(495), "first {:?}", first);
        assert!(second >= Duration::from_millis(495), "second {:?}", second);
    }

    #[test]
    fn refills_over_time() {
        let limiter = Limiter::new(100_000, Duration::from_millis(100), 1.0);
        limiter.add(100_000);
        assert_eq!(limiter.available(), 0);
        std::thread::sleep(Duration::from_millis(20));
        // ~20% of the window elapsed; allow generous scheduling skew.
        let available = limiter.available();
        assert!(available >= 10_000, "refilled only {}", available);
        assert!(available <= 100_000);
    }
}
