//! Token-bucket rate limiting for disruptive actions
//!
//! One limiter guards evictions and one guards in-place resizes. Both are
//! built once per updater and shared by every workload of every cycle.

use std::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Thread-safe token bucket with a non-blocking take
#[derive(Debug)]
pub struct RateLimiter {
    /// Tokens per second; `f64::INFINITY` when unlimited
    rate: f64,
    burst: usize,
    state: Mutex<BucketState>,
}

impl RateLimiter {
    /// A limiter that admits every request
    pub fn unlimited() -> Self {
        Self {
            rate: f64::INFINITY,
            burst: 0,
            state: Mutex::new(BucketState {
                tokens: 0.0,
                last_refill: Instant::now(),
            }),
        }
    }

    /// A limiter refilling `rate` tokens per second up to `burst`, starting full
    pub fn with_rate(rate: f64, burst: usize) -> Self {
        Self {
            rate,
            burst,
            state: Mutex::new(BucketState {
                tokens: burst as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn burst(&self) -> usize {
        self.burst
    }

    pub fn is_unlimited(&self) -> bool {
        self.rate.is_infinite()
    }

    /// Take one token if available. Never waits for a refill.
    pub fn try_acquire(&self) -> bool {
        if self.is_unlimited() {
            return true;
        }

        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let now = Instant::now();
        let elapsed = now.saturating_duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate).min(self.burst as f64);
        state.last_refill = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Build a limiter from configuration: a non-positive rate means unlimited
pub fn new_rate_limiter(rate: f64, burst: usize) -> RateLimiter {
    if rate <= 0.0 {
        RateLimiter::unlimited()
    } else {
        RateLimiter::with_rate(rate, burst)
    }
}
