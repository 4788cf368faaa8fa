// ===============================
// src/ratelimit.rs
// ===============================
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use crate::error::GatewayError;
use crate::metrics::RATE_LIMIT_WAITS;

/// Token bucket: `burst` tokens, refilled at `rpm / 60` tokens per second.
///
/// `acquire` suspends until a token is available or the deadline fires,
/// whichever comes first. The lock is never held across the wait.
#[derive(Debug)]
pub struct RateLimiter {
    bucket: Mutex<Bucket>,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_update: Instant,
}

impl Bucket {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_update).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_update = now;
    }

    fn try_consume(&mut self, now: Instant) -> Result<(), Duration> {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            let deficit = 1.0 - self.tokens;
            Err(Duration::from_secs_f64(deficit / self.refill_per_sec))
        }
    }
}

impl RateLimiter {
    pub fn new(rpm: u32, burst: u32) -> Self {
        let capacity = burst.max(1) as f64;
        RateLimiter {
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                capacity,
                refill_per_sec: rpm.max(1) as f64 / 60.0,
                last_update: Instant::now(),
            }),
        }
    }

    fn try_take(&self) -> Result<(), Duration> {
        let now = Instant::now();
        match self.bucket.lock() {
            Ok(mut b) => b.try_consume(now),
            Err(poisoned) => poisoned.into_inner().try_consume(now),
        }
    }

    pub async fn acquire(&self, deadline: Instant, cancel: &CancellationToken) -> Result<(), GatewayError> {
        let mut waited = false;
        loop {
            let wait = match self.try_take() {
                Ok(()) => return Ok(()),
                Err(wait) => wait,
            };
            if !waited {
                RATE_LIMIT_WAITS.inc();
                waited = true;
            }
            let wake = Instant::now() + wait;
            if wake > deadline {
                // token won't arrive in time; wait out the deadline like the caller asked
                tokio::select! {
                    _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
                    _ = sleep_until(deadline) => return Err(GatewayError::RateLimited),
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
                _ = sleep_until(wake) => {}
            }
        }
    }
}
