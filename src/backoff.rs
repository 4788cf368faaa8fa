// ===============================
// src/backoff.rs
// ===============================
//
// Exponential backoff + jitter.
// Dipakai oleh stream reconnect (1s -> 60s) dan retry PlaceOrder (200ms -> 5s).
//
use rand::Rng;
use std::time::Duration;

#[derive(Clone, Debug, PartialEq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub cap: Duration,
    pub factor: f64,
    /// Relative jitter, 0.2 means +/-20%.
    pub jitter: f64,
}

impl BackoffPolicy {
    pub fn new(initial: Duration, cap: Duration, factor: f64, jitter: f64) -> Self {
        Self { initial, cap, factor, jitter }
    }

    pub fn stream_default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60), 2.0, 0.2)
    }

    pub fn retry_default() -> Self {
        Self::new(Duration::from_millis(200), Duration::from_secs(5), 2.0, 0.2)
    }

    /// Delay before retry number `attempt` (1-based) without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let ms = self.initial.as_millis() as f64 * self.factor.powi(exp);
        let capped = ms.min(self.cap.as_millis() as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter <= 0.0 {
            return base;
        }
        // jangan simpan ThreadRng melewati .await
        let f = rand::thread_rng().gen_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        Duration::from_millis((base.as_millis() as f64 * f).round() as u64)
    }

    /// Inclusive bounds for `delay(attempt)`.
    pub fn bounds(&self, attempt: u32) -> (Duration, Duration) {
        let base = self.base_delay(attempt).as_millis() as f64;
        let lo = (base * (1.0 - self.jitter)).floor().max(0.0) as u64;
        let hi = (base * (1.0 + self.jitter)).ceil() as u64;
        (Duration::from_millis(lo), Duration::from_millis(hi))
    }
}

/// Stateful helper for reconnect loops; reset after a good connection.
#[derive(Debug)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        self.policy.delay(self.attempt)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_schedule_doubles_to_cap() {
        let p = BackoffPolicy::stream_default();
        let secs: Vec<u64> = (1..=8).map(|a| p.base_delay(a).as_secs()).collect();
        assert_eq!(secs, vec![1, 2, 4, 8, 16, 32, 60, 60]);
    }

    #[test]
    fn retry_schedule() {
        let p = BackoffPolicy::retry_default();
        let ms: Vec<u128> = (1..=6).map(|a| p.base_delay(a).as_millis()).collect();
        assert_eq!(ms, vec![200, 400, 800, 1600, 3200, 5000]);
    }

    #[test]
    fn jitter_stays_in_bounds() {
        let p = BackoffPolicy::stream_default();
        for attempt in 1..=10 {
            let (lo, hi) = p.bounds(attempt);
            for _ in 0..50 {
                let d = p.delay(attempt);
                assert!(d >= lo && d <= hi, "attempt {attempt}: {d:?} not in {lo:?}..{hi:?}");
            }
        }
    }

    #[test]
    fn stateful_backoff_resets() {
        let mut b = Backoff::new(BackoffPolicy::new(
            Duration::from_millis(10),
            Duration::from_millis(100),
            2.0,
            0.0,
        ));
        assert_eq!(b.next_delay(), Duration::from_millis(10));
        assert_eq!(b.next_delay(), Duration::from_millis(20));
        b.reset();
        assert_eq!(b.attempt(), 0);
        assert_eq!(b.next_delay(), Duration::from_millis(10));
    }
}
