//! Rate limiting and throttling.
//!
//! Token bucket per client connection. The bucket starts full and refills
//! continuously at `rate` tokens per second up to `capacity`.

use tokio::time::Instant;

/// Continuous-refill token bucket.
///
/// NOT shared across connections - each session owns its own bucket.
#[derive(Debug)]
pub struct TokenBucket {
    rate: f64,
    capacity: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Bucket with `rate` tokens per second and a burst of `rate` tokens.
    ///
    /// A rate of 0 disables limiting: [`allow`](Self::allow) always succeeds.
    pub fn new(rate: u32) -> Self {
        Self::with_capacity(rate, rate)
    }

    pub fn with_capacity(rate: u32, capacity: u32) -> Self {
        let capacity = f64::from(capacity);
        Self {
            rate: f64::from(rate),
            capacity,
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.rate <= 0.0
    }

    /// Consume one token if available.
    pub fn allow(&mut self) -> bool {
        if self.is_unlimited() {
            return true;
        }
        self.refill(Instant::now());
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Tokens currently available (after refill).
    pub fn available(&mut self) -> f64 {
        self.refill(Instant::now());
        self.tokens
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.last_refill = now;
        let added = elapsed.as_nanos() as f64 * self.rate / 1e9;
        self.tokens = (self.tokens + added).min(self.capacity);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn burst_then_reject() {
        let mut bucket = TokenBucket::new(3);
        assert!(bucket.allow());
        assert!(bucket.allow());
        assert!(bucket.allow());
        assert!(!bucket.allow());
    }

    #[tokio::test(start_paused = true)]
    async fn refills_over_time() {
        let mut bucket = TokenBucket::new(2);
        assert!(bucket.allow());
        assert!(bucket.allow());
        assert!(!bucket.allow());

        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(bucket.allow());
        assert!(!bucket.allow());

        tokio::time::advance(Duration::from_secs(10)).await;
        // Capped at capacity.
        assert!((bucket.available() - 2.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_rate_is_unlimited() {
        let mut bucket = TokenBucket::new(0);
        assert!(bucket.is_unlimited());
        for _ in 0..1000 {
            assert!(bucket.allow());
        }
    }
}
