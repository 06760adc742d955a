use std::time::Instant;

use parking_lot::Mutex;

use crate::transport::TrafficType;

/// Token bucket rate limiter.
///
/// A bucket constructed with `(0, 0)` is unlimited: every `try_consume`
/// succeeds. The bucket starts full, so an initial burst of up to `max` tokens
/// passes before the refill rate applies.
pub struct TokenBucket {
    inner: Mutex<BucketState>,
}

struct BucketState {
    max: usize,
    refill_rate: usize,
    tokens: usize,
    largest_burst: usize,
    last_refill: Instant,
}

impl BucketState {
    fn unlimited(&self) -> bool {
        self.max == 0 && self.refill_rate == 0
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill);
        let added = (elapsed.as_secs_f64() * self.refill_rate as f64) as usize;
        if added > 0 {
            self.tokens = self.tokens.saturating_add(added).min(self.max);
            self.last_refill = now;
        }
    }
}

impl TokenBucket {
    pub fn new(max: usize, refill_rate: usize) -> Self {
        Self {
            inner: Mutex::new(BucketState {
                max,
                refill_rate,
                tokens: max,
                largest_burst: 0,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn try_consume(&self, tokens: usize) -> bool {
        let mut state = self.inner.lock();
        if state.unlimited() {
            state.largest_burst = state.largest_burst.max(tokens);
            return true;
        }
        state.refill();
        if state.tokens >= tokens {
            state.tokens -= tokens;
            state.largest_burst = state.largest_burst.max(tokens);
            true
        } else {
            false
        }
    }

    /// Largest single consumption that has passed so far.
    pub fn largest_burst(&self) -> usize {
        self.inner.lock().largest_burst
    }

    pub fn reset(&self, max: usize, refill_rate: usize) {
        let mut state = self.inner.lock();
        state.max = max;
        state.refill_rate = refill_rate;
        state.tokens = max;
        state.last_refill = Instant::now();
    }

    pub fn size(&self) -> usize {
        self.inner.lock().tokens
    }
}

/// Rate limiter used by the backlog scanners and the bootstrap requester:
/// a token bucket whose burst capacity equals its refill rate.
pub struct RateLimiter {
    bucket: TokenBucket,
}

impl RateLimiter {
    pub fn new(rate: usize) -> Self {
        Self {
            bucket: TokenBucket::new(rate, rate),
        }
    }

    pub fn should_pass(&self, count: usize) -> bool {
        self.bucket.try_consume(count)
    }

    pub fn size(&self) -> usize {
        self.bucket.size()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BandwidthLimiterConfig {
    pub generic_limit: usize,
    pub generic_burst_ratio: f64,
    pub bootstrap_limit: usize,
    pub bootstrap_burst_ratio: f64,
}

impl Default for BandwidthLimiterConfig {
    fn default() -> Self {
        Self {
            generic_limit: 10 * 1024 * 1024,
            generic_burst_ratio: 3.0,
            bootstrap_limit: 5 * 1024 * 1024,
            bootstrap_burst_ratio: 1.0,
        }
    }
}

/// Outbound bandwidth limiter shared by all channels, one token bucket per
/// traffic class.
pub struct BandwidthLimiter {
    limiter_generic: TokenBucket,
    limiter_bootstrap: TokenBucket,
}

impl BandwidthLimiter {
    pub fn new(config: BandwidthLimiterConfig) -> Self {
        Self {
            limiter_generic: TokenBucket::new(
                (config.generic_limit as f64 * config.generic_burst_ratio) as usize,
                config.generic_limit,
            ),
            limiter_bootstrap: TokenBucket::new(
                (config.bootstrap_limit as f64 * config.bootstrap_burst_ratio) as usize,
                config.bootstrap_limit,
            ),
        }
    }

    fn select_limiter(&self, traffic_type: TrafficType) -> &TokenBucket {
        match traffic_type {
            TrafficType::Bootstrap => &self.limiter_bootstrap,
            _ => &self.limiter_generic,
        }
    }

    pub fn should_pass(&self, buffer_size: usize, traffic_type: TrafficType) -> bool {
        self.select_limiter(traffic_type).try_consume(buffer_size)
    }

    pub fn reset(&self, limit: usize, burst_ratio: f64, traffic_type: TrafficType) {
        self.select_limiter(traffic_type)
            .reset((limit as f64 * burst_ratio) as usize, limit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn basic_burst_and_refill() {
        let bucket = TokenBucket::new(10, 10);
        assert!(bucket.try_consume(10));
        assert!(!bucket.try_consume(10));

        std::thread::sleep(Duration::from_millis(300));
        assert!(bucket.try_consume(3));
        assert!(!bucket.try_consume(10));

        std::thread::sleep(Duration::from_secs(1));
        assert!(bucket.try_consume(10));
        assert_eq!(bucket.largest_burst(), 10);
    }

    #[test]
    fn network_rate() {
        // One token stands in for 1 MB: 10 MB burst, 5 MB/s sustained.
        let bucket = TokenBucket::new(10, 5);
        assert!(bucket.try_consume(5));
        assert_eq!(bucket.largest_burst(), 5);
        assert!(bucket.try_consume(5));
        assert_eq!(bucket.largest_burst(), 10);
        assert!(!bucket.try_consume(5));

        std::thread::sleep(Duration::from_millis(200));
        assert!(bucket.try_consume(1));
        assert!(!bucket.try_consume(1));
    }

    #[test]
    fn unlimited_bucket_always_passes() {
        let bucket = TokenBucket::new(0, 0);
        assert!(bucket.try_consume(5));
        assert_eq!(bucket.largest_burst(), 5);
        assert!(bucket.try_consume(1_000_000_000));
        assert!(bucket.try_consume(1_000_000_000));
        assert_eq!(bucket.largest_burst(), 1_000_000_000);
    }

    #[test]
    fn reset_changes_limits() {
        let bucket = TokenBucket::new(0, 0);
        assert!(bucket.try_consume(1_000_000));

        bucket.reset(1000, 1000);
        assert!(!bucket.try_consume(1001));
        assert!(bucket.try_consume(1000));
        assert!(!bucket.try_consume(1000));

        bucket.reset(2000, 1);
        assert!(!bucket.try_consume(2001));
        assert!(bucket.try_consume(2000));

        bucket.reset(0, 0);
        assert!(bucket.try_consume(1_000_000));
        assert!(bucket.try_consume(1_000_000));
    }
}
