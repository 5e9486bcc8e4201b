//! Per-zone delivery throttle, built on a token bucket.
//!
//! Tokens refill at a constant rate up to the burst capacity; each delivery
//! consumes one. A worker with no token available sleeps until the next one
//! accrues, which caps the zone's sustained delivery rate without dropping
//! work.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(messages_per_second: f64, burst: u32) -> Self {
        let capacity = f64::from(burst).max(1.0);
        Self {
            tokens: capacity,
            capacity,
            refill_rate: messages_per_second.max(f64::MIN_POSITIVE),
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;
    }

    /// Take one token, or report how long until one is available.
    fn try_take(&mut self) -> Option<Duration> {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            None
        } else {
            let deficit = 1.0 - self.tokens;
            Some(Duration::from_secs_f64(deficit / self.refill_rate))
        }
    }
}

/// The zone throttle. Shared by every worker in the zone.
#[derive(Debug)]
pub struct Speedometer {
    bucket: Mutex<TokenBucket>,
}

impl Speedometer {
    pub fn new(messages_per_second: f64, burst: u32) -> Self {
        Self {
            bucket: Mutex::new(TokenBucket::new(messages_per_second, burst)),
        }
    }

    /// Delay the caller until the zone's rate allows another delivery.
    pub async fn pace(&self) {
        loop {
            let wait = self.bucket.lock().try_take();
            match wait {
                None => return,
                Some(duration) => tokio::time::sleep(duration).await,
            }
        }
    }
}
