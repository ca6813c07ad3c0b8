//! Token-bucket rate limiting for the flood stream.

use tokio::time::Instant;

/// Tokens replenish continuously up to the burst capacity. One token is
/// consumed per flooded publication; exhaustion buffers the publication
/// instead of dropping it.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    tokens: f64,
    capacity: f64,
    rate_per_sec: f64,
    last_update: Instant,
}

impl TokenBucket {
    pub fn new(rate_per_sec: f64, burst: f64) -> Self {
        Self {
            tokens: burst,
            capacity: burst,
            rate_per_sec,
            last_update: Instant::now(),
        }
    }

    /// Try to consume one token. Returns false when rate limited.
    pub fn try_consume(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate_per_sec).min(self.capacity);
        self.last_update = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}
