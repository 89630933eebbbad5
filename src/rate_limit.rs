//! Token bucket gate for calls that hit a rate-limited external API.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::HarnessError;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    max_tokens: f64,
    /// Tokens added per second.
    refill_rate: f64,
    last_refill: Instant,
}

impl Bucket {
    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.refill_rate).min(self.max_tokens);
        self.last_refill = now;
    }

    /// Takes a token, or reports how long until one is available.
    fn try_acquire(&mut self) -> Result<(), Duration> {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            Err(Duration::from_secs_f64((1.0 - self.tokens) / self.refill_rate))
        }
    }
}

/// Requests-per-minute limiter with a burst of one.
///
/// Built with a zero budget the limiter is disabled and `wait` returns
/// immediately.
#[derive(Debug)]
pub struct RateLimiter {
    bucket: Option<Mutex<Bucket>>,
}

impl RateLimiter {
    pub fn per_minute(rpm: u32) -> Self {
        if rpm == 0 {
            return Self::disabled();
        }

        info!("Translator rate limit: {} RPM", rpm);
        Self {
            bucket: Some(Mutex::new(Bucket {
                tokens: 1.0,
                max_tokens: 1.0,
                refill_rate: rpm as f64 / 60.0,
                last_refill: Instant::now(),
            })),
        }
    }

    pub fn disabled() -> Self {
        Self { bucket: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.bucket.is_some()
    }

    /// Blocks until a token is available or `cancel` fires.
    ///
    /// The bucket lock is never held across the sleep, so a cancelled waiter
    /// leaves the bucket untouched.
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<(), HarnessError> {
        let Some(bucket) = &self.bucket else {
            return Ok(());
        };

        loop {
            if cancel.is_cancelled() {
                return Err(HarnessError::RateLimitCancelled);
            }

            let wait = match bucket.lock().await.try_acquire() {
                Ok(()) => return Ok(()),
                Err(wait) => wait,
            };

            debug!("Rate limited, waiting {:?}", wait);
            tokio::select! {
                _ = cancel.cancelled() => return Err(HarnessError::RateLimitCancelled),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }
}
