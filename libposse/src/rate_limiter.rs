//! Token bucket rate limiting for outgoing platform calls
//!
//! Tokens accrue continuously at `tokens_per_second` up to `max_tokens`.
//! Refill is computed lazily from the elapsed clock time on every call, so
//! there is no background timer. Refill and debit happen under one lock.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::debug;

use crate::clock::Clock;
use crate::error::{ConfigError, DispatchError, PosseError, Result};

/// Token bucket configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimiterConfig {
    /// Refill rate
    pub tokens_per_second: f64,
    /// Bucket capacity
    pub max_tokens: f64,
    /// Tokens available at construction (defaults to `max_tokens`)
    pub initial_tokens: Option<f64>,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            tokens_per_second: 1.0,
            max_tokens: 10.0,
            initial_tokens: None,
        }
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Duration,
}

/// Token bucket rate limiter
///
/// Safe to share between concurrent dispatches behind an `Arc`.
pub struct RateLimiter {
    rate: f64,
    capacity: f64,
    bucket: Mutex<Bucket>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// Create a new rate limiter
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if the rate or capacity is not
    /// positive, or if refilling an empty bucket would take longer than a
    /// `Duration` can hold.
    pub fn new(config: RateLimiterConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        if !(config.tokens_per_second > 0.0) || !config.tokens_per_second.is_finite() {
            return Err(ConfigError::InvalidValue {
                field: "tokens_per_second".to_string(),
                reason: format!("must be greater than zero (got {})", config.tokens_per_second),
            }
            .into());
        }
        if !(config.max_tokens > 0.0) || !config.max_tokens.is_finite() {
            return Err(ConfigError::InvalidValue {
                field: "max_tokens".to_string(),
                reason: format!("must be greater than zero (got {})", config.max_tokens),
            }
            .into());
        }

        if Duration::try_from_secs_f64(config.max_tokens / config.tokens_per_second).is_err() {
            return Err(ConfigError::InvalidValue {
                field: "tokens_per_second".to_string(),
                reason: format!(
                    "too small to refill {} tokens (got {})",
                    config.max_tokens, config.tokens_per_second
                ),
            }
            .into());
        }

        let initial = config
            .initial_tokens
            .unwrap_or(config.max_tokens)
            .clamp(0.0, config.max_tokens);

        Ok(Self {
            rate: config.tokens_per_second,
            capacity: config.max_tokens,
            bucket: Mutex::new(Bucket {
                tokens: initial,
                last_refill: clock.now(),
            }),
            clock,
        })
    }

    /// Acquire `cost` tokens
    ///
    /// When the bucket is short and `block` is false this fails with
    /// `DispatchError::RateLimitExceeded` carrying the time until enough
    /// tokens accrue. When `block` is true the caller sleeps for exactly that
    /// time, then refills and debits. The lock is not held while sleeping.
    pub async fn acquire(&self, cost: f64, block: bool) -> Result<()> {
        let wait = match self.try_debit(cost)? {
            None => return Ok(()),
            Some(wait) => wait,
        };

        if !block {
            return Err(DispatchError::RateLimitExceeded { retry_after: wait }.into());
        }

        debug!(
            cost = cost,
            wait_ms = wait.as_millis() as u64,
            "rate limiter suspending caller"
        );
        self.clock.sleep(wait).await;

        let mut bucket = self.lock();
        self.refill(&mut bucket);
        bucket.tokens = (bucket.tokens - cost).max(0.0);
        Ok(())
    }

    /// Non-blocking acquire
    pub fn try_acquire(&self, cost: f64) -> Result<()> {
        match self.try_debit(cost)? {
            None => Ok(()),
            Some(wait) => Err(DispatchError::RateLimitExceeded { retry_after: wait }.into()),
        }
    }

    /// Tokens currently available, after refilling
    pub fn available_tokens(&self) -> f64 {
        let mut bucket = self.lock();
        self.refill(&mut bucket);
        bucket.tokens
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Refill then debit if possible; otherwise report the wait required
    fn try_debit(&self, cost: f64) -> Result<Option<Duration>> {
        if !(cost > 0.0) || !cost.is_finite() {
            return Err(PosseError::InvalidInput(format!(
                "Token cost must be greater than zero (got {})",
                cost
            )));
        }
        if cost > self.capacity {
            return Err(PosseError::InvalidInput(format!(
                "Token cost {} exceeds bucket capacity {}",
                cost, self.capacity
            )));
        }

        let mut bucket = self.lock();
        self.refill(&mut bucket);

        if bucket.tokens >= cost {
            bucket.tokens -= cost;
            return Ok(None);
        }

        let deficit = cost - bucket.tokens;
        Ok(Some(
            Duration::try_from_secs_f64(deficit / self.rate).unwrap_or(Duration::MAX),
        ))
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = self.clock.now();
        let elapsed = now.saturating_sub(bucket.last_refill);
        bucket.tokens = (bucket.tokens + elapsed.as_secs_f64() * self.rate).min(self.capacity);
        bucket.last_refill = now;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Bucket> {
        self.bucket.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("rate", &self.rate)
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}
