//! Retry with exponential backoff
//!
//! Wraps a single platform call. Only errors whose kind is in the configured
//! retryable set are retried; anything else propagates on the first failure.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::error::{DispatchError, PlatformError, PlatformErrorKind};

/// Backoff settings for one platform call
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Scale each delay by a uniform factor in [0.5, 1.0]
    pub jitter: bool,
    /// Error kinds that trigger another attempt
    pub retryable: Vec<PlatformErrorKind>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
            retryable: vec![PlatformErrorKind::Network, PlatformErrorKind::RateLimit],
        }
    }
}

impl RetryConfig {
    /// Un-jittered delay after failed attempt `attempt` (1-based)
    ///
    /// `min(base_delay * multiplier^(attempt - 1), max_delay)`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let max = self.max_delay.as_secs_f64();
        if !secs.is_finite() || secs >= max {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs.max(0.0))
    }

    pub fn is_retryable(&self, error: &PlatformError) -> bool {
        self.retryable.contains(&error.kind())
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let delay = self.delay_for(attempt);
        if self.jitter {
            let factor: f64 = rand::thread_rng().gen_range(0.5..=1.0);
            delay.mul_f64(factor)
        } else {
            delay
        }
    }
}

/// Run `operation` until it succeeds, fails permanently, or attempts run out
///
/// # Errors
///
/// - `DispatchError::Platform` for a non-retryable failure (no further attempts)
/// - `DispatchError::RetryExhausted` after `max_attempts` retryable failures,
///   carrying the last underlying error
pub async fn retry<T, F, Fut>(
    config: &RetryConfig,
    clock: &dyn Clock,
    mut operation: F,
) -> Result<T, DispatchError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, PlatformError>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    info!(attempt = attempt, "call succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if !config.is_retryable(&e) => {
                return Err(DispatchError::Platform(e));
            }
            Err(e) if attempt >= max_attempts => {
                warn!(attempts = max_attempts, error = %e, "retries exhausted");
                return Err(DispatchError::RetryExhausted {
                    attempts: max_attempts,
                    last_error: e,
                });
            }
            Err(e) => {
                let delay = config.backoff(attempt);
                warn!(
                    attempt = attempt,
                    max_attempts = max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient failure, backing off"
                );
                clock.sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn no_jitter(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            jitter: false,
            ..Default::default()
        }
    }

    #[test]
    fn test_delay_for_doubles_and_caps() {
        let config = RetryConfig {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            ..Default::default()
        };
        assert_eq!(config.delay_for(1), Duration::from_secs(1));
        assert_eq!(config.delay_for(2), Duration::from_secs(2));
        assert_eq!(config.delay_for(3), Duration::from_secs(4));
        assert_eq!(config.delay_for(4), Duration::from_secs(5));
        assert_eq!(config.delay_for(40), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_first_attempt_success_does_not_sleep() {
        let clock = ManualClock::new();
        let result = retry(&no_jitter(3), &clock, || async { Ok::<_, PlatformError>(7) }).await;
        assert_eq!(result.unwrap(), 7);
        assert!(clock.sleeps().is_empty());
    }

    #[tokio::test]
    async fn test_exhaustion_sleeps_n_minus_one_times() {
        let clock = ManualClock::new();
        let calls = AtomicU32::new(0);
        let config = RetryConfig {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(6),
            multiplier: 2.0,
            jitter: false,
            ..Default::default()
        };

        let result: Result<(), _> = retry(&config, &clock, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(PlatformError::Network("connection reset".to_string())) }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert_eq!(
            clock.sleeps(),
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(6),
            ]
        );
        match result {
            Err(DispatchError::RetryExhausted {
                attempts,
                last_error,
            }) => {
                assert_eq!(attempts, 5);
                assert_eq!(
                    last_error,
                    PlatformError::Network("connection reset".to_string())
                );
            }
            other => panic!("Expected RetryExhausted, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_non_retryable_propagates_immediately() {
        let clock = ManualClock::new();
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = retry(&no_jitter(3), &clock, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(PlatformError::Validation("too long".to_string())) }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(clock.sleeps().is_empty());
        assert_eq!(
            result.unwrap_err(),
            DispatchError::Platform(PlatformError::Validation("too long".to_string()))
        );
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failures() {
        let clock = ManualClock::new();
        let calls = AtomicU32::new(0);

        let result = retry(&no_jitter(3), &clock, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(PlatformError::RateLimit("slow down".to_string()))
                } else {
                    Ok("posted")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "posted");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(clock.sleeps().len(), 2);
    }

    #[tokio::test]
    async fn test_jitter_stays_within_half_to_full_delay() {
        let clock = ManualClock::new();
        let config = RetryConfig {
            max_attempts: 4,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            multiplier: 3.0,
            jitter: true,
            ..Default::default()
        };

        let _: Result<(), _> = retry(&config, &clock, || async {
            Err(PlatformError::Network("down".to_string()))
        })
        .await;

        let sleeps = clock.sleeps();
        assert_eq!(sleeps.len(), 3);
        for (i, slept) in sleeps.iter().enumerate() {
            let full = config.delay_for(i as u32 + 1);
            assert!(*slept >= full / 2, "sleep {:?} below half of {:?}", slept, full);
            assert!(*slept <= full, "sleep {:?} above {:?}", slept, full);
        }
    }

    #[tokio::test]
    async fn test_custom_retryable_set() {
        let clock = ManualClock::new();
        let calls = AtomicU32::new(0);
        let config = RetryConfig {
            max_attempts: 2,
            jitter: false,
            retryable: vec![PlatformErrorKind::Posting],
            ..Default::default()
        };

        let result: Result<(), _> = retry(&config, &clock, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(PlatformError::Posting("500".to_string())) }
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(matches!(result, Err(DispatchError::RetryExhausted { attempts: 2, .. })));

        // Network is no longer in the set
        let result: Result<(), _> = retry(&config, &clock, || async {
            Err(PlatformError::Network("down".to_string()))
        })
        .await;
        assert!(matches!(result, Err(DispatchError::Platform(_))));
    }
}
