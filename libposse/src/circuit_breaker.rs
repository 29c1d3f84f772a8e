//! Per-platform circuit breaker
//!
//! # State Transitions
//! ```text
//! Closed    → Open:      consecutive failures reach failure_threshold
//! Open      → Half-Open: reset_timeout elapsed since the last failure (checked lazily)
//! Half-Open → Closed:    a trial call succeeds
//! Half-Open → Open:      a trial call fails
//! ```
//!
//! While open, calls fail with `DispatchError::CircuitOpen` and the wrapped
//! operation is never invoked. Half-open admits at most `half_open_max_calls`
//! trial calls. The lock is released while the wrapped operation runs. A
//! trial call dropped before it completes gives its slot back.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::DispatchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
            half_open_max_calls: 1,
        }
    }
}

/// Point-in-time view of a breaker, for status output
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u64,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u64,
    last_failure: Duration,
    half_open_calls: u32,
}

pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            clock,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure: Duration::ZERO,
                half_open_calls: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state, moving Open to Half-Open once the reset timeout has elapsed
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock();
        self.refresh(&mut inner);
        inner.state
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }

    pub fn success_count(&self) -> u64 {
        self.lock().success_count
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let mut inner = self.lock();
        self.refresh(&mut inner);
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
        }
    }

    /// Run `operation` through the breaker
    ///
    /// Any `Err` from the operation counts as a failure. Rejections are
    /// returned before the operation is constructed or polled.
    pub async fn call<T, F, Fut>(&self, operation: F) -> Result<T, DispatchError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, DispatchError>>,
    {
        let mut slot = TrialSlot {
            breaker: self,
            held: self.admit()?,
        };

        let result = operation().await;
        slot.held = false;

        match result {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(e) => {
                self.on_failure();
                Err(e)
            }
        }
    }

    /// Force the breaker closed with counters zeroed
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.half_open_calls = 0;
        info!(platform = %self.name, "circuit breaker manually reset");
    }

    /// Admit a call; `Ok(true)` when it occupies a half-open trial slot
    fn admit(&self) -> Result<bool, DispatchError> {
        let mut inner = self.lock();
        self.refresh(&mut inner);

        match inner.state {
            CircuitState::Closed => Ok(false),
            CircuitState::Open => Err(self.open_error(&inner)),
            CircuitState::HalfOpen => {
                if inner.half_open_calls >= self.config.half_open_max_calls {
                    return Err(self.open_error(&inner));
                }
                inner.half_open_calls += 1;
                Ok(true)
            }
        }
    }

    fn release_trial(&self) {
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen && inner.half_open_calls > 0 {
            inner.half_open_calls -= 1;
            debug!(platform = %self.name, "trial call abandoned, slot released");
        }
    }

    fn on_success(&self) {
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.state = CircuitState::Closed;
            info!(platform = %self.name, "circuit closed after successful trial call");
        }
        inner.failure_count = 0;
        inner.success_count += 1;
    }

    fn on_failure(&self) {
        let mut inner = self.lock();
        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.last_failure = self.clock.now();

        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                warn!(platform = %self.name, "trial call failed, circuit re-opened");
            }
            CircuitState::Closed if inner.failure_count >= self.config.failure_threshold => {
                inner.state = CircuitState::Open;
                warn!(
                    platform = %self.name,
                    failures = inner.failure_count,
                    "failure threshold reached, circuit opened"
                );
            }
            _ => {}
        }
    }

    fn refresh(&self, inner: &mut BreakerState) {
        if inner.state == CircuitState::Open {
            let elapsed = self.clock.now().saturating_sub(inner.last_failure);
            if elapsed >= self.config.reset_timeout {
                inner.state = CircuitState::HalfOpen;
                inner.half_open_calls = 0;
                info!(platform = %self.name, "reset timeout elapsed, circuit half-open");
            }
        }
    }

    fn open_error(&self, inner: &BreakerState) -> DispatchError {
        DispatchError::CircuitOpen {
            reset_at: inner.last_failure.saturating_add(self.config.reset_timeout),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Half-open slot taken by `admit`, returned if the call is dropped mid-flight
struct TrialSlot<'a> {
    breaker: &'a CircuitBreaker,
    held: bool,
}

impl Drop for TrialSlot<'_> {
    fn drop(&mut self) {
        if self.held {
            self.breaker.release_trial();
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
