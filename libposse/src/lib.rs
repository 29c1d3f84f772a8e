//! Posse - resilient syndication for the POSSE workflow
//!
//! Publish on your own site, then push copies everywhere else. This library
//! fans a content item out to independent platform collaborators, guarding
//! each with a token-bucket rate limiter, a circuit breaker and exponential
//! backoff, and records every delivery in a JSON ledger so repeats are skipped.

pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod factory;
pub mod ledger;
pub mod logging;
pub mod platforms;
pub mod rate_limiter;
pub mod retry;
pub mod types;

// Re-export commonly used types
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use dispatcher::{Dispatcher, DispatcherBuilder};
pub use error::{DispatchError, PlatformError, PosseError, Result};
pub use ledger::{DeliveryLedger, DeliveryRecord, DeliveryStatus};
pub use platforms::{Platform, PlatformRegistry, PublishReceipt};
pub use rate_limiter::{RateLimiter, RateLimiterConfig};
pub use retry::RetryConfig;
pub use types::{ContentItem, SyndicationOutcome, SyndicationStatus};
