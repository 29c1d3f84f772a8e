//! Mock platform implementation for testing
//!
//! A configurable collaborator that can succeed, fail with a chosen
//! [`PlatformError`], fail a fixed number of times before recovering, or
//! panic. Every call is counted so tests can assert exactly how often the
//! resilience layer reached the platform.

use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::sleep;

use crate::error::PlatformError;
use crate::platforms::{Platform, PublishReceipt};
use crate::types::ContentItem;

/// Configuration for mock platform behavior
#[derive(Debug, Clone)]
pub struct MockConfig {
    /// Platform name (e.g., "mastodon", "discord")
    pub name: String,

    /// Error returned by failing calls; `None` means every call succeeds
    pub error: Option<PlatformError>,

    /// Fail only the first N calls, then succeed
    pub fail_times: Option<usize>,

    /// Panic inside `publish`
    pub panics: bool,

    /// Whether the receipt carries a URL
    pub returns_url: bool,

    /// Delay before completing (simulates network latency)
    pub delay: Duration,

    /// Character limit reported to callers
    pub character_limit: Option<usize>,

    /// Number of times publish has been called
    pub publish_call_count: Arc<Mutex<usize>>,

    /// Ids of items that were published successfully
    pub published: Arc<Mutex<Vec<String>>>,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            name: "mock".to_string(),
            error: None,
            fail_times: None,
            panics: false,
            returns_url: true,
            delay: Duration::from_millis(0),
            character_limit: None,
            publish_call_count: Arc::new(Mutex::new(0)),
            published: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

/// Mock platform for testing
#[derive(Debug, Clone)]
pub struct MockPlatform {
    config: MockConfig,
}

impl MockPlatform {
    pub fn new(config: MockConfig) -> Self {
        Self { config }
    }

    /// Always succeeds
    pub fn success(name: &str) -> Self {
        Self::new(MockConfig {
            name: name.to_string(),
            ..Default::default()
        })
    }

    /// Always fails with `error`
    pub fn failing(name: &str, error: PlatformError) -> Self {
        Self::new(MockConfig {
            name: name.to_string(),
            error: Some(error),
            ..Default::default()
        })
    }

    /// Fails the first `times` calls with `error`, then succeeds
    pub fn flaky(name: &str, times: usize, error: PlatformError) -> Self {
        Self::new(MockConfig {
            name: name.to_string(),
            error: Some(error),
            fail_times: Some(times),
            ..Default::default()
        })
    }

    /// Panics on every call
    pub fn panicking(name: &str) -> Self {
        Self::new(MockConfig {
            name: name.to_string(),
            panics: true,
            ..Default::default()
        })
    }

    /// Succeeds without reporting a URL
    pub fn without_url(name: &str) -> Self {
        Self::new(MockConfig {
            name: name.to_string(),
            returns_url: false,
            ..Default::default()
        })
    }

    pub fn with_delay(name: &str, delay: Duration) -> Self {
        Self::new(MockConfig {
            name: name.to_string(),
            delay,
            ..Default::default()
        })
    }

    /// Get the number of times publish was called
    pub fn publish_call_count(&self) -> usize {
        *lock(&self.config.publish_call_count)
    }

    /// Ids of every item published successfully
    pub fn published(&self) -> Vec<String> {
        lock(&self.config.published).clone()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[async_trait]
impl Platform for MockPlatform {
    async fn publish(&self, item: &ContentItem) -> Result<PublishReceipt, PlatformError> {
        let call = {
            let mut count = lock(&self.config.publish_call_count);
            *count += 1;
            *count
        };

        if !self.config.delay.is_zero() {
            sleep(self.config.delay).await;
        }

        if self.config.panics {
            panic!("mock platform {} panicked", self.config.name);
        }

        if let Some(error) = &self.config.error {
            let should_fail = match self.config.fail_times {
                Some(times) => call <= times,
                None => true,
            };
            if should_fail {
                return Err(error.clone());
            }
        }

        lock(&self.config.published).push(item.id.clone());

        let id = format!("{}-mock-{}", self.config.name, call);
        let url = self
            .config
            .returns_url
            .then(|| format!("https://{}.mock/{}/{}", self.config.name, item.id, call));
        Ok(PublishReceipt::new(id, url))
    }

    fn name(&self) -> &str {
        &self.config.name
    }

    fn character_limit(&self) -> Option<usize> {
        self.config.character_limit
    }
}
