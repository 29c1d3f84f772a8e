//! Multi-platform syndication
//!
//! The [`Dispatcher`] registers content items and fans each one out to its
//! target platforms. Every (item, platform) pair goes through the same path:
//!
//! 1. ledger dedup check (skip if already delivered)
//! 2. collaborator lookup (skip if none registered)
//! 3. rate limiter → circuit breaker → retry → collaborator
//! 4. ledger append for the published/failed outcome
//!
//! A failure on one platform never aborts the others; it becomes that
//! platform's `failed` outcome. A publish that succeeded but could not be
//! written to the ledger stays `published` and carries the write error.
//!
//! # Examples
//!
//! ```no_run
//! use std::sync::Arc;
//! use libposse::circuit_breaker::CircuitBreakerConfig;
//! use libposse::dispatcher::Dispatcher;
//! use libposse::ledger::DeliveryLedger;
//! use libposse::platforms::simulated::SimulatedPlatform;
//! use libposse::retry::RetryConfig;
//!
//! # async fn example() -> libposse::error::Result<()> {
//! let dispatcher = Dispatcher::builder()
//!     .platform(Arc::new(SimulatedPlatform::new("mastodon")))
//!     .with_retry(RetryConfig::default())
//!     .with_default_circuit_breaker(CircuitBreakerConfig::default())
//!     .with_ledger(Arc::new(DeliveryLedger::open("delivery_log.json")))
//!     .build();
//!
//! dispatcher.create_post("post-1", "Hello", "", "https://example.org/hello", &["mastodon"]);
//! for outcome in dispatcher.syndicate("post-1").await? {
//!     println!("{}: {}", outcome.platform, outcome.status);
//! }
//! # Ok(())
//! # }
//! ```

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::join_all;
use futures::FutureExt;
use tracing::{debug, info, warn};

use crate::circuit_breaker::{BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig};
use crate::clock::{Clock, SystemClock};
use crate::error::{DispatchError, PlatformError, PosseError, Result};
use crate::ledger::{DeliveryLedger, DeliveryRecord};
use crate::platforms::{Platform, PlatformRegistry, PublishReceipt};
use crate::rate_limiter::RateLimiter;
use crate::retry::{retry, RetryConfig};
use crate::types::{ContentItem, SyndicationOutcome};

/// Outcome error text for a pair the ledger already shows as delivered
pub const DEDUP_SKIP_REASON: &str = "already delivered (dedup)";

/// Fans content out to platforms through the resilience chain
pub struct Dispatcher {
    registry: PlatformRegistry,
    retry: Option<RetryConfig>,
    breakers: HashMap<String, Arc<CircuitBreaker>>,
    rate_limiter: Option<Arc<RateLimiter>>,
    platform_limiters: HashMap<String, Arc<RateLimiter>>,
    ledger: Option<Arc<DeliveryLedger>>,
    clock: Arc<dyn Clock>,
    concurrent: bool,
    posts: Mutex<HashMap<String, ContentItem>>,
}

impl Dispatcher {
    pub fn builder() -> DispatcherBuilder {
        DispatcherBuilder::default()
    }

    /// Register a content item for later syndication
    ///
    /// Repeated platform names are collapsed. Registering an existing id
    /// replaces the stored item.
    pub fn create_post(
        &self,
        id: &str,
        title: &str,
        body: &str,
        canonical_url: &str,
        platforms: &[&str],
    ) -> ContentItem {
        let mut item = ContentItem::with_id(id, title, body, canonical_url);
        for platform in platforms {
            item.add_platform(*platform);
        }
        self.register_post(item.clone());
        item
    }

    /// Register a prepared content item
    pub fn register_post(&self, item: ContentItem) {
        self.lock_posts().insert(item.id.clone(), item);
    }

    pub fn get_post(&self, id: &str) -> Option<ContentItem> {
        self.lock_posts().get(id).cloned()
    }

    pub fn total_posts(&self) -> usize {
        self.lock_posts().len()
    }

    /// Syndicate a registered item to each of its target platforms
    ///
    /// Returns one outcome per target platform, in the item's platform order,
    /// and stores the list on the item.
    ///
    /// # Errors
    ///
    /// Returns `PosseError::InvalidInput` if no item with `id` is registered.
    /// Per-platform failures are reported in the outcomes, never as an error.
    pub async fn syndicate(&self, id: &str) -> Result<Vec<SyndicationOutcome>> {
        let item = self
            .get_post(id)
            .ok_or_else(|| PosseError::InvalidInput(format!("Unknown content id: {}", id)))?;

        info!(
            content_id = %item.id,
            platforms = ?item.platforms,
            concurrent = self.concurrent,
            "syndicating content"
        );

        let outcomes = if self.concurrent {
            join_all(
                item.platforms
                    .iter()
                    .map(|platform| self.dispatch_one(&item, platform)),
            )
            .await
        } else {
            let mut outcomes = Vec::with_capacity(item.platforms.len());
            for platform in &item.platforms {
                outcomes.push(self.dispatch_one(&item, platform).await);
            }
            outcomes
        };

        if let Some(stored) = self.lock_posts().get_mut(id) {
            stored.syndications = outcomes.clone();
        }

        Ok(outcomes)
    }

    /// Circuit breaker guarding `platform`, if one is configured
    pub fn breaker(&self, platform: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(platform).cloned()
    }

    /// Snapshots of every breaker, sorted by platform name
    pub fn breaker_snapshots(&self) -> Vec<BreakerSnapshot> {
        let mut snapshots: Vec<_> = self.breakers.values().map(|b| b.snapshot()).collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    /// Limiter applied to `platform`: its own override, else the shared one
    pub fn rate_limiter_for(&self, platform: &str) -> Option<Arc<RateLimiter>> {
        self.platform_limiters
            .get(platform)
            .or(self.rate_limiter.as_ref())
            .cloned()
    }

    pub fn ledger(&self) -> Option<&Arc<DeliveryLedger>> {
        self.ledger.as_ref()
    }

    pub fn registry(&self) -> &PlatformRegistry {
        &self.registry
    }

    pub fn is_concurrent(&self) -> bool {
        self.concurrent
    }

    async fn dispatch_one(&self, item: &ContentItem, platform_name: &str) -> SyndicationOutcome {
        if let Some(ledger) = &self.ledger {
            if ledger.has_been_delivered(&item.id, platform_name) {
                info!(content_id = %item.id, platform = %platform_name, "already delivered, skipping");
                return SyndicationOutcome::skipped(platform_name, DEDUP_SKIP_REASON);
            }
        }

        let Some(platform) = self.registry.get(platform_name) else {
            debug!(platform = %platform_name, "no client registered");
            return SyndicationOutcome::skipped(
                platform_name,
                format!("no client configured for {}", platform_name),
            );
        };

        let pending = SyndicationOutcome::pending(platform_name);
        match self.publish_resilient(platform.as_ref(), item).await {
            Ok(receipt) => {
                let url = receipt
                    .url
                    .clone()
                    .unwrap_or_else(|| fallback_url(platform_name, &item.id));
                info!(content_id = %item.id, platform = %platform_name, url = %url, "published");
                let record = DeliveryRecord::success(&item.id, platform_name, Some(url.clone()))
                    .with_metadata("external_id", serde_json::Value::String(receipt.id));
                let outcome = pending.mark_published(url);
                match self.record(record).await {
                    Ok(()) => outcome,
                    Err(e) => {
                        warn!(content_id = %item.id, platform = %platform_name, error = %e, "published but not recorded; a rerun will repost");
                        outcome.with_ledger_error(e)
                    }
                }
            }
            Err(e) => {
                let message = failure_message(&e);
                warn!(content_id = %item.id, platform = %platform_name, error = %message, "syndication failed");
                let record = DeliveryRecord::failure(&item.id, platform_name, message.clone());
                if let Err(e) = self.record(record).await {
                    warn!(content_id = %item.id, platform = %platform_name, error = %e, "failed to append delivery record");
                }
                pending.mark_failed(message)
            }
        }
    }

    /// Rate limiter, then breaker, then retry around the raw call
    async fn publish_resilient(
        &self,
        platform: &dyn Platform,
        item: &ContentItem,
    ) -> Result<PublishReceipt> {
        let name = platform.name();

        if let Some(limiter) = self.rate_limiter_for(name) {
            limiter.acquire(1.0, true).await?;
        }

        let attempt = move || async move {
            match &self.retry {
                Some(config) => {
                    retry(config, self.clock.as_ref(), move || {
                        guarded_publish(platform, item)
                    })
                    .await
                }
                None => guarded_publish(platform, item)
                    .await
                    .map_err(DispatchError::from),
            }
        };

        let result = match self.breakers.get(name) {
            Some(breaker) => breaker.call(attempt).await,
            None => attempt().await,
        };
        Ok(result?)
    }

    async fn record(&self, record: DeliveryRecord) -> Result<()> {
        match &self.ledger {
            Some(ledger) => ledger.clone().append_async(record).await,
            None => Ok(()),
        }
    }

    fn lock_posts(&self) -> MutexGuard<'_, HashMap<String, ContentItem>> {
        self.posts.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("registry", &self.registry)
            .field("retry", &self.retry)
            .field("breakers", &self.breakers.keys().collect::<Vec<_>>())
            .field("concurrent", &self.concurrent)
            .finish_non_exhaustive()
    }
}

/// Call the collaborator, turning a panic into a posting error
async fn guarded_publish(
    platform: &dyn Platform,
    item: &ContentItem,
) -> std::result::Result<PublishReceipt, PlatformError> {
    match AssertUnwindSafe(platform.publish(item)).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(PlatformError::Posting(format!(
            "{} client panicked: {}",
            platform.name(),
            panic_message(panic.as_ref())
        ))),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Message recorded for a failed outcome, without the top-level error prefix
fn failure_message(error: &PosseError) -> String {
    match error {
        PosseError::Dispatch(e) => e.to_string(),
        PosseError::Platform(e) => e.to_string(),
        other => other.to_string(),
    }
}

/// URL recorded when a platform reports success without one
pub fn fallback_url(platform: &str, content_id: &str) -> String {
    format!("https://{}.example.com/{}", platform, content_id)
}

/// Builder for [`Dispatcher`]
///
/// Every resilience layer is optional. Breakers from
/// `with_default_circuit_breaker` are created at `build()` for each
/// registered platform without an explicit breaker.
pub struct DispatcherBuilder {
    registry: PlatformRegistry,
    retry: Option<RetryConfig>,
    breaker_configs: HashMap<String, CircuitBreakerConfig>,
    default_breaker: Option<CircuitBreakerConfig>,
    breakers: HashMap<String, Arc<CircuitBreaker>>,
    rate_limiter: Option<Arc<RateLimiter>>,
    platform_limiters: HashMap<String, Arc<RateLimiter>>,
    ledger: Option<Arc<DeliveryLedger>>,
    clock: Option<Arc<dyn Clock>>,
    concurrent: bool,
}

impl Default for DispatcherBuilder {
    fn default() -> Self {
        Self {
            registry: PlatformRegistry::new(),
            retry: None,
            breaker_configs: HashMap::new(),
            default_breaker: None,
            breakers: HashMap::new(),
            rate_limiter: None,
            platform_limiters: HashMap::new(),
            ledger: None,
            clock: None,
            concurrent: true,
        }
    }
}

impl DispatcherBuilder {
    /// Register a platform collaborator
    pub fn platform(mut self, platform: Arc<dyn Platform>) -> Self {
        self.registry.register(platform);
        self
    }

    /// Use a prepared registry, replacing any platforms added so far
    pub fn registry(mut self, registry: PlatformRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_retry(mut self, config: RetryConfig) -> Self {
        self.retry = Some(config);
        self
    }

    /// Breaker for one platform
    pub fn with_circuit_breaker(
        mut self,
        platform: impl Into<String>,
        config: CircuitBreakerConfig,
    ) -> Self {
        self.breaker_configs.insert(platform.into(), config);
        self
    }

    /// Breaker for every registered platform without its own
    pub fn with_default_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.default_breaker = Some(config);
        self
    }

    /// Use an existing breaker instance, keyed by its name
    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breakers.insert(breaker.name().to_string(), breaker);
        self
    }

    /// Limiter shared by all platforms
    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    /// Limiter used for one platform instead of the shared one
    pub fn with_platform_rate_limiter(
        mut self,
        platform: impl Into<String>,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        self.platform_limiters.insert(platform.into(), limiter);
        self
    }

    pub fn with_ledger(mut self, ledger: Arc<DeliveryLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// Time source for breakers and backoff (defaults to [`SystemClock`])
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Dispatch platforms one after another instead of concurrently
    pub fn sequential(mut self) -> Self {
        self.concurrent = false;
        self
    }

    pub fn build(self) -> Dispatcher {
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock::new()) as Arc<dyn Clock>);

        let mut breakers = self.breakers;
        for (name, config) in self.breaker_configs {
            breakers
                .entry(name.clone())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(name, config, clock.clone())));
        }
        if let Some(config) = self.default_breaker {
            for name in self.registry.names() {
                breakers.entry(name.clone()).or_insert_with(|| {
                    Arc::new(CircuitBreaker::new(name, config.clone(), clock.clone()))
                });
            }
        }

        Dispatcher {
            registry: self.registry,
            retry: self.retry,
            breakers,
            rate_limiter: self.rate_limiter,
            platform_limiters: self.platform_limiters,
            ledger: self.ledger,
            clock,
            concurrent: self.concurrent,
            posts: Mutex::new(HashMap::new()),
        }
    }
}
