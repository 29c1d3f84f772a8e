//! Dry-run publishing
//!
//! Stands in for platforms that have no live client, or for any platform when
//! live mode is off. Renders the text the platform would receive, enforces the
//! platform's character limit, and returns deterministic identifiers and URLs
//! without touching the network.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tracing::debug;

use crate::error::PlatformError;
use crate::platforms::{check_length, compose_text, Platform, PublishReceipt};
use crate::types::ContentItem;

/// Bluesky post limit in graphemes; counted here in chars
pub const BLUESKY_CHAR_LIMIT: usize = 300;

#[derive(Debug)]
pub struct SimulatedPlatform {
    name: String,
    base_url: String,
    character_limit: Option<usize>,
    published: AtomicUsize,
}

impl SimulatedPlatform {
    /// Simulate `name` with URLs under `https://{name}.example.com`
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            base_url: format!("https://{}.example.com", name),
            name,
            character_limit: None,
            published: AtomicUsize::new(0),
        }
    }

    /// Simulation with the limits of a known platform
    pub fn for_platform(name: &str) -> Self {
        let platform = Self::new(name);
        match name {
            "bluesky" => platform.with_character_limit(BLUESKY_CHAR_LIMIT),
            _ => platform,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_character_limit(mut self, limit: usize) -> Self {
        self.character_limit = Some(limit);
        self
    }

    /// Number of successful simulated publishes
    pub fn published_count(&self) -> usize {
        self.published.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Platform for SimulatedPlatform {
    async fn publish(&self, item: &ContentItem) -> Result<PublishReceipt, PlatformError> {
        let text = compose_text(item);
        if let Some(limit) = self.character_limit {
            check_length(&self.name, &text, limit)?;
        }

        let n = self.published.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("{}-{:06}", self.name, n);
        let url = format!("{}/{}/{}", self.base_url, item.id, n);
        debug!(platform = %self.name, id = %id, "simulated publish");

        Ok(PublishReceipt::new(id, Some(url)))
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn character_limit(&self) -> Option<usize> {
        self.character_limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_deterministic_ids_and_urls() {
        let platform = SimulatedPlatform::new("ghost").with_base_url("https://blog.example.org/");
        let item = ContentItem::with_id("essay-1", "An essay", "", "https://example.org/e");

        let first = platform.publish(&item).await.unwrap();
        let second = platform.publish(&item).await.unwrap();

        assert_eq!(first.id, "ghost-000001");
        assert_eq!(
            first.url.as_deref(),
            Some("https://blog.example.org/essay-1/1")
        );
        assert_eq!(second.id, "ghost-000002");
        assert_eq!(platform.published_count(), 2);
    }

    #[tokio::test]
    async fn test_bluesky_limit_is_a_validation_error() {
        let platform = SimulatedPlatform::for_platform("bluesky");
        assert_eq!(platform.character_limit(), Some(BLUESKY_CHAR_LIMIT));

        let item = ContentItem::with_id("p1", "t", "x".repeat(400), "https://example.org/p1");
        let err = platform.publish(&item).await.unwrap_err();
        assert!(matches!(err, PlatformError::Validation(_)));
        assert_eq!(platform.published_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_platform_has_no_limit() {
        let platform = SimulatedPlatform::for_platform("ghost");
        let item = ContentItem::with_id("p1", "t", "x".repeat(10_000), "https://example.org/p1");
        assert!(platform.publish(&item).await.is_ok());
    }
}
