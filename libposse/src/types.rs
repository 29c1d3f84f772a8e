//! Core types for Posse

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A piece of authored content and where it should be syndicated
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentItem {
    pub id: String,
    pub title: String,
    pub body: String,
    /// Canonical location on the author's own site
    pub canonical_url: String,
    /// Target platforms, in dispatch order, without duplicates
    pub platforms: Vec<String>,
    /// Outcomes of the most recent syndication
    #[serde(default)]
    pub syndications: Vec<SyndicationOutcome>,
    pub created_at: DateTime<Utc>,
}

impl ContentItem {
    /// Create an item with a fresh UUID and no target platforms
    pub fn new(
        title: impl Into<String>,
        body: impl Into<String>,
        canonical_url: impl Into<String>,
    ) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), title, body, canonical_url)
    }

    pub fn with_id(
        id: impl Into<String>,
        title: impl Into<String>,
        body: impl Into<String>,
        canonical_url: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            body: body.into(),
            canonical_url: canonical_url.into(),
            platforms: Vec::new(),
            syndications: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Add a target platform; repeats are ignored
    pub fn add_platform(&mut self, platform: impl Into<String>) -> &mut Self {
        let platform = platform.into();
        if !self.platforms.contains(&platform) {
            self.platforms.push(platform);
        }
        self
    }

    pub fn syndication(&self, platform: &str) -> Option<&SyndicationOutcome> {
        self.syndications.iter().find(|s| s.platform == platform)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyndicationStatus {
    Pending,
    Published,
    Failed,
    Skipped,
}

impl std::fmt::Display for SyndicationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyndicationStatus::Pending => write!(f, "pending"),
            SyndicationStatus::Published => write!(f, "published"),
            SyndicationStatus::Failed => write!(f, "failed"),
            SyndicationStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// Result of syndicating one item to one platform
///
/// Starts `Pending`; every other status is terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyndicationOutcome {
    pub platform: String,
    pub status: SyndicationStatus,
    pub external_url: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl SyndicationOutcome {
    pub fn pending(platform: impl Into<String>) -> Self {
        Self {
            platform: platform.into(),
            status: SyndicationStatus::Pending,
            external_url: None,
            published_at: None,
            error: None,
        }
    }

    pub fn skipped(platform: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            error: Some(reason.into()),
            status: SyndicationStatus::Skipped,
            ..Self::pending(platform)
        }
    }

    pub fn mark_published(mut self, external_url: impl Into<String>) -> Self {
        debug_assert_eq!(self.status, SyndicationStatus::Pending);
        self.status = SyndicationStatus::Published;
        self.external_url = Some(external_url.into());
        self.published_at = Some(Utc::now());
        self
    }

    pub fn mark_failed(mut self, error: impl Into<String>) -> Self {
        debug_assert_eq!(self.status, SyndicationStatus::Pending);
        self.status = SyndicationStatus::Failed;
        self.error = Some(error.into());
        self.published_at = Some(Utc::now());
        self
    }

    /// Note that a published delivery could not be written to the ledger
    pub fn with_ledger_error(mut self, error: impl std::fmt::Display) -> Self {
        self.error = Some(format!("ledger write failed: {}", error));
        self
    }

    pub fn is_published(&self) -> bool {
        self.status == SyndicationStatus::Published
    }

    /// Failed, or published without a ledger record to deduplicate against
    pub fn needs_attention(&self) -> bool {
        match self.status {
            SyndicationStatus::Failed => true,
            SyndicationStatus::Published => self.error.is_some(),
            _ => false,
        }
    }

    pub fn is_failed(&self) -> bool {
        self.status == SyndicationStatus::Failed
    }

    pub fn is_skipped(&self) -> bool {
        self.status == SyndicationStatus::Skipped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_item_gets_uuid() {
        let a = ContentItem::new("Launch", "We shipped", "https://example.org/launch");
        let b = ContentItem::new("Launch", "We shipped", "https://example.org/launch");
        assert_ne!(a.id, b.id);
        assert!(Uuid::parse_str(&a.id).is_ok());
        assert!(a.platforms.is_empty());
        assert!(a.syndications.is_empty());
    }

    #[test]
    fn test_add_platform_deduplicates_and_keeps_order() {
        let mut item = ContentItem::with_id("p1", "t", "b", "https://example.org/p1");
        item.add_platform("mastodon")
            .add_platform("discord")
            .add_platform("mastodon");
        assert_eq!(item.platforms, vec!["mastodon", "discord"]);
    }

    #[test]
    fn test_outcome_transitions() {
        let published = SyndicationOutcome::pending("mastodon").mark_published("https://m/1");
        assert!(published.is_published());
        assert_eq!(published.external_url.as_deref(), Some("https://m/1"));
        assert!(published.published_at.is_some());

        let failed = SyndicationOutcome::pending("discord").mark_failed("boom");
        assert!(failed.is_failed());
        assert_eq!(failed.error.as_deref(), Some("boom"));

        let skipped = SyndicationOutcome::skipped("ghost", "no client configured for ghost");
        assert!(skipped.is_skipped());
        assert!(skipped.published_at.is_none());
    }

    #[test]
    fn test_syndication_lookup_and_status_names() {
        let mut item = ContentItem::with_id("p1", "t", "b", "u");
        item.syndications
            .push(SyndicationOutcome::pending("discord").mark_failed("x"));
        assert!(item.syndication("discord").is_some());
        assert!(item.syndication("mastodon").is_none());

        let json = serde_json::to_string(&SyndicationStatus::Published).unwrap();
        assert_eq!(json, "\"published\"");
        assert_eq!(SyndicationStatus::Skipped.to_string(), "skipped");
    }
}
