//! Platform abstraction and registry
//!
//! A platform collaborator publishes one [`ContentItem`] and reports where it
//! landed. The dispatcher looks collaborators up by name in a
//! [`PlatformRegistry`]; a target platform with no registered collaborator is
//! skipped rather than treated as an error.
//!
//! Collaborators signal failures with [`PlatformError`]. Transient failures
//! (`Network`, `RateLimit`) are retried by default; `Validation` and
//! `Authentication` are not.
//!
//! # Examples
//!
//! ```no_run
//! use std::sync::Arc;
//! use libposse::platforms::{simulated::SimulatedPlatform, PlatformRegistry};
//!
//! let mut registry = PlatformRegistry::new();
//! registry.register(Arc::new(SimulatedPlatform::new("mastodon")));
//! assert!(registry.get("mastodon").is_some());
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::PlatformError;
use crate::types::ContentItem;

pub mod bluesky;
pub mod discord;
pub mod ghost;
pub mod mastodon;
pub mod simulated;

// Available in all builds so integration tests can use it
pub mod mock;

/// What a platform returns after a successful publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReceipt {
    /// Platform-specific identifier of the created post
    pub id: String,
    /// Public URL of the post, when the platform reports one
    pub url: Option<String>,
}

impl PublishReceipt {
    pub fn new(id: impl Into<String>, url: Option<String>) -> Self {
        Self {
            id: id.into(),
            url,
        }
    }
}

/// Publishing capability for one destination
#[async_trait]
pub trait Platform: Send + Sync {
    /// Publish `item` and return where it was published
    ///
    /// # Errors
    ///
    /// - `PlatformError::Validation` if the content cannot be published as-is
    /// - `PlatformError::Authentication` for rejected credentials
    /// - `PlatformError::Network` / `PlatformError::RateLimit` for transient failures
    /// - `PlatformError::Posting` for other server-side failures
    async fn publish(&self, item: &ContentItem) -> Result<PublishReceipt, PlatformError>;

    /// Lowercase identifier (e.g., "mastodon", "discord")
    fn name(&self) -> &str;

    /// Maximum characters per post, if the platform has a hard limit
    fn character_limit(&self) -> Option<usize> {
        None
    }
}

/// Collaborators keyed by platform name
#[derive(Default, Clone)]
pub struct PlatformRegistry {
    platforms: BTreeMap<String, Arc<dyn Platform>>,
}

impl PlatformRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a collaborator under its own name, replacing any previous one
    pub fn register(&mut self, platform: Arc<dyn Platform>) {
        self.platforms.insert(platform.name().to_string(), platform);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Platform>> {
        self.platforms.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.platforms.contains_key(name)
    }

    /// Registered names in sorted order
    pub fn names(&self) -> Vec<String> {
        self.platforms.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.platforms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.platforms.is_empty()
    }
}

impl std::fmt::Debug for PlatformRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlatformRegistry")
            .field("platforms", &self.names())
            .finish()
    }
}

/// Plain-text rendering used by text-only platforms
///
/// Title, body and canonical link separated by blank lines; an empty body is
/// left out.
pub fn compose_text(item: &ContentItem) -> String {
    let mut parts: Vec<&str> = vec![item.title.trim()];
    let body = item.body.trim();
    if !body.is_empty() {
        parts.push(body);
    }
    parts.push(item.canonical_url.trim());
    parts.join("\n\n")
}

/// Reject text longer than `limit` characters
pub fn check_length(platform: &str, text: &str, limit: usize) -> Result<(), PlatformError> {
    let count = text.chars().count();
    if count == 0 {
        return Err(PlatformError::Validation(format!(
            "{}: content cannot be empty",
            platform
        )));
    }
    if count > limit {
        return Err(PlatformError::Validation(format!(
            "{}: content exceeds {} character limit (got {} characters)",
            platform, limit, count
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platforms::mock::MockPlatform;

    #[test]
    fn test_registry_lookup() {
        let mut registry = PlatformRegistry::new();
        assert!(registry.is_empty());

        registry.register(Arc::new(MockPlatform::success("discord")));
        registry.register(Arc::new(MockPlatform::success("mastodon")));

        assert_eq!(registry.len(), 2);
        assert!(registry.contains("discord"));
        assert!(registry.get("ghost").is_none());
        assert_eq!(registry.names(), vec!["discord", "mastodon"]);
    }

    #[test]
    fn test_compose_text() {
        let item = ContentItem::with_id("p1", "Release 1.0", "  Notes  ", "https://example.org/r");
        assert_eq!(
            compose_text(&item),
            "Release 1.0\n\nNotes\n\nhttps://example.org/r"
        );

        let bare = ContentItem::with_id("p2", "Title", "", "https://example.org/t");
        assert_eq!(compose_text(&bare), "Title\n\nhttps://example.org/t");
    }

    #[test]
    fn test_check_length_counts_chars_not_bytes() {
        assert!(check_length("bluesky", "héllo", 5).is_ok());
        let err = check_length("bluesky", "héllo!", 5).unwrap_err();
        assert!(matches!(err, PlatformError::Validation(_)));
        assert!(err.to_string().contains("5 character limit"));
        assert!(check_length("bluesky", "", 5).is_err());
    }
}
