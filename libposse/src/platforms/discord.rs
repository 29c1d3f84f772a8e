//! Discord webhook publishing
//!
//! Posts a single embed per content item to a channel webhook. The embed
//! title is the first line of the body (or the item title), the description
//! the remainder, and the colour follows the content category named in the
//! title or the opening of the body.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::PlatformError;
use crate::platforms::{Platform, PublishReceipt};
use crate::types::ContentItem;

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
const MAX_DESCRIPTION_CHARS: usize = 4096;
const FALLBACK_DESCRIPTION_CHARS: usize = 200;

/// Discord blurple
pub const DEFAULT_COLOR: u32 = 0x5865F2;

const CATEGORY_COLORS: [(&str, u32); 5] = [
    ("launch", 0x2ECC71),
    ("release", 0x3498DB),
    ("essay", 0xF1C40F),
    ("community", 0x9B59B6),
    ("institutional", 0x95A5A6),
];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmbedField {
    pub name: String,
    pub value: String,
    pub inline: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiscordEmbed {
    pub title: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub color: u32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<EmbedField>,
}

impl DiscordEmbed {
    /// Build the embed for a content item
    pub fn for_item(item: &ContentItem) -> Self {
        let body = item.body.trim();
        let (title, description) = match body.split_once('\n') {
            Some((first, rest)) if !first.trim().is_empty() => {
                (first.trim().to_string(), rest.trim().to_string())
            }
            _ => (item.title.clone(), truncate(body, FALLBACK_DESCRIPTION_CHARS)),
        };

        Self {
            title,
            description: truncate(&description, MAX_DESCRIPTION_CHARS),
            url: (!item.canonical_url.is_empty()).then(|| item.canonical_url.clone()),
            color: category_color(&item.title, body),
            fields: vec![EmbedField {
                name: "Published".to_string(),
                value: item.created_at.format("%Y-%m-%d %H:%M UTC").to_string(),
                inline: true,
            }],
        }
    }
}

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    embeds: [&'a DiscordEmbed; 1],
}

/// Subset of the message object returned with `?wait=true`
#[derive(Debug, Deserialize)]
struct WebhookMessage {
    id: String,
    channel_id: Option<String>,
    guild_id: Option<String>,
}

/// Colour for the first category keyword found in the title or the first 100
/// characters of the body
pub fn category_color(title: &str, body: &str) -> u32 {
    let title = title.to_lowercase();
    let opening: String = body.chars().take(100).collect::<String>().to_lowercase();

    CATEGORY_COLORS
        .iter()
        .find(|(category, _)| title.contains(category) || opening.contains(category))
        .map(|(_, color)| *color)
        .unwrap_or(DEFAULT_COLOR)
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

/// Map a non-success webhook response to a platform error
pub fn map_status(status: StatusCode, body: &str) -> PlatformError {
    let message = format!("Discord webhook error {}: {}", status.as_u16(), body);
    match status.as_u16() {
        401 | 403 | 404 => PlatformError::Authentication(message),
        400 | 413 | 422 => PlatformError::Validation(message),
        429 => PlatformError::RateLimit(message),
        500..=599 => PlatformError::Network(message),
        _ => PlatformError::Posting(message),
    }
}

pub struct DiscordWebhook {
    /// `None` in dry-run mode
    client: Option<Client>,
    webhook_url: String,
    sent: AtomicUsize,
}

impl DiscordWebhook {
    /// Live webhook client
    ///
    /// # Errors
    ///
    /// Returns `PlatformError::Network` if the HTTP client cannot be built.
    pub fn new(webhook_url: impl Into<String>) -> Result<Self, PlatformError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .connect_timeout(Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS))
            .build()
            .map_err(|e| PlatformError::Network(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client: Some(client),
            webhook_url: webhook_url.into(),
            sent: AtomicUsize::new(0),
        })
    }

    /// Client that builds embeds without sending them
    pub fn dry_run(webhook_url: impl Into<String>) -> Self {
        Self {
            client: None,
            webhook_url: webhook_url.into(),
            sent: AtomicUsize::new(0),
        }
    }

    pub fn is_live(&self) -> bool {
        self.client.is_some()
    }

    /// Messages sent (or simulated) so far
    pub fn messages_sent(&self) -> usize {
        self.sent.load(Ordering::SeqCst)
    }

    async fn send(
        &self,
        client: &Client,
        embed: &DiscordEmbed,
    ) -> Result<WebhookMessage, PlatformError> {
        let payload = WebhookPayload { embeds: [embed] };

        let response = client
            .post(&self.webhook_url)
            .query(&[("wait", "true")])
            .json(&payload)
            .send()
            .await
            .map_err(|e| PlatformError::Network(format!("Discord connection error: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = %status, "Discord webhook rejected message");
            return Err(map_status(status, &body));
        }

        response.json::<WebhookMessage>().await.map_err(|e| {
            PlatformError::Posting(format!("Discord returned an unreadable response: {}", e))
        })
    }
}

#[async_trait]
impl Platform for DiscordWebhook {
    async fn publish(&self, item: &ContentItem) -> Result<PublishReceipt, PlatformError> {
        let embed = DiscordEmbed::for_item(item);
        if embed.title.trim().is_empty() {
            return Err(PlatformError::Validation(
                "Discord embed title cannot be empty".to_string(),
            ));
        }

        let Some(client) = &self.client else {
            let n = self.sent.fetch_add(1, Ordering::SeqCst) + 1;
            debug!(color = embed.color, "simulated Discord embed");
            return Ok(PublishReceipt::new(n.to_string(), None));
        };

        let message = self.send(client, &embed).await?;
        self.sent.fetch_add(1, Ordering::SeqCst);

        let url = match (&message.guild_id, &message.channel_id) {
            (Some(guild), Some(channel)) => Some(format!(
                "https://discord.com/channels/{}/{}/{}",
                guild, channel, message.id
            )),
            _ => None,
        };
        Ok(PublishReceipt::new(message.id, url))
    }

    fn name(&self) -> &str {
        "discord"
    }
}
