//! Mastodon platform implementation
//!
//! Publishes through the megalodon library, so any instance implementing the
//! Mastodon API works (Mastodon, Pleroma, GoToSocial, Akkoma).
//!
//! Posts are rendered as title, body and canonical link. Text longer than the
//! instance limit becomes a reply thread. A thread is published as one unit
//! from the dispatcher's point of view: if a chunk fails, the chunks already
//! posted for that content id are remembered and the next attempt continues
//! the thread from where it stopped.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use megalodon::entities::StatusVisibility;
use megalodon::megalodon::{PostStatusInputOptions, PostStatusOutput};
use megalodon::{Megalodon, SNS};
use tracing::{debug, info};

use crate::config::MastodonConfig;
use crate::error::PlatformError;
use crate::platforms::{compose_text, Platform, PublishReceipt};
use crate::types::ContentItem;

pub const DEFAULT_CHAR_LIMIT: usize = 500;

#[derive(Debug, Clone)]
struct PostedChunk {
    id: String,
    url: Option<String>,
}

/// Mastodon platform client
pub struct MastodonClient {
    /// `None` in dry-run mode
    client: Option<Box<dyn Megalodon + Send + Sync>>,

    /// The instance URL (e.g., "https://mastodon.social")
    instance_url: String,

    visibility: String,

    /// Character limit per status
    character_limit: usize,

    /// Chunks already posted for threads that have not finished
    threads: Mutex<HashMap<String, Vec<PostedChunk>>>,

    /// Dry-run statuses in posting order, as the id each one replied to
    simulated: Mutex<Vec<Option<String>>>,

    /// Dry-run status number that fails once with a network error
    fail_at: Mutex<Option<usize>>,
}

impl MastodonClient {
    /// Create a live client
    ///
    /// # Errors
    ///
    /// Returns `PlatformError::Authentication` if megalodon rejects the
    /// instance URL or token.
    pub fn new(instance_url: &str, access_token: &str) -> Result<Self, PlatformError> {
        let instance_url = normalize_instance_url(instance_url);
        let client = megalodon::generator(
            SNS::Mastodon,
            instance_url.clone(),
            Some(access_token.to_string()),
            None,
        )
        .map_err(|e| {
            PlatformError::Authentication(format!("Failed to create Mastodon client: {:?}", e))
        })?;

        Ok(Self::build(Some(client), instance_url))
    }

    /// Client that renders and splits posts without contacting the instance
    pub fn dry_run(instance_url: &str) -> Self {
        Self::build(None, normalize_instance_url(instance_url))
    }

    /// Create a client from configuration
    ///
    /// Live mode requires a non-empty access token.
    pub fn from_config(config: &MastodonConfig, live: bool) -> Result<Self, PlatformError> {
        let client = if live {
            let token = config.access_token.as_deref().unwrap_or("").trim();
            if token.is_empty() {
                return Err(PlatformError::Authentication(
                    "Mastodon access token is not configured".to_string(),
                ));
            }
            Self::new(&config.instance_url, token)?
        } else {
            Self::dry_run(&config.instance_url)
        };

        Ok(client
            .with_visibility(&config.visibility)
            .with_character_limit(config.max_chars))
    }

    fn build(client: Option<Box<dyn Megalodon + Send + Sync>>, instance_url: String) -> Self {
        Self {
            client,
            instance_url,
            visibility: "public".to_string(),
            character_limit: DEFAULT_CHAR_LIMIT,
            threads: Mutex::new(HashMap::new()),
            simulated: Mutex::new(Vec::new()),
            fail_at: Mutex::new(None),
        }
    }

    pub fn with_visibility(mut self, visibility: &str) -> Self {
        self.visibility = visibility.to_string();
        self
    }

    pub fn with_character_limit(mut self, limit: usize) -> Self {
        self.character_limit = limit.max(1);
        self
    }

    pub fn is_live(&self) -> bool {
        self.client.is_some()
    }

    pub fn instance_url(&self) -> &str {
        &self.instance_url
    }

    /// Adopt the instance's own character limit
    ///
    /// No-op in dry-run mode. On error the current limit is kept.
    pub async fn fetch_instance_info(&mut self) -> Result<(), PlatformError> {
        let Some(client) = &self.client else {
            return Ok(());
        };

        let response = client
            .get_instance()
            .await
            .map_err(|e| map_megalodon_error(e, "fetch instance info"))?;

        let limit = response.json.configuration.statuses.max_characters as usize;
        debug!(instance = %self.instance_url, limit, "instance character limit");
        self.character_limit = limit.max(1);
        Ok(())
    }

    /// Make the `n`th simulated status (1-based) fail once
    #[cfg(test)]
    fn fail_simulated_status(self, n: usize) -> Self {
        *self.fail_at.lock().unwrap() = Some(n);
        self
    }

    /// Number of chunks already posted for an unfinished thread
    pub fn pending_thread_len(&self, content_id: &str) -> usize {
        self.lock_threads()
            .get(content_id)
            .map(|chunks| chunks.len())
            .unwrap_or(0)
    }

    async fn post_chunk(
        &self,
        text: &str,
        in_reply_to: Option<&str>,
    ) -> Result<PostedChunk, PlatformError> {
        let Some(client) = &self.client else {
            let n = {
                let mut sent = self.simulated.lock().unwrap_or_else(|e| e.into_inner());
                let mut fail_at = self.fail_at.lock().unwrap_or_else(|e| e.into_inner());
                if *fail_at == Some(sent.len() + 1) {
                    *fail_at = None;
                    return Err(PlatformError::Network("simulated instance outage".to_string()));
                }
                sent.push(in_reply_to.map(str::to_string));
                sent.len()
            };
            return Ok(PostedChunk {
                id: format!("toot-{:06}", n),
                url: Some(format!("{}/@user/{}", self.instance_url, n)),
            });
        };

        let options = PostStatusInputOptions {
            in_reply_to_id: in_reply_to.map(str::to_string),
            visibility: parse_visibility(&self.visibility),
            ..Default::default()
        };

        let response = client
            .post_status(text.to_string(), Some(&options))
            .await
            .map_err(|e| map_megalodon_error(e, "post status"))?;

        match response.json {
            PostStatusOutput::Status(status) => Ok(PostedChunk {
                id: status.id,
                url: status.url,
            }),
            PostStatusOutput::ScheduledStatus(scheduled) => Ok(PostedChunk {
                id: scheduled.id,
                url: None,
            }),
        }
    }

    fn lock_threads(&self) -> MutexGuard<'_, HashMap<String, Vec<PostedChunk>>> {
        self.threads.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Platform for MastodonClient {
    async fn publish(&self, item: &ContentItem) -> Result<PublishReceipt, PlatformError> {
        let text = compose_text(item);
        if text.trim().is_empty() {
            return Err(PlatformError::Validation(
                "Content cannot be empty".to_string(),
            ));
        }

        let chunks = split_for_thread(&text, self.character_limit);
        let mut posted = self.lock_threads().remove(&item.id).unwrap_or_default();
        if !posted.is_empty() {
            info!(
                content_id = %item.id,
                posted = posted.len(),
                total = chunks.len(),
                "resuming Mastodon thread"
            );
        }

        for chunk in chunks.iter().skip(posted.len()) {
            let reply_to = posted.last().map(|c| c.id.clone());
            match self.post_chunk(chunk, reply_to.as_deref()).await {
                Ok(done) => posted.push(done),
                Err(e) => {
                    self.lock_threads().insert(item.id.clone(), posted);
                    return Err(e);
                }
            }
        }

        debug!(content_id = %item.id, statuses = posted.len(), "Mastodon publish complete");

        let first = posted.into_iter().next().ok_or_else(|| {
            PlatformError::Posting("Mastodon thread produced no statuses".to_string())
        })?;
        Ok(PublishReceipt::new(first.id, first.url))
    }

    fn name(&self) -> &str {
        "mastodon"
    }

    fn character_limit(&self) -> Option<usize> {
        Some(self.character_limit)
    }
}

fn normalize_instance_url(instance: &str) -> String {
    let trimmed = instance.trim().trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("https://{}", trimmed)
    }
}

fn parse_visibility(visibility: &str) -> Option<StatusVisibility> {
    match visibility.to_lowercase().as_str() {
        "public" => Some(StatusVisibility::Public),
        "unlisted" => Some(StatusVisibility::Unlisted),
        "private" => Some(StatusVisibility::Private),
        "direct" => Some(StatusVisibility::Direct),
        _ => None,
    }
}

/// Split text into chunks of at most `limit` characters
///
/// Breaks on whitespace where possible; a single word longer than the limit
/// is cut at the limit.
pub fn split_for_thread(text: &str, limit: usize) -> Vec<String> {
    let limit = limit.max(1);
    if text.chars().count() <= limit {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    for word in text.split_whitespace() {
        let mut word: Vec<char> = word.chars().collect();

        while word.len() > limit {
            if current_len > 0 {
                chunks.push(std::mem::take(&mut current));
                current_len = 0;
            }
            let rest = word.split_off(limit);
            chunks.push(word.into_iter().collect());
            word = rest;
        }
        if word.is_empty() {
            continue;
        }

        let needed = if current_len == 0 { word.len() } else { word.len() + 1 };
        if current_len + needed > limit {
            chunks.push(std::mem::take(&mut current));
            current_len = 0;
        }
        if current_len > 0 {
            current.push(' ');
            current_len += 1;
        }
        current.extend(word.iter());
        current_len += word.len();
    }

    if current_len > 0 {
        chunks.push(current);
    }
    chunks
}

/// Map megalodon errors to PlatformError
///
/// - HTTP 401/403 → `Authentication`
/// - HTTP 422 → `Validation`
/// - HTTP 429 → `RateLimit`
/// - HTTP 5xx and connection failures → `Network`
/// - Response parse failures → `Posting`
fn map_megalodon_error(error: megalodon::error::Error, context: &str) -> PlatformError {
    classify_error(&error.to_string(), context)
}

fn classify_error(error_str: &str, context: &str) -> PlatformError {
    let error_lower = error_str.to_lowercase();

    match extract_http_status(error_str) {
        Some(401) | Some(403) => PlatformError::Authentication(format!(
            "Mastodon authentication failed ({}): {}. \
                    Suggestion: Verify your access token is valid and has not been revoked.",
            context, error_str
        )),
        Some(422) => PlatformError::Validation(format!(
            "Mastodon validation failed ({}): {}",
            context, error_str
        )),
        Some(429) => PlatformError::RateLimit(format!(
            "Mastodon rate limit exceeded ({}): {}",
            context, error_str
        )),
        Some(500..=599) => PlatformError::Network(format!(
            "Mastodon server error ({}): {}",
            context, error_str
        )),
        Some(_) => PlatformError::Posting(format!(
            "Mastodon HTTP error ({}): {}",
            context, error_str
        )),
        None => {
            if error_lower.contains("unauthorized")
                || error_lower.contains("forbidden")
                || error_lower.contains("token")
            {
                PlatformError::Authentication(format!(
                    "Mastodon authentication failed ({}): {}",
                    context, error_str
                ))
            } else if error_lower.contains("parse")
                || error_lower.contains("json")
                || error_lower.contains("deserialize")
            {
                PlatformError::Posting(format!(
                    "Mastodon response parse error ({}): {}",
                    context, error_str
                ))
            } else if error_lower.contains("rate limit") || error_lower.contains("too many requests")
            {
                PlatformError::RateLimit(format!(
                    "Mastodon rate limit exceeded ({}): {}",
                    context, error_str
                ))
            } else {
                PlatformError::Network(format!(
                    "Mastodon connection error ({}): {}",
                    context, error_str
                ))
            }
        }
    }
}

/// Extract an HTTP status code from an error message
///
/// Looks for "HTTP 401", "status 403", "code: 429", or a bare three-digit
/// code followed by ':' or ' '.
fn extract_http_status(error_str: &str) -> Option<u16> {
    let prefixes = ["HTTP ", "status ", "code: ", "status_code: "];

    for prefix in &prefixes {
        if let Some(pos) = error_str.find(prefix) {
            let after_prefix = &error_str[pos + prefix.len()..];
            if let Some(code) = after_prefix.get(0..3).and_then(|s| s.parse::<u16>().ok()) {
                if (100..=599).contains(&code) {
                    return Some(code);
                }
            }
        }
    }

    let bytes = error_str.as_bytes();
    for (i, window) in bytes.windows(4).enumerate() {
        let is_code = window[..3].iter().all(u8::is_ascii_digit)
            && (window[3] == b':' || window[3] == b' ')
            && (i == 0 || !bytes[i - 1].is_ascii_digit());
        if is_code {
            if let Some(code) = std::str::from_utf8(&window[..3])
                .ok()
                .and_then(|s| s.parse::<u16>().ok())
            {
                if (100..=599).contains(&code) {
                    return Some(code);
                }
            }
        }
    }

    None
}
