//! Bluesky platform implementation
//!
//! Talks XRPC to the account's PDS: `com.atproto.server.createSession` with
//! the handle and an app password, then `com.atproto.repo.createRecord` for an
//! `app.bsky.feed.post`. The session is created on first publish and dropped
//! when the PDS rejects its token, so the next attempt logs in again.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::BlueskyConfig;
use crate::error::PlatformError;
use crate::platforms::{check_length, compose_text, Platform, PublishReceipt};
use crate::types::ContentItem;

pub const DEFAULT_SERVICE_URL: &str = "https://bsky.social";
pub const DEFAULT_CHAR_LIMIT: usize = 300;

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
const POST_COLLECTION: &str = "app.bsky.feed.post";

#[derive(Debug, Serialize)]
struct CreateSessionRequest<'a> {
    identifier: &'a str,
    password: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Session {
    did: String,
    access_jwt: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PostRecord<'a> {
    #[serde(rename = "$type")]
    record_type: &'static str,
    text: &'a str,
    created_at: String,
}

#[derive(Debug, Serialize)]
struct CreateRecordRequest<'a> {
    repo: &'a str,
    collection: &'static str,
    record: PostRecord<'a>,
}

#[derive(Debug, Deserialize)]
struct CreateRecordResponse {
    uri: String,
}

pub struct BlueskyClient {
    client: Client,
    service_url: String,
    handle: String,
    app_password: String,
    character_limit: usize,
    session: Mutex<Option<Session>>,
}

impl BlueskyClient {
    /// Create a client for `handle` on the PDS at `service_url`
    ///
    /// # Errors
    ///
    /// Returns `PlatformError::Network` if the HTTP client cannot be built.
    pub fn new(
        service_url: &str,
        handle: impl Into<String>,
        app_password: impl Into<String>,
    ) -> Result<Self, PlatformError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .connect_timeout(Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS))
            .build()
            .map_err(|e| PlatformError::Network(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            service_url: service_url.trim().trim_end_matches('/').to_string(),
            handle: handle.into(),
            app_password: app_password.into(),
            character_limit: DEFAULT_CHAR_LIMIT,
            session: Mutex::new(None),
        })
    }

    /// Create a client from configuration
    ///
    /// # Errors
    ///
    /// Returns `PlatformError::Authentication` if the app password is missing.
    pub fn from_config(config: &BlueskyConfig) -> Result<Self, PlatformError> {
        let password = config.app_password.as_deref().unwrap_or("").trim();
        if password.is_empty() {
            return Err(PlatformError::Authentication(
                "Bluesky app password is not configured".to_string(),
            ));
        }

        Ok(Self::new(&config.service_url, config.handle.trim(), password)?
            .with_character_limit(config.max_chars))
    }

    pub fn with_character_limit(mut self, limit: usize) -> Self {
        self.character_limit = limit.max(1);
        self
    }

    pub fn handle(&self) -> &str {
        &self.handle
    }

    fn xrpc_url(&self, method: &str) -> String {
        format!("{}/xrpc/{}", self.service_url, method)
    }

    async fn create_session(&self) -> Result<Session, PlatformError> {
        debug!(handle = %self.handle, "creating Bluesky session");

        let response = self
            .client
            .post(self.xrpc_url("com.atproto.server.createSession"))
            .json(&CreateSessionRequest {
                identifier: &self.handle,
                password: &self.app_password,
            })
            .send()
            .await
            .map_err(|e| PlatformError::Network(format!("Bluesky connection error: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(match map_status(status, &body) {
                // A rejected login is a credential problem, whatever the status
                PlatformError::Validation(message) => PlatformError::Authentication(message),
                other => other,
            });
        }

        response.json::<Session>().await.map_err(|e| {
            PlatformError::Authentication(format!("Bluesky returned an unreadable session: {}", e))
        })
    }

    async fn create_record(
        &self,
        session: &Session,
        text: &str,
    ) -> Result<CreateRecordResponse, PlatformError> {
        let request = CreateRecordRequest {
            repo: &session.did,
            collection: POST_COLLECTION,
            record: PostRecord {
                record_type: POST_COLLECTION,
                text,
                created_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            },
        };

        let response = self
            .client
            .post(self.xrpc_url("com.atproto.repo.createRecord"))
            .bearer_auth(&session.access_jwt)
            .json(&request)
            .send()
            .await
            .map_err(|e| PlatformError::Network(format!("Bluesky connection error: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = %status, "Bluesky rejected post");
            return Err(map_status(status, &body));
        }

        response.json::<CreateRecordResponse>().await.map_err(|e| {
            PlatformError::Posting(format!("Bluesky returned an unreadable response: {}", e))
        })
    }
}

#[async_trait]
impl Platform for BlueskyClient {
    async fn publish(&self, item: &ContentItem) -> Result<PublishReceipt, PlatformError> {
        let text = compose_text(item);
        check_length("bluesky", &text, self.character_limit)?;

        // Held across the request so concurrent publishes share one login
        let mut session = self.session.lock().await;
        let current = match session.as_ref() {
            Some(current) => current.clone(),
            None => {
                let created = self.create_session().await?;
                *session = Some(created.clone());
                created
            }
        };

        match self.create_record(&current, &text).await {
            Ok(created) => {
                let url = web_url(&created.uri);
                debug!(uri = %created.uri, "posted to Bluesky");
                Ok(PublishReceipt::new(created.uri, url))
            }
            Err(e) => {
                if matches!(e, PlatformError::Authentication(_)) {
                    *session = None;
                }
                Err(e)
            }
        }
    }

    fn name(&self) -> &str {
        "bluesky"
    }

    fn character_limit(&self) -> Option<usize> {
        Some(self.character_limit)
    }
}

/// `https://bsky.app` link for an `at://{did}/app.bsky.feed.post/{rkey}` URI
pub fn web_url(at_uri: &str) -> Option<String> {
    let path = at_uri.strip_prefix("at://")?;
    let mut parts = path.split('/');
    let (did, collection, rkey) = (parts.next()?, parts.next()?, parts.next()?);
    if collection != POST_COLLECTION || did.is_empty() || rkey.is_empty() {
        return None;
    }
    Some(format!("https://bsky.app/profile/{}/post/{}", did, rkey))
}

/// Map a non-success XRPC response to a platform error
///
/// The PDS answers 400 for both bad records and expired tokens; the latter
/// carry an `ExpiredToken` or `InvalidToken` error code in the body.
pub fn map_status(status: StatusCode, body: &str) -> PlatformError {
    let message = format!("Bluesky API error {}: {}", status.as_u16(), body);
    if body.contains("ExpiredToken") || body.contains("InvalidToken") {
        return PlatformError::Authentication(message);
    }
    match status.as_u16() {
        401 | 403 => PlatformError::Authentication(message),
        400 | 413 | 422 => PlatformError::Validation(message),
        429 => PlatformError::RateLimit(message),
        500..=599 => PlatformError::Network(message),
        _ => PlatformError::Posting(message),
    }
}
