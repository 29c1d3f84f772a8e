//! Ghost Admin API publishing
//!
//! Creates a post through `/ghost/api/admin/posts/?source=html`. Requests are
//! authenticated with a short-lived HS256 token signed with the admin API key,
//! which Ghost issues as `{id}:{hex secret}`.

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::Sha256;
use tracing::{debug, warn};

use crate::config::GhostConfig;
use crate::error::PlatformError;
use crate::platforms::{Platform, PublishReceipt};
use crate::types::ContentItem;

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
const TOKEN_LIFETIME_SECS: i64 = 300;

type HmacSha256 = Hmac<Sha256>;

/// Admin API key split into its key id and decoded signing secret
#[derive(Clone)]
pub struct AdminKey {
    id: String,
    secret: Vec<u8>,
}

impl AdminKey {
    /// Parse a `{id}:{hex secret}` admin API key
    ///
    /// # Errors
    ///
    /// Returns `PlatformError::Authentication` for a malformed key.
    pub fn parse(key: &str) -> Result<Self, PlatformError> {
        let (id, secret) = key.trim().split_once(':').ok_or_else(|| {
            PlatformError::Authentication(
                "Ghost admin API key must be in {id}:{secret} format".to_string(),
            )
        })?;
        if id.is_empty() || secret.contains(':') {
            return Err(PlatformError::Authentication(
                "Ghost admin API key must be in {id}:{secret} format".to_string(),
            ));
        }
        let secret = hex::decode(secret).map_err(|e| {
            PlatformError::Authentication(format!("Ghost admin API secret is not hex: {}", e))
        })?;

        Ok(Self {
            id: id.to_string(),
            secret,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Signed token valid for five minutes from `issued_at` (unix seconds)
    pub fn token(&self, issued_at: i64) -> Result<String, PlatformError> {
        let header = json!({ "alg": "HS256", "typ": "JWT", "kid": self.id });
        let claims = json!({
            "iat": issued_at,
            "exp": issued_at + TOKEN_LIFETIME_SECS,
            "aud": "/admin/",
        });

        let signing_input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(header.to_string()),
            URL_SAFE_NO_PAD.encode(claims.to_string())
        );

        let mut mac = HmacSha256::new_from_slice(&self.secret).map_err(|e| {
            PlatformError::Authentication(format!("Unusable Ghost signing key: {}", e))
        })?;
        mac.update(signing_input.as_bytes());
        let signature = mac.finalize().into_bytes();

        Ok(format!("{}.{}", signing_input, URL_SAFE_NO_PAD.encode(signature)))
    }
}

impl std::fmt::Debug for AdminKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminKey")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Serialize)]
struct GhostPost<'a> {
    title: &'a str,
    html: String,
    status: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    canonical_url: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct CreatePostRequest<'a> {
    posts: [GhostPost<'a>; 1],
}

#[derive(Debug, Deserialize)]
struct CreatedPost {
    id: String,
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreatePostResponse {
    posts: Vec<CreatedPost>,
}

pub struct GhostClient {
    client: Client,
    api_url: String,
    key: AdminKey,
    status: String,
}

impl GhostClient {
    /// Create a client for the site at `api_url`
    ///
    /// # Errors
    ///
    /// Returns `PlatformError::Network` if the HTTP client cannot be built.
    pub fn new(api_url: &str, key: AdminKey) -> Result<Self, PlatformError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .connect_timeout(Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS))
            .build()
            .map_err(|e| PlatformError::Network(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_url: api_url.trim().trim_end_matches('/').to_string(),
            key,
            status: "draft".to_string(),
        })
    }

    /// Create a client from configuration
    ///
    /// # Errors
    ///
    /// Returns `PlatformError::Authentication` if the admin key is missing or
    /// malformed.
    pub fn from_config(config: &GhostConfig) -> Result<Self, PlatformError> {
        let key = config.admin_api_key.as_deref().unwrap_or("").trim();
        if key.is_empty() {
            return Err(PlatformError::Authentication(
                "Ghost admin API key is not configured".to_string(),
            ));
        }

        Ok(Self::new(&config.api_url, AdminKey::parse(key)?)?.with_status(&config.post_status))
    }

    /// Ghost post status to create (`draft` or `published`)
    pub fn with_status(mut self, status: &str) -> Self {
        self.status = status.to_string();
        self
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    fn posts_url(&self) -> String {
        format!("{}/ghost/api/admin/posts/", self.api_url)
    }
}

#[async_trait]
impl Platform for GhostClient {
    async fn publish(&self, item: &ContentItem) -> Result<PublishReceipt, PlatformError> {
        let title = item.title.trim();
        if title.is_empty() {
            return Err(PlatformError::Validation(
                "Ghost post title cannot be empty".to_string(),
            ));
        }

        let canonical = item.canonical_url.trim();
        let request = CreatePostRequest {
            posts: [GhostPost {
                title,
                html: render_html(&item.body, canonical),
                status: &self.status,
                canonical_url: (!canonical.is_empty()).then_some(canonical),
            }],
        };
        let token = self.key.token(chrono::Utc::now().timestamp())?;

        let response = self
            .client
            .post(self.posts_url())
            .query(&[("source", "html")])
            .header("Authorization", format!("Ghost {}", token))
            .json(&request)
            .send()
            .await
            .map_err(|e| PlatformError::Network(format!("Ghost connection error: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = %status, "Ghost rejected post");
            return Err(map_status(status, &body));
        }

        let created = response
            .json::<CreatePostResponse>()
            .await
            .map_err(|e| {
                PlatformError::Posting(format!("Ghost returned an unreadable response: {}", e))
            })?
            .posts
            .into_iter()
            .next()
            .ok_or_else(|| PlatformError::Posting("Ghost returned no post".to_string()))?;

        debug!(id = %created.id, status = %self.status, "created Ghost post");
        Ok(PublishReceipt::new(created.id, created.url))
    }

    fn name(&self) -> &str {
        "ghost"
    }
}

/// Body paragraphs as escaped HTML, followed by a link to the canonical post
pub fn render_html(body: &str, canonical_url: &str) -> String {
    let mut parts: Vec<String> = body
        .split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| format!("<p>{}</p>", escape_html(p)))
        .collect();

    if !canonical_url.is_empty() {
        parts.push(format!(
            "<p><a href=\"{}\">Read the full post</a></p>",
            escape_html(canonical_url)
        ));
    }
    parts.join("\n")
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

/// Map a non-success Admin API response to a platform error
pub fn map_status(status: StatusCode, body: &str) -> PlatformError {
    let message = format!("Ghost API error {}: {}", status.as_u16(), body);
    match status.as_u16() {
        401 | 403 => PlatformError::Authentication(message),
        400 | 413 | 422 => PlatformError::Validation(message),
        429 => PlatformError::RateLimit(message),
        500..=599 => PlatformError::Network(message),
        _ => PlatformError::Posting(message),
    }
}
