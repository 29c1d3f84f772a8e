//! Configuration management for Posse
//!
//! Configuration is read from a YAML file (or TOML, chosen by a `.toml`
//! extension), then overridden by `POSSE_`-prefixed environment variables.
//! Every section is optional; a missing file yields the defaults.
//!
//! ```yaml
//! live_mode: false
//! delivery_log_path: ~/.local/share/posse/delivery_log.json
//! max_records: 10000
//! defaults:
//!   platforms: [mastodon, discord]
//! mastodon:
//!   instance_url: https://mastodon.social
//!   access_token: "..."
//!   visibility: unlisted
//! discord:
//!   webhook_url: https://discord.com/api/webhooks/...
//! resilience:
//!   retry: { max_attempts: 3, base_delay_secs: 1.0, max_delay_secs: 30.0 }
//!   circuit_breaker: { failure_threshold: 5, reset_timeout_secs: 60.0 }
//!   rate_limit: { tokens_per_second: 1.0, max_tokens: 10.0 }
//!   platform_rate_limits:
//!     mastodon: { tokens_per_second: 0.5, max_tokens: 5.0 }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::error::{ConfigError, PlatformErrorKind, Result};
use crate::rate_limiter::RateLimiterConfig;
use crate::retry::RetryConfig;

/// Prefix for environment overrides
pub const ENV_PREFIX: &str = "POSSE_";

/// Longest delay, reset timeout or refill time accepted from config (one year)
pub const MAX_DURATION_SECS: f64 = 31_536_000.0;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Call real platform APIs; otherwise every platform is simulated
    pub live_mode: bool,
    /// Ledger file; defaults to the data directory
    pub delivery_log_path: Option<String>,
    /// Maximum retained ledger records
    pub max_records: Option<usize>,
    pub defaults: DefaultsConfig,
    pub mastodon: Option<MastodonConfig>,
    pub discord: Option<DiscordConfig>,
    pub bluesky: Option<BlueskyConfig>,
    pub ghost: Option<GhostConfig>,
    pub resilience: ResilienceConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DefaultsConfig {
    pub platforms: Vec<String>,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            platforms: vec!["mastodon".to_string(), "discord".to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MastodonConfig {
    pub instance_url: String,
    pub access_token: Option<String>,
    pub visibility: String,
    pub max_chars: usize,
}

impl Default for MastodonConfig {
    fn default() -> Self {
        Self {
            instance_url: String::new(),
            access_token: None,
            visibility: "public".to_string(),
            max_chars: 500,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscordConfig {
    pub webhook_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlueskyConfig {
    pub handle: String,
    pub app_password: Option<String>,
    /// PDS hosting the account
    pub service_url: String,
    pub max_chars: usize,
}

impl Default for BlueskyConfig {
    fn default() -> Self {
        Self {
            handle: String::new(),
            app_password: None,
            service_url: "https://bsky.social".to_string(),
            max_chars: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GhostConfig {
    pub api_url: String,
    /// Admin API key as `{id}:{hex secret}`
    pub admin_api_key: Option<String>,
    /// `draft` or `published`
    pub post_status: String,
}

impl Default for GhostConfig {
    fn default() -> Self {
        Self {
            api_url: String::new(),
            admin_api_key: None,
            post_status: "draft".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    pub retry: RetrySettings,
    pub circuit_breaker: CircuitBreakerSettings,
    pub rate_limit: RateLimitSettings,
    /// Per-platform limiters used instead of the shared one
    pub platform_rate_limits: BTreeMap<String, RateLimitSettings>,
    /// Dispatch platforms concurrently
    pub concurrent: bool,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            retry: RetrySettings::default(),
            circuit_breaker: CircuitBreakerSettings::default(),
            rate_limit: RateLimitSettings::default(),
            platform_rate_limits: BTreeMap::new(),
            concurrent: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_secs: f64,
    pub max_delay_secs: f64,
    pub multiplier: f64,
    pub jitter: bool,
    pub retryable: Vec<PlatformErrorKind>,
}

impl Default for RetrySettings {
    fn default() -> Self {
        let defaults = RetryConfig::default();
        Self {
            max_attempts: defaults.max_attempts,
            base_delay_secs: defaults.base_delay.as_secs_f64(),
            max_delay_secs: defaults.max_delay.as_secs_f64(),
            multiplier: defaults.multiplier,
            jitter: defaults.jitter,
            retryable: defaults.retryable,
        }
    }
}

impl RetrySettings {
    /// Out-of-range delays are clamped; [`Config::validate`] rejects them first
    pub fn to_retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts,
            base_delay: secs_to_duration(self.base_delay_secs),
            max_delay: secs_to_duration(self.max_delay_secs),
            multiplier: self.multiplier,
            jitter: self.jitter,
            retryable: self.retryable.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    pub failure_threshold: u32,
    pub reset_timeout_secs: f64,
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        let defaults = CircuitBreakerConfig::default();
        Self {
            failure_threshold: defaults.failure_threshold,
            reset_timeout_secs: defaults.reset_timeout.as_secs_f64(),
            half_open_max_calls: defaults.half_open_max_calls,
        }
    }
}

impl CircuitBreakerSettings {
    pub fn to_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            reset_timeout: secs_to_duration(self.reset_timeout_secs),
            half_open_max_calls: self.half_open_max_calls,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    pub tokens_per_second: f64,
    pub max_tokens: f64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        let defaults = RateLimiterConfig::default();
        Self {
            tokens_per_second: defaults.tokens_per_second,
            max_tokens: defaults.max_tokens,
        }
    }
}

impl RateLimitSettings {
    pub fn to_limiter_config(&self) -> RateLimiterConfig {
        RateLimiterConfig {
            tokens_per_second: self.tokens_per_second,
            max_tokens: self.max_tokens,
            initial_tokens: None,
        }
    }
}

impl Config {
    /// Load configuration from `explicit`, `POSSE_CONFIG`, or the default location
    ///
    /// Environment overrides are applied and the result is validated.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = match explicit {
            Some(path) => expand_path(&path.to_string_lossy()),
            None => resolve_config_path()?,
        };

        let mut config = if path.exists() {
            Self::load_from_path(&path)?
        } else {
            if explicit.is_some() {
                warn!(path = %path.display(), "config file not found, using defaults");
            } else {
                debug!(path = %path.display(), "no config file, using defaults");
            }
            Self::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parse a configuration file without applying overrides
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        let is_toml = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
        Self::parse(&content, is_toml)
    }

    fn parse(content: &str, is_toml: bool) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let config = if is_toml {
            toml::from_str(content).map_err(ConfigError::TomlError)?
        } else {
            serde_yaml::from_str(content).map_err(ConfigError::YamlError)?
        };
        Ok(config)
    }

    /// Apply `POSSE_*` overrides from the process environment
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides from any key lookup
    ///
    /// Keys are looked up with the `POSSE_` prefix. Setting a credential for a
    /// platform without a section creates the section.
    pub fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |suffix: &str| lookup(&format!("{}{}", ENV_PREFIX, suffix));

        if let Some(v) = get("MASTODON_INSTANCE_URL") {
            self.mastodon.get_or_insert_with(Default::default).instance_url = v;
        }
        if let Some(v) = get("MASTODON_ACCESS_TOKEN") {
            self.mastodon.get_or_insert_with(Default::default).access_token = Some(v);
        }
        if let Some(v) = get("DISCORD_WEBHOOK_URL") {
            self.discord.get_or_insert_with(Default::default).webhook_url = v;
        }
        if let Some(v) = get("BLUESKY_HANDLE") {
            self.bluesky.get_or_insert_with(Default::default).handle = v;
        }
        if let Some(v) = get("BLUESKY_APP_PASSWORD") {
            self.bluesky.get_or_insert_with(Default::default).app_password = Some(v);
        }
        if let Some(v) = get("BLUESKY_SERVICE_URL") {
            self.bluesky.get_or_insert_with(Default::default).service_url = v;
        }
        if let Some(v) = get("GHOST_API_URL") {
            self.ghost.get_or_insert_with(Default::default).api_url = v;
        }
        if let Some(v) = get("GHOST_ADMIN_API_KEY") {
            self.ghost.get_or_insert_with(Default::default).admin_api_key = Some(v);
        }
        if let Some(v) = get("DELIVERY_LOG_PATH") {
            self.delivery_log_path = Some(v);
        }
        if let Some(v) = get("LIVE_MODE") {
            self.live_mode = is_truthy(&v);
        }
    }

    /// Reject values the resilience components cannot run with
    pub fn validate(&self) -> Result<()> {
        let r = &self.resilience;

        if r.retry.max_attempts == 0 {
            return Err(invalid("resilience.retry.max_attempts", "must be at least 1"));
        }
        check_non_negative("resilience.retry.base_delay_secs", r.retry.base_delay_secs)?;
        check_non_negative("resilience.retry.max_delay_secs", r.retry.max_delay_secs)?;
        if !(r.retry.multiplier >= 1.0) || !r.retry.multiplier.is_finite() {
            return Err(invalid(
                "resilience.retry.multiplier",
                &format!("must be at least 1.0 (got {})", r.retry.multiplier),
            ));
        }

        if r.circuit_breaker.failure_threshold == 0 {
            return Err(invalid(
                "resilience.circuit_breaker.failure_threshold",
                "must be at least 1",
            ));
        }
        if r.circuit_breaker.half_open_max_calls == 0 {
            return Err(invalid(
                "resilience.circuit_breaker.half_open_max_calls",
                "must be at least 1",
            ));
        }
        check_non_negative(
            "resilience.circuit_breaker.reset_timeout_secs",
            r.circuit_breaker.reset_timeout_secs,
        )?;

        check_rate_limit("resilience.rate_limit", &r.rate_limit)?;
        for (platform, limit) in &r.platform_rate_limits {
            check_rate_limit(&format!("resilience.platform_rate_limits.{}", platform), limit)?;
        }

        if self.max_records == Some(0) {
            return Err(invalid("max_records", "must be at least 1"));
        }

        if let Some(ghost) = &self.ghost {
            if !matches!(ghost.post_status.as_str(), "draft" | "published") {
                return Err(invalid(
                    "ghost.post_status",
                    &format!("must be draft or published (got {})", ghost.post_status),
                ));
            }
        }

        Ok(())
    }

    /// Ledger location with `~` expanded
    pub fn delivery_log_path(&self) -> PathBuf {
        match &self.delivery_log_path {
            Some(path) => expand_path(path),
            None => resolve_data_path()
                .map(|dir| dir.join("delivery_log.json"))
                .unwrap_or_else(|_| PathBuf::from("delivery_log.json")),
        }
    }
}

fn invalid(field: &str, reason: &str) -> crate::error::PosseError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        reason: reason.to_string(),
    }
    .into()
}

fn check_non_negative(field: &str, value: f64) -> Result<()> {
    if !(value.is_finite() && value >= 0.0) {
        return Err(invalid(field, &format!("must be zero or greater (got {})", value)));
    }
    if value > MAX_DURATION_SECS {
        return Err(invalid(
            field,
            &format!("must be at most {} seconds (got {})", MAX_DURATION_SECS, value),
        ));
    }
    Ok(())
}

fn secs_to_duration(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs.clamp(0.0, MAX_DURATION_SECS)).unwrap_or(Duration::ZERO)
}

fn check_rate_limit(field: &str, limit: &RateLimitSettings) -> Result<()> {
    if !(limit.tokens_per_second > 0.0) || !limit.tokens_per_second.is_finite() {
        return Err(invalid(
            &format!("{}.tokens_per_second", field),
            "must be greater than zero",
        ));
    }
    if !(limit.max_tokens >= 1.0) || !limit.max_tokens.is_finite() {
        return Err(invalid(
            &format!("{}.max_tokens", field),
            "must be at least 1",
        ));
    }
    let refill_secs = limit.max_tokens / limit.tokens_per_second;
    if !(refill_secs <= MAX_DURATION_SECS) {
        return Err(invalid(
            &format!("{}.tokens_per_second", field),
            &format!(
                "refilling {} tokens would take longer than {} seconds",
                limit.max_tokens, MAX_DURATION_SECS
            ),
        ));
    }
    Ok(())
}

fn is_truthy(value: &str) -> bool {
    matches!(value.trim().to_lowercase().as_str(), "true" | "1" | "yes")
}

fn expand_path(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).to_string())
}

/// Resolve the configuration file path under the XDG config directory
pub fn resolve_config_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("POSSE_CONFIG") {
        return Ok(expand_path(&path));
    }

    let config_dir = dirs::config_dir()
        .ok_or_else(|| ConfigError::MissingField("config directory".to_string()))?;

    Ok(config_dir.join("posse").join("config.yaml"))
}

/// Resolve the data directory path under the XDG data directory
pub fn resolve_data_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
        .ok_or_else(|| ConfigError::MissingField("data directory".to_string()))?;

    Ok(data_dir.join("posse"))
}
