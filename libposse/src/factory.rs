//! Build a wired [`Dispatcher`] from [`Config`]
//!
//! In dry-run mode every known platform gets a collaborator that publishes
//! nothing: Mastodon and Discord render their real payloads without sending
//! them, Bluesky and Ghost are simulated. In live mode a platform is
//! registered once its section names an endpoint (instance URL, webhook,
//! handle or site URL); missing credentials for a named endpoint are an
//! authentication error. Unnamed platforms surface as "no client configured"
//! skips at dispatch time.
//!
//! Building a live registry asks the Mastodon instance for its character
//! limit, so the builders are async.

use std::sync::Arc;

use tracing::{info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::{Config, MastodonConfig};
use crate::dispatcher::Dispatcher;
use crate::error::Result;
use crate::ledger::DeliveryLedger;
use crate::platforms::bluesky::BlueskyClient;
use crate::platforms::discord::DiscordWebhook;
use crate::platforms::ghost::GhostClient;
use crate::platforms::mastodon::MastodonClient;
use crate::platforms::simulated::SimulatedPlatform;
use crate::platforms::PlatformRegistry;
use crate::rate_limiter::RateLimiter;

const DRY_RUN_MASTODON_INSTANCE: &str = "https://mastodon.example.com";
const DRY_RUN_DISCORD_WEBHOOK: &str = "https://discord.com/api/webhooks/dry-run";

/// Platforms the factory knows how to provide
pub const KNOWN_PLATFORMS: [&str; 4] = ["mastodon", "discord", "bluesky", "ghost"];

/// Build a dispatcher using the system clock
pub async fn build_dispatcher(config: &Config) -> Result<Dispatcher> {
    build_dispatcher_with_clock(config, Arc::new(SystemClock::new())).await
}

/// Build a dispatcher driven by `clock`
///
/// # Errors
///
/// Fails if live mode is on and a named platform lacks credentials, or if a
/// rate limit setting is invalid.
pub async fn build_dispatcher_with_clock(
    config: &Config,
    clock: Arc<dyn Clock>,
) -> Result<Dispatcher> {
    let registry = build_registry(config).await?;
    info!(
        live = config.live_mode,
        platforms = ?registry.names(),
        "platform collaborators ready"
    );

    let resilience = &config.resilience;
    let shared_limiter =
        RateLimiter::new(resilience.rate_limit.to_limiter_config(), clock.clone())?;

    let mut builder = Dispatcher::builder()
        .registry(registry)
        .with_clock(clock.clone())
        .with_retry(resilience.retry.to_retry_config())
        .with_default_circuit_breaker(resilience.circuit_breaker.to_breaker_config())
        .with_rate_limiter(Arc::new(shared_limiter))
        .with_ledger(Arc::new(open_ledger(config)));

    for (platform, settings) in &resilience.platform_rate_limits {
        let limiter = RateLimiter::new(settings.to_limiter_config(), clock.clone())?;
        builder = builder.with_platform_rate_limiter(platform.clone(), Arc::new(limiter));
    }

    if !resilience.concurrent {
        builder = builder.sequential();
    }

    Ok(builder.build())
}

/// Open the configured ledger file
pub fn open_ledger(config: &Config) -> DeliveryLedger {
    let ledger = DeliveryLedger::open(config.delivery_log_path());
    match config.max_records {
        Some(max) => ledger.with_max_records(max),
        None => ledger,
    }
}

/// Collaborators for the configured mode
pub async fn build_registry(config: &Config) -> Result<PlatformRegistry> {
    if config.live_mode {
        live_registry(config).await
    } else {
        Ok(dry_run_registry(config))
    }
}

async fn live_registry(config: &Config) -> Result<PlatformRegistry> {
    let mut registry = PlatformRegistry::new();

    if let Some(mastodon) = config
        .mastodon
        .as_ref()
        .filter(|m| !m.instance_url.trim().is_empty())
    {
        let mut client = MastodonClient::from_config(mastodon, true)?;
        if let Err(e) = client.fetch_instance_info().await {
            warn!(
                instance = %client.instance_url(),
                error = %e,
                max_chars = mastodon.max_chars,
                "could not read instance character limit, using configured max_chars"
            );
        }
        registry.register(Arc::new(client));
    }

    if let Some(discord) = config
        .discord
        .as_ref()
        .filter(|d| !d.webhook_url.trim().is_empty())
    {
        registry.register(Arc::new(DiscordWebhook::new(discord.webhook_url.trim())?));
    }

    if let Some(bluesky) = config
        .bluesky
        .as_ref()
        .filter(|b| !b.handle.trim().is_empty())
    {
        registry.register(Arc::new(BlueskyClient::from_config(bluesky)?));
    }

    if let Some(ghost) = config
        .ghost
        .as_ref()
        .filter(|g| !g.api_url.trim().is_empty())
    {
        registry.register(Arc::new(GhostClient::from_config(ghost)?));
    }

    Ok(registry)
}

fn dry_run_registry(config: &Config) -> PlatformRegistry {
    let mut registry = PlatformRegistry::new();

    let mastodon = match &config.mastodon {
        Some(m) if !m.instance_url.trim().is_empty() => m.clone(),
        Some(m) => MastodonConfig {
            instance_url: DRY_RUN_MASTODON_INSTANCE.to_string(),
            ..m.clone()
        },
        None => MastodonConfig {
            instance_url: DRY_RUN_MASTODON_INSTANCE.to_string(),
            ..MastodonConfig::default()
        },
    };
    registry.register(Arc::new(
        MastodonClient::dry_run(&mastodon.instance_url)
            .with_visibility(&mastodon.visibility)
            .with_character_limit(mastodon.max_chars),
    ));

    let webhook = config
        .discord
        .as_ref()
        .map(|d| d.webhook_url.trim())
        .filter(|url| !url.is_empty())
        .unwrap_or(DRY_RUN_DISCORD_WEBHOOK);
    registry.register(Arc::new(DiscordWebhook::dry_run(webhook)));

    let bluesky = SimulatedPlatform::for_platform("bluesky");
    let bluesky = match &config.bluesky {
        Some(b) => bluesky.with_character_limit(b.max_chars),
        None => bluesky,
    };
    registry.register(Arc::new(bluesky));

    let ghost = SimulatedPlatform::for_platform("ghost");
    let ghost = match config.ghost.as_ref().map(|g| g.api_url.trim()) {
        Some(url) if !url.is_empty() => ghost.with_base_url(url),
        _ => ghost,
    };
    registry.register(Arc::new(ghost));

    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{BlueskyConfig, DiscordConfig, GhostConfig, RateLimitSettings};
    use crate::error::{PlatformError, PosseError};
    use crate::types::SyndicationStatus;
    use tempfile::TempDir;

    fn config_in(dir: &TempDir) -> Config {
        Config {
            delivery_log_path: Some(dir.path().join("log.json").to_string_lossy().to_string()),
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn test_dry_run_registers_all_known_platforms() {
        let registry = build_registry(&Config::default()).await.unwrap();
        let mut expected: Vec<String> = KNOWN_PLATFORMS.iter().map(|s| s.to_string()).collect();
        expected.sort();
        assert_eq!(registry.names(), expected);
    }

    #[tokio::test]
    async fn test_live_mode_registers_only_configured_clients() {
        let config = Config {
            live_mode: true,
            discord: Some(DiscordConfig {
                webhook_url: "https://discord.com/api/webhooks/1/abc".to_string(),
            }),
            bluesky: Some(BlueskyConfig::default()),
            ..Config::default()
        };
        let registry = build_registry(&config).await.unwrap();
        assert_eq!(registry.names(), vec!["discord".to_string()]);
    }

    #[tokio::test]
    async fn test_live_mode_registers_bluesky_and_ghost() {
        let config = Config {
            live_mode: true,
            bluesky: Some(BlueskyConfig {
                handle: "alice.bsky.social".to_string(),
                app_password: Some("app-pass".to_string()),
                max_chars: 280,
                ..BlueskyConfig::default()
            }),
            ghost: Some(GhostConfig {
                api_url: "https://blog.example.org".to_string(),
                admin_api_key: Some("abc:0123abcd".to_string()),
                ..GhostConfig::default()
            }),
            ..Config::default()
        };
        let registry = build_registry(&config).await.unwrap();

        assert_eq!(registry.names(), vec!["bluesky".to_string(), "ghost".to_string()]);
        assert_eq!(registry.get("bluesky").unwrap().character_limit(), Some(280));
    }

    #[tokio::test]
    async fn test_live_ghost_with_malformed_key_is_rejected() {
        let config = Config {
            live_mode: true,
            ghost: Some(GhostConfig {
                api_url: "https://blog.example.org".to_string(),
                admin_api_key: Some("missing-secret".to_string()),
                ..GhostConfig::default()
            }),
            ..Config::default()
        };
        let err = build_registry(&config).await.unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[tokio::test]
    async fn test_unreachable_instance_keeps_configured_limit() {
        let config = Config {
            live_mode: true,
            mastodon: Some(MastodonConfig {
                instance_url: "http://127.0.0.1:1".to_string(),
                access_token: Some("token".to_string()),
                max_chars: 450,
                ..MastodonConfig::default()
            }),
            ..Config::default()
        };
        let registry = build_registry(&config).await.unwrap();

        assert_eq!(registry.get("mastodon").unwrap().character_limit(), Some(450));
    }

    #[tokio::test]
    async fn test_live_mastodon_without_token_is_rejected() {
        let config = Config {
            live_mode: true,
            mastodon: Some(MastodonConfig {
                instance_url: "https://mastodon.social".to_string(),
                ..MastodonConfig::default()
            }),
            ..Config::default()
        };
        let err = build_registry(&config).await.unwrap_err();
        assert!(matches!(
            err,
            PosseError::Platform(PlatformError::Authentication(_))
        ));
        assert_eq!(err.exit_code(), 2);
    }

    #[tokio::test]
    async fn test_platform_rate_limits_are_wired() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = config_in(&temp_dir);
        config.resilience.platform_rate_limits.insert(
            "mastodon".to_string(),
            RateLimitSettings {
                tokens_per_second: 0.5,
                max_tokens: 2.0,
            },
        );
        config.resilience.concurrent = false;

        let dispatcher =
            build_dispatcher_with_clock(&config, Arc::new(ManualClock::new()))
                .await
                .unwrap();

        assert_eq!(dispatcher.rate_limiter_for("mastodon").unwrap().capacity(), 2.0);
        assert_eq!(dispatcher.rate_limiter_for("discord").unwrap().capacity(), 10.0);
        assert!(dispatcher.breaker("ghost").is_some());
        assert!(!dispatcher.is_concurrent());
        assert_eq!(
            dispatcher.ledger().unwrap().path(),
            Some(temp_dir.path().join("log.json").as_path())
        );
    }

    #[tokio::test]
    async fn test_dry_run_dispatch_writes_ledger() {
        let temp_dir = TempDir::new().unwrap();
        let config = config_in(&temp_dir);
        let dispatcher =
            build_dispatcher_with_clock(&config, Arc::new(ManualClock::new()))
                .await
                .unwrap();

        dispatcher.create_post(
            "post-1",
            "Release notes",
            "Short body",
            "https://example.org/notes",
            &["mastodon", "discord", "bluesky", "ghost"],
        );
        let outcomes = dispatcher.syndicate("post-1").await.unwrap();

        assert!(outcomes
            .iter()
            .all(|o| o.status == SyndicationStatus::Published));

        let reopened = open_ledger(&config);
        assert_eq!(reopened.len(), 4);
        assert!(reopened.has_been_delivered("post-1", "ghost"));
    }

    #[tokio::test]
    async fn test_live_mode_skips_unconfigured_platforms() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config {
            live_mode: true,
            ..config_in(&temp_dir)
        };
        let dispatcher =
            build_dispatcher_with_clock(&config, Arc::new(ManualClock::new()))
                .await
                .unwrap();

        dispatcher.create_post("post-1", "Hi", "", "https://example.org/hi", &["bluesky"]);
        let outcomes = dispatcher.syndicate("post-1").await.unwrap();

        assert_eq!(outcomes[0].status, SyndicationStatus::Skipped);
        assert!(dispatcher.ledger().unwrap().is_empty());
    }
}
