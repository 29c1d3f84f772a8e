//! posse-dispatch - Syndicate content from your own site to other platforms
//!
//! Unix-style front end for libposse: results go to stdout, logs to stderr,
//! and the exit code reports whether every platform succeeded.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::debug;

use libposse::circuit_breaker::{BreakerSnapshot, CircuitState};
use libposse::config::Config;
use libposse::factory::{self, KNOWN_PLATFORMS};
use libposse::ledger::{DeliveryRecord, DeliveryStatus};
use libposse::logging::{LogFormat, LoggingConfig};
use libposse::types::SyndicationOutcome;
use libposse::PosseError;

#[derive(Parser, Debug)]
#[command(name = "posse-dispatch")]
#[command(version)]
#[command(about = "Syndicate content from your own site to other platforms")]
#[command(long_about = "\
posse-dispatch - Publish on your Own Site, Syndicate Everywhere

DESCRIPTION:
    Pushes a post that already lives on your site to Mastodon, Discord,
    Bluesky and Ghost. Each platform is rate limited, guarded by a circuit
    breaker and retried with exponential backoff. Every delivery is recorded
    in a JSON ledger, so re-running the same dispatch only retries platforms
    that have not succeeded yet.

    Unless live_mode is enabled, nothing leaves the machine: every platform
    is simulated and receives deterministic URLs.

USAGE EXAMPLES:
    # Syndicate to the default platforms
    posse-dispatch dispatch --title \"Release 1.2\" --url https://example.org/1-2

    # Choose platforms and emit JSON
    posse-dispatch dispatch --title \"Essay\" --url https://example.org/essay \\
        --platforms mastodon,bluesky --format json

    # Show failed deliveries
    posse-dispatch log --failures

    # Show configuration and platform health
    posse-dispatch status

CONFIGURATION:
    Configuration file: ~/.config/posse/config.yaml

    Override with environment variables:
        POSSE_CONFIG                 - Path to config file
        POSSE_LIVE_MODE              - true/1/yes to call real APIs
        POSSE_DELIVERY_LOG_PATH      - Path to the delivery ledger
        POSSE_MASTODON_INSTANCE_URL, POSSE_MASTODON_ACCESS_TOKEN
        POSSE_DISCORD_WEBHOOK_URL
        POSSE_BLUESKY_HANDLE, POSSE_BLUESKY_APP_PASSWORD,
        POSSE_BLUESKY_SERVICE_URL
        POSSE_GHOST_API_URL, POSSE_GHOST_ADMIN_API_KEY
        POSSE_LOG_FORMAT, POSSE_LOG_LEVEL

EXIT CODES:
    0 - Success
    1 - A platform failed, a delivery could not be recorded, or another
        error occurred
    2 - Authentication error
    3 - Invalid input
")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (YAML, or TOML with a .toml extension)
    #[arg(short, long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Enable verbose logging to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log format: text, json or pretty
    #[arg(
        long,
        global = true,
        env = "POSSE_LOG_FORMAT",
        default_value = "text",
        value_name = "FORMAT"
    )]
    log_format: LogFormat,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Syndicate a post to its target platforms
    Dispatch(DispatchArgs),

    /// Show delivery history from the ledger
    Log {
        /// Only failed deliveries
        #[arg(long)]
        failures: bool,

        /// Filter by platform
        #[arg(short, long)]
        platform: Option<String>,

        /// Filter by content id
        #[arg(long, value_name = "ID")]
        post: Option<String>,

        /// Output format
        #[arg(short, long, default_value = "text", value_name = "FORMAT")]
        #[arg(value_parser = ["text", "json", "jsonl"])]
        format: String,
    },

    /// Show configuration, ledger totals and platform health
    Status {
        /// Output format
        #[arg(short, long, default_value = "text", value_name = "FORMAT")]
        #[arg(value_parser = ["text", "json"])]
        format: String,
    },
}

#[derive(Args, Debug)]
struct DispatchArgs {
    /// Post title
    #[arg(long)]
    title: String,

    /// Canonical URL on your own site
    #[arg(long)]
    url: String,

    /// Post body
    #[arg(long, default_value = "")]
    body: String,

    /// Target platforms (comma-separated); defaults to the configured list
    #[arg(short, long)]
    platforms: Option<String>,

    /// Content id; derived from the URL when omitted so repeats deduplicate
    #[arg(long)]
    id: Option<String>,

    /// Output format
    #[arg(short, long, default_value = "text", value_name = "FORMAT")]
    #[arg(value_parser = ["text", "json"])]
    format: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let mut logging = LoggingConfig::from_env();
    logging.format = cli.log_format;
    logging.verbose = cli.verbose;
    logging.init();

    match run(cli).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(exit_code(&e));
        }
    }
}

fn exit_code(error: &anyhow::Error) -> i32 {
    error
        .downcast_ref::<PosseError>()
        .map(PosseError::exit_code)
        .unwrap_or(1)
}

async fn run(cli: Cli) -> Result<i32> {
    let config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    debug!(live = config.live_mode, ledger = %config.delivery_log_path().display(), "configuration loaded");

    match cli.command {
        Commands::Dispatch(args) => dispatch(&config, args).await,
        Commands::Log {
            failures,
            platform,
            post,
            format,
        } => {
            show_log(&config, failures, platform.as_deref(), post.as_deref(), &format)?;
            Ok(0)
        }
        Commands::Status { format } => {
            show_status(&config, &format).await?;
            Ok(0)
        }
    }
}

#[derive(Serialize)]
struct DispatchReport<'a> {
    id: &'a str,
    canonical_url: &'a str,
    outcomes: &'a [SyndicationOutcome],
}

async fn dispatch(config: &Config, args: DispatchArgs) -> Result<i32> {
    let title = args.title.trim();
    if title.is_empty() {
        return Err(PosseError::InvalidInput("Title cannot be empty".to_string()).into());
    }
    let url = args.url.trim();
    if url.is_empty() {
        return Err(PosseError::InvalidInput("URL cannot be empty".to_string()).into());
    }

    let platforms = parse_platforms(args.platforms.as_deref(), &config.defaults.platforms)?;
    let id = args.id.unwrap_or_else(|| content_id_for(url));

    let dispatcher = factory::build_dispatcher(config).await?;
    let targets: Vec<&str> = platforms.iter().map(String::as_str).collect();
    dispatcher.create_post(&id, title, &args.body, url, &targets);

    let outcomes = dispatcher.syndicate(&id).await?;

    if args.format == "json" {
        let report = DispatchReport {
            id: &id,
            canonical_url: url,
            outcomes: &outcomes,
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        for outcome in &outcomes {
            let detail = match (outcome.external_url.as_deref(), outcome.error.as_deref()) {
                (Some(url), Some(error)) => format!("{} ({})", url, error),
                (Some(detail), None) | (None, Some(detail)) => detail.to_string(),
                (None, None) => String::new(),
            };
            println!("{}\t{}\t{}", outcome.platform, outcome.status, detail);
        }
    }

    Ok(if outcomes.iter().any(SyndicationOutcome::needs_attention) {
        1
    } else {
        0
    })
}

/// Comma-separated platform list, lowercased, or the configured defaults
fn parse_platforms(arg: Option<&str>, defaults: &[String]) -> libposse::Result<Vec<String>> {
    let platforms: Vec<String> = match arg {
        Some(list) => list
            .split(',')
            .map(|p| p.trim().to_lowercase())
            .filter(|p| !p.is_empty())
            .collect(),
        None => defaults.to_vec(),
    };

    if platforms.is_empty() {
        return Err(PosseError::InvalidInput(
            "No target platforms given".to_string(),
        ));
    }
    Ok(platforms)
}

/// Stable content id for a canonical URL
fn content_id_for(url: &str) -> String {
    let digest = format!("{:x}", Sha256::digest(url.as_bytes()));
    format!("post-{}", &digest[..12])
}

fn show_log(
    config: &Config,
    failures: bool,
    platform: Option<&str>,
    post: Option<&str>,
    format: &str,
) -> Result<()> {
    let ledger = factory::open_ledger(config);
    let records: Vec<DeliveryRecord> = if failures {
        ledger.failures()
    } else {
        ledger.all_records()
    }
    .into_iter()
    .filter(|r| platform.map_or(true, |p| r.platform == p))
    .filter(|r| post.map_or(true, |p| r.post_id == p))
    .collect();

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&records)?),
        "jsonl" => {
            for record in &records {
                println!("{}", serde_json::to_string(record)?);
            }
        }
        _ => {
            if records.is_empty() {
                println!("No delivery records found.");
            }
            for record in &records {
                let detail = match record.status {
                    DeliveryStatus::Success => record.external_url.as_deref(),
                    _ => record.error.as_deref(),
                }
                .unwrap_or("");
                println!(
                    "{}  {:<7}  {}  {}  {}",
                    display_timestamp(&record.timestamp),
                    record.status.to_string(),
                    record.post_id,
                    record.platform,
                    detail
                );
            }
        }
    }

    Ok(())
}

fn display_timestamp(timestamp: &str) -> String {
    chrono::DateTime::parse_from_rfc3339(timestamp)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|_| timestamp.to_string())
}

#[derive(Serialize)]
struct StatusReport {
    live_mode: bool,
    ledger_path: String,
    records: usize,
    delivered: usize,
    failures: usize,
    retry_max_attempts: u32,
    breaker_failure_threshold: u32,
    breaker_reset_timeout_secs: f64,
    platforms: Vec<PlatformHealth>,
}

#[derive(Serialize)]
struct PlatformHealth {
    name: String,
    registered: bool,
    circuit: Option<CircuitState>,
    consecutive_failures: Option<u32>,
    tokens_per_second: Option<f64>,
    max_tokens: Option<f64>,
}

async fn show_status(config: &Config, format: &str) -> Result<()> {
    let dispatcher = factory::build_dispatcher(config).await?;
    let records = dispatcher
        .ledger()
        .map(|l| l.all_records())
        .unwrap_or_default();

    let mut names: Vec<String> = KNOWN_PLATFORMS.iter().map(|s| s.to_string()).collect();
    for name in &config.defaults.platforms {
        if !names.contains(name) {
            names.push(name.clone());
        }
    }

    let snapshots: HashMap<String, BreakerSnapshot> = dispatcher
        .breaker_snapshots()
        .into_iter()
        .map(|s| (s.name.clone(), s))
        .collect();

    let platforms = names
        .into_iter()
        .map(|name| {
            let limiter = dispatcher.rate_limiter_for(&name);
            let snapshot = snapshots.get(&name);
            PlatformHealth {
                registered: dispatcher.registry().contains(&name),
                circuit: snapshot.map(|s| s.state),
                consecutive_failures: snapshot.map(|s| s.failure_count),
                tokens_per_second: limiter.as_ref().map(|l| l.rate()),
                max_tokens: limiter.as_ref().map(|l| l.capacity()),
                name,
            }
        })
        .collect();

    let retry = config.resilience.retry.to_retry_config();
    let breaker = config.resilience.circuit_breaker.to_breaker_config();
    let report = StatusReport {
        live_mode: config.live_mode,
        ledger_path: config.delivery_log_path().display().to_string(),
        records: records.len(),
        delivered: records
            .iter()
            .filter(|r| r.status == DeliveryStatus::Success)
            .count(),
        failures: records
            .iter()
            .filter(|r| r.status == DeliveryStatus::Failure)
            .count(),
        retry_max_attempts: retry.max_attempts,
        breaker_failure_threshold: breaker.failure_threshold,
        breaker_reset_timeout_secs: breaker.reset_timeout.as_secs_f64(),
        platforms,
    };

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Mode: {}", if report.live_mode { "live" } else { "dry-run" });
    println!("Ledger: {}", report.ledger_path);
    println!(
        "Records: {} ({} delivered, {} failed)",
        report.records, report.delivered, report.failures
    );
    println!(
        "Retry: up to {} attempts, backoff {} to {}",
        retry.max_attempts,
        humantime::format_duration(retry.base_delay),
        humantime::format_duration(retry.max_delay)
    );
    println!(
        "Circuit breaker: opens after {} failures, resets after {}",
        breaker.failure_threshold,
        humantime::format_duration(breaker.reset_timeout)
    );
    println!();
    for platform in &report.platforms {
        let client = if platform.registered {
            "ready"
        } else {
            "no client"
        };
        let circuit = platform
            .circuit
            .map(|c| c.to_string())
            .unwrap_or_else(|| "-".to_string());
        let limit = match (platform.tokens_per_second, platform.max_tokens) {
            (Some(rate), Some(burst)) => format!("{}/s burst {}", rate, burst),
            _ => "unlimited".to_string(),
        };
        println!(
            "{:<10} {:<10} circuit {:<10} rate {}",
            platform.name, client, circuit, limit
        );
    }

    Ok(())
}
