//! End-to-end syndication through the full resilience chain

use std::sync::Arc;
use std::time::Duration;

use libposse::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use libposse::clock::{Clock, ManualClock};
use libposse::dispatcher::{Dispatcher, DEDUP_SKIP_REASON};
use libposse::error::{DispatchError, PlatformError};
use libposse::ledger::{DeliveryLedger, DeliveryRecord, DeliveryStatus};
use libposse::platforms::mock::MockPlatform;
use libposse::rate_limiter::{RateLimiter, RateLimiterConfig};
use libposse::retry::RetryConfig;
use libposse::types::SyndicationStatus;
use tempfile::TempDir;

fn no_jitter_retry(max_attempts: u32) -> RetryConfig {
    RetryConfig {
        max_attempts,
        base_delay: Duration::from_secs(1),
        max_delay: Duration::from_secs(30),
        multiplier: 2.0,
        jitter: false,
        ..RetryConfig::default()
    }
}

#[tokio::test]
async fn test_one_platform_fails_without_affecting_the_other() {
    let clock = Arc::new(ManualClock::new());
    let a = MockPlatform::success("a");
    let b = MockPlatform::failing("b", PlatformError::Network("connection reset".to_string()));
    let ledger = Arc::new(DeliveryLedger::in_memory());

    let dispatcher = Dispatcher::builder()
        .platform(Arc::new(a.clone()))
        .platform(Arc::new(b.clone()))
        .with_retry(no_jitter_retry(3))
        .with_default_circuit_breaker(CircuitBreakerConfig::default())
        .with_ledger(ledger.clone())
        .with_clock(clock.clone())
        .build();

    dispatcher.create_post("post-1", "Hello", "", "https://example.org/hello", &["a", "b"]);
    let outcomes = dispatcher.syndicate("post-1").await.unwrap();

    assert_eq!(outcomes.len(), 2);
    assert_eq!(outcomes[0].platform, "a");
    assert_eq!(outcomes[0].status, SyndicationStatus::Published);
    assert_eq!(outcomes[1].platform, "b");
    assert_eq!(outcomes[1].status, SyndicationStatus::Failed);
    assert!(outcomes[1]
        .error
        .as_deref()
        .unwrap()
        .starts_with("Failed after 3 attempts"));

    assert_eq!(a.publish_call_count(), 1);
    assert_eq!(b.publish_call_count(), 3);
    assert_eq!(
        clock.sleeps(),
        vec![Duration::from_secs(1), Duration::from_secs(2)]
    );

    assert!(ledger.has_been_delivered("post-1", "a"));
    assert!(!ledger.has_been_delivered("post-1", "b"));
    assert_eq!(ledger.failures().len(), 1);
}

#[tokio::test]
async fn test_open_breaker_rejects_without_calling_or_retrying() {
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new());
    let breaker = Arc::new(CircuitBreaker::new(
        "b",
        CircuitBreakerConfig {
            failure_threshold: 1,
            reset_timeout: Duration::from_secs(60),
            half_open_max_calls: 1,
        },
        clock.clone(),
    ));

    let tripped = breaker
        .call(|| async {
            Err::<(), _>(DispatchError::from(PlatformError::Network("down".to_string())))
        })
        .await;
    assert!(tripped.is_err());
    assert_eq!(breaker.state(), CircuitState::Open);

    let b = MockPlatform::success("b");
    let dispatcher = Dispatcher::builder()
        .platform(Arc::new(b.clone()))
        .with_retry(no_jitter_retry(3))
        .with_breaker(breaker.clone())
        .with_clock(clock)
        .build();

    dispatcher.create_post("post-1", "Hello", "", "https://example.org/hello", &["b"]);
    let outcomes = dispatcher.syndicate("post-1").await.unwrap();

    assert_eq!(outcomes[0].status, SyndicationStatus::Failed);
    assert!(outcomes[0]
        .error
        .as_deref()
        .unwrap()
        .contains("Circuit is OPEN"));
    assert_eq!(b.publish_call_count(), 0);
}

#[tokio::test]
async fn test_breaker_reopens_and_recovers_across_dispatches() {
    let clock = Arc::new(ManualClock::new());
    let flaky = MockPlatform::flaky("m", 2, PlatformError::Network("timeout".to_string()));

    let dispatcher = Dispatcher::builder()
        .platform(Arc::new(flaky.clone()))
        .with_circuit_breaker(
            "m",
            CircuitBreakerConfig {
                failure_threshold: 2,
                reset_timeout: Duration::from_secs(30),
                half_open_max_calls: 1,
            },
        )
        .with_clock(clock.clone())
        .build();

    for id in ["p1", "p2", "p3"] {
        dispatcher.create_post(id, "Title", "", "https://example.org/", &["m"]);
    }

    // Two failures trip the breaker
    dispatcher.syndicate("p1").await.unwrap();
    dispatcher.syndicate("p2").await.unwrap();
    let breaker = dispatcher.breaker("m").unwrap();
    assert_eq!(breaker.state(), CircuitState::Open);

    let rejected = dispatcher.syndicate("p3").await.unwrap();
    assert_eq!(rejected[0].status, SyndicationStatus::Failed);
    assert_eq!(flaky.publish_call_count(), 2);

    clock.advance(Duration::from_secs(30));
    assert_eq!(breaker.state(), CircuitState::HalfOpen);

    let recovered = dispatcher.syndicate("p3").await.unwrap();
    assert_eq!(recovered[0].status, SyndicationStatus::Published);
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(breaker.failure_count(), 0);
}

#[tokio::test]
async fn test_already_delivered_pair_is_skipped() {
    let ledger = Arc::new(DeliveryLedger::in_memory());
    ledger
        .append(DeliveryRecord::success(
            "post-1",
            "x",
            Some("https://x.example/1".to_string()),
        ))
        .unwrap();

    let x = MockPlatform::success("x");
    let y = MockPlatform::success("y");
    let dispatcher = Dispatcher::builder()
        .platform(Arc::new(x.clone()))
        .platform(Arc::new(y.clone()))
        .with_ledger(ledger.clone())
        .with_clock(Arc::new(ManualClock::new()))
        .build();

    dispatcher.create_post("post-1", "Hello", "", "https://example.org/hello", &["x", "y"]);
    let outcomes = dispatcher.syndicate("post-1").await.unwrap();

    assert_eq!(outcomes[0].status, SyndicationStatus::Skipped);
    assert_eq!(outcomes[0].error.as_deref(), Some(DEDUP_SKIP_REASON));
    assert_eq!(outcomes[1].status, SyndicationStatus::Published);
    assert_eq!(x.publish_call_count(), 0);
    assert_eq!(y.publish_call_count(), 1);

    // Dedup skips are not written back
    assert_eq!(ledger.by_platform("x").len(), 1);
}

#[tokio::test]
async fn test_rerun_after_failure_publishes_only_the_missing_platform() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("delivery_log.json");

    let first_b = MockPlatform::failing("b", PlatformError::Posting("rejected".to_string()));
    let first = Dispatcher::builder()
        .platform(Arc::new(MockPlatform::success("a")))
        .platform(Arc::new(first_b))
        .with_ledger(Arc::new(DeliveryLedger::open(&path)))
        .with_clock(Arc::new(ManualClock::new()))
        .build();
    first.create_post("post-1", "Hello", "", "https://example.org/hello", &["a", "b"]);
    first.syndicate("post-1").await.unwrap();

    let a = MockPlatform::success("a");
    let b = MockPlatform::success("b");
    let second = Dispatcher::builder()
        .platform(Arc::new(a.clone()))
        .platform(Arc::new(b.clone()))
        .with_ledger(Arc::new(DeliveryLedger::open(&path)))
        .with_clock(Arc::new(ManualClock::new()))
        .build();
    second.create_post("post-1", "Hello", "", "https://example.org/hello", &["a", "b"]);
    let outcomes = second.syndicate("post-1").await.unwrap();

    assert_eq!(outcomes[0].status, SyndicationStatus::Skipped);
    assert_eq!(outcomes[1].status, SyndicationStatus::Published);
    assert_eq!(a.publish_call_count(), 0);
    assert_eq!(b.publish_call_count(), 1);

    let ledger = DeliveryLedger::open(&path);
    let statuses: Vec<_> = ledger.by_post("post-1").iter().map(|r| r.status).collect();
    assert_eq!(
        statuses,
        vec![
            DeliveryStatus::Success,
            DeliveryStatus::Failure,
            DeliveryStatus::Success
        ]
    );
}

#[tokio::test]
async fn test_ledger_retains_most_recent_records() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("delivery_log.json");
    let ledger = DeliveryLedger::open(&path).with_max_records(3);

    for n in 1..=5 {
        ledger
            .append(DeliveryRecord::success(&format!("post-{}", n), "a", None))
            .unwrap();
    }

    assert_eq!(ledger.len(), 3);
    assert!(ledger.by_post("post-1").is_empty());
    assert!(ledger.by_post("post-2").is_empty());
    assert_eq!(ledger.by_post("post-5").len(), 1);

    let reopened = DeliveryLedger::open(&path);
    let ids: Vec<_> = reopened.all_records().into_iter().map(|r| r.post_id).collect();
    assert_eq!(ids, vec!["post-3", "post-4", "post-5"]);
}

#[tokio::test]
async fn test_rate_limited_fan_out_waits_for_tokens() {
    let clock = Arc::new(ManualClock::new());
    let limiter = RateLimiter::new(
        RateLimiterConfig {
            tokens_per_second: 2.0,
            max_tokens: 1.0,
            initial_tokens: None,
        },
        clock.clone(),
    )
    .unwrap();

    let dispatcher = Dispatcher::builder()
        .platform(Arc::new(MockPlatform::success("a")))
        .platform(Arc::new(MockPlatform::success("b")))
        .platform(Arc::new(MockPlatform::success("c")))
        .with_rate_limiter(Arc::new(limiter))
        .with_clock(clock.clone())
        .sequential()
        .build();

    dispatcher.create_post("post-1", "Hello", "", "https://example.org/hello", &["a", "b", "c"]);
    let outcomes = dispatcher.syndicate("post-1").await.unwrap();

    assert!(outcomes
        .iter()
        .all(|o| o.status == SyndicationStatus::Published));
    assert_eq!(clock.total_slept(), Duration::from_secs(1));
}

#[tokio::test]
async fn test_unknown_content_id_is_invalid_input() {
    let dispatcher = Dispatcher::builder().build();
    let err = dispatcher.syndicate("missing").await.unwrap_err();
    assert_eq!(err.exit_code(), 3);
}
