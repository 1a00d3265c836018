use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use consumer_engine::offsets::{BrokerTimestamp, FetchedMessage, OffsetResolver, ResolveError};
use consumer_engine::test_utils::{timestamp, FakeOffsetQuery};

fn broker_time() -> Arc<BrokerTimestamp> {
    Arc::new(BrokerTimestamp)
}

#[tokio::test]
async fn test_resolves_every_partition() {
    // Partition 0 holds one message per second, partition 1 one every ten seconds.
    let query = FakeOffsetQuery::new("events")
        .with_partition(0, 0, (0..100).collect())
        .with_partition(1, 0, (0..100).map(|n| n * 10).collect())
        .with_partition(2, 0, vec![]);

    let offsets = OffsetResolver::new(Arc::new(query))
        .resolve_offsets("events", timestamp(50), broker_time(), Duration::from_secs(5))
        .await
        .unwrap();

    assert_eq!(offsets.len(), 3);
    assert_eq!(offsets[&0], 50);
    assert_eq!(offsets[&1], 5);
    assert_eq!(offsets[&2], 0);
}

#[tokio::test]
async fn test_search_stays_within_the_retained_range() {
    // Offsets 100..110 carry timestamps 1000..1010.
    let query = Arc::new(
        FakeOffsetQuery::new("events").with_partition(0, 100, (1000..1010).collect()),
    );
    let resolver = OffsetResolver::new(query.clone());

    let before = resolver
        .resolve_offsets("events", timestamp(0), broker_time(), Duration::from_secs(5))
        .await
        .unwrap();
    let within = resolver
        .resolve_offsets("events", timestamp(1007), broker_time(), Duration::from_secs(5))
        .await
        .unwrap();
    let after = resolver
        .resolve_offsets("events", timestamp(5000), broker_time(), Duration::from_secs(5))
        .await
        .unwrap();

    assert_eq!(before[&0], 100);
    assert_eq!(within[&0], 107);
    assert_eq!(after[&0], 110);
}

#[tokio::test]
async fn test_fetches_are_logarithmic() {
    let query = Arc::new(FakeOffsetQuery::new("events").with_partition(0, 0, (0..1024).collect()));

    OffsetResolver::new(query.clone())
        .resolve_offsets("events", timestamp(777), broker_time(), Duration::from_secs(5))
        .await
        .unwrap();

    assert!(query.fetches() <= 11, "fetched {} messages", query.fetches());
}

#[tokio::test]
async fn test_custom_extractor_reads_the_payload() {
    // The fake payload is the timestamp in seconds; read it in minutes instead.
    let query = FakeOffsetQuery::new("events")
        .with_partition(0, 0, (0..20).map(|n| n * 60).collect());
    let minutes = |message: &FetchedMessage| -> anyhow::Result<DateTime<Utc>> {
        let payload = message.payload.as_deref().unwrap_or_default();
        let seconds: i64 = std::str::from_utf8(payload)?.parse()?;
        Ok(timestamp(seconds))
    };

    let offsets = OffsetResolver::new(Arc::new(query))
        .resolve_offsets("events", timestamp(12 * 60), Arc::new(minutes), Duration::from_secs(5))
        .await
        .unwrap();

    assert_eq!(offsets[&0], 12);
}

#[tokio::test(start_paused = true)]
async fn test_overall_deadline_discards_partial_results() {
    let query = FakeOffsetQuery::new("events")
        .with_partition(0, 0, vec![])
        .with_partition(1, 0, (0..10).collect())
        .with_fetch_delay(Duration::from_secs(10));

    let err = OffsetResolver::new(Arc::new(query))
        .with_fetch_timeout(Duration::from_secs(30))
        .resolve_offsets("events", timestamp(4), broker_time(), Duration::from_secs(1))
        .await
        .unwrap_err();

    assert!(matches!(err, ResolveError::Timeout { ref topic, .. } if topic == "events"));
}

#[tokio::test(start_paused = true)]
async fn test_slow_fetch_hits_the_fetch_timeout() {
    let query = FakeOffsetQuery::new("events")
        .with_partition(0, 0, (0..10).collect())
        .with_fetch_delay(Duration::from_secs(5));

    let err = OffsetResolver::new(Arc::new(query))
        .with_fetch_timeout(Duration::from_secs(1))
        .resolve_offsets("events", timestamp(4), broker_time(), Duration::from_secs(30))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ResolveError::FetchTimeout { offset: 4, timeout, .. } if timeout == Duration::from_secs(1)
    ));
}
