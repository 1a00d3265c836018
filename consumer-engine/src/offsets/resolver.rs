use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use common_kafka::Partition;
use common_metrics::MetricsSink;
use thiserror::Error;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, info, warn};

use crate::metrics_consts::{RESOLVE_DURATION_MS, RESOLVE_FETCHES, RESOLVE_OUTCOMES};
use crate::offsets::{OffsetQuery, OffsetQueryError, TimestampExtractor};

const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("failed to list partitions of {topic}: {source}")]
    Partitions {
        topic: String,
        #[source]
        source: OffsetQueryError,
    },
    #[error("failed to read watermarks of {partition}: {source}")]
    Watermarks {
        partition: Partition,
        #[source]
        source: OffsetQueryError,
    },
    #[error("failed to fetch offset {offset} of {partition}: {source}")]
    Fetch {
        partition: Partition,
        offset: i64,
        #[source]
        source: OffsetQueryError,
    },
    #[error("fetching offset {offset} of {partition} took longer than {timeout:?}")]
    FetchTimeout {
        partition: Partition,
        offset: i64,
        timeout: Duration,
    },
    #[error("failed to extract timestamp at offset {offset} of {partition}: {source}")]
    Extract {
        partition: Partition,
        offset: i64,
        #[source]
        source: anyhow::Error,
    },
    #[error("offsets of {topic} were not resolved within {timeout:?}")]
    Timeout { topic: String, timeout: Duration },
    #[error("partition search did not complete: {0}")]
    Task(#[from] JoinError),
}

impl ResolveError {
    fn outcome(&self) -> &'static str {
        match self {
            ResolveError::Timeout { .. } => "timeout",
            _ => "error",
        }
    }
}

/// Finds, for every partition of a topic, the first offset whose timestamp is not before a
/// given time. Partitions are searched concurrently.
pub struct OffsetResolver {
    query: Arc<dyn OffsetQuery>,
    fetch_timeout: Duration,
    metrics: Arc<dyn MetricsSink>,
}

impl OffsetResolver {
    pub fn new(query: Arc<dyn OffsetQuery>) -> Self {
        Self {
            query,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            metrics: common_metrics::noop(),
        }
    }

    /// Bound on each single message fetch, separate from the overall timeout.
    pub fn with_fetch_timeout(mut self, fetch_timeout: Duration) -> Self {
        self.fetch_timeout = fetch_timeout;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Resolve a starting offset per partition of `topic` for messages at or after `since`.
    ///
    /// Either every partition is resolved within `timeout` or an error is returned; partial
    /// maps are never returned. The first failing partition aborts the remaining searches.
    pub async fn resolve_offsets(
        &self,
        topic: &str,
        since: DateTime<Utc>,
        extractor: Arc<dyn TimestampExtractor>,
        timeout: Duration,
    ) -> Result<HashMap<i32, i64>, ResolveError> {
        let started = Instant::now();
        let labels = [("topic".to_string(), topic.to_string())];

        let result = match tokio::time::timeout(timeout, self.resolve_all(topic, since, extractor))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(ResolveError::Timeout {
                topic: topic.to_string(),
                timeout,
            }),
        };

        self.metrics.histogram(
            RESOLVE_DURATION_MS,
            &labels,
            started.elapsed().as_millis() as f64,
        );
        let outcome = match &result {
            Ok(offsets) => {
                info!(topic, %since, partitions = offsets.len(), "resolved starting offsets");
                "success"
            }
            Err(err) => {
                warn!(topic, %since, error = %err, "failed to resolve starting offsets");
                err.outcome()
            }
        };
        let mut labels = labels.to_vec();
        labels.push(("outcome".to_string(), outcome.to_string()));
        self.metrics.increment(RESOLVE_OUTCOMES, &labels, 1);

        result
    }

    async fn resolve_all(
        &self,
        topic: &str,
        since: DateTime<Utc>,
        extractor: Arc<dyn TimestampExtractor>,
    ) -> Result<HashMap<i32, i64>, ResolveError> {
        let partition_ids =
            self.query
                .partition_ids(topic)
                .await
                .map_err(|source| ResolveError::Partitions {
                    topic: topic.to_string(),
                    source,
                })?;

        let mut searches = JoinSet::new();
        for partition_id in partition_ids {
            let search = PartitionSearch {
                query: self.query.clone(),
                extractor: extractor.clone(),
                metrics: self.metrics.clone(),
                partition: Partition::new(topic.to_string(), partition_id),
                since,
                fetch_timeout: self.fetch_timeout,
            };
            searches.spawn(async move { (partition_id, search.run().await) });
        }

        // Sole writer of the map. Returning early drops the set, aborting unfinished searches.
        let mut offsets = HashMap::with_capacity(searches.len());
        while let Some(joined) = searches.join_next().await {
            let (partition_id, result) = joined?;
            offsets.insert(partition_id, result?);
        }
        Ok(offsets)
    }
}

struct PartitionSearch {
    query: Arc<dyn OffsetQuery>,
    extractor: Arc<dyn TimestampExtractor>,
    metrics: Arc<dyn MetricsSink>,
    partition: Partition,
    since: DateTime<Utc>,
    fetch_timeout: Duration,
}

impl PartitionSearch {
    async fn run(&self) -> Result<i64, ResolveError> {
        let topic = self.partition.topic();
        let id = self.partition.partition_number();

        let oldest = self
            .query
            .oldest_offset(topic, id)
            .await
            .map_err(|source| self.watermark_error(source))?;
        let newest = self
            .query
            .newest_offset(topic, id)
            .await
            .map_err(|source| self.watermark_error(source))?;

        if oldest >= newest {
            debug!(partition = %self.partition, oldest, newest, "empty partition");
            return Ok(newest);
        }

        // Lowest offset whose timestamp is not before `since`, or `newest` if there is none.
        let (mut lo, mut hi) = (oldest, newest - 1);
        while lo <= hi {
            let mid = lo + (hi - lo) / 2;
            let timestamp = match self.timestamp_at(mid).await {
                Ok(timestamp) => timestamp,
                // Retention moved the log start past `mid`.
                Err(ResolveError::Fetch {
                    source: OffsetQueryError::OutOfRange { .. },
                    ..
                }) => {
                    lo = mid + 1;
                    continue;
                }
                Err(err) => return Err(err),
            };

            match timestamp.cmp(&self.since) {
                Ordering::Equal => return Ok(mid),
                Ordering::Less => lo = mid + 1,
                Ordering::Greater => hi = mid - 1,
            }
        }

        debug!(partition = %self.partition, offset = lo, "resolved offset");
        Ok(lo)
    }

    async fn timestamp_at(&self, offset: i64) -> Result<DateTime<Utc>, ResolveError> {
        self.metrics
            .increment(RESOLVE_FETCHES, &self.partition.labels(), 1);

        let fetch = self.query.message_at(
            self.partition.topic(),
            self.partition.partition_number(),
            offset,
        );
        let message = match tokio::time::timeout(self.fetch_timeout, fetch).await {
            Ok(Ok(message)) => message,
            Ok(Err(source)) => {
                return Err(ResolveError::Fetch {
                    partition: self.partition.clone(),
                    offset,
                    source,
                })
            }
            Err(_) => {
                return Err(ResolveError::FetchTimeout {
                    partition: self.partition.clone(),
                    offset,
                    timeout: self.fetch_timeout,
                })
            }
        };

        self.extractor
            .extract(&message)
            .map_err(|source| ResolveError::Extract {
                partition: self.partition.clone(),
                offset,
                source,
            })
    }

    fn watermark_error(&self, source: OffsetQueryError) -> ResolveError {
        ResolveError::Watermarks {
            partition: self.partition.clone(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::offsets::BrokerTimestamp;
    use crate::test_utils::{timestamp, FakeOffsetQuery};

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn broker() -> Arc<BrokerTimestamp> {
        Arc::new(BrokerTimestamp)
    }

    fn resolver(query: FakeOffsetQuery) -> OffsetResolver {
        OffsetResolver::new(Arc::new(query)).with_fetch_timeout(Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_single_partition() {
        // Offset n carries timestamp n.
        let cases = [
            (4, 4, "exact match"),
            (-100, 0, "before every message"),
            (100, 10, "after every message"),
            (0, 0, "first message"),
            (9, 9, "last message"),
        ];

        for (since, expected, case) in cases {
            let query = FakeOffsetQuery::new("events")
                .with_partition(0, 0, (0..10).collect());
            let offsets = resolver(query)
                .resolve_offsets("events", timestamp(since), broker(), TIMEOUT)
                .await
                .unwrap();
            assert_eq!(offsets[&0], expected, "{case}");
        }
    }

    #[tokio::test]
    async fn test_lands_between_timestamps() {
        // Offsets 0..5 carry timestamps 0, 10, 20, 30, 40.
        let query = FakeOffsetQuery::new("events")
            .with_partition(0, 0, vec![0, 10, 20, 30, 40]);

        let offsets = resolver(query)
            .resolve_offsets("events", timestamp(25), broker(), TIMEOUT)
            .await
            .unwrap();
        assert_eq!(offsets[&0], 3);
    }

    #[tokio::test]
    async fn test_empty_partition_returns_boundary_without_fetching() {
        let query = Arc::new(FakeOffsetQuery::new("events").with_partition(0, 7, vec![]));

        let offsets = OffsetResolver::new(query.clone())
            .resolve_offsets("events", timestamp(0), broker(), TIMEOUT)
            .await
            .unwrap();
        assert_eq!(offsets[&0], 7);
        assert_eq!(query.fetches(), 0);
    }

    #[tokio::test]
    async fn test_out_of_range_moves_left_boundary_up() {
        // Offsets 0..4 were deleted after the watermarks were read.
        let query = FakeOffsetQuery::new("events")
            .with_partition(0, 0, (0..10).collect())
            .with_expired_below(0, 4);

        let offsets = resolver(query)
            .resolve_offsets("events", timestamp(-1), broker(), TIMEOUT)
            .await
            .unwrap();
        assert_eq!(offsets[&0], 4);
    }

    #[tokio::test]
    async fn test_extractor_error_fails_the_whole_resolution() {
        let query = FakeOffsetQuery::new("events")
            .with_partition(0, 0, (0..10).collect())
            .with_partition(1, 0, (0..10).collect());
        let failing = |_: &crate::offsets::FetchedMessage| -> anyhow::Result<DateTime<Utc>> {
            Err(anyhow::anyhow!("unparseable"))
        };

        let err = resolver(query)
            .resolve_offsets("events", timestamp(3), Arc::new(failing), TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::Extract { .. }));
    }

    #[tokio::test]
    async fn test_unknown_topic() {
        let err = resolver(FakeOffsetQuery::new("events"))
            .resolve_offsets("missing", timestamp(0), broker(), TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ResolveError::Partitions {
                source: OffsetQueryError::UnknownTopic(_),
                ..
            }
        ));
    }
}
