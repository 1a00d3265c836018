use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common_kafka::Partition;
use common_metrics::MetricsSink;
use futures::StreamExt;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::Message as _;
use tokio::sync::mpsc;
use tokio::task::spawn_blocking;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{CommitError, GroupError};
use crate::group::{
    next_tick, periodic, ClaimMessage, ClaimRouter, ConsumerGroup, ConsumerGroupFactory,
    GroupHandler, GroupSession,
};
use crate::kafka::context::{commit_list, GroupContext, MarkedOffsets, RebalanceEvent};
use crate::kafka::errors::handle_kafka_error;
use crate::kafka::{headers_of, timestamp_of, KafkaSettings};
use crate::metrics_consts::OFFSET_COMMITS;

type GroupConsumer = StreamConsumer<GroupContext>;

const WATERMARK_TIMEOUT: Duration = Duration::from_secs(1);

/// Joins consumer groups with a librdkafka client.
#[derive(Clone)]
pub struct KafkaGroupFactory {
    settings: KafkaSettings,
    pub(crate) metrics: Arc<dyn MetricsSink>,
}

impl Default for KafkaGroupFactory {
    fn default() -> Self {
        Self::new(KafkaSettings::default())
    }
}

impl KafkaGroupFactory {
    pub fn new(settings: KafkaSettings) -> Self {
        Self {
            settings,
            metrics: common_metrics::noop(),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    fn connect(
        &self,
        group: &str,
        brokers: &[String],
        topics: &[String],
    ) -> Result<KafkaConsumerGroup, GroupError> {
        let join_error = |source: anyhow::Error| GroupError::Join {
            group: group.to_string(),
            source,
        };

        let (events_tx, events) = mpsc::unbounded_channel();
        let marked = Arc::new(MarkedOffsets::default());
        let context = GroupContext::new(events_tx, marked.clone(), self.metrics.clone());

        let member_id = format!("{}-{}", group, Uuid::new_v4());
        let consumer: GroupConsumer = self
            .settings
            .group_client_config(&brokers.join(","), group)
            .set("client.id", &member_id)
            .build()
            .create_with_context(context)
            .map_err(|e| join_error(e.into()))?;

        let topic_names: Vec<&str> = topics.iter().map(String::as_str).collect();
        consumer
            .subscribe(&topic_names)
            .map_err(|e| join_error(e.into()))?;
        info!(group, member_id = %member_id, ?topics, "joined consumer group");

        Ok(KafkaConsumerGroup {
            consumer: Arc::new(consumer),
            events,
            marked,
            member_id,
            watermarks: HashMap::new(),
            settings: self.settings.clone(),
            metrics: self.metrics.clone(),
        })
    }
}

#[async_trait]
impl ConsumerGroupFactory for KafkaGroupFactory {
    async fn join(
        &self,
        group: &str,
        brokers: &[String],
        topics: &[String],
    ) -> Result<Box<dyn ConsumerGroup>, GroupError> {
        Ok(Box::new(self.connect(group, brokers, topics)?))
    }
}

/// A subscribed group member. Offsets marked by claims are committed on the commit interval,
/// when partitions are revoked, at the end of every session and on close.
///
/// High watermarks of the assigned partitions are refreshed on their own interval and attached
/// to every routed message for the lag gauge.
pub struct KafkaConsumerGroup {
    consumer: Arc<GroupConsumer>,
    events: mpsc::UnboundedReceiver<RebalanceEvent>,
    marked: Arc<MarkedOffsets>,
    member_id: String,
    watermarks: HashMap<Partition, i64>,
    settings: KafkaSettings,
    metrics: Arc<dyn MetricsSink>,
}

impl KafkaConsumerGroup {
    fn session(&self) -> KafkaSession {
        KafkaSession {
            consumer: self.consumer.clone(),
            marked: self.marked.clone(),
            member_id: self.member_id.clone(),
            metrics: self.metrics.clone(),
        }
    }

    fn current_assignment(&self) -> Vec<Partition> {
        match self.consumer.assignment() {
            Ok(list) => list.elements().into_iter().map(Partition::from).collect(),
            Err(e) => {
                warn!(error = %e, "failed to read current assignment");
                Vec::new()
            }
        }
    }

    async fn refresh_watermarks(&mut self) {
        let partitions = self.current_assignment();
        if partitions.is_empty() {
            self.watermarks.clear();
            return;
        }

        let consumer = self.consumer.clone();
        let fetched = spawn_blocking(move || {
            partitions
                .into_iter()
                .filter_map(|partition| {
                    let high = high_watermark(&consumer, &partition)?;
                    Some((partition, high))
                })
                .collect::<HashMap<_, _>>()
        })
        .await;

        match fetched {
            Ok(watermarks) => self.watermarks = watermarks,
            Err(e) => warn!(error = %e, "watermark refresh task failed"),
        }
    }

    fn claim_message<M: rdkafka::Message>(&self, message: &M) -> ClaimMessage {
        let partition = Partition::new(message.topic().to_string(), message.partition());
        let high_watermark = self.watermarks.get(&partition).copied();

        ClaimMessage {
            partition,
            offset: message.offset(),
            key: message.key().map(<[u8]>::to_vec),
            payload: message.payload().map(<[u8]>::to_vec),
            headers: headers_of(message),
            timestamp: timestamp_of(message),
            high_watermark,
        }
    }
}

#[async_trait]
impl ConsumerGroup for KafkaConsumerGroup {
    async fn consume(
        &mut self,
        shutdown: &CancellationToken,
        handler: Arc<dyn GroupHandler>,
    ) -> Result<(), GroupError> {
        let kafka_session = Arc::new(self.session());
        let session: Arc<dyn GroupSession> = kafka_session.clone();
        handler.setup(&session).await?;

        let mut router = ClaimRouter::new(
            handler.clone(),
            session.clone(),
            self.settings.channel_capacity,
        );
        for partition in self.current_assignment() {
            router.open(&partition);
        }

        let mut commit_tick = periodic(self.settings.commit_interval);
        let mut watermark_tick = periodic(self.settings.watermark_interval);
        self.refresh_watermarks().await;

        let consumer = self.consumer.clone();
        let mut stream = consumer.stream();
        let mut consecutive_errors = 0;

        let result = loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    debug!("session ending on shutdown");
                    break Ok(());
                }

                event = self.events.recv() => match event {
                    Some(RebalanceEvent::Revoked(partitions)) => {
                        info!(revoked = partitions.len(), "session ending on rebalance");
                        break Ok(());
                    }
                    Some(RebalanceEvent::Assigned(partitions)) => {
                        for partition in &partitions {
                            router.open(partition);
                        }
                    }
                    Some(RebalanceEvent::Failed(reason)) => {
                        let reason = anyhow::anyhow!("rebalance failed: {reason}");
                        break Err(GroupError::Session(reason));
                    }
                    None => {
                        let reason = anyhow::anyhow!("rebalance events stopped");
                        break Err(GroupError::Session(reason));
                    }
                },

                finished = router.next_finished(), if router.has_claims() => match finished {
                    Some(Ok(partition)) => debug!(partition = %partition, "claim ended"),
                    Some(Err(e)) => break Err(e),
                    None => {}
                },

                _ = next_tick(&mut commit_tick) => {
                    let committed = kafka_session
                        .commit_marked(CommitMode::Async, "interval")
                        .await;
                    if committed.is_err() {
                        debug!("marked offsets stay pending until the next commit");
                    }
                }

                _ = next_tick(&mut watermark_tick) => self.refresh_watermarks().await,

                next = stream.next() => match next {
                    Some(Ok(borrowed)) => {
                        consecutive_errors = 0;
                        let message = self.claim_message(&borrowed);
                        drop(borrowed);

                        let partition = message.partition.clone();
                        if !router.route(message).await {
                            debug!(partition = %partition, "claim stopped, message dropped");
                        }
                    }
                    Some(Err(e)) => {
                        consecutive_errors += 1;
                        let metrics = self.metrics.as_ref();
                        let fatal = handle_kafka_error(e, consecutive_errors, metrics).await;
                        if let Some(fatal) = fatal {
                            break Err(GroupError::Session(fatal.into()));
                        }
                    }
                    None => break Err(GroupError::Session(anyhow::anyhow!("message stream ended"))),
                },
            }
        };
        drop(stream);

        let claims = router.close().await;
        if let Err(e) = session.commit().await {
            warn!(error = %e, "failed to commit marked offsets at session end");
        }
        let cleaned = handler.cleanup(&session).await;

        result.and(claims).and(cleaned)
    }

    async fn close(&mut self) -> Result<(), GroupError> {
        if !self.marked.is_empty() {
            if let Err(e) = self.session().commit().await {
                warn!(error = %e, "failed to commit marked offsets on close");
            }
        }
        self.consumer.unsubscribe();
        info!(member_id = %self.member_id, "left consumer group");
        Ok(())
    }
}

fn high_watermark(consumer: &GroupConsumer, partition: &Partition) -> Option<i64> {
    let topic = partition.topic();
    match consumer.fetch_watermarks(topic, partition.partition_number(), WATERMARK_TIMEOUT) {
        Ok((_, high)) => Some(high),
        Err(e) => {
            debug!(partition = %partition, error = %e, "failed to fetch watermarks");
            None
        }
    }
}

struct KafkaSession {
    consumer: Arc<GroupConsumer>,
    marked: Arc<MarkedOffsets>,
    member_id: String,
    metrics: Arc<dyn MetricsSink>,
}

impl KafkaSession {
    async fn commit_with(&self, mode: CommitMode) -> Result<(), CommitError> {
        let offsets = self.marked.snapshot();
        if offsets.is_empty() {
            return Ok(());
        }

        let consumer = self.consumer.clone();
        spawn_blocking(move || {
            let list = commit_list(&offsets)?;
            consumer.commit(&list, mode)
        })
        .await
        .map_err(|e| CommitError(e.into()))?
        .map_err(|e| CommitError(e.into()))
    }

    async fn commit_marked(&self, mode: CommitMode, trigger: &str) -> Result<(), CommitError> {
        let result = self.commit_with(mode).await;
        let outcome = match &result {
            Ok(()) => "success",
            Err(e) => {
                warn!(error = %e, trigger, "offset commit failed");
                "error"
            }
        };
        let labels = [
            ("mode".to_string(), trigger.to_string()),
            ("outcome".to_string(), outcome.to_string()),
        ];
        self.metrics.increment(OFFSET_COMMITS, &labels, 1);
        result
    }
}

#[async_trait]
impl GroupSession for KafkaSession {
    fn member_id(&self) -> String {
        self.member_id.clone()
    }

    fn mark_offset(&self, partition: &Partition, next_offset: i64) {
        self.marked.mark(partition, next_offset);
    }

    async fn commit(&self) -> Result<(), CommitError> {
        self.commit_marked(CommitMode::Sync, "sync").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::Claim;
    use rdkafka::message::{OwnedMessage, Timestamp};

    struct DrainHandler;

    #[async_trait]
    impl GroupHandler for DrainHandler {
        async fn consume_claim(
            &self,
            _session: Arc<dyn GroupSession>,
            mut claim: Claim,
        ) -> Result<(), GroupError> {
            while claim.recv().await.is_some() {}
            Ok(())
        }
    }

    // librdkafka creates and subscribes clients without reaching a broker.
    fn offline_group(settings: KafkaSettings) -> KafkaConsumerGroup {
        KafkaGroupFactory::new(settings)
            .connect(
                "orders-group",
                &["localhost:1".to_string()],
                &["orders".to_string()],
            )
            .unwrap()
    }

    fn owned_message(partition: i32, offset: i64) -> OwnedMessage {
        OwnedMessage::new(
            Some(b"{}".to_vec()),
            None,
            "orders".to_string(),
            Timestamp::NotAvailable,
            partition,
            offset,
            None,
        )
    }

    #[tokio::test]
    async fn test_claim_messages_carry_the_cached_high_watermark() {
        let mut group = offline_group(KafkaSettings::default());
        group
            .watermarks
            .insert(Partition::new("orders".to_string(), 0), 20);

        let tracked = group.claim_message(&owned_message(0, 12));
        assert_eq!(tracked.partition, Partition::new("orders".to_string(), 0));
        assert_eq!(tracked.offset, 12);
        assert_eq!(tracked.high_watermark, Some(20));

        let untracked = group.claim_message(&owned_message(1, 3));
        assert_eq!(untracked.high_watermark, None);
    }

    #[tokio::test]
    async fn test_watermarks_are_dropped_without_an_assignment() {
        let mut group = offline_group(KafkaSettings::default());
        group
            .watermarks
            .insert(Partition::new("orders".to_string(), 0), 20);

        group.refresh_watermarks().await;
        assert!(group.watermarks.is_empty());
    }

    #[tokio::test]
    async fn test_zero_intervals_disable_periodic_work() {
        let mut group = offline_group(KafkaSettings {
            commit_interval: Duration::ZERO,
            watermark_interval: Duration::ZERO,
            ..KafkaSettings::default()
        });
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        group.consume(&shutdown, Arc::new(DrainHandler)).await.unwrap();
        group.close().await.unwrap();
    }
}
