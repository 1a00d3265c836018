use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use common_kafka::Partition;
use common_metrics::MetricsSink;
use futures::StreamExt;
use rdkafka::consumer::{Consumer as _, StreamConsumer};
use rdkafka::{Message as _, Offset, TopicPartitionList};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::consumer::{Consumer, ConsumerFactory, Delivery};
use crate::error::ConsumerError;
use crate::kafka::errors::handle_kafka_error;
use crate::kafka::offset_query::KafkaOffsetQuery;
use crate::kafka::{headers_of, KafkaSettings};
use crate::message::{Acknowledger, Message, MessageContext};
use crate::offsets::{BrokerTimestamp, OffsetResolver, TimestampExtractor};

// Start from offsets resolved against a point in time instead of the committed ones.
struct ConsumeSince {
    ago: Duration,
    resolve_timeout: Duration,
    fetch_timeout: Duration,
    extractor: Arc<dyn TimestampExtractor>,
}

/// Creates single-message Kafka consumers for a `Supervisor`.
///
/// Consumers join `group` and subscribe to `topics`, unless `consume_since` is set, in which
/// case every partition is assigned directly at the offset matching that point in time.
pub struct KafkaConsumerFactory {
    brokers: String,
    group: String,
    topics: Vec<String>,
    settings: KafkaSettings,
    since: Option<ConsumeSince>,
    metrics: Arc<dyn MetricsSink>,
}

impl KafkaConsumerFactory {
    pub fn new(
        brokers: &[String],
        group: &str,
        topics: Vec<String>,
        settings: KafkaSettings,
    ) -> Self {
        Self {
            brokers: brokers.join(","),
            group: group.to_string(),
            topics,
            settings,
            since: None,
            metrics: common_metrics::noop(),
        }
    }

    /// Start `ago` before the time each consumer is created, resolved from broker timestamps.
    pub fn consume_since(
        mut self,
        ago: Duration,
        resolve_timeout: Duration,
        fetch_timeout: Duration,
    ) -> Self {
        self.since = Some(ConsumeSince {
            ago,
            resolve_timeout,
            fetch_timeout,
            extractor: Arc::new(BrokerTimestamp),
        });
        self
    }

    /// Replace the broker timestamp with one read from the message. Only used with `consume_since`.
    pub fn with_extractor(mut self, extractor: Arc<dyn TimestampExtractor>) -> Self {
        if let Some(since) = self.since.as_mut() {
            since.extractor = extractor;
        }
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    async fn assignment(&self, since: &ConsumeSince) -> Result<TopicPartitionList, ConsumerError> {
        let ago = chrono::Duration::from_std(since.ago)
            .map_err(|e| ConsumerError::Create(e.into()))?;
        let at = Utc::now() - ago;

        let query = KafkaOffsetQuery::new(&self.brokers, &self.settings)
            .map_err(|e| ConsumerError::Create(e.into()))?;
        let resolver = OffsetResolver::new(Arc::new(query))
            .with_fetch_timeout(since.fetch_timeout)
            .with_metrics(self.metrics.clone());

        let mut assignment = TopicPartitionList::new();
        for topic in &self.topics {
            let offsets = resolver
                .resolve_offsets(topic, at, since.extractor.clone(), since.resolve_timeout)
                .await
                .map_err(|e| ConsumerError::Create(e.into()))?;

            for (partition, offset) in offsets {
                assignment
                    .add_partition_offset(topic, partition, Offset::Offset(offset))
                    .map_err(|e| ConsumerError::Create(e.into()))?;
            }
        }
        Ok(assignment)
    }
}

#[async_trait]
impl ConsumerFactory for KafkaConsumerFactory {
    async fn create(&self) -> Result<Box<dyn Consumer>, ConsumerError> {
        let client_id = format!("{}-{}", self.group, Uuid::new_v4());
        let consumer: StreamConsumer = self
            .settings
            .group_client_config(&self.brokers, &self.group)
            .with_auto_commit_interval_ms(self.settings.commit_interval.as_millis() as u64)
            .set("client.id", &client_id)
            .build()
            .create()
            .map_err(|e| ConsumerError::Create(e.into()))?;

        match &self.since {
            None => {
                let topics: Vec<&str> = self.topics.iter().map(String::as_str).collect();
                consumer
                    .subscribe(&topics)
                    .map_err(|e| ConsumerError::Create(e.into()))?;
                info!(client_id = %client_id, topics = ?self.topics, "subscribed kafka consumer");
            }
            Some(since) => {
                let assignment = self.assignment(since).await?;
                consumer
                    .assign(&assignment)
                    .map_err(|e| ConsumerError::Create(e.into()))?;
                info!(
                    client_id = %client_id,
                    partitions = assignment.count(),
                    "assigned kafka consumer from resolved offsets"
                );
            }
        }

        Ok(Box::new(KafkaConsumer {
            consumer: Arc::new(consumer),
            assigned: self.since.is_some(),
            pump: None,
            capacity: self.settings.channel_capacity,
            metrics: self.metrics.clone(),
        }))
    }
}

/// A single-message Kafka consumer. Acks store the offset for the next background commit,
/// nacks leave it unstored.
pub struct KafkaConsumer {
    consumer: Arc<StreamConsumer>,
    /// Assigned at resolved offsets rather than subscribed to the group's topics.
    assigned: bool,
    pump: Option<JoinHandle<()>>,
    capacity: usize,
    metrics: Arc<dyn MetricsSink>,
}

#[async_trait]
impl Consumer for KafkaConsumer {
    async fn consume(&mut self, shutdown: CancellationToken) -> Result<Delivery, ConsumerError> {
        if self.pump.is_some() {
            return Err(ConsumerError::Consume(anyhow::anyhow!(
                "consumer is already consuming"
            )));
        }

        let (messages_tx, messages) = mpsc::channel(self.capacity.max(1));
        let (errors_tx, errors) = mpsc::channel(1);
        self.pump = Some(tokio::spawn(pump(
            self.consumer.clone(),
            messages_tx,
            errors_tx,
            shutdown,
            self.metrics.clone(),
        )));

        Ok(Delivery { messages, errors })
    }

    async fn close(&mut self) -> Result<(), ConsumerError> {
        if let Some(pump) = self.pump.take() {
            pump.abort();
            if let Err(err) = pump.await {
                if !err.is_cancelled() {
                    return Err(ConsumerError::Close(err.into()));
                }
            }
        }
        if self.assigned {
            self.consumer
                .unassign()
                .map_err(|e| ConsumerError::Close(e.into()))?;
        } else {
            self.consumer.unsubscribe();
        }
        debug!(assigned = self.assigned, "kafka consumer closed");
        Ok(())
    }
}

async fn pump(
    consumer: Arc<StreamConsumer>,
    messages: mpsc::Sender<Message>,
    errors: mpsc::Sender<ConsumerError>,
    shutdown: CancellationToken,
    metrics: Arc<dyn MetricsSink>,
) {
    let handle = Arc::downgrade(&consumer);
    let mut stream = consumer.stream();
    let mut consecutive_errors = 0;

    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = stream.next() => next,
        };

        match next {
            Some(Ok(borrowed)) => {
                consecutive_errors = 0;
                let partition = Partition::new(borrowed.topic().to_string(), borrowed.partition());
                let context = MessageContext::from_headers(headers_of(&borrowed))
                    .with_position(partition.clone(), borrowed.offset());
                let message = Message::new(
                    context,
                    borrowed.key().map(<[u8]>::to_vec),
                    borrowed.payload().map(<[u8]>::to_vec),
                    Box::new(KafkaAcker {
                        handle: handle.clone(),
                        partition,
                        offset: borrowed.offset(),
                    }),
                );
                drop(borrowed);

                if messages.send(message).await.is_err() {
                    break;
                }
            }
            Some(Err(err)) => {
                consecutive_errors += 1;
                let fatal = handle_kafka_error(err, consecutive_errors, metrics.as_ref()).await;
                if let Some(fatal) = fatal {
                    if errors.send(ConsumerError::Runtime(fatal.into())).await.is_err() {
                        debug!("kafka error dropped, nobody is listening");
                    }
                    break;
                }
            }
            None => break,
        }
    }
}

struct KafkaAcker {
    handle: Weak<StreamConsumer>,
    partition: Partition,
    offset: i64,
}

#[async_trait]
impl Acknowledger for KafkaAcker {
    async fn ack(&self) -> anyhow::Result<()> {
        let consumer = self
            .handle
            .upgrade()
            .ok_or_else(|| anyhow::anyhow!("consumer closed before ack of {}", self.partition))?;
        // The stored offset is the next one to consume.
        consumer.store_offset(
            self.partition.topic(),
            self.partition.partition_number(),
            self.offset + 1,
        )?;
        Ok(())
    }

    async fn nack(&self) -> anyhow::Result<()> {
        warn!(
            partition = %self.partition,
            offset = self.offset,
            "message nacked, offset left unstored"
        );
        Ok(())
    }
}
