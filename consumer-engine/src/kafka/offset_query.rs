use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common_kafka::Partition;
use rdkafka::consumer::{BaseConsumer, Consumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::{ClientConfig, Message as _, Offset, TopicPartitionList};
use tokio::task::spawn_blocking;
use uuid::Uuid;

use crate::kafka::{headers_of, timestamp_of, KafkaSettings};
use crate::offsets::{FetchedMessage, OffsetQuery, OffsetQueryError};

const BROKER_TIMEOUT: Duration = Duration::from_secs(10);

/// Answers watermark and single-message queries with assign-only consumers that never join
/// a group.
///
/// Metadata and watermarks go through one long-lived consumer. Every `message_at` call uses
/// a fresh consumer assigned at the requested offset, dropped once the message is read.
pub struct KafkaOffsetQuery {
    config: ClientConfig,
    consumer: Arc<BaseConsumer>,
    timeout: Duration,
}

impl KafkaOffsetQuery {
    pub fn new(brokers: &str, settings: &KafkaSettings) -> Result<Self, KafkaError> {
        let group = format!("offset-resolver-{}", Uuid::new_v4());
        let config = settings.assign_client_config(brokers, &group);
        let consumer: BaseConsumer = config.create()?;

        Ok(Self {
            config,
            consumer: Arc::new(consumer),
            timeout: BROKER_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn watermarks(
        &self,
        topic: &str,
        partition: i32,
    ) -> Result<(i64, i64), OffsetQueryError> {
        let consumer = self.consumer.clone();
        let owned = topic.to_string();
        let timeout = self.timeout;

        spawn_blocking(move || consumer.fetch_watermarks(&owned, partition, timeout))
            .await
            .map_err(|e| OffsetQueryError::Broker(e.into()))?
            .map_err(|e| OffsetQueryError::Broker(e.into()))
    }
}

fn is_out_of_range(err: &KafkaError) -> bool {
    matches!(
        err.rdkafka_error_code(),
        Some(RDKafkaErrorCode::OffsetOutOfRange) | Some(RDKafkaErrorCode::AutoOffsetReset)
    )
}

fn fetch_one(
    config: &ClientConfig,
    partition: &Partition,
    offset: i64,
    timeout: Duration,
) -> Result<FetchedMessage, OffsetQueryError> {
    let out_of_range = || OffsetQueryError::OutOfRange {
        partition: partition.clone(),
        offset,
    };

    let consumer: BaseConsumer = config
        .create()
        .map_err(|e| OffsetQueryError::Broker(e.into()))?;
    let mut assignment = TopicPartitionList::new();
    assignment
        .add_partition_offset(
            partition.topic(),
            partition.partition_number(),
            Offset::Offset(offset),
        )
        .map_err(|e| OffsetQueryError::Broker(e.into()))?;
    consumer
        .assign(&assignment)
        .map_err(|e| OffsetQueryError::Broker(e.into()))?;

    match consumer.poll(timeout) {
        Some(Ok(message)) => Ok(FetchedMessage {
            partition: partition.clone(),
            offset: message.offset(),
            key: message.key().map(<[u8]>::to_vec),
            payload: message.payload().map(<[u8]>::to_vec),
            headers: headers_of(&message),
            timestamp: timestamp_of(&message),
        }),
        Some(Err(e)) if is_out_of_range(&e) => Err(out_of_range()),
        Some(Err(e)) => Err(OffsetQueryError::Broker(e.into())),
        None => Err(OffsetQueryError::Broker(anyhow::anyhow!(
            "no message at offset {offset} of {partition} within {timeout:?}"
        ))),
    }
}

#[async_trait]
impl OffsetQuery for KafkaOffsetQuery {
    async fn partition_ids(&self, topic: &str) -> Result<Vec<i32>, OffsetQueryError> {
        let consumer = self.consumer.clone();
        let owned = topic.to_string();
        let timeout = self.timeout;

        let fetch = move || consumer.fetch_metadata(Some(owned.as_str()), timeout);
        let metadata = spawn_blocking(fetch)
            .await
            .map_err(|e| OffsetQueryError::Broker(e.into()))?
            .map_err(|e| OffsetQueryError::Broker(e.into()))?;

        let ids: Vec<i32> = metadata
            .topics()
            .iter()
            .filter(|t| t.name() == topic && t.error().is_none())
            .flat_map(|t| t.partitions().iter().map(|p| p.id()))
            .collect();
        if ids.is_empty() {
            return Err(OffsetQueryError::UnknownTopic(topic.to_string()));
        }
        Ok(ids)
    }

    async fn oldest_offset(&self, topic: &str, partition: i32) -> Result<i64, OffsetQueryError> {
        Ok(self.watermarks(topic, partition).await?.0)
    }

    async fn newest_offset(&self, topic: &str, partition: i32) -> Result<i64, OffsetQueryError> {
        Ok(self.watermarks(topic, partition).await?.1)
    }

    async fn message_at(
        &self,
        topic: &str,
        partition: i32,
        offset: i64,
    ) -> Result<FetchedMessage, OffsetQueryError> {
        let config = self.config.clone();
        let partition = Partition::new(topic.to_string(), partition);
        let timeout = self.timeout;

        spawn_blocking(move || fetch_one(&config, &partition, offset, timeout))
            .await
            .map_err(|e| OffsetQueryError::Broker(e.into()))?
    }
}
