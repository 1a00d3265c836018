//! rdkafka implementations of the consumer, consumer-group and offset-query contracts.
use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use common_kafka::config::{ConsumerConfig, KafkaConfig};
use common_kafka::ConsumerConfigBuilder;
use rdkafka::message::Headers;
use rdkafka::ClientConfig;

mod consumer;
mod context;
mod errors;
mod group;
mod offset_query;

pub use consumer::{KafkaConsumer, KafkaConsumerFactory};
pub use group::{KafkaConsumerGroup, KafkaGroupFactory};
pub use offset_query::KafkaOffsetQuery;

/// Client settings shared by the Kafka adapters.
#[derive(Debug, Clone)]
pub struct KafkaSettings {
    pub tls: bool,
    /// `auto.offset.reset` for partitions without a committed offset.
    pub offset_reset: String,
    /// How often stored or marked offsets are committed in the background. Zero disables
    /// periodic commits; offsets are then committed on rebalance, session end and close.
    pub commit_interval: Duration,
    /// How often the group adapter refreshes high watermarks for the lag gauge. Zero disables it.
    pub watermark_interval: Duration,
    /// Messages buffered per claim, or per consumer on the single-message path.
    pub channel_capacity: usize,
}

impl Default for KafkaSettings {
    fn default() -> Self {
        Self {
            tls: false,
            offset_reset: "earliest".to_string(),
            commit_interval: Duration::from_secs(5),
            watermark_interval: Duration::from_secs(10),
            channel_capacity: 256,
        }
    }
}

impl KafkaSettings {
    pub fn from_config(kafka: &KafkaConfig, consumer: &ConsumerConfig) -> Self {
        Self {
            tls: kafka.kafka_tls,
            offset_reset: consumer.kafka_consumer_offset_reset.clone(),
            commit_interval: Duration::from_millis(consumer.kafka_consumer_commit_interval_ms),
            ..Self::default()
        }
    }

    pub(crate) fn group_client_config(&self, brokers: &str, group: &str) -> ConsumerConfigBuilder {
        ConsumerConfigBuilder::for_group_consumer(brokers, group)
            .with_tls(self.tls)
            .with_offset_reset(&self.offset_reset)
    }

    pub(crate) fn assign_client_config(&self, brokers: &str, group: &str) -> ClientConfig {
        ConsumerConfigBuilder::for_assign_consumer(brokers, group)
            .with_tls(self.tls)
            .build()
    }
}

pub(crate) fn headers_of<M: rdkafka::Message>(message: &M) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    if let Some(borrowed) = message.headers() {
        for header in borrowed.iter() {
            if let Some(value) = header.value {
                headers.insert(
                    header.key.to_string(),
                    String::from_utf8_lossy(value).into_owned(),
                );
            }
        }
    }
    headers
}

pub(crate) fn timestamp_of<M: rdkafka::Message>(message: &M) -> Option<DateTime<Utc>> {
    message
        .timestamp()
        .to_millis()
        .and_then(DateTime::from_timestamp_millis)
}
