//! Mapping a point in time to a starting offset per partition.
use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common_kafka::Partition;
use thiserror::Error;

mod resolver;

pub use resolver::{OffsetResolver, ResolveError};

#[derive(Error, Debug)]
pub enum OffsetQueryError {
    /// The offset is below the log start or at/after the end. Recoverable during a search.
    #[error("offset {offset} is out of range for {partition}")]
    OutOfRange { partition: Partition, offset: i64 },
    #[error("topic {0} does not exist")]
    UnknownTopic(String),
    #[error("broker query failed: {0}")]
    Broker(#[source] anyhow::Error),
}

/// A single message read back from a partition.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedMessage {
    pub partition: Partition,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Option<Vec<u8>>,
    pub headers: HashMap<String, String>,
    pub timestamp: Option<DateTime<Utc>>,
}

/// Broker operations the resolver needs.
#[async_trait]
pub trait OffsetQuery: Send + Sync {
    async fn partition_ids(&self, topic: &str) -> Result<Vec<i32>, OffsetQueryError>;

    /// First offset still present in the log.
    async fn oldest_offset(&self, topic: &str, partition: i32) -> Result<i64, OffsetQueryError>;

    /// Offset the next produced message will get.
    async fn newest_offset(&self, topic: &str, partition: i32) -> Result<i64, OffsetQueryError>;

    async fn message_at(
        &self,
        topic: &str,
        partition: i32,
        offset: i64,
    ) -> Result<FetchedMessage, OffsetQueryError>;
}

/// Reads the time a message is positioned by.
pub trait TimestampExtractor: Send + Sync {
    fn extract(&self, message: &FetchedMessage) -> anyhow::Result<DateTime<Utc>>;
}

impl<F> TimestampExtractor for F
where
    F: Fn(&FetchedMessage) -> anyhow::Result<DateTime<Utc>> + Send + Sync,
{
    fn extract(&self, message: &FetchedMessage) -> anyhow::Result<DateTime<Utc>> {
        self(message)
    }
}

/// Uses the timestamp the broker stored with the message.
#[derive(Debug, Default, Clone, Copy)]
pub struct BrokerTimestamp;

impl TimestampExtractor for BrokerTimestamp {
    fn extract(&self, message: &FetchedMessage) -> anyhow::Result<DateTime<Utc>> {
        message.timestamp.ok_or_else(|| {
            anyhow::anyhow!(
                "message at offset {} of {} has no timestamp",
                message.offset,
                message.partition
            )
        })
    }
}
