use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common_kafka::Partition;
use serde::de::DeserializeOwned;

use crate::error::CommitError;
use crate::group::session::GroupSession;
use crate::message::{decode_payload, DecodeError, MessageContext};

/// A raw message as delivered to a partition claim.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimMessage {
    pub partition: Partition,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Option<Vec<u8>>,
    pub headers: HashMap<String, String>,
    pub timestamp: Option<DateTime<Utc>>,
    /// Last refreshed high watermark of the partition, if known.
    pub high_watermark: Option<i64>,
}

impl ClaimMessage {
    pub fn new(partition: Partition, offset: i64, payload: Option<Vec<u8>>) -> Self {
        Self {
            partition,
            offset,
            key: None,
            payload,
            headers: HashMap::new(),
            timestamp: None,
            high_watermark: None,
        }
    }
}

/// One message of a batch, with its processing context.
#[derive(Debug, Clone)]
pub struct BatchMessage {
    context: MessageContext,
    inner: ClaimMessage,
}

impl BatchMessage {
    fn new(inner: ClaimMessage) -> Self {
        let context = MessageContext::from_headers(inner.headers.clone())
            .with_position(inner.partition.clone(), inner.offset);
        Self { context, inner }
    }

    pub fn context(&self) -> &MessageContext {
        &self.context
    }

    pub fn offset(&self) -> i64 {
        self.inner.offset
    }

    pub fn key(&self) -> Option<&[u8]> {
        self.inner.key.as_deref()
    }

    pub fn payload(&self) -> Option<&[u8]> {
        self.inner.payload.as_deref()
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.inner.timestamp
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, DecodeError> {
        decode_payload(self.inner.payload.as_deref())
    }
}

/// Messages from a single partition, in delivery order, handed to a `BatchProcessor` as a unit.
pub struct Batch {
    partition: Partition,
    messages: Vec<BatchMessage>,
    session: Arc<dyn GroupSession>,
}

impl Batch {
    pub(crate) fn new(
        partition: Partition,
        messages: Vec<ClaimMessage>,
        session: Arc<dyn GroupSession>,
    ) -> Self {
        Self {
            partition,
            messages: messages.into_iter().map(BatchMessage::new).collect(),
            session,
        }
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn messages(&self) -> &[BatchMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn member_id(&self) -> String {
        self.session.member_id()
    }

    pub fn first_offset(&self) -> Option<i64> {
        self.messages.first().map(BatchMessage::offset)
    }

    pub fn last_offset(&self) -> Option<i64> {
        self.messages.last().map(BatchMessage::offset)
    }

    // Marks the offset after every message, so the next session resumes past the batch.
    pub(crate) fn mark_processed(&self) {
        for message in &self.messages {
            self.session
                .mark_offset(&self.partition, message.offset() + 1);
        }
    }

    pub(crate) async fn commit(&self) -> Result<(), CommitError> {
        self.session.commit().await
    }
}

impl std::fmt::Debug for Batch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Batch")
            .field("partition", &self.partition)
            .field("len", &self.messages.len())
            .field("first_offset", &self.first_offset())
            .field("last_offset", &self.last_offset())
            .finish()
    }
}

/// Application callback for the batch path.
#[async_trait]
pub trait BatchProcessor: Send + Sync {
    async fn process_batch(&self, batch: &Batch) -> anyhow::Result<()>;
}
