use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use common_kafka::Partition;
use serde::de::DeserializeOwned;
use thiserror::Error;
use uuid::Uuid;

/// Header carrying the id that ties a message to the request that produced it.
pub const CORRELATION_ID_HEADER: &str = "correlation_id";

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("message has no payload")]
    Empty,
    #[error("failed to decode payload: {0}")]
    Json(#[from] serde_json::Error),
}

/// Processing context attached to every delivered message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageContext {
    correlation_id: String,
    headers: HashMap<String, String>,
    partition: Option<Partition>,
    offset: Option<i64>,
}

impl MessageContext {
    /// Build a context from message headers. The correlation id comes from
    /// [`CORRELATION_ID_HEADER`] when present and non-empty, otherwise a fresh UUID is used.
    pub fn from_headers(headers: HashMap<String, String>) -> Self {
        let correlation_id = headers
            .get(CORRELATION_ID_HEADER)
            .filter(|id| !id.is_empty())
            .cloned()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        Self {
            correlation_id,
            headers,
            partition: None,
            offset: None,
        }
    }

    pub fn with_position(mut self, partition: Partition, offset: i64) -> Self {
        self.partition = Some(partition);
        self.offset = Some(offset);
        self
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    pub fn partition(&self) -> Option<&Partition> {
        self.partition.as_ref()
    }

    pub fn offset(&self) -> Option<i64> {
        self.offset
    }
}

/// Broker-side settlement of one message.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> anyhow::Result<()>;
    async fn nack(&self) -> anyhow::Result<()>;
}

/// A single delivered message. `ack` and `nack` consume it, so it is settled at most once.
pub struct Message {
    context: MessageContext,
    key: Option<Vec<u8>>,
    payload: Option<Vec<u8>>,
    acker: Box<dyn Acknowledger>,
}

impl Message {
    pub fn new(
        context: MessageContext,
        key: Option<Vec<u8>>,
        payload: Option<Vec<u8>>,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            context,
            key,
            payload,
            acker,
        }
    }

    pub fn context(&self) -> &MessageContext {
        &self.context
    }

    pub fn key(&self) -> Option<&[u8]> {
        self.key.as_deref()
    }

    pub fn payload(&self) -> Option<&[u8]> {
        self.payload.as_deref()
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, DecodeError> {
        decode_payload(self.payload.as_deref())
    }

    pub async fn ack(self) -> anyhow::Result<()> {
        self.acker.ack().await
    }

    pub async fn nack(self) -> anyhow::Result<()> {
        self.acker.nack().await
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("context", &self.context)
            .field("key_len", &self.key.as_ref().map(Vec::len))
            .field("payload_len", &self.payload.as_ref().map(Vec::len))
            .finish()
    }
}

pub(crate) fn decode_payload<T: DeserializeOwned>(
    payload: Option<&[u8]>,
) -> Result<T, DecodeError> {
    match payload {
        Some(bytes) if !bytes.is_empty() => Ok(serde_json::from_slice(bytes)?),
        _ => Err(DecodeError::Empty),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    struct Counts {
        acks: AtomicUsize,
        nacks: AtomicUsize,
    }

    struct CountingAcker(Arc<Counts>);

    #[async_trait]
    impl Acknowledger for CountingAcker {
        async fn ack(&self) -> anyhow::Result<()> {
            self.0.acks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn nack(&self) -> anyhow::Result<()> {
            self.0.nacks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Deserialize, Debug, PartialEq)]
    struct Order {
        id: u32,
    }

    #[test]
    fn test_correlation_id_taken_from_headers() {
        let headers = HashMap::from([(CORRELATION_ID_HEADER.to_string(), "abc".to_string())]);
        let context = MessageContext::from_headers(headers);

        assert_eq!(context.correlation_id(), "abc");
        assert_eq!(context.header(CORRELATION_ID_HEADER), Some("abc"));
    }

    #[test]
    fn test_missing_correlation_id_gets_a_uuid() {
        let first = MessageContext::from_headers(HashMap::new());
        let second = MessageContext::from_headers(HashMap::from([(
            CORRELATION_ID_HEADER.to_string(),
            String::new(),
        )]));

        assert!(Uuid::parse_str(first.correlation_id()).is_ok());
        assert!(Uuid::parse_str(second.correlation_id()).is_ok());
        assert_ne!(first.correlation_id(), second.correlation_id());
    }

    #[tokio::test]
    async fn test_decode_and_settle() {
        let counts = Arc::new(Counts::default());
        let message = Message::new(
            MessageContext::from_headers(HashMap::new())
                .with_position(Partition::new("t".to_string(), 2), 7),
            None,
            Some(br#"{"id": 4}"#.to_vec()),
            Box::new(CountingAcker(counts.clone())),
        );

        assert_eq!(message.decode::<Order>().unwrap(), Order { id: 4 });
        assert_eq!(message.context().offset(), Some(7));
        message.ack().await.unwrap();

        assert_eq!(counts.acks.load(Ordering::SeqCst), 1);
        assert_eq!(counts.nacks.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_decode_errors() {
        assert!(matches!(
            decode_payload::<Order>(None),
            Err(DecodeError::Empty)
        ));
        assert!(matches!(
            decode_payload::<Order>(Some(b"not json")),
            Err(DecodeError::Json(_))
        ));
    }
}
