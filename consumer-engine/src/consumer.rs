use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::ConsumerError;
use crate::message::Message;

/// The two channels a consumer feeds while it is consuming.
///
/// Both are closed by the consumer when it stops. A closed message channel while the
/// supervisor is still running ends the attempt.
pub struct Delivery {
    pub messages: mpsc::Receiver<Message>,
    pub errors: mpsc::Receiver<ConsumerError>,
}

/// A connection to a message source. Created fresh for each connect attempt.
#[async_trait]
pub trait Consumer: Send {
    /// Start delivering. Messages stop flowing once `shutdown` is cancelled.
    async fn consume(&mut self, shutdown: CancellationToken) -> Result<Delivery, ConsumerError>;

    /// Release the connection. Called exactly once per created consumer.
    async fn close(&mut self) -> Result<(), ConsumerError>;
}

#[async_trait]
pub trait ConsumerFactory: Send + Sync {
    async fn create(&self) -> Result<Box<dyn Consumer>, ConsumerError>;

    /// Whether messages from this source may be acknowledged in a different order than
    /// they were delivered. Required for concurrent processing.
    fn tolerates_out_of_order_acks(&self) -> bool {
        false
    }
}

/// Application callback for the single-message path.
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(&self, message: &Message) -> anyhow::Result<()>;
}
