use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use common_kafka::Partition;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{CommitError, GroupError};
use crate::group::batch::ClaimMessage;

/// One generation of group membership, from one rebalance to the next.
#[async_trait]
pub trait GroupSession: Send + Sync {
    fn member_id(&self) -> String;

    /// Record `next_offset` as the position to resume `partition` from. Takes effect on the
    /// next commit. Offsets lower than one already marked are ignored.
    fn mark_offset(&self, partition: &Partition, next_offset: i64);

    /// Commit every marked offset now.
    async fn commit(&self) -> Result<(), CommitError>;
}

/// The messages of one partition assigned to this member for the length of a session.
#[derive(Debug)]
pub struct Claim {
    partition: Partition,
    messages: mpsc::Receiver<ClaimMessage>,
}

impl Claim {
    pub fn new(partition: Partition, messages: mpsc::Receiver<ClaimMessage>) -> Self {
        Self {
            partition,
            messages,
        }
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    /// Next message, or `None` once the session is over.
    pub async fn recv(&mut self) -> Option<ClaimMessage> {
        self.messages.recv().await
    }
}

/// Callbacks a consumer group drives during a session.
#[async_trait]
pub trait GroupHandler: Send + Sync {
    async fn setup(&self, _session: &Arc<dyn GroupSession>) -> Result<(), GroupError> {
        Ok(())
    }

    async fn cleanup(&self, _session: &Arc<dyn GroupSession>) -> Result<(), GroupError> {
        Ok(())
    }

    /// Consume one claim until it is exhausted. Runs on its own task, concurrently with
    /// the claims of other partitions.
    async fn consume_claim(
        &self,
        session: Arc<dyn GroupSession>,
        claim: Claim,
    ) -> Result<(), GroupError>;
}

/// A joined consumer-group client.
#[async_trait]
pub trait ConsumerGroup: Send {
    /// Run a single session: `setup`, one `consume_claim` per assigned partition, `cleanup`.
    /// Returns when the session ends through a rebalance, `shutdown` or an error.
    async fn consume(
        &mut self,
        shutdown: &CancellationToken,
        handler: Arc<dyn GroupHandler>,
    ) -> Result<(), GroupError>;

    async fn close(&mut self) -> Result<(), GroupError>;
}

#[async_trait]
pub trait ConsumerGroupFactory: Send + Sync {
    async fn join(
        &self,
        group: &str,
        brokers: &[String],
        topics: &[String],
    ) -> Result<Box<dyn ConsumerGroup>, GroupError>;
}

/// Fans the messages of a session out to one claim task per partition.
///
/// Used by `ConsumerGroup` implementations: route every fetched message, watch
/// `next_finished` for claims that stop, and `close` when the session ends.
pub struct ClaimRouter {
    handler: Arc<dyn GroupHandler>,
    session: Arc<dyn GroupSession>,
    capacity: usize,
    claims: HashMap<Partition, mpsc::Sender<ClaimMessage>>,
    tasks: JoinSet<(Partition, Result<(), GroupError>)>,
}

impl ClaimRouter {
    pub fn new(
        handler: Arc<dyn GroupHandler>,
        session: Arc<dyn GroupSession>,
        capacity: usize,
    ) -> Self {
        Self {
            handler,
            session,
            capacity: capacity.max(1),
            claims: HashMap::new(),
            tasks: JoinSet::new(),
        }
    }

    pub fn session(&self) -> &Arc<dyn GroupSession> {
        &self.session
    }

    /// Start the claim for `partition` unless it is already running.
    pub fn open(&mut self, partition: &Partition) {
        if self.claims.contains_key(partition) {
            return;
        }

        let (tx, rx) = mpsc::channel(self.capacity);
        let claim = Claim::new(partition.clone(), rx);
        let handler = self.handler.clone();
        let session = self.session.clone();
        let owned = partition.clone();

        debug!(partition = %partition, "opening claim");
        self.tasks.spawn(async move {
            let result = handler.consume_claim(session, claim).await;
            (owned, result)
        });
        self.claims.insert(partition.clone(), tx);
    }

    /// Deliver `message` to its partition's claim, opening the claim on first use.
    /// Waits while the claim is busy. Returns false if the claim has already stopped.
    pub async fn route(&mut self, message: ClaimMessage) -> bool {
        self.open(&message.partition);
        let Some(tx) = self.claims.get(&message.partition) else {
            return false;
        };
        tx.send(message).await.is_ok()
    }

    pub fn has_claims(&self) -> bool {
        !self.tasks.is_empty()
    }

    /// Wait for the next claim task to return: the partition of a claim that ended cleanly,
    /// or the error it failed with. `None` when no claims are running.
    pub async fn next_finished(&mut self) -> Option<Result<Partition, GroupError>> {
        let joined = self.tasks.join_next().await?;
        Some(match joined {
            Ok((partition, result)) => {
                self.claims.remove(&partition);
                result.map(|()| partition)
            }
            Err(err) => {
                warn!(error = %err, "claim task did not complete");
                Err(GroupError::Session(err.into()))
            }
        })
    }

    /// End every claim and wait for their tasks. Returns the first claim error.
    pub async fn close(&mut self) -> Result<(), GroupError> {
        self.claims.clear();

        let mut first_error = None;
        while let Some(finished) = self.next_finished().await {
            if let Err(err) = finished {
                debug!(error = %err, "claim ended with error");
                first_error.get_or_insert(err);
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
