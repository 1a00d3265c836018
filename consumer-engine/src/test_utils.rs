//! In-memory implementations of the consumer, group and offset-query contracts, shared by
//! unit and integration tests.
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common_kafka::Partition;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::consumer::{Consumer, ConsumerFactory, Delivery, Processor};
use crate::error::{CommitError, ConsumerError, GroupError};
use crate::group::{
    Batch, BatchProcessor, ClaimMessage, ClaimRouter, ConsumerGroup, ConsumerGroupFactory,
    GroupHandler, GroupSession,
};
use crate::message::{Acknowledger, Message, MessageContext};
use crate::offsets::{FetchedMessage, OffsetQuery, OffsetQueryError};

/// Seconds since the epoch as a UTC timestamp.
pub fn timestamp(seconds: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(seconds, 0).unwrap()
}

fn text(bytes: Option<&[u8]>) -> String {
    String::from_utf8_lossy(bytes.unwrap_or_default()).into_owned()
}

// ==== Single-message consumers ====

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AfterDelivery {
    /// Keep the channels open until shutdown.
    Hold,
    /// Close the message channel once every message was taken.
    Close,
    /// Report a consumer error once every message was taken.
    Error,
}

/// What one `FakeConsumerFactory::create` call produces.
#[derive(Debug, Clone)]
pub struct FakeAttempt {
    fail_create: bool,
    fail_consume: bool,
    payloads: Vec<String>,
    after: AfterDelivery,
    fail_acks: bool,
}

impl FakeAttempt {
    fn delivering(payloads: &[&str], after: AfterDelivery) -> Self {
        Self {
            fail_create: false,
            fail_consume: false,
            payloads: payloads.iter().map(|p| p.to_string()).collect(),
            after,
            fail_acks: false,
        }
    }

    pub fn fail_create() -> Self {
        Self {
            fail_create: true,
            ..Self::hold(&[])
        }
    }

    pub fn fail_consume() -> Self {
        Self {
            fail_consume: true,
            ..Self::hold(&[])
        }
    }

    /// Deliver `payloads`, then stay connected until shutdown.
    pub fn hold(payloads: &[&str]) -> Self {
        Self::delivering(payloads, AfterDelivery::Hold)
    }

    /// Deliver `payloads`, then close the message channel.
    pub fn close(payloads: &[&str]) -> Self {
        Self::delivering(payloads, AfterDelivery::Close)
    }

    /// Deliver `payloads`, then report a consumer error.
    pub fn error(payloads: &[&str]) -> Self {
        Self::delivering(payloads, AfterDelivery::Error)
    }

    /// Every ack and nack of this attempt fails.
    pub fn failing_acks(mut self) -> Self {
        self.fail_acks = true;
        self
    }
}

/// Everything the fake consumers were asked to do.
#[derive(Debug, Default)]
pub struct ConsumerLog {
    creates: Mutex<Vec<Instant>>,
    closes: AtomicUsize,
    acks: Mutex<Vec<String>>,
    nacks: Mutex<Vec<String>>,
}

impl ConsumerLog {
    pub fn creates(&self) -> usize {
        self.creates.lock().unwrap().len()
    }

    /// When each `create` call happened.
    pub fn create_instants(&self) -> Vec<Instant> {
        self.creates.lock().unwrap().clone()
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Payloads of acknowledged messages, in settlement order. Failed acks are included.
    pub fn acks(&self) -> Vec<String> {
        self.acks.lock().unwrap().clone()
    }

    pub fn nacks(&self) -> Vec<String> {
        self.nacks.lock().unwrap().clone()
    }
}

/// Plays back one scripted `FakeAttempt` per `create` call. Once the script runs out every
/// attempt connects and waits for shutdown without delivering anything.
pub struct FakeConsumerFactory {
    attempts: Mutex<VecDeque<FakeAttempt>>,
    log: Arc<ConsumerLog>,
    out_of_order: bool,
}

impl FakeConsumerFactory {
    pub fn new(attempts: Vec<FakeAttempt>) -> Self {
        Self {
            attempts: Mutex::new(attempts.into()),
            log: Arc::new(ConsumerLog::default()),
            out_of_order: false,
        }
    }

    pub fn tolerate_out_of_order_acks(mut self) -> Self {
        self.out_of_order = true;
        self
    }

    pub fn log(&self) -> &ConsumerLog {
        &self.log
    }
}

#[async_trait]
impl ConsumerFactory for FakeConsumerFactory {
    async fn create(&self) -> Result<Box<dyn Consumer>, ConsumerError> {
        self.log.creates.lock().unwrap().push(Instant::now());
        let attempt = self
            .attempts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| FakeAttempt::hold(&[]));

        if attempt.fail_create {
            return Err(ConsumerError::Create(anyhow::anyhow!("broker unreachable")));
        }
        Ok(Box::new(FakeConsumer {
            attempt,
            log: self.log.clone(),
            feeder: None,
        }))
    }

    fn tolerates_out_of_order_acks(&self) -> bool {
        self.out_of_order
    }
}

struct FakeConsumer {
    attempt: FakeAttempt,
    log: Arc<ConsumerLog>,
    feeder: Option<JoinHandle<()>>,
}

#[async_trait]
impl Consumer for FakeConsumer {
    async fn consume(&mut self, shutdown: CancellationToken) -> Result<Delivery, ConsumerError> {
        if self.attempt.fail_consume {
            return Err(ConsumerError::Consume(anyhow::anyhow!("subscription rejected")));
        }

        let (messages_tx, messages) = mpsc::channel(self.attempt.payloads.len().max(1));
        let (errors_tx, errors) = mpsc::channel(1);
        for (offset, payload) in self.attempt.payloads.iter().enumerate() {
            let context = MessageContext::from_headers(HashMap::new())
                .with_position(Partition::new("fake".to_string(), 0), offset as i64);
            let acker = FakeAcker {
                payload: payload.clone(),
                log: self.log.clone(),
                fail: self.attempt.fail_acks,
            };
            let body = Some(payload.clone().into_bytes());
            let message = Message::new(context, None, body, Box::new(acker));
            messages_tx.try_send(message).unwrap();
        }

        let after = self.attempt.after;
        self.feeder = Some(tokio::spawn(async move {
            if after == AfterDelivery::Close {
                drop(messages_tx);
                return;
            }
            if after == AfterDelivery::Error {
                while messages_tx.capacity() < messages_tx.max_capacity() {
                    if messages_tx.is_closed() {
                        return;
                    }
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
                let err = ConsumerError::Runtime(anyhow::anyhow!("connection reset"));
                if errors_tx.send(err).await.is_err() {
                    return;
                }
            }
            shutdown.cancelled().await;
            drop(messages_tx);
            drop(errors_tx);
        }));

        Ok(Delivery { messages, errors })
    }

    async fn close(&mut self) -> Result<(), ConsumerError> {
        self.log.closes.fetch_add(1, Ordering::SeqCst);
        if let Some(feeder) = self.feeder.take() {
            feeder.abort();
        }
        Ok(())
    }
}

struct FakeAcker {
    payload: String,
    log: Arc<ConsumerLog>,
    fail: bool,
}

#[async_trait]
impl Acknowledger for FakeAcker {
    async fn ack(&self) -> anyhow::Result<()> {
        self.log.acks.lock().unwrap().push(self.payload.clone());
        if self.fail {
            anyhow::bail!("ack rejected");
        }
        Ok(())
    }

    async fn nack(&self) -> anyhow::Result<()> {
        self.log.nacks.lock().unwrap().push(self.payload.clone());
        if self.fail {
            anyhow::bail!("nack rejected");
        }
        Ok(())
    }
}

type ProcessFn = dyn Fn(&Message) -> anyhow::Result<()> + Send + Sync;

/// A `Processor` backed by a closure, remembering every payload it saw.
pub struct FnProcessor {
    f: Box<ProcessFn>,
    seen: Mutex<Vec<String>>,
}

impl FnProcessor {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Message) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self {
            f: Box::new(f),
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Fails every message whose payload is in `failing`.
    pub fn failing_on(failing: &[&str]) -> Self {
        let failing: Vec<String> = failing.iter().map(|p| p.to_string()).collect();
        Self::new(move |message| {
            let payload = text(message.payload());
            if failing.contains(&payload) {
                anyhow::bail!("cannot process {payload}");
            }
            Ok(())
        })
    }

    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl Processor for FnProcessor {
    async fn process(&self, message: &Message) -> anyhow::Result<()> {
        self.seen.lock().unwrap().push(text(message.payload()));
        (self.f)(message)
    }
}

// ==== Batch consumer groups ====

type BatchFn = dyn Fn(&Batch) -> anyhow::Result<()> + Send + Sync;

/// A `BatchProcessor` backed by a closure, remembering every batch it saw.
pub struct FnBatchProcessor {
    f: Box<BatchFn>,
    batches: Mutex<Vec<(Vec<i64>, Vec<String>)>>,
}

impl FnBatchProcessor {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Batch) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self {
            f: Box::new(f),
            batches: Mutex::new(Vec::new()),
        }
    }

    pub fn batch_offsets(&self) -> Vec<Vec<i64>> {
        self.batches
            .lock()
            .unwrap()
            .iter()
            .map(|(offsets, _)| offsets.clone())
            .collect()
    }

    pub fn batch_payloads(&self) -> Vec<Vec<String>> {
        self.batches
            .lock()
            .unwrap()
            .iter()
            .map(|(_, payloads)| payloads.clone())
            .collect()
    }
}

#[async_trait]
impl BatchProcessor for FnBatchProcessor {
    async fn process_batch(&self, batch: &Batch) -> anyhow::Result<()> {
        let offsets = batch.messages().iter().map(|m| m.offset()).collect();
        let payloads = batch.messages().iter().map(|m| text(m.payload())).collect();
        self.batches.lock().unwrap().push((offsets, payloads));
        (self.f)(batch)
    }
}

/// A `GroupSession` that records marks and commits.
pub struct RecordingSession {
    member_id: String,
    marks: Mutex<Vec<(Partition, i64)>>,
    commits: AtomicUsize,
    fail_commits: bool,
}

impl RecordingSession {
    pub fn new(member_id: &str) -> Self {
        Self {
            member_id: member_id.to_string(),
            marks: Mutex::new(Vec::new()),
            commits: AtomicUsize::new(0),
            fail_commits: false,
        }
    }

    pub fn failing_commits(mut self) -> Self {
        self.fail_commits = true;
        self
    }

    pub fn marks(&self) -> Vec<(Partition, i64)> {
        self.marks.lock().unwrap().clone()
    }

    pub fn last_mark(&self, partition: &Partition) -> Option<i64> {
        self.marks
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(p, _)| p == partition)
            .map(|(_, offset)| *offset)
    }

    pub fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GroupSession for RecordingSession {
    fn member_id(&self) -> String {
        self.member_id.clone()
    }

    fn mark_offset(&self, partition: &Partition, next_offset: i64) {
        self.marks
            .lock()
            .unwrap()
            .push((partition.clone(), next_offset));
    }

    async fn commit(&self) -> Result<(), CommitError> {
        self.commits.fetch_add(1, Ordering::SeqCst);
        if self.fail_commits {
            return Err(CommitError(anyhow::anyhow!("coordinator unavailable")));
        }
        Ok(())
    }
}

/// Shared state of a fake topic: its messages and the offsets committed by the group.
#[derive(Debug, Default)]
pub struct GroupLog {
    joins: Mutex<Vec<Instant>>,
    sessions: AtomicUsize,
    closes: AtomicUsize,
    commits: AtomicUsize,
    committed: Mutex<HashMap<i32, i64>>,
}

impl GroupLog {
    pub fn joins(&self) -> usize {
        self.joins.lock().unwrap().len()
    }

    pub fn join_instants(&self) -> Vec<Instant> {
        self.joins.lock().unwrap().clone()
    }

    pub fn sessions(&self) -> usize {
        self.sessions.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Explicit commits requested by the handler.
    pub fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    /// The next offset the group resumes `partition` from.
    pub fn committed(&self, partition: i32) -> Option<i64> {
        self.committed.lock().unwrap().get(&partition).copied()
    }
}

/// A consumer group over an in-memory topic. Partition `i` holds the payloads at index `i`.
///
/// Every session delivers each partition from its committed offset, then waits for shutdown
/// or a failed claim. Marked offsets are committed when the session ends.
pub struct FakeGroupFactory {
    partitions: Arc<Vec<Vec<String>>>,
    failing_joins: AtomicUsize,
    fail_commits: AtomicBool,
    log: Arc<GroupLog>,
}

impl FakeGroupFactory {
    pub fn new(partitions: Vec<Vec<&str>>) -> Self {
        let partitions = partitions
            .into_iter()
            .map(|payloads| payloads.into_iter().map(str::to_string).collect())
            .collect();
        Self {
            partitions: Arc::new(partitions),
            failing_joins: AtomicUsize::new(0),
            fail_commits: AtomicBool::new(false),
            log: Arc::new(GroupLog::default()),
        }
    }

    /// The first `count` joins fail.
    pub fn failing_joins(self, count: usize) -> Self {
        self.failing_joins.store(count, Ordering::SeqCst);
        self
    }

    /// Explicit commits fail.
    pub fn failing_commits(self) -> Self {
        self.fail_commits.store(true, Ordering::SeqCst);
        self
    }

    pub fn log(&self) -> &GroupLog {
        &self.log
    }
}

#[async_trait]
impl ConsumerGroupFactory for FakeGroupFactory {
    async fn join(
        &self,
        group: &str,
        _brokers: &[String],
        topics: &[String],
    ) -> Result<Box<dyn ConsumerGroup>, GroupError> {
        self.log.joins.lock().unwrap().push(Instant::now());
        let remaining = self.failing_joins.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_joins.store(remaining - 1, Ordering::SeqCst);
            return Err(GroupError::Join {
                group: group.to_string(),
                source: anyhow::anyhow!("coordinator not available"),
            });
        }

        Ok(Box::new(FakeGroup {
            topic: topics.first().cloned().unwrap_or_default(),
            partitions: self.partitions.clone(),
            fail_commits: self.fail_commits.load(Ordering::SeqCst),
            log: self.log.clone(),
        }))
    }
}

struct FakeGroup {
    topic: String,
    partitions: Arc<Vec<Vec<String>>>,
    fail_commits: bool,
    log: Arc<GroupLog>,
}

#[async_trait]
impl ConsumerGroup for FakeGroup {
    async fn consume(
        &mut self,
        shutdown: &CancellationToken,
        handler: Arc<dyn GroupHandler>,
    ) -> Result<(), GroupError> {
        let generation = self.log.sessions.fetch_add(1, Ordering::SeqCst);
        let fake_session = Arc::new(FakeSession {
            member_id: format!("fake-member-{generation}"),
            marked: Mutex::new(HashMap::new()),
            fail_commits: self.fail_commits,
            log: self.log.clone(),
        });
        let session: Arc<dyn GroupSession> = fake_session.clone();
        handler.setup(&session).await?;

        let mut router = ClaimRouter::new(handler.clone(), session.clone(), 16);
        for (number, payloads) in self.partitions.iter().enumerate() {
            let number = number as i32;
            let partition = Partition::new(self.topic.clone(), number);
            router.open(&partition);

            let start = self.log.committed(number).unwrap_or(0);
            let high_watermark = payloads.len() as i64;
            for (offset, payload) in payloads.iter().enumerate().skip(start as usize) {
                let mut message = ClaimMessage::new(
                    partition.clone(),
                    offset as i64,
                    Some(payload.clone().into_bytes()),
                );
                message.high_watermark = Some(high_watermark);
                if !router.route(message).await {
                    break;
                }
            }
        }

        let result = loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break Ok(()),

                finished = router.next_finished(), if router.has_claims() => match finished {
                    Some(Err(err)) => break Err(err),
                    _ => continue,
                },
            }
        };

        let claims = router.close().await;
        fake_session.store_marks();
        let cleaned = handler.cleanup(&session).await;
        result.and(claims).and(cleaned)
    }

    async fn close(&mut self) -> Result<(), GroupError> {
        self.log.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct FakeSession {
    member_id: String,
    marked: Mutex<HashMap<i32, i64>>,
    fail_commits: bool,
    log: Arc<GroupLog>,
}

impl FakeSession {
    fn store_marks(&self) {
        let marked = self.marked.lock().unwrap();
        let mut committed = self.log.committed.lock().unwrap();
        for (partition, offset) in marked.iter() {
            let current = committed.entry(*partition).or_insert(*offset);
            *current = (*current).max(*offset);
        }
    }
}

#[async_trait]
impl GroupSession for FakeSession {
    fn member_id(&self) -> String {
        self.member_id.clone()
    }

    fn mark_offset(&self, partition: &Partition, next_offset: i64) {
        let mut marked = self.marked.lock().unwrap();
        let current = marked
            .entry(partition.partition_number())
            .or_insert(next_offset);
        *current = (*current).max(next_offset);
    }

    async fn commit(&self) -> Result<(), CommitError> {
        self.log.commits.fetch_add(1, Ordering::SeqCst);
        if self.fail_commits {
            return Err(CommitError(anyhow::anyhow!("coordinator unavailable")));
        }
        self.store_marks();
        Ok(())
    }
}

// ==== Offset queries ====

#[derive(Debug, Clone)]
struct FakePartition {
    oldest: i64,
    timestamps: Vec<i64>,
    expired_below: i64,
}

/// A topic whose messages carry the given timestamps, in seconds.
pub struct FakeOffsetQuery {
    topic: String,
    partitions: HashMap<i32, FakePartition>,
    fetch_delay: Duration,
    fetches: AtomicUsize,
}

impl FakeOffsetQuery {
    pub fn new(topic: &str) -> Self {
        Self {
            topic: topic.to_string(),
            partitions: HashMap::new(),
            fetch_delay: Duration::ZERO,
            fetches: AtomicUsize::new(0),
        }
    }

    /// Partition `id` starts at `oldest`; message `oldest + i` has timestamp `timestamps[i]`.
    pub fn with_partition(mut self, id: i32, oldest: i64, timestamps: Vec<i64>) -> Self {
        self.partitions.insert(
            id,
            FakePartition {
                oldest,
                timestamps,
                expired_below: oldest,
            },
        );
        self
    }

    /// Fetches below `offset` report out of range while the watermarks still include them.
    pub fn with_expired_below(mut self, id: i32, offset: i64) -> Self {
        if let Some(partition) = self.partitions.get_mut(&id) {
            partition.expired_below = offset;
        }
        self
    }

    /// Every fetch takes `delay`.
    pub fn with_fetch_delay(mut self, delay: Duration) -> Self {
        self.fetch_delay = delay;
        self
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    fn partition(&self, topic: &str, id: i32) -> Result<&FakePartition, OffsetQueryError> {
        if topic != self.topic {
            return Err(OffsetQueryError::UnknownTopic(topic.to_string()));
        }
        self.partitions
            .get(&id)
            .ok_or_else(|| OffsetQueryError::Broker(anyhow::anyhow!("no partition {id}")))
    }
}

#[async_trait]
impl OffsetQuery for FakeOffsetQuery {
    async fn partition_ids(&self, topic: &str) -> Result<Vec<i32>, OffsetQueryError> {
        if topic != self.topic {
            return Err(OffsetQueryError::UnknownTopic(topic.to_string()));
        }
        let mut ids: Vec<i32> = self.partitions.keys().copied().collect();
        ids.sort_unstable();
        Ok(ids)
    }

    async fn oldest_offset(&self, topic: &str, partition: i32) -> Result<i64, OffsetQueryError> {
        Ok(self.partition(topic, partition)?.oldest)
    }

    async fn newest_offset(&self, topic: &str, partition: i32) -> Result<i64, OffsetQueryError> {
        let fake = self.partition(topic, partition)?;
        Ok(fake.oldest + fake.timestamps.len() as i64)
    }

    async fn message_at(
        &self,
        topic: &str,
        partition: i32,
        offset: i64,
    ) -> Result<FetchedMessage, OffsetQueryError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if !self.fetch_delay.is_zero() {
            tokio::time::sleep(self.fetch_delay).await;
        }

        let fake = self.partition(topic, partition)?;
        let out_of_range = || OffsetQueryError::OutOfRange {
            partition: Partition::new(topic.to_string(), partition),
            offset,
        };
        if offset < fake.expired_below {
            return Err(out_of_range());
        }
        let index = usize::try_from(offset - fake.oldest).map_err(|_| out_of_range())?;
        let seconds = fake.timestamps.get(index).ok_or_else(out_of_range)?;

        Ok(FetchedMessage {
            partition: Partition::new(topic.to_string(), partition),
            offset,
            key: None,
            payload: Some(seconds.to_string().into_bytes()),
            headers: HashMap::new(),
            timestamp: Some(timestamp(*seconds)),
        })
    }
}
