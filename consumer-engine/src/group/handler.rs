use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use common_kafka::Partition;
use common_metrics::{timing_guard, MetricsSink};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, error, field, info, info_span, warn, Instrument, Span};

use crate::error::GroupError;
use crate::group::batch::{Batch, BatchProcessor, ClaimMessage};
use crate::group::session::{Claim, GroupHandler, GroupSession};
use crate::metrics_consts::{
    BATCHES_FLUSHED, BATCH_MESSAGES_RECEIVED, BATCH_PROCESSING_MS, BATCH_SIZE, GROUP_SESSIONS,
    MESSAGES_SKIPPED, PARTITION_OFFSET_LAG, PARTITION_RECEIVED_OFFSET,
};
use crate::strategy::BatchFailureAction;

/// Configuration shared by every handler a component creates. Immutable once built.
pub(crate) struct GroupShared {
    pub(crate) component: String,
    pub(crate) processor: Arc<dyn BatchProcessor>,
    pub(crate) on_failure: BatchFailureAction,
    pub(crate) batch_size: usize,
    pub(crate) batch_timeout: Duration,
    pub(crate) commit_sync: bool,
    pub(crate) metrics: Arc<dyn MetricsSink>,
}

/// Batches the messages of each claim and hands them to the `BatchProcessor`.
///
/// A fresh handler is created for every connect attempt. It remembers whether any batch
/// completed during the attempt and the first error that should end it.
pub(crate) struct BatchHandler {
    shared: Arc<GroupShared>,
    shutdown: CancellationToken,
    progressed: AtomicBool,
    error: Mutex<Option<GroupError>>,
}

impl BatchHandler {
    pub(crate) fn new(shared: Arc<GroupShared>, shutdown: CancellationToken) -> Self {
        Self {
            shared,
            shutdown,
            progressed: AtomicBool::new(false),
            error: Mutex::new(None),
        }
    }

    pub(crate) fn progressed(&self) -> bool {
        self.progressed.load(Ordering::SeqCst)
    }

    pub(crate) fn take_error(&self) -> Option<GroupError> {
        self.error.lock().ok().and_then(|mut error| error.take())
    }

    fn record_error(&self, err: GroupError) {
        match self.error.lock() {
            Ok(mut error) => {
                if error.is_none() {
                    *error = Some(err);
                }
            }
            Err(_) => error!(error = %err, "failed to record handler error"),
        }
    }

    fn claim_labels(&self, partition: &Partition) -> Vec<(String, String)> {
        let mut labels = partition.labels();
        labels.push(("component".to_string(), self.shared.component.clone()));
        labels
    }

    fn observe(&self, message: &ClaimMessage, labels: &[(String, String)]) {
        let metrics = &self.shared.metrics;
        metrics.gauge(PARTITION_RECEIVED_OFFSET, labels, message.offset as f64);
        if let Some(high_watermark) = message.high_watermark {
            let lag = (high_watermark - message.offset - 1).max(0);
            metrics.gauge(PARTITION_OFFSET_LAG, labels, lag as f64);
        }

        let status = if message.payload.is_some() {
            "ok"
        } else {
            "empty_payload"
        };
        metrics.increment(
            BATCH_MESSAGES_RECEIVED,
            &with_label(labels, "status", status),
            1,
        );
    }

    async fn flush(
        &self,
        session: &Arc<dyn GroupSession>,
        partition: &Partition,
        messages: Vec<ClaimMessage>,
        labels: &[(String, String)],
    ) -> Result<(), GroupError> {
        let batch = Batch::new(partition.clone(), messages, session.clone());
        let span = info_span!(
            "process_batch",
            partition = %partition,
            size = batch.len(),
            first_offset = batch.first_offset(),
            outcome = field::Empty,
        );

        async {
            let metrics = self.shared.metrics.as_ref();
            metrics.histogram(BATCH_SIZE, labels, batch.len() as f64);

            let result = {
                let _timing = timing_guard(metrics, BATCH_PROCESSING_MS, labels);
                self.shared.processor.process_batch(&batch).await
            };

            let err = match result {
                Ok(()) => {
                    Span::current().record("outcome", "success");
                    record_message_outcomes(&batch, "success");
                    batch.mark_processed();
                    self.commit_if_sync(&batch).await?;
                    let flushed = with_label(labels, "outcome", "success");
                    metrics.increment(BATCHES_FLUSHED, &flushed, 1);
                    self.progressed.store(true, Ordering::SeqCst);
                    return Ok(());
                }
                Err(err) => err,
            };

            Span::current().record("outcome", "error");
            record_message_outcomes(&batch, "error");

            match self.shared.on_failure {
                BatchFailureAction::Exit => {
                    error!(error = %err, "batch processing failed, stopping claim");
                    let flushed = with_label(labels, "outcome", "error");
                    metrics.increment(BATCHES_FLUSHED, &flushed, 1);
                    self.record_error(GroupError::Process {
                        partition: partition.clone(),
                        source: err,
                    });
                    Err(GroupError::ClaimStopped(partition.clone()))
                }
                BatchFailureAction::Skip => {
                    warn!(error = %err, "batch processing failed, skipping batch");
                    batch.mark_processed();
                    self.commit_if_sync(&batch).await?;
                    let flushed = with_label(labels, "outcome", "skipped");
                    metrics.increment(BATCHES_FLUSHED, &flushed, 1);
                    metrics.increment(MESSAGES_SKIPPED, labels, batch.len() as u64);
                    Ok(())
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn commit_if_sync(&self, batch: &Batch) -> Result<(), GroupError> {
        if !self.shared.commit_sync {
            return Ok(());
        }
        if let Err(err) = batch.commit().await {
            error!(error = %err, "synchronous commit failed");
            self.record_error(GroupError::Commit(err));
            return Err(GroupError::ClaimStopped(batch.partition().clone()));
        }
        Ok(())
    }
}

#[async_trait]
impl GroupHandler for BatchHandler {
    async fn setup(&self, session: &Arc<dyn GroupSession>) -> Result<(), GroupError> {
        info!(
            component = %self.shared.component,
            member_id = %session.member_id(),
            "consumer group session started"
        );
        let labels = [("component".to_string(), self.shared.component.clone())];
        self.shared.metrics.increment(GROUP_SESSIONS, &labels, 1);
        Ok(())
    }

    async fn cleanup(&self, session: &Arc<dyn GroupSession>) -> Result<(), GroupError> {
        info!(
            component = %self.shared.component,
            member_id = %session.member_id(),
            "consumer group session ended"
        );
        Ok(())
    }

    async fn consume_claim(
        &self,
        session: Arc<dyn GroupSession>,
        mut claim: Claim,
    ) -> Result<(), GroupError> {
        let partition = claim.partition().clone();
        let labels = self.claim_labels(&partition);
        let batch_size = self.shared.batch_size;
        let mut buffer: Vec<ClaimMessage> = Vec::with_capacity(batch_size);
        // A zero timeout flushes on every message, so it needs no ticker.
        let mut ticker = periodic(self.shared.batch_timeout);

        debug!(partition = %partition, "consuming claim");
        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => {
                    if !buffer.is_empty() {
                        debug!(
                            partition = %partition,
                            dropped = buffer.len(),
                            "shutdown, partial batch left unmarked"
                        );
                    }
                    return Ok(());
                }

                message = claim.recv() => {
                    let Some(message) = message else {
                        return Ok(());
                    };
                    self.observe(&message, &labels);
                    buffer.push(message);

                    if buffer.len() >= batch_size || ticker.is_none() {
                        let messages = take_batch(&mut buffer, batch_size);
                        self.flush(&session, &partition, messages, &labels).await?;
                        if let Some(ticker) = ticker.as_mut() {
                            ticker.reset();
                        }
                    }
                }

                _ = next_tick(&mut ticker) => {
                    if !buffer.is_empty() {
                        let messages = take_batch(&mut buffer, batch_size);
                        self.flush(&session, &partition, messages, &labels).await?;
                    }
                }
            }
        }
    }
}

/// Ticks every `period`, starting one period from now. A zero period never ticks.
pub(crate) fn periodic(period: Duration) -> Option<Interval> {
    if period.is_zero() {
        return None;
    }
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    Some(ticker)
}

pub(crate) async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn take_batch(buffer: &mut Vec<ClaimMessage>, batch_size: usize) -> Vec<ClaimMessage> {
    std::mem::replace(buffer, Vec::with_capacity(batch_size))
}

fn with_label(labels: &[(String, String)], key: &str, value: &str) -> Vec<(String, String)> {
    let mut labels = labels.to_vec();
    labels.push((key.to_string(), value.to_string()));
    labels
}

fn record_message_outcomes(batch: &Batch, outcome: &str) {
    for message in batch.messages() {
        let span = debug_span!(
            "batch_message",
            correlation_id = %message.context().correlation_id(),
            offset = message.offset(),
            outcome,
        );
        span.in_scope(|| debug!("message settled"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{FnBatchProcessor, RecordingSession};
    use common_metrics::CapturingMetrics;
    use tokio::sync::mpsc;

    fn shared(
        processor: Arc<dyn BatchProcessor>,
        on_failure: BatchFailureAction,
        batch_size: usize,
        batch_timeout: Duration,
        metrics: Arc<dyn MetricsSink>,
    ) -> Arc<GroupShared> {
        Arc::new(GroupShared {
            component: "test".to_string(),
            processor,
            on_failure,
            batch_size,
            batch_timeout,
            commit_sync: false,
            metrics,
        })
    }

    fn partition() -> Partition {
        Partition::new("orders".to_string(), 0)
    }

    fn message(offset: i64) -> ClaimMessage {
        let payload = Some(offset.to_string().into_bytes());
        let mut message = ClaimMessage::new(partition(), offset, payload);
        message.high_watermark = Some(10);
        message
    }

    #[tokio::test(start_paused = true)]
    async fn test_size_trigger_flushes_full_batches() {
        let processor = Arc::new(FnBatchProcessor::new(|_| Ok(())));
        let metrics = Arc::new(CapturingMetrics::new());
        let handler = BatchHandler::new(
            shared(
                processor.clone(),
                BatchFailureAction::Exit,
                2,
                Duration::from_secs(60),
                metrics.clone(),
            ),
            CancellationToken::new(),
        );
        let session = Arc::new(RecordingSession::new("m"));

        let (tx, rx) = mpsc::channel(8);
        for offset in 0..5 {
            tx.send(message(offset)).await.unwrap();
        }
        drop(tx);

        handler
            .consume_claim(session.clone(), Claim::new(partition(), rx))
            .await
            .unwrap();

        // The fifth message never reaches the size trigger and the claim ends first.
        assert_eq!(processor.batch_offsets(), vec![vec![0, 1], vec![2, 3]]);
        assert_eq!(session.last_mark(&partition()), Some(4));
        assert!(handler.progressed());
        assert_eq!(
            metrics.gauge_value(
                PARTITION_OFFSET_LAG,
                &[("topic", "orders"), ("partition", "0"), ("component", "test")]
            ),
            Some(5.0)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_timeout_flushes_every_message() {
        let processor = Arc::new(FnBatchProcessor::new(|_| Ok(())));
        let handler = BatchHandler::new(
            shared(
                processor.clone(),
                BatchFailureAction::Exit,
                100,
                Duration::ZERO,
                common_metrics::noop(),
            ),
            CancellationToken::new(),
        );

        let (tx, rx) = mpsc::channel(8);
        for offset in 0..3 {
            tx.send(message(offset)).await.unwrap();
        }
        drop(tx);

        handler
            .consume_claim(
                Arc::new(RecordingSession::new("m")),
                Claim::new(partition(), rx),
            )
            .await
            .unwrap();

        assert_eq!(processor.batch_offsets(), vec![vec![0], vec![1], vec![2]]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exit_records_error_and_leaves_offsets_unmarked() {
        let processor = Arc::new(FnBatchProcessor::new(|_| Err(anyhow::anyhow!("boom"))));
        let handler = BatchHandler::new(
            shared(
                processor,
                BatchFailureAction::Exit,
                1,
                Duration::from_secs(1),
                common_metrics::noop(),
            ),
            CancellationToken::new(),
        );
        let session = Arc::new(RecordingSession::new("m"));

        let (tx, rx) = mpsc::channel(8);
        tx.send(message(7)).await.unwrap();

        let result = handler
            .consume_claim(session.clone(), Claim::new(partition(), rx))
            .await;

        assert!(matches!(result, Err(GroupError::ClaimStopped(_))));
        assert!(matches!(handler.take_error(), Some(GroupError::Process { .. })));
        assert!(session.marks().is_empty());
        assert!(!handler.progressed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_skip_marks_failed_batch_and_continues() {
        let processor = Arc::new(FnBatchProcessor::new(|_| Err(anyhow::anyhow!("boom"))));
        let metrics = Arc::new(CapturingMetrics::new());
        let handler = BatchHandler::new(
            shared(
                processor.clone(),
                BatchFailureAction::Skip,
                1,
                Duration::from_secs(1),
                metrics.clone(),
            ),
            CancellationToken::new(),
        );
        let session = Arc::new(RecordingSession::new("m"));

        let (tx, rx) = mpsc::channel(8);
        tx.send(message(1)).await.unwrap();
        tx.send(message(2)).await.unwrap();
        drop(tx);

        handler
            .consume_claim(session.clone(), Claim::new(partition(), rx))
            .await
            .unwrap();

        assert_eq!(processor.batch_offsets(), vec![vec![1], vec![2]]);
        assert_eq!(session.last_mark(&partition()), Some(3));
        assert_eq!(metrics.counter_total(MESSAGES_SKIPPED), 2);
        assert!(handler.take_error().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_drops_partial_batch() {
        let processor = Arc::new(FnBatchProcessor::new(|_| Ok(())));
        let shutdown = CancellationToken::new();
        let handler = Arc::new(BatchHandler::new(
            shared(
                processor.clone(),
                BatchFailureAction::Exit,
                10,
                Duration::from_secs(5),
                common_metrics::noop(),
            ),
            shutdown.clone(),
        ));

        let (tx, rx) = mpsc::channel(8);
        tx.send(message(0)).await.unwrap();
        let session: Arc<dyn GroupSession> = Arc::new(RecordingSession::new("m"));
        let task = {
            let handler = handler.clone();
            tokio::spawn(async move {
                handler
                    .consume_claim(session, Claim::new(partition(), rx))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        shutdown.cancel();

        assert!(task.await.unwrap().is_ok());
        assert!(processor.batch_offsets().is_empty());
        drop(tx);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_period_never_ticks() {
        let mut ticker = periodic(Duration::ZERO);
        assert!(ticker.is_none());

        let ticked = tokio::time::timeout(Duration::from_secs(60), next_tick(&mut ticker)).await;
        assert!(ticked.is_err());
    }
}
