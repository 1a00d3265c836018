use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use common_metrics::MetricsSink;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, field, info, info_span, warn, Instrument, Span};

use crate::consumer::{ConsumerFactory, Delivery, Processor};
use crate::error::{AckError, AttemptError, ConfigError, ConsumerError, RunError, Stage};
use crate::message::Message;
use crate::metrics_consts::{
    CONSUMER_ERRORS, MESSAGES_PROCESSED, MESSAGES_RECEIVED, WORKER_SATURATION,
};
use crate::retry::{sleep_or_cancel, RetryBudget, RetryPolicy};
use crate::strategy::{FailStrategy, MessageFailureAction};

pub struct SupervisorOptions {
    pub fail_strategy: FailStrategy,
    pub retry: RetryPolicy,
    /// Number of messages processed at once. 0 and 1 both process inline, in delivery order.
    pub concurrency: usize,
    pub metrics: Arc<dyn MetricsSink>,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            fail_strategy: FailStrategy::NackExit,
            retry: RetryPolicy::default(),
            concurrency: 1,
            metrics: common_metrics::noop(),
        }
    }
}

/// Runs one consumer at a time, feeding every message through a `Processor`, settling it
/// according to the fail strategy and reconnecting after failures while retries remain.
pub struct Supervisor {
    name: String,
    factory: Arc<dyn ConsumerFactory>,
    handler: Arc<MessageHandler>,
    retry: RetryPolicy,
    concurrency: usize,
    metrics: Arc<dyn MetricsSink>,
}

impl Supervisor {
    pub fn new(
        name: impl Into<String>,
        factory: Arc<dyn ConsumerFactory>,
        processor: Arc<dyn Processor>,
        options: SupervisorOptions,
    ) -> Result<Self, ConfigError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(ConfigError::Empty { field: "name" });
        }
        let on_failure = MessageFailureAction::resolve(options.fail_strategy)?;
        if options.concurrency > 1 && !factory.tolerates_out_of_order_acks() {
            return Err(ConfigError::OutOfOrderAcksUnsupported(options.concurrency));
        }

        let handler = MessageHandler {
            labels: vec![("component".to_string(), name.clone())],
            processor,
            on_failure,
            metrics: options.metrics.clone(),
            progressed: AtomicBool::new(false),
        };

        Ok(Self {
            name,
            factory,
            handler: Arc::new(handler),
            retry: options.retry,
            concurrency: options.concurrency,
            metrics: options.metrics,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Consume until `shutdown` is cancelled or the retry budget runs out.
    ///
    /// Returns `Ok(())` on cancellation, even when the attempt in progress was failing.
    /// Ack failures end the run immediately without touching the budget.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), RunError> {
        let mut budget = RetryBudget::new(&self.retry);
        info!(component = %self.name, concurrency = self.concurrency, "starting supervisor");

        loop {
            if shutdown.is_cancelled() {
                return Ok(());
            }

            let outcome = self.attempt(&shutdown).await;
            let progressed = self.handler.progressed.swap(false, Ordering::SeqCst);

            let err = match outcome {
                Ok(()) => {
                    info!(component = %self.name, "supervisor stopped");
                    return Ok(());
                }
                Err(err @ AttemptError::Retryable { .. }) => err,
                Err(fatal) => {
                    error!(component = %self.name, error = ?fatal, "fatal error, not retrying");
                    return Err(fatal.into_run_error(&self.name, budget.used()));
                }
            };

            if shutdown.is_cancelled() {
                debug!(component = %self.name, error = ?err, "attempt failed during shutdown");
                return Ok(());
            }
            if progressed {
                budget.reset();
            }

            match budget.next_wait() {
                Some(wait) => {
                    warn!(
                        component = %self.name,
                        error = ?err,
                        retry = budget.used(),
                        wait_ms = wait.as_millis() as u64,
                        "consumer attempt failed, retrying"
                    );
                    if !sleep_or_cancel(wait, &shutdown).await {
                        return Ok(());
                    }
                }
                None => {
                    error!(component = %self.name, error = ?err, "retries exhausted");
                    return Err(err.into_run_error(&self.name, budget.used()));
                }
            }
        }
    }

    // One connect attempt. The consumer created here is closed exactly once before returning.
    async fn attempt(&self, shutdown: &CancellationToken) -> Result<(), AttemptError> {
        let mut consumer = match self.factory.create().await {
            Ok(consumer) => consumer,
            Err(err) => return Err(self.connect_failed(err)),
        };

        let result = match consumer.consume(shutdown.clone()).await {
            Ok(delivery) => self.consume(delivery, shutdown).await,
            Err(err) => Err(self.connect_failed(err)),
        };

        if let Err(err) = consumer.close().await {
            warn!(component = %self.name, error = %err, "failed to close consumer");
        }
        result
    }

    fn connect_failed(&self, err: ConsumerError) -> AttemptError {
        self.metrics.increment(CONSUMER_ERRORS, &self.handler.labels, 1);
        AttemptError::retryable(Stage::Connect, err)
    }

    async fn consume(
        &self,
        mut delivery: Delivery,
        shutdown: &CancellationToken,
    ) -> Result<(), AttemptError> {
        let slots = (self.concurrency > 1).then(|| Arc::new(Semaphore::new(self.concurrency)));
        let (worker_tx, mut worker_rx) = mpsc::unbounded_channel::<AttemptError>();
        let mut errors_open = true;

        let mut result = loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break Ok(()),

                Some(err) = worker_rx.recv() => break Err(err),

                err = delivery.errors.recv(), if errors_open => match err {
                    Some(err) => break Err(AttemptError::retryable(Stage::Consume, err)),
                    None => errors_open = false,
                },

                message = delivery.messages.recv() => {
                    let Some(message) = message else {
                        break Err(AttemptError::retryable(Stage::Consume, ConsumerError::Closed));
                    };
                    self.metrics.increment(MESSAGES_RECEIVED, &self.handler.labels, 1);

                    let Some(slots) = &slots else {
                        match self.handler.handle(message).await {
                            Ok(()) => continue,
                            Err(err) => break Err(err),
                        }
                    };

                    let Ok(permit) = slots.clone().acquire_owned().await else {
                        break Ok(());
                    };
                    self.report_saturation(slots);

                    let handler = self.handler.clone();
                    let worker_tx = worker_tx.clone();
                    tokio::spawn(async move {
                        if let Err(err) = handler.handle(message).await {
                            if worker_tx.send(err).is_err() {
                                debug!("worker error dropped, supervisor loop already gone");
                            }
                        }
                        drop(permit);
                    });
                }
            }
        };

        if let Some(slots) = &slots {
            let all = u32::try_from(self.concurrency).unwrap_or(u32::MAX);
            if let Err(err) = slots.acquire_many(all).await {
                warn!(component = %self.name, error = %err, "failed to wait for in-flight workers");
            }
            slots.close();
            self.report_saturation(slots);
        }

        // Workers that failed while draining. Fatal errors win over retryable ones.
        while let Ok(err) = worker_rx.try_recv() {
            let replace = match &result {
                Ok(()) => true,
                Err(AttemptError::Retryable { .. }) => {
                    !matches!(err, AttemptError::Retryable { .. })
                }
                Err(_) => false,
            };
            if replace {
                result = Err(err);
            } else {
                debug!(component = %self.name, error = ?err, "additional worker error");
            }
        }

        result
    }

    fn report_saturation(&self, slots: &Semaphore) {
        let used = self.concurrency.saturating_sub(slots.available_permits());
        self.metrics.gauge(
            WORKER_SATURATION,
            &self.handler.labels,
            used as f64 / self.concurrency as f64,
        );
    }
}

// Shared by the inline path and every worker task.
struct MessageHandler {
    labels: Vec<(String, String)>,
    processor: Arc<dyn Processor>,
    on_failure: MessageFailureAction,
    metrics: Arc<dyn MetricsSink>,
    progressed: AtomicBool,
}

impl MessageHandler {
    async fn handle(&self, message: Message) -> Result<(), AttemptError> {
        let span = info_span!(
            "process_message",
            correlation_id = %message.context().correlation_id(),
            outcome = field::Empty,
        );

        async move {
            match self.processor.process(&message).await {
                Ok(()) => {
                    Span::current().record("outcome", "success");
                    self.count_processed("success");
                    message
                        .ack()
                        .await
                        .map_err(|e| AttemptError::Ack(AckError::Ack(e)))?;
                    self.progressed.store(true, Ordering::SeqCst);
                    Ok(())
                }
                Err(err) => {
                    Span::current().record("outcome", "error");
                    self.count_processed("error");
                    warn!(error = %err, action = ?self.on_failure, "message processing failed");

                    match self.on_failure {
                        MessageFailureAction::NackExit => {
                            message
                                .nack()
                                .await
                                .map_err(|e| AttemptError::Ack(AckError::Nack(e)))?;
                            Err(AttemptError::retryable(Stage::Process, err))
                        }
                        MessageFailureAction::Nack => message
                            .nack()
                            .await
                            .map_err(|e| AttemptError::Ack(AckError::Nack(e))),
                        MessageFailureAction::Ack => message
                            .ack()
                            .await
                            .map_err(|e| AttemptError::Ack(AckError::Ack(e))),
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    fn count_processed(&self, status: &str) {
        let mut labels = self.labels.clone();
        labels.push(("status".to_string(), status.to_string()));
        self.metrics.increment(MESSAGES_PROCESSED, &labels, 1);
    }
}
