use std::sync::Arc;
use std::time::Duration;

use common_metrics::MetricsSink;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{AttemptError, ConfigError, GroupError, RunError, Stage};
use crate::group::batch::BatchProcessor;
use crate::group::handler::{BatchHandler, GroupShared};
use crate::group::session::{ConsumerGroupFactory, GroupHandler};
use crate::kafka::KafkaGroupFactory;
use crate::metrics_consts::CONSUMER_ERRORS;
use crate::retry::{sleep_or_cancel, RetryBudget, RetryPolicy};
use crate::strategy::{BatchFailureAction, FailStrategy};

pub struct GroupOptions {
    pub fail_strategy: FailStrategy,
    pub retry: RetryPolicy,
    pub batch_size: usize,
    /// Zero flushes every message as soon as it arrives.
    pub batch_timeout: Duration,
    /// Commit offsets after every flushed batch instead of periodically.
    pub commit_sync: bool,
    pub metrics: Arc<dyn MetricsSink>,
    /// Defaults to a `KafkaGroupFactory` with default settings.
    pub group_factory: Option<Arc<dyn ConsumerGroupFactory>>,
}

impl Default for GroupOptions {
    fn default() -> Self {
        Self {
            fail_strategy: FailStrategy::Exit,
            retry: RetryPolicy::default(),
            batch_size: 100,
            batch_timeout: Duration::from_secs(1),
            commit_sync: false,
            metrics: common_metrics::noop(),
            group_factory: None,
        }
    }
}

/// Consumes a set of topics as a member of a consumer group, processing each partition in
/// batches and rejoining the group after failures while retries remain.
pub struct GroupComponent {
    shared: Arc<GroupShared>,
    group: String,
    brokers: Vec<String>,
    topics: Vec<String>,
    retry: RetryPolicy,
    factory: Arc<dyn ConsumerGroupFactory>,
}

impl GroupComponent {
    pub fn new(
        name: impl Into<String>,
        group: impl Into<String>,
        brokers: Vec<String>,
        topics: Vec<String>,
        processor: Arc<dyn BatchProcessor>,
        options: GroupOptions,
    ) -> Result<Self, ConfigError> {
        let name = name.into();
        let group = group.into();
        if name.trim().is_empty() {
            return Err(ConfigError::Empty { field: "name" });
        }
        if group.trim().is_empty() {
            return Err(ConfigError::Empty { field: "group" });
        }
        if brokers.is_empty() || brokers.iter().any(|b| b.trim().is_empty()) {
            return Err(ConfigError::Empty { field: "brokers" });
        }
        if topics.is_empty() || topics.iter().any(|t| t.trim().is_empty()) {
            return Err(ConfigError::Empty { field: "topics" });
        }
        if options.batch_size == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }
        if options.retry.retries > 0 && options.retry.retry_wait.is_zero() {
            return Err(ConfigError::ZeroRetryWait);
        }
        let on_failure = BatchFailureAction::resolve(options.fail_strategy)?;

        let metrics = options.metrics.clone();
        let factory = options
            .group_factory
            .unwrap_or_else(|| Arc::new(default_group_factory(metrics)));

        Ok(Self {
            shared: Arc::new(GroupShared {
                component: name,
                processor,
                on_failure,
                batch_size: options.batch_size,
                batch_timeout: options.batch_timeout,
                commit_sync: options.commit_sync,
                metrics: options.metrics,
            }),
            group,
            brokers,
            topics,
            retry: options.retry,
            factory,
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.component
    }

    /// Consume until `shutdown` is cancelled or the retry budget runs out.
    ///
    /// A failed synchronous commit ends the run immediately, whatever budget is left.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), RunError> {
        let name = self.name();
        let mut budget = RetryBudget::new(&self.retry);
        info!(
            component = %name,
            group = %self.group,
            topics = ?self.topics,
            batch_size = self.shared.batch_size,
            "starting consumer group component"
        );

        loop {
            if shutdown.is_cancelled() {
                return Ok(());
            }

            let handler = Arc::new(BatchHandler::new(self.shared.clone(), shutdown.clone()));
            let outcome = self.attempt(&shutdown, &handler).await;

            let err = match outcome {
                Ok(()) => {
                    info!(component = %name, "consumer group component stopped");
                    return Ok(());
                }
                Err(err @ AttemptError::Retryable { .. }) => err,
                Err(fatal) => {
                    error!(component = %name, error = ?fatal, "fatal error, not retrying");
                    return Err(fatal.into_run_error(name, budget.used()));
                }
            };

            if shutdown.is_cancelled() {
                debug!(component = %name, error = ?err, "attempt failed during shutdown");
                return Ok(());
            }
            if handler.progressed() {
                budget.reset();
            }

            match budget.next_wait() {
                Some(wait) => {
                    warn!(
                        component = %name,
                        error = ?err,
                        retry = budget.used(),
                        wait_ms = wait.as_millis() as u64,
                        "consumer group attempt failed, rejoining"
                    );
                    if !sleep_or_cancel(wait, &shutdown).await {
                        return Ok(());
                    }
                }
                None => {
                    error!(component = %name, error = ?err, "retries exhausted");
                    return Err(err.into_run_error(name, budget.used()));
                }
            }
        }
    }

    // Join, run sessions until one fails or shutdown, close the client exactly once.
    async fn attempt(
        &self,
        shutdown: &CancellationToken,
        handler: &Arc<BatchHandler>,
    ) -> Result<(), AttemptError> {
        let mut group = match self
            .factory
            .join(&self.group, &self.brokers, &self.topics)
            .await
        {
            Ok(group) => group,
            Err(err) => {
                let labels = [("component".to_string(), self.shared.component.clone())];
                self.shared.metrics.increment(CONSUMER_ERRORS, &labels, 1);
                return Err(AttemptError::retryable(Stage::Connect, err));
            }
        };

        let session_handler: Arc<dyn GroupHandler> = handler.clone();
        let mut result = Ok(());
        while !shutdown.is_cancelled() {
            let session = group.consume(shutdown, session_handler.clone()).await;

            // The handler's own error explains a stopped claim better than the group does.
            if let Some(recorded) = handler.take_error() {
                result = Err(classify(recorded));
                break;
            }
            if let Err(err) = session {
                result = Err(classify(err));
                break;
            }
        }

        if let Err(err) = group.close().await {
            warn!(
                component = %self.shared.component,
                error = %err,
                "failed to close consumer group"
            );
        }
        result
    }
}

fn classify(err: GroupError) -> AttemptError {
    match err {
        GroupError::Commit(err) => AttemptError::Commit(err),
        err @ GroupError::Process { .. } => AttemptError::retryable(Stage::Process, err),
        err @ GroupError::Join { .. } => AttemptError::retryable(Stage::Connect, err),
        err => AttemptError::retryable(Stage::Consume, err),
    }
}

// Kafka client errors and commits report to the component's sink.
fn default_group_factory(metrics: Arc<dyn MetricsSink>) -> KafkaGroupFactory {
    KafkaGroupFactory::default().with_metrics(metrics)
}
