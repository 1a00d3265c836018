use std::fmt;

use common_kafka::Partition;
use thiserror::Error;

use crate::strategy::FailStrategy;

/// Invalid options handed to a component constructor. Never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{field} must not be empty")]
    Empty { field: &'static str },
    #[error("unknown fail strategy {0:?}, must be one of nack_exit, nack, ack, exit, skip")]
    UnknownFailStrategy(String),
    #[error("fail strategy {strategy} is not supported by the {component}")]
    UnsupportedFailStrategy {
        strategy: FailStrategy,
        component: &'static str,
    },
    #[error("{field} must not be negative, got {value}")]
    Negative { field: &'static str, value: i64 },
    #[error("batch size must be greater than zero")]
    ZeroBatchSize,
    #[error("retry wait must be greater than zero when retries are configured")]
    ZeroRetryWait,
    #[error("concurrency of {0} requires a consumer that tolerates out-of-order acknowledgement")]
    OutOfOrderAcksUnsupported(usize),
}

/// Failures of a `Consumer` or `ConsumerFactory`.
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("failed to create consumer: {0}")]
    Create(#[source] anyhow::Error),
    #[error("failed to start consuming: {0}")]
    Consume(#[source] anyhow::Error),
    #[error("consumer reported an error: {0}")]
    Runtime(#[source] anyhow::Error),
    #[error("message channel closed while consuming")]
    Closed,
    #[error("failed to close consumer: {0}")]
    Close(#[source] anyhow::Error),
}

/// An ack or nack could not be delivered to the broker.
#[derive(Error, Debug)]
pub enum AckError {
    #[error("failed to ack message: {0}")]
    Ack(#[source] anyhow::Error),
    #[error("failed to nack message: {0}")]
    Nack(#[source] anyhow::Error),
}

#[derive(Error, Debug)]
#[error("failed to commit offsets: {0}")]
pub struct CommitError(#[source] pub anyhow::Error);

/// Failures of a consumer-group client or of the batch handler it drives.
#[derive(Error, Debug)]
pub enum GroupError {
    #[error("failed to join consumer group {group}: {source}")]
    Join {
        group: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("consumer group session failed: {0}")]
    Session(#[source] anyhow::Error),
    #[error("processing batch from {partition} failed: {source}")]
    Process {
        partition: Partition,
        #[source]
        source: anyhow::Error,
    },
    #[error("claim for {0} stopped after a failed batch")]
    ClaimStopped(Partition),
    #[error(transparent)]
    Commit(#[from] CommitError),
    #[error("failed to close consumer group: {0}")]
    Close(#[source] anyhow::Error),
}

/// The part of a consuming attempt that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Connect,
    Consume,
    Process,
    Ack,
    Commit,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Connect => "connect",
            Stage::Consume => "consume",
            Stage::Process => "process",
            Stage::Ack => "ack",
            Stage::Commit => "commit",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal error returned by `run`. Clean shutdown returns `Ok(())` instead.
#[derive(Error, Debug)]
pub enum RunError {
    #[error("{component}: {stage} failed after {retries} retries: {source}")]
    RetriesExhausted {
        component: String,
        stage: Stage,
        retries: u32,
        #[source]
        source: anyhow::Error,
    },
    #[error("{component}: acknowledgement failed after {retries} retries, not retrying: {source}")]
    Ack {
        component: String,
        retries: u32,
        #[source]
        source: AckError,
    },
    #[error("{component}: offset commit failed after {retries} retries, not retrying: {source}")]
    Commit {
        component: String,
        retries: u32,
        #[source]
        source: CommitError,
    },
}

impl RunError {
    pub fn stage(&self) -> Stage {
        match self {
            RunError::RetriesExhausted { stage, .. } => *stage,
            RunError::Ack { .. } => Stage::Ack,
            RunError::Commit { .. } => Stage::Commit,
        }
    }

    /// Number of retries attempted before giving up.
    pub fn retries(&self) -> u32 {
        match self {
            RunError::RetriesExhausted { retries, .. }
            | RunError::Ack { retries, .. }
            | RunError::Commit { retries, .. } => *retries,
        }
    }
}

/// How a single consuming attempt ended, before the retry budget is consulted.
#[derive(Debug)]
pub(crate) enum AttemptError {
    Retryable {
        stage: Stage,
        source: anyhow::Error,
    },
    Ack(AckError),
    Commit(CommitError),
}

impl AttemptError {
    pub(crate) fn retryable(stage: Stage, source: impl Into<anyhow::Error>) -> Self {
        AttemptError::Retryable {
            stage,
            source: source.into(),
        }
    }

    /// Fold into the error returned from `run`, given the retries spent so far.
    pub(crate) fn into_run_error(self, component: &str, retries: u32) -> RunError {
        let component = component.to_string();
        match self {
            AttemptError::Retryable { stage, source } => RunError::RetriesExhausted {
                component,
                stage,
                retries,
                source,
            },
            AttemptError::Ack(source) => RunError::Ack {
                component,
                retries,
                source,
            },
            AttemptError::Commit(source) => RunError::Commit {
                component,
                retries,
                source,
            },
        }
    }
}
