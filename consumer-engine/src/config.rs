use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use common_kafka::config::{ConsumerConfig, KafkaConfig};
use common_metrics::MetricsSink;
use envconfig::Envconfig;

use crate::error::ConfigError;
use crate::group::{ConsumerGroupFactory, GroupOptions};
use crate::retry::RetryPolicy;
use crate::strategy::FailStrategy;
use crate::supervisor::SupervisorOptions;

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    #[envconfig(nested = true)]
    pub consumer: ConsumerConfig,

    // nack_exit, nack, ack (single message) or exit, skip (batches). Unset means nack_exit for
    // single messages and exit for batches.
    pub fail_strategy: Option<String>,

    // Reconnect attempts after the first one
    #[envconfig(default = "3")]
    pub retries: i64,

    #[envconfig(default = "1000")]
    pub retry_wait_ms: i64,

    #[envconfig(default = "1")]
    pub retry_backoff_coefficient: i64,

    pub retry_maximum_wait_ms: Option<i64>,

    #[envconfig(default = "1")]
    pub concurrency: i64,

    #[envconfig(default = "100")]
    pub batch_size: i64,

    // 0 flushes every message as it arrives
    #[envconfig(default = "1000")]
    pub batch_timeout_ms: i64,

    #[envconfig(default = "false")]
    pub commit_sync: bool,

    // When set, consume single messages starting this many seconds in the past
    pub consume_since_secs: Option<i64>,

    #[envconfig(default = "30000")]
    pub resolve_timeout_ms: i64,

    #[envconfig(default = "10000")]
    pub fetch_timeout_ms: i64,

    #[envconfig(default = "0.0.0.0:9102")]
    pub metrics_bind: SocketAddr,

    #[envconfig(default = "false")]
    pub log_json: bool,
}

impl Config {
    /// Load from the environment, defaulting the consumer group and topic.
    pub fn init_with_defaults() -> Result<Self, envconfig::Error> {
        ConsumerConfig::set_defaults("consumer-engine", "events");
        Self::init_from_env()
    }

    pub fn fail_strategy(&self, default: FailStrategy) -> Result<FailStrategy, ConfigError> {
        match &self.fail_strategy {
            Some(raw) => raw.parse(),
            None => Ok(default),
        }
    }

    pub fn retry_policy(&self) -> Result<RetryPolicy, ConfigError> {
        let retries = non_negative("retries", self.retries)?;
        let retry_wait = millis("retry_wait_ms", self.retry_wait_ms)?;
        let coefficient =
            non_negative("retry_backoff_coefficient", self.retry_backoff_coefficient)?;

        let mut builder = RetryPolicy::build(saturating_u32(retries), retry_wait)
            .backoff_coefficient(saturating_u32(coefficient).max(1));
        if let Some(maximum) = self.retry_maximum_wait_ms {
            builder = builder.maximum_wait(millis("retry_maximum_wait_ms", maximum)?);
        }
        Ok(builder.provide())
    }

    pub fn concurrency(&self) -> Result<usize, ConfigError> {
        Ok(saturating_usize(non_negative("concurrency", self.concurrency)?))
    }

    pub fn batch_size(&self) -> Result<usize, ConfigError> {
        Ok(saturating_usize(non_negative("batch_size", self.batch_size)?))
    }

    pub fn batch_timeout(&self) -> Result<Duration, ConfigError> {
        millis("batch_timeout_ms", self.batch_timeout_ms)
    }

    pub fn consume_since(&self) -> Result<Option<Duration>, ConfigError> {
        self.consume_since_secs
            .map(|secs| non_negative("consume_since_secs", secs).map(Duration::from_secs))
            .transpose()
    }

    pub fn resolve_timeout(&self) -> Result<Duration, ConfigError> {
        millis("resolve_timeout_ms", self.resolve_timeout_ms)
    }

    pub fn fetch_timeout(&self) -> Result<Duration, ConfigError> {
        millis("fetch_timeout_ms", self.fetch_timeout_ms)
    }

    pub fn supervisor_options(
        &self,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<SupervisorOptions, ConfigError> {
        Ok(SupervisorOptions {
            fail_strategy: self.fail_strategy(FailStrategy::NackExit)?,
            retry: self.retry_policy()?,
            concurrency: self.concurrency()?,
            metrics,
        })
    }

    pub fn group_options(
        &self,
        metrics: Arc<dyn MetricsSink>,
        group_factory: Option<Arc<dyn ConsumerGroupFactory>>,
    ) -> Result<GroupOptions, ConfigError> {
        Ok(GroupOptions {
            fail_strategy: self.fail_strategy(FailStrategy::Exit)?,
            retry: self.retry_policy()?,
            batch_size: self.batch_size()?,
            batch_timeout: self.batch_timeout()?,
            commit_sync: self.commit_sync,
            metrics,
            group_factory,
        })
    }
}

fn non_negative(field: &'static str, value: i64) -> Result<u64, ConfigError> {
    u64::try_from(value).map_err(|_| ConfigError::Negative { field, value })
}

fn millis(field: &'static str, value: i64) -> Result<Duration, ConfigError> {
    non_negative(field, value).map(Duration::from_millis)
}

fn saturating_u32(value: u64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

fn saturating_usize(value: u64) -> usize {
    usize::try_from(value).unwrap_or(usize::MAX)
}
