//! Message consumption engine.
//!
//! Two ways to consume, sharing one retry model:
//!
//! - [`Supervisor`] drives any [`ConsumerFactory`] one message at a time, optionally with
//!   concurrent workers, settling each message according to a [`FailStrategy`].
//! - [`GroupComponent`] joins a Kafka consumer group and hands each assigned partition's
//!   messages to a [`BatchProcessor`] in size- or time-bounded batches.
//!
//! [`OffsetResolver`] maps a point in time to a starting offset per partition, used to start
//! consumers from a duration in the past.
//!
//! Both components return `Ok(())` when their shutdown token is cancelled and a [`RunError`]
//! naming the failed stage once retries are exhausted or a commit/ack fails.

pub mod config;
pub mod consumer;
pub mod error;
pub mod group;
pub mod kafka;
pub mod message;
pub mod metrics_consts;
pub mod offsets;
pub mod retry;
pub mod strategy;
pub mod supervisor;
pub mod test_utils;

pub use consumer::{Consumer, ConsumerFactory, Delivery, Processor};
pub use error::{ConfigError, RunError, Stage};
pub use group::{Batch, BatchMessage, BatchProcessor, GroupComponent, GroupOptions};
pub use message::{Message, MessageContext};
pub use offsets::{OffsetResolver, TimestampExtractor};
pub use retry::RetryPolicy;
pub use strategy::FailStrategy;
pub use supervisor::{Supervisor, SupervisorOptions};
