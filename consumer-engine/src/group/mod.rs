//! Batch consumption of Kafka partitions as a member of a consumer group.
mod batch;
mod component;
mod handler;
mod session;

pub(crate) use handler::{next_tick, periodic};

pub use batch::{Batch, BatchMessage, BatchProcessor, ClaimMessage};
pub use component::{GroupComponent, GroupOptions};
pub use session::{
    Claim, ClaimRouter, ConsumerGroup, ConsumerGroupFactory, GroupHandler, GroupSession,
};
