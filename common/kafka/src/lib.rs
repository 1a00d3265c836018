pub mod client_config;
pub mod config;
pub mod types;

pub use client_config::ConsumerConfigBuilder;
pub use types::Partition;
