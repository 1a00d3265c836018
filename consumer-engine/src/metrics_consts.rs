// ==== Single-message supervisor metrics ====
/// Counter for messages delivered to a supervisor, labelled by `component`
pub const MESSAGES_RECEIVED: &str = "consumer_messages_received_total";

/// Counter for processed messages, labelled by `component` and `status` (`success`, `error`)
pub const MESSAGES_PROCESSED: &str = "consumer_messages_processed_total";

/// Counter for failed connect attempts of any component, labelled by `component`
pub const CONSUMER_ERRORS: &str = "consumer_errors_total";

/// Gauge for dispatch slots in use by concurrent workers
pub const WORKER_SATURATION: &str = "consumer_worker_saturation";

// ==== Batch group engine metrics ====
/// Counter for messages delivered to a claim, labelled by `topic`, `partition` and `status`
pub const BATCH_MESSAGES_RECEIVED: &str = "consumer_group_messages_received_total";

/// Gauge for the last offset received per partition
pub const PARTITION_RECEIVED_OFFSET: &str = "consumer_group_partition_received_offset";

/// Gauge for the distance between the high watermark and the last received offset
pub const PARTITION_OFFSET_LAG: &str = "consumer_group_partition_offset_lag";

/// Histogram for flushed batch sizes
pub const BATCH_SIZE: &str = "consumer_group_batch_size";

/// Histogram for the time spent in the batch processor, in milliseconds
pub const BATCH_PROCESSING_MS: &str = "consumer_group_batch_processing_ms";

/// Counter for flushed batches, labelled by `outcome` (`success`, `error`, `skipped`)
pub const BATCHES_FLUSHED: &str = "consumer_group_batches_flushed_total";

/// Counter for messages in batches that failed and were skipped
pub const MESSAGES_SKIPPED: &str = "consumer_group_messages_skipped_total";

/// Counter for consumer group sessions started
pub const GROUP_SESSIONS: &str = "consumer_group_sessions_total";

// ==== Offset resolver metrics ====
/// Histogram for the time taken to resolve every partition of a topic, in milliseconds
pub const RESOLVE_DURATION_MS: &str = "offset_resolver_duration_ms";

/// Counter for message fetches issued by the binary search
pub const RESOLVE_FETCHES: &str = "offset_resolver_fetches_total";

/// Counter for resolutions, labelled by `outcome` (`success`, `error`, `timeout`)
pub const RESOLVE_OUTCOMES: &str = "offset_resolver_resolutions_total";

// ==== Kafka client metrics ====
/// Counter for errors surfaced by librdkafka, labelled by `level` and `error`
pub const KAFKA_ERRORS: &str = "consumer_kafka_errors_total";

/// Counter for offset commits issued by a group member, labelled by `mode` and `outcome`
pub const OFFSET_COMMITS: &str = "consumer_group_offset_commits_total";

/// Counter for rebalance callbacks, labelled by `event_type`
pub const REBALANCE_EVENTS: &str = "consumer_group_rebalance_events_total";
