use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use common_kafka::Partition;
use common_metrics::MetricsSink;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance};
use rdkafka::error::KafkaResult;
use rdkafka::{ClientContext, Offset, TopicPartitionList};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::metrics_consts::{OFFSET_COMMITS, REBALANCE_EVENTS};

/// Membership changes reported from the librdkafka rebalance callbacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RebalanceEvent {
    Assigned(Vec<Partition>),
    Revoked(Vec<Partition>),
    Failed(String),
}

/// Next offsets marked by claims and not yet committed.
#[derive(Debug, Default)]
pub(crate) struct MarkedOffsets {
    offsets: Mutex<HashMap<Partition, i64>>,
}

impl MarkedOffsets {
    /// Marks only move forward.
    pub(crate) fn mark(&self, partition: &Partition, next_offset: i64) {
        let mut offsets = self.offsets.lock().unwrap_or_else(|e| e.into_inner());
        let current = offsets.entry(partition.clone()).or_insert(next_offset);
        if *current < next_offset {
            *current = next_offset;
        }
    }

    pub(crate) fn snapshot(&self) -> HashMap<Partition, i64> {
        self.offsets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub(crate) fn forget(&self, partitions: &[Partition]) {
        let mut offsets = self.offsets.lock().unwrap_or_else(|e| e.into_inner());
        for partition in partitions {
            offsets.remove(partition);
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.offsets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_empty()
    }
}

pub(crate) fn commit_list(offsets: &HashMap<Partition, i64>) -> KafkaResult<TopicPartitionList> {
    let mut list = TopicPartitionList::new();
    for (partition, next_offset) in offsets {
        list.add_partition_offset(
            partition.topic(),
            partition.partition_number(),
            Offset::Offset(*next_offset),
        )?;
    }
    Ok(list)
}

fn partitions_of(list: &TopicPartitionList) -> Vec<Partition> {
    list.elements().into_iter().map(Partition::from).collect()
}

pub(crate) struct GroupContext {
    events: mpsc::UnboundedSender<RebalanceEvent>,
    marked: Arc<MarkedOffsets>,
    metrics: Arc<dyn MetricsSink>,
}

impl GroupContext {
    pub(crate) fn new(
        events: mpsc::UnboundedSender<RebalanceEvent>,
        marked: Arc<MarkedOffsets>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            events,
            marked,
            metrics,
        }
    }

    fn count(&self, event_type: &str) {
        let labels = [("event_type".to_string(), event_type.to_string())];
        self.metrics.increment(REBALANCE_EVENTS, &labels, 1);
    }

    fn send(&self, event: RebalanceEvent) {
        if let Err(e) = self.events.send(event) {
            debug!("rebalance event dropped, session already ended: {:?}", e.0);
        }
    }

    // Runs on the polling thread before the partitions are handed back to the group, so
    // whatever was marked for them is committed while this member still owns them.
    fn commit_revoked(&self, consumer: &BaseConsumer<Self>, revoked: &[Partition]) {
        let marked: HashMap<Partition, i64> = self
            .marked
            .snapshot()
            .into_iter()
            .filter(|(partition, _)| revoked.contains(partition))
            .collect();
        if marked.is_empty() {
            return;
        }

        let committed =
            commit_list(&marked).and_then(|list| consumer.commit(&list, CommitMode::Sync));
        let outcome = match committed {
            Ok(()) => {
                info!(partitions = marked.len(), "committed marked offsets of revoked partitions");
                "success"
            }
            Err(e) => {
                warn!(error = %e, "failed to commit marked offsets of revoked partitions");
                "error"
            }
        };
        let labels = [
            ("mode".to_string(), "revoke".to_string()),
            ("outcome".to_string(), outcome.to_string()),
        ];
        self.metrics.increment(OFFSET_COMMITS, &labels, 1);
    }
}

impl ClientContext for GroupContext {}

impl ConsumerContext for GroupContext {
    fn pre_rebalance(&self, base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Revoke(partitions) => {
                if partitions.count() == 0 {
                    debug!("skipping empty revoke");
                    return;
                }
                let revoked = partitions_of(partitions);
                info!(partitions = revoked.len(), "partitions revoked");
                self.count("revoke");

                self.commit_revoked(base_consumer, &revoked);
                self.marked.forget(&revoked);
                self.send(RebalanceEvent::Revoked(revoked));
            }
            Rebalance::Assign(partitions) => {
                debug!(partitions = partitions.count(), "pre-rebalance assign");
            }
            Rebalance::Error(e) => {
                error!(error = %e, "rebalance failed");
                self.count("error");
                self.send(RebalanceEvent::Failed(e.to_string()));
            }
        }
    }

    fn post_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        if let Rebalance::Assign(partitions) = rebalance {
            if partitions.count() == 0 {
                debug!("skipping empty assign");
                return;
            }
            let assigned = partitions_of(partitions);
            info!(partitions = assigned.len(), "partitions assigned");
            self.count("assign");
            self.send(RebalanceEvent::Assigned(assigned));
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        match result {
            Ok(()) => debug!(partitions = offsets.count(), "offsets committed"),
            Err(e) => warn!(error = %e, "offset commit failed"),
        }
    }
}
