use std::fmt;

use rdkafka::topic_partition_list::TopicPartitionListElem;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Partition {
    topic: String,
    partition_number: i32,
}

impl Partition {
    pub fn new(topic: String, partition_number: i32) -> Self {
        Self {
            topic,
            partition_number,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition_number(&self) -> i32 {
        self.partition_number
    }

    /// Metric labels identifying this partition
    pub fn labels(&self) -> Vec<(String, String)> {
        vec![
            ("topic".to_string(), self.topic.clone()),
            ("partition".to_string(), self.partition_number.to_string()),
        ]
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.topic, self.partition_number)
    }
}

impl From<TopicPartitionListElem<'_>> for Partition {
    fn from(elem: TopicPartitionListElem<'_>) -> Self {
        Self::new(elem.topic().to_string(), elem.partition())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rdkafka::{Offset, TopicPartitionList};

    #[test]
    fn test_partition_from_tpl_element() {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset("events", 3, Offset::Beginning)
            .unwrap();

        let partitions: Vec<Partition> = tpl.elements().into_iter().map(Partition::from).collect();
        assert_eq!(partitions, vec![Partition::new("events".to_string(), 3)]);
        assert_eq!(partitions[0].to_string(), "events/3");
    }

    #[test]
    fn test_partition_labels() {
        let partition = Partition::new("events".to_string(), 7);
        assert_eq!(
            partition.labels(),
            vec![
                ("topic".to_string(), "events".to_string()),
                ("partition".to_string(), "7".to_string()),
            ]
        );
    }
}
