use std::fmt;

use serde::Serialize;

use crate::error::MoverError;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Partition {
    topic: String,
    partition_number: i32,
}

impl Partition {
    pub fn new(topic: impl Into<String>, partition_number: i32) -> Self {
        Self {
            topic: topic.into(),
            partition_number,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition_number(&self) -> i32 {
        self.partition_number
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.topic, self.partition_number)
    }
}

/// A concrete offset or one of the symbolic positions understood by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OffsetSpec {
    Offset(i64),
    Earliest,
    Latest,
    Invalid,
}

/// A position within a partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicPartitionOffset {
    partition: Partition,
    offset: OffsetSpec,
}

impl TopicPartitionOffset {
    pub fn new(
        topic: impl Into<String>,
        partition_number: i32,
        offset: OffsetSpec,
    ) -> Result<Self, MoverError> {
        if partition_number < 0 {
            return Err(MoverError::InvalidArgument(format!(
                "partition must be non-negative, got {partition_number}"
            )));
        }
        if let OffsetSpec::Offset(o) = offset {
            if o < 0 {
                return Err(MoverError::InvalidArgument(format!(
                    "offset must be non-negative, got {o}"
                )));
            }
        }
        Ok(Self {
            partition: Partition::new(topic, partition_number),
            offset,
        })
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn topic(&self) -> &str {
        self.partition.topic()
    }

    pub fn partition_number(&self) -> i32 {
        self.partition.partition_number()
    }

    pub fn offset(&self) -> OffsetSpec {
        self.offset
    }
}

/// Offset bounds of a partition. `high` is exclusive: the next offset to be produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Watermark {
    low: i64,
    high: i64,
}

impl Watermark {
    pub fn new(low: i64, high: i64) -> Result<Self, MoverError> {
        if low > high {
            return Err(MoverError::InvalidWatermark { low, high });
        }
        Ok(Self { low, high })
    }

    pub fn low(&self) -> i64 {
        self.low
    }

    pub fn high(&self) -> i64 {
        self.high
    }

    pub fn is_empty(&self) -> bool {
        self.low == self.high
    }

    /// Number of offsets currently retained on the partition
    pub fn len(&self) -> u64 {
        (self.high - self.low).unsigned_abs()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordHeader {
    pub name: String,
    pub value: Option<Vec<u8>>,
}

impl RecordHeader {
    pub fn new(name: impl Into<String>, value: Option<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// A record read from a partition. Owned outright by whoever processes it next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub value: Option<Vec<u8>>,
    pub headers: Vec<RecordHeader>,
    /// Milliseconds since the epoch, when the broker reported one
    pub timestamp: Option<i64>,
}

impl Record {
    pub fn source_partition(&self) -> Partition {
        Partition::new(self.topic.clone(), self.partition)
    }
}

/// Committed offset of a group on one partition; `None` when the group never committed there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerGroupOffsetEntry {
    pub group: String,
    pub topic: String,
    pub partition: i32,
    pub committed_offset: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_partition_offset_validation() {
        assert!(TopicPartitionOffset::new("t", 0, OffsetSpec::Offset(0)).is_ok());
        assert!(TopicPartitionOffset::new("t", 2, OffsetSpec::Latest).is_ok());
        assert!(TopicPartitionOffset::new("t", -1, OffsetSpec::Earliest).is_err());
        assert!(TopicPartitionOffset::new("t", 0, OffsetSpec::Offset(-5)).is_err());
    }

    #[test]
    fn test_watermark_invariants() {
        let wm = Watermark::new(10, 25).unwrap();
        assert_eq!(wm.len(), 15);
        assert!(!wm.is_empty());
        assert!(Watermark::new(7, 7).unwrap().is_empty());
        assert!(matches!(
            Watermark::new(8, 3),
            Err(MoverError::InvalidWatermark { low: 8, high: 3 })
        ));
    }
}
