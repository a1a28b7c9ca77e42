use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::{BorrowedMessage, Headers, Message};
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::{Offset, TopicPartitionList};
use tracing::{debug, warn};

use crate::error::MoverError;
use crate::kafka::config::ConsumerConfigBuilder;
use crate::pump::{Assignment, PumpSession};
use crate::types::{OffsetSpec, Partition, Record, RecordHeader};

/// One sequential stream of records, fanned in from every assigned partition.
///
/// Implementations are owned by a single pump and never shared across tasks.
#[async_trait]
pub trait RecordSource: Send {
    async fn assign(&mut self, assignment: &Assignment) -> Result<(), MoverError>;

    /// Wait up to `timeout` for the next record. `Ok(None)` means nothing arrived.
    async fn poll(&mut self, timeout: Duration) -> Result<Option<Record>, MoverError>;

    /// Stop fetching `partition`; records already buffered may still arrive.
    async fn pause(&mut self, _partition: &Partition) -> Result<(), MoverError> {
        Ok(())
    }

    /// Release the connection and any group membership.
    async fn close(&mut self);
}

pub struct KafkaRecordSource {
    consumer: Option<StreamConsumer>,
    group_id: String,
}

impl KafkaRecordSource {
    pub fn new(base: &ClientConfig, session: &PumpSession) -> Result<Self, MoverError> {
        let builder = match session.assignment() {
            Assignment::Subscribe(_) => {
                ConsumerConfigBuilder::for_group_consumer(base, session.group_id())
                    .with_auto_commit(session.commits_offsets())
            }
            Assignment::Manual(_) => {
                ConsumerConfigBuilder::for_assigned_consumer(base, session.group_id())
            }
        };

        let consumer: StreamConsumer = builder
            .with_offset_reset(session.offset_reset())
            .build()
            .create()
            .map_err(|e| MoverError::Configuration(e.to_string()))?;

        Ok(Self {
            consumer: Some(consumer),
            group_id: session.group_id().to_string(),
        })
    }
}

#[async_trait]
impl RecordSource for KafkaRecordSource {
    async fn assign(&mut self, assignment: &Assignment) -> Result<(), MoverError> {
        let Some(consumer) = &self.consumer else {
            return Err(MoverError::InvalidArgument(
                "cannot assign a closed consumer".to_string(),
            ));
        };

        match assignment {
            Assignment::Subscribe(topics) => {
                let topics: Vec<&str> = topics.iter().map(String::as_str).collect();
                consumer.subscribe(&topics).map_err(MoverError::Consume)?;
            }
            Assignment::Manual(positions) => {
                let mut tpl = TopicPartitionList::new();
                for position in positions {
                    tpl.add_partition_offset(
                        position.topic(),
                        position.partition_number(),
                        to_kafka_offset(position.offset()),
                    )
                    .map_err(MoverError::Consume)?;
                }
                consumer.assign(&tpl).map_err(MoverError::Consume)?;
            }
        }

        debug!(group = self.group_id, ?assignment, "Consumer assigned");
        Ok(())
    }

    async fn poll(&mut self, timeout: Duration) -> Result<Option<Record>, MoverError> {
        let Some(consumer) = &self.consumer else {
            return Ok(None);
        };

        match tokio::time::timeout(timeout, consumer.recv()).await {
            Err(_) => Ok(None),
            Ok(Ok(message)) => Ok(Some(record_from_message(&message))),
            Ok(Err(e)) if is_poll_timeout(&e) => Ok(None),
            Ok(Err(e)) => Err(MoverError::Consume(e)),
        }
    }

    async fn pause(&mut self, partition: &Partition) -> Result<(), MoverError> {
        let Some(consumer) = &self.consumer else {
            return Ok(());
        };
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition(partition.topic(), partition.partition_number());
        consumer.pause(&tpl).map_err(MoverError::Consume)
    }

    async fn close(&mut self) {
        let Some(consumer) = self.consumer.take() else {
            return;
        };

        // Dropping the consumer runs the blocking librdkafka close, which leaves the group
        if let Err(e) = tokio::task::spawn_blocking(move || drop(consumer)).await {
            warn!(group = self.group_id, "Failed to close consumer cleanly: {e}");
        }
        debug!(group = self.group_id, "Consumer closed");
    }
}

pub(crate) fn to_kafka_offset(offset: OffsetSpec) -> Offset {
    match offset {
        OffsetSpec::Offset(o) => Offset::Offset(o),
        OffsetSpec::Earliest => Offset::Beginning,
        OffsetSpec::Latest => Offset::End,
        OffsetSpec::Invalid => Offset::Invalid,
    }
}

fn is_poll_timeout(e: &KafkaError) -> bool {
    matches!(
        e,
        KafkaError::MessageConsumption(
            RDKafkaErrorCode::OperationTimedOut
                | RDKafkaErrorCode::RequestTimedOut
                | RDKafkaErrorCode::PartitionEOF
        )
    )
}

fn record_from_message(message: &BorrowedMessage<'_>) -> Record {
    let headers = message
        .headers()
        .map(|headers| {
            headers
                .iter()
                .map(|h| RecordHeader::new(h.key, h.value.map(<[u8]>::to_vec)))
                .collect()
        })
        .unwrap_or_default();

    Record {
        topic: message.topic().to_string(),
        partition: message.partition(),
        offset: message.offset(),
        key: message.key().map(<[u8]>::to_vec),
        value: message.payload().map(<[u8]>::to_vec),
        headers,
        timestamp: message.timestamp().to_millis(),
    }
}
