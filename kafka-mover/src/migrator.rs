//! Moves the records of one partition onto another partition of the same topic.
//!
//! The move is bounded by the source's watermarks as of the start: records
//! appended afterwards stay behind. Every record is republished synchronously
//! with its key, value, headers and timestamp, so the destination receives
//! them in source order and a failed delivery stops the move at a known offset.

use std::collections::HashMap;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::MoverError;
use crate::kafka::client::BrokerClient;
use crate::pump::{Assignment, MessagePump, OffsetReset, PumpSession, StopReason};
use crate::republisher::{DeliveryMode, Destination, Republisher};
use crate::types::{OffsetSpec, Partition, TopicPartitionOffset};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoveRequest {
    pub topic: String,
    pub source_partition: i32,
    pub dest_partition: i32,
    /// Removing moved records from the source is not something the broker can do
    pub delete_source: bool,
}

impl MoveRequest {
    pub fn new(topic: impl Into<String>, source_partition: i32, dest_partition: i32) -> Self {
        Self {
            topic: topic.into(),
            source_partition,
            dest_partition,
            delete_source: false,
        }
    }

    pub fn validate(&self) -> Result<(), MoverError> {
        if self.delete_source {
            return Err(MoverError::Unsupported(
                "deleting records from the source partition",
            ));
        }
        if self.topic.trim().is_empty() {
            return Err(MoverError::InvalidArgument("a topic is required".to_string()));
        }
        if self.source_partition < 0 || self.dest_partition < 0 {
            return Err(MoverError::InvalidArgument(
                "partitions must be non-negative".to_string(),
            ));
        }
        if self.source_partition == self.dest_partition {
            return Err(MoverError::InvalidArgument(format!(
                "source and destination partition must differ, both are {}",
                self.source_partition
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MoveReport {
    pub moved: u64,
    pub expected: u64,
    /// `None` when there was nothing to move
    #[serde(skip)]
    pub stop_reason: Option<StopReason>,
}

impl MoveReport {
    pub fn is_complete(&self) -> bool {
        self.moved == self.expected
    }
}

pub async fn run_move_partition<C: BrokerClient>(
    client: &C,
    config: &Config,
    request: &MoveRequest,
    cancel: CancellationToken,
) -> Result<MoveReport, MoverError> {
    request.validate()?;

    let partitions = client.topic_partitions(&request.topic).await?;
    for partition in [request.source_partition, request.dest_partition] {
        if !partitions.contains(&partition) {
            return Err(MoverError::PartitionNotFound {
                topic: request.topic.clone(),
                partition,
            });
        }
    }

    let watermark = client
        .watermarks(&request.topic, request.source_partition)
        .await?;
    if watermark.is_empty() {
        info!(
            topic = request.topic,
            partition = request.source_partition,
            "Source partition is empty, nothing to move"
        );
        return Ok(MoveReport {
            moved: 0,
            expected: 0,
            stop_reason: None,
        });
    }

    let expected = watermark.len();
    let source = Partition::new(request.topic.clone(), request.source_partition);
    let start = TopicPartitionOffset::new(
        request.topic.clone(),
        request.source_partition,
        OffsetSpec::Offset(watermark.low()),
    )?;

    let session = PumpSession::new(
        config,
        "move",
        None,
        Assignment::Manual(vec![start]),
        OffsetReset::Earliest,
    )?
    .with_bounds(HashMap::from([(source, watermark.high())]))
    .with_cancellation(cancel);

    let sink = client.create_sink()?;
    let mut republisher = Republisher::new(
        sink,
        Destination {
            topic: request.topic.clone(),
            partition: Some(request.dest_partition),
            preserve_timestamp: true,
        },
        DeliveryMode::Synchronous,
        config,
    );

    info!(
        topic = request.topic,
        from = request.source_partition,
        to = request.dest_partition,
        low = watermark.low(),
        high = watermark.high(),
        "Moving partition"
    );

    let source = client.create_source(&session).await?;
    let mut pump = MessagePump::start(session, source, client.clone()).await?;

    let mut moved = 0;
    let outcome = loop {
        match pump.next().await {
            Ok(Some(record)) => {
                if let Err(e) = republisher.publish(record).await {
                    break Err(e);
                }
                moved += 1;
            }
            Ok(None) => break Ok(()),
            Err(e) => break Err(e),
        }
    };
    let stop_reason = pump.stop_reason();
    pump.close().await;

    if let Err(e) = outcome {
        warn!(topic = request.topic, moved, error = %e, "Partition move aborted");
        return Err(e);
    }

    let delivery = republisher.finish().await?;
    if let Err(e) = delivery.check_complete() {
        warn!(topic = request.topic, error = %e, "Partition move flush incomplete");
    }

    let report = MoveReport {
        moved,
        expected,
        stop_reason,
    };
    if report.is_complete() {
        info!(topic = request.topic, moved, "Partition move complete");
    } else {
        warn!(
            topic = request.topic,
            moved,
            expected,
            reason = stop_reason.map(|r| r.as_str()),
            "Partition move stopped before the watermark"
        );
    }
    Ok(report)
}
