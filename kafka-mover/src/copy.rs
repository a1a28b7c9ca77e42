//! Copies records from one topic to another.
//!
//! Without a begin offset the copy follows a group subscription and runs
//! until cancelled or until the limit is reached. With one, every partition is
//! read from `max(begin, low)` up to `min(end, high)`, `high` being the
//! watermark when the copy started.

use std::collections::HashMap;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::MoverError;
use crate::kafka::client::BrokerClient;
use crate::kafka::metadata::ClusterMetadata;
use crate::key_filter::KeyFilter;
use crate::pump::{Assignment, MessagePump, OffsetReset, PumpSession};
use crate::republisher::{DeliveryMode, Destination, Republisher};
use crate::types::{OffsetSpec, Partition, TopicPartitionOffset};

const PROGRESS_INTERVAL: u64 = 100;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CopyRequest {
    pub source_topic: String,
    pub dest_topic: String,
    pub from_beginning: bool,
    pub from_latest: bool,
    pub begin_offset: Option<i64>,
    pub end_offset: Option<i64>,
    pub limit: Option<u64>,
    pub key_filter: Option<String>,
}

impl CopyRequest {
    pub fn new(source_topic: impl Into<String>, dest_topic: impl Into<String>) -> Self {
        Self {
            source_topic: source_topic.into(),
            dest_topic: dest_topic.into(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), MoverError> {
        if self.source_topic.trim().is_empty() || self.dest_topic.trim().is_empty() {
            return Err(MoverError::InvalidArgument(
                "source and destination topics are required".to_string(),
            ));
        }
        if self.source_topic == self.dest_topic {
            return Err(MoverError::InvalidArgument(
                "source and destination topics must differ".to_string(),
            ));
        }
        if self.from_beginning && self.from_latest {
            return Err(MoverError::InvalidArgument(
                "--from-beginning and --from-latest are mutually exclusive".to_string(),
            ));
        }
        match (self.begin_offset, self.end_offset) {
            (None, Some(_)) => Err(MoverError::InvalidArgument(
                "--end-offset requires --begin-offset".to_string(),
            )),
            (Some(begin), _) if begin < 0 => Err(MoverError::InvalidArgument(format!(
                "--begin-offset must be non-negative, got {begin}"
            ))),
            (Some(begin), Some(end)) if end <= begin => Err(MoverError::InvalidArgument(format!(
                "--end-offset ({end}) must be greater than --begin-offset ({begin})"
            ))),
            _ => Ok(()),
        }
    }

    /// Copies start from the latest offset unless asked otherwise.
    pub fn offset_reset(&self) -> OffsetReset {
        if self.from_beginning {
            OffsetReset::Earliest
        } else {
            OffsetReset::Latest
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CopyReport {
    pub copied: u64,
    pub delivered: u64,
    pub failed: u64,
    pub undelivered: u64,
    /// Records in the requested range; `None` for an open-ended copy
    pub expected: Option<u64>,
}

/// Per-partition start positions and bounds of a range copy.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct RangePlan {
    pub positions: Vec<TopicPartitionOffset>,
    pub bounds: HashMap<Partition, i64>,
    pub expected: u64,
}

pub(crate) async fn plan_range<C: ClusterMetadata>(
    client: &C,
    topic: &str,
    begin: i64,
    end: Option<i64>,
) -> Result<RangePlan, MoverError> {
    let mut plan = RangePlan::default();
    for partition in client.topic_partitions(topic).await? {
        let watermark = client.watermarks(topic, partition).await?;
        let start = begin.max(watermark.low());
        let stop = end.map_or(watermark.high(), |end| end.min(watermark.high()));
        if start >= stop {
            continue;
        }
        plan.expected += (stop - start).unsigned_abs();
        plan.positions.push(TopicPartitionOffset::new(
            topic,
            partition,
            OffsetSpec::Offset(start),
        )?);
        plan.bounds.insert(Partition::new(topic, partition), stop);
    }
    Ok(plan)
}

pub async fn run_copy<C: BrokerClient>(
    client: &C,
    config: &Config,
    request: &CopyRequest,
    cancel: CancellationToken,
) -> Result<CopyReport, MoverError> {
    request.validate()?;

    // Fail on a missing destination before reading anything
    client.topic_partitions(&request.dest_topic).await?;

    let (assignment, bounds, expected) = match request.begin_offset {
        None => (
            Assignment::Subscribe(vec![request.source_topic.clone()]),
            HashMap::new(),
            None,
        ),
        Some(begin) => {
            let plan =
                plan_range(client, &request.source_topic, begin, request.end_offset).await?;
            if plan.positions.is_empty() {
                info!(
                    topic = request.source_topic,
                    begin,
                    end = request.end_offset,
                    "No records in the requested range"
                );
                return Ok(CopyReport {
                    expected: Some(0),
                    ..Default::default()
                });
            }
            (
                Assignment::Manual(plan.positions),
                plan.bounds,
                Some(plan.expected),
            )
        }
    };

    let key_filter = request
        .key_filter
        .as_deref()
        .filter(|pattern| !pattern.is_empty())
        .map(KeyFilter::parse);

    let session = PumpSession::new(
        config,
        "copy",
        None,
        assignment,
        request.offset_reset(),
    )?
    .with_limit(request.limit)
    .with_key_filter(key_filter)
    .with_bounds(bounds)
    .with_cancellation(cancel);

    let mut republisher = Republisher::new(
        client.create_sink()?,
        Destination {
            topic: request.dest_topic.clone(),
            partition: None,
            preserve_timestamp: false,
        },
        DeliveryMode::FireAndForget,
        config,
    );

    info!(
        source = request.source_topic,
        destination = request.dest_topic,
        expected,
        limit = request.limit,
        "Starting copy"
    );

    let source = client.create_source(&session).await?;
    let mut pump = MessagePump::start(session, source, client.clone()).await?;

    let mut copied = 0;
    let outcome = loop {
        match pump.next().await {
            Ok(Some(record)) => {
                if let Err(e) = republisher.publish(record).await {
                    break Err(e);
                }
                copied += 1;
                if copied % PROGRESS_INTERVAL == 0 {
                    info!(copied, expected, "Copy progress");
                }
            }
            Ok(None) => break Ok(()),
            Err(e) => break Err(e),
        }
    };
    pump.close().await;

    // Whatever was handed to the producer gets flushed, even when reading failed
    let delivery = republisher.finish().await?;
    outcome?;

    if let Err(e) = delivery.check_complete() {
        warn!(
            destination = request.dest_topic,
            error = %e,
            "Copy finished with undelivered records"
        );
    }
    if delivery.failed > 0 {
        warn!(
            destination = request.dest_topic,
            failed = delivery.failed,
            "Some records failed to deliver"
        );
    }

    info!(
        source = request.source_topic,
        destination = request.dest_topic,
        copied,
        delivered = delivery.delivered,
        "Copy complete"
    );

    Ok(CopyReport {
        copied,
        delivered: delivery.delivered,
        failed: delivery.failed,
        undelivered: delivery.undelivered,
        expected,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::InMemoryCluster;

    fn request() -> CopyRequest {
        CopyRequest::new("orders", "orders-backup")
    }

    #[test]
    fn test_flag_validation() {
        assert!(request().validate().is_ok());
        assert_eq!(request().offset_reset(), OffsetReset::Latest);

        let mut both = request();
        both.from_beginning = true;
        both.from_latest = true;
        assert!(both.validate().is_err());

        let mut end_only = request();
        end_only.end_offset = Some(10);
        assert!(end_only.validate().is_err());

        let mut inverted = request();
        inverted.begin_offset = Some(10);
        inverted.end_offset = Some(10);
        assert!(inverted.validate().is_err());

        let mut negative = request();
        negative.begin_offset = Some(-1);
        assert!(negative.validate().is_err());

        let mut same = request();
        same.dest_topic = "orders".to_string();
        assert!(same.validate().is_err());

        let mut beginning = request();
        beginning.from_beginning = true;
        assert_eq!(beginning.offset_reset(), OffsetReset::Earliest);
    }

    #[tokio::test]
    async fn test_range_plan_clamps_to_watermarks() {
        let cluster = InMemoryCluster::new();
        cluster.create_topic("orders", 3);
        for _ in 0..10 {
            cluster.append("orders", 0, None, b"v");
            cluster.append("orders", 1, None, b"v");
        }
        for _ in 0..3 {
            cluster.append("orders", 2, None, b"v");
        }
        cluster.truncate("orders", 1, 6);

        let plan = plan_range(&cluster, "orders", 4, Some(8)).await.unwrap();

        // p0: 4..8, p1: 6..8, p2: 4..3 is empty
        assert_eq!(plan.expected, 6);
        assert_eq!(plan.positions.len(), 2);
        assert_eq!(plan.positions[1].offset(), OffsetSpec::Offset(6));
        assert_eq!(plan.bounds[&Partition::new("orders", 0)], 8);
        assert!(!plan.bounds.contains_key(&Partition::new("orders", 2)));

        let open_ended = plan_range(&cluster, "orders", 0, None).await.unwrap();
        assert_eq!(open_ended.expected, 10 + 4 + 3);
    }
}
