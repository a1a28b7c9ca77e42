//! Consumer lag and partition offset accounting.

use std::collections::BTreeMap;

use futures::future::join_all;
use metrics::gauge;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::MoverError;
use crate::kafka::groups::GroupAdmin;
use crate::kafka::metadata::ClusterMetadata;
use crate::metrics_consts::CONSUMER_LAG;
use crate::types::Watermark;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TopicLag {
    pub partitions: BTreeMap<i32, u64>,
    pub total: u64,
}

/// Lag of one group, per topic and partition. Built fresh for every call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LagReport {
    pub group: String,
    pub topics: BTreeMap<String, TopicLag>,
    pub total: u64,
    /// Partitions left out because their watermarks could not be fetched, as `topic/partition`
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub skipped: Vec<String>,
}

impl LagReport {
    fn new(group: &str) -> Self {
        Self {
            group: group.to_string(),
            ..Default::default()
        }
    }

    fn add(&mut self, topic: &str, partition: i32, lag: u64) {
        let topic_lag = self.topics.entry(topic.to_string()).or_default();
        topic_lag.partitions.insert(partition, lag);
        topic_lag.total += lag;
        self.total += lag;
    }

    pub fn partition_lag(&self, topic: &str, partition: i32) -> Option<u64> {
        self.topics.get(topic)?.partitions.get(&partition).copied()
    }
}

/// Messages a group is behind on a partition.
///
/// A partition the group never committed on counts its whole history as lag.
/// A commit past the high watermark (stale watermark) clamps to zero.
pub fn compute_lag(high: i64, committed: Option<i64>) -> u64 {
    let lag = match committed {
        Some(committed) => high - committed,
        None => high,
    };
    lag.max(0).unsigned_abs()
}

/// Lag of `group` on `topics`, or on every topic it committed on when `topics` is empty.
///
/// Failing to read the group's committed offsets fails the report; failing to
/// read one partition's watermarks only drops that partition.
pub async fn run_lag<C>(
    client: &C,
    group: &str,
    topics: &[String],
) -> Result<LagReport, MoverError>
where
    C: ClusterMetadata + GroupAdmin,
{
    if group.trim().is_empty() {
        return Err(MoverError::InvalidArgument(
            "a consumer group is required".to_string(),
        ));
    }

    let entries = client.committed_offsets(group, topics).await?;
    debug!(group, partitions = entries.len(), "Fetched committed offsets");

    let watermarks = join_all(
        entries
            .iter()
            .map(|entry| client.watermarks(&entry.topic, entry.partition)),
    )
    .await;

    let mut report = LagReport::new(group);
    for (entry, watermark) in entries.iter().zip(watermarks) {
        let watermark = match watermark {
            Ok(watermark) => watermark,
            Err(e) => {
                warn!(
                    group,
                    topic = entry.topic,
                    partition = entry.partition,
                    error = %e,
                    "Skipping partition, failed to fetch watermarks"
                );
                report
                    .skipped
                    .push(format!("{}/{}", entry.topic, entry.partition));
                continue;
            }
        };

        let lag = compute_lag(watermark.high(), entry.committed_offset);
        record_lag(&entry.topic, entry.partition, group, lag);
        report.add(&entry.topic, entry.partition, lag);
    }

    info!(
        group,
        topics = report.topics.len(),
        total = report.total,
        skipped = report.skipped.len(),
        "Computed consumer lag"
    );
    Ok(report)
}

/// Current watermarks of every partition of `topic`.
pub async fn run_topic_offsets<C>(
    client: &C,
    topic: &str,
) -> Result<BTreeMap<i32, Watermark>, MoverError>
where
    C: ClusterMetadata,
{
    let partitions = client.topic_partitions(topic).await?;
    let mut offsets = BTreeMap::new();
    for partition in partitions {
        let watermark = client.watermarks(topic, partition).await?;
        offsets.insert(partition, watermark);
    }
    Ok(offsets)
}

fn record_lag(topic: &str, partition: i32, group: &str, lag: u64) {
    gauge!(CONSUMER_LAG,
        "topic" => topic.to_string(),
        "partition" => partition.to_string(),
        "consumergroup" => group.to_string(),
    )
    .set(lag as f64);
}
