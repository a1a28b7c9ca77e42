//! Read-only cluster queries: partition lists and watermarks.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, Consumer};
use rdkafka::types::RDKafkaErrorCode;
use tracing::debug;

use crate::error::MoverError;
use crate::types::Watermark;

#[async_trait]
pub trait ClusterMetadata: Send + Sync {
    /// Current (low, high) offsets of a partition.
    async fn watermarks(&self, topic: &str, partition: i32) -> Result<Watermark, MoverError>;

    /// Partition ids of a topic, ascending.
    async fn topic_partitions(&self, topic: &str) -> Result<Vec<i32>, MoverError>;
}

/// Metadata resolver backed by a non-joining `BaseConsumer`.
///
/// librdkafka queries block the calling thread, so each one runs on the
/// blocking pool.
#[derive(Clone)]
pub struct KafkaMetadataResolver {
    consumer: Arc<BaseConsumer>,
    timeout: Duration,
}

impl KafkaMetadataResolver {
    /// The config should NOT include `group.id`; nothing here joins a group.
    pub fn new(config: &ClientConfig, timeout: Duration) -> Result<Self, MoverError> {
        let consumer: BaseConsumer = config
            .create()
            .map_err(|e| MoverError::Configuration(e.to_string()))?;
        Ok(Self {
            consumer: Arc::new(consumer),
            timeout,
        })
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, MoverError>
    where
        T: Send + 'static,
        F: FnOnce(&BaseConsumer, Duration) -> Result<T, MoverError> + Send + 'static,
    {
        let consumer = self.consumer.clone();
        let timeout = self.timeout;
        tokio::task::spawn_blocking(move || f(&consumer, timeout))
            .await
            .map_err(|e| MoverError::Task(e.to_string()))?
    }
}

#[async_trait]
impl ClusterMetadata for KafkaMetadataResolver {
    async fn watermarks(&self, topic: &str, partition: i32) -> Result<Watermark, MoverError> {
        let topic = topic.to_string();
        self.blocking(move |consumer, timeout| {
            // fetch_watermarks queries the partition leader directly, no cached values
            let (low, high) = consumer
                .fetch_watermarks(&topic, partition, timeout)
                .map_err(|e| {
                    MoverError::from_metadata_error("fetch_watermarks", &topic, Some(partition), e)
                })?;
            debug!(topic, partition, low, high, "Fetched watermarks");
            Watermark::new(low, high)
        })
        .await
    }

    async fn topic_partitions(&self, topic: &str) -> Result<Vec<i32>, MoverError> {
        let topic = topic.to_string();
        self.blocking(move |consumer, timeout| {
            let metadata = consumer
                .fetch_metadata(Some(&topic), timeout)
                .map_err(|e| MoverError::from_metadata_error("fetch_metadata", &topic, None, e))?;

            let Some(found) = metadata.topics().iter().find(|t| t.name() == topic) else {
                return Err(MoverError::TopicNotFound(topic));
            };

            if let Some(err) = found.error() {
                let code = RDKafkaErrorCode::from(err);
                if matches!(
                    code,
                    RDKafkaErrorCode::UnknownTopicOrPartition | RDKafkaErrorCode::UnknownTopic
                ) {
                    return Err(MoverError::TopicNotFound(topic));
                }
                return Err(MoverError::Metadata {
                    operation: "fetch_metadata",
                    source: rdkafka::error::KafkaError::MetadataFetch(code),
                });
            }

            let mut partitions: Vec<i32> = found.partitions().iter().map(|p| p.id()).collect();
            if partitions.is_empty() {
                return Err(MoverError::TopicNotFound(topic));
            }
            partitions.sort_unstable();
            Ok(partitions)
        })
        .await
    }
}
