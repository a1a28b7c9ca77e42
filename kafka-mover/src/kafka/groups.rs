//! Consumer group offset store and group lifecycle.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::admin::{AdminClient, AdminOptions};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, Consumer};
use rdkafka::error::KafkaError;
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::{Offset, TopicPartitionList};
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::{is_timeout_error, MoverError};
use crate::kafka::config::ConsumerConfigBuilder;
use crate::types::ConsumerGroupOffsetEntry;

// A group whose last member is still leaving cannot be deleted yet
const NON_EMPTY_GROUP_RETRIES: u32 = 3;
const NON_EMPTY_GROUP_BACKOFF: Duration = Duration::from_millis(100);

#[async_trait]
pub trait GroupAdmin: Send + Sync {
    /// Committed offsets of `group`.
    ///
    /// With `topics` given, every partition of those topics is reported. With an
    /// empty slice, the group's topics are the ones holding at least one commit,
    /// and all their partitions are reported. Partitions never committed carry `None`.
    async fn committed_offsets(
        &self,
        group: &str,
        topics: &[String],
    ) -> Result<Vec<ConsumerGroupOffsetEntry>, MoverError>;

    /// Delete `group`. A group the broker does not know counts as deleted.
    async fn delete_group(&self, group: &str) -> Result<(), MoverError>;
}

#[derive(Clone)]
pub struct KafkaGroupAdmin {
    base: ClientConfig,
    admin: Arc<AdminClient<DefaultClientContext>>,
    timeout: Duration,
}

impl KafkaGroupAdmin {
    pub fn new(base: &ClientConfig, timeout: Duration) -> Result<Self, MoverError> {
        let admin: AdminClient<DefaultClientContext> = base
            .create()
            .map_err(|e| MoverError::Configuration(e.to_string()))?;
        Ok(Self {
            base: base.clone(),
            admin: Arc::new(admin),
            timeout,
        })
    }
}

#[async_trait]
impl GroupAdmin for KafkaGroupAdmin {
    async fn committed_offsets(
        &self,
        group: &str,
        topics: &[String],
    ) -> Result<Vec<ConsumerGroupOffsetEntry>, MoverError> {
        let base = self.base.clone();
        let group = group.to_string();
        let topics = topics.to_vec();
        let timeout = self.timeout;

        tokio::task::spawn_blocking(move || {
            let named = (!topics.is_empty()).then_some(topics.as_slice());
            fetch_committed_offsets(&base, &group, named, timeout)
        })
        .await
        .map_err(|e| MoverError::Task(e.to_string()))?
    }

    async fn delete_group(&self, group: &str) -> Result<(), MoverError> {
        let opts = AdminOptions::new().operation_timeout(Some(self.timeout));

        for attempt in 1..=NON_EMPTY_GROUP_RETRIES {
            let results = self
                .admin
                .delete_groups(&[group], &opts)
                .await
                .map_err(|e| MoverError::GroupDeletion {
                    group: group.to_string(),
                    reason: e.to_string(),
                })?;

            let mut retry = false;
            for result in results {
                match result {
                    Ok(deleted) => debug!(group = deleted, "Deleted consumer group"),
                    Err((_, RDKafkaErrorCode::GroupIdNotFound)) => {
                        debug!(group, "Consumer group already gone");
                    }
                    Err((_, RDKafkaErrorCode::NonEmptyGroup))
                        if attempt < NON_EMPTY_GROUP_RETRIES =>
                    {
                        retry = true;
                    }
                    Err((name, code)) => {
                        return Err(MoverError::GroupDeletion {
                            group: name,
                            reason: code.to_string(),
                        });
                    }
                }
            }

            if !retry {
                return Ok(());
            }
            sleep(NON_EMPTY_GROUP_BACKOFF * attempt).await;
        }

        Ok(())
    }
}

fn fetch_committed_offsets(
    base: &ClientConfig,
    group: &str,
    topics: Option<&[String]>,
    timeout: Duration,
) -> Result<Vec<ConsumerGroupOffsetEntry>, MoverError> {
    // A fresh consumer bound to the group id, never subscribed, so it never joins
    let consumer: BaseConsumer = ConsumerConfigBuilder::for_assigned_consumer(base, group)
        .build()
        .create()
        .map_err(|e| MoverError::Configuration(e.to_string()))?;

    let metadata = consumer
        .fetch_metadata(None, timeout)
        .map_err(|e| group_query_error("fetch_metadata", group, e))?;

    let mut tpl = TopicPartitionList::new();
    for topic in metadata.topics() {
        let name = topic.name();
        match topics {
            Some(wanted) if !wanted.iter().any(|t| t == name) => continue,
            None if name.starts_with("__") => continue,
            _ => {}
        }
        for partition in topic.partitions() {
            tpl.add_partition(name, partition.id());
        }
    }

    if let Some(wanted) = topics {
        let known: BTreeSet<&str> = metadata.topics().iter().map(|t| t.name()).collect();
        if let Some(missing) = wanted.iter().find(|t| !known.contains(t.as_str())) {
            return Err(MoverError::TopicNotFound(missing.clone()));
        }
    }

    if tpl.count() == 0 {
        return Ok(Vec::new());
    }

    let committed = consumer
        .committed_offsets(tpl, timeout)
        .map_err(|e| group_query_error("committed_offsets", group, e))?;

    let mut entries: Vec<ConsumerGroupOffsetEntry> = committed
        .elements()
        .iter()
        .map(|elem| ConsumerGroupOffsetEntry {
            group: group.to_string(),
            topic: elem.topic().to_string(),
            partition: elem.partition(),
            committed_offset: match elem.offset() {
                Offset::Offset(o) => Some(o),
                _ => None,
            },
        })
        .collect();

    if topics.is_none() {
        let committed_topics: BTreeSet<String> = entries
            .iter()
            .filter(|e| e.committed_offset.is_some())
            .map(|e| e.topic.clone())
            .collect();
        entries.retain(|e| committed_topics.contains(&e.topic));
    }

    entries.sort_by(|a, b| (&a.topic, a.partition).cmp(&(&b.topic, b.partition)));
    Ok(entries)
}

fn group_query_error(operation: &'static str, group: &str, e: KafkaError) -> MoverError {
    if is_timeout_error(&e) {
        return MoverError::MetadataTimeout {
            resource: format!("committed offsets of group '{group}'"),
        };
    }
    warn!(group, operation, error = %e, "Group offset query failed");
    MoverError::Metadata {
        operation,
        source: e,
    }
}
