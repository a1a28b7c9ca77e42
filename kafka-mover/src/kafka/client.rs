use async_trait::async_trait;
use rdkafka::config::ClientConfig;

use crate::config::Config;
use crate::error::MoverError;
use crate::kafka::config::producer_config;
use crate::kafka::groups::{GroupAdmin, KafkaGroupAdmin};
use crate::kafka::metadata::{ClusterMetadata, KafkaMetadataResolver};
use crate::kafka::sink::{KafkaRecordSink, RecordSink};
use crate::kafka::source::{KafkaRecordSource, RecordSource};
use crate::pump::PumpSession;
use crate::types::{ConsumerGroupOffsetEntry, Watermark};

/// Everything the engine needs from a cluster.
///
/// Sources and sinks are created per operation and owned by it exclusively.
#[async_trait]
pub trait BrokerClient: ClusterMetadata + GroupAdmin + Clone + 'static {
    type Source: RecordSource + 'static;
    type Sink: RecordSink + 'static;

    async fn create_source(&self, session: &PumpSession) -> Result<Self::Source, MoverError>;

    fn create_sink(&self) -> Result<Self::Sink, MoverError>;
}

#[derive(Clone)]
pub struct KafkaClient {
    consumer_config: ClientConfig,
    producer_config: ClientConfig,
    metadata: KafkaMetadataResolver,
    groups: KafkaGroupAdmin,
}

impl KafkaClient {
    /// Validates connection settings; no broker is contacted yet.
    pub fn new(config: &Config) -> Result<Self, MoverError> {
        let base = config.client_config()?;
        Ok(Self {
            producer_config: producer_config(&base, config),
            metadata: KafkaMetadataResolver::new(&base, config.metadata_timeout())?,
            groups: KafkaGroupAdmin::new(&base, config.metadata_timeout())?,
            consumer_config: base,
        })
    }
}

#[async_trait]
impl ClusterMetadata for KafkaClient {
    async fn watermarks(&self, topic: &str, partition: i32) -> Result<Watermark, MoverError> {
        self.metadata.watermarks(topic, partition).await
    }

    async fn topic_partitions(&self, topic: &str) -> Result<Vec<i32>, MoverError> {
        self.metadata.topic_partitions(topic).await
    }
}

#[async_trait]
impl GroupAdmin for KafkaClient {
    async fn committed_offsets(
        &self,
        group: &str,
        topics: &[String],
    ) -> Result<Vec<ConsumerGroupOffsetEntry>, MoverError> {
        self.groups.committed_offsets(group, topics).await
    }

    async fn delete_group(&self, group: &str) -> Result<(), MoverError> {
        self.groups.delete_group(group).await
    }
}

#[async_trait]
impl BrokerClient for KafkaClient {
    type Source = KafkaRecordSource;
    type Sink = KafkaRecordSink;

    async fn create_source(&self, session: &PumpSession) -> Result<Self::Source, MoverError> {
        KafkaRecordSource::new(&self.consumer_config, session)
    }

    fn create_sink(&self) -> Result<Self::Sink, MoverError> {
        KafkaRecordSink::new(&self.producer_config)
    }
}
