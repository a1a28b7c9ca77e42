use rdkafka::error::KafkaError;
use rdkafka::types::RDKafkaErrorCode;
use thiserror::Error;

/// Errors raised by the message-movement engine.
///
/// Variants map onto how the caller should react: configuration and argument
/// problems abort before any I/O, metadata and consume failures abort the
/// requesting operation, and delivery problems depend on the republish mode.
#[derive(Error, Debug)]
pub enum MoverError {
    /// Bootstrap or security settings were rejected
    #[error("invalid client configuration: {0}")]
    Configuration(String),

    /// A request was rejected before reaching the broker
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("timed out querying {resource}")]
    MetadataTimeout { resource: String },

    #[error("topic '{0}' not found")]
    TopicNotFound(String),

    #[error("partition {partition} does not exist in topic '{topic}'")]
    PartitionNotFound { topic: String, partition: i32 },

    /// Any other broker failure while querying cluster state
    #[error("kafka error during {operation}: {source}")]
    Metadata {
        operation: &'static str,
        #[source]
        source: KafkaError,
    },

    /// Non-timeout read failure, fatal for the pump
    #[error("consumer error: {0}")]
    Consume(#[source] KafkaError),

    #[error("failed to deliver record {topic}/{partition}@{offset} to '{destination}': {reason}")]
    DeliveryFailure {
        topic: String,
        partition: i32,
        offset: i64,
        destination: String,
        reason: String,
    },

    #[error("flush incomplete: {delivered} records delivered, {undelivered} still undelivered")]
    IncompleteDelivery { delivered: u64, undelivered: u64 },

    #[error("operation not supported: {0}")]
    Unsupported(&'static str),

    #[error("failed to delete consumer group '{group}': {reason}")]
    GroupDeletion { group: String, reason: String },

    #[error("inconsistent watermarks: low {low} is above high {high}")]
    InvalidWatermark { low: i64, high: i64 },

    #[error("background task failed: {0}")]
    Task(String),
}

impl MoverError {
    /// Returns the error type tag for metrics
    pub fn error_type(&self) -> &'static str {
        match self {
            MoverError::Configuration(_) => "configuration",
            MoverError::InvalidArgument(_) => "invalid_argument",
            MoverError::MetadataTimeout { .. } => "metadata_timeout",
            MoverError::TopicNotFound(_) => "topic_not_found",
            MoverError::PartitionNotFound { .. } => "partition_not_found",
            MoverError::Metadata { .. } => "metadata",
            MoverError::Consume(_) => "consume",
            MoverError::DeliveryFailure { .. } => "delivery_failure",
            MoverError::IncompleteDelivery { .. } => "incomplete_delivery",
            MoverError::Unsupported(_) => "unsupported",
            MoverError::GroupDeletion { .. } => "group_deletion",
            MoverError::InvalidWatermark { .. } => "invalid_watermark",
            MoverError::Task(_) => "task",
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, MoverError::MetadataTimeout { .. })
    }

    /// Classify a failed metadata/watermark query against a topic.
    pub(crate) fn from_metadata_error(
        operation: &'static str,
        topic: &str,
        partition: Option<i32>,
        source: KafkaError,
    ) -> Self {
        if is_timeout_error(&source) {
            let resource = match partition {
                Some(partition) => format!("topic '{topic}' partition {partition}"),
                None => format!("topic '{topic}'"),
            };
            return MoverError::MetadataTimeout { resource };
        }
        if is_unknown_topic_error(&source) {
            let unknown_partition =
                source.rdkafka_error_code() == Some(RDKafkaErrorCode::UnknownPartition);
            return match partition {
                Some(partition) if unknown_partition => MoverError::PartitionNotFound {
                    topic: topic.to_string(),
                    partition,
                },
                _ => MoverError::TopicNotFound(topic.to_string()),
            };
        }
        MoverError::Metadata { operation, source }
    }
}

/// Check if a KafkaError represents a timeout condition
pub(crate) fn is_timeout_error(e: &KafkaError) -> bool {
    matches!(
        e.rdkafka_error_code(),
        Some(RDKafkaErrorCode::RequestTimedOut | RDKafkaErrorCode::OperationTimedOut)
    )
}

fn is_unknown_topic_error(e: &KafkaError) -> bool {
    matches!(
        e.rdkafka_error_code(),
        Some(
            RDKafkaErrorCode::UnknownTopicOrPartition
                | RDKafkaErrorCode::UnknownTopic
                | RDKafkaErrorCode::UnknownPartition
        )
    )
}
