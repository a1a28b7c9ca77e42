use std::time::Duration;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use rdkafka::config::ClientConfig;
use rdkafka::error::KafkaError;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::types::RDKafkaErrorCode;
use tokio::time::sleep;
use tracing::debug;

use crate::error::MoverError;
use crate::types::RecordHeader;

const QUEUE_FULL_BACKOFF: Duration = Duration::from_millis(50);

/// A record addressed to its destination, built from a consumed record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRecord {
    pub topic: String,
    /// `None` lets the producer's partitioner decide
    pub partition: Option<i32>,
    pub key: Option<Vec<u8>>,
    pub value: Option<Vec<u8>>,
    pub headers: Vec<RecordHeader>,
    /// `None` lets the broker stamp the record
    pub timestamp: Option<i64>,
}

/// Resolves once the broker acknowledged (or rejected) one record.
pub type PendingDelivery = BoxFuture<'static, Result<(), String>>;

#[async_trait]
pub trait RecordSink: Send + Sync {
    /// Hand a record to the producer. Enqueue failures surface through the
    /// returned future, like broker rejections do.
    async fn send(&self, record: OutboundRecord) -> PendingDelivery;

    /// Block until every buffered record reached the broker or `timeout` passed.
    fn flush(&self, timeout: Duration) -> Result<(), MoverError>;

    /// Records handed over but not acknowledged yet
    fn in_flight_count(&self) -> usize;
}

pub struct KafkaRecordSink {
    producer: FutureProducer,
}

impl KafkaRecordSink {
    pub fn new(producer_config: &ClientConfig) -> Result<Self, MoverError> {
        let producer: FutureProducer = producer_config
            .create()
            .map_err(|e| MoverError::Configuration(e.to_string()))?;
        Ok(Self { producer })
    }
}

#[async_trait]
impl RecordSink for KafkaRecordSink {
    async fn send(&self, record: OutboundRecord) -> PendingDelivery {
        let mut future_record = FutureRecord::<[u8], [u8]>::to(&record.topic)
            .headers(to_kafka_headers(&record.headers));
        if let Some(key) = &record.key {
            future_record = future_record.key(key.as_slice());
        }
        if let Some(value) = &record.value {
            future_record = future_record.payload(value.as_slice());
        }
        if let Some(partition) = record.partition {
            future_record = future_record.partition(partition);
        }
        if let Some(timestamp) = record.timestamp {
            future_record = future_record.timestamp(timestamp);
        }

        loop {
            match self.producer.send_result(future_record) {
                Ok(delivery) => {
                    return async move {
                        match delivery.await {
                            Ok(Ok(_)) => Ok(()),
                            Ok(Err((e, _))) => Err(e.to_string()),
                            Err(_) => Err("delivery canceled".to_string()),
                        }
                    }
                    .boxed();
                }
                Err((KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull), returned)) => {
                    debug!(topic = record.topic, "Producer queue full, backing off");
                    future_record = returned;
                    sleep(QUEUE_FULL_BACKOFF).await;
                }
                Err((e, _)) => return futures::future::ready(Err(e.to_string())).boxed(),
            }
        }
    }

    fn flush(&self, timeout: Duration) -> Result<(), MoverError> {
        self.producer
            .flush(timeout)
            .map_err(|_| MoverError::IncompleteDelivery {
                delivered: 0,
                undelivered: self.in_flight_count() as u64,
            })
    }

    fn in_flight_count(&self) -> usize {
        usize::try_from(self.producer.in_flight_count()).unwrap_or_default()
    }
}

fn to_kafka_headers(headers: &[RecordHeader]) -> OwnedHeaders {
    headers
        .iter()
        .fold(OwnedHeaders::new_with_capacity(headers.len()), |acc, h| {
            acc.insert(Header {
                key: &h.name,
                value: h.value.as_deref(),
            })
        })
}
