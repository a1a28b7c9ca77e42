//! Writes consumed records to a destination topic/partition.
//!
//! Two delivery modes:
//! - `FireAndForget`: every pending delivery is handed to a drain worker over a
//!   bounded queue; failures are logged and counted, never fatal.
//! - `Synchronous`: each publish waits for the broker acknowledgement before
//!   returning, and the first failure stops the caller at a known offset.
//!
//! [`Republisher::finish`] flushes the sink and only then joins the drain
//! worker, so no delivery outcome is lost. When the flush times out the worker
//! settles every delivery that already resolved and leaves the rest counted as
//! undelivered.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use metrics::counter;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::MoverError;
use crate::kafka::sink::{OutboundRecord, PendingDelivery, RecordSink};
use crate::metrics_consts::{FLUSH_INCOMPLETE, RECORDS_DELIVERED, RECORDS_PUBLISHED};
use crate::types::{Partition, Record};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    FireAndForget,
    Synchronous,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub topic: String,
    /// `None` publishes to whichever partition the producer picks
    pub partition: Option<i32>,
    /// Keep the source record's timestamp instead of letting the broker stamp it
    pub preserve_timestamp: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliverySummary {
    pub published: u64,
    pub delivered: u64,
    pub failed: u64,
    /// Records with no outcome when the flush timed out
    pub undelivered: u64,
}

impl DeliverySummary {
    /// `IncompleteDelivery` when the final flush left records behind.
    pub fn check_complete(&self) -> Result<(), MoverError> {
        if self.undelivered == 0 {
            return Ok(());
        }
        Err(MoverError::IncompleteDelivery {
            delivered: self.delivered,
            undelivered: self.undelivered,
        })
    }
}

#[derive(Default)]
struct DeliveryCounters {
    published: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
}

struct InFlight {
    source: Partition,
    offset: i64,
    delivery: PendingDelivery,
}

pub struct Republisher<K: RecordSink> {
    sink: Arc<K>,
    destination: Destination,
    mode: DeliveryMode,
    flush_timeout: Duration,
    counters: Arc<DeliveryCounters>,
    in_flight_tx: Option<mpsc::Sender<InFlight>>,
    drain: Option<JoinHandle<()>>,
    settle: CancellationToken,
}

impl<K: RecordSink + 'static> Republisher<K> {
    pub fn new(sink: K, destination: Destination, mode: DeliveryMode, config: &Config) -> Self {
        let counters = Arc::new(DeliveryCounters::default());
        let settle = CancellationToken::new();

        let (in_flight_tx, drain) = match mode {
            DeliveryMode::Synchronous => (None, None),
            DeliveryMode::FireAndForget => {
                let (tx, rx) = mpsc::channel(config.delivery_queue_capacity.max(1));
                let drain = tokio::spawn(drain_deliveries(
                    rx,
                    counters.clone(),
                    destination.topic.clone(),
                    settle.clone(),
                ));
                (Some(tx), Some(drain))
            }
        };

        Self {
            sink: Arc::new(sink),
            destination,
            mode,
            flush_timeout: config.flush_timeout(),
            counters,
            in_flight_tx,
            drain,
            settle,
        }
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    /// Publish one record. In synchronous mode this returns only after the
    /// broker acknowledged it.
    pub async fn publish(&mut self, record: Record) -> Result<(), MoverError> {
        let source = record.source_partition();
        let offset = record.offset;
        let outbound = OutboundRecord {
            topic: self.destination.topic.clone(),
            partition: self.destination.partition,
            key: record.key,
            value: record.value,
            headers: record.headers,
            timestamp: if self.destination.preserve_timestamp {
                record.timestamp
            } else {
                None
            },
        };

        let delivery = self.sink.send(outbound).await;
        self.counters.published.fetch_add(1, Ordering::Relaxed);
        counter!(RECORDS_PUBLISHED, "mode" => self.mode_label()).increment(1);

        match self.mode {
            DeliveryMode::Synchronous => match delivery.await {
                Ok(()) => {
                    record_outcome(&self.counters, true);
                    Ok(())
                }
                Err(reason) => {
                    record_outcome(&self.counters, false);
                    Err(MoverError::DeliveryFailure {
                        topic: source.topic().to_string(),
                        partition: source.partition_number(),
                        offset,
                        destination: self.destination.topic.clone(),
                        reason,
                    })
                }
            },
            DeliveryMode::FireAndForget => {
                let Some(tx) = &self.in_flight_tx else {
                    return Err(MoverError::Task("republisher already finished".to_string()));
                };
                tx.send(InFlight {
                    source,
                    offset,
                    delivery,
                })
                .await
                .map_err(|_| MoverError::Task("delivery drain worker stopped".to_string()))
            }
        }
    }

    pub fn summary(&self) -> DeliverySummary {
        let published = self.counters.published.load(Ordering::Relaxed);
        let delivered = self.counters.delivered.load(Ordering::Relaxed);
        let failed = self.counters.failed.load(Ordering::Relaxed);
        DeliverySummary {
            published,
            delivered,
            failed,
            undelivered: published.saturating_sub(delivered + failed),
        }
    }

    /// Flush the sink, then wait for the drain worker to observe every outcome.
    ///
    /// A flush that times out is not an error here: the summary carries the
    /// undelivered count and [`DeliverySummary::check_complete`] reports it.
    pub async fn finish(mut self) -> Result<DeliverySummary, MoverError> {
        let sink = self.sink.clone();
        let timeout = self.flush_timeout;
        let flushed = tokio::task::spawn_blocking(move || sink.flush(timeout))
            .await
            .map_err(|e| MoverError::Task(e.to_string()))?;

        // Closing the queue lets the worker exit once it drained what is left
        drop(self.in_flight_tx.take());

        if flushed.is_err() {
            // Outcomes still pending will never be observed
            self.settle.cancel();
        }
        if let Some(drain) = self.drain.take() {
            drain.await.map_err(|e| MoverError::Task(e.to_string()))?;
        }

        match flushed {
            Ok(()) => {}
            Err(e) => {
                counter!(FLUSH_INCOMPLETE).increment(1);
                let summary = self.summary();
                warn!(
                    destination = self.destination.topic,
                    delivered = summary.delivered,
                    undelivered = summary.undelivered,
                    error = %e,
                    "Producer flush did not complete"
                );
                return Ok(summary);
            }
        }

        let summary = self.summary();
        debug!(destination = self.destination.topic, ?summary, "Republisher finished");
        Ok(summary)
    }

    fn mode_label(&self) -> &'static str {
        match self.mode {
            DeliveryMode::FireAndForget => "fire_and_forget",
            DeliveryMode::Synchronous => "synchronous",
        }
    }
}

/// Observe delivery outcomes in publish order until the queue closes.
///
/// Once `settle` fires, stop waiting: outcomes that already resolved are
/// recorded, everything else stays unaccounted (undelivered).
async fn drain_deliveries(
    mut rx: mpsc::Receiver<InFlight>,
    counters: Arc<DeliveryCounters>,
    destination: String,
    settle: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = settle.cancelled() => None,
            next = rx.recv() => next,
        };
        let Some(mut in_flight) = next else {
            break;
        };

        let resolved = tokio::select! {
            biased;
            outcome = &mut in_flight.delivery => Some(outcome),
            _ = settle.cancelled() => None,
        };
        let outcome = match resolved {
            Some(outcome) => Some(outcome),
            None => in_flight.delivery.as_mut().now_or_never(),
        };
        match outcome {
            Some(outcome) => observe(&counters, &destination, &in_flight, outcome),
            None => break,
        }
    }

    while let Ok(mut in_flight) = rx.try_recv() {
        if let Some(outcome) = in_flight.delivery.as_mut().now_or_never() {
            observe(&counters, &destination, &in_flight, outcome);
        }
    }
}

fn observe(
    counters: &DeliveryCounters,
    destination: &str,
    in_flight: &InFlight,
    outcome: Result<(), String>,
) {
    match outcome {
        Ok(()) => record_outcome(counters, true),
        Err(reason) => {
            record_outcome(counters, false);
            warn!(
                source = %in_flight.source,
                offset = in_flight.offset,
                destination,
                reason,
                "Failed to deliver record"
            );
        }
    }
}

fn record_outcome(counters: &DeliveryCounters, delivered: bool) {
    if delivered {
        counters.delivered.fetch_add(1, Ordering::Relaxed);
        counter!(RECORDS_DELIVERED, "status" => "ok").increment(1);
    } else {
        counters.failed.fetch_add(1, Ordering::Relaxed);
        counter!(RECORDS_DELIVERED, "status" => "failed").increment(1);
    }
}
