//! In-memory cluster used by unit and integration tests.
//!
//! `InMemoryCluster` implements every broker seam against shared state, keeps
//! a log of lifecycle events (consumers closed, groups deleted) so tests can
//! assert their order, and exposes knobs to inject faults.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{self, FutureExt};
use rdkafka::error::KafkaError;
use rdkafka::types::RDKafkaErrorCode;

use crate::error::MoverError;
use crate::kafka::client::BrokerClient;
use crate::kafka::groups::GroupAdmin;
use crate::kafka::metadata::ClusterMetadata;
use crate::kafka::sink::{OutboundRecord, PendingDelivery, RecordSink};
use crate::kafka::source::RecordSource;
use crate::pump::{Assignment, OffsetReset, PumpSession};
use crate::types::{
    ConsumerGroupOffsetEntry, OffsetSpec, Partition, Record, RecordHeader, Watermark,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterEvent {
    SourceClosed { group: String },
    GroupDeleted { group: String },
}

#[derive(Default)]
struct PartitionLog {
    /// First retained offset; earlier records were removed by retention
    low: i64,
    records: Vec<Record>,
}

impl PartitionLog {
    fn high(&self) -> i64 {
        self.records.last().map_or(self.low, |r| r.offset + 1)
    }

    fn get(&self, offset: i64) -> Option<&Record> {
        if offset < self.low {
            return None;
        }
        usize::try_from(offset).ok().and_then(|i| self.records.get(i))
    }
}

#[derive(Default)]
struct ClusterState {
    topics: BTreeMap<String, Vec<PartitionLog>>,
    commits: HashMap<(String, Partition), i64>,
    events: Vec<ClusterEvent>,
    fail_group_deletion: bool,
    fail_committed_offsets: bool,
    broken_watermarks: HashSet<Partition>,
    deliveries_before_failure: Option<u64>,
    delivery_attempts: u64,
    stall_deliveries: bool,
    stalled_attempt: Option<u64>,
    stalled: usize,
    append_on_poll: Vec<Partition>,
    records_polled: u64,
    polls_before_failure: Option<u64>,
}

impl ClusterState {
    fn log(&self, partition: &Partition) -> Option<&PartitionLog> {
        let index = usize::try_from(partition.partition_number()).ok()?;
        self.topics.get(partition.topic())?.get(index)
    }

    fn log_mut(&mut self, partition: &Partition) -> Option<&mut PartitionLog> {
        let index = usize::try_from(partition.partition_number()).ok()?;
        self.topics.get_mut(partition.topic())?.get_mut(index)
    }

    fn append(
        &mut self,
        partition: &Partition,
        key: Option<Vec<u8>>,
        value: Option<Vec<u8>>,
        headers: Vec<RecordHeader>,
        timestamp: Option<i64>,
    ) -> Option<i64> {
        let log = self.log_mut(partition)?;
        let offset = log.high();
        log.records.push(Record {
            topic: partition.topic().to_string(),
            partition: partition.partition_number(),
            offset,
            key,
            value,
            headers,
            timestamp: Some(timestamp.unwrap_or_else(|| chrono::Utc::now().timestamp_millis())),
        });
        Some(offset)
    }

    fn partition_count(&self, topic: &str) -> Option<usize> {
        self.topics.get(topic).map(Vec::len)
    }
}

#[derive(Clone, Default)]
pub struct InMemoryCluster {
    state: Arc<Mutex<ClusterState>>,
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, ClusterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn create_topic(&self, topic: &str, partitions: i32) {
        let logs = (0..partitions).map(|_| PartitionLog::default()).collect();
        self.state().topics.insert(topic.to_string(), logs);
    }

    /// Append a record and return its offset. Panics on an unknown partition.
    pub fn append(&self, topic: &str, partition: i32, key: Option<&[u8]>, value: &[u8]) -> i64 {
        self.append_record(topic, partition, key, Some(value), Vec::new(), None)
    }

    pub fn append_record(
        &self,
        topic: &str,
        partition: i32,
        key: Option<&[u8]>,
        value: Option<&[u8]>,
        headers: Vec<RecordHeader>,
        timestamp: Option<i64>,
    ) -> i64 {
        let target = Partition::new(topic, partition);
        self.state()
            .append(
                &target,
                key.map(<[u8]>::to_vec),
                value.map(<[u8]>::to_vec),
                headers,
                timestamp,
            )
            .unwrap_or_else(|| panic!("unknown partition {target}"))
    }

    /// Drop every record below `low`, as retention would.
    pub fn truncate(&self, topic: &str, partition: i32, low: i64) {
        if let Some(log) = self.state().log_mut(&Partition::new(topic, partition)) {
            log.low = low.min(log.high());
        }
    }

    pub fn commit(&self, group: &str, topic: &str, partition: i32, offset: i64) {
        self.state()
            .commits
            .insert((group.to_string(), Partition::new(topic, partition)), offset);
    }

    pub fn committed(&self, group: &str, topic: &str, partition: i32) -> Option<i64> {
        self.state()
            .commits
            .get(&(group.to_string(), Partition::new(topic, partition)))
            .copied()
    }

    /// Retained records of a partition, in offset order
    pub fn records(&self, topic: &str, partition: i32) -> Vec<Record> {
        let state = self.state();
        state
            .log(&Partition::new(topic, partition))
            .map(|log| {
                log.records
                    .iter()
                    .filter(|r| r.offset >= log.low)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn events(&self) -> Vec<ClusterEvent> {
        self.state().events.clone()
    }

    pub fn fail_group_deletion(&self, fail: bool) {
        self.state().fail_group_deletion = fail;
    }

    pub fn fail_committed_offsets(&self, fail: bool) {
        self.state().fail_committed_offsets = fail;
    }

    /// Watermark queries for this partition time out from now on.
    pub fn fail_watermarks(&self, topic: &str, partition: i32) {
        self.state()
            .broken_watermarks
            .insert(Partition::new(topic, partition));
    }

    /// Deliveries after the first `n` are rejected by the broker.
    pub fn fail_deliveries_after(&self, n: u64) {
        self.state().deliveries_before_failure = Some(n);
    }

    /// Deliveries never resolve and flushes fail.
    pub fn stall_deliveries(&self, stall: bool) {
        self.state().stall_deliveries = stall;
    }

    /// Only the `attempt`-th delivery (counting from 1) never resolves.
    pub fn stall_delivery(&self, attempt: u64) {
        self.state().stalled_attempt = Some(attempt);
    }

    /// Polls fail with a broker transport error once `n` records were read.
    pub fn fail_polls_after(&self, n: u64) {
        self.state().polls_before_failure = Some(n);
    }

    /// Every poll of any source appends one record to this partition first.
    pub fn append_on_poll(&self, topic: &str, partition: i32) {
        self.state()
            .append_on_poll
            .push(Partition::new(topic, partition));
    }
}

#[async_trait]
impl ClusterMetadata for InMemoryCluster {
    async fn watermarks(&self, topic: &str, partition: i32) -> Result<Watermark, MoverError> {
        let state = self.state();
        let target = Partition::new(topic, partition);
        if state.broken_watermarks.contains(&target) {
            return Err(MoverError::MetadataTimeout {
                resource: format!("topic '{topic}' partition {partition}"),
            });
        }
        if !state.topics.contains_key(topic) {
            return Err(MoverError::TopicNotFound(topic.to_string()));
        }
        let log = state.log(&target).ok_or_else(|| MoverError::PartitionNotFound {
            topic: topic.to_string(),
            partition,
        })?;
        Watermark::new(log.low, log.high())
    }

    async fn topic_partitions(&self, topic: &str) -> Result<Vec<i32>, MoverError> {
        let count = self
            .state()
            .partition_count(topic)
            .ok_or_else(|| MoverError::TopicNotFound(topic.to_string()))?;
        Ok((0..).take(count).collect())
    }
}

#[async_trait]
impl GroupAdmin for InMemoryCluster {
    async fn committed_offsets(
        &self,
        group: &str,
        topics: &[String],
    ) -> Result<Vec<ConsumerGroupOffsetEntry>, MoverError> {
        let state = self.state();
        if state.fail_committed_offsets {
            return Err(MoverError::MetadataTimeout {
                resource: format!("committed offsets of group '{group}'"),
            });
        }

        if let Some(missing) = topics.iter().find(|t| !state.topics.contains_key(*t)) {
            return Err(MoverError::TopicNotFound(missing.clone()));
        }
        let topics: BTreeSet<String> = if topics.is_empty() {
            state
                .commits
                .keys()
                .filter(|(g, _)| g == group)
                .map(|(_, p)| p.topic().to_string())
                .collect()
        } else {
            topics.iter().cloned().collect()
        };

        let mut entries = Vec::new();
        for topic in topics {
            let count = state.partition_count(&topic).unwrap_or_default();
            for partition in (0..).take(count) {
                let key = (group.to_string(), Partition::new(topic.clone(), partition));
                entries.push(ConsumerGroupOffsetEntry {
                    group: group.to_string(),
                    topic: topic.clone(),
                    partition,
                    committed_offset: state.commits.get(&key).copied(),
                });
            }
        }
        Ok(entries)
    }

    async fn delete_group(&self, group: &str) -> Result<(), MoverError> {
        let mut state = self.state();
        if state.fail_group_deletion {
            return Err(MoverError::GroupDeletion {
                group: group.to_string(),
                reason: "injected failure".to_string(),
            });
        }
        state.commits.retain(|(g, _), _| g != group);
        state.events.push(ClusterEvent::GroupDeleted {
            group: group.to_string(),
        });
        Ok(())
    }
}

#[async_trait]
impl BrokerClient for InMemoryCluster {
    type Source = InMemorySource;
    type Sink = InMemorySink;

    async fn create_source(&self, session: &PumpSession) -> Result<Self::Source, MoverError> {
        Ok(InMemorySource {
            cluster: self.clone(),
            group: session.group_id().to_string(),
            commits: session.commits_offsets(),
            offset_reset: session.offset_reset(),
            positions: Vec::new(),
            paused: HashSet::new(),
            cursor: 0,
            closed: false,
        })
    }

    fn create_sink(&self) -> Result<Self::Sink, MoverError> {
        Ok(InMemorySink {
            cluster: self.clone(),
        })
    }
}

/// Reads assigned partitions round-robin, one record per poll.
pub struct InMemorySource {
    cluster: InMemoryCluster,
    group: String,
    commits: bool,
    offset_reset: OffsetReset,
    positions: Vec<(Partition, i64)>,
    paused: HashSet<Partition>,
    cursor: usize,
    closed: bool,
}

impl InMemorySource {
    fn reset_position(&self, log: &PartitionLog) -> i64 {
        match self.offset_reset {
            OffsetReset::Earliest => log.low,
            OffsetReset::Latest => log.high(),
        }
    }

    fn next_record(&mut self) -> Option<Record> {
        let mut state = self.cluster.state();
        for target in state.append_on_poll.clone() {
            let live = Some(b"live".to_vec());
            state.append(&target, live.clone(), live, Vec::new(), None);
        }

        let count = self.positions.len();
        for step in 0..count {
            let index = (self.cursor + step) % count;
            let (partition, next) = &mut self.positions[index];
            if self.paused.contains(&*partition) {
                continue;
            }
            let Some(log) = state.log(partition) else {
                continue;
            };
            if *next < log.low {
                *next = log.low;
            }
            let Some(record) = log.get(*next).cloned() else {
                continue;
            };
            *next += 1;
            self.cursor = (index + 1) % count;
            state.records_polled += 1;
            if self.commits {
                let key = (self.group.clone(), partition.clone());
                state.commits.insert(key, *next);
            }
            return Some(record);
        }
        None
    }
}

#[async_trait]
impl RecordSource for InMemorySource {
    async fn assign(&mut self, assignment: &Assignment) -> Result<(), MoverError> {
        let state = self.cluster.state();
        let mut positions = Vec::new();
        match assignment {
            Assignment::Subscribe(topics) => {
                for topic in topics {
                    let count = state
                        .partition_count(topic)
                        .ok_or_else(|| MoverError::TopicNotFound(topic.clone()))?;
                    for partition in (0..).take(count) {
                        let target = Partition::new(topic.clone(), partition);
                        let committed = state.commits.get(&(self.group.clone(), target.clone()));
                        let start = match (committed, state.log(&target)) {
                            (Some(offset), _) => *offset,
                            (None, Some(log)) => self.reset_position(log),
                            (None, None) => 0,
                        };
                        positions.push((target, start));
                    }
                }
            }
            Assignment::Manual(assigned) => {
                for position in assigned {
                    let target = position.partition().clone();
                    let log = state.log(&target).ok_or_else(|| MoverError::PartitionNotFound {
                        topic: target.topic().to_string(),
                        partition: target.partition_number(),
                    })?;
                    let start = match position.offset() {
                        OffsetSpec::Offset(o) if o >= log.low && o <= log.high() => o,
                        OffsetSpec::Earliest => log.low,
                        OffsetSpec::Latest => log.high(),
                        _ => self.reset_position(log),
                    };
                    positions.push((target, start));
                }
            }
        }
        drop(state);
        self.positions = positions;
        self.cursor = 0;
        Ok(())
    }

    async fn poll(&mut self, timeout: Duration) -> Result<Option<Record>, MoverError> {
        if self.closed {
            return Ok(None);
        }
        {
            let state = self.cluster.state();
            if state
                .polls_before_failure
                .is_some_and(|n| state.records_polled >= n)
            {
                return Err(MoverError::Consume(KafkaError::MessageConsumption(
                    RDKafkaErrorCode::BrokerTransportFailure,
                )));
            }
        }
        match self.next_record() {
            Some(record) => Ok(Some(record)),
            None => {
                tokio::time::sleep(timeout).await;
                Ok(None)
            }
        }
    }

    async fn pause(&mut self, partition: &Partition) -> Result<(), MoverError> {
        self.paused.insert(partition.clone());
        Ok(())
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.cluster.state().events.push(ClusterEvent::SourceClosed {
            group: self.group.clone(),
        });
    }
}

/// Appends published records straight into the cluster.
pub struct InMemorySink {
    cluster: InMemoryCluster,
}

#[async_trait]
impl RecordSink for InMemorySink {
    async fn send(&self, record: OutboundRecord) -> PendingDelivery {
        let mut state = self.cluster.state();
        state.delivery_attempts += 1;
        if state.stall_deliveries || state.stalled_attempt == Some(state.delivery_attempts) {
            state.stalled += 1;
            return future::pending().boxed();
        }

        if let Some(limit) = state.deliveries_before_failure {
            if state.delivery_attempts > limit {
                return future::ready(Err("injected delivery failure".to_string())).boxed();
            }
        }

        let Some(count) = state.partition_count(&record.topic) else {
            return future::ready(Err(format!("unknown topic '{}'", record.topic))).boxed();
        };
        let partition = match record.partition {
            Some(p) => p,
            None => {
                let spread = record.key.as_deref().map_or(state.delivery_attempts, |key| {
                    key.iter().map(|b| u64::from(*b)).sum()
                });
                let count = u64::try_from(count).unwrap_or(1).max(1);
                i32::try_from(spread % count).unwrap_or_default()
            }
        };

        let target = Partition::new(record.topic, partition);
        match state.append(
            &target,
            record.key,
            record.value,
            record.headers,
            record.timestamp,
        ) {
            Some(_) => future::ready(Ok(())).boxed(),
            None => future::ready(Err(format!("unknown partition {target}"))).boxed(),
        }
    }

    fn flush(&self, _timeout: Duration) -> Result<(), MoverError> {
        let stalled = self.in_flight_count();
        if stalled > 0 {
            return Err(MoverError::IncompleteDelivery {
                delivered: 0,
                undelivered: stalled as u64,
            });
        }
        Ok(())
    }

    fn in_flight_count(&self) -> usize {
        self.cluster.state().stalled
    }
}
