//! The message pump: a cancellable poll loop over one or more partitions.
//!
//! A pump is driven by its caller one record at a time through
//! [`MessagePump::next`]. Stop conditions are evaluated once per iteration,
//! in this order: cancellation, message limit, watermark bound, idleness.
//! Poll timeouts are never errors. A bounded pump gives up once no record
//! inside its bounds arrived for the idle timeout, instead of waiting for
//! offsets that may never come (compacted records, transaction markers).
//! Partitions that reached their bound are paused on the source.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::{Duration, Instant};

use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::MoverError;
use crate::kafka::groups::GroupAdmin;
use crate::kafka::source::RecordSource;
use crate::key_filter::KeyFilter;
use crate::metrics_consts::{
    PUMP_READ_ERRORS, PUMP_RECORDS_CONSUMED, PUMP_RECORDS_FILTERED, PUMP_SESSIONS_STOPPED,
    TRANSIENT_GROUP_DELETE_FAILED,
};
use crate::types::{OffsetSpec, Partition, Record, TopicPartitionOffset};

/// Where a consumer starts when its group has no usable committed offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetReset {
    Earliest,
    Latest,
}

impl OffsetReset {
    pub fn as_str(&self) -> &'static str {
        match self {
            OffsetReset::Earliest => "earliest",
            OffsetReset::Latest => "latest",
        }
    }
}

/// How partitions reach the consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assignment {
    /// Group-managed: the broker assigns and rebalances partitions of these topics.
    Subscribe(Vec<String>),
    /// Explicit positions, no group membership. Needed to start mid-partition.
    Manual(Vec<TopicPartitionOffset>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    LimitReached,
    Cancelled,
    WatermarkReached,
    /// A bounded pump saw no records for the idle timeout before reaching its bound
    Idle,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::LimitReached => "limit_reached",
            StopReason::Cancelled => "cancelled",
            StopReason::WatermarkReached => "watermark_reached",
            StopReason::Idle => "idle",
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpState {
    Polling,
    Stopped(StopReason),
    Failed,
    Closed,
}

/// Everything one pump run needs, fixed before the consumer is built.
#[derive(Debug, Clone)]
pub struct PumpSession {
    group_id: String,
    group_generated: bool,
    assignment: Assignment,
    offset_reset: OffsetReset,
    limit: Option<u64>,
    key_filter: Option<KeyFilter>,
    bounds: HashMap<Partition, i64>,
    poll_timeout: Duration,
    idle_timeout: Duration,
    cancel: CancellationToken,
}

impl PumpSession {
    /// `group` falls back to a generated transient id (tagged with `purpose`)
    /// when absent or blank. Only generated groups are deleted on close.
    pub fn new(
        config: &Config,
        purpose: &str,
        group: Option<String>,
        assignment: Assignment,
        offset_reset: OffsetReset,
    ) -> Result<Self, MoverError> {
        match &assignment {
            Assignment::Subscribe(topics) if topics.is_empty() => {
                return Err(MoverError::InvalidArgument(
                    "at least one topic is required".to_string(),
                ));
            }
            Assignment::Manual(positions) if positions.is_empty() => {
                return Err(MoverError::InvalidArgument(
                    "manual assignment needs at least one partition".to_string(),
                ));
            }
            _ => {}
        }

        let (group_id, group_generated) = match group {
            Some(g) if !g.trim().is_empty() => (g, false),
            _ => (config.transient_group_id(purpose), true),
        };

        Ok(Self {
            group_id,
            group_generated,
            assignment,
            offset_reset,
            limit: None,
            key_filter: None,
            bounds: HashMap::new(),
            poll_timeout: config.poll_timeout(),
            idle_timeout: config.idle_timeout(),
            cancel: CancellationToken::new(),
        })
    }

    /// Stop after `limit` accepted records. Zero means unlimited.
    pub fn with_limit(mut self, limit: Option<u64>) -> Self {
        self.limit = limit.filter(|l| *l > 0);
        self
    }

    pub fn with_key_filter(mut self, key_filter: Option<KeyFilter>) -> Self {
        self.key_filter = key_filter;
        self
    }

    /// Exclusive upper offset per partition, usually a high watermark snapshot.
    pub fn with_bounds(mut self, bounds: HashMap<Partition, i64>) -> Self {
        self.bounds = bounds;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn is_group_generated(&self) -> bool {
        self.group_generated
    }

    pub fn assignment(&self) -> &Assignment {
        &self.assignment
    }

    pub fn offset_reset(&self) -> OffsetReset {
        self.offset_reset
    }

    pub fn limit(&self) -> Option<u64> {
        self.limit
    }

    pub fn key_filter(&self) -> Option<&KeyFilter> {
        self.key_filter.as_ref()
    }

    pub fn bound(&self, partition: &Partition) -> Option<i64> {
        self.bounds.get(partition).copied()
    }

    pub fn is_bounded(&self) -> bool {
        !self.bounds.is_empty()
    }

    pub fn poll_timeout(&self) -> Duration {
        self.poll_timeout
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Progress of a user-named group is committed; transient groups are
    /// thrown away, so committing for them is pointless.
    pub fn commits_offsets(&self) -> bool {
        !self.group_generated && matches!(self.assignment, Assignment::Subscribe(_))
    }
}

pub struct MessagePump<S: RecordSource, G: GroupAdmin> {
    session: PumpSession,
    source: S,
    groups: G,
    state: PumpState,
    accepted: u64,
    completed: HashSet<Partition>,
    last_activity: Instant,
}

impl<S: RecordSource, G: GroupAdmin> MessagePump<S, G> {
    /// Assign `source` per the session and start polling.
    pub async fn start(
        session: PumpSession,
        mut source: S,
        groups: G,
    ) -> Result<Self, MoverError> {
        if let Err(e) = source.assign(session.assignment()).await {
            source.close().await;
            return Err(e);
        }

        // A bounded partition assigned at or past its bound has nothing to read
        let mut completed = HashSet::new();
        if let Assignment::Manual(positions) = session.assignment() {
            for position in positions {
                let bound = session.bound(position.partition());
                if let (Some(bound), OffsetSpec::Offset(start)) = (bound, position.offset()) {
                    if start >= bound {
                        completed.insert(position.partition().clone());
                    }
                }
            }
        }

        for partition in &completed {
            pause_partition(&mut source, session.group_id(), partition).await;
        }

        info!(
            group = session.group_id(),
            generated = session.is_group_generated(),
            offset_reset = session.offset_reset().as_str(),
            limit = session.limit(),
            bounded = session.is_bounded(),
            "Message pump started"
        );

        Ok(Self {
            session,
            source,
            groups,
            state: PumpState::Polling,
            accepted: 0,
            completed,
            last_activity: Instant::now(),
        })
    }

    pub fn session(&self) -> &PumpSession {
        &self.session
    }

    pub fn state(&self) -> PumpState {
        self.state
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        match self.state {
            PumpState::Stopped(reason) => Some(reason),
            _ => None,
        }
    }

    /// Records yielded so far (after filtering)
    pub fn accepted(&self) -> u64 {
        self.accepted
    }

    /// Next accepted record, or `None` once the pump stopped.
    ///
    /// A read failure other than a poll timeout fails the pump; the caller
    /// should still [`close`](Self::close) it.
    pub async fn next(&mut self) -> Result<Option<Record>, MoverError> {
        if self.state != PumpState::Polling {
            return Ok(None);
        }

        loop {
            if let Some(reason) = self.check_stop() {
                self.stop(reason);
                return Ok(None);
            }

            let record = match self.source.poll(self.session.poll_timeout()).await {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(e) => {
                    counter!(PUMP_READ_ERRORS, "error" => e.error_type()).increment(1);
                    warn!(group = self.session.group_id(), error = %e, "Message pump failed");
                    self.state = PumpState::Failed;
                    return Err(e);
                }
            };

            counter!(PUMP_RECORDS_CONSUMED).increment(1);

            let partition = record.source_partition();
            if let Some(bound) = self.session.bound(&partition) {
                if record.offset >= bound {
                    debug!(%partition, offset = record.offset, bound, "Record past bound");
                    self.complete(partition).await;
                    continue;
                }
                if record.offset + 1 >= bound {
                    self.complete(partition).await;
                }
            }
            // Only progress towards a bound counts as activity
            self.last_activity = Instant::now();

            if let Some(filter) = self.session.key_filter() {
                if !filter.matches(record.key.as_deref()) {
                    counter!(PUMP_RECORDS_FILTERED).increment(1);
                    continue;
                }
            }

            self.accepted += 1;
            return Ok(Some(record));
        }
    }

    fn check_stop(&self) -> Option<StopReason> {
        if self.session.cancellation().is_cancelled() {
            return Some(StopReason::Cancelled);
        }
        if let Some(limit) = self.session.limit() {
            if self.accepted >= limit {
                return Some(StopReason::LimitReached);
            }
        }
        if self.session.is_bounded() {
            if self.completed.len() >= self.session.bounds.len() {
                return Some(StopReason::WatermarkReached);
            }
            if self.last_activity.elapsed() >= self.session.idle_timeout {
                return Some(StopReason::Idle);
            }
        }
        None
    }

    async fn complete(&mut self, partition: Partition) {
        if self.completed.contains(&partition) {
            return;
        }
        pause_partition(&mut self.source, self.session.group_id(), &partition).await;
        self.completed.insert(partition);
    }

    fn stop(&mut self, reason: StopReason) {
        counter!(PUMP_SESSIONS_STOPPED, "reason" => reason.as_str()).increment(1);
        if reason == StopReason::Idle {
            warn!(
                group = self.session.group_id(),
                idle_ms = self.session.idle_timeout.as_millis(),
                accepted = self.accepted,
                "No records before reaching the watermark, stopping early"
            );
        } else {
            info!(
                group = self.session.group_id(),
                %reason,
                accepted = self.accepted,
                "Message pump stopped"
            );
        }
        self.state = PumpState::Stopped(reason);
    }

    /// Close the consumer, then drop the group if this session generated it.
    ///
    /// Group deletion is best effort and never fails the close.
    pub async fn close(&mut self) {
        if self.state == PumpState::Closed {
            return;
        }
        self.source.close().await;
        self.state = PumpState::Closed;

        if !self.session.is_group_generated() {
            return;
        }

        // Give the coordinator a moment to register that the member left
        tokio::time::sleep(Duration::from_millis(100)).await;

        let group = self.session.group_id();
        match self.groups.delete_group(group).await {
            Ok(()) => debug!(group, "Deleted transient consumer group"),
            Err(e) => {
                counter!(TRANSIENT_GROUP_DELETE_FAILED).increment(1);
                warn!(group, error = %e, "Failed to delete transient consumer group");
            }
        }
    }
}

/// Records of a completed partition are dropped anyway; a failed pause only costs reads.
async fn pause_partition<S: RecordSource>(source: &mut S, group: &str, partition: &Partition) {
    match source.pause(partition).await {
        Ok(()) => debug!(group, %partition, "Paused completed partition"),
        Err(e) => warn!(group, %partition, error = %e, "Failed to pause completed partition"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;

    use crate::config::tests::test_config;
    use crate::kafka::client::BrokerClient;
    use crate::test_utils::{ClusterEvent, InMemoryCluster};

    /// Replays `scripted`, then keeps returning records of `past_bound` forever,
    /// whether or not that partition was paused.
    struct EndlessSource {
        scripted: VecDeque<Record>,
        past_bound: Partition,
        next_offset: i64,
        paused: Arc<Mutex<Vec<Partition>>>,
    }

    #[async_trait]
    impl RecordSource for EndlessSource {
        async fn assign(&mut self, _assignment: &Assignment) -> Result<(), MoverError> {
            Ok(())
        }

        async fn poll(&mut self, _timeout: Duration) -> Result<Option<Record>, MoverError> {
            tokio::task::yield_now().await;
            if let Some(record) = self.scripted.pop_front() {
                return Ok(Some(record));
            }
            let offset = self.next_offset;
            self.next_offset += 1;
            Ok(Some(record_at(&self.past_bound, offset)))
        }

        async fn pause(&mut self, partition: &Partition) -> Result<(), MoverError> {
            self.paused.lock().unwrap().push(partition.clone());
            Ok(())
        }

        async fn close(&mut self) {}
    }

    fn record_at(partition: &Partition, offset: i64) -> Record {
        Record {
            topic: partition.topic().to_string(),
            partition: partition.partition_number(),
            offset,
            key: None,
            value: Some(b"v".to_vec()),
            headers: vec![],
            timestamp: None,
        }
    }

    fn cluster_with_records(partitions: i32, per_partition: usize) -> InMemoryCluster {
        let cluster = InMemoryCluster::new();
        cluster.create_topic("orders", partitions);
        for p in 0..partitions {
            for i in 0..per_partition {
                cluster.append("orders", p, Some(format!("k-{p}-{i}").as_bytes()), b"v");
            }
        }
        cluster
    }

    async fn drain<S: RecordSource, G: GroupAdmin>(pump: &mut MessagePump<S, G>) -> Vec<Record> {
        let mut out = Vec::new();
        while let Some(record) = pump.next().await.unwrap() {
            out.push(record);
        }
        out
    }

    #[test]
    fn test_session_generates_group_when_blank() {
        let config = test_config();
        let named = PumpSession::new(
            &config,
            "consume",
            Some("billing".to_string()),
            Assignment::Subscribe(vec!["orders".to_string()]),
            OffsetReset::Earliest,
        )
        .unwrap();
        assert_eq!(named.group_id(), "billing");
        assert!(!named.is_group_generated());
        assert!(named.commits_offsets());

        let blank = PumpSession::new(
            &config,
            "consume",
            Some("  ".to_string()),
            Assignment::Subscribe(vec!["orders".to_string()]),
            OffsetReset::Earliest,
        )
        .unwrap();
        assert!(blank.is_group_generated());
        assert!(blank.group_id().starts_with("kafka-mover-test-consume-"));
        assert!(!blank.commits_offsets());
    }

    #[test]
    fn test_session_rejects_empty_assignments() {
        let config = test_config();
        let err = PumpSession::new(
            &config,
            "consume",
            None,
            Assignment::Subscribe(vec![]),
            OffsetReset::Earliest,
        )
        .unwrap_err();
        assert!(matches!(err, MoverError::InvalidArgument(_)));

        let err = PumpSession::new(
            &config,
            "copy",
            None,
            Assignment::Manual(vec![]),
            OffsetReset::Earliest,
        )
        .unwrap_err();
        assert!(matches!(err, MoverError::InvalidArgument(_)));
    }

    #[test]
    fn test_zero_limit_means_unlimited() {
        let session = PumpSession::new(
            &test_config(),
            "consume",
            None,
            Assignment::Subscribe(vec!["orders".to_string()]),
            OffsetReset::Earliest,
        )
        .unwrap()
        .with_limit(Some(0));
        assert_eq!(session.limit(), None);
    }

    #[tokio::test]
    async fn test_limit_counts_only_accepted_records() {
        let cluster = InMemoryCluster::new();
        cluster.create_topic("orders", 1);
        for key in ["a-1", "b-1", "a-2", "b-2", "a-3", "a-4"] {
            cluster.append("orders", 0, Some(key.as_bytes()), b"v");
        }

        let session = PumpSession::new(
            &test_config(),
            "consume",
            None,
            Assignment::Subscribe(vec!["orders".to_string()]),
            OffsetReset::Earliest,
        )
        .unwrap()
        .with_limit(Some(3))
        .with_key_filter(Some(KeyFilter::parse("a-*")));

        let source = cluster.create_source(&session).await.unwrap();
        let mut pump = MessagePump::start(session, source, cluster.clone())
            .await
            .unwrap();
        let records = drain(&mut pump).await;

        let keys: Vec<&[u8]> = records.iter().filter_map(|r| r.key.as_deref()).collect();
        assert_eq!(keys, vec![&b"a-1"[..], b"a-2", b"a-3"]);
        assert_eq!(pump.stop_reason(), Some(StopReason::LimitReached));
        pump.close().await;
    }

    #[tokio::test]
    async fn test_bounded_pump_ignores_appends_after_snapshot() {
        let cluster = cluster_with_records(2, 3);
        // Every poll appends a fresh record to partition 0
        cluster.append_on_poll("orders", 0);

        let positions = vec![
            TopicPartitionOffset::new("orders", 0, OffsetSpec::Offset(0)).unwrap(),
            TopicPartitionOffset::new("orders", 1, OffsetSpec::Offset(0)).unwrap(),
        ];
        let bounds = HashMap::from([
            (Partition::new("orders", 0), 3),
            (Partition::new("orders", 1), 3),
        ]);
        let session = PumpSession::new(
            &test_config(),
            "copy",
            None,
            Assignment::Manual(positions),
            OffsetReset::Earliest,
        )
        .unwrap()
        .with_bounds(bounds);

        let source = cluster.create_source(&session).await.unwrap();
        let mut pump = MessagePump::start(session, source, cluster.clone())
            .await
            .unwrap();
        let records = drain(&mut pump).await;

        assert_eq!(records.len(), 6);
        assert!(records.iter().all(|r| r.offset < 3));
        assert_eq!(pump.stop_reason(), Some(StopReason::WatermarkReached));
        pump.close().await;
    }

    #[tokio::test]
    async fn test_bounded_pump_stops_when_idle() {
        let cluster = cluster_with_records(1, 2);
        let session = PumpSession::new(
            &test_config(),
            "move",
            None,
            Assignment::Manual(vec![TopicPartitionOffset::new(
                "orders",
                0,
                OffsetSpec::Offset(0),
            )
            .unwrap()]),
            OffsetReset::Earliest,
        )
        .unwrap()
        // bound beyond what the partition holds
        .with_bounds(HashMap::from([(Partition::new("orders", 0), 5)]));

        let source = cluster.create_source(&session).await.unwrap();
        let mut pump = MessagePump::start(session, source, cluster.clone())
            .await
            .unwrap();
        let records = drain(&mut pump).await;

        assert_eq!(records.len(), 2);
        assert_eq!(pump.stop_reason(), Some(StopReason::Idle));
        pump.close().await;
    }

    #[tokio::test]
    async fn test_records_past_bound_do_not_keep_pump_alive() {
        let p0 = Partition::new("orders", 0);
        let p1 = Partition::new("orders", 1);
        let paused = Arc::new(Mutex::new(Vec::new()));
        let source = EndlessSource {
            scripted: (0..3).map(|offset| record_at(&p1, offset)).collect(),
            past_bound: p0.clone(),
            next_offset: 3,
            paused: paused.clone(),
        };

        let session = PumpSession::new(
            &test_config(),
            "copy",
            None,
            Assignment::Manual(vec![
                TopicPartitionOffset::new("orders", 0, OffsetSpec::Offset(3)).unwrap(),
                TopicPartitionOffset::new("orders", 1, OffsetSpec::Offset(0)).unwrap(),
            ]),
            OffsetReset::Earliest,
        )
        .unwrap()
        .with_bounds(HashMap::from([(p0.clone(), 3), (p1.clone(), 5)]));

        let mut pump = MessagePump::start(session, source, InMemoryCluster::new())
            .await
            .unwrap();
        let records = tokio::time::timeout(Duration::from_secs(5), drain(&mut pump))
            .await
            .expect("bounded pump kept running on records past its bound");

        assert_eq!(records.len(), 3);
        assert!(records.iter().all(|r| r.source_partition() == p1));
        assert_eq!(pump.stop_reason(), Some(StopReason::Idle));
        assert_eq!(*paused.lock().unwrap(), vec![p0]);
        pump.close().await;
    }

    #[tokio::test]
    async fn test_read_failure_fails_pump_and_still_closes() {
        let cluster = cluster_with_records(1, 5);
        cluster.fail_polls_after(2);
        let session = PumpSession::new(
            &test_config(),
            "consume",
            None,
            Assignment::Subscribe(vec!["orders".to_string()]),
            OffsetReset::Earliest,
        )
        .unwrap();
        let group = session.group_id().to_string();

        let source = cluster.create_source(&session).await.unwrap();
        let mut pump = MessagePump::start(session, source, cluster.clone())
            .await
            .unwrap();
        assert_eq!(pump.next().await.unwrap().unwrap().offset, 0);
        assert_eq!(pump.next().await.unwrap().unwrap().offset, 1);

        let err = pump.next().await.unwrap_err();
        assert!(matches!(err, MoverError::Consume(_)));
        assert_eq!(pump.state(), PumpState::Failed);
        assert!(pump.next().await.unwrap().is_none());

        pump.close().await;
        assert_eq!(pump.state(), PumpState::Closed);
        assert_eq!(
            cluster.events(),
            vec![
                ClusterEvent::SourceClosed {
                    group: group.clone()
                },
                ClusterEvent::GroupDeleted { group },
            ]
        );
    }

    #[tokio::test]
    async fn test_cancelled_pump_closes_before_deleting_group() {
        let cluster = cluster_with_records(1, 5);
        let cancel = CancellationToken::new();
        let session = PumpSession::new(
            &test_config(),
            "consume",
            None,
            Assignment::Subscribe(vec!["orders".to_string()]),
            OffsetReset::Earliest,
        )
        .unwrap()
        .with_cancellation(cancel.clone());
        let group = session.group_id().to_string();

        let source = cluster.create_source(&session).await.unwrap();
        let mut pump = MessagePump::start(session, source, cluster.clone())
            .await
            .unwrap();
        assert!(pump.next().await.unwrap().is_some());

        cancel.cancel();
        assert!(pump.next().await.unwrap().is_none());
        assert_eq!(pump.stop_reason(), Some(StopReason::Cancelled));

        pump.close().await;
        assert_eq!(
            cluster.events(),
            vec![
                ClusterEvent::SourceClosed {
                    group: group.clone()
                },
                ClusterEvent::GroupDeleted { group },
            ]
        );
        assert_eq!(pump.state(), PumpState::Closed);
    }

    #[tokio::test]
    async fn test_named_group_is_kept_and_deletion_failures_are_swallowed() {
        let cluster = cluster_with_records(1, 1);
        let session = PumpSession::new(
            &test_config(),
            "consume",
            Some("billing".to_string()),
            Assignment::Subscribe(vec!["orders".to_string()]),
            OffsetReset::Earliest,
        )
        .unwrap()
        .with_limit(Some(1));
        let source = cluster.create_source(&session).await.unwrap();
        let mut pump = MessagePump::start(session, source, cluster.clone())
            .await
            .unwrap();
        drain(&mut pump).await;
        pump.close().await;
        assert_eq!(
            cluster.events(),
            vec![ClusterEvent::SourceClosed {
                group: "billing".to_string()
            }]
        );

        cluster.fail_group_deletion(true);
        let session = PumpSession::new(
            &test_config(),
            "consume",
            None,
            Assignment::Subscribe(vec!["orders".to_string()]),
            OffsetReset::Earliest,
        )
        .unwrap()
        .with_limit(Some(1));
        let source = cluster.create_source(&session).await.unwrap();
        let mut pump = MessagePump::start(session, source, cluster.clone())
            .await
            .unwrap();
        drain(&mut pump).await;
        pump.close().await;
        assert_eq!(pump.state(), PumpState::Closed);
    }
}
