mod common;

use kafka_mover::migrator::{run_move_partition, MoveRequest};
use kafka_mover::pump::StopReason;
use kafka_mover::test_utils::{ClusterEvent, InMemoryCluster};
use kafka_mover::MoverError;
use tokio_util::sync::CancellationToken;

use common::{seed, test_config};

#[tokio::test]
async fn test_move_republishes_every_record_in_order() {
    let cluster = InMemoryCluster::new();
    cluster.create_topic("orders", 3);
    seed(&cluster, "orders", 0, 25);
    cluster.append("orders", 2, Some(&b"existing"[..]), b"existing");

    let report = run_move_partition(
        &cluster,
        &test_config(),
        &MoveRequest::new("orders", 0, 2),
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(report.moved, 25);
    assert_eq!(report.expected, 25);
    assert!(report.is_complete());
    assert_eq!(report.stop_reason, Some(StopReason::WatermarkReached));

    let source = cluster.records("orders", 0);
    let dest = cluster.records("orders", 2);
    assert_eq!(dest.len(), 26);
    for (moved, original) in dest[1..].iter().zip(&source) {
        assert_eq!(moved.key, original.key);
        assert_eq!(moved.value, original.value);
        assert_eq!(moved.headers, original.headers);
        assert_eq!(moved.timestamp, original.timestamp);
    }
}

#[tokio::test]
async fn test_move_ignores_records_appended_after_start() {
    let cluster = InMemoryCluster::new();
    cluster.create_topic("orders", 2);
    seed(&cluster, "orders", 0, 10);
    cluster.append_on_poll("orders", 0);

    let report = run_move_partition(
        &cluster,
        &test_config(),
        &MoveRequest::new("orders", 0, 1),
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(report.moved, 10);
    assert_eq!(report.expected, 10);
    let dest = cluster.records("orders", 1);
    assert_eq!(dest.len(), 10);
    assert!(dest.iter().all(|r| r.key.as_deref() != Some(&b"live"[..])));
}

#[tokio::test]
async fn test_move_starts_at_low_watermark() {
    let cluster = InMemoryCluster::new();
    cluster.create_topic("orders", 2);
    seed(&cluster, "orders", 0, 10);
    cluster.truncate("orders", 0, 4);

    let report = run_move_partition(
        &cluster,
        &test_config(),
        &MoveRequest::new("orders", 0, 1),
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!((report.moved, report.expected), (6, 6));
    let first = &cluster.records("orders", 1)[0];
    assert_eq!(first.key.as_deref(), Some(&b"key-4"[..]));
}

#[tokio::test]
async fn test_delivery_failure_stops_the_move_at_a_known_offset() {
    let cluster = InMemoryCluster::new();
    cluster.create_topic("orders", 2);
    seed(&cluster, "orders", 0, 10);
    cluster.fail_deliveries_after(4);

    let err = run_move_partition(
        &cluster,
        &test_config(),
        &MoveRequest::new("orders", 0, 1),
        CancellationToken::new(),
    )
    .await
    .unwrap_err();

    assert!(matches!(
        err,
        MoverError::DeliveryFailure {
            partition: 0,
            offset: 4,
            ..
        }
    ));
    assert_eq!(cluster.records("orders", 1).len(), 4);

    // the consumer is released and its transient group removed, in that order
    let events = cluster.events();
    assert_eq!(events.len(), 2);
    assert!(matches!(events[0], ClusterEvent::SourceClosed { .. }));
    assert!(matches!(events[1], ClusterEvent::GroupDeleted { .. }));
}

#[tokio::test]
async fn test_cancelled_move_reports_partial_progress() {
    let cluster = InMemoryCluster::new();
    cluster.create_topic("orders", 2);
    seed(&cluster, "orders", 0, 10);

    let cancel = CancellationToken::new();
    cancel.cancel();
    let report = run_move_partition(
        &cluster,
        &test_config(),
        &MoveRequest::new("orders", 0, 1),
        cancel,
    )
    .await
    .unwrap();

    assert_eq!(report.moved, 0);
    assert_eq!(report.expected, 10);
    assert!(!report.is_complete());
    assert_eq!(report.stop_reason, Some(StopReason::Cancelled));
}

#[tokio::test]
async fn test_source_deletion_is_unsupported() {
    let cluster = InMemoryCluster::new();
    cluster.create_topic("orders", 2);
    seed(&cluster, "orders", 0, 3);

    let mut request = MoveRequest::new("orders", 0, 1);
    request.delete_source = true;
    let err = run_move_partition(&cluster, &test_config(), &request, CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, MoverError::Unsupported(_)));
    assert!(cluster.records("orders", 1).is_empty());
    assert!(cluster.events().is_empty());
}
