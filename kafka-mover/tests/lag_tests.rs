mod common;

use futures::TryStreamExt;
use kafka_mover::consume::{run_consume, ConsumeRequest};
use kafka_mover::lag::{run_lag, run_topic_offsets};
use kafka_mover::test_utils::InMemoryCluster;
use kafka_mover::types::Record;
use kafka_mover::MoverError;
use tokio_util::sync::CancellationToken;

use common::{seed, test_config};

fn cluster() -> InMemoryCluster {
    let cluster = InMemoryCluster::new();
    cluster.create_topic("orders", 3);
    cluster.create_topic("payments", 1);
    seed(&cluster, "orders", 0, 100);
    seed(&cluster, "orders", 1, 50);
    seed(&cluster, "orders", 2, 10);
    seed(&cluster, "payments", 0, 7);
    cluster
}

#[tokio::test]
async fn test_lag_per_partition_and_total() {
    let cluster = cluster();
    cluster.commit("billing", "orders", 0, 90);
    cluster.commit("billing", "orders", 1, 50);

    let report = run_lag(&cluster, "billing", &["orders".to_string()])
        .await
        .unwrap();

    assert_eq!(report.partition_lag("orders", 0), Some(10));
    assert_eq!(report.partition_lag("orders", 1), Some(0));
    // never committed: the whole partition is lag
    assert_eq!(report.partition_lag("orders", 2), Some(10));
    assert_eq!(report.topics["orders"].total, 20);
    assert_eq!(report.total, 20);
    assert!(report.skipped.is_empty());
}

#[tokio::test]
async fn test_lag_defaults_to_committed_topics() {
    let cluster = cluster();
    cluster.commit("billing", "payments", 0, 3);

    let report = run_lag(&cluster, "billing", &[]).await.unwrap();

    assert_eq!(report.topics.len(), 1);
    assert_eq!(report.partition_lag("payments", 0), Some(4));
    assert_eq!(report.total, 4);
}

#[tokio::test]
async fn test_lag_is_recomputed_on_every_call() {
    let cluster = cluster();
    cluster.commit("billing", "orders", 0, 40);
    let topics = vec!["orders".to_string()];

    let first = run_lag(&cluster, "billing", &topics).await.unwrap();
    let second = run_lag(&cluster, "billing", &topics).await.unwrap();
    assert_eq!(first, second);

    cluster.commit("billing", "orders", 0, 100);
    let third = run_lag(&cluster, "billing", &topics).await.unwrap();
    assert_eq!(third.partition_lag("orders", 0), Some(0));
    assert_eq!(third.total, first.total - 60);
}

#[tokio::test]
async fn test_lag_tracks_a_named_consumer() {
    let cluster = cluster();
    let mut request = ConsumeRequest::new(vec!["payments".to_string()]);
    request.group = Some("audit".to_string());
    request.limit = Some(5);

    let records: Vec<Record> =
        run_consume(&cluster, &test_config(), &request, CancellationToken::new())
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
    assert_eq!(records.len(), 5);

    let report = run_lag(&cluster, "audit", &[]).await.unwrap();
    assert_eq!(report.partition_lag("payments", 0), Some(2));
}

#[tokio::test]
async fn test_unreadable_partition_is_skipped() {
    let cluster = cluster();
    cluster.commit("billing", "orders", 0, 95);
    cluster.fail_watermarks("orders", 1);

    let report = run_lag(&cluster, "billing", &["orders".to_string()])
        .await
        .unwrap();

    assert_eq!(report.skipped, vec!["orders/1".to_string()]);
    assert_eq!(report.partition_lag("orders", 1), None);
    assert_eq!(report.total, 5 + 10);
}

#[tokio::test]
async fn test_unreadable_commits_fail_the_report() {
    let cluster = cluster();
    cluster.fail_committed_offsets(true);

    let err = run_lag(&cluster, "billing", &["orders".to_string()])
        .await
        .unwrap_err();
    assert!(err.is_timeout());
}

#[tokio::test]
async fn test_lag_of_unknown_topic() {
    let cluster = cluster();

    let err = run_lag(&cluster, "billing", &["nowhere".to_string()])
        .await
        .unwrap_err();
    assert!(matches!(err, MoverError::TopicNotFound(ref t) if t == "nowhere"));
}

#[tokio::test]
async fn test_topic_offsets() {
    let cluster = cluster();
    cluster.truncate("orders", 0, 30);

    let offsets = run_topic_offsets(&cluster, "orders").await.unwrap();

    assert_eq!(offsets.len(), 3);
    assert_eq!((offsets[&0].low(), offsets[&0].high()), (30, 100));
    assert_eq!((offsets[&1].low(), offsets[&1].high()), (0, 50));
    assert_eq!(offsets[&2].len(), 10);
}
