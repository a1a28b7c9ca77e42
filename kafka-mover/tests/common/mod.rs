use kafka_mover::config::Config;
use kafka_mover::test_utils::InMemoryCluster;
use kafka_mover::types::RecordHeader;

/// Fixed settings with timeouts short enough for tests; the environment is never read.
pub fn test_config() -> Config {
    Config {
        kafka_hosts: "localhost:9092".to_string(),
        kafka_tls: false,
        kafka_sasl_mechanism: None,
        kafka_sasl_username: None,
        kafka_sasl_password: None,
        kafka_poll_timeout_ms: 10,
        kafka_metadata_timeout_ms: 1000,
        kafka_idle_timeout_ms: 100,
        kafka_flush_timeout_ms: 1000,
        kafka_producer_linger_ms: 0,
        kafka_producer_queue_mib: 50,
        kafka_message_timeout_ms: 5000,
        kafka_compression_codec: "none".to_string(),
        delivery_queue_capacity: 8,
        group_id_prefix: "kafka-mover-it".to_string(),
    }
}

/// Append `count` records keyed `key-<offset>` with a header and a fixed timestamp.
pub fn seed(cluster: &InMemoryCluster, topic: &str, partition: i32, count: i64) {
    for i in 0..count {
        let key = format!("key-{i}");
        let value = format!("value-{partition}-{i}");
        cluster.append_record(
            topic,
            partition,
            Some(key.as_bytes()),
            Some(value.as_bytes()),
            vec![
                RecordHeader::new("origin", Some(b"seed".to_vec())),
                RecordHeader::new("empty", None),
            ],
            Some(1_600_000_000_000 + i),
        );
    }
}
