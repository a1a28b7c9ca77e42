use rdkafka::ClientConfig;

use crate::config::Config;
use crate::pump::OffsetReset;

/// Consumer configuration builder layered on top of the shared connection settings.
///
/// Two entry points provide appropriate defaults for each consumer type:
/// - `for_group_consumer`: subscribes through the group coordinator, so partition
///   assignment and rebalancing are handled by the broker.
/// - `for_assigned_consumer`: manual assignment with explicit start offsets. `group.id`
///   is still required by rdkafka but the consumer never joins the group and never
///   commits.
pub struct ConsumerConfigBuilder {
    config: ClientConfig,
}

impl ConsumerConfigBuilder {
    pub fn for_group_consumer(base: &ClientConfig, group_id: &str) -> Self {
        let mut config = base.clone();

        config
            .set("group.id", group_id)
            .set("enable.partition.eof", "false")
            .set("socket.timeout.ms", "10000")
            .set("session.timeout.ms", "6000");

        Self { config }
    }

    pub fn for_assigned_consumer(base: &ClientConfig, group_id: &str) -> Self {
        let mut config = base.clone();

        config
            .set("group.id", group_id)
            .set("enable.partition.eof", "false")
            .set("enable.auto.commit", "false")
            .set("socket.timeout.ms", "10000");

        Self { config }
    }

    /// Where to start when the group has no committed offset (or an assigned
    /// offset falls outside the retained range)
    pub fn with_offset_reset(mut self, policy: OffsetReset) -> Self {
        self.config.set("auto.offset.reset", policy.as_str());
        self
    }

    pub fn with_auto_commit(mut self, enabled: bool) -> Self {
        self.config
            .set("enable.auto.commit", if enabled { "true" } else { "false" });
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}

/// Producer settings for republishing.
pub fn producer_config(base: &ClientConfig, config: &Config) -> ClientConfig {
    let mut client_config = base.clone();
    client_config
        .set("linger.ms", config.kafka_producer_linger_ms.to_string())
        .set(
            "message.timeout.ms",
            config.kafka_message_timeout_ms.to_string(),
        )
        .set(
            "compression.codec",
            config.kafka_compression_codec.to_owned(),
        )
        .set(
            "queue.buffering.max.kbytes",
            (config.kafka_producer_queue_mib * 1024).to_string(),
        );
    client_config
}
