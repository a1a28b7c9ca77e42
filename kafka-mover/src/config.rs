use std::time::Duration;

use envconfig::Envconfig;
use rdkafka::ClientConfig;

use crate::error::MoverError;

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    // Kafka connection
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    pub kafka_sasl_mechanism: Option<String>, // PLAIN, SCRAM-SHA-256, SCRAM-SHA-512

    pub kafka_sasl_username: Option<String>,

    pub kafka_sasl_password: Option<String>,

    // Consumer side
    #[envconfig(default = "100")]
    pub kafka_poll_timeout_ms: u64,

    #[envconfig(default = "5000")]
    pub kafka_metadata_timeout_ms: u64,

    // How long a watermark-bounded read waits for more records before giving up
    #[envconfig(default = "10000")]
    pub kafka_idle_timeout_ms: u64,

    // Producer side
    #[envconfig(default = "5000")]
    pub kafka_flush_timeout_ms: u64,

    #[envconfig(default = "20")]
    pub kafka_producer_linger_ms: u32, // Maximum time between producer batches during low traffic

    #[envconfig(default = "400")]
    pub kafka_producer_queue_mib: u32, // Size of the in-memory producer queue in mebibytes

    #[envconfig(default = "20000")]
    pub kafka_message_timeout_ms: u32, // Time before we stop retrying producing a message: 20 seconds

    #[envconfig(default = "none")]
    pub kafka_compression_codec: String, // none, gzip, snappy, lz4, zstd

    // Capacity of the queue between the republisher and its delivery drain worker
    #[envconfig(default = "10000")]
    pub delivery_queue_capacity: usize,

    #[envconfig(default = "kafka-mover")]
    pub group_id_prefix: String,
}

impl Config {
    /// Initialize from environment variables (for production and tests)
    pub fn init_with_defaults() -> Result<Self, envconfig::Error> {
        Config::init_from_env()
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.kafka_poll_timeout_ms)
    }

    pub fn metadata_timeout(&self) -> Duration {
        Duration::from_millis(self.kafka_metadata_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.kafka_idle_timeout_ms)
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.kafka_flush_timeout_ms)
    }

    /// Generate a group id for a session that did not name one.
    pub fn transient_group_id(&self, purpose: &str) -> String {
        format!("{}-{}-{}", self.group_id_prefix, purpose, uuid::Uuid::now_v7())
    }

    /// Connection settings shared by every client this process creates.
    ///
    /// Fails with `MoverError::Configuration` before any connection is attempted.
    pub fn client_config(&self) -> Result<ClientConfig, MoverError> {
        if self.kafka_hosts.trim().is_empty() {
            return Err(MoverError::Configuration(
                "KAFKA_HOSTS must name at least one bootstrap server".to_string(),
            ));
        }

        let mut client_config = ClientConfig::new();
        client_config.set("bootstrap.servers", &self.kafka_hosts);

        match &self.kafka_sasl_mechanism {
            Some(mechanism) => {
                let (Some(username), Some(password)) =
                    (&self.kafka_sasl_username, &self.kafka_sasl_password)
                else {
                    return Err(MoverError::Configuration(format!(
                        "SASL mechanism {mechanism} requires KAFKA_SASL_USERNAME and KAFKA_SASL_PASSWORD"
                    )));
                };
                let protocol = if self.kafka_tls {
                    "SASL_SSL"
                } else {
                    "SASL_PLAINTEXT"
                };
                client_config
                    .set("security.protocol", protocol)
                    .set("sasl.mechanism", mechanism)
                    .set("sasl.username", username)
                    .set("sasl.password", password);
            }
            None if self.kafka_tls => {
                client_config
                    .set("security.protocol", "ssl")
                    .set("enable.ssl.certificate.verification", "false");
            }
            None => {}
        }

        Ok(client_config)
    }
}
