//! Message movement and lag accounting for Kafka.
//!
//! The engine reads records under explicit offset control ([`pump`]),
//! republishes them elsewhere ([`republisher`]) and derives consumer lag from
//! committed offsets and watermarks ([`lag`]). The operations exposed to
//! callers are [`consume::run_consume`], [`consume::run_tail`],
//! [`copy::run_copy`], [`migrator::run_move_partition`], [`lag::run_lag`] and
//! [`lag::run_topic_offsets`]. All of them talk to the cluster through the
//! [`kafka::client::BrokerClient`] seam.

pub mod config;
pub mod consume;
pub mod copy;
pub mod error;
pub mod kafka;
pub mod key_filter;
pub mod lag;
pub mod metrics_consts;
pub mod migrator;
pub mod pump;
pub mod republisher;
pub mod test_utils;
pub mod types;

pub use error::MoverError;
pub use key_filter::matches_key_filter;
