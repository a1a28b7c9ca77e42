// ==== Message pump ====
/// Counter for records read from the broker
pub const PUMP_RECORDS_CONSUMED: &str = "kafka_mover_records_consumed_total";

/// Counter for records dropped by the key filter
pub const PUMP_RECORDS_FILTERED: &str = "kafka_mover_records_filtered_total";

/// Counter for pump sessions ending, labelled by stop reason
pub const PUMP_SESSIONS_STOPPED: &str = "kafka_mover_pump_sessions_stopped_total";

/// Counter for read failures that ended a pump, labelled by error type
pub const PUMP_READ_ERRORS: &str = "kafka_mover_pump_read_errors_total";

/// Counter for transient group deletions that failed during cleanup
pub const TRANSIENT_GROUP_DELETE_FAILED: &str = "kafka_mover_transient_group_delete_failed_total";

// ==== Republisher ====
/// Counter for records handed to the producer
pub const RECORDS_PUBLISHED: &str = "kafka_mover_records_published_total";

/// Counter for delivery outcomes, labelled by status
pub const RECORDS_DELIVERED: &str = "kafka_mover_records_delivered_total";

/// Counter for flushes that left records undelivered
pub const FLUSH_INCOMPLETE: &str = "kafka_mover_flush_incomplete_total";

// ==== Lag ====
/// Gauge for messages behind per topic/partition/group
pub const CONSUMER_LAG: &str = "consumer_lag";
