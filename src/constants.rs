//! Shared constants used throughout the project

use std::time::Duration;

/// Exchange to which rejected messages are routed for later inspection
pub const DEAD_LETTER_EXCHANGE: &str = "dead";

/// Queue bound to the dead-letter exchange which retains rejected messages
pub const DEAD_LETTER_QUEUE: &str = "dead_queue";

/// Binding key used for the dead-letter queue, matching every routing key
pub const DEAD_LETTER_BINDING_KEY: &str = "#";

/// Suffix appended to every declared name when running against a recovery broker
pub const RECOVERY_SUFFIX: &str = "_recovery";

/// State segment of routing keys published by collectors
pub const RAW_STATE: &str = "raw";

/// Number of unacknowledged deliveries a consumer is willing to hold
pub const DEFAULT_PREFETCH_COUNT: u16 = 20;

/// Number of buffered outbound messages after which publishing pauses to drain
pub const DEFAULT_OUTBOUND_THRESHOLD: usize = 100;

/// Upper bound on the pause between publishes regardless of the heartbeat
pub const PUBLISH_YIELD_CAP: Duration = Duration::from_secs(10);

/// Fraction of the broker heartbeat after which a publisher yields control
pub const PUBLISH_HEARTBEAT_FRACTION: f64 = 0.2;

/// Heartbeat interval assumed when the transport does not negotiate one
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);
