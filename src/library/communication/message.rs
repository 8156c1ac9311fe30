//! Message structures shared by all transport implementations

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Properties attached to every message travelling through the broker
///
/// The field names follow the wire conventions of the surrounding system:
/// consumers on other stacks expect `message_id`, `type` and `timestamp`
/// headers plus a free-form `meta` map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageProperties {
    /// Deterministic identifier assigned by the producing component
    pub message_id: String,

    /// Category of the payload, e.g. `stream` or `file` for raw data
    #[serde(rename = "type")]
    pub kind: String,

    /// Creation time of the payload as reported by the producer
    pub timestamp: DateTime<Utc>,

    /// Free-form metadata forwarded verbatim along the pipeline
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub meta: Map<String, Value>,

    /// Whether the broker should persist the message to disk
    #[serde(default = "default_persistence")]
    pub persistent: bool,
}

fn default_persistence() -> bool {
    true
}

impl MessageProperties {
    /// Creates persistent properties with an empty metadata map
    pub fn new(message_id: String, kind: String, timestamp: DateTime<Utc>) -> Self {
        Self {
            message_id,
            kind,
            timestamp,
            meta: Map::new(),
            persistent: true,
        }
    }
}

/// Message handed to the transport for publication
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    /// Name of the exchange the message is published to
    pub exchange: String,
    /// Routing key evaluated against queue bindings
    pub routing_key: String,
    /// Opaque payload
    pub body: Vec<u8>,
    /// Attached properties
    pub properties: MessageProperties,
}

/// Message delivered by the transport to a consumer
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    /// Routing key the message was published with
    pub routing_key: String,
    /// Opaque payload
    pub body: Vec<u8>,
    /// Attached properties
    pub properties: MessageProperties,
    /// Channel-local tag used to acknowledge or reject the delivery
    pub delivery_tag: u64,
}
