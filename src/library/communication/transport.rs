//! Broker transport seam used by the protocol session

use super::message::{InboundMessage, OutboundMessage};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Reply code signalling an orderly channel or connection closure
pub const REPLY_SUCCESS: u16 = 200;
/// Reply code used when a referenced exchange or queue does not exist
pub const REPLY_NOT_FOUND: u16 = 404;
/// Reply code used when a declaration conflicts with an existing entity
pub const REPLY_PRECONDITION_FAILED: u16 = 406;
/// Reply code used when an exclusive resource is held by somebody else
pub const REPLY_RESOURCE_LOCKED: u16 = 405;

/// Logical channel multiplexed over the broker connection
///
/// The pipeline uses at most two: one carrying consumption related operations
/// and one carrying publications. Keeping them apart ensures that a failure on
/// either side closes with an attributable reply code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// Channel owning the input queue and the consumer
    Input,
    /// Channel owning the output exchanges
    Output,
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelKind::Input => write!(f, "input"),
            ChannelKind::Output => write!(f, "output"),
        }
    }
}

/// Exchange routing discipline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    /// Pattern matching on dot separated routing keys (`*` and `#` wildcards)
    Topic,
    /// Exact routing key equality
    Direct,
}

/// Operation submitted to the broker
#[derive(Debug, Clone, PartialEq)]
pub enum TransportCommand {
    /// Open the connection
    Connect,
    /// Open a logical channel
    OpenChannel(ChannelKind),
    /// Declare an exchange on the given channel
    DeclareExchange {
        /// Channel the declaration is issued on
        channel: ChannelKind,
        /// Exchange name
        exchange: String,
        /// Routing discipline
        kind: ExchangeKind,
        /// Whether the exchange survives broker restarts
        durable: bool,
    },
    /// Declare a queue on the input channel
    DeclareQueue {
        /// Queue name
        queue: String,
        /// Whether the queue survives broker restarts
        durable: bool,
        /// Whether the queue is owned by this connection exclusively
        exclusive: bool,
        /// Exchange rejected messages are re-routed to
        dead_letter_exchange: Option<String>,
    },
    /// Bind a queue to an exchange under a binding key
    BindQueue {
        /// Queue name
        queue: String,
        /// Source exchange
        exchange: String,
        /// Binding key, may contain wildcards for topic exchanges
        binding_key: String,
    },
    /// Limit the number of unacknowledged deliveries on the input channel
    ConfigureQos {
        /// Maximum number of in-flight deliveries
        prefetch_count: u16,
    },
    /// Start consuming from a queue
    StartConsumer {
        /// Queue name
        queue: String,
        /// Tag identifying the consumer on this connection
        consumer_tag: String,
    },
    /// Stop a previously started consumer
    CancelConsumer {
        /// Tag the consumer was started with
        consumer_tag: String,
    },
    /// Publish a message
    Publish(OutboundMessage),
    /// Acknowledge a delivery
    Ack {
        /// Tag of the delivery being acknowledged
        delivery_tag: u64,
    },
    /// Reject a delivery
    Reject {
        /// Tag of the delivery being rejected
        delivery_tag: u64,
        /// Whether the broker should re-deliver instead of dead-lettering
        requeue: bool,
    },
    /// Close a logical channel
    CloseChannel(ChannelKind),
    /// Close the connection
    CloseConnection,
}

/// Event emitted by the broker
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The connection is open and channels may be created
    ConnectionOpened,
    /// The connection has been closed
    ConnectionClosed {
        /// Reply code, [`REPLY_SUCCESS`] for orderly closure
        code: u16,
        /// Human readable close reason
        reason: String,
    },
    /// A logical channel is open
    ChannelOpened(ChannelKind),
    /// A logical channel has been closed
    ChannelClosed {
        /// Channel the closure applies to
        channel: ChannelKind,
        /// Reply code, [`REPLY_SUCCESS`] for orderly closure
        code: u16,
        /// Human readable close reason
        reason: String,
    },
    /// An exchange declaration has been confirmed
    ExchangeDeclared {
        /// Channel the declaration was issued on
        channel: ChannelKind,
        /// Exchange name
        exchange: String,
    },
    /// A queue declaration has been confirmed
    QueueDeclared {
        /// Queue name
        queue: String,
    },
    /// A queue binding has been confirmed
    QueueBound {
        /// Queue name
        queue: String,
        /// Binding key the queue was bound under
        binding_key: String,
    },
    /// The prefetch limit has been applied
    QosConfigured,
    /// A consumer has been registered
    ConsumerStarted {
        /// Tag the consumer was registered under
        consumer_tag: String,
    },
    /// A consumer has been cancelled, either on request or by the broker
    ConsumerCancelled {
        /// Tag of the affected consumer
        consumer_tag: String,
    },
    /// A message has been delivered to the active consumer
    Delivery(InboundMessage),
}

/// Failure of the transport link itself
#[derive(Debug, Error)]
pub enum TransportError {
    /// The broker side of the link is gone
    #[error("transport link to the broker is closed")]
    Disconnected,
    /// A command was submitted before [`TransportCommand::Connect`]
    #[error("transport is not connected")]
    NotConnected,
}

/// Bidirectional, ordered link to a message broker
///
/// Commands are executed asynchronously; their outcomes surface as
/// [`TransportEvent`]s in submission order. Implementations have to preserve
/// ordering per link since the protocol session derives its state from it.
#[async_trait]
pub trait Transport: Send {
    /// Submits a command to the broker
    async fn execute(&mut self, command: TransportCommand) -> Result<(), TransportError>;

    /// Waits for the next broker event
    async fn next_event(&mut self) -> Result<TransportEvent, TransportError>;

    /// Returns the next broker event if one is already pending
    fn try_next_event(&mut self) -> Option<TransportEvent>;

    /// Number of published messages that have not reached the broker yet
    fn outbound_len(&self) -> usize;

    /// Heartbeat interval negotiated with the broker
    fn heartbeat_interval(&self) -> Duration;
}
