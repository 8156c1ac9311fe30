//! In-process broker backing single-process pipelines and tests
//!
//! The broker runs as a background task owning all exchanges, queues and
//! bindings. Every [`MemoryLink`] handed out by [`MemoryBroker::link`] is an
//! independent connection with its own ordered command and event streams, so
//! components talking to it behave exactly as they would against a networked
//! broker: declarations are confirmed asynchronously, deliveries respect the
//! prefetch window and rejected messages travel to the dead-letter exchange.
//!
//! Everything is kept in memory. Durability and persistence flags are
//! accepted to keep the interface faithful, but nothing survives the process.

mod broker;

use super::transport::{Transport, TransportCommand, TransportError, TransportEvent};
use async_trait::async_trait;
use broker::{BrokerCore, BrokerOp};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Tuning knobs for the in-process broker
#[derive(Debug, Clone)]
pub struct MemoryBrokerConfig {
    /// Heartbeat interval reported to connected links
    pub heartbeat_interval: Duration,
}

impl Default for MemoryBrokerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(60),
        }
    }
}

/// Handle to a running in-process broker
///
/// Cloning the handle is cheap and all clones talk to the same broker task.
/// The task shuts down once every handle and link has been dropped.
#[derive(Clone)]
pub struct MemoryBroker {
    ops: mpsc::UnboundedSender<BrokerOp>,
    next_link: Arc<AtomicU64>,
    config: MemoryBrokerConfig,
}

impl MemoryBroker {
    /// Spawns a new broker task and returns a handle to it
    pub fn start(config: MemoryBrokerConfig) -> Self {
        let (ops, inbox) = mpsc::unbounded_channel();

        tokio::spawn(BrokerCore::default().run(inbox));

        Self {
            ops,
            next_link: Arc::new(AtomicU64::new(0)),
            config,
        }
    }

    /// Creates a new connection to the broker
    pub fn link(&self) -> MemoryLink {
        let id = self.next_link.fetch_add(1, Ordering::SeqCst);
        let (events, event_inbox) = mpsc::unbounded_channel();
        let outbound = Arc::new(AtomicUsize::new(0));

        self.ops
            .send(BrokerOp::Attach {
                link: id,
                events,
                outbound: outbound.clone(),
            })
            .ok();

        MemoryLink {
            id,
            ops: self.ops.clone(),
            events: event_inbox,
            outbound,
            heartbeat_interval: self.config.heartbeat_interval,
        }
    }

    /// Number of messages a queue currently holds, in-flight deliveries included
    pub async fn depth(&self, queue: &str) -> usize {
        let (reply, response) = oneshot::channel();

        let sent = self
            .ops
            .send(BrokerOp::Depth {
                queue: queue.to_string(),
                reply,
            })
            .is_ok();

        if !sent {
            return 0;
        }

        response.await.unwrap_or(0)
    }

    /// Deletes a queue, cancelling its consumer if one is active
    pub async fn delete_queue(&self, queue: &str) {
        self.ops
            .send(BrokerOp::DeleteQueue {
                queue: queue.to_string(),
            })
            .ok();
    }
}

/// Single connection to a [`MemoryBroker`]
pub struct MemoryLink {
    id: u64,
    ops: mpsc::UnboundedSender<BrokerOp>,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    outbound: Arc<AtomicUsize>,
    heartbeat_interval: Duration,
}

#[async_trait]
impl Transport for MemoryLink {
    async fn execute(&mut self, command: TransportCommand) -> Result<(), TransportError> {
        if let TransportCommand::Publish(_) = &command {
            self.outbound.fetch_add(1, Ordering::SeqCst);
        }

        self.ops
            .send(BrokerOp::Command {
                link: self.id,
                command,
            })
            .map_err(|_| TransportError::Disconnected)
    }

    async fn next_event(&mut self) -> Result<TransportEvent, TransportError> {
        self.events.recv().await.ok_or(TransportError::Disconnected)
    }

    fn try_next_event(&mut self) -> Option<TransportEvent> {
        self.events.try_recv().ok()
    }

    fn outbound_len(&self) -> usize {
        self.outbound.load(Ordering::SeqCst)
    }

    fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }
}

impl Drop for MemoryLink {
    fn drop(&mut self) {
        self.ops.send(BrokerOp::Detach { link: self.id }).ok();
    }
}
