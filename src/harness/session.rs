//! Driver feeding transport events through the protocol state machine

use super::{SessionEffect, SessionError, SessionMachine};
use crate::domain::topology::{consumer_tag, SessionTopology};
use crate::library::communication::message::{InboundMessage, OutboundMessage};
use crate::library::communication::transport::{Transport, TransportCommand};
use log::debug;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::timeout;

/// Live broker session of one component instance
///
/// Owns the transport and a [`SessionMachine`], translating the machine's
/// effects into transport commands and buffering deliveries until the
/// component asks for them.
pub struct BrokerSession<T: Transport> {
    transport: T,
    machine: SessionMachine,
    inbox: VecDeque<InboundMessage>,
}

impl<T: Transport> BrokerSession<T> {
    /// Creates a session for the given topology with a unique consumer tag
    pub fn new(transport: T, topology: SessionTopology, instance: &str) -> Self {
        let tag = consumer_tag(&topology.component, instance);
        Self::with_tag(transport, topology, tag)
    }

    fn with_tag(transport: T, topology: SessionTopology, tag: String) -> Self {
        Self {
            transport,
            machine: SessionMachine::new(topology, tag),
            inbox: VecDeque::new(),
        }
    }

    /// Negotiates the full topology, failing when the limit expires first
    pub async fn setup(&mut self, limit: Duration) -> Result<(), SessionError> {
        timeout(limit, self.negotiate())
            .await
            .map_err(|_| SessionError::SetupTimeout(limit))?
    }

    /// Waits for the next delivery
    pub async fn recv(&mut self) -> Result<InboundMessage, SessionError> {
        loop {
            if let Some(message) = self.inbox.pop_front() {
                return Ok(message);
            }

            if self.machine.is_closed() {
                return Err(self.machine.take_failure().unwrap_or(SessionError::Closed));
            }

            let event = self.transport.next_event().await?;
            let effects = self.machine.handle(event)?;
            self.apply(effects).await?;
        }
    }

    /// Acknowledges a delivery
    pub async fn ack(&mut self, delivery_tag: u64) -> Result<(), SessionError> {
        self.transport
            .execute(TransportCommand::Ack { delivery_tag })
            .await?;
        Ok(())
    }

    /// Rejects a delivery, optionally queueing it up for a future attempt
    pub async fn reject(&mut self, delivery_tag: u64, requeue: bool) -> Result<(), SessionError> {
        self.transport
            .execute(TransportCommand::Reject {
                delivery_tag,
                requeue,
            })
            .await?;
        Ok(())
    }

    /// Publishes a message, refusing while closing or before the output side
    /// confirmed every exchange
    pub async fn publish(&mut self, message: OutboundMessage) -> Result<(), SessionError> {
        let command = self.machine.publish(message)?;
        self.transport.execute(command).await?;
        Ok(())
    }

    /// Processes every event the transport has already queued, never blocking
    pub async fn pump(&mut self) -> Result<(), SessionError> {
        while let Some(event) = self.transport.try_next_event() {
            let effects = self.machine.handle(event)?;
            self.apply(effects).await?;
        }

        Ok(())
    }

    /// Tears the session down in an orderly fashion
    ///
    /// A failure the machine recorded during operation, such as a broker
    /// side consumer cancellation, surfaces here after the teardown.
    pub async fn shutdown(&mut self, limit: Duration) -> Result<(), SessionError> {
        timeout(limit, self.teardown())
            .await
            .map_err(|_| SessionError::ShutdownTimeout(limit))??;

        match self.machine.take_failure() {
            Some(failure) => Err(failure),
            None => Ok(()),
        }
    }

    /// Number of published messages the transport has not handed off yet
    pub fn outbound_len(&self) -> usize {
        self.transport.outbound_len()
    }

    /// Heartbeat interval negotiated by the transport
    pub fn heartbeat_interval(&self) -> Duration {
        self.transport.heartbeat_interval()
    }

    async fn negotiate(&mut self) -> Result<(), SessionError> {
        let effects = self.machine.start()?;
        self.apply(effects).await?;

        while !self.machine.is_ready() {
            let event = self.transport.next_event().await?;
            let effects = self.machine.handle(event)?;
            self.apply(effects).await?;
        }

        debug!("Session setup complete");
        Ok(())
    }

    async fn teardown(&mut self) -> Result<(), SessionError> {
        let effects = self.machine.close();
        self.apply(effects).await?;

        while !self.machine.is_closed() {
            let event = self.transport.next_event().await?;
            let effects = self.machine.handle(event)?;
            self.apply(effects).await?;
        }

        Ok(())
    }

    async fn apply(&mut self, effects: Vec<SessionEffect>) -> Result<(), SessionError> {
        for effect in effects {
            match effect {
                SessionEffect::Execute(command) => self.transport.execute(command).await?,
                SessionEffect::Deliver(message) => self.inbox.push_back(message),
                SessionEffect::InputReady => debug!("Input side ready, consumer running"),
                SessionEffect::OutputReady => debug!("Output side ready"),
                SessionEffect::Closed => {}
            }
        }

        Ok(())
    }
}
