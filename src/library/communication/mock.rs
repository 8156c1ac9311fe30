//! Scripted transport for protocol level tests

use super::transport::{Transport, TransportCommand, TransportError, TransportEvent};
use async_trait::async_trait;
use pretty_assertions::assert_eq;
use std::collections::VecDeque;
use std::time::Duration;

struct ScriptedStep {
    command: TransportCommand,
    events: Vec<TransportEvent>,
}

/// Transport replaying a pre-recorded exchange with the broker
///
/// Every command submitted through [`Transport::execute`] is compared against
/// the next scripted step. A match enqueues the step's events for consumption,
/// any deviation panics with a diff of both commands. Dropping the transport
/// with unconsumed steps panics as well, so a test cannot silently pass while
/// skipping part of the expected protocol conversation.
pub struct ScriptedTransport {
    script: VecDeque<ScriptedStep>,
    inbox: VecDeque<TransportEvent>,
    published: usize,
    heartbeat_interval: Duration,
}

impl Default for ScriptedTransport {
    fn default() -> Self {
        Self {
            script: VecDeque::new(),
            inbox: VecDeque::new(),
            published: 0,
            heartbeat_interval: Duration::from_secs(60),
        }
    }
}

impl ScriptedTransport {
    /// Overrides the heartbeat interval reported to the session
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Appends an expected command and the events the broker answers with
    pub fn expect(mut self, command: TransportCommand, events: Vec<TransportEvent>) -> Self {
        self.script.push_back(ScriptedStep { command, events });
        self
    }

    /// Enqueues an event the broker sends without being asked, e.g. a
    /// server-initiated consumer cancellation
    pub fn push_event(mut self, event: TransportEvent) -> Self {
        self.inbox.push_back(event);
        self
    }

    /// Number of scripted steps that have not been consumed yet
    pub fn remaining(&self) -> usize {
        self.script.len()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn execute(&mut self, command: TransportCommand) -> Result<(), TransportError> {
        match self.script.pop_front() {
            None => panic!("received {:?} after the end of the script", command),
            Some(step) => {
                assert_eq!(
                    step.command, command,
                    "command (right) did not match the scripted expectation (left)"
                );

                if let TransportCommand::Publish(_) = &command {
                    self.published += 1;
                }

                self.inbox.extend(step.events);
                Ok(())
            }
        }
    }

    // Parks forever once the inbox runs dry, mirroring a broker that simply
    // stays silent. Callers are expected to pair it with a timeout.
    async fn next_event(&mut self) -> Result<TransportEvent, TransportError> {
        match self.inbox.pop_front() {
            Some(event) => Ok(event),
            None => futures::future::pending().await,
        }
    }

    fn try_next_event(&mut self) -> Option<TransportEvent> {
        self.inbox.pop_front()
    }

    // A scripted broker never consumes what has been published
    fn outbound_len(&self) -> usize {
        self.published
    }

    fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }
}

impl Drop for ScriptedTransport {
    fn drop(&mut self) {
        if !std::thread::panicking() && !self.script.is_empty() {
            panic!(
                "ScriptedTransport was dropped with {} scripted commands remaining",
                self.script.len()
            );
        }
    }
}

#[cfg(test)]
mod does {
    use super::super::transport::ChannelKind;
    use super::*;

    #[tokio::test]
    async fn replay_scripted_events() {
        let mut transport = ScriptedTransport::default().expect(
            TransportCommand::Connect,
            vec![TransportEvent::ConnectionOpened],
        );

        transport.execute(TransportCommand::Connect).await.unwrap();

        assert_eq!(
            transport.next_event().await.unwrap(),
            TransportEvent::ConnectionOpened
        );
    }

    #[tokio::test]
    #[should_panic]
    async fn fail_on_deviating_commands() {
        let mut transport = ScriptedTransport::default().expect(
            TransportCommand::Connect,
            vec![TransportEvent::ConnectionOpened],
        );

        transport
            .execute(TransportCommand::OpenChannel(ChannelKind::Input))
            .await
            .unwrap();
    }

    #[test]
    #[should_panic]
    fn fail_on_unconsumed_script() {
        let _ = ScriptedTransport::default().expect(
            TransportCommand::Connect,
            vec![TransportEvent::ConnectionOpened],
        );
    }
}
