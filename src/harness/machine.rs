//! Protocol state machine negotiating and tearing down broker sessions
//!
//! The machine owns no I/O. It consumes [`TransportEvent`]s through a single
//! transition function and answers with [`SessionEffect`]s which the caller
//! applies to the transport. Input and output channel setup progress
//! independently, while operations on one channel are strictly sequenced.

use crate::constants::DEAD_LETTER_BINDING_KEY;
use crate::domain::topology::{InputQueueSpec, SessionTopology};
use crate::library::communication::message::{InboundMessage, OutboundMessage};
use crate::library::communication::transport::{
    ChannelKind, ExchangeKind, TransportCommand, TransportError, TransportEvent, REPLY_SUCCESS,
};
use log::{debug, trace, warn};
use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;

/// Failure of a broker session
///
/// Most variants are fatal by design: the process is expected to log them,
/// exit and leave the restart to an external supervisor.
#[derive(Debug, Error)]
pub enum SessionError {
    /// A channel closed outside of an orderly teardown
    #[error("the {channel} channel closed unexpectedly with code {code}: {reason}")]
    ChannelFailure {
        /// Channel that went away
        channel: ChannelKind,
        /// Protocol reply code sent by the broker
        code: u16,
        /// Human readable close reason
        reason: String,
    },

    /// The connection closed outside of an orderly teardown
    #[error("the connection closed unexpectedly with code {code}: {reason}")]
    ConnectionFailure {
        /// Protocol reply code sent by the broker
        code: u16,
        /// Human readable close reason
        reason: String,
    },

    /// The broker cancelled the consumer without being asked to
    #[error("the broker cancelled consumer '{0}'")]
    ConsumerCancelled(String),

    /// A publish was attempted during teardown
    #[error("attempted to publish while the session is closing")]
    PublishWhileClosing,

    /// A publish was attempted before all output exchanges were confirmed
    #[error("attempted to publish before every output exchange was declared")]
    OutputNotReady,

    /// A delivery arrived although no consumer is running
    #[error("received a delivery outside of the consuming state")]
    UnexpectedDelivery,

    /// The topology neither consumes nor publishes anything
    #[error("the topology declares neither an input queue nor output exchanges")]
    EmptyTopology,

    /// The broker sent an event that has no place in the current state
    #[error("protocol violation: {0}")]
    UnexpectedEvent(String),

    /// The underlying transport gave up
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Topology negotiation stalled
    #[error("topology negotiation did not finish within {0:?}")]
    SetupTimeout(Duration),

    /// Session teardown stalled
    #[error("session teardown did not finish within {0:?}")]
    ShutdownTimeout(Duration),

    /// An operation was attempted on a session that is already gone
    #[error("the session is closed")]
    Closed,
}

/// Side effect requested by the state machine
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEffect {
    /// Issue the given command on the transport
    Execute(TransportCommand),
    /// Hand the delivery to the consuming component
    Deliver(InboundMessage),
    /// The input side finished its setup and consumption is running
    InputReady,
    /// Every declared output exchange has been confirmed
    OutputReady,
    /// Teardown finished, the connection is gone
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionPhase {
    Disconnected,
    Connecting,
    Active,
    ClosingChannels,
    ClosingConnection,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InputPhase {
    Absent,
    ChannelOpening,
    ExchangeDeclaring,
    DeadExchangeDeclaring,
    DeadQueueDeclaring,
    QueueDeclaring,
    Binding { bound: usize },
    QosConfiguring,
    ConsumerStarting,
    Consuming,
    ConsumerStopping,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputPhase {
    Absent,
    ChannelOpening,
    ExchangesDeclaring { declared: usize },
    Ready,
    Stopped,
}

/// Pure state machine tracking one broker session
pub struct SessionMachine {
    topology: SessionTopology,
    consumer_tag: String,
    connection: ConnectionPhase,
    input: InputPhase,
    output: OutputPhase,
    open_channels: HashSet<ChannelKind>,
    closing: bool,
    failure: Option<SessionError>,
}

impl SessionMachine {
    /// Creates a machine for the given topology, not yet connected
    pub fn new(topology: SessionTopology, consumer_tag: String) -> Self {
        Self {
            topology,
            consumer_tag,
            connection: ConnectionPhase::Disconnected,
            input: InputPhase::Absent,
            output: OutputPhase::Absent,
            open_channels: HashSet::new(),
            closing: false,
            failure: None,
        }
    }

    /// Begins the connection handshake
    pub fn start(&mut self) -> Result<Vec<SessionEffect>, SessionError> {
        if self.topology.is_empty() {
            return Err(SessionError::EmptyTopology);
        }

        if self.connection != ConnectionPhase::Disconnected {
            return Err(self.unexpected("start of an already running session"));
        }

        self.connection = ConnectionPhase::Connecting;

        Ok(vec![SessionEffect::Execute(TransportCommand::Connect)])
    }

    /// Advances the machine by one transport event
    pub fn handle(&mut self, event: TransportEvent) -> Result<Vec<SessionEffect>, SessionError> {
        trace!("Protocol event: {:?}", event);

        match event {
            TransportEvent::ConnectionOpened => self.connection_opened(),
            TransportEvent::ConnectionClosed { code, reason } => {
                self.connection_closed(code, reason)
            }
            TransportEvent::ChannelOpened(kind) => self.channel_opened(kind),
            TransportEvent::ChannelClosed {
                channel,
                code,
                reason,
            } => self.channel_closed(channel, code, reason),
            TransportEvent::ExchangeDeclared { channel, exchange } => {
                self.exchange_declared(channel, exchange)
            }
            TransportEvent::QueueDeclared { queue } => self.queue_declared(queue),
            TransportEvent::QueueBound { .. } => self.queue_bound(),
            TransportEvent::QosConfigured => self.qos_configured(),
            TransportEvent::ConsumerStarted { consumer_tag } => self.consumer_started(consumer_tag),
            TransportEvent::ConsumerCancelled { consumer_tag } => {
                self.consumer_cancelled(consumer_tag)
            }
            TransportEvent::Delivery(message) => self.delivery(message),
        }
    }

    /// Starts an orderly teardown, idempotent
    pub fn close(&mut self) -> Vec<SessionEffect> {
        if self.closing {
            return Vec::new();
        }

        self.closing = true;
        debug!("Closing broker session of '{}'", self.topology.component);

        match self.connection {
            ConnectionPhase::Disconnected | ConnectionPhase::Connecting => {
                self.connection = ConnectionPhase::Closed;
                vec![SessionEffect::Closed]
            }
            ConnectionPhase::Active => {
                if self.input == InputPhase::Consuming {
                    self.input = InputPhase::ConsumerStopping;
                    vec![SessionEffect::Execute(TransportCommand::CancelConsumer {
                        consumer_tag: self.consumer_tag.clone(),
                    })]
                } else {
                    self.close_channels()
                }
            }
            _ => Vec::new(),
        }
    }

    /// Wraps the message into a publish command, refusing when the session
    /// is closing or the output side has not confirmed all exchanges yet
    pub fn publish(&self, message: OutboundMessage) -> Result<TransportCommand, SessionError> {
        if self.closing {
            return Err(SessionError::PublishWhileClosing);
        }

        if self.output != OutputPhase::Ready {
            return Err(SessionError::OutputNotReady);
        }

        Ok(TransportCommand::Publish(message))
    }

    /// Whether every declared side of the topology finished its setup
    pub fn is_ready(&self) -> bool {
        let input_ready = matches!(self.input, InputPhase::Absent | InputPhase::Consuming);
        let output_ready = matches!(self.output, OutputPhase::Absent | OutputPhase::Ready);

        self.connection == ConnectionPhase::Active && input_ready && output_ready && !self.closing
    }

    /// Whether the teardown has completed
    pub fn is_closed(&self) -> bool {
        self.connection == ConnectionPhase::Closed
    }

    /// Whether a teardown is in progress or completed
    pub fn is_closing(&self) -> bool {
        self.closing
    }

    /// Failure that initiated an internal teardown, if any
    pub fn take_failure(&mut self) -> Option<SessionError> {
        self.failure.take()
    }

    fn connection_opened(&mut self) -> Result<Vec<SessionEffect>, SessionError> {
        if self.connection != ConnectionPhase::Connecting {
            return Err(self.unexpected("connection opened"));
        }

        self.connection = ConnectionPhase::Active;
        debug!("Connection established, opening channels");

        let mut effects = Vec::new();

        if self.topology.input.is_some() {
            self.input = InputPhase::ChannelOpening;
            effects.push(SessionEffect::Execute(TransportCommand::OpenChannel(
                ChannelKind::Input,
            )));
        }

        if !self.topology.outputs.is_empty() {
            self.output = OutputPhase::ChannelOpening;
            effects.push(SessionEffect::Execute(TransportCommand::OpenChannel(
                ChannelKind::Output,
            )));
        }

        Ok(effects)
    }

    fn channel_opened(&mut self, kind: ChannelKind) -> Result<Vec<SessionEffect>, SessionError> {
        self.open_channels.insert(kind);

        match kind {
            ChannelKind::Input => {
                if self.input != InputPhase::ChannelOpening {
                    return Err(self.unexpected("input channel opened"));
                }

                let spec = self.input_spec()?;
                let command = TransportCommand::DeclareExchange {
                    channel: ChannelKind::Input,
                    exchange: spec.exchange.clone(),
                    kind: spec.exchange_kind,
                    durable: true,
                };

                self.input = InputPhase::ExchangeDeclaring;
                Ok(vec![SessionEffect::Execute(command)])
            }
            ChannelKind::Output => {
                if self.output != OutputPhase::ChannelOpening {
                    return Err(self.unexpected("output channel opened"));
                }

                let command = self.declare_output(0)?;
                self.output = OutputPhase::ExchangesDeclaring { declared: 0 };
                Ok(vec![SessionEffect::Execute(command)])
            }
        }
    }

    fn exchange_declared(
        &mut self,
        channel: ChannelKind,
        exchange: String,
    ) -> Result<Vec<SessionEffect>, SessionError> {
        match channel {
            ChannelKind::Input => match self.input {
                InputPhase::ExchangeDeclaring => {
                    self.expect_name(&exchange, &self.input_spec()?.exchange.clone())?;

                    let command = TransportCommand::DeclareExchange {
                        channel: ChannelKind::Input,
                        exchange: self.topology.dead_exchange.clone(),
                        kind: ExchangeKind::Topic,
                        durable: true,
                    };

                    self.input = InputPhase::DeadExchangeDeclaring;
                    Ok(vec![SessionEffect::Execute(command)])
                }
                InputPhase::DeadExchangeDeclaring => {
                    self.expect_name(&exchange, &self.topology.dead_exchange.clone())?;

                    let command = TransportCommand::DeclareQueue {
                        queue: self.topology.dead_queue.clone(),
                        durable: true,
                        exclusive: false,
                        dead_letter_exchange: None,
                    };

                    self.input = InputPhase::DeadQueueDeclaring;
                    Ok(vec![SessionEffect::Execute(command)])
                }
                _ => Err(self.unexpected("input exchange declaration")),
            },
            ChannelKind::Output => match self.output {
                OutputPhase::ExchangesDeclaring { declared } => {
                    let declared = declared + 1;

                    if declared < self.topology.outputs.len() {
                        let command = self.declare_output(declared)?;
                        self.output = OutputPhase::ExchangesDeclaring { declared };
                        Ok(vec![SessionEffect::Execute(command)])
                    } else {
                        debug!("All {} output exchanges confirmed", declared);
                        self.output = OutputPhase::Ready;
                        Ok(vec![SessionEffect::OutputReady])
                    }
                }
                _ => Err(self.unexpected("output exchange declaration")),
            },
        }
    }

    fn queue_declared(&mut self, queue: String) -> Result<Vec<SessionEffect>, SessionError> {
        match self.input {
            InputPhase::DeadQueueDeclaring => {
                self.expect_name(&queue, &self.topology.dead_queue.clone())?;

                let spec = self.input_spec()?;
                let command = TransportCommand::DeclareQueue {
                    queue: spec.queue.clone(),
                    durable: true,
                    exclusive: spec.exclusive,
                    dead_letter_exchange: Some(self.topology.dead_exchange.clone()),
                };

                self.input = InputPhase::QueueDeclaring;
                Ok(vec![SessionEffect::Execute(command)])
            }
            InputPhase::QueueDeclaring => {
                let spec = self.input_spec()?;
                self.expect_name(&queue, &spec.queue.clone())?;

                let mut effects: Vec<SessionEffect> = spec
                    .binding_keys
                    .iter()
                    .map(|key| {
                        SessionEffect::Execute(TransportCommand::BindQueue {
                            queue: spec.queue.clone(),
                            exchange: spec.exchange.clone(),
                            binding_key: key.clone(),
                        })
                    })
                    .collect();

                // The dead-letter binding is requested last and counts
                // towards the same acknowledgement gate as the primaries
                effects.push(SessionEffect::Execute(TransportCommand::BindQueue {
                    queue: self.topology.dead_queue.clone(),
                    exchange: self.topology.dead_exchange.clone(),
                    binding_key: DEAD_LETTER_BINDING_KEY.to_string(),
                }));

                self.input = InputPhase::Binding { bound: 0 };
                Ok(effects)
            }
            _ => Err(self.unexpected("queue declaration")),
        }
    }

    fn queue_bound(&mut self) -> Result<Vec<SessionEffect>, SessionError> {
        match self.input {
            InputPhase::Binding { bound } => {
                let bound = bound + 1;
                let expected = self.input_spec()?.binding_keys.len() + 1;

                if bound < expected {
                    self.input = InputPhase::Binding { bound };
                    Ok(Vec::new())
                } else {
                    debug!("All {} bindings acknowledged, configuring QoS", expected);

                    let command = TransportCommand::ConfigureQos {
                        prefetch_count: self.input_spec()?.prefetch_count,
                    };

                    self.input = InputPhase::QosConfiguring;
                    Ok(vec![SessionEffect::Execute(command)])
                }
            }
            _ => Err(self.unexpected("binding acknowledgement")),
        }
    }

    fn qos_configured(&mut self) -> Result<Vec<SessionEffect>, SessionError> {
        if self.input != InputPhase::QosConfiguring {
            return Err(self.unexpected("QoS confirmation"));
        }

        let command = TransportCommand::StartConsumer {
            queue: self.input_spec()?.queue.clone(),
            consumer_tag: self.consumer_tag.clone(),
        };

        self.input = InputPhase::ConsumerStarting;
        Ok(vec![SessionEffect::Execute(command)])
    }

    fn consumer_started(&mut self, consumer_tag: String) -> Result<Vec<SessionEffect>, SessionError> {
        if self.input != InputPhase::ConsumerStarting || consumer_tag != self.consumer_tag {
            return Err(self.unexpected("consumer confirmation"));
        }

        debug!("Consumer '{}' is running", consumer_tag);
        self.input = InputPhase::Consuming;
        Ok(vec![SessionEffect::InputReady])
    }

    fn consumer_cancelled(&mut self, consumer_tag: String) -> Result<Vec<SessionEffect>, SessionError> {
        match self.input {
            InputPhase::ConsumerStopping => {
                self.input = InputPhase::Stopped;
                Ok(self.close_channels())
            }
            InputPhase::Consuming => {
                warn!(
                    "Broker cancelled consumer '{}', shutting the session down",
                    consumer_tag
                );

                self.failure = Some(SessionError::ConsumerCancelled(consumer_tag));
                self.closing = true;
                self.input = InputPhase::Stopped;
                Ok(self.close_channels())
            }
            _ => Err(self.unexpected("consumer cancellation")),
        }
    }

    fn delivery(&mut self, message: InboundMessage) -> Result<Vec<SessionEffect>, SessionError> {
        if self.closing {
            trace!("Dropping in-flight delivery received during teardown");
            return Ok(Vec::new());
        }

        if self.input != InputPhase::Consuming {
            return Err(SessionError::UnexpectedDelivery);
        }

        Ok(vec![SessionEffect::Deliver(message)])
    }

    fn channel_closed(
        &mut self,
        channel: ChannelKind,
        code: u16,
        reason: String,
    ) -> Result<Vec<SessionEffect>, SessionError> {
        self.open_channels.remove(&channel);

        if !self.closing {
            return Err(SessionError::ChannelFailure {
                channel,
                code,
                reason,
            });
        }

        if code != REPLY_SUCCESS {
            warn!(
                "The {} channel reported code {} while closing: {}",
                channel, code, reason
            );
        }

        match channel {
            ChannelKind::Input => self.input = InputPhase::Stopped,
            ChannelKind::Output => self.output = OutputPhase::Stopped,
        }

        if self.connection == ConnectionPhase::ClosingChannels && self.open_channels.is_empty() {
            Ok(self.close_connection())
        } else {
            Ok(Vec::new())
        }
    }

    fn connection_closed(
        &mut self,
        code: u16,
        reason: String,
    ) -> Result<Vec<SessionEffect>, SessionError> {
        if self.connection != ConnectionPhase::ClosingConnection {
            return Err(SessionError::ConnectionFailure { code, reason });
        }

        debug!("Connection closed");
        self.connection = ConnectionPhase::Closed;
        Ok(vec![SessionEffect::Closed])
    }

    fn close_channels(&mut self) -> Vec<SessionEffect> {
        if self.open_channels.is_empty() {
            return self.close_connection();
        }

        self.connection = ConnectionPhase::ClosingChannels;

        // Input first so deliveries stop before the output side goes
        [ChannelKind::Input, ChannelKind::Output]
            .iter()
            .filter(|kind| self.open_channels.contains(kind))
            .map(|kind| SessionEffect::Execute(TransportCommand::CloseChannel(*kind)))
            .collect()
    }

    fn close_connection(&mut self) -> Vec<SessionEffect> {
        self.connection = ConnectionPhase::ClosingConnection;
        vec![SessionEffect::Execute(TransportCommand::CloseConnection)]
    }

    fn input_spec(&self) -> Result<&InputQueueSpec, SessionError> {
        self.topology
            .input
            .as_ref()
            .ok_or_else(|| SessionError::UnexpectedEvent("input event without an input queue".into()))
    }

    fn declare_output(&self, index: usize) -> Result<TransportCommand, SessionError> {
        let spec = self
            .topology
            .outputs
            .get(index)
            .ok_or_else(|| SessionError::UnexpectedEvent("output index out of range".into()))?;

        Ok(TransportCommand::DeclareExchange {
            channel: ChannelKind::Output,
            exchange: spec.exchange.clone(),
            kind: spec.kind,
            durable: true,
        })
    }

    fn expect_name(&self, actual: &str, expected: &str) -> Result<(), SessionError> {
        if actual == expected {
            Ok(())
        } else {
            Err(SessionError::UnexpectedEvent(format!(
                "confirmation for '{}' while waiting for '{}'",
                actual, expected
            )))
        }
    }

    fn unexpected(&self, what: &str) -> SessionError {
        SessionError::UnexpectedEvent(format!(
            "{} (connection {:?}, input {:?}, output {:?})",
            what, self.connection, self.input, self.output
        ))
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use crate::domain::topology::{OutputExchangeSpec, SuffixRules};
    use crate::library::communication::message::MessageProperties;
    use chrono::Utc;
    use pretty_assertions::assert_eq;

    const TAG: &str = "parser.main.test";

    fn consumer_topology() -> SessionTopology {
        SessionTopology::resolve(
            "parser",
            Some(InputQueueSpec::topic(
                "raw",
                "parser",
                vec!["stream.raw.*.*".into(), "file.raw.*.*".into()],
            )),
            vec![OutputExchangeSpec::topic("event")],
            &SuffixRules::default(),
        )
    }

    fn producer_topology(outputs: &[&str]) -> SessionTopology {
        SessionTopology::resolve(
            "collector",
            None,
            outputs.iter().map(|name| OutputExchangeSpec::topic(name)).collect(),
            &SuffixRules::default(),
        )
    }

    fn machine_for(topology: SessionTopology) -> SessionMachine {
        SessionMachine::new(topology, TAG.to_string())
    }

    fn execute(command: TransportCommand) -> SessionEffect {
        SessionEffect::Execute(command)
    }

    fn delivery(routing_key: &str) -> TransportEvent {
        TransportEvent::Delivery(InboundMessage {
            routing_key: routing_key.to_string(),
            body: b"payload".to_vec(),
            properties: MessageProperties::new("id".into(), "stream".into(), Utc::now()),
            delivery_tag: 1,
        })
    }

    fn open_input(machine: &mut SessionMachine) {
        machine.start().unwrap();
        machine.handle(TransportEvent::ConnectionOpened).unwrap();
        machine
            .handle(TransportEvent::ChannelOpened(ChannelKind::Input))
            .unwrap();
        machine
            .handle(TransportEvent::ExchangeDeclared {
                channel: ChannelKind::Input,
                exchange: "raw".into(),
            })
            .unwrap();
        machine
            .handle(TransportEvent::ExchangeDeclared {
                channel: ChannelKind::Input,
                exchange: "dead".into(),
            })
            .unwrap();
        machine
            .handle(TransportEvent::QueueDeclared {
                queue: "dead_queue".into(),
            })
            .unwrap();
        machine
            .handle(TransportEvent::QueueDeclared {
                queue: "parser".into(),
            })
            .unwrap();
    }

    fn bound(machine: &mut SessionMachine) -> Vec<SessionEffect> {
        machine
            .handle(TransportEvent::QueueBound {
                queue: "parser".into(),
                binding_key: "ignored".into(),
            })
            .unwrap()
    }

    fn start_consuming(machine: &mut SessionMachine) {
        open_input(machine);
        for _ in 0..3 {
            bound(machine);
        }
        machine.handle(TransportEvent::QosConfigured).unwrap();
        machine
            .handle(TransportEvent::ConsumerStarted {
                consumer_tag: TAG.into(),
            })
            .unwrap();
    }

    #[test]
    fn negotiate_the_input_topology_in_protocol_order() {
        let mut machine = machine_for(consumer_topology());

        assert_eq!(
            machine.start().unwrap(),
            vec![execute(TransportCommand::Connect)]
        );

        assert_eq!(
            machine.handle(TransportEvent::ConnectionOpened).unwrap(),
            vec![
                execute(TransportCommand::OpenChannel(ChannelKind::Input)),
                execute(TransportCommand::OpenChannel(ChannelKind::Output)),
            ]
        );

        assert_eq!(
            machine
                .handle(TransportEvent::ChannelOpened(ChannelKind::Input))
                .unwrap(),
            vec![execute(TransportCommand::DeclareExchange {
                channel: ChannelKind::Input,
                exchange: "raw".into(),
                kind: ExchangeKind::Topic,
                durable: true,
            })]
        );

        assert_eq!(
            machine
                .handle(TransportEvent::ExchangeDeclared {
                    channel: ChannelKind::Input,
                    exchange: "raw".into(),
                })
                .unwrap(),
            vec![execute(TransportCommand::DeclareExchange {
                channel: ChannelKind::Input,
                exchange: "dead".into(),
                kind: ExchangeKind::Topic,
                durable: true,
            })]
        );

        assert_eq!(
            machine
                .handle(TransportEvent::ExchangeDeclared {
                    channel: ChannelKind::Input,
                    exchange: "dead".into(),
                })
                .unwrap(),
            vec![execute(TransportCommand::DeclareQueue {
                queue: "dead_queue".into(),
                durable: true,
                exclusive: false,
                dead_letter_exchange: None,
            })]
        );

        assert_eq!(
            machine
                .handle(TransportEvent::QueueDeclared {
                    queue: "dead_queue".into(),
                })
                .unwrap(),
            vec![execute(TransportCommand::DeclareQueue {
                queue: "parser".into(),
                durable: true,
                exclusive: false,
                dead_letter_exchange: Some("dead".into()),
            })]
        );

        assert_eq!(
            machine
                .handle(TransportEvent::QueueDeclared {
                    queue: "parser".into(),
                })
                .unwrap(),
            vec![
                execute(TransportCommand::BindQueue {
                    queue: "parser".into(),
                    exchange: "raw".into(),
                    binding_key: "stream.raw.*.*".into(),
                }),
                execute(TransportCommand::BindQueue {
                    queue: "parser".into(),
                    exchange: "raw".into(),
                    binding_key: "file.raw.*.*".into(),
                }),
                execute(TransportCommand::BindQueue {
                    queue: "dead_queue".into(),
                    exchange: "dead".into(),
                    binding_key: "#".into(),
                }),
            ]
        );

        assert_eq!(bound(&mut machine), vec![]);
        assert_eq!(bound(&mut machine), vec![]);
        assert_eq!(
            bound(&mut machine),
            vec![execute(TransportCommand::ConfigureQos { prefetch_count: 20 })]
        );

        assert_eq!(
            machine.handle(TransportEvent::QosConfigured).unwrap(),
            vec![execute(TransportCommand::StartConsumer {
                queue: "parser".into(),
                consumer_tag: TAG.into(),
            })]
        );

        assert_eq!(
            machine
                .handle(TransportEvent::ConsumerStarted {
                    consumer_tag: TAG.into(),
                })
                .unwrap(),
            vec![SessionEffect::InputReady]
        );
    }

    #[test]
    fn declare_every_output_exchange_before_ready() {
        let mut machine = machine_for(producer_topology(&["raw", "event"]));

        machine.start().unwrap();
        assert_eq!(
            machine.handle(TransportEvent::ConnectionOpened).unwrap(),
            vec![execute(TransportCommand::OpenChannel(ChannelKind::Output))]
        );

        machine
            .handle(TransportEvent::ChannelOpened(ChannelKind::Output))
            .unwrap();

        let effects = machine
            .handle(TransportEvent::ExchangeDeclared {
                channel: ChannelKind::Output,
                exchange: "raw".into(),
            })
            .unwrap();
        assert!(!effects.contains(&SessionEffect::OutputReady));
        assert!(!machine.is_ready());

        let effects = machine
            .handle(TransportEvent::ExchangeDeclared {
                channel: ChannelKind::Output,
                exchange: "event".into(),
            })
            .unwrap();
        assert_eq!(effects, vec![SessionEffect::OutputReady]);
        assert!(machine.is_ready());
    }

    #[test]
    fn hold_qos_until_the_dead_letter_binding_is_acknowledged() {
        let mut machine = machine_for(consumer_topology());
        open_input(&mut machine);

        // Two primary bindings acknowledged, the wildcard one still pending
        assert_eq!(bound(&mut machine), vec![]);
        assert_eq!(bound(&mut machine), vec![]);

        let effects = bound(&mut machine);
        assert_eq!(
            effects,
            vec![execute(TransportCommand::ConfigureQos { prefetch_count: 20 })]
        );
    }

    #[test]
    fn interleave_input_and_output_setup() {
        let mut machine = machine_for(consumer_topology());

        machine.start().unwrap();
        machine.handle(TransportEvent::ConnectionOpened).unwrap();
        machine
            .handle(TransportEvent::ChannelOpened(ChannelKind::Output))
            .unwrap();
        machine
            .handle(TransportEvent::ChannelOpened(ChannelKind::Input))
            .unwrap();

        let effects = machine
            .handle(TransportEvent::ExchangeDeclared {
                channel: ChannelKind::Output,
                exchange: "event".into(),
            })
            .unwrap();
        assert_eq!(effects, vec![SessionEffect::OutputReady]);

        machine
            .handle(TransportEvent::ExchangeDeclared {
                channel: ChannelKind::Input,
                exchange: "raw".into(),
            })
            .unwrap();

        assert!(!machine.is_ready());
    }

    #[test]
    fn refuse_publishing_before_outputs_are_ready() {
        let machine = machine_for(producer_topology(&["raw"]));
        let message = OutboundMessage {
            exchange: "raw".into(),
            routing_key: "stream.raw.a.b".into(),
            body: vec![],
            properties: MessageProperties::new("id".into(), "stream".into(), Utc::now()),
        };

        assert!(matches!(
            machine.publish(message),
            Err(SessionError::OutputNotReady)
        ));
    }

    #[test]
    fn refuse_publishing_while_closing() {
        let mut machine = machine_for(producer_topology(&["raw"]));

        machine.start().unwrap();
        machine.handle(TransportEvent::ConnectionOpened).unwrap();
        machine
            .handle(TransportEvent::ChannelOpened(ChannelKind::Output))
            .unwrap();
        machine
            .handle(TransportEvent::ExchangeDeclared {
                channel: ChannelKind::Output,
                exchange: "raw".into(),
            })
            .unwrap();

        machine.close();

        let message = OutboundMessage {
            exchange: "raw".into(),
            routing_key: "stream.raw.a.b".into(),
            body: vec![],
            properties: MessageProperties::new("id".into(), "stream".into(), Utc::now()),
        };

        assert!(matches!(
            machine.publish(message),
            Err(SessionError::PublishWhileClosing)
        ));
    }

    #[test]
    fn fail_fast_on_unexpected_channel_closures() {
        let mut machine = machine_for(consumer_topology());
        start_consuming(&mut machine);

        let outcome = machine.handle(TransportEvent::ChannelClosed {
            channel: ChannelKind::Input,
            code: 406,
            reason: "PRECONDITION_FAILED".into(),
        });

        assert!(matches!(
            outcome,
            Err(SessionError::ChannelFailure { code: 406, .. })
        ));
    }

    #[test]
    fn fail_fast_on_unexpected_connection_closures() {
        let mut machine = machine_for(consumer_topology());
        start_consuming(&mut machine);

        let outcome = machine.handle(TransportEvent::ConnectionClosed {
            code: 320,
            reason: "CONNECTION_FORCED".into(),
        });

        assert!(matches!(
            outcome,
            Err(SessionError::ConnectionFailure { code: 320, .. })
        ));
    }

    #[test]
    fn close_down_in_reverse_order() {
        let mut machine = machine_for(consumer_topology());
        start_consuming(&mut machine);
        machine
            .handle(TransportEvent::ChannelOpened(ChannelKind::Output))
            .unwrap();

        assert_eq!(
            machine.close(),
            vec![execute(TransportCommand::CancelConsumer {
                consumer_tag: TAG.into(),
            })]
        );

        assert_eq!(
            machine
                .handle(TransportEvent::ConsumerCancelled {
                    consumer_tag: TAG.into(),
                })
                .unwrap(),
            vec![
                execute(TransportCommand::CloseChannel(ChannelKind::Input)),
                execute(TransportCommand::CloseChannel(ChannelKind::Output)),
            ]
        );

        assert_eq!(
            machine
                .handle(TransportEvent::ChannelClosed {
                    channel: ChannelKind::Input,
                    code: 200,
                    reason: "OK".into(),
                })
                .unwrap(),
            vec![]
        );

        assert_eq!(
            machine
                .handle(TransportEvent::ChannelClosed {
                    channel: ChannelKind::Output,
                    code: 200,
                    reason: "OK".into(),
                })
                .unwrap(),
            vec![execute(TransportCommand::CloseConnection)]
        );

        assert_eq!(
            machine
                .handle(TransportEvent::ConnectionClosed {
                    code: 200,
                    reason: "OK".into(),
                })
                .unwrap(),
            vec![SessionEffect::Closed]
        );

        assert!(machine.is_closed());
        assert!(machine.take_failure().is_none());
    }

    #[test]
    fn shut_down_when_the_broker_cancels_the_consumer() {
        let mut machine = machine_for(consumer_topology());
        start_consuming(&mut machine);

        let effects = machine
            .handle(TransportEvent::ConsumerCancelled {
                consumer_tag: TAG.into(),
            })
            .unwrap();
        assert_eq!(
            effects,
            vec![execute(TransportCommand::CloseChannel(ChannelKind::Input))]
        );

        machine
            .handle(TransportEvent::ChannelClosed {
                channel: ChannelKind::Input,
                code: 200,
                reason: "OK".into(),
            })
            .unwrap();
        machine
            .handle(TransportEvent::ConnectionClosed {
                code: 200,
                reason: "OK".into(),
            })
            .unwrap();

        assert!(machine.is_closed());
        assert!(matches!(
            machine.take_failure(),
            Some(SessionError::ConsumerCancelled(tag)) if tag == TAG
        ));
    }

    #[test]
    fn drop_deliveries_that_race_the_teardown() {
        let mut machine = machine_for(consumer_topology());
        start_consuming(&mut machine);

        machine.close();

        let effects = machine.handle(delivery("stream.raw.a.b")).unwrap();
        assert_eq!(effects, vec![]);
    }

    #[test]
    fn hand_deliveries_to_the_consumer() {
        let mut machine = machine_for(consumer_topology());
        start_consuming(&mut machine);

        let effects = machine.handle(delivery("stream.raw.a.b")).unwrap();
        assert!(matches!(effects.as_slice(), [SessionEffect::Deliver(_)]));
    }

    #[test]
    fn reject_empty_topologies() {
        let topology = SessionTopology::resolve("idle", None, vec![], &SuffixRules::default());
        let mut machine = machine_for(topology);

        assert!(matches!(machine.start(), Err(SessionError::EmptyTopology)));
    }
}
