//! Flow control pacing publishers against the broker
//!
//! Producers hand every outgoing message to a [`FlowController`] and call
//! [`checkpoint`](FlowController::checkpoint) between messages. The controller
//! keeps the outbound buffer below a threshold by draining it through the
//! transport, yields control often enough for heartbeats to go out and turns
//! external stop requests into [`FlowSignal`]s at the earliest safe point.

use super::session::BrokerSession;
use super::SessionError;
use crate::constants::{
    DEFAULT_OUTBOUND_THRESHOLD, PUBLISH_HEARTBEAT_FRACTION, PUBLISH_YIELD_CAP,
};
use crate::library::communication::message::OutboundMessage;
use crate::library::communication::transport::Transport;
use crate::library::BoxedError;
use async_trait::async_trait;
use log::{debug, warn};
use std::cmp::min;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::yield_now;
use tokio::time::sleep;

/// Externally requested way of winding a flow down
///
/// Ordered by severity so merged requests can keep the strongest one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum StopRequest {
    /// Keep going
    None,
    /// Finish the current message and drain the buffer before exiting
    Clean,
    /// Abandon the buffer and exit as soon as possible
    Interrupt,
}

impl Default for StopRequest {
    fn default() -> Self {
        Self::None
    }
}

/// Reason a producer bailed out of its publish loop
#[derive(Debug)]
pub enum FlowSignal {
    /// The producer itself failed
    Failed(BoxedError),
    /// A clean stop was requested
    Stop,
    /// An interrupt was requested
    Interrupt,
}

/// Way a flow ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowOutcome {
    /// The producer ran to completion and the buffer was drained
    Completed,
    /// A clean stop cut the producer short, the buffer was drained
    Stopped,
    /// An interrupt cut the producer short, buffered messages may be lost
    Interrupted,
}

/// Failure that ended a flow prematurely
#[derive(Debug, Error)]
pub enum FlowError {
    /// The producer failed while no stop was pending
    #[error("producer failed")]
    ProducerFailed(#[source] BoxedError),

    /// A clean exit left messages behind in the outbound buffer
    #[error("{remaining} outbound messages were never handed to the broker")]
    UndrainedBuffer {
        /// Number of messages still buffered
        remaining: usize,
    },

    /// The underlying session failed
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Tuning knobs for a [`FlowController`]
#[derive(Debug, Clone)]
pub struct FlowConfig {
    /// Outbound buffer length at which publishing pauses to drain
    pub buffer_threshold: usize,
    /// Fraction of the heartbeat interval after which control is yielded
    pub yield_fraction: f64,
    /// Upper bound on the yield interval regardless of the heartbeat
    pub yield_cap: Duration,
    /// How long a finished flow may spend draining its remaining buffer
    pub drain_timeout: Duration,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            buffer_threshold: DEFAULT_OUTBOUND_THRESHOLD,
            yield_fraction: PUBLISH_HEARTBEAT_FRACTION,
            yield_cap: PUBLISH_YIELD_CAP,
            drain_timeout: Duration::from_secs(30),
        }
    }
}

fn yield_interval(heartbeat: Duration, config: &FlowConfig) -> Duration {
    min(heartbeat.mul_f64(config.yield_fraction), config.yield_cap)
}

/// Pacing wrapper around a [`BrokerSession`] handed to a [`Producer`]
pub struct FlowController<'s, T: Transport> {
    session: &'s mut BrokerSession<T>,
    stop: watch::Receiver<StopRequest>,
    config: FlowConfig,
    yield_interval: Duration,
    last_yield: Instant,
}

impl<'s, T: Transport> FlowController<'s, T> {
    /// Publishes a message without waiting for it to reach the broker
    pub async fn publish(&mut self, message: OutboundMessage) -> Result<(), FlowSignal> {
        self.session
            .publish(message)
            .await
            .map_err(|error| FlowSignal::Failed(error.into()))
    }

    /// Gives the session a chance to breathe between messages
    ///
    /// Processes pending transport events, surfaces stop requests, drains the
    /// outbound buffer once it crosses the threshold and otherwise yields when
    /// the publish loop has been hogging the task for too long.
    pub async fn checkpoint(&mut self) -> Result<(), FlowSignal> {
        self.pump().await?;
        self.check_stop()?;

        if self.session.outbound_len() >= self.config.buffer_threshold {
            self.drain().await?;
        } else if self.last_yield.elapsed() > self.yield_interval {
            yield_now().await;
            self.last_yield = Instant::now();
        }

        Ok(())
    }

    /// Drains the outbound buffer completely
    pub async fn flush(&mut self) -> Result<(), FlowSignal> {
        self.pump().await?;
        self.check_stop()?;
        self.drain().await
    }

    async fn drain(&mut self) -> Result<(), FlowSignal> {
        while self.session.outbound_len() > 0 {
            self.check_stop()?;
            sleep(Duration::from_millis(1)).await;
            self.pump().await?;
        }

        yield_now().await;
        self.last_yield = Instant::now();
        Ok(())
    }

    async fn pump(&mut self) -> Result<(), FlowSignal> {
        self.session
            .pump()
            .await
            .map_err(|error| FlowSignal::Failed(error.into()))
    }

    fn check_stop(&self) -> Result<(), FlowSignal> {
        match *self.stop.borrow() {
            StopRequest::Interrupt => Err(FlowSignal::Interrupt),
            StopRequest::Clean => Err(FlowSignal::Stop),
            StopRequest::None => Ok(()),
        }
    }
}

/// Source of outbound messages driven by [`drive`]
#[async_trait]
pub trait Producer<T: Transport + Send>: Send {
    /// Publishes messages through the controller until done or signalled
    async fn produce(&mut self, flow: &mut FlowController<'_, T>) -> Result<(), FlowSignal>;
}

/// Runs a producer against a session and settles the outbound buffer
///
/// A stop request outranks a producer failure and an interrupt outranks a
/// clean stop. Exiting cleanly with messages still buffered after the drain
/// timeout is an error since those messages would be lost silently.
pub async fn drive<T, P>(
    session: &mut BrokerSession<T>,
    config: FlowConfig,
    stop: watch::Receiver<StopRequest>,
    producer: &mut P,
) -> Result<FlowOutcome, FlowError>
where
    T: Transport + Send,
    P: Producer<T>,
{
    let drain_timeout = config.drain_timeout;
    let yield_interval = yield_interval(session.heartbeat_interval(), &config);

    let result = {
        let mut flow = FlowController {
            session: &mut *session,
            stop: stop.clone(),
            config,
            yield_interval,
            last_yield: Instant::now(),
        };

        producer.produce(&mut flow).await
    };

    let deadline = Instant::now() + drain_timeout;
    while session.outbound_len() > 0 && Instant::now() < deadline {
        if *stop.borrow() == StopRequest::Interrupt {
            break;
        }

        sleep(Duration::from_millis(1)).await;
        session.pump().await?;
    }

    let outcome = match result {
        Ok(()) => FlowOutcome::Completed,
        Err(FlowSignal::Interrupt) => FlowOutcome::Interrupted,
        Err(FlowSignal::Stop) => {
            if *stop.borrow() == StopRequest::Interrupt {
                FlowOutcome::Interrupted
            } else {
                FlowOutcome::Stopped
            }
        }
        Err(FlowSignal::Failed(error)) => match *stop.borrow() {
            StopRequest::Interrupt => {
                warn!("Producer failed during an interrupt: {}", error);
                FlowOutcome::Interrupted
            }
            StopRequest::Clean => {
                warn!("Producer failed during a clean stop: {}", error);
                FlowOutcome::Stopped
            }
            StopRequest::None => return Err(FlowError::ProducerFailed(error)),
        },
    };

    let remaining = session.outbound_len();

    match outcome {
        FlowOutcome::Interrupted if remaining > 0 => {
            warn!("Interrupted with {} undelivered messages", remaining);
        }
        FlowOutcome::Completed | FlowOutcome::Stopped if remaining > 0 => {
            return Err(FlowError::UndrainedBuffer { remaining });
        }
        _ => debug!("Flow finished as {:?}", outcome),
    }

    Ok(outcome)
}

#[cfg(test)]
mod does {
    use super::*;
    use crate::domain::topology::{
        InputQueueSpec, OutputExchangeSpec, SessionTopology, SuffixRules,
    };
    use crate::library::communication::memory::{MemoryBroker, MemoryBrokerConfig};
    use crate::library::communication::message::MessageProperties;
    use crate::library::communication::mock::ScriptedTransport;
    use crate::library::communication::transport::{
        ChannelKind, ExchangeKind, TransportCommand, TransportEvent,
    };
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;

    fn message(index: usize) -> OutboundMessage {
        OutboundMessage {
            exchange: "event".into(),
            routing_key: "stream.raw.provider.channel".into(),
            body: index.to_string().into_bytes(),
            properties: MessageProperties::new(
                format!("message-{}", index),
                "stream".into(),
                Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap(),
            ),
        }
    }

    fn producer_topology() -> SessionTopology {
        SessionTopology::resolve(
            "collector",
            None,
            vec![OutputExchangeSpec::topic("event")],
            &SuffixRules::default(),
        )
    }

    fn scripted_producer_session(publishes: usize) -> BrokerSession<ScriptedTransport> {
        let mut transport = ScriptedTransport::default()
            .expect(
                TransportCommand::Connect,
                vec![TransportEvent::ConnectionOpened],
            )
            .expect(
                TransportCommand::OpenChannel(ChannelKind::Output),
                vec![TransportEvent::ChannelOpened(ChannelKind::Output)],
            )
            .expect(
                TransportCommand::DeclareExchange {
                    channel: ChannelKind::Output,
                    exchange: "event".into(),
                    kind: ExchangeKind::Topic,
                    durable: true,
                },
                vec![TransportEvent::ExchangeDeclared {
                    channel: ChannelKind::Output,
                    exchange: "event".into(),
                }],
            );

        for index in 0..publishes {
            transport = transport.expect(TransportCommand::Publish(message(index)), vec![]);
        }

        BrokerSession::new(transport, producer_topology(), "main")
    }

    struct Firehose {
        total: usize,
    }

    #[async_trait]
    impl<T: Transport + Send> Producer<T> for Firehose {
        async fn produce(&mut self, flow: &mut FlowController<'_, T>) -> Result<(), FlowSignal> {
            for index in 0..self.total {
                flow.publish(message(index)).await?;
                flow.checkpoint().await?;
            }

            flow.flush().await
        }
    }

    struct Failing;

    #[async_trait]
    impl<T: Transport + Send> Producer<T> for Failing {
        async fn produce(&mut self, _flow: &mut FlowController<'_, T>) -> Result<(), FlowSignal> {
            Err(FlowSignal::Failed("source went away".into()))
        }
    }

    #[test]
    fn cap_the_yield_interval() {
        let config = FlowConfig::default();

        assert_eq!(
            yield_interval(Duration::from_secs(10), &config),
            Duration::from_secs(2)
        );
        assert_eq!(
            yield_interval(Duration::from_secs(120), &config),
            config.yield_cap
        );
    }

    #[tokio::test]
    async fn deliver_a_full_run_through_the_broker() {
        let broker = MemoryBroker::start(MemoryBrokerConfig::default());
        let topology = SessionTopology::resolve(
            "collector",
            Some(InputQueueSpec::topic("event", "sink", vec!["#".into()])),
            vec![OutputExchangeSpec::topic("event")],
            &SuffixRules::default(),
        );

        let mut session = BrokerSession::new(broker.link(), topology, "main");
        session.setup(Duration::from_secs(1)).await.unwrap();

        let (_request, stop) = watch::channel(StopRequest::None);
        let config = FlowConfig {
            buffer_threshold: 16,
            ..FlowConfig::default()
        };
        let mut producer = Firehose { total: 250 };

        let outcome = drive(&mut session, config, stop, &mut producer)
            .await
            .unwrap();

        assert_eq!(outcome, FlowOutcome::Completed);
        assert_eq!(broker.depth("sink").await, 250);
    }

    #[tokio::test]
    async fn abandon_the_buffer_on_interrupts() {
        let mut session = scripted_producer_session(3);
        session.setup(Duration::from_secs(1)).await.unwrap();

        let (request, stop) = watch::channel(StopRequest::None);
        let config = FlowConfig {
            buffer_threshold: 3,
            ..FlowConfig::default()
        };
        let mut producer = Firehose { total: 100 };

        tokio::spawn(async move {
            sleep(Duration::from_millis(5)).await;
            request.send(StopRequest::Interrupt).ok();
        });

        let outcome = drive(&mut session, config, stop, &mut producer)
            .await
            .unwrap();

        assert_eq!(outcome, FlowOutcome::Interrupted);
    }

    #[tokio::test]
    async fn surface_undrained_buffers_after_clean_stops() {
        let mut session = scripted_producer_session(2);
        session.setup(Duration::from_secs(1)).await.unwrap();

        let (request, stop) = watch::channel(StopRequest::None);
        request.send(StopRequest::Clean).ok();

        let config = FlowConfig {
            drain_timeout: Duration::from_millis(20),
            ..FlowConfig::default()
        };

        struct PairThenCheckpoint;

        #[async_trait]
        impl<T: Transport + Send> Producer<T> for PairThenCheckpoint {
            async fn produce(
                &mut self,
                flow: &mut FlowController<'_, T>,
            ) -> Result<(), FlowSignal> {
                flow.publish(message(0)).await?;
                flow.publish(message(1)).await?;
                flow.checkpoint().await
            }
        }

        let outcome = drive(&mut session, config, stop, &mut PairThenCheckpoint).await;

        assert!(matches!(
            outcome,
            Err(FlowError::UndrainedBuffer { remaining: 2 })
        ));
    }

    #[tokio::test]
    async fn wrap_producer_errors() {
        let mut session = scripted_producer_session(0);
        session.setup(Duration::from_secs(1)).await.unwrap();

        let (_request, stop) = watch::channel(StopRequest::None);

        let outcome = drive(&mut session, FlowConfig::default(), stop, &mut Failing).await;

        assert!(matches!(outcome, Err(FlowError::ProducerFailed(_))));
    }

    #[tokio::test]
    async fn let_stop_requests_outrank_producer_errors() {
        let mut session = scripted_producer_session(0);
        session.setup(Duration::from_secs(1)).await.unwrap();

        let (request, stop) = watch::channel(StopRequest::None);
        request.send(StopRequest::Clean).ok();

        let outcome = drive(&mut session, FlowConfig::default(), stop, &mut Failing)
            .await
            .unwrap();

        assert_eq!(outcome, FlowOutcome::Stopped);
    }

    #[tokio::test]
    async fn escalate_clean_stops_under_interrupts() {
        let mut session = scripted_producer_session(0);
        session.setup(Duration::from_secs(1)).await.unwrap();

        let (request, stop) = watch::channel(StopRequest::None);
        request.send(StopRequest::Interrupt).ok();

        struct Stopping;

        #[async_trait]
        impl<T: Transport + Send> Producer<T> for Stopping {
            async fn produce(
                &mut self,
                _flow: &mut FlowController<'_, T>,
            ) -> Result<(), FlowSignal> {
                Err(FlowSignal::Stop)
            }
        }

        let outcome = drive(&mut session, FlowConfig::default(), stop, &mut Stopping)
            .await
            .unwrap();

        assert_eq!(outcome, FlowOutcome::Interrupted);
    }
}
