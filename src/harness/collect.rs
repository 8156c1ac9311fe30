//! Two-phase collection template: obtain an input pile, publish records
//!
//! A [`Collector`] describes where raw data comes from and how each record
//! maps onto an outbound message. The [`CollectorRuntime`] owns the run:
//! fetch the pile, turn it into records, publish them under flow control and
//! fire the completion hook exactly when a run went through cleanly.

use super::flow::{drive, FlowConfig, FlowController, FlowError, FlowOutcome, FlowSignal, Producer};
use super::session::BrokerSession;
use super::StopRequest;
use crate::constants::RAW_STATE;
use crate::domain::message::{stable_message_id, RawKind, SourceLabel};
use crate::library::communication::message::{MessageProperties, OutboundMessage};
use crate::library::communication::transport::Transport;
use crate::library::{BoxedError, EmptyResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{info, warn};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::watch;

/// Longest routing key the wire format permits
const MAX_ROUTING_KEY_LENGTH: usize = 255;

/// One raw record extracted from an input pile
#[derive(Debug, Clone)]
pub struct InputRecord {
    /// Record payload exactly as the source provided it
    pub raw: Vec<u8>,
    /// Creation time attributed to the record
    pub created: DateTime<Utc>,
    /// Free-form metadata forwarded in the message headers
    pub meta: Map<String, Value>,
}

/// Source-specific half of a collection run
///
/// Only [`obtain_input_pile`](Collector::obtain_input_pile) and
/// [`generate_input_records`](Collector::generate_input_records) have no
/// defaults. Everything else falls back to the conventional raw-message
/// layout and most collectors never override it.
#[async_trait]
pub trait Collector: Send {
    /// Raw result of one fetch from the source
    type Pile: Send;

    /// Label under which the collected data enters the pipeline
    fn source(&self) -> &SourceLabel;

    /// Category of the raw data
    fn kind(&self) -> RawKind {
        RawKind::default()
    }

    /// Fetches the input pile, `None` meaning there is nothing to collect
    async fn obtain_input_pile(&mut self) -> Result<Option<Self::Pile>, BoxedError>;

    /// Splits the pile into individual records
    fn generate_input_records(&mut self, pile: Self::Pile) -> Result<Vec<InputRecord>, BoxedError>;

    /// Adjusts a record before it is turned into a message
    fn process_input_record(&self, record: InputRecord) -> Result<InputRecord, BoxedError> {
        Ok(record)
    }

    /// Routing key for one record
    fn output_routing_key(&self, _record: &InputRecord) -> String {
        format!("{}.{}.{}", self.kind(), RAW_STATE, self.source())
    }

    /// Message body for one record
    fn output_body(&self, record: &InputRecord) -> Result<Vec<u8>, BoxedError> {
        Ok(record.raw.clone())
    }

    /// Message properties for one record
    fn output_properties(&self, record: &InputRecord, body: &[u8]) -> MessageProperties {
        let mut properties = MessageProperties::new(
            stable_message_id(self.source(), &record.created, body),
            self.kind().to_string(),
            record.created,
        );

        properties.meta = record.meta.clone();
        properties
    }

    /// Invoked once after a run published everything it had
    ///
    /// Not invoked when there was no input pile or the run was cut short,
    /// which makes it the place to persist collection state.
    async fn after_completed_publishing(&mut self) -> EmptyResult {
        Ok(())
    }
}

#[derive(Debug, Error)]
enum InvalidOutput {
    #[error("routing key '{0}' is malformed")]
    RoutingKey(String),
    #[error("output body is empty")]
    EmptyBody,
    #[error("message properties are missing an id or type")]
    Properties,
}

fn validate_routing_key(routing_key: &str) -> Result<(), InvalidOutput> {
    let well_formed = !routing_key.is_empty()
        && routing_key.len() <= MAX_ROUTING_KEY_LENGTH
        && routing_key.split('.').all(|segment| !segment.is_empty());

    if well_formed {
        Ok(())
    } else {
        Err(InvalidOutput::RoutingKey(routing_key.to_string()))
    }
}

fn validate_body(body: &[u8]) -> Result<(), InvalidOutput> {
    if body.is_empty() {
        Err(InvalidOutput::EmptyBody)
    } else {
        Ok(())
    }
}

fn validate_properties(properties: &MessageProperties) -> Result<(), InvalidOutput> {
    if properties.message_id.is_empty() || properties.kind.is_empty() {
        Err(InvalidOutput::Properties)
    } else {
        Ok(())
    }
}

/// Builds the outbound message for one record, validating every stage
pub fn build_output<C: Collector>(
    collector: &C,
    record: InputRecord,
    exchange: &str,
) -> Result<OutboundMessage, BoxedError> {
    let record = collector.process_input_record(record)?;

    let routing_key = collector.output_routing_key(&record);
    validate_routing_key(&routing_key)?;

    let body = collector.output_body(&record)?;
    validate_body(&body)?;

    let properties = collector.output_properties(&record, &body);
    validate_properties(&properties)?;

    Ok(OutboundMessage {
        exchange: exchange.to_string(),
        routing_key,
        body,
        properties,
    })
}

struct IterativePublisher<'c, C: Collector> {
    collector: &'c C,
    records: std::vec::IntoIter<InputRecord>,
    exchange: String,
    published: usize,
}

#[async_trait]
impl<'c, C, T> Producer<T> for IterativePublisher<'c, C>
where
    C: Collector + Sync,
    T: Transport + Send,
{
    async fn produce(&mut self, flow: &mut FlowController<'_, T>) -> Result<(), FlowSignal> {
        for record in self.records.by_ref() {
            match build_output(self.collector, record, &self.exchange) {
                Ok(message) => {
                    flow.publish(message).await?;
                    self.published += 1;
                }
                Err(error) => warn!("Skipping record: {}", error),
            }

            flow.checkpoint().await?;
        }

        flow.flush().await?;

        if self.published == 0 {
            warn!("Collection run produced no output messages");
        }

        Ok(())
    }
}

/// Way a collection run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionOutcome {
    /// Everything was published and the completion hook ran
    Completed {
        /// Number of messages handed to the broker
        published: usize,
    },
    /// The source had nothing to offer
    NothingToDo,
    /// A clean stop cut the run short
    Stopped,
    /// An interrupt cut the run short
    Interrupted,
}

/// Failure that ended a collection run
#[derive(Debug, Error)]
pub enum CollectionError {
    /// The source could not be fetched
    #[error("failed to obtain the input pile")]
    Obtain(#[source] BoxedError),

    /// The fetched pile could not be split into records
    #[error("failed to generate input records")]
    Generate(#[source] BoxedError),

    /// Publishing the records failed
    #[error(transparent)]
    Publishing(#[from] FlowError),

    /// The completion hook failed after an otherwise clean run
    #[error("the after-publishing hook failed")]
    Finalize(#[source] BoxedError),
}

/// Drives one collector through its collection runs
pub struct CollectorRuntime<C: Collector> {
    collector: C,
    exchange: String,
    flow_config: FlowConfig,
}

impl<C: Collector + Sync> CollectorRuntime<C> {
    /// Creates a runtime publishing to the given exchange
    pub fn new<S: Into<String>>(collector: C, exchange: S) -> Self {
        Self {
            collector,
            exchange: exchange.into(),
            flow_config: FlowConfig::default(),
        }
    }

    /// Overrides the flow control configuration
    pub fn with_flow_config(mut self, flow_config: FlowConfig) -> Self {
        self.flow_config = flow_config;
        self
    }

    /// Grants access to the wrapped collector
    pub fn collector(&self) -> &C {
        &self.collector
    }

    /// Runs one full collection cycle
    pub async fn run_collection<T: Transport + Send>(
        &mut self,
        session: &mut BrokerSession<T>,
        stop: watch::Receiver<StopRequest>,
    ) -> Result<CollectionOutcome, CollectionError> {
        let pile = self
            .collector
            .obtain_input_pile()
            .await
            .map_err(CollectionError::Obtain)?;

        let pile = match pile {
            Some(pile) => pile,
            None => {
                info!("'{}' found nothing to collect", self.collector.source());
                return Ok(CollectionOutcome::NothingToDo);
            }
        };

        let records = self
            .collector
            .generate_input_records(pile)
            .map_err(CollectionError::Generate)?;

        let mut publisher = IterativePublisher {
            collector: &self.collector,
            records: records.into_iter(),
            exchange: self.exchange.clone(),
            published: 0,
        };

        let outcome = drive(session, self.flow_config.clone(), stop, &mut publisher).await?;
        let published = publisher.published;

        match outcome {
            FlowOutcome::Completed => {
                self.collector
                    .after_completed_publishing()
                    .await
                    .map_err(CollectionError::Finalize)?;

                Ok(CollectionOutcome::Completed { published })
            }
            FlowOutcome::Stopped => Ok(CollectionOutcome::Stopped),
            FlowOutcome::Interrupted => Ok(CollectionOutcome::Interrupted),
        }
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use crate::domain::topology::{
        InputQueueSpec, OutputExchangeSpec, SessionTopology, SuffixRules,
    };
    use crate::library::communication::memory::{MemoryBroker, MemoryBrokerConfig};
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    struct FeedStub {
        rows: Option<Vec<&'static str>>,
        hook_invoked: bool,
        source: SourceLabel,
    }

    impl FeedStub {
        fn with_rows(rows: Vec<&'static str>) -> Self {
            Self {
                rows: Some(rows),
                hook_invoked: false,
                source: "provider.channel".parse().unwrap(),
            }
        }

        fn empty() -> Self {
            Self {
                rows: None,
                hook_invoked: false,
                source: "provider.channel".parse().unwrap(),
            }
        }
    }

    #[async_trait]
    impl Collector for FeedStub {
        type Pile = Vec<&'static str>;

        fn source(&self) -> &SourceLabel {
            &self.source
        }

        async fn obtain_input_pile(&mut self) -> Result<Option<Self::Pile>, BoxedError> {
            Ok(self.rows.take())
        }

        fn generate_input_records(
            &mut self,
            pile: Self::Pile,
        ) -> Result<Vec<InputRecord>, BoxedError> {
            Ok(pile
                .into_iter()
                .map(|row| InputRecord {
                    raw: row.as_bytes().to_vec(),
                    created: Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap(),
                    meta: Map::new(),
                })
                .collect())
        }

        async fn after_completed_publishing(&mut self) -> EmptyResult {
            self.hook_invoked = true;
            Ok(())
        }
    }

    fn sink_topology() -> SessionTopology {
        SessionTopology::resolve(
            "collector",
            Some(InputQueueSpec::topic("raw", "sink", vec!["#".into()])),
            vec![OutputExchangeSpec::topic("raw")],
            &SuffixRules::default(),
        )
    }

    async fn sink_session(broker: &MemoryBroker) -> BrokerSession<impl Transport> {
        let mut session = BrokerSession::new(broker.link(), sink_topology(), "main");
        session.setup(Duration::from_secs(1)).await.unwrap();
        session
    }

    #[test]
    fn derive_the_conventional_raw_message() {
        let collector = FeedStub::with_rows(vec![]);
        let created = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let record = InputRecord {
            raw: b"1,2020-01-01".to_vec(),
            created,
            meta: Map::new(),
        };

        let message = build_output(&collector, record, "raw").unwrap();

        assert_eq!(message.exchange, "raw");
        assert_eq!(message.routing_key, "stream.raw.provider.channel");
        assert_eq!(message.body, b"1,2020-01-01".to_vec());
        assert_eq!(message.properties.kind, "stream");
        assert_eq!(message.properties.timestamp, created);
        assert_eq!(
            message.properties.message_id,
            stable_message_id(collector.source(), &created, b"1,2020-01-01")
        );
        assert!(message.properties.persistent);
    }

    #[tokio::test]
    async fn publish_every_record_and_fire_the_hook() {
        let broker = MemoryBroker::start(MemoryBrokerConfig::default());
        let mut session = sink_session(&broker).await;
        let (_request, stop) = watch::channel(StopRequest::None);

        let mut runtime = CollectorRuntime::new(
            FeedStub::with_rows(vec!["row-1", "row-2", "row-3"]),
            "raw",
        );

        let outcome = runtime.run_collection(&mut session, stop).await.unwrap();

        assert_eq!(outcome, CollectionOutcome::Completed { published: 3 });
        assert!(runtime.collector().hook_invoked);
        assert_eq!(broker.depth("sink").await, 3);
    }

    #[tokio::test]
    async fn skip_records_that_fail_validation() {
        let broker = MemoryBroker::start(MemoryBrokerConfig::default());
        let mut session = sink_session(&broker).await;
        let (_request, stop) = watch::channel(StopRequest::None);

        let mut runtime =
            CollectorRuntime::new(FeedStub::with_rows(vec!["row-1", "", "row-2"]), "raw");

        let outcome = runtime.run_collection(&mut session, stop).await.unwrap();

        assert_eq!(outcome, CollectionOutcome::Completed { published: 2 });
        assert_eq!(broker.depth("sink").await, 2);
    }

    #[tokio::test]
    async fn treat_a_missing_pile_as_nothing_to_do() {
        let broker = MemoryBroker::start(MemoryBrokerConfig::default());
        let mut session = sink_session(&broker).await;
        let (_request, stop) = watch::channel(StopRequest::None);

        let mut runtime = CollectorRuntime::new(FeedStub::empty(), "raw");

        let outcome = runtime.run_collection(&mut session, stop).await.unwrap();

        assert_eq!(outcome, CollectionOutcome::NothingToDo);
        assert!(!runtime.collector().hook_invoked);
    }

    #[tokio::test]
    async fn skip_the_hook_when_interrupted() {
        let broker = MemoryBroker::start(MemoryBrokerConfig::default());
        let mut session = sink_session(&broker).await;

        let (request, stop) = watch::channel(StopRequest::None);
        request.send(StopRequest::Interrupt).ok();

        let mut runtime = CollectorRuntime::new(FeedStub::with_rows(vec!["row-1"]), "raw");

        let outcome = runtime.run_collection(&mut session, stop).await.unwrap();

        assert_eq!(outcome, CollectionOutcome::Interrupted);
        assert!(!runtime.collector().hook_invoked);
    }

    #[tokio::test]
    async fn complete_empty_runs_with_a_warning_only() {
        let broker = MemoryBroker::start(MemoryBrokerConfig::default());
        let mut session = sink_session(&broker).await;
        let (_request, stop) = watch::channel(StopRequest::None);

        let mut runtime = CollectorRuntime::new(FeedStub::with_rows(vec![]), "raw");

        let outcome = runtime.run_collection(&mut session, stop).await.unwrap();

        assert_eq!(outcome, CollectionOutcome::Completed { published: 0 });
        assert!(runtime.collector().hook_invoked);
    }
}
