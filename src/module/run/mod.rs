//! Single-process pipeline wiring a feed collector to a consuming tap

mod options;
mod tap;

pub use options::Options;
pub use tap::{tap_topology, TapHandler};

use crate::constants::RAW_STATE;
use crate::domain::topology::{OutputExchangeSpec, SessionTopology};
use crate::harness::{
    BrokerSession, CollectionOutcome, CollectorRuntime, DeathReason, Dispatcher, FlowConfig, Heart,
    Module, StopRequest,
};
use crate::library::communication::memory::MemoryBroker;
use crate::library::BoxedError;
use crate::module::feed::{FeedClient, FeedCollector, FeedSource};
use async_trait::async_trait;
use futures::{pin_mut, select, FutureExt};
use log::{info, warn};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::sleep;

/// Name under which the collecting side appears on the broker
const COLLECTOR_COMPONENT: &str = "collector";

/// Pause between checks of the remaining tap queue depth
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Module implementation of the single-process pipeline
///
/// One collection run is published through the in-process broker and consumed
/// by a tap whose queue is bound according to the pipeline configuration. The
/// module exits once the tap has drained everything the collector published.
/// A termination signal during the run requests a clean stop on both sides.
pub struct Pipeline<S: FeedSource> {
    options: Options,
    feed: Option<S>,
}

impl Pipeline<FeedClient> {
    /// Creates the pipeline with an HTTP backed feed source
    pub fn new(options: Options) -> Result<Self, BoxedError> {
        let feed = FeedClient::new(
            &options.feed.feed_url,
            options.feed.download_timeout,
            options.feed.download_retries,
        )?;

        Ok(Self {
            options,
            feed: Some(feed),
        })
    }
}

impl<S: FeedSource> Pipeline<S> {
    /// Creates the pipeline around a custom feed source
    pub fn with_source(options: Options, feed: S) -> Self {
        Self {
            options,
            feed: Some(feed),
        }
    }

    async fn execute(
        &mut self,
        stop_request: &watch::Sender<StopRequest>,
        stop: watch::Receiver<StopRequest>,
    ) -> Result<(), BoxedError> {
        let feed = match self.feed.take() {
            Some(feed) => feed,
            None => return Err("the pipeline module can only be run once".into()),
        };

        let options = &self.options;
        let suffixes = options.queueing.suffix_rules();
        let broker = MemoryBroker::start(options.queueing.broker_config());

        let mut pipeline_config = options.pipeline.load()?;
        if pipeline_config.is_empty() {
            pipeline_config.insert(&options.tap_component, RAW_STATE);
        }

        let tap_topology = tap::tap_topology(
            &options.tap_component,
            &options.raw_exchange,
            &pipeline_config,
            &suffixes,
            options.queueing.prefetch_count,
        );
        let tap_queue = tap_topology
            .input
            .as_ref()
            .map(|input| input.queue.clone())
            .unwrap_or_default();

        let mut tap_session =
            BrokerSession::new(broker.link(), tap_topology, &options.queueing.instance);
        tap_session.setup(options.queueing.setup_timeout).await?;

        let collector = FeedCollector::open(&options.feed, feed)?;
        let collector_topology = SessionTopology::resolve(
            COLLECTOR_COMPONENT,
            None,
            vec![OutputExchangeSpec::topic(&options.raw_exchange)],
            &suffixes,
        );
        let raw_exchange = collector_topology.outputs[0].exchange.clone();

        let mut collector_session =
            BrokerSession::new(broker.link(), collector_topology, &options.queueing.instance);
        collector_session.setup(options.queueing.setup_timeout).await?;

        let mut tap_stop = stop.clone();
        let tap = tokio::spawn(async move {
            let mut dispatcher = Dispatcher::new(TapHandler::default());
            let outcome = dispatcher.run(&mut tap_session, &mut tap_stop).await;

            (dispatcher.into_inner(), tap_session, outcome)
        });

        let flow_config = FlowConfig {
            buffer_threshold: options.queueing.publish_buffer_threshold,
            ..FlowConfig::default()
        };
        let mut runtime =
            CollectorRuntime::new(collector, raw_exchange).with_flow_config(flow_config);

        let collection = runtime
            .run_collection(&mut collector_session, stop.clone())
            .await;

        match &collection {
            Ok(CollectionOutcome::Completed { published }) => {
                info!("Collector published {} messages", published);
                await_drain(&broker, &tap_queue, options.queueing.shutdown_timeout).await;
                stop_request.send(StopRequest::Clean).ok();
            }
            Ok(CollectionOutcome::NothingToDo) => {
                info!("Nothing to collect, stopping the tap");
                stop_request.send(StopRequest::Clean).ok();
            }
            // The stop request that cut the run short already reaches the tap
            Ok(CollectionOutcome::Stopped) | Ok(CollectionOutcome::Interrupted) => {}
            Err(error) => {
                warn!("Collection failed ({}), stopping the tap", error);
                stop_request.send(StopRequest::Interrupt).ok();
            }
        }

        let (handler, mut tap_session, tap_outcome) = tap.await?;

        collection?;
        tap_outcome?;

        tap_session
            .shutdown(options.queueing.shutdown_timeout)
            .await?;
        collector_session
            .shutdown(options.queueing.shutdown_timeout)
            .await?;

        info!(
            "Pipeline delivered {} messages to '{}'",
            handler.delivered(),
            tap_queue
        );

        Ok(())
    }
}

#[async_trait]
impl<S: FeedSource> Module for Pipeline<S> {
    async fn run(&mut self) -> Result<Option<Heart>, BoxedError> {
        let (stop_request, stop) = watch::channel(StopRequest::None);
        let (mut heart, _stone) = Heart::new();

        let pipeline = self.execute(&stop_request, stop).fuse();
        let death = heart.death().fuse();
        pin_mut!(pipeline, death);

        let result = loop {
            select! {
                result = pipeline => break result,
                reason = death => {
                    let request = match &reason {
                        DeathReason::Terminated => StopRequest::Clean,
                        DeathReason::Killed(_) => StopRequest::Interrupt,
                    };

                    info!("{}, winding the pipeline down", reason);
                    stop_request.send(request).ok();
                }
            }
        };

        result.map(|_| None)
    }
}

/// Waits until the queue is empty or the limit passes
async fn await_drain(broker: &MemoryBroker, queue: &str, limit: Duration) {
    let deadline = Instant::now() + limit;

    while broker.depth(queue).await > 0 {
        if Instant::now() >= deadline {
            warn!("Giving up on draining '{}' after {:?}", queue, limit);
            break;
        }

        sleep(DRAIN_POLL_INTERVAL).await;
    }
}
