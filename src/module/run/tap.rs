//! Consuming side of the in-process pipeline

use crate::domain::pipeline::PipelineConfig;
use crate::domain::topology::{InputQueueSpec, SessionTopology, SuffixRules};
use crate::harness::{ConsumeError, MessageHandler};
use crate::library::communication::message::InboundMessage;
use async_trait::async_trait;
use log::info;

/// Handler that prints every delivery it receives
#[derive(Debug, Default)]
pub struct TapHandler {
    delivered: usize,
}

impl TapHandler {
    /// Number of messages handled so far
    pub fn delivered(&self) -> usize {
        self.delivered
    }
}

#[async_trait]
impl MessageHandler for TapHandler {
    async fn handle(&mut self, message: &InboundMessage) -> Result<(), ConsumeError> {
        self.delivered += 1;

        info!(
            "[{}] {} {}",
            message.routing_key,
            message.properties.message_id,
            String::from_utf8_lossy(&message.body)
        );

        Ok(())
    }
}

/// Resolves the topology under which the tap consumes collected messages
pub fn tap_topology(
    component: &str,
    exchange: &str,
    pipeline: &PipelineConfig,
    suffixes: &SuffixRules,
    prefetch_count: u16,
) -> SessionTopology {
    let binding_keys = pipeline.resolve_binding_keys(component, "taps", &[], &[], false);

    let mut input = InputQueueSpec::topic(exchange, component, binding_keys);
    input.prefetch_count = prefetch_count;

    SessionTopology::resolve(component, Some(input), vec![], suffixes)
}
