//! Names and shapes of the broker topology a component declares

use crate::constants::{DEAD_LETTER_EXCHANGE, DEAD_LETTER_QUEUE, RECOVERY_SUFFIX};
use crate::library::communication::transport::ExchangeKind;
use uuid::Uuid;

/// Optional suffixes applied to every name while resolving a topology
///
/// The recovery suffix always ends up rightmost, after any input or output
/// suffix, so that a recovery broker mirrors the regular topology one-to-one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SuffixRules {
    /// Suffix appended to the input exchange and input queue names
    pub input: Option<String>,
    /// Suffix appended to every output exchange name
    pub output: Option<String>,
    /// Whether all declared names carry the recovery suffix
    pub recovery: bool,
}

impl SuffixRules {
    fn input_name(&self, base: &str) -> String {
        let mut name = base.to_string();

        if let Some(suffix) = &self.input {
            name.push_str(suffix);
        }

        self.finish(name)
    }

    fn output_name(&self, base: &str) -> String {
        let mut name = base.to_string();

        if let Some(suffix) = &self.output {
            name.push_str(suffix);
        }

        self.finish(name)
    }

    fn shared_name(&self, base: &str) -> String {
        self.finish(base.to_string())
    }

    fn finish(&self, mut name: String) -> String {
        if self.recovery {
            name.push_str(RECOVERY_SUFFIX);
        }

        name
    }
}

/// Consumption side of a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputQueueSpec {
    /// Exchange from which the consumed queue receives messages
    pub exchange: String,
    /// Routing behaviour of the input exchange
    pub exchange_kind: ExchangeKind,
    /// Queue the component consumes from
    pub queue: String,
    /// Keys binding the queue to its exchange
    pub binding_keys: Vec<String>,
    /// Whether the queue may only ever have this one consumer
    pub exclusive: bool,
    /// Number of unacknowledged deliveries the consumer holds at once
    pub prefetch_count: u16,
}

impl InputQueueSpec {
    /// Topic based consumption with a non-exclusive queue
    pub fn topic(exchange: &str, queue: &str, binding_keys: Vec<String>) -> Self {
        Self {
            exchange: exchange.to_string(),
            exchange_kind: ExchangeKind::Topic,
            queue: queue.to_string(),
            binding_keys,
            exclusive: false,
            prefetch_count: crate::constants::DEFAULT_PREFETCH_COUNT,
        }
    }
}

/// One exchange the component publishes to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputExchangeSpec {
    /// Name of the declared exchange
    pub exchange: String,
    /// Routing behaviour of the exchange
    pub kind: ExchangeKind,
}

impl OutputExchangeSpec {
    /// Topic exchange with the given name
    pub fn topic(exchange: &str) -> Self {
        Self {
            exchange: exchange.to_string(),
            kind: ExchangeKind::Topic,
        }
    }
}

/// Fully resolved set of names a session declares on its broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTopology {
    /// Name of the component owning the session
    pub component: String,
    /// Input consumption, absent for components that only publish
    pub input: Option<InputQueueSpec>,
    /// Exchanges the component publishes to
    pub outputs: Vec<OutputExchangeSpec>,
    /// Exchange receiving rejected messages
    pub dead_exchange: String,
    /// Queue retaining rejected messages for later inspection
    pub dead_queue: String,
}

impl SessionTopology {
    /// Applies the given suffix rules to all names and assembles the topology
    ///
    /// Input suffixes land on the input exchange and queue, output suffixes
    /// on every output exchange. The dead-letter names only ever receive the
    /// recovery suffix.
    pub fn resolve(
        component: &str,
        input: Option<InputQueueSpec>,
        outputs: Vec<OutputExchangeSpec>,
        suffixes: &SuffixRules,
    ) -> Self {
        let input = input.map(|spec| InputQueueSpec {
            exchange: suffixes.input_name(&spec.exchange),
            queue: suffixes.input_name(&spec.queue),
            ..spec
        });

        let outputs = outputs
            .into_iter()
            .map(|spec| OutputExchangeSpec {
                exchange: suffixes.output_name(&spec.exchange),
                ..spec
            })
            .collect();

        Self {
            component: component.to_string(),
            input,
            outputs,
            dead_exchange: suffixes.shared_name(DEAD_LETTER_EXCHANGE),
            dead_queue: suffixes.shared_name(DEAD_LETTER_QUEUE),
        }
    }

    /// Whether the session neither consumes nor publishes anything
    pub fn is_empty(&self) -> bool {
        self.input.is_none() && self.outputs.is_empty()
    }
}

/// Builds a broker-unique consumer tag for the given component instance
pub fn consumer_tag(component: &str, instance: &str) -> String {
    format!("{}.{}.{}", component, instance, Uuid::new_v4())
}
