//! Preview of the broker topology a component would declare

use crate::domain::topology::{InputQueueSpec, OutputExchangeSpec, SessionTopology};
use crate::library::BoxedError;
use crate::module::options::{PipelineOptions, QueueingOptions};
use std::fmt::Write;
use structopt::StructOpt;

/// Options for the resolve command
#[derive(Debug, StructOpt)]
pub struct Options {
    #[allow(missing_docs)]
    #[structopt(flatten)]
    pub queueing: QueueingOptions,

    #[allow(missing_docs)]
    #[structopt(flatten)]
    pub pipeline: PipelineOptions,

    /// Component whose topology should be resolved
    #[structopt(value_name = "component")]
    pub component: String,

    /// Group the component belongs to
    #[structopt(long, value_name = "group")]
    pub group: Option<String>,

    /// Event types accepted by the component
    #[structopt(long = "event-type", value_name = "type")]
    pub event_types: Vec<String>,

    /// Binding keys used when no routing states are configured
    #[structopt(long = "binding-key", value_name = "key")]
    pub binding_keys: Vec<String>,

    /// Exchange the component consumes from
    #[structopt(long, default_value = "raw", value_name = "exchange")]
    pub input_exchange: String,

    /// Exchanges the component publishes to
    #[structopt(long = "output-exchange", value_name = "exchange")]
    pub output_exchanges: Vec<String>,

    /// Treat a missing routing configuration as expected
    #[structopt(long)]
    pub optional_input: bool,
}

/// Renders the names and binding keys the component would declare
pub fn render(options: &Options) -> Result<String, BoxedError> {
    let pipeline = options.pipeline.load()?;
    let group = options.group.as_deref().unwrap_or_default();

    let binding_keys = pipeline.resolve_binding_keys(
        &options.component,
        group,
        &options.event_types,
        &options.binding_keys,
        options.optional_input,
    );

    let mut input =
        InputQueueSpec::topic(&options.input_exchange, &options.component, binding_keys);
    input.prefetch_count = options.queueing.prefetch_count;

    let outputs = options
        .output_exchanges
        .iter()
        .map(|name| OutputExchangeSpec::topic(name))
        .collect();

    let topology = SessionTopology::resolve(
        &options.component,
        Some(input),
        outputs,
        &options.queueing.suffix_rules(),
    );

    let mut rendered = String::new();

    writeln!(rendered, "component        {}", topology.component)?;

    if let Some(input) = &topology.input {
        writeln!(rendered, "input exchange   {}", input.exchange)?;
        writeln!(rendered, "input queue      {}", input.queue)?;

        for key in &input.binding_keys {
            writeln!(rendered, "binding key      {}", key)?;
        }

        writeln!(rendered, "prefetch count   {}", input.prefetch_count)?;
    }

    for output in &topology.outputs {
        writeln!(rendered, "output exchange  {}", output.exchange)?;
    }

    writeln!(rendered, "dead exchange    {}", topology.dead_exchange)?;
    writeln!(rendered, "dead queue       {}", topology.dead_queue)?;

    Ok(rendered)
}
