use crate::module::feed;
use crate::module::options::{PipelineOptions, QueueingOptions};
use structopt::StructOpt;

/// Options for the run module
#[derive(Debug, StructOpt)]
pub struct Options {
    #[allow(missing_docs)]
    #[structopt(flatten)]
    pub queueing: QueueingOptions,

    #[allow(missing_docs)]
    #[structopt(flatten)]
    pub pipeline: PipelineOptions,

    #[allow(missing_docs)]
    #[structopt(flatten)]
    pub feed: feed::Options,

    /// Name under which the consuming side declares its queue
    #[structopt(long, env, default_value = "tap", value_name = "component")]
    pub tap_component: String,

    /// Exchange receiving the collected raw messages
    #[structopt(long, env, default_value = "raw", value_name = "exchange")]
    pub raw_exchange: String,
}
