//! Various options usable by modules
//!
//! The structs in this module allow other modules to flatten them into their
//! own options struct. This allows for a unified yet non-cluttered option
//! handling.

use crate::domain::pipeline::PipelineConfig;
use crate::domain::topology::SuffixRules;
use crate::library::communication::memory::MemoryBrokerConfig;
use crate::library::helpers::parse_seconds;
use crate::library::BoxedError;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use structopt::StructOpt;

/// Options related to message queueing
#[derive(Debug, StructOpt)]
pub struct QueueingOptions {
    /// Unique and stable identifier for this instance.
    /// It is used to tell consumers of the same component apart,
    /// thus it may not change across executions!
    #[structopt(long, env, default_value = "main", value_name = "name")]
    pub instance: String,

    /// Heartbeat interval negotiated with the message broker
    #[structopt(long, env, default_value = "60", parse(try_from_str = parse_seconds), value_name = "seconds")]
    pub heartbeat: Duration,

    /// Number of unacknowledged deliveries a consumer may hold at once
    #[structopt(long, env, default_value = "20", value_name = "count")]
    pub prefetch_count: u16,

    /// Number of buffered outbound messages that triggers a full drain
    #[structopt(long, env, default_value = "100", value_name = "count")]
    pub publish_buffer_threshold: usize,

    /// Time limit for the broker handshake and topology declaration
    #[structopt(long, env, default_value = "30", parse(try_from_str = parse_seconds), value_name = "seconds")]
    pub setup_timeout: Duration,

    /// Time limit for winding a session down
    #[structopt(long, env, default_value = "30", parse(try_from_str = parse_seconds), value_name = "seconds")]
    pub shutdown_timeout: Duration,

    /// Suffix appended to the names of input exchanges and queues
    #[structopt(long = "n6input-suffix", env = "N6INPUT_SUFFIX", value_name = "suffix")]
    pub input_suffix: Option<String>,

    /// Suffix appended to the names of output exchanges
    #[structopt(long = "n6output-suffix", env = "N6OUTPUT_SUFFIX", value_name = "suffix")]
    pub output_suffix: Option<String>,

    /// Append the recovery suffix to every declared broker name
    #[structopt(long = "n6recovery")]
    pub recovery: bool,
}

impl QueueingOptions {
    /// Suffix rules derived from the command line
    pub fn suffix_rules(&self) -> SuffixRules {
        SuffixRules {
            input: self.input_suffix.clone(),
            output: self.output_suffix.clone(),
            recovery: self.recovery,
        }
    }

    /// Configuration for the in-process broker
    pub fn broker_config(&self) -> MemoryBrokerConfig {
        MemoryBrokerConfig {
            heartbeat_interval: self.heartbeat,
        }
    }
}

/// Options locating the pipeline routing configuration
#[derive(Debug, StructOpt)]
pub struct PipelineOptions {
    /// Path to a YAML file mapping components and groups to routing states
    #[structopt(long, env, value_name = "path")]
    pub pipeline_config: Option<PathBuf>,
}

impl PipelineOptions {
    /// Loads the configuration, an absent path yielding the empty mapping
    pub fn load(&self) -> Result<PipelineConfig, BoxedError> {
        match &self.pipeline_config {
            Some(path) => {
                let raw = fs::read_to_string(path)?;
                Ok(serde_yaml::from_str(&raw)?)
            }
            None => Ok(PipelineConfig::default()),
        }
    }
}
