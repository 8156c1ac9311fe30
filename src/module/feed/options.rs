use crate::domain::harvest::MismatchPolicy;
use crate::domain::message::SourceLabel;
use crate::library::helpers::parse_seconds;
use std::path::PathBuf;
use std::time::Duration;
use structopt::StructOpt;

/// Options for the feed collector
#[derive(Debug, StructOpt)]
pub struct Options {
    /// URL the feed is downloaded from
    #[structopt(long, env, value_name = "url")]
    pub feed_url: String,

    /// Label of the source in `provider.channel` notation
    #[structopt(long, env, value_name = "label")]
    pub source: SourceLabel,

    /// Directory holding the persisted collection state
    #[structopt(long, env, default_value = ".n6state", value_name = "path")]
    pub state_dir: PathBuf,

    /// Number of times a failed download is retried before giving up
    #[structopt(long, env, default_value = "3", value_name = "count")]
    pub download_retries: u32,

    /// Time limit for a single download attempt
    #[structopt(long, env, default_value = "30", parse(try_from_str = parse_seconds), value_name = "seconds")]
    pub download_timeout: Duration,

    /// Abort the run when the source serves fewer rows than already emitted
    #[structopt(long)]
    pub row_count_mismatch_is_fatal: bool,

    /// Zero-based index of the column holding the row time
    #[structopt(long, env, default_value = "1", value_name = "index")]
    pub time_column: usize,

    /// Format of the row time column
    #[structopt(long, env, default_value = "%Y-%m-%d", value_name = "format")]
    pub time_format: String,
}

impl Options {
    /// Reaction to detected source inconsistencies
    pub fn mismatch_policy(&self) -> MismatchPolicy {
        if self.row_count_mismatch_is_fatal {
            MismatchPolicy::Fatal
        } else {
            MismatchPolicy::Warn
        }
    }
}
