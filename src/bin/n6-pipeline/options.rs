use lazy_static::lazy_static;
use n6_pipeline::module;
use regex::Regex;
use std::process;
use structopt::StructOpt;

lazy_static! {
    /// Stem of a flag within the reserved `--n6` namespace
    static ref RESERVED_FLAG: Regex = Regex::new("^--n6[a-z-]*").unwrap();
}

/// Reserved flags the modules understand
const KNOWN_RESERVED_FLAGS: &[&str] = &["--n6input-suffix", "--n6output-suffix", "--n6recovery"];

/// Entrypoint options
#[derive(Debug, StructOpt)]
#[structopt(name = "n6-pipeline", about = "Threat intelligence message pipeline")]
pub struct MainOptions {
    /// Log level to use, see https://docs.rs/env_logger for more information
    #[structopt(
        short,
        long,
        global = true,
        default_value = "info",
        env = "RUST_LOG",
        value_name = "level"
    )]
    pub log: String,

    #[allow(missing_docs)]
    #[structopt(subcommand)]
    pub command: Command,
}

/// Available subcommands
#[derive(Debug, StructOpt)]
pub enum Command {
    /// Runs a feed collector against a consuming tap on the in-process broker
    Run(module::run::Options),
    /// Prints the broker topology a component would declare
    Resolve(module::resolve::Options),
}

/// Returns the first argument claiming the reserved namespace without being
/// a known flag
fn find_unknown_reserved_flag<'a>(arguments: &'a [String]) -> Option<&'a str> {
    arguments.iter().skip(1).find_map(|argument| {
        let stem = RESERVED_FLAG.find(argument)?.as_str();

        if KNOWN_RESERVED_FLAGS.contains(&stem) {
            None
        } else {
            Some(argument.as_str())
        }
    })
}

/// Exits with status 2 when an unrecognized reserved flag is present
///
/// The reserved namespace is validated before regular parsing so that a typo
/// in one of these flags can never be swallowed as a value.
pub fn guard_reserved_flags(arguments: &[String]) {
    if let Some(flag) = find_unknown_reserved_flag(arguments) {
        eprintln!("unknown reserved option '{}'", flag);
        process::exit(2);
    }
}
