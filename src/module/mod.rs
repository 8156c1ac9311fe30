//! Runnable top-level modules of the pipeline
//!
//! Each submodule provides a [`Module`](crate::harness::Module) implementation
//! or a self-contained command together with an [`Options`](structopt::StructOpt)
//! struct that can be flattened into the binary's command line.

pub mod feed;
pub mod options;
pub mod resolve;
pub mod run;
