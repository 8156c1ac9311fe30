use anyhow::{Error, Result};
use log::info;
use n6_pipeline::harness::ModuleRunner;
use n6_pipeline::module::resolve;
use n6_pipeline::module::run::Pipeline;
use options::Command;
use std::env;
use std::process;
use structopt::StructOpt;

mod options;

#[tokio::main]
async fn main() -> Result<()> {
    let (command, runner) = init();

    let failed = match command {
        Command::Run(options) => {
            let module = Pipeline::new(options).map_err(Error::msg)?;

            runner.run(module).await.is_failure()
        }
        Command::Resolve(options) => {
            print!("{}", resolve::render(&options).map_err(Error::msg)?);

            false
        }
    };

    if failed {
        process::exit(1);
    }

    Ok(())
}

fn init() -> (Command, ModuleRunner) {
    let arguments: Vec<String> = env::args().collect();
    options::guard_reserved_flags(&arguments);

    let options = options::MainOptions::from_args();

    pretty_env_logger::formatted_timed_builder()
        .parse_filters(&options.log)
        .init();

    info!("n6 pipeline {}", env!("CARGO_PKG_VERSION"));

    (options.command, ModuleRunner::default())
}
