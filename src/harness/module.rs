//! Wrapper around top-level modules to generalize common behaviour

use super::heart::{DeathReason, Heart};
use crate::library::{BoxedError, EmptyResult};
use async_trait::async_trait;
use std::any::type_name;
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{error, info, instrument};

/// Executable unit of the application
///
/// A module may either complete its work within [`run`](Module::run) and
/// return `None`, or hand back a [`Heart`] whose death the runner awaits
/// before starting the shutdown phase.
#[async_trait]
pub trait Module: Send {
    /// Prepares external resources the module relies on
    async fn pre_startup(&mut self) -> EmptyResult {
        Ok(())
    }

    /// Executes the module
    async fn run(&mut self) -> Result<Option<Heart>, BoxedError>;

    /// Cleans up once the module has terminated
    async fn post_shutdown(&mut self, _termination_reason: &ModuleTerminationReason) {}
}

/// Reason why a module terminated
#[derive(Debug, Error)]
pub enum ModuleTerminationReason {
    /// Startup routine failed
    #[error("encountered an error during startup")]
    StartupFailed(#[source] BoxedError),
    /// Error during normal operation
    #[error("encountered an operational error")]
    OperationalError(#[source] BoxedError),
    /// The modules heart stopped beating
    #[error("the heart of the module died")]
    HeartDied(DeathReason),
    /// Module exited by itself without an error
    #[error("module exited on its own")]
    ExitedNormally,
    /// Startup or shutdown routine took too long
    #[error("startup or shutdown routine timed out")]
    Timeout,
}

impl ModuleTerminationReason {
    /// Whether the termination should be reported as a process failure
    pub fn is_failure(&self) -> bool {
        match self {
            Self::StartupFailed(_) | Self::OperationalError(_) | Self::Timeout => true,
            Self::HeartDied(DeathReason::Killed(_)) => true,
            Self::HeartDied(DeathReason::Terminated) | Self::ExitedNormally => false,
        }
    }
}

/// Executor for [`Module`] implementations guarding the lifecycle phases
pub struct ModuleRunner {
    startup_timeout: Duration,
    shutdown_timeout: Duration,
}

impl Default for ModuleRunner {
    fn default() -> Self {
        Self {
            startup_timeout: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(60),
        }
    }
}

impl ModuleRunner {
    /// Creates a runner with custom lifecycle timeouts
    pub fn new(startup_timeout: Duration, shutdown_timeout: Duration) -> Self {
        Self {
            startup_timeout,
            shutdown_timeout,
        }
    }

    /// Runs a module to completion and reports how it ended
    pub async fn run<M: Module>(&self, mut module: M) -> ModuleTerminationReason {
        let reason = self.run_loop(&mut module).await;

        match &reason {
            ModuleTerminationReason::ExitedNormally
            | ModuleTerminationReason::HeartDied(DeathReason::Terminated) => {
                info!("Module terminated normally")
            }
            other => error!("Module terminated abnormally: {}", other),
        }

        match timeout(self.shutdown_timeout, module.post_shutdown(&reason)).await {
            Ok(()) => reason,
            Err(_) => ModuleTerminationReason::Timeout,
        }
    }

    #[instrument(skip(self, module), fields(module_name = type_name::<M>()))]
    async fn run_loop<M: Module>(&self, module: &mut M) -> ModuleTerminationReason {
        info!("Starting module");

        match timeout(self.startup_timeout, module.pre_startup()).await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => return ModuleTerminationReason::StartupFailed(error),
            Err(_) => return ModuleTerminationReason::Timeout,
        }

        match module.run().await {
            Ok(Some(mut heart)) => ModuleTerminationReason::HeartDied(heart.death().await),
            Ok(None) => ModuleTerminationReason::ExitedNormally,
            Err(error) => ModuleTerminationReason::OperationalError(error),
        }
    }
}
