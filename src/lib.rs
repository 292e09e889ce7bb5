//! rltest - test orchestrator for database servers and their modules
//!
//! Runs a registry of tests against server environments it stands up and tears
//! down, either serially or across worker processes, with per-test timeouts,
//! environment reuse and centralized failure reporting.
//!
//! ## Usage
//!
//! A harness binary registers its tests and hands over to [`run_harness`]:
//!
//! ```no_run
//! use std::sync::Arc;
//! use rltest::env::ServerEnvFactory;
//! use rltest::executor::TestContext;
//! use rltest::models::{Registry, TestResult};
//!
//! fn test_ping(ctx: &mut TestContext<'_>) -> TestResult {
//!     ctx.env()?.connection()?.ping().map_err(anyhow::Error::from)?;
//!     Ok(())
//! }
//!
//! fn main() -> std::process::ExitCode {
//!     let registry = Registry::new().function("test_ping", test_ping);
//!     rltest::run_harness(registry, Arc::new(ServerEnvFactory))
//! }
//! ```
//!
//! ```bash
//! # Run two tests on four workers, stop at the first failure
//! my-harness -t test_ping -t Keyspace --parallelism 4 -x
//!
//! # Reuse one server for the whole run and list failures in a file
//! my-harness -r -F failed.txt
//! ```

use clap::Parser;
use std::io::IsTerminal;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{debug, error, warn};

pub mod cli;
pub mod config;
pub mod driver;
pub mod env;
pub mod error;
pub mod executor;
pub mod models;
pub mod output;
pub mod results;
pub mod utils;

#[cfg(test)]
mod testing;

use cli::Args;
use config::{ConfigFile, EnvConfig, RunConfig};
use driver::Orchestrator;
use env::EnvFactory;
use error::RunError;
use executor::{run_worker, WORKER_CONFIG_ENV};
use models::Registry;
use output::Paint;
use utils::{init_logger, LogLevel};

/// Parse the command line and run `registry`, as driver or as a worker
pub fn run_harness(registry: Registry, factory: Arc<dyn EnvFactory>) -> ExitCode {
    let args = Args::parse();
    let env = EnvConfig::load();
    init_logger(LogLevel::resolve([
        args.log_level.as_deref(),
        env.log.as_deref(),
    ]));

    let outcome = match args.worker {
        Some(index) => run_as_worker(index, &registry, factory),
        None => run_driver(&args, &env, registry, factory),
    };

    match outcome {
        Ok(code) => code,
        Err(e) => {
            error!("{}", e);
            if args.worker.is_none() {
                let paint = Paint::new(std::io::stderr().is_terminal());
                eprintln!("{}", paint.bred(&e.to_string()));
            }
            ExitCode::FAILURE
        }
    }
}

fn run_as_worker(
    index: usize,
    registry: &Registry,
    factory: Arc<dyn EnvFactory>,
) -> Result<ExitCode, RunError> {
    let payload = std::env::var(WORKER_CONFIG_ENV)
        .map_err(|_| RunError::worker(index, format!("{WORKER_CONFIG_ENV} is not set")))?;
    let config: RunConfig = serde_json::from_str(&payload)
        .map_err(|e| RunError::worker(index, format!("unreadable configuration: {e}")))?;

    run_worker(index, config, registry, factory)?;
    Ok(ExitCode::SUCCESS)
}

fn run_driver(
    args: &Args,
    env: &EnvConfig,
    registry: Registry,
    factory: Arc<dyn EnvFactory>,
) -> Result<ExitCode, RunError> {
    let file = ConfigFile::discover(args.config.as_deref().or(env.config_file.as_deref()))?;
    let config = RunConfig::resolve(args, env, &file.defaults)?;
    debug!("Resolved configuration: {:?}", config);

    let registry = if config.tests.is_empty() {
        registry
    } else {
        let (selected, unknown) = registry.select(&config.tests);
        for name in unknown {
            warn!("Invalid test {}", name);
            eprintln!("Invalid test {name}");
        }
        selected
    };

    if config.collect_only {
        for unit in registry.units() {
            println!("{}", unit.name());
        }
        return Ok(ExitCode::SUCCESS);
    }

    if config.clear_logs && config.env.log_dir.exists() {
        std::fs::remove_dir_all(&config.env.log_dir)?;
        debug!("Cleared {}", config.env.log_dir.display());
    }

    let report = Orchestrator::new(config, registry, factory).run()?;
    Ok(if report.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
