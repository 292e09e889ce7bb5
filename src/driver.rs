//! Run orchestration
//!
//! Picks the scheduling strategy for a resolved configuration, drives it to the end
//! and produces the run report.

use std::io::BufRead;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::RunConfig;
use crate::env::{EnvFactory, EnvPolicy, EnvironmentManager};
use crate::error::RunError;
use crate::executor::{
    run_serial, ExecutionUnitRunner, JobQueue, ParallelScheduler, SelfExecLauncher,
    WorkerLauncher,
};
use crate::models::Registry;
use crate::output::{Console, Progress};
use crate::results::{FailureAggregator, RunReport};
use crate::utils::Timer;

/// Test name used for the environment stood up by `--env-only`
pub const MANUAL_ENV: &str = "manual test env";

const ENV_POLL: Duration = Duration::from_secs(1);

/// Drives one run over an already selected registry
pub struct Orchestrator {
    config: Arc<RunConfig>,
    registry: Registry,
    factory: Arc<dyn EnvFactory>,
    launcher: Arc<dyn WorkerLauncher>,
    console: Console,
}

impl Orchestrator {
    pub fn new(config: RunConfig, registry: Registry, factory: Arc<dyn EnvFactory>) -> Self {
        let console = Console::stdout(config.colorize);
        Self {
            config: Arc::new(config),
            registry,
            factory,
            launcher: Arc::new(SelfExecLauncher),
            console,
        }
    }

    pub fn with_launcher(mut self, launcher: Arc<dyn WorkerLauncher>) -> Self {
        self.launcher = launcher;
        self
    }

    pub fn with_console(mut self, console: Console) -> Self {
        self.console = console;
        self
    }

    /// Run every selected test, print the summary and write the failed tests file
    pub fn run(&self) -> Result<RunReport, RunError> {
        if self.config.env_only {
            self.run_env_only()?;
            return Ok(RunReport::default());
        }
        if self.config.interactive_debugger && self.registry.len() != 1 {
            return Err(RunError::config(
                "only one test can be run on interactive-debugger use -t",
            ));
        }

        let timer = Timer::start("test run");
        let queue = JobQueue::from_registry(&self.registry);
        let progress = Progress::new(queue.len(), !self.config.no_progress);
        progress.attach(&self.console);

        let outcome = if self.config.is_parallel() {
            self.run_parallel(&queue, &progress)
        } else {
            self.run_serial(&queue, &progress)
        };
        progress.finish(&self.console);
        let mut report = outcome?;
        report.elapsed = timer.stop();

        self.console
            .print_raw(&report.render(&self.console.paint()));
        if let Some(path) = &self.config.failed_tests_file {
            report.write_failed_tests(path)?;
        }
        info!(
            "Run finished: {} done, {} failed",
            report.done,
            report.failed()
        );
        Ok(report)
    }

    fn run_serial(&self, queue: &JobQueue, progress: &Progress) -> Result<RunReport, RunError> {
        let runner = ExecutionUnitRunner::new(
            self.config.clone(),
            self.factory.clone(),
            FailureAggregator::new(),
            self.console.clone(),
        );

        let aborted = match run_serial(&runner, &self.registry, queue, progress) {
            Ok(()) => None,
            Err(e) if e.is_abort() => Some(e.to_string()),
            Err(e) => return Err(e),
        };

        Ok(RunReport {
            done: runner.completed(),
            failures: runner.failures().snapshot(),
            aborted,
            ..Default::default()
        })
    }

    fn run_parallel(&self, queue: &JobQueue, progress: &Progress) -> Result<RunReport, RunError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?;
        let scheduler = ParallelScheduler::new(
            self.launcher.clone(),
            self.config.clone(),
            self.console.clone(),
        );
        let outcome = runtime.block_on(scheduler.run(queue, progress))?;

        Ok(RunReport {
            done: outcome.done,
            failures: outcome.failures,
            aborted: outcome
                .aborted
                .then(|| "a worker stopped the run on exit-on-failure".to_string()),
            ..Default::default()
        })
    }

    /// Stand an environment up and keep it until it dies or enter is pressed
    fn run_env_only(&self) -> Result<(), RunError> {
        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            let mut line = String::new();
            let _ = std::io::stdin().lock().read_line(&mut line);
            let _ = tx.send(());
        });
        self.hold_env(rx)
    }

    fn hold_env(&self, stop: Receiver<()>) -> Result<(), RunError> {
        let manager = EnvironmentManager::new(
            self.factory.clone(),
            self.config.env.clone(),
            EnvPolicy::from_config(&self.config),
            FailureAggregator::new(),
            self.console.clone(),
        );
        let env = manager.acquire(MANUAL_ENV)?;
        self.console
            .println("Environment is up, press enter to stop it");

        while env.is_up() {
            match stop.recv_timeout(ENV_POLL) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => continue,
            }
        }
        debug!("Stopping the manual environment");
        drop(env);
        manager.take_down(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnvSettings;
    use crate::executor::TestContext;
    use crate::models::TestResult;
    use crate::testing::ScriptedFactory;
    use tempfile::tempdir;

    fn pass(ctx: &mut TestContext<'_>) -> TestResult {
        ctx.env()?.assertions().check_eq(5, 5)
    }

    fn assertion(ctx: &mut TestContext<'_>) -> TestResult {
        ctx.env()?.assertions().check_eq(4, 5)
    }

    fn error(ctx: &mut TestContext<'_>) -> TestResult {
        ctx.env()?;
        Err(anyhow::anyhow!("unexpected reply").into())
    }

    fn orchestrator(config: RunConfig, registry: Registry, factory: &ScriptedFactory) -> Orchestrator {
        Orchestrator::new(config, registry, Arc::new(factory.clone()))
            .with_console(Console::buffered(false))
    }

    #[test]
    fn test_mixed_run_report() {
        let dir = tempdir().unwrap();
        let failed_file = dir.path().join("failed.txt");
        let config = RunConfig {
            failed_tests_file: Some(failed_file.clone()),
            no_progress: true,
            ..Default::default()
        };
        let registry = Registry::new()
            .function("t1", pass)
            .function("t2", assertion)
            .function("t3", error);
        let factory = ScriptedFactory::new();
        let orchestrator = orchestrator(config, registry, &factory);

        let report = orchestrator.run().unwrap();

        assert_eq!(report.done, 3);
        assert_eq!(report.failed(), 2);
        assert_eq!(report.passed(), 1);
        assert_eq!(report.exit_code(), 1);
        assert_eq!(
            report.failures.get("t2"),
            Some(&["expected 5 got 4".to_string()][..])
        );
        assert_eq!(
            std::fs::read_to_string(&failed_file).unwrap(),
            "t2\nt3\n"
        );

        let output = orchestrator.console.take_buffer();
        assert!(output.contains("Total Tests Run: 3, Total Tests Failed: 2, Total Tests Passed: 1"));
        assert!(output.contains("Failed Tests Summary:"));
    }

    #[test]
    fn test_exit_on_failure_stops_the_run() {
        let config = RunConfig {
            exit_on_failure: true,
            no_progress: true,
            env: EnvSettings {
                exit_on_failure: true,
                ..Default::default()
            },
            ..Default::default()
        };
        let registry = Registry::new()
            .function("t1", pass)
            .function("t2", assertion)
            .function("t3", pass);
        let factory = ScriptedFactory::new();
        let orchestrator = orchestrator(config, registry, &factory);

        let report = orchestrator.run().unwrap();

        assert!(report.aborted.is_some());
        assert_eq!(report.exit_code(), 1);
        assert_eq!(report.done, 2);
        assert_eq!(report.failures.names().collect::<Vec<_>>(), vec!["t2"]);
        // t3 never ran and every environment is down
        assert_eq!(factory.created(), 2);
        assert!((0..2).all(|i| factory.env(i).stops() == 1));
        assert!(!orchestrator.console.take_buffer().contains("t3:"));
    }

    #[test]
    fn test_interactive_debugger_needs_one_test() {
        let config = RunConfig {
            interactive_debugger: true,
            ..Default::default()
        };
        let registry = Registry::new().function("t1", pass).function("t2", pass);
        let factory = ScriptedFactory::new();

        match orchestrator(config, registry, &factory).run() {
            Err(RunError::Config(message)) => assert!(message.contains("only one test")),
            other => panic!("Expected a configuration error, got {other:?}"),
        }
        assert_eq!(factory.created(), 0);
    }

    #[test]
    fn test_hold_env_until_released() {
        let factory = ScriptedFactory::new();
        let orchestrator = orchestrator(RunConfig::default(), Registry::new(), &factory);
        let (tx, rx) = mpsc::channel();
        tx.send(()).unwrap();

        orchestrator.hold_env(rx).unwrap();

        assert_eq!(factory.created(), 1);
        assert_eq!(factory.env(0).stops(), 1);
        assert!(orchestrator
            .console
            .take_buffer()
            .contains("Environment is up"));
    }
}
