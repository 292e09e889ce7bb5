//! Worker side of a parallel run
//!
//! A worker owns one runner, one environment slot and a private output buffer. It
//! asks the driver for jobs on stdout, reads them from stdin, and reports the
//! captured output and its running summary after every unit.

use std::io::{BufRead, Write};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use super::{ExecutionUnitRunner, TimeoutFn};
use crate::config::RunConfig;
use crate::env::EnvFactory;
use crate::error::RunError;
use crate::models::{DriverMessage, Registry, SummarySnapshot, TestOutput, WorkerMessage};
use crate::output::Console;
use crate::results::FailureAggregator;

/// Serialized writer for the driver channel. The watchdog thread shares it.
#[derive(Clone)]
struct Publisher {
    out: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl Publisher {
    fn new(out: Box<dyn Write + Send>) -> Self {
        Self {
            out: Arc::new(Mutex::new(out)),
        }
    }

    fn send(&self, message: &WorkerMessage) -> std::io::Result<()> {
        let mut line = serde_json::to_string(message)?;
        line.push('\n');
        let mut out = self.out.lock().unwrap_or_else(|e| e.into_inner());
        out.write_all(line.as_bytes())?;
        out.flush()
    }

    /// Report the unit that just ended along with the running totals
    fn finished(&self, test_name: &str, runner: &ExecutionUnitRunner) -> std::io::Result<()> {
        self.send(&WorkerMessage::Result(TestOutput {
            test_name: test_name.to_string(),
            output: runner.console().take_buffer(),
        }))?;
        self.summary(runner)
    }

    fn summary(&self, runner: &ExecutionUnitRunner) -> std::io::Result<()> {
        self.send(&WorkerMessage::Summary(SummarySnapshot {
            done: runner.completed(),
            failures: runner.failures().snapshot(),
        }))
    }
}

/// Serve jobs from the driver over this process's stdio
pub fn run_worker(
    index: usize,
    config: RunConfig,
    registry: &Registry,
    factory: Arc<dyn EnvFactory>,
) -> Result<(), RunError> {
    info!("Worker {} serving on port {}", index, config.env.port);
    let runner = worker_runner(config, factory);
    let stdin = std::io::stdin();
    serve(
        index,
        &runner,
        registry,
        stdin.lock(),
        Box::new(std::io::stdout()),
    )
}

/// Runner whose output goes to a private buffer, shipped to the driver per unit
fn worker_runner(config: RunConfig, factory: Arc<dyn EnvFactory>) -> ExecutionUnitRunner {
    let console = Console::buffered(config.colorize);
    ExecutionUnitRunner::new(
        Arc::new(config),
        factory,
        FailureAggregator::new(),
        console,
    )
}

fn serve<R: BufRead>(
    index: usize,
    runner: &ExecutionUnitRunner,
    registry: &Registry,
    input: R,
    output: Box<dyn Write + Send>,
) -> Result<(), RunError> {
    let publisher = Publisher::new(output);

    publisher.send(&WorkerMessage::Ready)?;
    for line in input.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let message: DriverMessage = serde_json::from_str(&line)
            .map_err(|e| RunError::worker(index, format!("unreadable job: {e}")))?;
        let job = match message {
            DriverMessage::Job(job) => job,
            DriverMessage::Drained => break,
        };

        let Some(unit) = registry.get(&job.test_name) else {
            warn!("No test named {}, skipping job", job.test_name);
            publisher.finished(&job.test_name, runner)?;
            publisher.send(&WorkerMessage::Ready)?;
            continue;
        };

        let on_timeout: TimeoutFn = {
            let runner = runner.clone();
            let publisher = publisher.clone();
            let test_name = job.test_name.clone();
            Box::new(move || {
                if let Err(e) = runner.record_timeout(&test_name) {
                    runner
                        .failures()
                        .add(&test_name, [format!("Exception on timeout function {e:#}")]);
                }
                publisher.finished(&test_name, &runner)?;
                Ok(())
            })
        };

        match runner.run_single_test(unit, on_timeout) {
            Ok(done) => debug!("{} completed {} tests", job.test_name, done),
            Err(e) if e.is_abort() => {
                info!("Worker {} stopping: {}", index, e);
                publisher.finished(&job.test_name, runner)?;
                publisher.send(&WorkerMessage::Aborted {
                    test_name: job.test_name,
                })?;
                return Ok(());
            }
            Err(e) => return Err(e),
        }
        publisher.finished(&job.test_name, runner)?;
        publisher.send(&WorkerMessage::Ready)?;
    }

    let teardown = runner.manager().take_down(true);
    let text = runner.console().take_buffer();
    if !text.is_empty() {
        publisher.send(&WorkerMessage::Output { text })?;
    }
    publisher.summary(runner)?;
    teardown
}
