//! Parallel test execution
//!
//! The driver side of a parallel run. Each worker is a child process speaking
//! line-delimited JSON on its stdio: it asks for jobs, reports every finished unit
//! and keeps the driver up to date with a running summary. The driver hands out jobs
//! from the shared queue, relays worker output to the console and merges the last
//! summary of every worker at the end.

use futures::future::join_all;
use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::JobQueue;
use crate::config::RunConfig;
use crate::error::RunError;
use crate::models::{DriverMessage, SummarySnapshot, TestOutput, TestStatus, WorkerMessage};
use crate::output::{Console, Progress};
use crate::results::FailureRecord;

/// Carries the resolved configuration of a worker process
pub const WORKER_CONFIG_ENV: &str = "RLTEST_WORKER_CONFIG";

/// Recorded for a job whose worker died before reporting it
pub const WORKER_LOST: &str = "<worker exited unexpectedly>";

const RESULT_POLL: Duration = Duration::from_secs(1);

/// Builds the command that starts worker `index`
pub trait WorkerLauncher: Send + Sync {
    fn command(&self, index: usize, config: &RunConfig) -> Result<Command, RunError>;
}

/// Re-executes the current binary in worker mode
#[derive(Clone, Copy, Debug, Default)]
pub struct SelfExecLauncher;

impl WorkerLauncher for SelfExecLauncher {
    fn command(&self, index: usize, config: &RunConfig) -> Result<Command, RunError> {
        let exe = std::env::current_exe()?;
        let payload = serde_json::to_string(&config.for_worker(index))
            .map_err(|e| RunError::worker(index, format!("cannot encode configuration: {e}")))?;

        let mut cmd = Command::new(exe);
        cmd.arg("--worker")
            .arg(index.to_string())
            .env(WORKER_CONFIG_ENV, payload);
        Ok(cmd)
    }
}

/// What a parallel run leaves behind
#[derive(Debug, Default)]
pub struct ParallelOutcome {
    pub done: usize,
    pub failures: FailureRecord,
    /// A worker stopped the run under exit-on-failure
    pub aborted: bool,
}

enum Event {
    Result(TestOutput),
    Summary(usize, SummarySnapshot),
    Output(String),
    Lost { index: usize, test_name: String },
    Aborted { index: usize, test_name: String },
    Exited(usize),
}

/// Distributes queued jobs over worker processes
pub struct ParallelScheduler {
    launcher: Arc<dyn WorkerLauncher>,
    config: Arc<RunConfig>,
    console: Console,
    poll: Duration,
}

impl ParallelScheduler {
    pub fn new(launcher: Arc<dyn WorkerLauncher>, config: Arc<RunConfig>, console: Console) -> Self {
        Self {
            launcher,
            config,
            console,
            poll: RESULT_POLL,
        }
    }

    pub fn with_poll(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }

    /// Drain `queue` with `parallelism` workers
    pub async fn run(&self, queue: &JobQueue, progress: &Progress) -> Result<ParallelOutcome, RunError> {
        let workers = self.config.parallelism.max(1);
        info!("Running {} tests on {} workers", queue.len(), workers);

        let aborted = Arc::new(AtomicBool::new(false));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut handles = Vec::with_capacity(workers);
        for index in 0..workers {
            let mut cmd = self.launcher.command(index, &self.config)?;
            cmd.stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::inherit())
                .kill_on_drop(true);
            let child = cmd
                .spawn()
                .map_err(|e| RunError::worker(index, format!("failed to start: {e}")))?;
            debug!("Started worker {} (pid {:?})", index, child.id());

            let queue = queue.clone();
            let aborted = aborted.clone();
            let events = tx.clone();
            handles.push(tokio::spawn(async move {
                let outcome = drive_worker(index, child, &queue, &aborted, &events).await;
                if let Err(e) = &outcome {
                    warn!("Worker {} failed: {}", index, e);
                }
                let _ = events.send(Event::Exited(index));
                outcome
            }));
        }
        drop(tx);

        let mut alive = workers;
        let mut summaries: BTreeMap<usize, SummarySnapshot> = BTreeMap::new();
        let mut lost = FailureRecord::new();
        let mut lost_done = 0;

        loop {
            let event = match tokio::time::timeout(self.poll, rx.recv()).await {
                Ok(Some(event)) => event,
                Ok(None) => break,
                Err(_) => {
                    if alive == 0 && !queue.is_empty() && !aborted.load(Ordering::SeqCst) {
                        return Err(RunError::SchedulerFailure {
                            pending: queue.len(),
                        });
                    }
                    continue;
                }
            };

            match event {
                Event::Result(output) => {
                    debug!("{} finished", output.test_name);
                    self.console.print_raw(&output.output);
                    progress.inc();
                }
                Event::Summary(index, snapshot) => {
                    summaries.insert(index, snapshot);
                }
                Event::Output(text) => self.console.print_raw(&text),
                Event::Lost { index, test_name } => {
                    warn!("Worker {} died while running {}", index, test_name);
                    self.console
                        .println(self.console.paint().status_line(&test_name, TestStatus::Error));
                    lost.add(&test_name, [WORKER_LOST.to_string()]);
                    lost_done += 1;
                    progress.inc();
                }
                Event::Aborted { index, test_name } => {
                    info!("Worker {} aborted the run after {}", index, test_name);
                }
                Event::Exited(index) => {
                    debug!("Worker {} exited", index);
                    alive = alive.saturating_sub(1);
                }
            }
        }

        for joined in join_all(handles).await {
            if let Err(e) = joined {
                warn!("Worker task panicked: {}", e);
            }
        }

        let aborted = aborted.load(Ordering::SeqCst);
        if !queue.is_empty() && !aborted {
            return Err(RunError::SchedulerFailure {
                pending: queue.len(),
            });
        }

        let mut failures = FailureRecord::new();
        let mut done = lost_done;
        for snapshot in summaries.values() {
            done += snapshot.done;
            failures.import(&snapshot.failures);
        }
        failures.merge(&lost);

        Ok(ParallelOutcome {
            done,
            failures,
            aborted,
        })
    }
}

/// Serve one worker until its stdout closes
async fn drive_worker(
    index: usize,
    mut child: Child,
    queue: &JobQueue,
    aborted: &AtomicBool,
    events: &mpsc::UnboundedSender<Event>,
) -> Result<(), RunError> {
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| RunError::worker(index, "stdout not captured"))?;
    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| RunError::worker(index, "stdin not captured"))?;
    let mut lines = BufReader::new(stdout).lines();
    let mut in_flight: Option<String> = None;

    while let Some(line) = lines.next_line().await? {
        let message = match serde_json::from_str::<WorkerMessage>(&line) {
            Ok(message) => message,
            Err(_) => {
                // Something in the worker wrote to stdout directly
                let _ = events.send(Event::Output(format!("{line}\n")));
                continue;
            }
        };

        match message {
            WorkerMessage::Ready => {
                let next = if aborted.load(Ordering::SeqCst) {
                    None
                } else {
                    queue.pop()
                };
                let reply = match next {
                    Some(job) => {
                        in_flight = Some(job.test_name.clone());
                        DriverMessage::Job(job)
                    }
                    None => DriverMessage::Drained,
                };
                let mut payload = serde_json::to_string(&reply)
                    .map_err(|e| RunError::worker(index, format!("cannot encode reply: {e}")))?;
                payload.push('\n');
                if let Err(e) = stdin.write_all(payload.as_bytes()).await {
                    debug!("Worker {} stopped reading: {}", index, e);
                    break;
                }
                stdin.flush().await?;
            }
            WorkerMessage::Result(output) => {
                in_flight = None;
                let _ = events.send(Event::Result(output));
            }
            WorkerMessage::Summary(snapshot) => {
                let _ = events.send(Event::Summary(index, snapshot));
            }
            WorkerMessage::Output { text } => {
                let _ = events.send(Event::Output(text));
            }
            WorkerMessage::Aborted { test_name } => {
                aborted.store(true, Ordering::SeqCst);
                in_flight = None;
                let _ = events.send(Event::Aborted { index, test_name });
            }
        }
    }

    drop(stdin);
    let status = child.wait().await?;
    debug!("Worker {} exited with {}", index, status);

    if let Some(test_name) = in_flight {
        let _ = events.send(Event::Lost { index, test_name });
    }
    Ok(())
}
