//! Serial scheduling
//!
//! Drains the queue in-process, one unit at a time.

use tracing::{info, warn};

use super::{ExecutionUnitRunner, JobQueue, TimeoutFn};
use crate::error::RunError;
use crate::models::Registry;
use crate::output::Progress;

/// Run every queued job with `runner`, then take the environment down for good
pub fn run_serial(
    runner: &ExecutionUnitRunner,
    registry: &Registry,
    queue: &JobQueue,
    progress: &Progress,
) -> Result<(), RunError> {
    info!("Running {} tests serially", queue.len());

    while let Some(job) = queue.pop() {
        let Some(unit) = registry.get(&job.test_name) else {
            warn!("No test named {}, skipping job", job.test_name);
            continue;
        };

        let on_timeout: TimeoutFn = {
            let runner = runner.clone();
            let progress = progress.clone();
            let test_name = job.test_name.clone();
            Box::new(move || {
                let result = runner.record_timeout(&test_name);
                runner.print_failures();
                progress.inc();
                result
            })
        };

        runner.run_single_test(unit, on_timeout)?;
        progress.inc();
    }

    runner.manager().take_down(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunConfig;
    use crate::executor::{TestContext, Watchdog};
    use crate::models::TestResult;
    use crate::output::Console;
    use crate::results::FailureAggregator;
    use crate::testing::ScriptedFactory;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn quick(ctx: &mut TestContext<'_>) -> TestResult {
        ctx.env()?;
        Ok(())
    }

    fn wedged(ctx: &mut TestContext<'_>) -> TestResult {
        ctx.env()?;
        loop {
            ctx.checkpoint();
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_serial_drain_with_reuse() {
        let factory = ScriptedFactory::new();
        let config = RunConfig {
            env_reuse: true,
            ..Default::default()
        };
        let runner = ExecutionUnitRunner::new(
            Arc::new(config),
            Arc::new(factory.clone()),
            FailureAggregator::new(),
            Console::buffered(false),
        );
        let registry = Registry::new()
            .function("t1", quick)
            .function("t2", quick)
            .function("t3", quick);
        let queue = JobQueue::from_registry(&registry);
        queue.push(crate::models::Job::new("unknown"));

        run_serial(&runner, &registry, &queue, &Progress::hidden()).unwrap();

        assert!(queue.is_empty());
        assert_eq!(runner.completed(), 3);
        assert!(runner.failures().is_empty());
        // Reused throughout, flushed once more and stopped at the end
        assert_eq!(factory.created(), 1);
        assert_eq!(factory.env(0).flushes(), 4);
        assert_eq!(factory.env(0).stops(), 1);
        assert!(runner.manager().current().is_none());
    }

    #[test]
    fn test_serial_timeout() {
        let factory = ScriptedFactory::new();
        let config = RunConfig {
            test_timeout: 1,
            ..Default::default()
        };
        let console = Console::buffered(false);
        let runner = ExecutionUnitRunner::new(
            Arc::new(config),
            Arc::new(factory.clone()),
            FailureAggregator::new(),
            console.clone(),
        );
        let exits = Arc::new(AtomicUsize::new(0));
        let watchdog = {
            let exits = exits.clone();
            Watchdog::new(1, runner.interrupt(), console.clone())
                .with_timeout(Duration::from_millis(300))
                .with_terminator(Arc::new(move || {
                    exits.fetch_add(1, Ordering::SeqCst);
                }))
        };
        let runner = runner.with_watchdog(watchdog);

        let registry = Registry::new().function("slow", wedged);
        let queue = JobQueue::from_registry(&registry);
        {
            let runner = runner.clone();
            // The test thread parks forever once interrupted
            std::thread::spawn(move || run_serial(&runner, &registry, &queue, &Progress::hidden()));
        }

        let start = std::time::Instant::now();
        while exits.load(Ordering::SeqCst) == 0 && start.elapsed() < Duration::from_secs(10) {
            std::thread::sleep(Duration::from_millis(20));
        }

        assert_eq!(exits.load(Ordering::SeqCst), 1);
        let record = runner.failures().snapshot();
        assert_eq!(record.len(), 1);
        assert_eq!(record.get("slow").unwrap(), &["Test timeout"]);
        assert!(factory.env(0).crashed());
        assert_eq!(runner.completed(), 1);

        let output = console.take_buffer();
        assert!(output.contains("Test Timeout, printing trace."));
        assert!(output.contains("slow:\n\t[FAIL]"));
    }
}
