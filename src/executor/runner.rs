//! Test execution runner
//!
//! Runs one test unit at a time: environment acquisition, suite hooks, outcome
//! classification and failure recording.

use std::any::Any;
use std::backtrace::BacktraceStatus;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::{Interrupt, TestContext, TimeoutFn, Watchdog};
use crate::config::RunConfig;
use crate::env::{EnvFactory, EnvPolicy, EnvironmentManager};
use crate::error::RunError;
use crate::models::{TestError, TestResult, TestStatus, TestTarget, TestUnit};
use crate::output::Console;
use crate::results::FailureAggregator;

/// Recorded for a test that returned cleanly after its environment went away
pub const ENV_DESTROYED: &str = "<Environment destroyed>";

/// Recorded by the timeout path
pub const TEST_TIMEOUT: &str = "Test timeout";

/// Which part of a test a callback is asked to run
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Phase {
    Before,
    Body,
    After,
}

/// Executes test units against the environment manager of this worker
#[derive(Clone)]
pub struct ExecutionUnitRunner {
    config: Arc<RunConfig>,
    manager: Arc<EnvironmentManager>,
    failures: FailureAggregator,
    console: Console,
    interrupt: Interrupt,
    watchdog: Watchdog,
    completed: Arc<AtomicUsize>,
}

impl ExecutionUnitRunner {
    pub fn new(
        config: Arc<RunConfig>,
        factory: Arc<dyn EnvFactory>,
        failures: FailureAggregator,
        console: Console,
    ) -> Self {
        let interrupt = Interrupt::new();
        let manager = Arc::new(EnvironmentManager::new(
            factory,
            config.env.clone(),
            EnvPolicy::from_config(&config),
            failures.clone(),
            console.clone(),
        ));
        let watchdog = Watchdog::new(config.test_timeout, interrupt.clone(), console.clone());

        Self {
            config,
            manager,
            failures,
            console,
            interrupt,
            watchdog,
            completed: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_watchdog(mut self, watchdog: Watchdog) -> Self {
        self.watchdog = watchdog;
        self
    }

    pub fn interrupt(&self) -> Interrupt {
        self.interrupt.clone()
    }

    pub fn manager(&self) -> &EnvironmentManager {
        &self.manager
    }

    pub fn failures(&self) -> &FailureAggregator {
        &self.failures
    }

    pub fn console(&self) -> &Console {
        &self.console
    }

    /// Tests and sub-tests completed so far, timed-out ones included
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    /// Run a top-level unit under the watchdog and an environment scope.
    ///
    /// Returns the number of tests and sub-tests it completed.
    pub fn run_single_test(
        &self,
        unit: &TestUnit,
        on_timeout: TimeoutFn,
    ) -> Result<usize, RunError> {
        info!("Running {}", unit.name());
        let limit = self.watchdog.arm(on_timeout);
        let scope = self.manager.scope();
        unit.initialize();

        let mut done = 0;
        let failures = match unit.target() {
            TestTarget::Function { body, needs_env } => {
                let failures = self.run_test(
                    unit.name(),
                    unit.name(),
                    unit.name(),
                    needs_env,
                    |phase, ctx| match phase {
                        Phase::Body => body(ctx),
                        Phase::Before | Phase::After => Ok(()),
                    },
                )?;
                done += 1;
                failures
            }
            TestTarget::Suite(factory) => {
                let created = {
                    let mut ctx = self.context(unit.name());
                    guarded(|| factory(&mut ctx))
                };
                let mut suite = match created {
                    Ok(suite) => suite,
                    Err(e) if e.is_skip() => {
                        self.print_status(unit.name(), TestStatus::Skip);
                        scope.finish()?;
                        return Ok(0);
                    }
                    Err(e) => {
                        self.print_exception(&e);
                        self.failures
                            .add(&format!("{} [__init__]", unit.name()), Vec::new());
                        scope.finish()?;
                        return Ok(0);
                    }
                };

                let mut failures = 0;
                for sub_test in suite.sub_tests() {
                    limit.reset();
                    let key = format!("{}:{}", unit.name(), sub_test);
                    failures += self.run_test(
                        &key,
                        &format!("\t{key}"),
                        unit.name(),
                        false,
                        |phase, ctx| match phase {
                            Phase::Before => suite.set_up(ctx),
                            Phase::Body => suite.run_sub_test(sub_test, ctx),
                            Phase::After => suite.tear_down(ctx),
                        },
                    )?;
                    done += 1;
                }
                failures
            }
        };

        let verbose = failures > 0 && self.config.verbose_information_on_failure;
        let before_dispose = if verbose {
            self.manager
                .current()
                .map(|env| (env.diagnostics_before_dispose(), env))
        } else {
            None
        };

        scope.finish()?;
        limit.finish();

        // The environment is down now, collect what it left behind
        if let Some((before, env)) = before_dispose {
            let info = serde_json::json!({
                "before_dispose": before.unwrap_or_else(|e| serde_json::Value::String(format!("{e:#}"))),
                "after_dispose": env
                    .diagnostics_after_dispose()
                    .unwrap_or_else(|e| serde_json::Value::String(format!("{e:#}"))),
            });
            match serde_json::to_string_pretty(&info) {
                Ok(text) => env.debug_print(&text.replace("\\n", "\n"), true),
                Err(e) => debug!("Failed to render diagnostics: {}", e),
            }
        }

        Ok(done)
    }

    fn context<'a>(&'a self, env_name: &'a str) -> TestContext<'a> {
        TestContext::new(
            env_name,
            &self.manager,
            &self.config,
            &self.interrupt,
            &self.console,
        )
    }

    /// Run one test or sub-test and return the failures it added.
    ///
    /// `key` names the failure record entry, `display` the status line and `env_name`
    /// the environment the test runs against.
    fn run_test<F>(
        &self,
        key: &str,
        display: &str,
        env_name: &str,
        needs_env: bool,
        mut call: F,
    ) -> Result<usize, RunError>
    where
        F: FnMut(Phase, &mut TestContext<'_>) -> TestResult,
    {
        if needs_env {
            if let Err(e) = self.manager.acquire(env_name) {
                let message = format!("{e:#}");
                self.print_status(display, TestStatus::Error);
                self.print_exception(&TestError::Other(e));
                self.failures.add(key, [message]);
                self.completed.fetch_add(1, Ordering::SeqCst);
                return Ok(0);
            }
        }

        let entry = self.manager.current();
        let baseline = entry.as_ref().map_or(0, |env| env.failed_assertion_count());

        let mut ctx = self.context(env_name);
        let outcome = guarded(|| call(Phase::Before, &mut ctx))
            .and_then(|()| guarded(|| call(Phase::Body, &mut ctx)));

        let escalate = self.config.exit_on_failure
            && matches!(&outcome, Err(e) if !e.is_skip());
        let outcome = if escalate {
            outcome
        } else {
            let after = guarded(|| call(Phase::After, &mut ctx));
            match (outcome, after) {
                (Ok(()), Err(e)) => Err(e),
                (outcome, _) => outcome,
            }
        };
        drop(ctx);

        // The counter is compared against its entry value only when the env survived
        let current = self.manager.current();
        let since = match (&entry, &current) {
            (Some(a), Some(b)) if Arc::ptr_eq(a, b) => baseline,
            _ => 0,
        };
        let (delta, mut recorded) = match &current {
            Some(env) => (
                env.failed_assertion_count().saturating_sub(since),
                env.assertions().summary_since(since),
            ),
            None => (0, Vec::new()),
        };

        self.completed.fetch_add(1, Ordering::SeqCst);
        let failed = match outcome {
            Err(TestError::Skip(reason)) => {
                debug!("{} skipped: {}", key, reason);
                self.print_status(display, TestStatus::Skip);
                return Ok(0);
            }
            Err(e) => {
                match &e {
                    TestError::Assertion(message) => {
                        self.print_status(display, TestStatus::Fail);
                        if recorded.is_empty() {
                            recorded.push(message.clone());
                        }
                    }
                    _ => {
                        self.print_status(display, TestStatus::Error);
                        self.print_exception(&e);
                        recorded.push(format!("{e:#}"));
                    }
                }
                self.failures.add(key, recorded);

                if escalate {
                    info!("{} failed with exit-on-failure set, aborting", key);
                    self.manager.take_down(true)?;
                    return Err(RunError::ExitOnFailure {
                        test_name: key.to_string(),
                    });
                }
                delta.max(1)
            }
            Ok(()) if delta > 0 => {
                self.print_status(display, TestStatus::Fail);
                self.failures.add(key, recorded);
                delta
            }
            Ok(()) if current.is_none() => {
                self.print_status(display, TestStatus::Fail);
                self.failures.add(key, [ENV_DESTROYED.to_string()]);
                1
            }
            Ok(()) => 0,
        };

        if failed > 0 && self.config.stop_on_failure {
            self.pause_on_failure();
        }
        if failed == 0 {
            self.print_status(display, TestStatus::Pass);
        }
        Ok(failed)
    }

    /// Give the operator time to inspect the environment before teardown
    fn pause_on_failure(&self) {
        if self.config.interactive_debugger {
            while self.manager.current().is_some_and(|env| env.is_up()) {
                std::thread::sleep(Duration::from_secs(1));
            }
        }
        self.console
            .println("press any button to move to the next test");
        let mut line = String::new();
        let _ = std::io::stdin().read_line(&mut line);
    }

    /// Timeout path: crash the environment and record the timeout. Never waits on the
    /// test thread.
    pub fn record_timeout(&self, test_name: &str) -> anyhow::Result<()> {
        panic::catch_unwind(AssertUnwindSafe(|| {
            self.completed.fetch_add(1, Ordering::SeqCst);
            self.manager.force_crash();
            self.print_status(test_name, TestStatus::Fail);
            self.failures.add(test_name, [TEST_TIMEOUT.to_string()]);
        }))
        .map_err(|payload| {
            anyhow::anyhow!("timeout handling panicked: {}", panic_message(&*payload))
        })
    }

    /// Print the failures recorded so far
    pub fn print_failures(&self) {
        self.console
            .print_raw(&self.failures.render(&self.console.paint()));
    }

    fn print_status(&self, display: &str, status: TestStatus) {
        self.console
            .println(self.console.paint().status_line(display, status));
    }

    fn print_exception(&self, err: &TestError) {
        let paint = self.console.paint();
        self.console.println(format!(
            "\t{}",
            paint.bred(&format!("Unhandled exception: {err:#}"))
        ));
        if let TestError::Other(inner) = err {
            let trace = inner.backtrace();
            if trace.status() == BacktraceStatus::Captured {
                self.console.println(trace.to_string());
            }
        }
    }
}

/// Run `f`, turning a panic into an error
fn guarded<T, F>(f: F) -> Result<T, TestError>
where
    F: FnOnce() -> Result<T, TestError>,
{
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => Err(TestError::Other(anyhow::anyhow!(
            "test panicked: {}",
            panic_message(&*payload)
        ))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Registry, TestSuite};
    use crate::results::GENERIC_FAILURE_NOTICE;
    use crate::testing::ScriptedFactory;

    fn runner_with(config: RunConfig, factory: &ScriptedFactory) -> ExecutionUnitRunner {
        ExecutionUnitRunner::new(
            Arc::new(config),
            Arc::new(factory.clone()),
            FailureAggregator::new(),
            Console::buffered(false),
        )
    }

    fn run(runner: &ExecutionUnitRunner, registry: &Registry, name: &str) -> Result<usize, RunError> {
        let unit = registry.get(name).unwrap();
        runner.run_single_test(unit, Box::new(|| Ok(())))
    }

    fn pass(ctx: &mut TestContext<'_>) -> TestResult {
        ctx.env()?.assertions().check_eq(5, 5)
    }

    fn soft_assertion(ctx: &mut TestContext<'_>) -> TestResult {
        ctx.env()?.assertions().check_eq(4, 5)
    }

    fn generic_error(_ctx: &mut TestContext<'_>) -> TestResult {
        Err(anyhow::anyhow!("connection reset by peer").into())
    }

    fn panicking(_ctx: &mut TestContext<'_>) -> TestResult {
        panic!("index out of bounds")
    }

    fn skipping(_ctx: &mut TestContext<'_>) -> TestResult {
        Err(TestError::skip("needs a cluster"))
    }

    fn no_env(_ctx: &mut TestContext<'_>) -> TestResult {
        Ok(())
    }

    fn destroys_env(ctx: &mut TestContext<'_>) -> TestResult {
        ctx.env()?;
        ctx.stop_env().map_err(anyhow::Error::from)?;
        Ok(())
    }

    #[test]
    fn test_classification() {
        let factory = ScriptedFactory::new();
        let runner = runner_with(RunConfig::default(), &factory);
        let registry = Registry::new()
            .function("pass", pass)
            .function("assertion", soft_assertion)
            .function("error", generic_error)
            .function("panic", panicking)
            .function("skip", skipping);

        for name in ["pass", "assertion", "error", "panic", "skip"] {
            assert_eq!(run(&runner, &registry, name).unwrap(), 1);
        }

        let record = runner.failures().snapshot();
        assert_eq!(record.len(), 3);
        assert_eq!(
            record.get("assertion"),
            Some(&["expected 5 got 4".to_string()][..])
        );
        assert_eq!(
            record.get("error"),
            Some(&["connection reset by peer".to_string()][..])
        );
        assert!(record.get("panic").unwrap()[0].contains("index out of bounds"));
        assert!(!record.contains("skip"));
        assert_eq!(runner.completed(), 5);

        let output = runner.console().take_buffer();
        assert!(output.contains("pass:\n\t[PASS]"));
        assert!(output.contains("assertion:\n\t[FAIL]"));
        assert!(output.contains("error:\n\t[ERROR]"));
        assert!(output.contains("skip:\n\t[SKIP]"));
    }

    #[test]
    fn test_environment_lost() {
        let factory = ScriptedFactory::new();
        let runner = runner_with(RunConfig::default(), &factory);
        let registry = Registry::new()
            .plain("no_env", no_env)
            .function("destroys_env", destroys_env);

        run(&runner, &registry, "no_env").unwrap();
        run(&runner, &registry, "destroys_env").unwrap();

        let record = runner.failures().snapshot();
        assert_eq!(record.get("no_env"), Some(&[ENV_DESTROYED.to_string()][..]));
        assert!(record.contains("destroys_env"));
    }

    #[test]
    fn test_env_factory_failure() {
        let factory = ScriptedFactory::new().failing();
        let runner = runner_with(RunConfig::default(), &factory);
        let registry = Registry::new().function("t1", pass);

        assert_eq!(run(&runner, &registry, "t1").unwrap(), 1);
        assert!(runner.failures().snapshot().contains("t1"));
        assert!(runner
            .console()
            .take_buffer()
            .contains("server binary not found"));
    }

    #[test]
    fn test_error_counts_once_when_counter_rose() {
        fn assert_then_error(ctx: &mut TestContext<'_>) -> TestResult {
            let env = ctx.env()?;
            env.assertions().check(false, "first")?;
            env.assertions().check(false, "second")?;
            Err(anyhow::anyhow!("then it blew up").into())
        }

        let factory = ScriptedFactory::new();
        let runner = runner_with(RunConfig::default(), &factory);
        let unit = TestUnit::function("t", assert_then_error);

        runner.run_single_test(&unit, Box::new(|| Ok(()))).unwrap();
        assert_eq!(
            runner.failures().snapshot().get("t").unwrap(),
            &["first", "second", "then it blew up"]
        );
    }

    struct Keyspace {
        log: Vec<&'static str>,
    }

    static SUITE_LOG: std::sync::Mutex<Vec<String>> = std::sync::Mutex::new(Vec::new());

    impl TestSuite for Keyspace {
        fn set_up(&mut self, _ctx: &mut TestContext<'_>) -> TestResult {
            self.log.push("set_up");
            Ok(())
        }

        fn tear_down(&mut self, _ctx: &mut TestContext<'_>) -> TestResult {
            self.log.push("tear_down");
            SUITE_LOG.lock().unwrap().push(self.log.join(","));
            self.log.clear();
            Ok(())
        }

        fn sub_tests(&self) -> Vec<&'static str> {
            vec!["test_set", "test_missing"]
        }

        fn run_sub_test(&mut self, name: &str, ctx: &mut TestContext<'_>) -> TestResult {
            self.log.push("body");
            let env = ctx.env()?;
            match name {
                "test_set" => env.assertions().check(true, "set"),
                _ => env.assertions().check(false, "key should exist"),
            }
        }
    }

    fn keyspace(ctx: &mut TestContext<'_>) -> Result<Box<dyn TestSuite>, TestError> {
        ctx.env()?;
        Ok(Box::new(Keyspace { log: Vec::new() }))
    }

    fn broken_suite(_ctx: &mut TestContext<'_>) -> Result<Box<dyn TestSuite>, TestError> {
        Err(anyhow::anyhow!("constructor failed").into())
    }

    #[test]
    fn test_suite_runs_sub_tests_with_hooks() {
        let factory = ScriptedFactory::new();
        let runner = runner_with(RunConfig::default(), &factory);
        let unit = TestUnit::suite("Keyspace", keyspace);

        assert_eq!(runner.run_single_test(&unit, Box::new(|| Ok(()))).unwrap(), 2);

        assert_eq!(
            *SUITE_LOG.lock().unwrap(),
            vec!["set_up,body,tear_down", "set_up,body,tear_down"]
        );
        let record = runner.failures().snapshot();
        assert_eq!(
            record.get("Keyspace:test_missing"),
            Some(&["key should exist".to_string()][..])
        );
        assert!(!record.contains("Keyspace:test_set"));
        // One env for the whole suite, torn down at the end
        assert_eq!(factory.created(), 1);
        assert!(runner.manager().current().is_none());
    }

    #[test]
    fn test_suite_init_failure() {
        let factory = ScriptedFactory::new();
        let runner = runner_with(RunConfig::default(), &factory);
        let unit = TestUnit::suite("Broken", broken_suite);

        assert_eq!(runner.run_single_test(&unit, Box::new(|| Ok(()))).unwrap(), 0);
        let record = runner.failures().snapshot();
        assert_eq!(record.get("Broken [__init__]"), Some(&[][..]));
        assert!(runner
            .failures()
            .render(&crate::output::Paint::plain())
            .contains(GENERIC_FAILURE_NOTICE));
    }

    #[test]
    fn test_exit_on_failure_escalates() {
        let factory = ScriptedFactory::new();
        let config = RunConfig {
            exit_on_failure: true,
            env: crate::config::EnvSettings {
                exit_on_failure: true,
                ..Default::default()
            },
            ..Default::default()
        };
        let runner = runner_with(config, &factory);
        let unit = TestUnit::function("t2", soft_assertion);

        match runner.run_single_test(&unit, Box::new(|| Ok(()))) {
            Err(RunError::ExitOnFailure { test_name }) => assert_eq!(test_name, "t2"),
            other => panic!("Expected exit-on-failure, got {other:?}"),
        }
        assert_eq!(
            runner.failures().snapshot().get("t2"),
            Some(&["expected 5 got 4".to_string()][..])
        );
        assert_eq!(factory.env(0).stops(), 1);
        assert!(runner.manager().current().is_none());
    }

    #[test]
    fn test_record_timeout() {
        let factory = ScriptedFactory::new();
        let runner = runner_with(RunConfig::default(), &factory);
        runner.manager().acquire("slow").unwrap();

        runner.record_timeout("slow").unwrap();
        assert!(factory.env(0).crashed());
        assert_eq!(
            runner.failures().snapshot().get("slow"),
            Some(&[TEST_TIMEOUT.to_string()][..])
        );
        assert_eq!(runner.completed(), 1);
    }
}
