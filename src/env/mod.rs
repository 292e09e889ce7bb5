//! Subject-under-test environments
//!
//! An `Environment` is a handle on a running server (or group of servers). The
//! orchestrator never builds one directly; it asks an `EnvFactory` through the
//! `EnvironmentManager`, which owns the "current" environment of a worker.

mod connection;
mod lifecycle;
mod process;

pub use connection::{Connection, ConnectionError, Reply};
pub use lifecycle::{EnvPolicy, EnvScope, EnvironmentManager};
pub use process::{ProcessEnvironment, ServerEnvFactory};

use serde_json::Value;
use std::fmt::Debug;
use std::sync::{Mutex, MutexGuard};

use crate::config::EnvSettings;
use crate::models::{TestError, TestResult};
use crate::output::Console;

/// Handle on a running subject-under-test.
///
/// Methods take `&self`: the timeout path reaches the environment from the watchdog
/// thread while the test thread may still hold it.
pub trait Environment: Send + Sync {
    /// Block until the environment accepts work. Runs after the handle is reachable
    /// from the timeout path, so `force_crash` may interrupt it.
    fn wait_ready(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn is_up(&self) -> bool;

    /// Stop every process of the environment. Stopping twice is a no-op.
    fn stop(&self) -> anyhow::Result<()>;

    /// Cheap reset that keeps the processes alive
    fn flush(&self) -> anyhow::Result<()>;

    /// Whether the processes exited cleanly. Meaningful after `stop`.
    fn check_exit_code(&self) -> bool;

    fn assertions(&self) -> &AssertionLog;

    fn failed_assertion_count(&self) -> usize {
        self.assertions().count()
    }

    fn assertion_failure_summary(&self) -> Vec<String> {
        self.assertions().summary()
    }

    /// Collected while the environment is still up
    fn diagnostics_before_dispose(&self) -> anyhow::Result<Value> {
        Ok(Value::Null)
    }

    /// Collected once the environment is down, e.g. log tails
    fn diagnostics_after_dispose(&self) -> anyhow::Result<Value> {
        Ok(Value::Null)
    }

    /// Print environment debug output; `force` prints even without `--debug-print`
    fn debug_print(&self, text: &str, force: bool);

    /// Kill the processes so they dump their own state (SIGSEGV for a server)
    fn force_crash(&self) -> anyhow::Result<()>;

    fn connection(&self) -> anyhow::Result<Connection> {
        anyhow::bail!("this environment does not expose connections")
    }
}

/// What a factory gets to build one environment
pub struct EnvRequest<'a> {
    pub test_name: &'a str,
    pub settings: &'a EnvSettings,
    pub console: &'a Console,
}

/// Builds environments for tests that ask for one.
///
/// `create` returns once the processes are spawned; waiting for them belongs in
/// [`Environment::wait_ready`].
pub trait EnvFactory: Send + Sync {
    fn create(&self, request: &EnvRequest<'_>) -> anyhow::Result<Box<dyn Environment>>;
}

impl<F> EnvFactory for F
where
    F: Fn(&EnvRequest<'_>) -> anyhow::Result<Box<dyn Environment>> + Send + Sync,
{
    fn create(&self, request: &EnvRequest<'_>) -> anyhow::Result<Box<dyn Environment>> {
        self(request)
    }
}

/// Cumulative assertion failures of one environment
#[derive(Debug, Default)]
pub struct AssertionLog {
    failures: Mutex<Vec<String>>,
    /// Raise on the first failed check instead of recording and continuing
    fail_fast: bool,
}

impl AssertionLog {
    pub fn new(fail_fast: bool) -> Self {
        Self {
            failures: Mutex::new(Vec::new()),
            fail_fast,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<String>> {
        self.failures.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record `message` when `cond` is false
    pub fn check(&self, cond: bool, message: impl Into<String>) -> TestResult {
        if cond {
            return Ok(());
        }
        let message = message.into();
        self.record(message.clone());
        if self.fail_fast {
            return Err(TestError::Assertion(message));
        }
        Ok(())
    }

    pub fn check_eq<T: PartialEq + Debug>(&self, actual: T, expected: T) -> TestResult {
        let equal = actual == expected;
        self.check(equal, format!("expected {expected:?} got {actual:?}"))
    }

    pub fn record(&self, message: impl Into<String>) {
        self.lock().push(message.into());
    }

    pub fn count(&self) -> usize {
        self.lock().len()
    }

    pub fn summary(&self) -> Vec<String> {
        self.lock().clone()
    }

    /// Failures recorded after the first `start` ones
    pub fn summary_since(&self, start: usize) -> Vec<String> {
        self.lock().iter().skip(start).cloned().collect()
    }
}
