//! Environment lifecycle
//!
//! The manager is the only place an environment is stood up, reused or torn down.
//! It keeps the current environment in a short-held slot so the timeout path can
//! reach it without waiting on a wedged test thread.

use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

use super::{EnvFactory, EnvRequest, Environment};
use crate::config::{EnvSettings, RunConfig};
use crate::error::RunError;
use crate::models::TestStatus;
use crate::output::Console;
use crate::results::FailureAggregator;

/// Failure key for errors raised while disposing a reused environment
pub const ENV_DTOR: &str = "[env dtor]";

/// How environments are disposed of
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EnvPolicy {
    /// Flush and keep the environment between tests
    pub reuse: bool,
    /// Record a failure when the server does not exit cleanly
    pub require_clean_exit: bool,
    /// A dirty exit aborts the run
    pub fatal_dirty_exit: bool,
    /// Print diagnostics around a crash
    pub verbose_on_failure: bool,
}

impl EnvPolicy {
    pub fn from_config(config: &RunConfig) -> Self {
        Self {
            reuse: config.env_reuse,
            require_clean_exit: config.require_clean_exit,
            fatal_dirty_exit: config.check_exitcode,
            verbose_on_failure: config.verbose_information_on_failure,
        }
    }
}

struct CurrentEnv {
    env: Arc<dyn Environment>,
    test_name: String,
}

/// Owner of a worker's current environment
pub struct EnvironmentManager {
    factory: Arc<dyn EnvFactory>,
    settings: EnvSettings,
    policy: EnvPolicy,
    current: Mutex<Option<CurrentEnv>>,
    failures: FailureAggregator,
    console: Console,
}

impl EnvironmentManager {
    pub fn new(
        factory: Arc<dyn EnvFactory>,
        settings: EnvSettings,
        policy: EnvPolicy,
        failures: FailureAggregator,
        console: Console,
    ) -> Self {
        Self {
            factory,
            settings,
            policy,
            current: Mutex::new(None),
            failures,
            console,
        }
    }

    fn slot(&self) -> MutexGuard<'_, Option<CurrentEnv>> {
        self.current.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The current environment, built through the factory when there is none.
    ///
    /// A new environment is slotted before it is waited on, so a timeout during
    /// startup can still crash it.
    pub fn acquire(&self, test_name: &str) -> anyhow::Result<Arc<dyn Environment>> {
        if let Some(current) = self.slot().as_mut() {
            debug!("Reusing environment for {}", test_name);
            current.test_name = test_name.to_string();
            return Ok(current.env.clone());
        }

        // Built outside the lock, the timeout path must never wait on a slow factory
        info!("Starting environment for {}", test_name);
        let env: Arc<dyn Environment> = Arc::from(self.factory.create(&EnvRequest {
            test_name,
            settings: &self.settings,
            console: &self.console,
        })?);

        *self.slot() = Some(CurrentEnv {
            env: env.clone(),
            test_name: test_name.to_string(),
        });

        if let Err(e) = env.wait_ready() {
            if let Err(stop_err) = env.stop() {
                warn!("Failed to stop environment of {}: {:#}", test_name, stop_err);
            }
            self.release(&env);
            return Err(e.context(format!("Environment for {test_name} did not start")));
        }
        Ok(env)
    }

    pub fn current(&self) -> Option<Arc<dyn Environment>> {
        self.slot().as_ref().map(|c| c.env.clone())
    }

    pub fn current_test_name(&self) -> Option<String> {
        self.slot().as_ref().map(|c| c.test_name.clone())
    }

    fn release(&self, env: &Arc<dyn Environment>) {
        let mut slot = self.slot();
        if slot.as_ref().is_some_and(|c| Arc::ptr_eq(&c.env, env)) {
            *slot = None;
        }
    }

    /// Dispose of the current environment.
    ///
    /// With reuse on and no full shutdown a successful flush keeps it alive. Otherwise it
    /// is stopped and, under the clean-exit contract, its exit status is checked. A dirty
    /// exit is fatal only when `fatal_dirty_exit` is set.
    pub fn take_down(&self, full_shutdown: bool) -> Result<(), RunError> {
        let Some((env, test_name)) = self
            .slot()
            .as_ref()
            .map(|c| (c.env.clone(), c.test_name.clone()))
        else {
            return Ok(());
        };

        if self.policy.reuse && !full_shutdown {
            match env.flush() {
                Ok(()) => {
                    debug!("Flushed environment of {}, keeping it", test_name);
                    return Ok(());
                }
                Err(e) => {
                    if let Err(stop_err) = env.stop() {
                        warn!("Failed to stop environment: {:#}", stop_err);
                    }
                    self.report_dtor_failure(&e);
                }
            }
        }

        let mut flush_ok = true;
        if env.is_up() {
            if let Err(e) = env.flush() {
                debug!("Flush before stop failed: {:#}", e);
                flush_ok = false;
            }
        }
        if let Err(e) = env.stop() {
            warn!("Failed to stop environment of {}: {:#}", test_name, e);
        }
        self.release(&env);
        info!("Environment of {} is down", test_name);

        if self.policy.require_clean_exit && (!env.check_exit_code() || !flush_ok) {
            let paint = self.console.paint();
            self.console
                .println(format!("\t{}", paint.bred("Redis did not exit cleanly")));
            self.failures
                .add(&test_name, ["redis process failure".to_string()]);
            if self.policy.fatal_dirty_exit {
                return Err(RunError::DirtyExit { test_name });
            }
        }

        Ok(())
    }

    fn report_dtor_failure(&self, err: &anyhow::Error) {
        let paint = self.console.paint();
        self.console
            .println(paint.status_line(ENV_DTOR, TestStatus::Error));
        self.console.println(format!(
            "\t{}",
            paint.bred(&format!("Unhandled exception: {err:#}"))
        ));
        self.failures.add(ENV_DTOR, [format!("{err:#}")]);
    }

    /// Crash the current environment after a timeout. Errors are printed, never returned.
    pub fn force_crash(&self) {
        let Some(env) = self.current() else {
            return;
        };

        if !self.policy.verbose_on_failure {
            if let Err(e) = env.force_crash() {
                self.console.println(format!("Failed {e:#}"));
            }
            return;
        }

        // A wedged server will not answer, so only after-dispose information is collected
        let verbose = env.force_crash().and_then(|()| {
            let after = env.diagnostics_after_dispose()?;
            let info = serde_json::json!({ "after_dispose": after });
            Ok(serde_json::to_string_pretty(&info)?)
        });
        match verbose {
            Ok(text) => env.debug_print(&text.replace("\\n", "\n"), true),
            Err(e) => self.console.println(format!("Failed {e:#}")),
        }
    }

    /// Guard that disposes of the environment when the test scope ends
    pub fn scope(&self) -> EnvScope<'_> {
        EnvScope {
            manager: self,
            finished: false,
        }
    }
}

/// Disposes of the current environment on every exit path of a test
pub struct EnvScope<'a> {
    manager: &'a EnvironmentManager,
    finished: bool,
}

impl EnvScope<'_> {
    pub fn finish(mut self) -> Result<(), RunError> {
        self.finished = true;
        self.manager.take_down(false)
    }
}

impl Drop for EnvScope<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(e) = self.manager.take_down(false) {
            error!("Environment teardown failed: {}", e);
        }
    }
}
