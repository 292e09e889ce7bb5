//! Per-test context
//!
//! Handed to every test body and suite hook. It is the only road to the
//! environment, and every call through it is a safe point for the watchdog.

use std::sync::Arc;

use super::Interrupt;
use crate::config::RunConfig;
use crate::env::{Environment, EnvironmentManager};
use crate::error::RunError;
use crate::output::Console;

pub struct TestContext<'a> {
    test_name: &'a str,
    manager: &'a EnvironmentManager,
    config: &'a RunConfig,
    interrupt: &'a Interrupt,
    console: &'a Console,
}

impl<'a> TestContext<'a> {
    pub(crate) fn new(
        test_name: &'a str,
        manager: &'a EnvironmentManager,
        config: &'a RunConfig,
        interrupt: &'a Interrupt,
        console: &'a Console,
    ) -> Self {
        Self {
            test_name,
            manager,
            config,
            interrupt,
            console,
        }
    }

    /// Name the environment is registered under (the suite name for sub-tests)
    pub fn test_name(&self) -> &str {
        self.test_name
    }

    /// The current environment, stood up on first use
    pub fn env(&self) -> anyhow::Result<Arc<dyn Environment>> {
        self.checkpoint();
        self.manager.acquire(self.test_name)
    }

    /// The current environment, if any, without building one
    pub fn current_env(&self) -> Option<Arc<dyn Environment>> {
        self.checkpoint();
        self.manager.current()
    }

    /// Fully tear the current environment down; the next `env()` builds a fresh one
    pub fn stop_env(&self) -> Result<(), RunError> {
        self.checkpoint();
        self.manager.take_down(true)
    }

    /// Safe point for the watchdog. Long-running test loops should call it.
    pub fn checkpoint(&self) {
        self.interrupt.checkpoint(self.console);
    }

    pub fn config(&self) -> &RunConfig {
        self.config
    }

    pub fn println(&self, text: impl AsRef<str>) {
        self.console.println(text);
    }
}
