//! In-memory environments for unit tests

use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::env::{AssertionLog, EnvFactory, EnvRequest, Environment};
use crate::output::Console;

#[derive(Clone, Copy, Debug, Default)]
struct Behavior {
    failing_flush: bool,
    dirty_exit: bool,
    slow_start: bool,
}

struct EnvState {
    behavior: Behavior,
    up: AtomicBool,
    stops: AtomicUsize,
    flushes: AtomicUsize,
    crashed: AtomicBool,
    assertions: AssertionLog,
    console: Console,
}

/// Environment whose failures are scripted. Clones share state.
#[derive(Clone)]
pub struct ScriptedEnv {
    state: Arc<EnvState>,
}

impl ScriptedEnv {
    pub fn new() -> Self {
        Self::build(Behavior::default(), false, Console::buffered(false))
    }

    fn build(behavior: Behavior, fail_fast: bool, console: Console) -> Self {
        Self {
            state: Arc::new(EnvState {
                behavior,
                up: AtomicBool::new(true),
                stops: AtomicUsize::new(0),
                flushes: AtomicUsize::new(0),
                crashed: AtomicBool::new(false),
                assertions: AssertionLog::new(fail_fast),
                console,
            }),
        }
    }

    pub fn failing_flush(self) -> Self {
        let mut behavior = self.state.behavior;
        behavior.failing_flush = true;
        Self::build(behavior, false, self.state.console.clone())
    }

    pub fn dirty_exit(self) -> Self {
        let mut behavior = self.state.behavior;
        behavior.dirty_exit = true;
        Self::build(behavior, false, self.state.console.clone())
    }

    /// `wait_ready` blocks until the environment is crashed or stopped, then fails
    pub fn slow_start(self) -> Self {
        let mut behavior = self.state.behavior;
        behavior.slow_start = true;
        Self::build(behavior, false, self.state.console.clone())
    }

    pub fn stops(&self) -> usize {
        self.state.stops.load(Ordering::SeqCst)
    }

    pub fn flushes(&self) -> usize {
        self.state.flushes.load(Ordering::SeqCst)
    }

    pub fn crashed(&self) -> bool {
        self.state.crashed.load(Ordering::SeqCst)
    }
}

impl Environment for ScriptedEnv {
    fn wait_ready(&self) -> anyhow::Result<()> {
        if !self.state.behavior.slow_start {
            return Ok(());
        }
        let start = Instant::now();
        while self.is_up() {
            if start.elapsed() > Duration::from_secs(10) {
                anyhow::bail!("still starting after 10s");
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        anyhow::bail!("server exited during startup")
    }

    fn is_up(&self) -> bool {
        self.state.up.load(Ordering::SeqCst)
    }

    fn stop(&self) -> anyhow::Result<()> {
        if self.state.up.swap(false, Ordering::SeqCst) {
            self.state.stops.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn flush(&self) -> anyhow::Result<()> {
        if self.state.behavior.failing_flush {
            anyhow::bail!("flush refused");
        }
        self.state.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn check_exit_code(&self) -> bool {
        !self.state.behavior.dirty_exit
    }

    fn assertions(&self) -> &AssertionLog {
        &self.state.assertions
    }

    fn diagnostics_before_dispose(&self) -> anyhow::Result<Value> {
        Ok(json!({ "keys": 0 }))
    }

    fn diagnostics_after_dispose(&self) -> anyhow::Result<Value> {
        Ok(json!({ "log_tail": ["scripted shutdown"] }))
    }

    fn debug_print(&self, text: &str, _force: bool) {
        self.state.console.println(text);
    }

    fn force_crash(&self) -> anyhow::Result<()> {
        self.state.crashed.store(true, Ordering::SeqCst);
        self.state.up.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct FactoryState {
    templates: Vec<Behavior>,
    created: Vec<ScriptedEnv>,
    failing: bool,
}

/// Hands out `ScriptedEnv`s, following queued templates first. Clones share state.
#[derive(Clone, Default)]
pub struct ScriptedFactory {
    state: Arc<Mutex<FactoryState>>,
}

impl ScriptedFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the behavior of the next environment to build
    pub fn with_env(self, env: ScriptedEnv) -> Self {
        self.state.lock().unwrap().templates.push(env.state.behavior);
        self
    }

    /// Every `create` call fails
    pub fn failing(self) -> Self {
        self.state.lock().unwrap().failing = true;
        self
    }

    pub fn created(&self) -> usize {
        self.state.lock().unwrap().created.len()
    }

    pub fn env(&self, index: usize) -> ScriptedEnv {
        self.state.lock().unwrap().created[index].clone()
    }
}

impl EnvFactory for ScriptedFactory {
    fn create(&self, request: &EnvRequest<'_>) -> anyhow::Result<Box<dyn Environment>> {
        let mut state = self.state.lock().unwrap();
        if state.failing {
            anyhow::bail!("server binary not found");
        }
        let behavior = if state.templates.is_empty() {
            Behavior::default()
        } else {
            state.templates.remove(0)
        };
        let env = ScriptedEnv::build(
            behavior,
            request.settings.exit_on_failure,
            request.console.clone(),
        );
        state.created.push(env.clone());
        Ok(Box::new(env))
    }
}
