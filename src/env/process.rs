//! Process-backed environments
//!
//! Launches the configured server binary (optionally wrapped by valgrind or an
//! interactive debugger) or attaches to a server someone else runs.

use anyhow::{bail, Context, Result};
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::{AssertionLog, Connection, EnvFactory, EnvRequest, Environment};
use crate::cli::EnvKind;
use crate::config::{DebuggerSettings, EnvSettings};
use crate::output::Console;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const STOP_TIMEOUT: Duration = Duration::from_secs(10);
const POLL_INTERVAL: Duration = Duration::from_millis(100);
const LOG_TAIL_LINES: usize = 50;

/// Builds `ProcessEnvironment`s according to the configured env kind
#[derive(Clone, Copy, Debug, Default)]
pub struct ServerEnvFactory;

impl EnvFactory for ServerEnvFactory {
    fn create(&self, request: &EnvRequest<'_>) -> Result<Box<dyn Environment>> {
        let env = match request.settings.kind {
            EnvKind::Oss => ProcessEnvironment::launch(request)?,
            EnvKind::ExistingEnv => ProcessEnvironment::connect_existing(request)?,
        };
        Ok(Box::new(env))
    }
}

enum ServerProcess {
    Running(Child),
    Exited(ExitStatus),
}

/// A server process, or a connection to an externally managed one
pub struct ProcessEnvironment {
    addr: String,
    /// `None` for an existing env, which is never stopped by us
    process: Option<Mutex<ServerProcess>>,
    log_file: Option<PathBuf>,
    /// How long `wait_ready` waits for PING; `None` waits as long as it takes
    startup_timeout: Option<Duration>,
    assertions: AssertionLog,
    console: Console,
    debug_print: bool,
}

impl ProcessEnvironment {
    /// Spawn the server. `wait_ready` waits until it answers PING.
    pub fn launch(request: &EnvRequest<'_>) -> Result<Self> {
        let settings = request.settings;
        fs::create_dir_all(&settings.log_dir).with_context(|| {
            format!("Failed to create log dir: {}", settings.log_dir.display())
        })?;

        let log_name = format!("{}-{}.log", sanitize(request.test_name), settings.port);
        let mut command = server_command(settings, &log_name, request.test_name);
        if settings.no_output_catch {
            command.stdout(Stdio::inherit()).stderr(Stdio::inherit());
        } else {
            command.stdout(Stdio::null()).stderr(Stdio::null());
        }
        command.stdin(Stdio::null());

        info!("Launching {:?}", command);
        let child = command
            .spawn()
            .with_context(|| format!("Failed to launch {}", settings.server_path))?;

        Ok(Self {
            addr: format!("127.0.0.1:{}", settings.port),
            process: Some(Mutex::new(ServerProcess::Running(child))),
            log_file: Some(settings.log_dir.join(log_name)),
            startup_timeout: startup_timeout(&settings.debugger),
            assertions: AssertionLog::new(settings.exit_on_failure),
            console: request.console.clone(),
            debug_print: settings.debug_print,
        })
    }

    /// Attach to a running server. Stop leaves it running.
    pub fn connect_existing(request: &EnvRequest<'_>) -> Result<Self> {
        let settings = request.settings;
        let env = Self {
            addr: settings.existing_addr.clone(),
            process: None,
            log_file: None,
            startup_timeout: None,
            assertions: AssertionLog::new(settings.exit_on_failure),
            console: request.console.clone(),
            debug_print: settings.debug_print,
        };
        env.connection()?
            .ping()
            .with_context(|| format!("Existing env at {} is not reachable", env.addr))?;
        Ok(env)
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    fn lock(process: &Mutex<ServerProcess>) -> MutexGuard<'_, ServerProcess> {
        process.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn wait_until_up(&self, timeout: Option<Duration>) -> Result<()> {
        let start = Instant::now();
        loop {
            if let Some(process) = &self.process {
                let mut state = Self::lock(process);
                if let ServerProcess::Running(child) = &mut *state {
                    if let Some(status) = child.try_wait()? {
                        *state = ServerProcess::Exited(status);
                    }
                }
                // Also reached when a timeout crashed the server while it was starting
                if let ServerProcess::Exited(status) = &*state {
                    bail!(
                        "Server exited during startup with {}{}",
                        status,
                        self.log_tail_hint()
                    );
                }
            }

            if let Ok(mut conn) = Connection::open(&self.addr, CONNECT_TIMEOUT) {
                if conn.ping().is_ok() {
                    debug!("Server at {} is up", self.addr);
                    return Ok(());
                }
            }

            if timeout.is_some_and(|t| start.elapsed() > t) {
                bail!(
                    "Server at {} did not come up within {:?}{}",
                    self.addr,
                    start.elapsed(),
                    self.log_tail_hint()
                );
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    fn log_tail_hint(&self) -> String {
        match &self.log_file {
            Some(path) => format!(", see {}", path.display()),
            None => String::new(),
        }
    }

    /// Block until the child exits or `timeout` elapses
    fn wait_exit(child: &mut Child, timeout: Duration) -> Result<Option<ExitStatus>> {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if let Some(status) = child.try_wait()? {
                return Ok(Some(status));
            }
            std::thread::sleep(POLL_INTERVAL);
        }
        Ok(None)
    }

    fn signal(&self, sig: Signal) -> Result<()> {
        let Some(process) = &self.process else {
            bail!("can not signal an existing env at {}", self.addr);
        };
        let mut state = Self::lock(process);
        let ServerProcess::Running(child) = &mut *state else {
            return Ok(());
        };

        send_signal(child, sig)?;
        let status = match Self::wait_exit(child, STOP_TIMEOUT)? {
            Some(status) => status,
            None => {
                warn!("Server at {} ignored {:?}, killing it", self.addr, sig);
                child.kill()?;
                child.wait()?
            }
        };
        debug!("Server at {} exited with {}", self.addr, status);
        *state = ServerProcess::Exited(status);
        Ok(())
    }
}

impl Environment for ProcessEnvironment {
    fn wait_ready(&self) -> Result<()> {
        if self.process.is_none() {
            return Ok(());
        }
        self.wait_until_up(self.startup_timeout)
    }

    fn is_up(&self) -> bool {
        match &self.process {
            Some(process) => match &mut *Self::lock(process) {
                ServerProcess::Running(child) => matches!(child.try_wait(), Ok(None)),
                ServerProcess::Exited(_) => false,
            },
            None => self
                .connection()
                .and_then(|mut c| Ok(c.ping()?))
                .is_ok(),
        }
    }

    fn stop(&self) -> Result<()> {
        if self.process.is_none() {
            return Ok(());
        }
        self.signal(Signal::Term)
    }

    fn flush(&self) -> Result<()> {
        let reply = self.connection()?.command(&["FLUSHALL"])?;
        if !reply.is_ok() {
            bail!("unexpected FLUSHALL reply: {reply}");
        }
        Ok(())
    }

    fn check_exit_code(&self) -> bool {
        match &self.process {
            Some(process) => match &*Self::lock(process) {
                ServerProcess::Exited(status) => status.success(),
                ServerProcess::Running(_) => false,
            },
            None => true,
        }
    }

    fn assertions(&self) -> &AssertionLog {
        &self.assertions
    }

    fn diagnostics_before_dispose(&self) -> Result<Value> {
        let info = self.connection()?.command(&["INFO", "everything"])?;
        Ok(json!({
            "addr": self.addr,
            "info": info.as_text().unwrap_or_default(),
        }))
    }

    fn diagnostics_after_dispose(&self) -> Result<Value> {
        let Some(path) = &self.log_file else {
            return Ok(Value::Null);
        };
        Ok(json!({
            "log_file": path.display().to_string(),
            "log_tail": tail(path, LOG_TAIL_LINES)?,
        }))
    }

    fn debug_print(&self, text: &str, force: bool) {
        if force || self.debug_print {
            self.console.println(text);
        }
    }

    fn force_crash(&self) -> Result<()> {
        self.signal(Signal::Segv)
    }

    fn connection(&self) -> Result<Connection> {
        Connection::open(&self.addr, CONNECT_TIMEOUT)
            .with_context(|| format!("Failed to connect to {}", self.addr))
    }
}

impl Drop for ProcessEnvironment {
    fn drop(&mut self) {
        if let Some(process) = &self.process {
            if let ServerProcess::Running(child) = &mut *Self::lock(process) {
                let _ = child.kill();
                let _ = child.wait();
            }
        }
    }
}

#[derive(Clone, Copy, Debug)]
enum Signal {
    Term,
    Segv,
}

#[cfg(unix)]
fn send_signal(child: &Child, sig: Signal) -> Result<()> {
    use nix::sys::signal::{kill, Signal as NixSignal};
    use nix::unistd::Pid;

    let sig = match sig {
        Signal::Term => NixSignal::SIGTERM,
        Signal::Segv => NixSignal::SIGSEGV,
    };
    kill(Pid::from_raw(child.id() as i32), sig)
        .with_context(|| format!("Failed to send {sig:?} to pid {}", child.id()))
}

#[cfg(not(unix))]
fn send_signal(child: &mut Child, _sig: Signal) -> Result<()> {
    child.kill().context("Failed to kill server process")
}

fn startup_timeout(debugger: &DebuggerSettings) -> Option<Duration> {
    match debugger {
        DebuggerSettings::None => Some(Duration::from_secs(10)),
        DebuggerSettings::Valgrind { .. } => Some(Duration::from_secs(60)),
        // The operator drives the debugger, the server starts when they say so
        DebuggerSettings::Interactive { .. } => None,
    }
}

fn server_command(settings: &EnvSettings, log_name: &str, test_name: &str) -> Command {
    let mut argv: Vec<String> = match &settings.debugger {
        DebuggerSettings::None => Vec::new(),
        DebuggerSettings::Valgrind {
            options,
            suppressions,
            leakcheck,
            fail_on_errors,
            verbose,
        } => {
            let mut vg = vec!["valgrind".to_string()];
            if *fail_on_errors {
                vg.push("--error-exitcode=255".to_string());
            }
            if *leakcheck {
                vg.extend(options.split_whitespace().map(str::to_string));
            } else {
                vg.push("--leak-check=no".to_string());
            }
            if let Some(supp) = suppressions {
                vg.push(format!("--suppressions={}", supp.display()));
            }
            if !verbose {
                let vg_log = settings
                    .log_dir
                    .join(format!("{}-{}.valgrind.log", sanitize(test_name), settings.port));
                vg.push(format!("--log-file={}", vg_log.display()));
            }
            vg
        }
        DebuggerSettings::Interactive { command } => {
            command.split_whitespace().map(str::to_string).collect()
        }
    };

    argv.push(settings.server_path.clone());
    argv.extend([
        "--port".to_string(),
        settings.port.to_string(),
        "--dir".to_string(),
        settings.log_dir.display().to_string(),
        "--logfile".to_string(),
        log_name.to_string(),
    ]);
    for (i, module) in settings.modules.iter().enumerate() {
        argv.push("--loadmodule".to_string());
        argv.push(module.clone());
        if let Some(args) = settings.module_args.get(i) {
            argv.extend(args.iter().cloned());
        }
    }

    let mut command = Command::new(&argv[0]);
    command.args(&argv[1..]);
    command
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

fn tail(path: &Path, lines: usize) -> Result<Vec<String>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let all: Vec<&str> = content.lines().collect();
    let start = all.len().saturating_sub(lines);
    Ok(all[start..].iter().map(|l| l.to_string()).collect())
}
