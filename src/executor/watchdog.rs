//! Per-test deadline enforcement
//!
//! A monitor thread watches the deadline of one test. When it passes, the test
//! thread is interrupted at its next checkpoint (it prints its stack and parks for
//! good), the recovery callback runs, and the process is terminated.

use std::backtrace::Backtrace;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::output::Console;

const MONITOR_TICK: Duration = Duration::from_millis(100);
const DEFAULT_GRACE: Duration = Duration::from_secs(5);

/// Recovery work run once the deadline has passed
pub type TimeoutFn = Box<dyn FnOnce() -> anyhow::Result<()> + Send>;

/// Ends the process after a timeout
pub type Terminator = Arc<dyn Fn() + Send + Sync>;

struct InterruptState {
    requested: AtomicBool,
    captured: Mutex<bool>,
    cond: Condvar,
}

/// Cancellation token checked by the test thread at safe points
#[derive(Clone)]
pub struct Interrupt {
    state: Arc<InterruptState>,
}

impl Default for Interrupt {
    fn default() -> Self {
        Self::new()
    }
}

impl Interrupt {
    pub fn new() -> Self {
        Self {
            state: Arc::new(InterruptState {
                requested: AtomicBool::new(false),
                captured: Mutex::new(false),
                cond: Condvar::new(),
            }),
        }
    }

    pub fn request(&self) {
        self.state.requested.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.state.requested.load(Ordering::SeqCst)
    }

    fn captured(&self) -> MutexGuard<'_, bool> {
        self.state.captured.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Safe point. Returns immediately unless a timeout fired, in which case the
    /// stack is printed and the calling thread never runs again.
    pub fn checkpoint(&self, console: &Console) {
        if !self.is_requested() {
            return;
        }

        console.println(Backtrace::force_capture().to_string());
        *self.captured() = true;
        self.state.cond.notify_all();

        // The process is about to be terminated
        loop {
            std::thread::park();
        }
    }

    /// Wait up to `grace` for the test thread to reach a checkpoint
    pub fn wait_captured(&self, grace: Duration) -> bool {
        let guard = self.captured();
        let (guard, _) = self
            .state
            .cond
            .wait_timeout_while(guard, grace, |captured| !*captured)
            .unwrap_or_else(|e| e.into_inner());
        *guard
    }
}

struct Deadline {
    done: bool,
    at: Instant,
}

struct Shared {
    deadline: Mutex<Deadline>,
    cond: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Deadline> {
        self.deadline.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Builds a `TimeLimit` per test
#[derive(Clone)]
pub struct Watchdog {
    timeout: Duration,
    grace: Duration,
    interrupt: Interrupt,
    console: Console,
    terminator: Terminator,
}

impl Watchdog {
    /// `timeout_secs == 0` disables deadlines
    pub fn new(timeout_secs: u64, interrupt: Interrupt, console: Console) -> Self {
        Self {
            timeout: Duration::from_secs(timeout_secs),
            grace: DEFAULT_GRACE,
            interrupt,
            console,
            terminator: Arc::new(|| std::process::exit(1)),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// How long to wait for the test thread's stack before giving up on it
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn with_terminator(mut self, terminator: Terminator) -> Self {
        self.terminator = terminator;
        self
    }

    pub fn is_enabled(&self) -> bool {
        !self.timeout.is_zero()
    }

    /// Start guarding one test
    pub fn arm(&self, timeout_func: TimeoutFn) -> TimeLimit {
        if !self.is_enabled() {
            return TimeLimit {
                shared: None,
                timeout: self.timeout,
                monitor: None,
            };
        }

        let shared = Arc::new(Shared {
            deadline: Mutex::new(Deadline {
                done: false,
                at: Instant::now() + self.timeout,
            }),
            cond: Condvar::new(),
        });

        let monitor = {
            let shared = shared.clone();
            let watchdog = self.clone();
            std::thread::Builder::new()
                .name("rltest-watchdog".to_string())
                .spawn(move || watchdog.monitor(&shared, timeout_func))
        };
        let monitor = match monitor {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!("Failed to start watchdog thread, test runs unguarded: {}", e);
                None
            }
        };

        TimeLimit {
            shared: Some(shared),
            timeout: self.timeout,
            monitor,
        }
    }

    fn monitor(&self, shared: &Shared, timeout_func: TimeoutFn) {
        let mut deadline = shared.lock();
        while !deadline.done && Instant::now() < deadline.at {
            deadline = shared
                .cond
                .wait_timeout(deadline, MONITOR_TICK)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
        if deadline.done {
            return;
        }
        drop(deadline);

        let paint = self.console.paint();
        self.console
            .println(paint.bred("Test Timeout, printing trace."));
        self.interrupt.request();
        if !self.interrupt.wait_captured(self.grace) {
            self.console.println(paint.bred(
                "Stack trace unavailable, the test thread did not reach a checkpoint",
            ));
        }

        if let Err(e) = timeout_func() {
            self.console
                .println(paint.bred(&format!("Failed on timeout function, {e:#}")));
        }
        debug!("Terminating after test timeout");
        (self.terminator)();
    }
}

/// Deadline of the test in flight. Dropping it marks the test done.
pub struct TimeLimit {
    shared: Option<Arc<Shared>>,
    timeout: Duration,
    monitor: Option<JoinHandle<()>>,
}

impl TimeLimit {
    /// Give the next sub-test a fresh budget
    pub fn reset(&self) {
        if let Some(shared) = &self.shared {
            shared.lock().at = Instant::now() + self.timeout;
        }
    }

    pub fn finish(self) {}
}

impl Drop for TimeLimit {
    fn drop(&mut self) {
        let Some(shared) = &self.shared else {
            return;
        };
        shared.lock().done = true;
        shared.cond.notify_all();
        if let Some(monitor) = self.monitor.take() {
            let _ = monitor.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    fn watchdog(console: &Console, interrupt: &Interrupt, exits: &Arc<AtomicUsize>) -> Watchdog {
        let exits = exits.clone();
        Watchdog::new(0, interrupt.clone(), console.clone())
            .with_timeout(Duration::from_millis(200))
            .with_grace(Duration::from_secs(2))
            .with_terminator(Arc::new(move || {
                exits.fetch_add(1, Ordering::SeqCst);
            }))
    }

    #[test]
    fn test_disabled_watchdog_never_fires() {
        let console = Console::buffered(false);
        let watchdog = Watchdog::new(0, Interrupt::new(), console.clone());
        assert!(!watchdog.is_enabled());

        let limit = watchdog.arm(Box::new(|| panic!("must not run")));
        limit.reset();
        limit.finish();
        assert_eq!(console.take_buffer(), "");
    }

    #[test]
    fn test_finish_before_deadline() {
        let console = Console::buffered(false);
        let interrupt = Interrupt::new();
        let exits = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel();

        let limit = watchdog(&console, &interrupt, &exits).arm(Box::new(move || {
            tx.send(()).unwrap();
            Ok(())
        }));
        limit.finish();

        std::thread::sleep(Duration::from_millis(400));
        assert!(rx.try_recv().is_err());
        assert!(!interrupt.is_requested());
        assert_eq!(exits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_timeout_interrupts_and_terminates() {
        let console = Console::buffered(false);
        let interrupt = Interrupt::new();
        let exits = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel();

        let wd = watchdog(&console, &interrupt, &exits);
        let test_thread = {
            let interrupt = interrupt.clone();
            let console = console.clone();
            std::thread::spawn(move || {
                let _limit = wd.arm(Box::new(move || {
                    tx.send(()).unwrap();
                    anyhow::bail!("crash refused")
                }));
                // A wedged test that still passes through checkpoints
                loop {
                    interrupt.checkpoint(&console);
                    std::thread::sleep(Duration::from_millis(10));
                }
            })
        };

        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let start = Instant::now();
        while exits.load(Ordering::SeqCst) == 0 && start.elapsed() < Duration::from_secs(5) {
            std::thread::sleep(Duration::from_millis(10));
        }

        assert_eq!(exits.load(Ordering::SeqCst), 1);
        let output = console.take_buffer();
        assert!(output.starts_with("Test Timeout, printing trace."));
        assert!(output.contains("Failed on timeout function, crash refused"));
        assert!(!output.contains("Stack trace unavailable"));
        assert!(!test_thread.is_finished());
    }

    #[test]
    fn test_timeout_without_checkpoint_reports_missing_stack() {
        let console = Console::buffered(false);
        let interrupt = Interrupt::new();
        let exits = Arc::new(AtomicUsize::new(0));

        let wd = watchdog(&console, &interrupt, &exits).with_grace(Duration::from_millis(100));
        let limit = wd.arm(Box::new(|| Ok(())));

        let start = Instant::now();
        while exits.load(Ordering::SeqCst) == 0 && start.elapsed() < Duration::from_secs(5) {
            std::thread::sleep(Duration::from_millis(10));
        }
        drop(limit);

        assert_eq!(exits.load(Ordering::SeqCst), 1);
        assert!(console.take_buffer().contains("Stack trace unavailable"));
    }

    #[test]
    fn test_reset_extends_deadline() {
        let console = Console::buffered(false);
        let interrupt = Interrupt::new();
        let exits = Arc::new(AtomicUsize::new(0));

        let limit = watchdog(&console, &interrupt, &exits)
            .with_timeout(Duration::from_millis(300))
            .arm(Box::new(|| Ok(())));
        for _ in 0..4 {
            std::thread::sleep(Duration::from_millis(150));
            limit.reset();
        }
        limit.finish();

        assert_eq!(exits.load(Ordering::SeqCst), 0);
        assert!(!interrupt.is_requested());
    }
}
