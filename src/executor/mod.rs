//! Test execution engine
//!
//! Serial and parallel scheduling over a shared job queue, the per-unit runner and
//! the watchdog that bounds every test.

mod context;
mod parallel;
mod queue;
mod runner;
mod serial;
mod watchdog;
mod worker;

pub use context::TestContext;
pub use parallel::{
    ParallelOutcome, ParallelScheduler, SelfExecLauncher, WorkerLauncher, WORKER_CONFIG_ENV,
    WORKER_LOST,
};
pub use queue::JobQueue;
pub use runner::{ExecutionUnitRunner, ENV_DESTROYED, TEST_TIMEOUT};
pub use serial::run_serial;
pub use watchdog::{Interrupt, Terminator, TimeLimit, TimeoutFn, Watchdog};
pub use worker::run_worker;
