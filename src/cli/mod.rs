//! CLI argument parsing
//!
//! Defines command-line interface using clap.

use clap::{Parser, ValueEnum};
use std::path::PathBuf;

/// Deployment the tests run against
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EnvKind {
    /// Launch a standalone server per environment
    #[default]
    Oss,
    /// Connect to a server someone else manages
    ExistingEnv,
}

/// Test framework for a database server and its modules
#[derive(Parser, Debug, Default)]
#[command(name = "rltest")]
#[command(version)]
#[command(about = "Test framework for a database server and its modules")]
#[command(long_about = None)]
pub struct Args {
    /// Env on which to run the tests
    #[arg(short, long, value_enum)]
    pub env: Option<EnvKind>,

    /// Path to a module to load. Repeat for several modules.
    #[arg(long)]
    pub module: Vec<String>,

    /// Arguments for the module at the same position (space separated)
    #[arg(long)]
    pub module_args: Vec<String>,

    /// Server port
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Address of an existing env, used with --env existing-env
    #[arg(long)]
    pub existing_env_addr: Option<String>,

    /// Path to the server binary
    #[arg(long)]
    pub server_path: Option<String>,

    /// Wait for a keypress after a failing test, before teardown
    #[arg(long)]
    pub stop_on_failure: bool,

    /// Stop test execution and exit on first failure
    #[arg(short = 'x', long)]
    pub exit_on_failure: bool,

    /// Print more information about the tests
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Test to run. Repeat for several tests.
    #[arg(short, long = "test", value_name = "TEST")]
    pub tests: Vec<String>,

    /// File listing tests to run, one per line
    #[arg(short = 'f', long = "tests-file", value_name = "FILE")]
    pub tests_files: Vec<PathBuf>,

    /// Destination file for failed tests
    #[arg(short = 'F', long, value_name = "FILE")]
    pub failed_tests_file: Option<PathBuf>,

    /// Start the env but do not run any tests
    #[arg(long)]
    pub env_only: bool,

    /// Delete the log directory before the execution
    #[arg(long)]
    pub clear_logs: bool,

    /// Directory to write server logs to
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// Per-test timeout in seconds, 0 means no timeout
    #[arg(long)]
    pub test_timeout: Option<u64>,

    /// Reuse the env between tests when it can be flushed
    #[arg(short = 'r', long)]
    pub env_reuse: bool,

    /// Print environment debug messages
    #[arg(long)]
    pub debug_print: bool,

    /// Run the server under valgrind
    #[arg(long = "use-valgrind", alias = "vg")]
    pub use_valgrind: bool,

    /// Valgrind suppressions file
    #[arg(long)]
    pub vg_suppressions: Option<PathBuf>,

    /// Valgrind options
    #[arg(long)]
    pub vg_options: Option<String>,

    /// Do not perform a leak check
    #[arg(long)]
    pub vg_no_leakcheck: bool,

    /// Do not fail tests on valgrind reported errors
    #[arg(long)]
    pub vg_no_fail_on_errors: bool,

    /// Show valgrind output on screen instead of logging it
    #[arg(long)]
    pub vg_verbose: bool,

    /// Run the server under a debugger, interactively. Implies --no-output-catch and
    /// --stop-on-failure and allows a single test only.
    #[arg(short, long)]
    pub interactive_debugger: bool,

    /// Command line used as the interactive debugger
    #[arg(long)]
    pub debugger: Option<String>,

    /// Write all output to stdout, no capture. Implies --no-progress.
    #[arg(short = 's', long)]
    pub no_output_catch: bool,

    /// Do not show the progress bar
    #[arg(long)]
    pub no_progress: bool,

    /// Print environment diagnostics when a test fails
    #[arg(long)]
    pub verbose_information_on_failure: bool,

    /// Fail the run when the server does not exit cleanly
    #[arg(long)]
    pub check_exitcode: bool,

    /// Pick a random base port instead of the default one
    #[arg(long)]
    pub randomize_ports: bool,

    /// Number of worker processes
    #[arg(long)]
    pub parallelism: Option<usize>,

    /// Print the selected tests and exit
    #[arg(long)]
    pub collect_only: bool,

    /// Configuration file (yaml or json)
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Framework log level (trace, debug, info, warn, error)
    #[arg(long, value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Internal: run as worker with the given index
    #[arg(long, hide = true)]
    pub worker: Option<usize>,
}
