//! Configuration module
//!
//! Resolves CLI flags, `RLTEST_*` environment variables and the optional config file
//! into one immutable `RunConfig`, validated once at startup and passed by reference
//! into every component (and serialized to worker processes).

mod env;
mod file;

pub use env::{EnvBuilder, EnvConfig, EnvGuard};
pub use file::{ConfigFile, FileDefaults};

use serde::{Deserialize, Serialize};
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::cli::{Args, EnvKind};
use crate::error::RunError;

pub const DEFAULT_PORT: u16 = 6379;
pub const DEFAULT_SERVER_PATH: &str = "redis-server";
pub const DEFAULT_LOG_DIR: &str = "./logs";
pub const DEFAULT_EXISTING_ADDR: &str = "localhost:6379";
pub const DEFAULT_VG_OPTIONS: &str = "--leak-check=full --errors-for-leak-kinds=definite";

/// Port distance between workers, enough room for replicas and small clusters
pub const WORKER_PORT_STRIDE: u16 = 30;

/// How the server process is wrapped
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DebuggerSettings {
    #[default]
    None,
    Valgrind {
        options: String,
        suppressions: Option<PathBuf>,
        leakcheck: bool,
        fail_on_errors: bool,
        verbose: bool,
    },
    Interactive {
        command: String,
    },
}

/// Everything an environment factory needs to stand a server up
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvSettings {
    pub kind: EnvKind,
    pub server_path: String,
    pub port: u16,
    pub existing_addr: String,
    pub modules: Vec<String>,
    pub module_args: Vec<Vec<String>>,
    pub log_dir: PathBuf,
    pub debugger: DebuggerSettings,
    pub exit_on_failure: bool,
    pub debug_print: bool,
    pub no_output_catch: bool,
    pub verbose: u8,
}

impl Default for EnvSettings {
    fn default() -> Self {
        Self {
            kind: EnvKind::Oss,
            server_path: DEFAULT_SERVER_PATH.to_string(),
            port: DEFAULT_PORT,
            existing_addr: DEFAULT_EXISTING_ADDR.to_string(),
            modules: Vec::new(),
            module_args: Vec::new(),
            log_dir: PathBuf::from(DEFAULT_LOG_DIR),
            debugger: DebuggerSettings::None,
            exit_on_failure: false,
            debug_print: false,
            no_output_catch: false,
            verbose: 0,
        }
    }
}

/// Immutable run configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunConfig {
    pub parallelism: usize,
    /// Seconds, 0 disables the watchdog
    pub test_timeout: u64,
    pub exit_on_failure: bool,
    pub stop_on_failure: bool,
    pub env_reuse: bool,
    pub check_exitcode: bool,
    /// Clean-exit contract: the server must exit with a clean status when stopped
    pub require_clean_exit: bool,
    pub interactive_debugger: bool,
    pub no_output_catch: bool,
    pub no_progress: bool,
    pub verbose_information_on_failure: bool,
    pub failed_tests_file: Option<PathBuf>,
    pub env_only: bool,
    pub collect_only: bool,
    pub clear_logs: bool,
    /// Color console output, decided once by the driver
    pub colorize: bool,
    /// Requested test names, empty means all
    pub tests: Vec<String>,
    pub env: EnvSettings,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            parallelism: 1,
            test_timeout: 0,
            exit_on_failure: false,
            stop_on_failure: false,
            env_reuse: false,
            check_exitcode: false,
            require_clean_exit: false,
            interactive_debugger: false,
            no_output_catch: false,
            no_progress: false,
            verbose_information_on_failure: false,
            failed_tests_file: None,
            env_only: false,
            collect_only: false,
            clear_logs: false,
            colorize: false,
            tests: Vec::new(),
            env: EnvSettings::default(),
        }
    }
}

impl RunConfig {
    /// Resolve CLI > environment > file > defaults, then validate
    pub fn resolve(args: &Args, env: &EnvConfig, file: &FileDefaults) -> Result<Self, RunError> {
        let kind = args.env.or(file.env).unwrap_or_default();

        let mut port = args
            .port
            .or(env.port)
            .or(file.port)
            .unwrap_or(DEFAULT_PORT);
        if args.randomize_ports {
            port = random_base_port();
        }

        let interactive_debugger = args.interactive_debugger || args.debugger.is_some();
        let use_valgrind = args.use_valgrind || file.use_valgrind.unwrap_or(false);

        let debugger = if use_valgrind {
            DebuggerSettings::Valgrind {
                options: args
                    .vg_options
                    .clone()
                    .or_else(|| std::env::var("VG_OPTIONS").ok())
                    .unwrap_or_else(|| DEFAULT_VG_OPTIONS.to_string()),
                suppressions: args.vg_suppressions.clone(),
                leakcheck: !args.vg_no_leakcheck,
                fail_on_errors: !args.vg_no_fail_on_errors,
                verbose: args.no_output_catch || args.vg_verbose,
            }
        } else if interactive_debugger {
            DebuggerSettings::Interactive {
                command: args.debugger.clone().unwrap_or_else(|| "gdb --args".to_string()),
            }
        } else {
            DebuggerSettings::None
        };

        let mut modules = args.module.clone();
        if modules.is_empty() {
            modules = file.modules.clone();
        }
        let module_args: Vec<Vec<String>> = args
            .module_args
            .iter()
            .map(|a| a.split_whitespace().map(str::to_string).collect())
            .collect();

        // Interactive debugging happens on the terminal, one test at a time
        let no_output_catch = args.no_output_catch || interactive_debugger;
        let stop_on_failure = args.stop_on_failure || interactive_debugger;
        let check_exitcode = args.check_exitcode || file.check_exitcode.unwrap_or(false);
        let exit_on_failure = args.exit_on_failure || file.exit_on_failure.unwrap_or(false);
        let env_reuse = args.env_reuse
            || env.env_reuse.unwrap_or(false)
            || file.env_reuse.unwrap_or(false)
            || kind == EnvKind::ExistingEnv;

        let config = Self {
            parallelism: args
                .parallelism
                .or(env.parallelism)
                .or(file.parallelism)
                .unwrap_or(1),
            test_timeout: args
                .test_timeout
                .or(env.test_timeout)
                .or(file.test_timeout)
                .unwrap_or(0),
            exit_on_failure,
            stop_on_failure,
            env_reuse,
            check_exitcode,
            require_clean_exit: use_valgrind || check_exitcode,
            interactive_debugger,
            no_output_catch,
            no_progress: args.no_progress || no_output_catch,
            verbose_information_on_failure: args.verbose_information_on_failure,
            failed_tests_file: args.failed_tests_file.clone(),
            env_only: args.env_only,
            collect_only: args.collect_only,
            clear_logs: args.clear_logs,
            colorize: std::io::stdout().is_terminal(),
            tests: collect_test_names(&args.tests, &args.tests_files),
            env: EnvSettings {
                kind,
                server_path: args
                    .server_path
                    .clone()
                    .or_else(|| env.server_path.clone())
                    .or_else(|| file.server_path.clone())
                    .unwrap_or_else(|| DEFAULT_SERVER_PATH.to_string()),
                port,
                existing_addr: args
                    .existing_env_addr
                    .clone()
                    .unwrap_or_else(|| DEFAULT_EXISTING_ADDR.to_string()),
                modules,
                module_args,
                log_dir: args
                    .log_dir
                    .clone()
                    .or_else(|| env.log_dir.clone())
                    .or_else(|| file.log_dir.clone())
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_DIR)),
                debugger,
                exit_on_failure,
                debug_print: args.debug_print,
                no_output_catch,
                verbose: args.verbose,
            },
        };

        config.validate(args.module.len(), args.module_args.len())?;
        Ok(config)
    }

    fn validate(&self, module_flags: usize, module_arg_flags: usize) -> Result<(), RunError> {
        if self.env.port == 0 {
            return Err(RunError::config(format!(
                "requested port {} is not valid",
                self.env.port
            )));
        }
        if self.parallelism == 0 {
            return Err(RunError::config("parallelism must be at least 1"));
        }
        if self.parallelism > 1 {
            if self.no_output_catch {
                return Err(RunError::config(
                    "--no-output-catch can not be combined with --parallelism",
                ));
            }
            if self.stop_on_failure {
                return Err(RunError::config(
                    "--stop-on-failure needs the terminal and can not be combined with --parallelism",
                ));
            }
            let last_port = self.env.port as usize
                + (self.parallelism - 1) * WORKER_PORT_STRIDE as usize;
            if last_port > u16::MAX as usize {
                return Err(RunError::config(format!(
                    "port {} leaves no room for {} workers",
                    self.env.port, self.parallelism
                )));
            }
        }

        let existing = self.env.kind == EnvKind::ExistingEnv;
        match &self.env.debugger {
            DebuggerSettings::Valgrind { .. } => {
                if existing {
                    return Err(RunError::config("can not use valgrind with existing-env"));
                }
                if self.interactive_debugger {
                    return Err(RunError::config(
                        "can not use valgrind with interactive debugger",
                    ));
                }
            }
            DebuggerSettings::Interactive { .. } if existing => {
                return Err(RunError::config("can not use debug with existing-env"));
            }
            _ => {}
        }

        if module_flags > 1 && module_arg_flags > 0 && module_flags != module_arg_flags {
            return Err(RunError::config(
                "Using `--module` multiple time implies that you specify the `--module-args` in the the same number",
            ));
        }

        Ok(())
    }

    pub fn is_parallel(&self) -> bool {
        self.parallelism > 1
    }

    /// The configuration handed to worker `index`: its own port range, nothing else changes
    pub fn for_worker(&self, index: usize) -> Self {
        let mut config = self.clone();
        config.env.port = self.env.port + index as u16 * WORKER_PORT_STRIDE;
        config
    }
}

fn random_base_port() -> u16 {
    rand::random_range(10000..50000)
}

/// Names from `-t` flags followed by names listed in `-f` files
pub fn collect_test_names(tests: &[String], files: &[PathBuf]) -> Vec<String> {
    let mut names = tests.to_vec();
    for path in files {
        match read_tests_file(path) {
            Ok(mut listed) => names.append(&mut listed),
            Err(e) => warn!("Test file {} not found: {}", path.display(), e),
        }
    }
    names
}

fn read_tests_file(path: &Path) -> std::io::Result<Vec<String>> {
    let content = std::fs::read_to_string(path)?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use tempfile::tempdir;

    fn resolve(argv: &[&str]) -> Result<RunConfig, RunError> {
        let mut full = vec!["rltest"];
        full.extend_from_slice(argv);
        let args = Args::parse_from(full);
        RunConfig::resolve(&args, &EnvConfig::default(), &FileDefaults::default())
    }

    #[test]
    fn test_default_config() {
        let config = resolve(&[]).unwrap();
        assert_eq!(config.parallelism, 1);
        assert_eq!(config.test_timeout, 0);
        assert_eq!(config.env.port, DEFAULT_PORT);
        assert!(!config.require_clean_exit);
        assert_eq!(config.env.debugger, DebuggerSettings::None);
    }

    #[test]
    fn test_cli_overrides_env_and_file() {
        let args = Args::parse_from(["rltest", "--parallelism", "3"]);
        let env = EnvConfig {
            parallelism: Some(5),
            test_timeout: Some(60),
            ..Default::default()
        };
        let file = FileDefaults {
            parallelism: Some(7),
            test_timeout: Some(90),
            server_path: Some("/opt/redis-server".to_string()),
            ..Default::default()
        };

        let config = RunConfig::resolve(&args, &env, &file).unwrap();
        assert_eq!(config.parallelism, 3);
        assert_eq!(config.test_timeout, 60);
        assert_eq!(config.env.server_path, "/opt/redis-server");
    }

    #[test]
    fn test_interactive_debugger_implications() {
        let config = resolve(&["-i"]).unwrap();
        assert!(config.no_output_catch);
        assert!(config.stop_on_failure);
        assert!(config.no_progress);
        assert!(matches!(
            config.env.debugger,
            DebuggerSettings::Interactive { .. }
        ));
    }

    #[test]
    fn test_clean_exit_contract() {
        assert!(resolve(&["--check-exitcode"]).unwrap().require_clean_exit);
        let config = resolve(&["--use-valgrind", "--vg-no-leakcheck"]).unwrap();
        assert!(config.require_clean_exit);
        assert!(!config.check_exitcode);
        match config.env.debugger {
            DebuggerSettings::Valgrind { leakcheck, .. } => assert!(!leakcheck),
            other => panic!("Expected valgrind, got {other:?}"),
        }
    }

    #[test]
    fn test_existing_env_implies_reuse() {
        let config = resolve(&["--env", "existing-env"]).unwrap();
        assert!(config.env_reuse);
    }

    #[test]
    fn test_invalid_combinations() {
        assert!(resolve(&["-s", "--parallelism", "2"]).is_err());
        assert!(resolve(&["--stop-on-failure", "--parallelism", "2"]).is_err());
        assert!(resolve(&["--env", "existing-env", "--use-valgrind"]).is_err());
        assert!(resolve(&["-i", "--use-valgrind"]).is_err());
        assert!(resolve(&["-p", "0"]).is_err());
        assert!(resolve(&[
            "--module",
            "a.so",
            "--module",
            "b.so",
            "--module-args",
            "X 1"
        ])
        .is_err());
    }

    #[test]
    fn test_worker_ports() {
        let config = resolve(&["--parallelism", "4", "-p", "7000"]).unwrap();
        assert_eq!(config.for_worker(0).env.port, 7000);
        assert_eq!(config.for_worker(3).env.port, 7090);
    }

    #[test]
    fn test_tests_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tests.txt");
        std::fs::write(&path, "test_a\n# skipped\n\n  test_b  \n").unwrap();

        let names = collect_test_names(
            &["test_c".to_string()],
            &[path, dir.path().join("missing.txt")],
        );
        assert_eq!(names, vec!["test_c", "test_a", "test_b"]);
    }
}
