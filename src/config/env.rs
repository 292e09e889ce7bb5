//! Environment variable configuration
//!
//! Provides environment variable overrides for configuration.

use std::env;
use std::path::PathBuf;

/// Environment variable prefix
const ENV_PREFIX: &str = "RLTEST";

/// Environment configuration from environment variables
#[derive(Clone, Debug, Default)]
pub struct EnvConfig {
    /// Worker count from RLTEST_PARALLELISM
    pub parallelism: Option<usize>,
    /// Per-test timeout from RLTEST_TEST_TIMEOUT
    pub test_timeout: Option<u64>,
    /// Server binary from RLTEST_SERVER_PATH
    pub server_path: Option<String>,
    /// Log directory from RLTEST_LOG_DIR
    pub log_dir: Option<PathBuf>,
    /// Base port from RLTEST_PORT
    pub port: Option<u16>,
    /// Env reuse from RLTEST_ENV_REUSE
    pub env_reuse: Option<bool>,
    /// Config file from RLTEST_CONFIG
    pub config_file: Option<PathBuf>,
    /// Framework log filter from RLTEST_LOG
    pub log: Option<String>,
}

impl EnvConfig {
    /// Load configuration from environment variables
    pub fn load() -> Self {
        Self {
            parallelism: get_env_parse("PARALLELISM"),
            test_timeout: get_env_parse("TEST_TIMEOUT"),
            server_path: get_env("SERVER_PATH"),
            log_dir: get_env("LOG_DIR").map(PathBuf::from),
            port: get_env_parse("PORT"),
            env_reuse: get_env_bool("ENV_REUSE"),
            config_file: get_env("CONFIG").map(PathBuf::from),
            log: get_env("LOG"),
        }
    }

    /// Check if any environment variables are set
    pub fn has_any(&self) -> bool {
        self.parallelism.is_some()
            || self.test_timeout.is_some()
            || self.server_path.is_some()
            || self.log_dir.is_some()
            || self.port.is_some()
            || self.env_reuse.is_some()
            || self.config_file.is_some()
            || self.log.is_some()
    }
}

/// Get environment variable with prefix
fn get_env(name: &str) -> Option<String> {
    env::var(format!("{ENV_PREFIX}_{name}")).ok()
}

/// Get environment variable and parse to type
fn get_env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    get_env(name).and_then(|v| v.parse().ok())
}

/// Get environment variable as boolean
fn get_env_bool(name: &str) -> Option<bool> {
    get_env(name).map(|v| {
        matches!(
            v.to_lowercase().as_str(),
            "1" | "true" | "yes" | "on" | "enabled"
        )
    })
}

/// Builder for setting environment variables (useful for testing)
pub struct EnvBuilder {
    vars: Vec<(String, String)>,
}

impl EnvBuilder {
    pub fn new() -> Self {
        Self { vars: Vec::new() }
    }

    fn var(mut self, name: &str, value: impl ToString) -> Self {
        self.vars.push((format!("{ENV_PREFIX}_{name}"), value.to_string()));
        self
    }

    pub fn parallelism(self, parallelism: usize) -> Self {
        self.var("PARALLELISM", parallelism)
    }

    pub fn test_timeout(self, seconds: u64) -> Self {
        self.var("TEST_TIMEOUT", seconds)
    }

    pub fn server_path(self, path: impl Into<String>) -> Self {
        self.var("SERVER_PATH", path.into())
    }

    pub fn port(self, port: u16) -> Self {
        self.var("PORT", port)
    }

    pub fn env_reuse(self, reuse: bool) -> Self {
        self.var("ENV_REUSE", reuse)
    }

    /// Apply environment variables
    pub fn apply(self) {
        for (key, value) in self.vars {
            env::set_var(key, value);
        }
    }

    /// Apply and return guard that restores on drop
    pub fn apply_scoped(self) -> EnvGuard {
        let previous: Vec<_> = self
            .vars
            .iter()
            .map(|(k, _)| (k.clone(), env::var(k).ok()))
            .collect();

        self.apply();

        EnvGuard { previous }
    }
}

impl Default for EnvBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Guard that restores environment variables on drop
pub struct EnvGuard {
    previous: Vec<(String, Option<String>)>,
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, value) in &self.previous {
            match value {
                Some(v) => env::set_var(key, v),
                None => env::remove_var(key),
            }
        }
    }
}
