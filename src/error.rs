//! Orchestration errors
//!
//! Errors that abort a run, as opposed to test failures, which are recorded
//! and reported but never stop the scheduler on their own.

use thiserror::Error;

/// Fatal orchestration errors
#[derive(Error, Debug)]
pub enum RunError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("Failed to get job result and no more processors is alive ({pending} jobs left)")]
    SchedulerFailure { pending: usize },

    #[error("Process exited dirty (last test: {test_name})")]
    DirtyExit { test_name: String },

    #[error("aborting run: {test_name} failed with exit-on-failure set")]
    ExitOnFailure { test_name: String },

    #[error("worker {index}: {message}")]
    Worker { index: usize, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RunError {
    pub fn config(message: impl Into<String>) -> Self {
        RunError::Config(message.into())
    }

    pub fn worker(index: usize, message: impl Into<String>) -> Self {
        RunError::Worker {
            index,
            message: message.into(),
        }
    }

    /// Errors that end the run but still leave a meaningful summary behind.
    pub fn is_abort(&self) -> bool {
        matches!(
            self,
            RunError::ExitOnFailure { .. } | RunError::DirtyExit { .. }
        )
    }
}
