//! Cross-process records
//!
//! Plain data exchanged between the driver and its workers as line-delimited JSON.
//! Nothing here holds a live handle.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::results::FailureRecord;

/// A queued reference to a test unit, resolved by name on the worker side
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub test_name: String,
}

impl Job {
    pub fn new(test_name: impl Into<String>) -> Self {
        Self {
            test_name: test_name.into(),
        }
    }
}

/// Output captured while one test ran inside a worker
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestOutput {
    pub test_name: String,
    pub output: String,
}

/// Running totals of one worker
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SummarySnapshot {
    pub done: usize,
    pub failures: FailureRecord,
}

/// Worker to driver
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// Asks for the next job
    Ready,
    Result(TestOutput),
    Summary(SummarySnapshot),
    /// Output produced outside any test, e.g. during the final teardown
    Output { text: String },
    /// Exit-on-failure tripped; the driver stops handing out jobs
    Aborted { test_name: String },
}

/// Driver to worker
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DriverMessage {
    Job(Job),
    Drained,
}

/// Outcome of one test or sub-test
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TestStatus {
    Pass,
    Fail,
    Skip,
    Error,
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TestStatus::Pass => write!(f, "[PASS]"),
            TestStatus::Fail => write!(f, "[FAIL]"),
            TestStatus::Skip => write!(f, "[SKIP]"),
            TestStatus::Error => write!(f, "[ERROR]"),
        }
    }
}
