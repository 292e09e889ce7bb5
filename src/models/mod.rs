//! Data models for test orchestration
//!
//! Test units and their registry, plus the plain records that cross process boundaries.

mod messages;
mod test_unit;

pub use messages::{DriverMessage, Job, SummarySnapshot, TestOutput, TestStatus, WorkerMessage};
pub use test_unit::{
    Registry, SuiteFactory, TestError, TestFn, TestKind, TestResult, TestSuite, TestTarget,
    TestUnit,
};
