//! Failure aggregation and run reporting

mod failures;
mod report;

pub use failures::{FailureAggregator, FailureRecord, GENERIC_FAILURE_NOTICE};
pub use report::RunReport;
