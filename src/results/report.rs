//! Run report
//!
//! Final totals, the console summary and the failed-tests file used by re-run tooling.

use anyhow::{Context, Result};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use super::FailureRecord;
use crate::output::Paint;

/// Authoritative outcome of one run
#[derive(Clone, Debug, Default)]
pub struct RunReport {
    /// Tests and sub-tests completed, across all workers
    pub done: usize,
    pub failures: FailureRecord,
    pub elapsed: Duration,
    /// Set when the run was cut short by a fatal error
    pub aborted: Option<String>,
}

impl RunReport {
    pub fn failed(&self) -> usize {
        self.failures.len()
    }

    pub fn passed(&self) -> usize {
        self.done.saturating_sub(self.failed())
    }

    pub fn is_success(&self) -> bool {
        self.failures.is_empty() && self.aborted.is_none()
    }

    pub fn exit_code(&self) -> i32 {
        if self.is_success() {
            0
        } else {
            1
        }
    }

    pub fn render(&self, paint: &Paint) -> String {
        let mut output = String::new();
        output.push_str(&format!(
            "\n{}\n",
            paint.bold(&format!("Test Took: {} sec", self.elapsed.as_secs()))
        ));
        output.push_str(&format!(
            "{}\n",
            paint.bold(&format!(
                "Total Tests Run: {}, Total Tests Failed: {}, Total Tests Passed: {}",
                self.done,
                self.failed(),
                self.passed()
            ))
        ));
        if let Some(reason) = &self.aborted {
            output.push_str(&format!("{}\n", paint.bred(&format!("Run aborted: {reason}"))));
        }
        if !self.failures.is_empty() {
            output.push_str(&format!("{}\n", paint.bold("Failed Tests Summary:")));
            output.push_str(&self.failures.render(paint));
        }
        output
    }

    /// Write the failing test names, one per line. A clean run truncates the file.
    pub fn write_failed_tests(&self, path: &Path) -> Result<()> {
        let file = File::create(path)
            .with_context(|| format!("Failed to create failed tests file: {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        for name in self.failures.names() {
            let test = name.split(' ').next().unwrap_or(name);
            writeln!(writer, "{test}")?;
        }
        writer.flush()?;
        debug!("Wrote {} failed tests to {}", self.failed(), path.display());
        Ok(())
    }
}
