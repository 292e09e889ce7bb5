//! Failure collection
//!
//! A run-wide, insertion-ordered mapping from test name to failure descriptions.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::output::Paint;

/// Rendered in place of an empty failure list
pub const GENERIC_FAILURE_NOTICE: &str = "Exception raised during test execution. See logs";

/// Test name to ordered failure strings
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FailureRecord {
    entries: Vec<(String, Vec<String>)>,
}

impl FailureRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append failures under `name`. An empty list still registers the name.
    pub fn add<I>(&mut self, name: &str, failures: I)
    where
        I: IntoIterator<Item = String>,
    {
        match self.entries.iter_mut().find(|(n, _)| n == name) {
            Some((_, list)) => list.extend(failures),
            None => self
                .entries
                .push((name.to_string(), failures.into_iter().collect())),
        }
    }

    /// Per-key concatenation
    pub fn merge(&mut self, other: &FailureRecord) {
        for (name, failures) in &other.entries {
            self.add(name, failures.iter().cloned());
        }
    }

    /// Fold in a worker's snapshot.
    ///
    /// Workers run disjoint tests, so this is a union on names. Shared tags such as
    /// `[env dtor]` concatenate, which keeps a parallel run's record identical to a
    /// serial one.
    pub fn import(&mut self, snapshot: &FailureRecord) {
        self.merge(snapshot);
    }

    /// Number of distinct failing names
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<&[String]> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, list)| list.as_slice())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries
            .iter()
            .map(|(n, list)| (n.as_str(), list.as_slice()))
    }

    pub fn render(&self, paint: &Paint) -> String {
        let mut output = String::new();
        for (group, failures) in &self.entries {
            output.push_str(&format!("\t{}\n", paint.bold(group)));
            if failures.is_empty() {
                output.push_str(&format!("\t\t{}\n", paint.bred(GENERIC_FAILURE_NOTICE)));
            }
            for failure in failures {
                output.push_str(&format!("\t\t{failure}\n"));
            }
        }
        output
    }
}

/// Shared handle on one process's failure record.
///
/// The timeout path records from the monitor thread while the test thread is parked,
/// so the record sits behind a mutex that is only held for the duration of one call.
#[derive(Clone, Debug, Default)]
pub struct FailureAggregator {
    record: Arc<Mutex<FailureRecord>>,
}

impl FailureAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, FailureRecord> {
        self.record.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add<I>(&self, name: &str, failures: I)
    where
        I: IntoIterator<Item = String>,
    {
        self.lock().add(name, failures);
    }

    pub fn import(&self, snapshot: &FailureRecord) {
        self.lock().import(snapshot);
    }

    pub fn snapshot(&self) -> FailureRecord {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn render(&self, paint: &Paint) -> String {
        self.lock().render(paint)
    }
}
