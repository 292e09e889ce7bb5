//! Test unit models
//!
//! Defines discoverable test units, suites, and the errors a test body can raise.

use std::fmt;

use crate::executor::TestContext;

/// Result returned by every test body and suite hook
pub type TestResult = Result<(), TestError>;

/// A test body. Receives the per-test context, through which it reaches the environment.
pub type TestFn = fn(&mut TestContext<'_>) -> TestResult;

/// Builds a suite instance. May request a skip or fail outright.
pub type SuiteFactory = fn(&mut TestContext<'_>) -> Result<Box<dyn TestSuite>, TestError>;

/// What a test body can signal besides success
#[derive(thiserror::Error, Debug)]
pub enum TestError {
    #[error("skipped: {0}")]
    Skip(String),

    #[error("{0}")]
    Assertion(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TestError {
    pub fn skip(reason: impl Into<String>) -> Self {
        TestError::Skip(reason.into())
    }

    pub fn assertion(message: impl Into<String>) -> Self {
        TestError::Assertion(message.into())
    }

    pub fn is_skip(&self) -> bool {
        matches!(self, TestError::Skip(_))
    }
}

/// A group of sub-tests sharing one instance, one environment and one time budget.
///
/// Sub-tests are dispatched by name through `run_sub_test`, so an implementation is a
/// plain `match` over the names it returns from `sub_tests`.
pub trait TestSuite: Send {
    /// Runs before every sub-test
    fn set_up(&mut self, _ctx: &mut TestContext<'_>) -> TestResult {
        Ok(())
    }

    /// Runs after every sub-test, unless exit-on-failure escalated a failure
    fn tear_down(&mut self, _ctx: &mut TestContext<'_>) -> TestResult {
        Ok(())
    }

    /// Ordered sub-test names
    fn sub_tests(&self) -> Vec<&'static str>;

    fn run_sub_test(&mut self, name: &str, ctx: &mut TestContext<'_>) -> TestResult;
}

/// Kind of a discovered test
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TestKind {
    Function,
    Suite,
}

impl fmt::Display for TestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TestKind::Function => write!(f, "function"),
            TestKind::Suite => write!(f, "suite"),
        }
    }
}

/// Callable behind a test unit
#[derive(Clone, Copy)]
pub enum TestTarget {
    Function { body: TestFn, needs_env: bool },
    Suite(SuiteFactory),
}

/// One discoverable test
#[derive(Clone)]
pub struct TestUnit {
    name: String,
    target: TestTarget,
    init: Option<fn()>,
}

impl TestUnit {
    /// A function that receives an environment, built before the body runs
    pub fn function(name: impl Into<String>, body: TestFn) -> Self {
        Self {
            name: name.into(),
            target: TestTarget::Function {
                body,
                needs_env: true,
            },
            init: None,
        }
    }

    /// A function that does not need an environment up front
    pub fn plain(name: impl Into<String>, body: TestFn) -> Self {
        Self {
            name: name.into(),
            target: TestTarget::Function {
                body,
                needs_env: false,
            },
            init: None,
        }
    }

    pub fn suite(name: impl Into<String>, factory: SuiteFactory) -> Self {
        Self {
            name: name.into(),
            target: TestTarget::Suite(factory),
            init: None,
        }
    }

    /// Hook run once right before the unit executes
    pub fn with_init(mut self, init: fn()) -> Self {
        self.init = Some(init);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> TestKind {
        match self.target {
            TestTarget::Function { .. } => TestKind::Function,
            TestTarget::Suite(_) => TestKind::Suite,
        }
    }

    pub fn target(&self) -> TestTarget {
        self.target
    }

    pub fn initialize(&self) {
        if let Some(init) = self.init {
            init();
        }
    }
}

impl fmt::Debug for TestUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestUnit")
            .field("name", &self.name)
            .field("kind", &self.kind())
            .finish()
    }
}

/// Ordered collection of discovered tests
#[derive(Clone, Debug, Default)]
pub struct Registry {
    units: Vec<TestUnit>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, unit: TestUnit) {
        self.units.push(unit);
    }

    pub fn with(mut self, unit: TestUnit) -> Self {
        self.add(unit);
        self
    }

    pub fn function(self, name: impl Into<String>, body: TestFn) -> Self {
        self.with(TestUnit::function(name, body))
    }

    pub fn plain(self, name: impl Into<String>, body: TestFn) -> Self {
        self.with(TestUnit::plain(name, body))
    }

    pub fn suite(self, name: impl Into<String>, factory: SuiteFactory) -> Self {
        self.with(TestUnit::suite(name, factory))
    }

    pub fn get(&self, name: &str) -> Option<&TestUnit> {
        self.units.iter().find(|u| u.name == name)
    }

    pub fn units(&self) -> &[TestUnit] {
        &self.units
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Narrow the registry to the requested names, in request order.
    ///
    /// A `suite:sub_test` request selects the whole suite. Returns the names that
    /// matched nothing alongside the selection.
    pub fn select(&self, names: &[String]) -> (Registry, Vec<String>) {
        let mut selected = Registry::new();
        let mut unknown = Vec::new();

        for requested in names {
            let unit_name = requested.split(':').next().unwrap_or(requested);
            match self.get(unit_name) {
                Some(unit) => {
                    if selected.get(unit.name()).is_none() {
                        selected.add(unit.clone());
                    }
                }
                None => unknown.push(requested.clone()),
            }
        }

        (selected, unknown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_ctx: &mut TestContext<'_>) -> TestResult {
        Ok(())
    }

    #[test]
    fn test_unit_kinds() {
        assert_eq!(TestUnit::function("a", noop).kind(), TestKind::Function);
        assert!(matches!(
            TestUnit::plain("b", noop).target(),
            TestTarget::Function {
                needs_env: false,
                ..
            }
        ));
    }

    #[test]
    fn test_registry_select() {
        let registry = Registry::new()
            .function("t1", noop)
            .function("t2", noop)
            .function("t3", noop);

        let names = vec![
            "t3".to_string(),
            "t1:sub".to_string(),
            "t3".to_string(),
            "missing".to_string(),
        ];
        let (selected, unknown) = registry.select(&names);

        let selected: Vec<_> = selected.units().iter().map(|u| u.name()).collect();
        assert_eq!(selected, vec!["t3", "t1"]);
        assert_eq!(unknown, vec!["missing".to_string()]);
    }

    #[test]
    fn test_error_from_anyhow() {
        let err: TestError = anyhow::anyhow!("connection reset").into();
        assert!(!err.is_skip());
        assert_eq!(err.to_string(), "connection reset");
        assert!(TestError::skip("no cluster").is_skip());
    }
}
