//! Console formatting
//!
//! ANSI styling and the per-test status lines.

use crate::models::TestStatus;

/// ANSI styling, switched off for buffers that end up in files
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Paint {
    colorize: bool,
}

impl Paint {
    pub fn new(colorize: bool) -> Self {
        Self { colorize }
    }

    pub fn plain() -> Self {
        Self::new(false)
    }

    fn wrap(&self, code: &str, text: &str) -> String {
        if self.colorize {
            format!("\x1b[{code}m{text}\x1b[0m")
        } else {
            text.to_string()
        }
    }

    pub fn bold(&self, text: &str) -> String {
        self.wrap("1", text)
    }

    /// Bold red
    pub fn bred(&self, text: &str) -> String {
        self.wrap("1;31", text)
    }

    pub fn green(&self, text: &str) -> String {
        self.wrap("32", text)
    }

    pub fn cyan(&self, text: &str) -> String {
        self.wrap("36", text)
    }

    /// `<name>:` followed by the tab-indented status tag
    pub fn status_line(&self, name: &str, status: TestStatus) -> String {
        let tag = status.to_string();
        let tag = match status {
            TestStatus::Pass | TestStatus::Skip => self.green(&tag),
            TestStatus::Fail | TestStatus::Error => self.bred(&tag),
        };
        format!("{}:\n\t{}", self.cyan(name), tag)
    }
}

impl Default for Paint {
    fn default() -> Self {
        Self::new(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_status_line() {
        let paint = Paint::plain();
        assert_eq!(
            paint.status_line("test_ping", TestStatus::Pass),
            "test_ping:\n\t[PASS]"
        );
        assert_eq!(
            paint.status_line("\tsub", TestStatus::Error),
            "\tsub:\n\t[ERROR]"
        );
    }

    #[test]
    fn test_colorized() {
        let paint = Paint::new(true);
        assert_eq!(paint.bred("x"), "\x1b[1;31mx\x1b[0m");
        assert!(paint
            .status_line("t", TestStatus::Fail)
            .contains("\x1b[1;31m[FAIL]"));
    }
}
