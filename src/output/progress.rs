//! Progress bar
//!
//! One bar per run, sized to the number of queued jobs.

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::io::IsTerminal;

use super::Console;

#[derive(Clone)]
pub struct Progress {
    bar: Option<ProgressBar>,
}

impl Progress {
    /// Draws only when `enabled` and stdout is a terminal
    pub fn new(len: usize, enabled: bool) -> Self {
        if !enabled || !std::io::stdout().is_terminal() {
            return Self::hidden();
        }

        let bar = ProgressBar::with_draw_target(Some(len as u64), ProgressDrawTarget::stdout());
        if let Ok(style) =
            ProgressStyle::with_template("{percent:>3}% ({pos}/{len}) [{bar:40}] {elapsed_precise}")
        {
            bar.set_style(style.progress_chars("=> "));
        }
        Self { bar: Some(bar) }
    }

    pub fn hidden() -> Self {
        Self { bar: None }
    }

    pub fn is_visible(&self) -> bool {
        self.bar.is_some()
    }

    /// Make `console` print above the bar
    pub fn attach(&self, console: &Console) {
        if let Some(bar) = &self.bar {
            console.attach_progress(bar.clone());
        }
    }

    pub fn inc(&self) {
        if let Some(bar) = &self.bar {
            bar.inc(1);
        }
    }

    pub fn finish(&self, console: &Console) {
        if let Some(bar) = &self.bar {
            bar.finish();
            console.detach_progress();
        }
    }
}
