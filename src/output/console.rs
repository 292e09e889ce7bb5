//! Test report sink
//!
//! Everything a test run reports to a human goes through a `Console`: straight to
//! stdout in serial runs, above the progress bar when one is drawn, or into a private
//! buffer inside a worker so that concurrent tests never interleave.

use indicatif::ProgressBar;
use std::io::Write;
use std::sync::{Arc, Mutex, MutexGuard};

use super::Paint;

enum Sink {
    Stdout,
    Progress(ProgressBar),
    Buffer(String),
}

/// Cloneable handle on a shared output sink
#[derive(Clone)]
pub struct Console {
    sink: Arc<Mutex<Sink>>,
    paint: Paint,
}

impl Console {
    pub fn stdout(colorize: bool) -> Self {
        Self {
            sink: Arc::new(Mutex::new(Sink::Stdout)),
            paint: Paint::new(colorize),
        }
    }

    pub fn buffered(colorize: bool) -> Self {
        Self {
            sink: Arc::new(Mutex::new(Sink::Buffer(String::new()))),
            paint: Paint::new(colorize),
        }
    }

    pub fn paint(&self) -> Paint {
        self.paint
    }

    fn lock(&self) -> MutexGuard<'_, Sink> {
        // A panicking test must not take reporting down with it
        self.sink.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Route stdout output above `bar` until `detach_progress`
    pub fn attach_progress(&self, bar: ProgressBar) {
        let mut sink = self.lock();
        if matches!(*sink, Sink::Stdout) {
            *sink = Sink::Progress(bar);
        }
    }

    pub fn detach_progress(&self) {
        let mut sink = self.lock();
        if matches!(*sink, Sink::Progress(_)) {
            *sink = Sink::Stdout;
        }
    }

    pub fn println(&self, text: impl AsRef<str>) {
        let text = text.as_ref();
        match &mut *self.lock() {
            Sink::Stdout => println!("{text}"),
            Sink::Progress(bar) => bar.suspend(|| println!("{text}")),
            Sink::Buffer(buffer) => {
                buffer.push_str(text);
                buffer.push('\n');
            }
        }
    }

    /// Write text that already carries its own line endings
    pub fn print_raw(&self, text: &str) {
        if text.is_empty() {
            return;
        }
        match &mut *self.lock() {
            Sink::Stdout => {
                let mut out = std::io::stdout().lock();
                let _ = out.write_all(text.as_bytes());
                let _ = out.flush();
            }
            Sink::Progress(bar) => bar.suspend(|| print!("{text}")),
            Sink::Buffer(buffer) => buffer.push_str(text),
        }
    }

    /// Drain the private buffer. Always empty for stdout consoles.
    pub fn take_buffer(&self) -> String {
        match &mut *self.lock() {
            Sink::Buffer(buffer) => std::mem::take(buffer),
            _ => String::new(),
        }
    }
}
