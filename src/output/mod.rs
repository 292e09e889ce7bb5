//! Output module
//!
//! Console sinks, styling and progress display.

mod console;
mod formatter;
mod progress;

pub use console::Console;
pub use formatter::Paint;
pub use progress::Progress;
