pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Drain, Logger};
pub use sloggers::types::Severity;

use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::Build;

/// Builds the process-wide terminal logger. Called once at startup; the
/// severity is fixed for the lifetime of the process.
pub fn init() -> Logger {
    init_with_severity(Severity::Debug)
}

pub fn init_with_severity(severity: Severity) -> Logger {
    let mut builder = TerminalLoggerBuilder::new();
    builder.level(severity);
    builder.destination(Destination::Stderr);
    builder.build().expect("Logger construction failed")
}

/// Logger that swallows every record. Used by components constructed
/// without a parent logger, mostly in tests.
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}
