pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Logger};
pub use sloggers::types::Severity;

use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::Build;

/// Build the root terminal logger. Components derive their own child
/// loggers from it with `log.new(o!(..))`.
pub fn init(level: Severity) -> Logger {
    let mut builder = TerminalLoggerBuilder::new();
    builder.level(level);
    builder.destination(Destination::Stderr);

    builder.build().expect("Error building terminal logger")
}

/// Logger that discards everything, for tests.
pub fn test() -> Logger {
    Logger::root(Discard, o!())
}
