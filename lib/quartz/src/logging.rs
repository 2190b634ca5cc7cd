pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Drain, Logger};

use sloggers::{Config, LoggerConfig};
use std::path::Path;

/// Builds a terminal logger writing to stderr at the supplied severity
/// (one of `trace`, `debug`, `info`, `warning`, `error`, `critical`).
pub fn terminal(level: &str) -> Logger {
    let config: LoggerConfig = serdeconv::from_toml_str(&format!(
        r#"
type = "terminal"
level = "{}"
destination = "stderr"
"#,
        level
    ))
    .expect("Error parsing logger configuration");

    config.build_logger().expect("Error building terminal logger")
}

/// Builds a file logger at the supplied severity.
pub fn file<P: AsRef<Path>>(path: P, level: &str) -> Logger {
    let config: LoggerConfig = serdeconv::from_toml_str(&format!(
        r#"
type = "file"
path = "{}"
level = "{}"
"#,
        path.as_ref().display(),
        level
    ))
    .expect("Error parsing logger configuration");

    config.build_logger().expect("Error building file logger")
}

/// A logger that discards everything. Components accept `Option<&Logger>` and fall back to
/// this when no parent logger is supplied.
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}

/// Resolves an optional parent logger into a child logger, discarding output when absent.
#[inline]
pub fn child<'a, L: Into<Option<&'a Logger>>>(log: L) -> Logger {
    match log.into() {
        Some(log) => log.new(o!()),
        None => discard(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discard_logger() {
        let log = discard();
        debug!(log, "not emitted"; "key" => 1);
    }

    #[test]
    fn test_child_of_none() {
        let log = child(None);
        trace!(log, "not emitted");
    }
}
