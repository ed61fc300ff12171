//! # stdio
//!
//! Terminal output for guest consoles.
//!
//! ## Format
//!
//! ```text
//! [fn:reference/name] message
//! [warn] [fn:reference/name] message
//! ```
//!
//! Guest scripts print through [`guest`]. Host diagnostics go through
//! `tracing` instead.
//!
//! ## Log Levels
//!
//! Control output with `LOG_LEVEL` environment variable:
//! - `error` - Errors only
//! - `info` - Default
//! - `debug` - Verbose output, including guest `console.debug`

use std::env;
use std::io::Write;
use std::sync::OnceLock;

/// Verbosity selected by `LOG_LEVEL`
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum LogLevel {
    Error = 0,
    Info = 1,
    Debug = 2,
}

impl LogLevel {
    fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "debug" => LogLevel::Debug,
            _ => LogLevel::Info,
        }
    }
}

/// Severity of a guest console call.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum GuestLevel {
    Log,
    Info,
    Warn,
    Error,
    Debug,
}

impl GuestLevel {
    pub fn parse(value: &str) -> Self {
        match value {
            "info" => GuestLevel::Info,
            "warn" => GuestLevel::Warn,
            "error" => GuestLevel::Error,
            "debug" => GuestLevel::Debug,
            _ => GuestLevel::Log,
        }
    }

    fn to_stderr(self) -> bool {
        matches!(self, GuestLevel::Warn | GuestLevel::Error)
    }
}

static LOG_LEVEL: OnceLock<LogLevel> = OnceLock::new();

// Write failures (closed pipe, full disk) are dropped.
fn emit_line(line: &str, to_stderr: bool) {
    if to_stderr {
        let mut err = std::io::stderr().lock();
        let _ = writeln!(err, "{}", line);
    } else {
        let mut out = std::io::stdout().lock();
        let _ = writeln!(out, "{}", line);
    }
}

/// Get the current log level (cached from LOG_LEVEL env var)
pub fn log_level() -> LogLevel {
    *LOG_LEVEL.get_or_init(|| {
        env::var("LOG_LEVEL")
            .map(|s| LogLevel::from_str(&s))
            .unwrap_or(LogLevel::Info)
    })
}

/// Check if debug logging is enabled
pub fn is_debug() -> bool {
    log_level() >= LogLevel::Debug
}

/// Print one guest console line.
///
/// `warn` and `error` go to stderr, everything else to stdout. `debug` lines
/// only show when `LOG_LEVEL=debug`.
///
/// # Example
/// ```
/// stdio::guest("blog/hello", stdio::GuestLevel::Info, "visited");
/// // Output: [fn:blog/hello] visited
/// ```
pub fn guest(namespace: &str, level: GuestLevel, message: &str) {
    if level == GuestLevel::Debug && !is_debug() {
        return;
    }
    emit_line(&format_guest_line(namespace, level, message), level.to_stderr());
}

fn format_guest_line(namespace: &str, level: GuestLevel, message: &str) -> String {
    match level {
        GuestLevel::Warn => format!("[warn] [fn:{}] {}", namespace, message),
        GuestLevel::Error => format!("[error] [fn:{}] {}", namespace, message),
        _ => format!("[fn:{}] {}", namespace, message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_parsing() {
        assert_eq!(LogLevel::from_str("error"), LogLevel::Error);
        assert_eq!(LogLevel::from_str("info"), LogLevel::Info);
        assert_eq!(LogLevel::from_str("debug"), LogLevel::Debug);
        assert_eq!(LogLevel::from_str("INFO"), LogLevel::Info);
        assert_eq!(LogLevel::from_str("unknown"), LogLevel::Info);
    }

    #[test]
    fn test_log_level_ordering() {
        assert!(LogLevel::Error < LogLevel::Info);
        assert!(LogLevel::Info < LogLevel::Debug);
    }

    #[test]
    fn guest_lines_carry_namespace() {
        assert_eq!(
            format_guest_line("blog/hello", GuestLevel::Log, "hi"),
            "[fn:blog/hello] hi"
        );
        assert_eq!(
            format_guest_line("blog/hello", GuestLevel::Error, "boom"),
            "[error] [fn:blog/hello] boom"
        );
    }

    #[test]
    fn guest_level_parse_defaults_to_log() {
        assert_eq!(GuestLevel::parse("warn"), GuestLevel::Warn);
        assert_eq!(GuestLevel::parse("trace"), GuestLevel::Log);
        assert!(GuestLevel::Error.to_stderr());
        assert!(!GuestLevel::Info.to_stderr());
    }
}
