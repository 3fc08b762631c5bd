use std::ffi::OsStr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Result;
use once_cell::sync::OnceCell;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Guard for the non-blocking file writer so it is not dropped early.
static FILE_GUARD: OnceCell<WorkerGuard> = OnceCell::new();
/// Ensures logging is only initialized once.
static LOG_INIT: OnceCell<()> = OnceCell::new();

/// Log verbosity, as accepted by the `LOGLEVEL` environment variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Fatal,
    Error,
    Warning,
    #[default]
    Info,
    Debug,
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "FATAL" => Ok(LogLevel::Fatal),
            "ERROR" => Ok(LogLevel::Error),
            "WARNING" => Ok(LogLevel::Warning),
            "INFO" => Ok(LogLevel::Info),
            "DEBUG" => Ok(LogLevel::Debug),
            other => Err(format!(
                "unknown log level '{other}' (expected FATAL|ERROR|WARNING|INFO|DEBUG)"
            )),
        }
    }
}

impl LogLevel {
    /// The tracing filter directive this level maps onto. Fatal has no
    /// tracing equivalent; errors are the closest thing still shown.
    fn directive(self) -> &'static str {
        match self {
            LogLevel::Fatal | LogLevel::Error => "error",
            LogLevel::Warning => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }
}

/// Initialize tracing-based logging on stdout, with an optional plain-text
/// file copy.
///
/// Subsequent calls are no-ops so every binary and test harness can call
/// this helper confidently and share the same configuration. `RUST_LOG`
/// overrides `level` when set.
pub fn init_logging(level: LogLevel, log_file: Option<&Path>) -> Result<()> {
    LOG_INIT
        .get_or_try_init(|| configure_logging(level, log_file))
        .map(|_| ())
}

fn configure_logging(level: LogLevel, log_file: Option<&Path>) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.directive()));
    let console_layer = fmt::layer().with_writer(std::io::stdout);

    let file_layer = match log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let _ = std::fs::create_dir_all(dir);
            let name = path
                .file_name()
                .unwrap_or_else(|| OsStr::new("scanbridge.log"));
            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let _ = FILE_GUARD.set(guard);
            Some(fmt::layer().with_ansi(false).with_writer(writer))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    Ok(())
}

/// Parse a humantime duration string such as `1m` or `90s`.
pub fn parse_duration(raw: &str) -> Result<Duration, String> {
    humantime::parse_duration(raw.trim()).map_err(|e| format!("invalid duration '{raw}': {e}"))
}
