//! Log routing for the workflow.
//!
//! Library code logs through the `log` facade. Hosts pick one sink:
//!
//! - [`set_logger`] forwards records to their own [`Logger`] (for example an
//!   audit pipeline), or
//! - [`init_tracing`] installs a `tracing` fmt subscriber and bridges `log`
//!   records into it.
//!
//! Shares, one-time pads and root tokens are never passed to the log macros.

use std::sync::{Arc, OnceLock};

use tracing_subscriber::EnvFilter;

/// Receiver for log messages emitted by the workflow.
///
/// # Examples
///
/// ```rust
/// use keyquorum_core::logger::{LogLevel, Logger};
///
/// struct StderrLogger;
///
/// impl Logger for StderrLogger {
///     fn log(&self, level: LogLevel, message: String) {
///         eprintln!("[{level:?}] {message}");
///     }
/// }
/// ```
pub trait Logger: Sync + Send {
    /// Logs a message at the specified level.
    fn log(&self, level: LogLevel, message: String);
}

/// Severity of a log message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Very detailed diagnostics.
    Trace,
    /// Debugging information.
    Debug,
    /// Normal progress, e.g. a request being created or approved.
    Info,
    /// Something was refused or could not be cleaned up.
    Warn,
    /// Failures, including the critical undecodable-root-token case.
    Error,
}

/// Forwards `log` records to the registered [`Logger`].
struct ForwardingLogger;

impl log::Log for ForwardingLogger {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        let is_record_from_keyquorum = record
            .module_path()
            .is_some_and(|module_path| module_path.starts_with("keyquorum"));

        let is_debug_or_trace_level =
            record.level() == log::Level::Debug || record.level() == log::Level::Trace;

        // Dependencies are only interesting from info upwards.
        if is_debug_or_trace_level && !is_record_from_keyquorum {
            return;
        }

        if let Some(logger) = LOGGER_INSTANCE.get() {
            logger.log(log_level(record.level()), format!("{}", record.args()));
        } else {
            eprintln!("Logger not set: {}", record.args());
        }
    }

    fn flush(&self) {}
}

const fn log_level(level: log::Level) -> LogLevel {
    match level {
        log::Level::Error => LogLevel::Error,
        log::Level::Warn => LogLevel::Warn,
        log::Level::Info => LogLevel::Info,
        log::Level::Debug => LogLevel::Debug,
        log::Level::Trace => LogLevel::Trace,
    }
}

static LOGGER_INSTANCE: OnceLock<Arc<dyn Logger>> = OnceLock::new();

/// Routes all workflow log records to `logger`.
///
/// Only the first call has an effect; later calls print a notice and return.
pub fn set_logger(logger: Arc<dyn Logger>) {
    if LOGGER_INSTANCE.set(logger).is_err() {
        eprintln!("Logger already set");
        return;
    }

    static LOGGER: ForwardingLogger = ForwardingLogger;
    if let Err(e) = log::set_logger(&LOGGER) {
        eprintln!("Failed to set logger: {e}");
        return;
    }
    log::set_max_level(log::LevelFilter::Trace);
}

/// Installs a `tracing` fmt subscriber and bridges `log` records into it.
///
/// `default_filter` (e.g. `"keyquorum_core=info"`) applies when `RUST_LOG`
/// is unset.
///
/// # Errors
///
/// Returns an error if a global subscriber or `log` logger is already set.
pub fn init_tracing(default_filter: &str) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    tracing_log::LogTracer::init()?;
    Ok(())
}
