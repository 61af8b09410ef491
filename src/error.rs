//! Error types for the scheduling engine and the daemon binary.

use thiserror::Error;

/// Errors raised by the request-scheduling core.
///
/// Every variant is scoped to one descriptor or one listener; nothing here is
/// fatal to the process.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CoreError {
    /// Unknown type name, missing or malformed field, malformed schedule.
    #[error("invalid config: {0}")]
    ConfigInvalid(String),

    /// The timer service refused or could not accept a request.
    #[error("scheduler unavailable: {0}")]
    SchedulerUnavailable(String),

    /// A listener callback failed. Isolated to that listener.
    #[error("listener '{listener}' failed: {message}")]
    ListenerError { listener: String, message: String },

    /// A component worker thread could not be spawned.
    #[error("component worker unavailable: {0}")]
    WorkerUnavailable(String),

    /// The coordinator task is no longer running.
    #[error("coordinator is not running")]
    CoordinatorClosed,
}

impl CoreError {
    pub fn config(msg: impl Into<String>) -> Self {
        CoreError::ConfigInvalid(msg.into())
    }
}

/// Application-wide error type used by the binary.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(String),

    #[error("logger error: {0}")]
    Logger(String),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn config_invalid_display() {
        let e = CoreError::config("unknown type 'gps'");
        assert!(e.to_string().starts_with("invalid config"));
        assert!(e.to_string().contains("unknown type 'gps'"));
    }

    #[test]
    fn listener_error_names_listener() {
        let e = CoreError::ListenerError {
            listener: "archive".into(),
            message: "disk full".into(),
        };
        assert!(e.to_string().contains("archive"));
        assert!(e.to_string().contains("disk full"));
    }

    #[test]
    fn core_error_converts_transparently() {
        let e: AppError = CoreError::SchedulerUnavailable("queue full".into()).into();
        assert_eq!(e.to_string(), "scheduler unavailable: queue full");
    }

    #[test]
    fn io_error_converts() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file missing");
        let e: AppError = io_err.into();
        assert!(e.to_string().contains("io error"));
        let _: &dyn Error = &e;
    }
}
