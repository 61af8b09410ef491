//! Logging initialisation via tracing-subscriber.
//!
//! Call [`init`] once from the binary, after config and CLI flags are
//! resolved. The library itself only emits `tracing` events.

use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use crate::error::AppError;

const LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];

/// Initialise the global tracing subscriber, writing to stderr.
///
/// `level` is an `EnvFilter` directive (`"info"`, `"sensehub=debug,warn"`).
/// With `prefer_level` it wins over `RUST_LOG`, which is then only a
/// fallback for an invalid `level`; without it `RUST_LOG` wins.
pub fn init(level: &str, prefer_level: bool) -> Result<(), AppError> {
    let filter = if prefer_level {
        match EnvFilter::try_new(level) {
            Ok(filter) => filter,
            Err(level_err) => EnvFilter::try_from_default_env().map_err(|env_err| {
                AppError::Logger(format!(
                    "invalid log level '{level}': {level_err}; RUST_LOG parse failed: {env_err}"
                ))
            })?,
        }
    } else {
        EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(level))
            .map_err(|e| AppError::Logger(format!("invalid log level '{level}': {e}")))?
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| AppError::Logger(format!("failed to set subscriber: {e}")))?;

    Ok(())
}

/// Parse a plain level name into a [`LevelFilter`].
pub fn parse_level(level: &str) -> Result<LevelFilter, AppError> {
    if level.is_empty() {
        return Err(AppError::Logger("log level must not be empty".into()));
    }
    level
        .parse::<LevelFilter>()
        .map_err(|_| AppError::Logger(format!("unrecognised log level: '{level}'")))
}

/// Shift `level` by `steps` (`-v` is +1, `-q` is -1), clamped to
/// `error..=trace`.
pub fn shift_level(level: &str, steps: i32) -> Result<&'static str, AppError> {
    let filter = parse_level(level)?;
    let idx = LEVELS
        .iter()
        .position(|l| l.parse::<LevelFilter>().ok() == Some(filter))
        .unwrap_or(2) as i32;
    let shifted = (idx + steps).clamp(0, LEVELS.len() as i32 - 1);
    Ok(LEVELS[shifted as usize])
}
