//! Shared error handling for the orchestrator crates.

use std::error::Error;
use std::fmt::{self, Display};
use std::num;

use backtrace::Backtrace;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DialerError>;

/// The main error type.
#[derive(Debug)]
pub struct DialerError {
    pub kind: DialerErrorKind,
    pub backtrace: Backtrace,
}

impl Display for DialerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Error: {}", self.kind)?;

        // Go down the chain of errors
        let mut error: &dyn Error = &self.kind;
        while let Some(source) = error.source() {
            write!(f, "\n\nCaused by: {}", source)?;
            error = source;
        }

        Ok(())
    }
}

// Forward From impls to DialerError from DialerErrorKind. Because From is
// reflexive, this impl also takes care of From<DialerErrorKind>.
impl<T> From<T> for DialerError
where
    DialerErrorKind: From<T>,
{
    fn from(item: T) -> Self {
        DialerError {
            kind: DialerErrorKind::from(item),
            backtrace: Backtrace::new(),
        }
    }
}

impl From<&str> for DialerError {
    fn from(message: &str) -> Self {
        DialerErrorKind::GeneralError(message.to_owned()).into()
    }
}

#[derive(Debug, Error)]
pub enum DialerErrorKind {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    ConfigError(#[from] config::ConfigError),

    #[error(transparent)]
    MetricError(#[from] cadence::MetricError),

    #[error(transparent)]
    ParseIntError(#[from] num::ParseIntError),

    #[error("Unknown timezone: {0}")]
    UnknownTimezone(String),

    #[error("Invalid time of day: {0}")]
    InvalidTimeOfDay(String),

    #[error("Timed out waiting for the file lock: {0}")]
    LockTimeout(String),

    #[error("Invalid payload: {0}")]
    Validation(String),

    #[error("invalid state transition, from: {0}, to: {1}")]
    InvalidStateTransition(String, String),

    #[error("General Error: {0}")]
    GeneralError(String),
}

impl DialerErrorKind {
    pub fn metric_label(&self) -> &'static str {
        match self {
            Self::Io(_) => "io_error",
            Self::Json(_) => "json_error",
            Self::ConfigError(_) => "config_error",
            Self::MetricError(_) => "metric_error",
            Self::ParseIntError(_) => "parse_int_error",
            Self::UnknownTimezone(_) => "unknown_timezone",
            Self::InvalidTimeOfDay(_) => "invalid_time_of_day",
            Self::LockTimeout(_) => "lock_timeout",
            Self::Validation(_) => "validation_error",
            Self::InvalidStateTransition(_, _) => "invalid_state_transition",
            Self::GeneralError(_) => "general_error",
        }
    }
}
