//! Custom error types for the scan engine.
//!
//! `ScanError` is the single error type surfaced by the engine. It separates the
//! failures that stop a scan before it starts (connection and configuration
//! problems) from the hard aborts that end a running scan with a termination
//! code, and from the soft `AcquisitionTimeout`, which is only ever recorded.
//!
//! ## Error Hierarchy
//!
//! - **`ConnectionFailure`**: a channel could not be reached during `store`/`init`.
//! - **`Configuration`**: semantically invalid scan definitions, e.g. a readback
//!   without a tolerance or mismatched step counts.
//! - **`AcquisitionTimeout`**: a readback did not settle within the step timeout.
//! - **`StreamRetryExceeded`**, **`StreamEstablish`**, **`UserAbort`**: hard aborts,
//!   each mapping to a [`RunStatus`] code.
//! - **`Config`**, **`Io`**, **`Json`**: wrapped library errors, converted with `#[from]`.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the engine error type.
pub type ScanResult<T> = std::result::Result<T, ScanError>;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("Cannot connect to channel '{channel}'")]
    ConnectionFailure { channel: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Readback did not settle for step {step} within {timeout:?}")]
    AcquisitionTimeout { step: usize, timeout: Duration },

    #[error("Stream delivered {retries} consecutive incomplete packets")]
    StreamRetryExceeded { retries: usize },

    #[error("Cannot establish telemetry stream: {0}")]
    StreamEstablish(String),

    #[error("Scan aborted by user")]
    UserAbort,

    #[error("Scan engine is busy ({0})")]
    Busy(String),

    #[error("Channel access error: {0}")]
    Channel(String),

    #[error("Acquisition task failed: {0}")]
    Task(String),

    #[error("Configuration loading error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<figment::Error> for ScanError {
    fn from(value: figment::Error) -> Self {
        ScanError::Config(Box::new(value))
    }
}

impl ScanError {
    /// Termination code for errors that end a run, `None` for everything else.
    pub fn status(&self) -> Option<RunStatus> {
        match self {
            ScanError::UserAbort => Some(RunStatus::UserAbort),
            ScanError::StreamEstablish(_) => Some(RunStatus::StreamEstablishFailure),
            ScanError::StreamRetryExceeded { .. } => Some(RunStatus::StreamRetryExceeded),
            ScanError::ConnectionFailure { .. } | ScanError::Configuration(_) => {
                Some(RunStatus::ActuatorInitFailure)
            }
            _ => None,
        }
    }

    /// Soft errors are recorded but never halt a run.
    pub fn is_soft(&self) -> bool {
        matches!(self, ScanError::AcquisitionTimeout { .. })
    }
}

/// Terminal status of a run, reported through `terminated(code)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunStatus {
    /// Every expected sample was recorded.
    Completed,
    /// The user requested an abort.
    UserAbort,
    /// The telemetry source could not be opened (or was lost).
    StreamEstablishFailure,
    /// Actuator initialization failed before the loop started.
    ActuatorInitFailure,
    /// Too many consecutive incomplete packets.
    StreamRetryExceeded,
}

impl RunStatus {
    /// Integer code as published to notification sinks.
    pub fn code(self) -> i32 {
        match self {
            RunStatus::Completed => 0,
            RunStatus::UserAbort => -1,
            RunStatus::StreamEstablishFailure => -2,
            RunStatus::ActuatorInitFailure => -3,
            RunStatus::StreamRetryExceeded => -4,
        }
    }

    /// Inverse of [`RunStatus::code`].
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(RunStatus::Completed),
            -1 => Some(RunStatus::UserAbort),
            -2 => Some(RunStatus::StreamEstablishFailure),
            -3 => Some(RunStatus::ActuatorInitFailure),
            -4 => Some(RunStatus::StreamRetryExceeded),
            _ => None,
        }
    }

    pub fn is_success(self) -> bool {
        self == RunStatus::Completed
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            RunStatus::Completed => "completed",
            RunStatus::UserAbort => "user abort",
            RunStatus::StreamEstablishFailure => "stream establish failure",
            RunStatus::ActuatorInitFailure => "actuator init failure",
            RunStatus::StreamRetryExceeded => "stream retry exceeded",
        };
        write!(f, "{} ({})", label, self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_round_trip() {
        for status in [
            RunStatus::Completed,
            RunStatus::UserAbort,
            RunStatus::StreamEstablishFailure,
            RunStatus::ActuatorInitFailure,
            RunStatus::StreamRetryExceeded,
        ] {
            assert_eq!(RunStatus::from_code(status.code()), Some(status));
        }
        assert_eq!(RunStatus::from_code(-7), None);
    }

    #[test]
    fn test_error_to_status() {
        assert_eq!(ScanError::UserAbort.status(), Some(RunStatus::UserAbort));
        assert_eq!(
            ScanError::StreamRetryExceeded { retries: 1001 }.status(),
            Some(RunStatus::StreamRetryExceeded)
        );
        assert_eq!(
            ScanError::Configuration("missing tolerance".into()).status(),
            Some(RunStatus::ActuatorInitFailure)
        );
        assert_eq!(ScanError::Busy("running".into()).status(), None);
    }

    #[test]
    fn test_timeout_is_soft() {
        let err = ScanError::AcquisitionTimeout {
            step: 2,
            timeout: Duration::from_secs(1),
        };
        assert!(err.is_soft());
        assert!(err.status().is_none());
        assert!(!ScanError::UserAbort.is_soft());
    }
}
