//! Run-level state machine.

use serde::{Deserialize, Serialize};

use crate::error::RunStatus;

/// Lifecycle state of the orchestrator.
///
/// # State Machine
///
/// ```text
/// Idle ──run──> Configuring ──loop started──> Running ──┬──> Completed
///                    │                                  ├──> Aborted
///                    └──────────────────────────────────┴──> Failed(code)
/// ```
///
/// Any terminal state may begin a new run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanState {
    /// No run active
    Idle,
    /// Preaction, actuator init, classification and allocation in progress
    Configuring,
    /// Acquisition loop running
    Running,
    /// All samples recorded
    Completed,
    /// Stopped by the user
    Aborted,
    /// Stopped by a hard failure
    Failed(RunStatus),
}

impl std::fmt::Display for ScanState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScanState::Idle => write!(f, "Idle"),
            ScanState::Configuring => write!(f, "Configuring"),
            ScanState::Running => write!(f, "Running"),
            ScanState::Completed => write!(f, "Completed"),
            ScanState::Aborted => write!(f, "Aborted"),
            ScanState::Failed(status) => write!(f, "Failed({})", status.code()),
        }
    }
}

impl ScanState {
    /// Terminal state for a run that ended with `status`.
    pub fn finished(status: RunStatus) -> Self {
        match status {
            RunStatus::Completed => ScanState::Completed,
            RunStatus::UserAbort => ScanState::Aborted,
            other => ScanState::Failed(other),
        }
    }

    /// Check if the state allows starting a new run.
    pub fn can_begin(&self) -> bool {
        !self.is_active()
    }

    /// Configuring or running.
    pub fn is_active(&self) -> bool {
        matches!(self, ScanState::Configuring | ScanState::Running)
    }
}
