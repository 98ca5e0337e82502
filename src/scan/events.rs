//! Notifications published by a running scan.
//!
//! Every subscriber of [`ScanOrchestrator::subscribe`](super::ScanOrchestrator::subscribe)
//! receives the same sequence: `Progress { processed: 0, .. }` when the loop
//! starts, periodic progress, step events while actuated, and exactly one
//! `Terminated` per run.

use serde::{Deserialize, Serialize};

use crate::error::RunStatus;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ScanEvent {
    /// `processed` of `total` samples recorded
    Progress { processed: usize, total: usize },
    /// Step `step` settled; samples are accepted again
    StepReady { step: usize },
    /// Readbacks of step `step` did not settle within the timeout
    StepTimeout { step: usize },
    /// The run ended; actuator and preaction state were already restored
    Terminated { status: RunStatus },
}

impl ScanEvent {
    /// Termination code, if this is the terminal event.
    pub fn termination_code(&self) -> Option<i32> {
        match self {
            ScanEvent::Terminated { status } => Some(status.code()),
            _ => None,
        }
    }
}

impl std::fmt::Display for ScanEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScanEvent::Progress { processed, total } => {
                write!(f, "progress {}/{}", processed, total)
            }
            ScanEvent::StepReady { step } => write!(f, "step {} ready", step),
            ScanEvent::StepTimeout { step } => write!(f, "step {} timed out", step),
            ScanEvent::Terminated { status } => write!(f, "terminated: {}", status),
        }
    }
}
