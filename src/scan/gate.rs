//! Scan gate: readiness and abort state shared by the step task and the
//! acquisition loop.
//!
//! The step task is the only writer of `busy` and `ready_since`; the
//! acquisition loop only reads them and never waits on them. The abort flag is
//! a `watch` channel so that both tasks can select on it while they sleep.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy)]
struct GateState {
    busy: bool,
    ready_since: DateTime<Utc>,
}

/// Point-in-time copy of the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateSnapshot {
    pub busy: bool,
    pub abort_requested: bool,
    pub ready_since: DateTime<Utc>,
}

/// Shared readiness/abort state for one run.
#[derive(Debug)]
pub struct ScanGate {
    state: Mutex<GateState>,
    abort: watch::Sender<bool>,
}

impl Default for ScanGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ScanGate {
    /// Idle gate that admits every packet.
    pub fn new() -> Self {
        let (abort, _) = watch::channel(false);
        Self {
            state: Mutex::new(GateState {
                busy: false,
                ready_since: DateTime::<Utc>::MIN_UTC,
            }),
            abort,
        }
    }

    /// Claim the gate for a step. Returns `false` if a step is already in flight.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();
        if state.busy {
            return false;
        }
        state.busy = true;
        true
    }

    /// Publish readiness: samples stamped at or after `at` belong to the new step.
    pub fn mark_ready(&self, at: DateTime<Utc>) {
        let mut state = self.state.lock();
        state.ready_since = at;
        state.busy = false;
    }

    /// Clear `busy` without publishing readiness.
    pub fn release(&self) {
        self.state.lock().busy = false;
    }

    pub fn is_busy(&self) -> bool {
        self.state.lock().busy
    }

    pub fn ready_since(&self) -> DateTime<Utc> {
        self.state.lock().ready_since
    }

    /// Whether a packet stamped `timestamp` may be recorded.
    pub fn admits(&self, timestamp: DateTime<Utc>) -> bool {
        let state = self.state.lock();
        !state.busy && timestamp >= state.ready_since
    }

    pub fn request_abort(&self) {
        self.abort.send_replace(true);
    }

    pub fn is_abort_requested(&self) -> bool {
        *self.abort.borrow()
    }

    /// Resolves once an abort has been requested.
    pub async fn aborted(&self) {
        let mut rx = self.abort.subscribe();
        if rx.wait_for(|requested| *requested).await.is_err() {
            // The sender lives in `self`, so this branch is unreachable while borrowed.
            std::future::pending::<()>().await;
        }
    }

    pub fn snapshot(&self) -> GateSnapshot {
        let state = *self.state.lock();
        GateSnapshot {
            busy: state.busy,
            abort_requested: self.is_abort_requested(),
            ready_since: state.ready_since,
        }
    }
}
