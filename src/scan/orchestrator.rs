//! Top-level run sequencing.
//!
//! [`ScanOrchestrator`] owns the collaborators and runs one scan at a time:
//!
//! ```text
//! store preaction ─> write preaction ─> actuator init ─> classify ─> allocate
//!     ─> configuration snapshot ─> acquisition loop ─> restore ─> RunResult
//! ```
//!
//! Every path out of a run that touched the machine goes through
//! [`AcquisitionLoop::finish`] or [`ScanOrchestrator::unwind`], so actuator and
//! preaction values are written back before the caller sees the outcome.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::acquisition::{classify, AcquisitionLoop, AcquisitionPlan};
use super::actuator::ActuatorController;
use super::buffer::{ColumnSource, SampleBuffer};
use super::events::ScanEvent;
use super::gate::ScanGate;
use super::request::ScanRequest;
use super::state::ScanState;
use crate::channel::{ChannelAccess, ChannelGroup};
use crate::config::EngineSettings;
use crate::error::{RunStatus, ScanError, ScanResult};
use crate::record::{RunRecorder, RunResult};
use crate::snapshot::SnapshotProvider;
use crate::stream::{ChannelCatalog, TelemetrySource};

/// Handles of the run in progress, used by `abort`.
#[derive(Clone)]
struct ActiveRun {
    gate: Arc<ScanGate>,
    actuator: Arc<ActuatorController>,
    preaction: Option<Arc<ChannelGroup>>,
}

struct RunContext {
    run_id: String,
    started: DateTime<Utc>,
}

/// Sequences scans against one set of collaborators.
///
/// # Example
///
/// ```rust,ignore
/// let orchestrator = Arc::new(ScanOrchestrator::new(access, source.clone(), source, settings));
/// let mut events = orchestrator.subscribe();
/// let result = orchestrator.run(&request).await?;
/// println!("{} finished with {}", result.run_id, result.status);
/// ```
pub struct ScanOrchestrator {
    access: Arc<dyn ChannelAccess>,
    source: Arc<dyn TelemetrySource>,
    catalog: Arc<dyn ChannelCatalog>,
    snapshot: Option<Arc<dyn SnapshotProvider>>,
    recorder: Option<Arc<dyn RunRecorder>>,
    settings: EngineSettings,
    events: broadcast::Sender<ScanEvent>,
    state: Mutex<ScanState>,
    active: Mutex<Option<ActiveRun>>,
}

impl ScanOrchestrator {
    pub fn new(
        access: Arc<dyn ChannelAccess>,
        source: Arc<dyn TelemetrySource>,
        catalog: Arc<dyn ChannelCatalog>,
        settings: EngineSettings,
    ) -> Self {
        let (events, _) = broadcast::channel(settings.event_capacity.max(1));
        Self {
            access,
            source,
            catalog,
            snapshot: None,
            recorder: None,
            settings,
            events,
            state: Mutex::new(ScanState::Idle),
            active: Mutex::new(None),
        }
    }

    /// Capture a configuration snapshot before each run.
    pub fn with_snapshot(mut self, provider: Arc<dyn SnapshotProvider>) -> Self {
        self.snapshot = Some(provider);
        self
    }

    /// Hand every finished run to `recorder`.
    pub fn with_recorder(mut self, recorder: Arc<dyn RunRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    /// Receive progress, step and termination events.
    pub fn subscribe(&self) -> broadcast::Receiver<ScanEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> ScanState {
        *self.state.lock()
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    fn set_state(&self, state: ScanState) {
        debug!(%state, "Scan state changed");
        *self.state.lock() = state;
    }

    /// Execute one scan.
    ///
    /// # Returns
    ///
    /// - `Ok(RunResult)` for every run that reached a termination code,
    ///   including aborted and failed ones (`-1` to `-4`)
    /// - `Err(Busy)` if another run is active
    /// - `Err(Configuration)` if the request is invalid or an auxiliary channel
    ///   cannot be connected; nothing is left modified in that case
    #[instrument(skip(self, request), fields(scan = %request.name, scan_type = %request.scan_type()))]
    pub async fn run(&self, request: &ScanRequest) -> ScanResult<RunResult> {
        request.validate()?;
        {
            let mut state = self.state.lock();
            if !state.can_begin() {
                return Err(ScanError::Busy(state.to_string()));
            }
            *state = ScanState::Configuring;
        }

        let result = self.execute(request).await;
        *self.active.lock() = None;
        match &result {
            Ok(run) => self.set_state(ScanState::finished(run.status)),
            Err(e) => {
                warn!(error = %e, "Scan did not start");
                self.set_state(ScanState::Idle);
            }
        }

        if let (Ok(run), Some(recorder)) = (&result, &self.recorder) {
            if let Err(e) = recorder.record(run).await {
                error!(error = %e, run_id = %run.run_id, "Failed to record run");
            }
        }
        result
    }

    async fn execute(&self, request: &ScanRequest) -> ScanResult<RunResult> {
        let ctx = RunContext {
            run_id: Uuid::new_v4().to_string(),
            started: Utc::now(),
        };
        info!(run_id = %ctx.run_id, "Starting scan");

        let gate = Arc::new(ScanGate::new());
        let actuator = Arc::new(
            ActuatorController::new(self.access.clone(), gate.clone(), self.events.clone())
                .with_poll_interval(self.settings.poll_interval)
                .with_connect_timeout(self.settings.connect_timeout),
        );
        *self.active.lock() = Some(ActiveRun {
            gate: gate.clone(),
            actuator: actuator.clone(),
            preaction: None,
        });

        let mut preaction =
            ChannelGroup::new("preaction", self.access.clone(), self.settings.connect_timeout);
        let names: Vec<String> = request.preaction.keys().cloned().collect();
        preaction.store(&names).await?;
        let preaction = Arc::new(preaction);
        if let Some(active) = self.active.lock().as_mut() {
            active.preaction = Some(preaction.clone());
        }

        let acquisition = AcquisitionLoop::new(
            actuator.clone(),
            preaction.clone(),
            self.events.clone(),
            self.settings.acquisition_options(),
        );

        if gate.is_abort_requested() {
            return Ok(self
                .end_early(&ctx, request, &acquisition, RunStatus::UserAbort)
                .await);
        }
        if let Err(e) = preaction.write(&request.preaction).await {
            self.unwind(&actuator, &preaction).await;
            return Err(e);
        }

        if let Err(e) = actuator
            .init(&request.actuators, request.timeout, request.settle, request.steps)
            .await
        {
            error!(error = %e, "Actuator initialization failed");
            let status = e.status().unwrap_or(RunStatus::ActuatorInitFailure);
            return Ok(self.end_early(&ctx, request, &acquisition, status).await);
        }
        if gate.is_abort_requested() {
            return Ok(self
                .end_early(&ctx, request, &acquisition, RunStatus::UserAbort)
                .await);
        }

        let classification = classify(self.catalog.as_ref(), &request.sensors);
        let mut aux = ChannelGroup::new("aux", self.access.clone(), self.settings.connect_timeout);
        match aux.store(&classification.aux).await {
            Ok(report) if report.is_complete() => {}
            Ok(report) => {
                self.unwind(&actuator, &preaction).await;
                return Err(ScanError::Configuration(format!(
                    "auxiliary channels not reachable: {}",
                    report.unreachable.join(", ")
                )));
            }
            Err(e) => {
                self.unwind(&actuator, &preaction).await;
                return Err(ScanError::Configuration(format!(
                    "auxiliary channels not readable: {e}"
                )));
            }
        }
        info!(
            fast = classification.fast.len(),
            aux = aux.len(),
            "Channels classified"
        );

        let columns: Vec<_> = classification
            .fast
            .iter()
            .map(|info| (info.clone(), ColumnSource::Stream))
            .chain(
                aux.channels()
                    .iter()
                    .map(|channel| (channel.info(), ColumnSource::Polled)),
            )
            .collect();
        let buffer = SampleBuffer::allocate(request.layout(), columns);

        let snapshot = match &self.snapshot {
            Some(provider) => match provider.capture().await {
                Ok(snapshot) => Some(snapshot),
                Err(e) => {
                    warn!(error = %e, "Configuration snapshot failed, continuing without");
                    None
                }
            },
            None => None,
        };

        self.set_state(ScanState::Running);
        let plan = AcquisitionPlan {
            fast: classification.fast,
            aux,
            buffer,
        };
        let task = {
            let acquisition = acquisition.clone();
            let source = self.source.clone();
            tokio::spawn(async move { acquisition.run(source.as_ref(), plan).await })
        };
        let outcome = match task.await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(error = %e, "Acquisition task failed");
                acquisition.finish(RunStatus::UserAbort).await;
                return Err(ScanError::Task(e.to_string()));
            }
        };

        Ok(RunResult {
            run_id: ctx.run_id,
            name: request.name.clone(),
            scan_type: request.scan_type(),
            status: outcome.status,
            processed: outcome.processed,
            buffer: outcome.buffer,
            ramp: actuator.ramp(),
            step_timeouts: actuator.step_timeouts(),
            snapshot,
            started: ctx.started,
            finished: Utc::now(),
        })
    }

    /// Terminate a run that never reached the acquisition loop.
    async fn end_early(
        &self,
        ctx: &RunContext,
        request: &ScanRequest,
        acquisition: &AcquisitionLoop,
        status: RunStatus,
    ) -> RunResult {
        acquisition.finish(status).await;
        RunResult {
            run_id: ctx.run_id.clone(),
            name: request.name.clone(),
            scan_type: request.scan_type(),
            status,
            processed: 0,
            buffer: SampleBuffer::allocate(request.layout(), std::iter::empty()),
            ramp: None,
            step_timeouts: Vec::new(),
            snapshot: None,
            started: ctx.started,
            finished: Utc::now(),
        }
    }

    /// Restore without publishing a termination code.
    async fn unwind(&self, actuator: &ActuatorController, preaction: &ChannelGroup) {
        if let Err(e) = actuator.terminate().await {
            error!(error = %e, "Actuator restore incomplete");
        }
        if let Err(e) = preaction.restore().await {
            error!(error = %e, "Preaction restore incomplete");
        }
    }

    /// Abort the active run.
    ///
    /// Sets the abort flag seen by both tasks. Once the loop is running the
    /// actuators and preaction channels are restored right here, without
    /// waiting for the loop to notice; during configuration the run restores
    /// them itself at its next checkpoint.
    #[instrument(skip(self))]
    pub async fn abort(&self) -> ScanResult<()> {
        let Some(active) = self.active.lock().clone() else {
            debug!("No active run to abort");
            return Ok(());
        };
        info!("Abort requested");
        active.gate.request_abort();
        if self.state() != ScanState::Running {
            return Ok(());
        }

        if let Err(e) = active.actuator.abort().await {
            error!(error = %e, "Actuator restore incomplete");
        }
        if let Some(preaction) = &active.preaction {
            preaction.restore().await?;
        }
        Ok(())
    }
}
