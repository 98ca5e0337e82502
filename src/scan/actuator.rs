//! Actuator stepping.
//!
//! [`ActuatorController`] owns the ramp of every actuator channel and the step
//! cursor. Each accepted [`increment`](ActuatorController::increment) launches
//! one step task that writes the set-points, waits for the readbacks to settle,
//! sleeps the settle time and finally publishes readiness through the
//! [`ScanGate`].
//!
//! # Step task
//!
//! ```text
//! increment() ──busy=true──> write set-points ──> poll readbacks ──> settle ──> ready_since=now, busy=false
//!                                                    │ timeout: flag step, continue
//!                                                    │ abort: exit, busy stays set
//! ```
//!
//! Set-point writes and the restore in [`terminate`](ActuatorController::terminate)
//! are serialized by one async lock, and the step task re-checks the abort flag
//! after taking it. A step task that loses the race against an abort therefore
//! never writes after the snapshot was restored.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, instrument, trace, warn};

use super::events::ScanEvent;
use super::gate::ScanGate;
use crate::channel::{ChannelAccess, ChannelGroup, ChannelRef, ChannelValue};
use crate::error::{ScanError, ScanResult};

/// Default readback poll interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Ramp definition of one actuator channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActuatorDefinition {
    pub start: f64,
    pub end: f64,
    /// Offset start and end by the value stored at init
    #[serde(default)]
    pub relative: bool,
    /// Channel confirming the set-point was reached
    #[serde(default)]
    pub readback: Option<String>,
    /// Maximum absolute deviation of the readback; required with `readback`
    #[serde(default)]
    pub tolerance: Option<f64>,
}

impl ActuatorDefinition {
    pub fn new(start: f64, end: f64) -> Self {
        Self {
            start,
            end,
            relative: false,
            readback: None,
            tolerance: None,
        }
    }

    pub fn relative(mut self) -> Self {
        self.relative = true;
        self
    }

    pub fn with_readback(mut self, readback: impl Into<String>, tolerance: f64) -> Self {
        self.readback = Some(readback.into());
        self.tolerance = Some(tolerance);
        self
    }

    fn check(&self, name: &str) -> ScanResult<()> {
        if !self.start.is_finite() || !self.end.is_finite() {
            return Err(ScanError::Configuration(format!(
                "{name}: start and end must be finite"
            )));
        }
        match (&self.readback, self.tolerance) {
            (Some(readback), None) => Err(ScanError::Configuration(format!(
                "{name}: readback '{readback}' configured without a tolerance"
            ))),
            (_, Some(tolerance)) if tolerance.is_nan() || tolerance < 0.0 => Err(ScanError::Configuration(
                format!("{name}: tolerance must be a non-negative number"),
            )),
            _ => Ok(()),
        }
    }
}

/// `n` evenly spaced values from `start` to `end`, both included.
pub fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let span = end - start;
            let last = (n - 1) as f64;
            (0..n)
                .map(|i| {
                    if i == n - 1 {
                        end
                    } else {
                        start + span * (i as f64 / last)
                    }
                })
                .collect()
        }
    }
}

/// Set-points of every actuator channel, one per step.
///
/// All ramps share the same number of steps; the table cannot be built
/// otherwise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RampTable {
    nsteps: usize,
    ramps: BTreeMap<String, Vec<f64>>,
}

impl RampTable {
    /// Interpolate every definition over `nsteps` points.
    ///
    /// `reference` supplies the stored value for relative ramps.
    pub fn build<F>(
        definitions: &BTreeMap<String, ActuatorDefinition>,
        nsteps: usize,
        reference: F,
    ) -> ScanResult<Self>
    where
        F: Fn(&str) -> Option<f64>,
    {
        if nsteps == 0 {
            return Err(ScanError::Configuration(
                "an actuated scan needs at least one step".into(),
            ));
        }
        let mut ramps = BTreeMap::new();
        for (name, definition) in definitions {
            let offset = if definition.relative {
                reference(name).ok_or_else(|| {
                    ScanError::Configuration(format!(
                        "{name}: relative ramp needs a scalar reference value"
                    ))
                })?
            } else {
                0.0
            };
            ramps.insert(
                name.clone(),
                linspace(definition.start + offset, definition.end + offset, nsteps),
            );
        }
        Ok(Self { nsteps, ramps })
    }

    pub fn nsteps(&self) -> usize {
        self.nsteps
    }

    pub fn channels(&self) -> impl Iterator<Item = &str> {
        self.ramps.keys().map(String::as_str)
    }

    pub fn values(&self, channel: &str) -> Option<&[f64]> {
        self.ramps.get(channel).map(Vec::as_slice)
    }

    /// Set-point of `channel` at `step`.
    pub fn setpoint(&self, channel: &str, step: usize) -> Option<f64> {
        self.ramps.get(channel).and_then(|r| r.get(step)).copied()
    }
}

#[derive(Debug)]
struct Readback {
    channel: ChannelRef,
    tolerance: f64,
}

#[derive(Debug, Default)]
struct StepLog {
    timeouts: Vec<bool>,
    ready_at: Vec<Option<DateTime<Utc>>>,
}

/// Everything a step task needs, fixed at init.
struct StepPlan {
    access: Arc<dyn ChannelAccess>,
    group: ChannelGroup,
    readbacks: Vec<Option<Readback>>,
    ramp: RampTable,
    timeout: Duration,
    settle: Duration,
    log: Mutex<StepLog>,
}

impl StepPlan {
    async fn settled(&self, step: usize) -> bool {
        for (channel, readback) in self.group.channels().iter().zip(&self.readbacks) {
            let Some(readback) = readback else {
                continue;
            };
            let Some(target) = self.ramp.setpoint(&channel.name, step) else {
                continue;
            };
            match self.access.get(&readback.channel).await {
                Ok(value) => match value.as_scalar() {
                    Some(v) if (v - target).abs() <= readback.tolerance => {}
                    _ => return false,
                },
                Err(e) => {
                    trace!(channel = %readback.channel.name, error = %e, "Readback read failed");
                    return false;
                }
            }
        }
        true
    }

    async fn verify(&self, step: usize, ctx: &StepContext) -> ScanResult<()> {
        let started = Instant::now();
        loop {
            if ctx.gate.is_abort_requested() {
                return Err(ScanError::UserAbort);
            }
            if self.settled(step).await {
                return Ok(());
            }
            if started.elapsed() > self.timeout {
                return Err(ScanError::AcquisitionTimeout {
                    step,
                    timeout: self.timeout,
                });
            }
            tokio::select! {
                _ = sleep(ctx.poll_interval) => {}
                _ = ctx.gate.aborted() => return Err(ScanError::UserAbort),
            }
        }
    }
}

#[derive(Clone)]
struct StepContext {
    gate: Arc<ScanGate>,
    events: broadcast::Sender<ScanEvent>,
    write_lock: Arc<AsyncMutex<()>>,
    poll_interval: Duration,
}

async fn step_task(plan: Arc<StepPlan>, step: usize, ctx: StepContext) {
    {
        let _guard = ctx.write_lock.lock().await;
        if ctx.gate.is_abort_requested() {
            debug!(step, "Abort requested before set-points were written");
            return;
        }
        for (index, channel) in plan.group.channels().iter().enumerate() {
            let Some(target) = plan.ramp.setpoint(&channel.name, step) else {
                continue;
            };
            debug!(step, channel = %channel.name, target, "Writing set-point");
            if let Err(e) = plan.group.put_at(index, &ChannelValue::Scalar(target)).await {
                warn!(step, channel = %channel.name, error = %e, "Set-point write failed");
            }
        }
    }

    match plan.verify(step, &ctx).await {
        Ok(()) => {}
        Err(e) if e.is_soft() => {
            warn!(step, error = %e, "Continuing with unsettled readbacks");
            if let Some(flag) = plan.log.lock().timeouts.get_mut(step) {
                *flag = true;
            }
            let _ = ctx.events.send(ScanEvent::StepTimeout { step });
        }
        Err(e) => {
            debug!(step, error = %e, "Step abandoned while waiting for readbacks");
            return;
        }
    }

    if !plan.settle.is_zero() {
        tokio::select! {
            _ = sleep(plan.settle) => {}
            _ = ctx.gate.aborted() => return,
        }
    }

    let now = Utc::now();
    if let Some(slot) = plan.log.lock().ready_at.get_mut(step) {
        *slot = Some(now);
    }
    ctx.gate.mark_ready(now);
    debug!(step, "Step ready");
    let _ = ctx.events.send(ScanEvent::StepReady { step });
}

struct ControllerState {
    actuated: bool,
    initialized: bool,
    cursor: isize,
    plan: Option<Arc<StepPlan>>,
    task: Option<JoinHandle<()>>,
}

/// Drives actuator channels through their ramps, one step at a time.
///
/// One controller serves exactly one run.
pub struct ActuatorController {
    access: Arc<dyn ChannelAccess>,
    gate: Arc<ScanGate>,
    events: broadcast::Sender<ScanEvent>,
    poll_interval: Duration,
    connect_timeout: Duration,
    write_lock: Arc<AsyncMutex<()>>,
    state: Mutex<ControllerState>,
}

impl ActuatorController {
    pub fn new(
        access: Arc<dyn ChannelAccess>,
        gate: Arc<ScanGate>,
        events: broadcast::Sender<ScanEvent>,
    ) -> Self {
        Self {
            access,
            gate,
            events,
            poll_interval: DEFAULT_POLL_INTERVAL,
            connect_timeout: Duration::from_millis(500),
            write_lock: Arc::new(AsyncMutex::new(())),
            state: Mutex::new(ControllerState {
                actuated: false,
                initialized: false,
                cursor: -1,
                plan: None,
                task: None,
            }),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Connect the actuators, store their values and build the ramps.
    ///
    /// With no definitions the scan is a time recording and this succeeds
    /// without touching any channel.
    ///
    /// # Errors
    ///
    /// - `ConnectionFailure` if an actuator or readback channel is unreachable
    /// - `Configuration` for a readback without tolerance, `nsteps == 0`, or a
    ///   relative ramp on a channel without a scalar value
    #[instrument(skip(self, definitions), fields(actuators = definitions.len()))]
    pub async fn init(
        &self,
        definitions: &BTreeMap<String, ActuatorDefinition>,
        timeout: Duration,
        settle: Duration,
        nsteps: usize,
    ) -> ScanResult<()> {
        if definitions.is_empty() {
            let mut state = self.state.lock();
            state.actuated = false;
            state.initialized = true;
            state.cursor = -1;
            state.plan = None;
            info!("No actuators defined, recording over time");
            return Ok(());
        }
        for (name, definition) in definitions {
            definition.check(name)?;
        }

        let names: Vec<String> = definitions.keys().cloned().collect();
        let mut group = ChannelGroup::new("actuators", self.access.clone(), self.connect_timeout);
        let report = group.store(&names).await?;
        if let Some(channel) = report.unreachable.first() {
            return Err(ScanError::ConnectionFailure {
                channel: channel.clone(),
            });
        }

        let mut readbacks = Vec::with_capacity(group.len());
        for definition in definitions.values() {
            let readback = match (&definition.readback, definition.tolerance) {
                (Some(name), Some(tolerance)) => {
                    let channel = self
                        .access
                        .connect(name, self.connect_timeout)
                        .await
                        .map_err(|e| {
                            warn!(channel = %name, error = %e, "Readback not reachable");
                            ScanError::ConnectionFailure {
                                channel: name.clone(),
                            }
                        })?;
                    Some(Readback { channel, tolerance })
                }
                _ => None,
            };
            readbacks.push(readback);
        }

        let ramp = RampTable::build(definitions, nsteps, |name| {
            group.stored_value(name).and_then(ChannelValue::as_scalar)
        })?;

        let plan = StepPlan {
            access: self.access.clone(),
            group,
            readbacks,
            ramp,
            timeout,
            settle,
            log: Mutex::new(StepLog {
                timeouts: vec![false; nsteps],
                ready_at: vec![None; nsteps],
            }),
        };
        {
            let mut state = self.state.lock();
            state.actuated = true;
            state.initialized = true;
            state.cursor = -1;
            state.plan = Some(Arc::new(plan));
            state.task = None;
        }
        self.gate.release();
        info!(nsteps, "Actuators initialized");
        Ok(())
    }

    /// Request the next step.
    ///
    /// # Returns
    ///
    /// - `true` if a step task was launched, or immediately when not actuated
    /// - `false` while a step is still in flight, once the ramp is exhausted,
    ///   after an abort, or after `terminate`
    pub fn increment(&self) -> bool {
        let mut state = self.state.lock();
        if !state.actuated {
            return true;
        }
        if self.gate.is_busy() {
            return false;
        }
        state.cursor += 1;
        let Some(plan) = state.plan.clone() else {
            return false;
        };
        let step = match usize::try_from(state.cursor) {
            Ok(step) if step < plan.ramp.nsteps() => step,
            _ => {
                debug!(cursor = state.cursor, "Ramp exhausted");
                return false;
            }
        };
        if self.gate.is_abort_requested() || !state.initialized {
            return false;
        }
        if !self.gate.try_acquire() {
            return false;
        }

        info!(step, "Starting step");
        let ctx = StepContext {
            gate: self.gate.clone(),
            events: self.events.clone(),
            write_lock: self.write_lock.clone(),
            poll_interval: self.poll_interval,
        };
        state.task = Some(tokio::spawn(step_task(plan, step, ctx)));
        true
    }

    /// Request an abort, then restore the actuators.
    pub async fn abort(&self) -> ScanResult<usize> {
        self.gate.request_abort();
        self.terminate().await
    }

    /// Restore the actuator values stored at init.
    ///
    /// Waits for an in-flight step task first. Only the first call writes.
    #[instrument(skip(self))]
    pub async fn terminate(&self) -> ScanResult<usize> {
        let (plan, task) = {
            let mut state = self.state.lock();
            state.initialized = false;
            (state.plan.clone(), state.task.take())
        };
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Step task did not finish cleanly");
            }
        }
        let Some(plan) = plan else {
            return Ok(0);
        };
        let _guard = self.write_lock.lock().await;
        plan.group.restore().await
    }

    pub fn is_actuated(&self) -> bool {
        self.state.lock().actuated
    }

    /// Step of the most recent `increment`, if any.
    pub fn current_step(&self) -> Option<usize> {
        usize::try_from(self.state.lock().cursor).ok()
    }

    pub fn nsteps(&self) -> Option<usize> {
        self.state.lock().plan.as_ref().map(|p| p.ramp.nsteps())
    }

    /// Ramp in use, `None` for a time recording.
    pub fn ramp(&self) -> Option<RampTable> {
        self.state.lock().plan.as_ref().map(|p| p.ramp.clone())
    }

    /// One flag per step, set when its readbacks did not settle in time.
    pub fn step_timeouts(&self) -> Vec<bool> {
        self.state
            .lock()
            .plan
            .as_ref()
            .map(|p| p.log.lock().timeouts.clone())
            .unwrap_or_default()
    }

    /// Readiness timestamp of every step that became ready.
    pub fn ready_times(&self) -> Vec<Option<DateTime<Utc>>> {
        self.state
            .lock()
            .plan
            .as_ref()
            .map(|p| p.log.lock().ready_at.clone())
            .unwrap_or_default()
    }

    pub fn gate(&self) -> &Arc<ScanGate> {
        &self.gate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::sim::SimChannelAccess;

    fn controller(access: Arc<SimChannelAccess>) -> (ActuatorController, broadcast::Receiver<ScanEvent>) {
        let (events, rx) = broadcast::channel(64);
        let controller = ActuatorController::new(access, Arc::new(ScanGate::new()), events)
            .with_poll_interval(Duration::from_millis(5))
            .with_connect_timeout(Duration::from_millis(10));
        (controller, rx)
    }

    fn single(name: &str, definition: ActuatorDefinition) -> BTreeMap<String, ActuatorDefinition> {
        BTreeMap::from([(name.to_string(), definition)])
    }

    async fn wait_idle(gate: &ScanGate) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while gate.is_busy() {
                sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .unwrap();
    }

    #[test]
    fn test_linspace_bounds_and_monotonic() {
        let values = linspace(0.0, 10.0, 5);
        assert_eq!(values, vec![0.0, 2.5, 5.0, 7.5, 10.0]);

        let down = linspace(3.0, -1.0, 7);
        assert_eq!(down.len(), 7);
        assert_eq!(down[0], 3.0);
        assert_eq!(down[6], -1.0);
        assert!(down.windows(2).all(|w| w[1] <= w[0]));

        assert_eq!(linspace(4.0, 9.0, 1), vec![4.0]);
        assert!(linspace(0.0, 1.0, 0).is_empty());
    }

    #[test]
    fn test_degenerate_ramp() {
        let table =
            RampTable::build(&single("A", ActuatorDefinition::new(2.0, 2.0)), 4, |_| None).unwrap();
        assert_eq!(table.values("A"), Some(&[2.0, 2.0, 2.0, 2.0][..]));
    }

    #[test]
    fn test_relative_ramp_uses_reference() {
        let definitions = single("A", ActuatorDefinition::new(-1.0, 1.0).relative());
        let table = RampTable::build(&definitions, 3, |_| Some(10.0)).unwrap();
        assert_eq!(table.values("A"), Some(&[9.0, 10.0, 11.0][..]));

        let err = RampTable::build(&definitions, 3, |_| None).unwrap_err();
        assert!(matches!(err, ScanError::Configuration(_)));
        assert!(matches!(
            RampTable::build(&definitions, 0, |_| Some(0.0)),
            Err(ScanError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_not_actuated_increment_is_immediate() {
        let access = Arc::new(SimChannelAccess::new());
        let (controller, _rx) = controller(access.clone());
        controller
            .init(&BTreeMap::new(), Duration::from_secs(1), Duration::ZERO, 0)
            .await
            .unwrap();

        for _ in 0..10 {
            assert!(controller.increment());
        }
        assert!(!controller.is_actuated());
        assert!(!controller.gate().is_busy());
        assert!(controller.ramp().is_none());
        assert!(access.write_log().is_empty());
        assert_eq!(controller.terminate().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_init_rejects_readback_without_tolerance() {
        let access = Arc::new(SimChannelAccess::new());
        access.add_scalar("A:SET", 0.0);
        let (controller, _rx) = controller(access);
        let mut definition = ActuatorDefinition::new(0.0, 1.0);
        definition.readback = Some("A:RB".into());

        let err = controller
            .init(&single("A:SET", definition), Duration::from_secs(1), Duration::ZERO, 3)
            .await
            .unwrap_err();
        assert!(matches!(err, ScanError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_init_reports_unreachable_channel() {
        let access = Arc::new(SimChannelAccess::new());
        access.add_scalar("A:SET", 0.0);
        access.set_unreachable("A:SET");
        let (controller, _rx) = controller(access);

        let err = controller
            .init(
                &single("A:SET", ActuatorDefinition::new(0.0, 1.0)),
                Duration::from_secs(1),
                Duration::ZERO,
                3,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ScanError::ConnectionFailure { channel } if channel == "A:SET"));
    }

    #[tokio::test]
    async fn test_step_sets_and_publishes_readiness() {
        let access = Arc::new(SimChannelAccess::new());
        access.add_scalar("A:SET", 0.0);
        access.add_scalar("A:RB", 0.0);
        access.link_readback("A:RB", "A:SET", Duration::from_millis(20));
        let (controller, mut rx) = controller(access.clone());
        controller
            .init(
                &single("A:SET", ActuatorDefinition::new(1.0, 3.0).with_readback("A:RB", 0.1)),
                Duration::from_secs(1),
                Duration::from_millis(5),
                3,
            )
            .await
            .unwrap();

        assert!(controller.increment());
        assert!(controller.gate().is_busy());
        assert!(!controller.increment(), "second step must wait for the first");

        wait_idle(controller.gate()).await;
        assert_eq!(access.value("A:SET"), Some(ChannelValue::Scalar(1.0)));
        assert_eq!(rx.recv().await.unwrap(), ScanEvent::StepReady { step: 0 });
        assert_eq!(controller.current_step(), Some(0));
        let ready = controller.ready_times();
        assert!(ready[0].is_some());
        assert_eq!(controller.gate().ready_since(), ready[0].unwrap());
    }

    #[tokio::test]
    async fn test_ramp_exhaustion_and_restore_once() {
        let access = Arc::new(SimChannelAccess::new());
        access.add_scalar("A:SET", 7.0);
        let (controller, _rx) = controller(access.clone());
        controller
            .init(
                &single("A:SET", ActuatorDefinition::new(0.0, 1.0)),
                Duration::from_secs(1),
                Duration::ZERO,
                2,
            )
            .await
            .unwrap();

        assert!(controller.increment());
        wait_idle(controller.gate()).await;
        assert!(controller.increment());
        wait_idle(controller.gate()).await;
        assert!(!controller.increment());
        assert_eq!(access.value("A:SET"), Some(ChannelValue::Scalar(1.0)));

        assert_eq!(controller.terminate().await.unwrap(), 1);
        assert_eq!(controller.terminate().await.unwrap(), 0);
        assert_eq!(access.value("A:SET"), Some(ChannelValue::Scalar(7.0)));
        assert_eq!(access.write_count("A:SET"), 3);
        assert!(!controller.increment());
    }

    #[tokio::test]
    async fn test_timeout_is_flagged_and_scan_continues() {
        let access = Arc::new(SimChannelAccess::new());
        access.add_scalar("A:SET", 0.0);
        access.add_scalar("A:RB", 0.0);
        access.link_readback_with_offset("A:RB", "A:SET", Duration::ZERO, 1.0);
        let (controller, mut rx) = controller(access);
        controller
            .init(
                &single("A:SET", ActuatorDefinition::new(0.0, 1.0).with_readback("A:RB", 0.1)),
                Duration::from_millis(20),
                Duration::ZERO,
                2,
            )
            .await
            .unwrap();

        assert!(controller.increment());
        wait_idle(controller.gate()).await;
        assert_eq!(rx.recv().await.unwrap(), ScanEvent::StepTimeout { step: 0 });
        assert_eq!(rx.recv().await.unwrap(), ScanEvent::StepReady { step: 0 });
        assert_eq!(controller.step_timeouts(), vec![true, false]);
        assert!(controller.increment());
    }

    #[tokio::test]
    async fn test_abort_during_poll_restores_without_readiness() {
        let access = Arc::new(SimChannelAccess::new());
        access.add_scalar("A:SET", 5.0);
        access.add_scalar("A:RB", 5.0);
        access.link_readback("A:RB", "A:SET", Duration::from_secs(60));
        let (controller, _rx) = controller(access.clone());
        controller
            .init(
                &single("A:SET", ActuatorDefinition::new(0.0, 1.0).with_readback("A:RB", 0.01)),
                Duration::from_secs(30),
                Duration::ZERO,
                2,
            )
            .await
            .unwrap();

        assert!(controller.increment());
        sleep(Duration::from_millis(20)).await;
        assert_eq!(access.value("A:SET"), Some(ChannelValue::Scalar(0.0)));

        let restored = tokio::time::timeout(Duration::from_secs(1), controller.abort())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(restored, 1);
        assert_eq!(access.value("A:SET"), Some(ChannelValue::Scalar(5.0)));
        assert_eq!(controller.ready_times(), vec![None, None]);
        assert!(!controller.increment());
    }
}
