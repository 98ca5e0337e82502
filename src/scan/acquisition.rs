//! Acquisition loop.
//!
//! Consumes the telemetry stream, drops every packet the gate does not admit,
//! bounds runs of incomplete packets, fills the [`SampleBuffer`] and requests
//! the next actuator step whenever a step's samples are complete.
//!
//! The loop never waits on the step task: while a step is in flight packets are
//! simply discarded, so rejection of stale samples is paced by the stream rate.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, error, info, instrument, trace, warn};

use super::actuator::ActuatorController;
use super::buffer::SampleBuffer;
use super::events::ScanEvent;
use super::gate::ScanGate;
use crate::channel::{ChannelGroup, ChannelInfo, ChannelValue};
use crate::error::{RunStatus, ScanError, ScanResult};
use crate::stream::{ChannelCatalog, Packet, TelemetrySource, TelemetryStream};

/// Default ceiling of consecutive incomplete packets.
pub const DEFAULT_MAX_RETRIES: usize = 1000;

/// Requested channels split by how they are acquired.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Classification {
    /// Carried by the stream, with the catalog's spelling and shape
    pub fast: Vec<ChannelInfo>,
    /// Read through the channel transport for every sample
    pub aux: Vec<String>,
}

/// Split `requested` into stream and auxiliary channels.
///
/// Lookup ignores case; duplicates are dropped.
pub fn classify(catalog: &dyn ChannelCatalog, requested: &[String]) -> Classification {
    let mut classification = Classification::default();
    for name in requested {
        match catalog.lookup(name) {
            Some(info) => {
                if !classification.fast.iter().any(|f| f.name == info.name) {
                    classification.fast.push(info);
                }
            }
            None => {
                debug!(channel = %name, "Channel not carried by the stream, polling it instead");
                if !classification.aux.contains(name) {
                    classification.aux.push(name.clone());
                }
            }
        }
    }
    classification
}

/// Loop tuning.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AcquisitionOptions {
    /// Consecutive incomplete packets tolerated before giving up
    pub max_retries: usize,
    /// Fraction of the total between progress notifications
    pub progress_fraction: f64,
}

impl Default for AcquisitionOptions {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            progress_fraction: 0.1,
        }
    }
}

impl AcquisitionOptions {
    /// Samples between two progress notifications, at least 1.
    pub fn progress_every(&self, total: usize) -> usize {
        ((total as f64 * self.progress_fraction).round() as usize).max(1)
    }
}

/// Channels and storage of one run.
#[derive(Debug)]
pub struct AcquisitionPlan {
    pub fast: Vec<ChannelInfo>,
    pub aux: ChannelGroup,
    pub buffer: SampleBuffer,
}

/// What the loop hands back.
#[derive(Debug)]
pub struct LoopOutcome {
    pub status: RunStatus,
    pub processed: usize,
    pub buffer: SampleBuffer,
}

struct Progress {
    total: usize,
    every: usize,
    processed: usize,
    reported: usize,
}

impl Progress {
    fn emit(&mut self, events: &broadcast::Sender<ScanEvent>) {
        self.reported = self.processed;
        let _ = events.send(ScanEvent::Progress {
            processed: self.processed,
            total: self.total,
        });
    }

    fn advance(&mut self, events: &broadcast::Sender<ScanEvent>) {
        self.processed += 1;
        if self.processed % self.every == 0 {
            self.emit(events);
        }
    }

    fn flush(&mut self, events: &broadcast::Sender<ScanEvent>) {
        if self.reported < self.processed {
            self.emit(events);
        }
    }
}

/// Stream-consuming side of a run.
#[derive(Clone)]
pub struct AcquisitionLoop {
    gate: Arc<ScanGate>,
    actuator: Arc<ActuatorController>,
    preaction: Arc<ChannelGroup>,
    events: broadcast::Sender<ScanEvent>,
    options: AcquisitionOptions,
    terminated: Arc<AtomicBool>,
}

impl AcquisitionLoop {
    pub fn new(
        actuator: Arc<ActuatorController>,
        preaction: Arc<ChannelGroup>,
        events: broadcast::Sender<ScanEvent>,
        options: AcquisitionOptions,
    ) -> Self {
        Self {
            gate: actuator.gate().clone(),
            actuator,
            preaction,
            events,
            options,
            terminated: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Open the stream, start the first step and record until the run ends.
    ///
    /// Always returns with actuators and preaction channels restored and the
    /// `Terminated` event sent.
    #[instrument(skip_all, fields(total = plan.buffer.layout().total()))]
    pub async fn run(&self, source: &dyn TelemetrySource, plan: AcquisitionPlan) -> LoopOutcome {
        let AcquisitionPlan {
            fast,
            aux,
            mut buffer,
        } = plan;
        let total = buffer.layout().total();
        let mut progress = Progress {
            total,
            every: self.options.progress_every(total),
            processed: 0,
            reported: 0,
        };

        let result = match source.open(&fast).await {
            Ok(stream) => {
                info!(fast = fast.len(), aux = aux.len(), "Telemetry stream opened");
                self.actuator.increment();
                progress.emit(&self.events);
                self.runner(stream, &fast, &aux, &mut buffer, &mut progress)
                    .await
            }
            Err(e) => {
                error!(error = %e, "Cannot establish telemetry stream");
                Err(ScanError::StreamEstablish(e.to_string()))
            }
        };
        let status = match result {
            Ok(()) => RunStatus::Completed,
            Err(e) => e.status().unwrap_or_else(|| {
                error!(error = %e, "Acquisition ended by an unexpected error");
                RunStatus::StreamEstablishFailure
            }),
        };

        progress.flush(&self.events);
        self.finish(status).await;
        LoopOutcome {
            status,
            processed: progress.processed,
            buffer,
        }
    }

    async fn runner(
        &self,
        mut stream: Box<dyn TelemetryStream>,
        fast: &[ChannelInfo],
        aux: &ChannelGroup,
        buffer: &mut SampleBuffer,
        progress: &mut Progress,
    ) -> ScanResult<()> {
        let layout = buffer.layout();
        let aux_names = aux.names();
        let mut retries = 0usize;
        let mut step = 0usize;
        let mut sample = 0usize;

        loop {
            if progress.processed >= progress.total {
                return Ok(());
            }
            if self.gate.is_abort_requested() {
                info!(processed = progress.processed, "Abort observed");
                return Err(ScanError::UserAbort);
            }

            let packet = tokio::select! {
                biased;
                _ = self.gate.aborted() => {
                    info!(processed = progress.processed, "Abort observed while waiting for data");
                    return Err(ScanError::UserAbort);
                }
                received = stream.receive() => match received {
                    Ok(packet) => packet,
                    Err(e) => {
                        error!(error = %e, "Telemetry stream lost");
                        return Err(ScanError::StreamEstablish(e.to_string()));
                    }
                },
            };

            if !self.gate.admits(packet.timestamp) {
                trace!(pulse_id = packet.pulse_id, "Actuator not ready, packet discarded");
                continue;
            }

            let aux_values = match self.complete_sample(&packet, fast, aux, buffer).await {
                Some(values) => values,
                None => {
                    retries += 1;
                    if retries > self.options.max_retries {
                        warn!(retries, "Too many consecutive incomplete packets");
                        return Err(ScanError::StreamRetryExceeded { retries });
                    }
                    trace!(pulse_id = packet.pulse_id, retries, "Incomplete packet discarded");
                    continue;
                }
            };
            retries = 0;

            let mut values: Vec<(&str, &ChannelValue)> =
                Vec::with_capacity(fast.len() + aux_values.len());
            for info in fast {
                if let Some(value) = packet.value(&info.name) {
                    values.push((info.name.as_str(), value));
                }
            }
            for (name, value) in aux_names.iter().zip(&aux_values) {
                values.push((name.as_str(), value));
            }
            if let Err(e) = buffer.record(step, sample, packet.pulse_id, packet.timestamp, &values)
            {
                error!(step, sample, error = %e, "Sample could not be stored");
                return Err(ScanError::StreamRetryExceeded { retries });
            }

            progress.advance(&self.events);
            sample += 1;
            if sample == layout.samples {
                sample = 0;
                step += 1;
                if progress.processed < progress.total && !self.actuator.increment() {
                    debug!(step, "Next step not started");
                }
            }
        }
    }

    /// Aux values for a packet whose stream values are all present and shaped
    /// as classified, `None` if the packet is incomplete.
    async fn complete_sample(
        &self,
        packet: &Packet,
        fast: &[ChannelInfo],
        aux: &ChannelGroup,
        buffer: &SampleBuffer,
    ) -> Option<Vec<ChannelValue>> {
        let stream_complete = fast.iter().all(|info| {
            packet
                .value(&info.name)
                .is_some_and(|value| value.shape() == info.shape)
        });
        if !stream_complete {
            return None;
        }
        let values = match aux.read().await {
            Ok(values) => values,
            Err(e) => {
                debug!(error = %e, "Auxiliary read failed");
                return None;
            }
        };
        let aux_complete = aux
            .channels()
            .iter()
            .zip(&values)
            .all(|(channel, value)| buffer.accepts(&channel.name, value));
        aux_complete.then_some(values)
    }

    /// Restore actuators and preaction channels, then publish `Terminated`.
    ///
    /// Only the first call per run does anything.
    pub async fn finish(&self, status: RunStatus) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        if !status.is_success() {
            self.gate.request_abort();
        }
        if let Err(e) = self.actuator.terminate().await {
            error!(error = %e, "Actuator restore incomplete");
        }
        if let Err(e) = self.preaction.restore().await {
            error!(error = %e, "Preaction restore incomplete");
        }
        info!(code = status.code(), "Scan terminated: {}", status);
        let _ = self.events.send(ScanEvent::Terminated { status });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::sim::SimChannelAccess;
    use crate::scan::buffer::{BufferLayout, ColumnSource};
    use crate::stream::sim::{SimTelemetrySource, Signal};
    use crate::stream::StaticCatalog;
    use std::collections::BTreeMap;
    use std::time::Duration;

    struct Harness {
        access: Arc<SimChannelAccess>,
        acquisition: AcquisitionLoop,
        events: broadcast::Receiver<ScanEvent>,
    }

    async fn harness(options: AcquisitionOptions) -> Harness {
        let access = Arc::new(SimChannelAccess::new());
        access.add_scalar("GAUGE:P", 1e-9);
        access.add_scalar("LASER:SHUTTER", 0.0);

        let (events, rx) = broadcast::channel(256);
        let actuator = Arc::new(ActuatorController::new(
            access.clone(),
            Arc::new(ScanGate::new()),
            events.clone(),
        ));
        actuator
            .init(&BTreeMap::new(), Duration::from_secs(1), Duration::ZERO, 0)
            .await
            .unwrap();

        let mut preaction = ChannelGroup::new("preaction", access.clone(), Duration::ZERO);
        preaction
            .store(&["LASER:SHUTTER".to_string()])
            .await
            .unwrap();
        preaction
            .write(&BTreeMap::from([(
                "LASER:SHUTTER".to_string(),
                ChannelValue::Scalar(1.0),
            )]))
            .await
            .unwrap();

        Harness {
            access,
            acquisition: AcquisitionLoop::new(actuator, Arc::new(preaction), events, options),
            events: rx,
        }
    }

    async fn time_plan(access: &Arc<SimChannelAccess>, samples: usize, aux: &[&str]) -> AcquisitionPlan {
        let fast = vec![ChannelInfo::scalar("BPM:X")];
        let mut group = ChannelGroup::new("aux", access.clone(), Duration::ZERO);
        let names: Vec<String> = aux.iter().map(|s| s.to_string()).collect();
        group.store(&names).await.unwrap();
        let columns = fast
            .iter()
            .map(|info| (info.clone(), ColumnSource::Stream))
            .chain(
                group
                    .channels()
                    .iter()
                    .map(|c| (c.info(), ColumnSource::Polled)),
            )
            .collect::<Vec<_>>();
        AcquisitionPlan {
            fast,
            aux: group,
            buffer: SampleBuffer::allocate(BufferLayout::time_recording(samples), columns),
        }
    }

    fn drain(rx: &mut broadcast::Receiver<ScanEvent>) -> Vec<ScanEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn source() -> SimTelemetrySource {
        SimTelemetrySource::new(Duration::ZERO)
            .with_channel(ChannelInfo::scalar("BPM:X"), Signal::Counter)
    }

    #[test]
    fn test_classify_ignores_case_and_duplicates() {
        let catalog = StaticCatalog::new(vec![
            ChannelInfo::scalar("SARFE10-PBPG050:ENERGY"),
            ChannelInfo::array("SARES11-SPEC:Y", 8),
        ]);
        let requested: Vec<String> = [
            "sarfe10-pbpg050:energy",
            "SARES11-SPEC:Y",
            "SARFE10-PBPG050:ENERGY",
            "GAUGE:P",
            "GAUGE:P",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        let classification = classify(&catalog, &requested);
        assert_eq!(
            classification.fast,
            vec![
                ChannelInfo::scalar("SARFE10-PBPG050:ENERGY"),
                ChannelInfo::array("SARES11-SPEC:Y", 8)
            ]
        );
        assert_eq!(classification.aux, vec!["GAUGE:P".to_string()]);
    }

    #[test]
    fn test_progress_interval() {
        let options = AcquisitionOptions::default();
        assert_eq!(options.progress_every(100), 10);
        assert_eq!(options.progress_every(15), 2);
        assert_eq!(options.progress_every(3), 1);
        assert_eq!(options.progress_every(0), 1);
    }

    #[tokio::test]
    async fn test_time_recording_completes() {
        let mut h = harness(AcquisitionOptions::default()).await;
        let plan = time_plan(&h.access, 20, &["GAUGE:P"]).await;

        let outcome = h.acquisition.run(&source(), plan).await;
        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(outcome.processed, 20);
        assert!(outcome.buffer.is_full());
        assert_eq!(outcome.buffer.get("GAUGE:P", 0, 19), Some(&[1e-9][..]));

        let ids: Vec<u64> = outcome.buffer.shot_ids().iter().flatten().copied().collect();
        assert!(ids.windows(2).all(|w| w[0] < w[1]));

        let events = drain(&mut h.events);
        assert_eq!(
            events.first(),
            Some(&ScanEvent::Progress {
                processed: 0,
                total: 20
            })
        );
        let progress: Vec<usize> = events
            .iter()
            .filter_map(|e| match e {
                ScanEvent::Progress { processed, .. } => Some(*processed),
                _ => None,
            })
            .collect();
        assert_eq!(progress, vec![0, 2, 4, 6, 8, 10, 12, 14, 16, 18, 20]);
        assert_eq!(
            events.last(),
            Some(&ScanEvent::Terminated {
                status: RunStatus::Completed
            })
        );
        // Preaction restored
        assert_eq!(h.access.value("LASER:SHUTTER"), Some(ChannelValue::Scalar(0.0)));
    }

    #[tokio::test]
    async fn test_transient_dropout_is_tolerated() {
        let h = harness(AcquisitionOptions {
            max_retries: 10,
            ..Default::default()
        })
        .await;
        let plan = time_plan(&h.access, 10, &[]).await;

        // One burst of 8 incomplete packets, below the ceiling
        let source = source().with_dropout(2, 8);
        let outcome = h.acquisition.run(&source, plan).await;
        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(outcome.processed, 10);
    }

    #[tokio::test]
    async fn test_valid_packet_resets_retry_count() {
        let h = harness(AcquisitionOptions {
            max_retries: 10,
            ..Default::default()
        })
        .await;
        let plan = time_plan(&h.access, 10, &[]).await;

        // Two bursts of 8, together above the ceiling, split by one valid packet
        let source = source().with_dropout(2, 8).with_dropout(11, 8);
        let outcome = h.acquisition.run(&source, plan).await;
        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(outcome.processed, 10);
        assert_eq!(outcome.buffer.get("BPM:X", 0, 2), Some(&[10.0][..]));
        assert_eq!(outcome.buffer.get("BPM:X", 0, 3), Some(&[19.0][..]));
    }

    #[tokio::test]
    async fn test_retry_ceiling_ends_run() {
        let mut h = harness(AcquisitionOptions {
            max_retries: 50,
            ..Default::default()
        })
        .await;
        let plan = time_plan(&h.access, 10, &[]).await;

        let source = source().with_dropout(3, 60);
        let outcome = h.acquisition.run(&source, plan).await;
        assert_eq!(outcome.status, RunStatus::StreamRetryExceeded);
        assert_eq!(outcome.processed, 3);
        assert_eq!(outcome.buffer.recorded(), 3);

        let events = drain(&mut h.events);
        assert!(events.contains(&ScanEvent::Progress {
            processed: 3,
            total: 10
        }));
        assert_eq!(events.last().and_then(ScanEvent::termination_code), Some(-4));
        assert_eq!(h.access.value("LASER:SHUTTER"), Some(ChannelValue::Scalar(0.0)));
    }

    #[tokio::test]
    async fn test_shape_mismatch_counts_as_incomplete() {
        let h = harness(AcquisitionOptions {
            max_retries: 5,
            ..Default::default()
        })
        .await;
        let mut plan = time_plan(&h.access, 4, &[]).await;
        plan.fast = vec![ChannelInfo::array("BPM:X", 4)];
        plan.buffer = SampleBuffer::allocate(
            BufferLayout::time_recording(4),
            [(ChannelInfo::array("BPM:X", 4), ColumnSource::Stream)],
        );

        let outcome = h.acquisition.run(&source(), plan).await;
        assert_eq!(outcome.status, RunStatus::StreamRetryExceeded);
        assert_eq!(outcome.processed, 0);
    }

    #[tokio::test]
    async fn test_open_failure_and_stream_loss() {
        let mut h = harness(AcquisitionOptions::default()).await;
        let plan = time_plan(&h.access, 5, &[]).await;
        let outcome = h
            .acquisition
            .run(&source().with_open_failure(), plan)
            .await;
        assert_eq!(outcome.status, RunStatus::StreamEstablishFailure);
        assert_eq!(
            drain(&mut h.events),
            vec![ScanEvent::Terminated {
                status: RunStatus::StreamEstablishFailure
            }]
        );

        let h = harness(AcquisitionOptions::default()).await;
        let plan = time_plan(&h.access, 5, &[]).await;
        let outcome = h
            .acquisition
            .run(&source().with_stream_loss(2), plan)
            .await;
        assert_eq!(outcome.status, RunStatus::StreamEstablishFailure);
        assert_eq!(outcome.processed, 2);
    }

    #[tokio::test]
    async fn test_finish_runs_once() {
        let mut h = harness(AcquisitionOptions::default()).await;
        h.acquisition.finish(RunStatus::ActuatorInitFailure).await;
        h.acquisition.finish(RunStatus::UserAbort).await;
        assert_eq!(
            drain(&mut h.events),
            vec![ScanEvent::Terminated {
                status: RunStatus::ActuatorInitFailure
            }]
        );
        assert_eq!(h.access.write_count("LASER:SHUTTER"), 2);
    }
}
