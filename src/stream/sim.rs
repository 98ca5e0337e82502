//! Simulated Telemetry Source
//!
//! Generates packets at a fixed period for the channels it was opened with.
//! Channel values are produced by a [`Signal`] per channel, optionally derived
//! from a channel of a [`SimChannelAccess`] so that scanned actuators show up
//! in the recorded data.
//!
//! # Fault Injection
//!
//! - `with_dropout(after, count)`: packets `after..after+count` carry no value
//!   for the first requested channel; may be called repeatedly to add windows
//! - `with_open_failure()`: `open` fails
//! - `with_stream_loss(after)`: `receive` fails once `after` packets were sent

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use tokio::time::sleep;
use tracing::debug;

use super::{ChannelCatalog, Packet, TelemetrySource, TelemetryStream};
use crate::channel::sim::SimChannelAccess;
use crate::channel::{ChannelInfo, ChannelShape, ChannelValue};

/// How a simulated channel produces values.
#[derive(Debug, Clone)]
pub enum Signal {
    /// Fixed value
    Constant(f64),
    /// `gain` times the current value of a simulated channel
    Follow { channel: String, gain: f64 },
    /// Packet index
    Counter,
}

#[derive(Debug, Clone)]
struct Dropout {
    after: u64,
    count: u64,
}

/// Simulated stream source.
pub struct SimTelemetrySource {
    period: Duration,
    first_pulse_id: u64,
    noise: f64,
    catalog: Vec<(ChannelInfo, Signal)>,
    access: Option<Arc<SimChannelAccess>>,
    dropouts: Vec<Dropout>,
    fail_open: bool,
    loss_after: Option<u64>,
    opens: AtomicUsize,
}

impl SimTelemetrySource {
    /// Create a source emitting one packet per `period`.
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            first_pulse_id: 1000,
            noise: 0.0,
            catalog: Vec::new(),
            access: None,
            dropouts: Vec::new(),
            fail_open: false,
            loss_after: None,
            opens: AtomicUsize::new(0),
        }
    }

    /// Resolve [`Signal::Follow`] against this channel backend.
    pub fn with_access(mut self, access: Arc<SimChannelAccess>) -> Self {
        self.access = Some(access);
        self
    }

    /// Add a channel to the catalog.
    pub fn with_channel(mut self, info: ChannelInfo, signal: Signal) -> Self {
        self.catalog.push((info, signal));
        self
    }

    /// Uniform noise of the given amplitude added to every element.
    pub fn with_noise(mut self, amplitude: f64) -> Self {
        self.noise = amplitude;
        self
    }

    pub fn with_first_pulse_id(mut self, pulse_id: u64) -> Self {
        self.first_pulse_id = pulse_id;
        self
    }

    pub fn with_dropout(mut self, after: u64, count: u64) -> Self {
        self.dropouts.push(Dropout { after, count });
        self
    }

    pub fn with_open_failure(mut self) -> Self {
        self.fail_open = true;
        self
    }

    pub fn with_stream_loss(mut self, after: u64) -> Self {
        self.loss_after = Some(after);
        self
    }

    /// Number of successful `open` calls.
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

impl ChannelCatalog for SimTelemetrySource {
    fn channels(&self) -> Vec<ChannelInfo> {
        self.catalog.iter().map(|(info, _)| info.clone()).collect()
    }
}

#[async_trait]
impl TelemetrySource for SimTelemetrySource {
    async fn open(&self, channels: &[ChannelInfo]) -> Result<Box<dyn TelemetryStream>> {
        if self.fail_open {
            bail!("SimTelemetrySource: dispatcher not reachable");
        }
        let mut selected = Vec::with_capacity(channels.len());
        for requested in channels {
            match self.catalog.iter().find(|(info, _)| info.name == requested.name) {
                Some((info, signal)) => selected.push((info.clone(), signal.clone())),
                None => bail!("SimTelemetrySource: channel '{}' not in catalog", requested.name),
            }
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        debug!(channels = selected.len(), "Simulated stream opened");
        Ok(Box::new(SimStream {
            period: self.period,
            index: 0,
            pulse_id: self.first_pulse_id,
            noise: self.noise,
            channels: selected,
            access: self.access.clone(),
            dropouts: self.dropouts.clone(),
            loss_after: self.loss_after,
        }))
    }
}

struct SimStream {
    period: Duration,
    index: u64,
    pulse_id: u64,
    noise: f64,
    channels: Vec<(ChannelInfo, Signal)>,
    access: Option<Arc<SimChannelAccess>>,
    dropouts: Vec<Dropout>,
    loss_after: Option<u64>,
}

impl SimStream {
    fn generate(&self, info: &ChannelInfo, signal: &Signal) -> Option<ChannelValue> {
        let base = match signal {
            Signal::Constant(v) => *v,
            Signal::Counter => self.index as f64,
            Signal::Follow { channel, gain } => {
                let access = self.access.as_ref()?;
                gain * access.value(channel)?.as_scalar()?
            }
        };
        let mut rng = rand::thread_rng();
        let mut sample = |v: f64| {
            if self.noise > 0.0 {
                v + rng.gen_range(-self.noise..=self.noise)
            } else {
                v
            }
        };
        Some(match info.shape {
            ChannelShape::Scalar => ChannelValue::Scalar(sample(base)),
            ChannelShape::Array(n) => {
                ChannelValue::Array((0..n).map(|i| sample(base + i as f64)).collect())
            }
        })
    }

    fn in_dropout(&self) -> bool {
        self.dropouts
            .iter()
            .any(|d| self.index >= d.after && self.index < d.after + d.count)
    }
}

#[async_trait]
impl TelemetryStream for SimStream {
    async fn receive(&mut self) -> Result<Packet> {
        if self.loss_after.is_some_and(|n| self.index >= n) {
            bail!("SimTelemetrySource: stream lost after {} packets", self.index);
        }
        if self.period.is_zero() {
            tokio::task::yield_now().await;
        } else {
            sleep(self.period).await;
        }

        let mut values = HashMap::with_capacity(self.channels.len());
        let dropped = self.in_dropout();
        for (i, (info, signal)) in self.channels.iter().enumerate() {
            let value = if dropped && i == 0 {
                None
            } else {
                self.generate(info, signal)
            };
            values.insert(info.name.clone(), value);
        }

        let packet = Packet {
            pulse_id: self.pulse_id,
            timestamp: Utc::now(),
            values,
        };
        self.index += 1;
        self.pulse_id += 1;
        Ok(packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sim_stream_packets() {
        let source = SimTelemetrySource::new(Duration::from_millis(1))
            .with_channel(ChannelInfo::scalar("BPM:X"), Signal::Constant(0.5))
            .with_channel(ChannelInfo::array("CAM:PROFILE", 4), Signal::Counter);

        let mut stream = source.open(&source.channels()).await.unwrap();
        let first = stream.receive().await.unwrap();
        let second = stream.receive().await.unwrap();

        assert_eq!(first.pulse_id + 1, second.pulse_id);
        assert!(second.timestamp >= first.timestamp);
        assert_eq!(first.value("BPM:X"), Some(&ChannelValue::Scalar(0.5)));
        assert_eq!(
            second.value("CAM:PROFILE").map(ChannelValue::shape),
            Some(ChannelShape::Array(4))
        );
        assert_eq!(source.open_count(), 1);
    }

    #[tokio::test]
    async fn test_sim_stream_dropout_and_loss() {
        let source = SimTelemetrySource::new(Duration::ZERO)
            .with_channel(ChannelInfo::scalar("BPM:X"), Signal::Constant(1.0))
            .with_dropout(1, 2)
            .with_stream_loss(4);
        let mut stream = source.open(&source.channels()).await.unwrap();

        assert!(stream.receive().await.unwrap().value("BPM:X").is_some());
        assert!(stream.receive().await.unwrap().value("BPM:X").is_none());
        assert!(stream.receive().await.unwrap().value("BPM:X").is_none());
        assert!(stream.receive().await.unwrap().value("BPM:X").is_some());
        assert!(stream.receive().await.is_err());
    }

    #[tokio::test]
    async fn test_sim_stream_several_dropout_windows() {
        let source = SimTelemetrySource::new(Duration::ZERO)
            .with_channel(ChannelInfo::scalar("BPM:X"), Signal::Counter)
            .with_dropout(0, 1)
            .with_dropout(2, 2);
        let mut stream = source.open(&source.channels()).await.unwrap();

        let mut present = Vec::new();
        for _ in 0..5 {
            present.push(stream.receive().await.unwrap().value("BPM:X").is_some());
        }
        assert_eq!(present, vec![false, true, false, false, true]);
    }

    #[tokio::test]
    async fn test_sim_stream_follow_and_open_failure() {
        let access = Arc::new(SimChannelAccess::new());
        access.add_scalar("MAG:SET", 2.0);
        let source = SimTelemetrySource::new(Duration::ZERO)
            .with_access(access)
            .with_channel(
                ChannelInfo::scalar("BPM:Y"),
                Signal::Follow {
                    channel: "MAG:SET".into(),
                    gain: 3.0,
                },
            );
        let mut stream = source.open(&source.channels()).await.unwrap();
        assert_eq!(
            stream.receive().await.unwrap().value("BPM:Y"),
            Some(&ChannelValue::Scalar(6.0))
        );

        let failing = SimTelemetrySource::new(Duration::ZERO).with_open_failure();
        assert!(failing.open(&[]).await.is_err());
    }
}
