//! Pure-polling recorder.
//!
//! For channels that are not carried by the telemetry stream, packets are
//! assembled by reading every channel through [`ChannelAccess`] once per
//! acquisition period. The pulse id is a local counter and a failed read shows
//! up as an absent value, which the acquisition loop treats like any other
//! incomplete packet.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use tokio::time::sleep;
use tracing::{trace, warn};

use super::{ChannelCatalog, Packet, TelemetrySource, TelemetryStream};
use crate::channel::{ChannelAccess, ChannelInfo, ChannelRef};

/// Telemetry source that polls channels at a fixed period.
pub struct PollingSource {
    access: Arc<dyn ChannelAccess>,
    period: Duration,
    channels: Vec<ChannelRef>,
    unreachable: Vec<String>,
}

impl PollingSource {
    /// Connect to `names`; unreachable channels are excluded from the catalog.
    pub async fn connect(
        access: Arc<dyn ChannelAccess>,
        names: &[String],
        period: Duration,
        connect_timeout: Duration,
    ) -> Self {
        let mut channels = Vec::with_capacity(names.len());
        let mut unreachable = Vec::new();
        for name in names {
            match access.connect(name, connect_timeout).await {
                Ok(channel) => channels.push(channel),
                Err(e) => {
                    warn!(channel = %name, error = %e, "Channel cannot be polled and will be excluded");
                    unreachable.push(name.clone());
                }
            }
        }
        Self {
            access,
            period,
            channels,
            unreachable,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Requested channels that could not be connected.
    pub fn unreachable(&self) -> &[String] {
        &self.unreachable
    }
}

impl ChannelCatalog for PollingSource {
    fn channels(&self) -> Vec<ChannelInfo> {
        self.channels.iter().map(ChannelRef::info).collect()
    }
}

#[async_trait]
impl TelemetrySource for PollingSource {
    async fn open(&self, channels: &[ChannelInfo]) -> Result<Box<dyn TelemetryStream>> {
        let mut selected = Vec::with_capacity(channels.len());
        for requested in channels {
            match self.channels.iter().find(|c| c.name == requested.name) {
                Some(channel) => selected.push(channel.clone()),
                None => bail!("PollingSource: channel '{}' is not connected", requested.name),
            }
        }
        Ok(Box::new(PollingStream {
            access: self.access.clone(),
            period: self.period,
            channels: selected,
            pulse_id: 0,
            started: false,
        }))
    }
}

struct PollingStream {
    access: Arc<dyn ChannelAccess>,
    period: Duration,
    channels: Vec<ChannelRef>,
    pulse_id: u64,
    started: bool,
}

#[async_trait]
impl TelemetryStream for PollingStream {
    async fn receive(&mut self) -> Result<Packet> {
        if self.started {
            sleep(self.period).await;
        }
        self.started = true;

        let timestamp = Utc::now();
        let mut values = HashMap::with_capacity(self.channels.len());
        for channel in &self.channels {
            let value = match self.access.get(channel).await {
                Ok(value) => Some(value),
                Err(e) => {
                    trace!(channel = %channel.name, error = %e, "Poll read failed");
                    None
                }
            };
            values.insert(channel.name.clone(), value);
        }

        let packet = Packet {
            pulse_id: self.pulse_id,
            timestamp,
            values,
        };
        self.pulse_id += 1;
        Ok(packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::sim::SimChannelAccess;
    use crate::channel::ChannelValue;

    #[tokio::test]
    async fn test_polling_source_reads_channels() {
        let sim = Arc::new(SimChannelAccess::new());
        sim.add_scalar("GAUGE:P", 1e-9);
        sim.add_array("SPEC:Y", vec![1.0, 2.0, 3.0]);
        sim.add_scalar("DEAD:CH", 0.0);
        sim.set_unreachable("DEAD:CH");

        let names = vec![
            "GAUGE:P".to_string(),
            "SPEC:Y".to_string(),
            "DEAD:CH".to_string(),
        ];
        let source = PollingSource::connect(
            sim.clone(),
            &names,
            Duration::from_millis(5),
            Duration::from_millis(10),
        )
        .await;
        assert_eq!(source.unreachable(), &["DEAD:CH".to_string()]);
        assert_eq!(source.channels().len(), 2);

        let mut stream = source.open(&source.channels()).await.unwrap();
        let first = stream.receive().await.unwrap();
        sim.set_value("GAUGE:P", ChannelValue::Scalar(2e-9));
        let second = stream.receive().await.unwrap();

        assert_eq!(first.pulse_id, 0);
        assert_eq!(second.pulse_id, 1);
        assert_eq!(second.value("GAUGE:P"), Some(&ChannelValue::Scalar(2e-9)));
        assert!(second.timestamp > first.timestamp);
    }

    #[tokio::test]
    async fn test_polling_source_rejects_unconnected() {
        let sim = Arc::new(SimChannelAccess::new());
        let source =
            PollingSource::connect(sim, &[], Duration::from_millis(5), Duration::ZERO).await;
        assert!(source.open(&[ChannelInfo::scalar("X")]).await.is_err());
    }
}
