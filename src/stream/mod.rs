//! Telemetry stream collaborators.
//!
//! The engine consumes a high-rate stream of packets. Each packet carries a
//! monotonic pulse id, a timestamp and an optional value per requested channel;
//! an absent value means "not yet available" and is not an error.
//!
//! - [`TelemetrySource`] opens a scoped [`TelemetryStream`] for a channel list
//! - [`ChannelCatalog`] says which channels the stream carries natively
//!
//! Two implementations ship with the crate: [`sim::SimTelemetrySource`] for
//! tests and simulation, and [`polling::PollingSource`], which builds packets
//! by polling channels at a fixed period.

pub mod polling;
pub mod sim;

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::channel::{ChannelInfo, ChannelValue};

/// One inbound telemetry packet.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    /// Machine pulse id, strictly increasing along the stream
    pub pulse_id: u64,
    /// Acquisition time of the packet
    pub timestamp: DateTime<Utc>,
    /// Channel name to value; `None` or a missing key means not available
    pub values: HashMap<String, Option<ChannelValue>>,
}

impl Packet {
    pub fn new(pulse_id: u64, timestamp: DateTime<Utc>) -> Self {
        Self {
            pulse_id,
            timestamp,
            values: HashMap::new(),
        }
    }

    pub fn with_value(mut self, name: impl Into<String>, value: Option<ChannelValue>) -> Self {
        self.values.insert(name.into(), value);
        self
    }

    /// Present value for `name`, if any.
    pub fn value(&self, name: &str) -> Option<&ChannelValue> {
        self.values.get(name).and_then(Option::as_ref)
    }
}

/// An open stream. Dropping it releases the subscription.
#[async_trait]
pub trait TelemetryStream: Send {
    /// Wait for the next packet.
    ///
    /// # Returns
    /// - Ok(packet) when one arrived
    /// - Err if the stream was lost
    async fn receive(&mut self) -> Result<Packet>;
}

/// Capability: Telemetry Source
///
/// # Contract
/// - `open` subscribes to the given channels and returns a stream
/// - Returned packets may omit any channel at any time
#[async_trait]
pub trait TelemetrySource: Send + Sync {
    /// Open a stream carrying `channels`.
    ///
    /// # Returns
    /// - Ok(stream) if the subscription was established
    /// - Err if the source cannot be reached
    async fn open(&self, channels: &[ChannelInfo]) -> Result<Box<dyn TelemetryStream>>;
}

/// Lookup from channel name to shape and type.
pub trait ChannelCatalog: Send + Sync {
    /// All channels the stream can deliver.
    fn channels(&self) -> Vec<ChannelInfo>;

    /// Case-insensitive lookup; returns the catalog's spelling of the name.
    fn lookup(&self, name: &str) -> Option<ChannelInfo> {
        self.channels()
            .into_iter()
            .find(|info| info.name.eq_ignore_ascii_case(name))
    }
}

/// Catalog backed by a fixed list.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    channels: Vec<ChannelInfo>,
}

impl StaticCatalog {
    pub fn new(channels: Vec<ChannelInfo>) -> Self {
        Self { channels }
    }
}

impl ChannelCatalog for StaticCatalog {
    fn channels(&self) -> Vec<ChannelInfo> {
        self.channels.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_value_lookup() {
        let packet = Packet::new(7, Utc::now())
            .with_value("A", Some(ChannelValue::Scalar(1.0)))
            .with_value("B", None);
        assert_eq!(packet.value("A"), Some(&ChannelValue::Scalar(1.0)));
        assert_eq!(packet.value("B"), None);
        assert_eq!(packet.value("C"), None);
    }

    #[test]
    fn test_catalog_lookup_ignores_case() {
        let catalog = StaticCatalog::new(vec![ChannelInfo::scalar("SARFE10-PBPG050:ENERGY")]);
        let info = catalog.lookup("sarfe10-pbpg050:energy").unwrap();
        assert_eq!(info.name, "SARFE10-PBPG050:ENERGY");
        assert!(catalog.lookup("OTHER").is_none());
    }
}
