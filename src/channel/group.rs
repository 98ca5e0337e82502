//! Channel groups with snapshot/restore.
//!
//! A group connects a list of channels, remembers their values at `store` time
//! and can write them back later. Restoration is armed by `store` and disarmed
//! by the first `restore`, so every termination path may call `restore` and
//! only the first call writes. Concurrent callers wait until that first
//! restore has finished writing.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use super::{ChannelAccess, ChannelRef, ChannelValue};
use crate::error::{ScanError, ScanResult};

/// Outcome of [`ChannelGroup::store`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreReport {
    /// Channels that connected and were snapshotted
    pub connected: Vec<String>,
    /// Channels that could not be reached and were excluded
    pub unreachable: Vec<String>,
}

impl StoreReport {
    pub fn is_complete(&self) -> bool {
        self.unreachable.is_empty()
    }
}

/// A named group of process channels.
pub struct ChannelGroup {
    label: String,
    access: Arc<dyn ChannelAccess>,
    connect_timeout: Duration,
    channels: Vec<ChannelRef>,
    reference: Vec<ChannelValue>,
    restore_armed: AtomicBool,
    restore_lock: AsyncMutex<()>,
}

impl std::fmt::Debug for ChannelGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelGroup")
            .field("label", &self.label)
            .field("channels", &self.names())
            .field("restore_armed", &self.restore_armed.load(Ordering::SeqCst))
            .finish()
    }
}

impl ChannelGroup {
    pub fn new(
        label: impl Into<String>,
        access: Arc<dyn ChannelAccess>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            label: label.into(),
            access,
            connect_timeout,
            channels: Vec::new(),
            reference: Vec::new(),
            restore_armed: AtomicBool::new(false),
            restore_lock: AsyncMutex::new(()),
        }
    }

    /// Connect to `names` and snapshot their current values.
    ///
    /// Unreachable channels are excluded and listed in the report. A channel
    /// that connects but cannot be read fails the whole store.
    pub async fn store(&mut self, names: &[String]) -> ScanResult<StoreReport> {
        self.channels.clear();
        self.reference.clear();
        self.restore_armed.store(false, Ordering::SeqCst);

        let mut report = StoreReport::default();
        for name in names {
            match self.access.connect(name, self.connect_timeout).await {
                Ok(channel) => {
                    report.connected.push(channel.name.clone());
                    self.channels.push(channel);
                }
                Err(e) => {
                    warn!(group = %self.label, channel = %name, error = %e,
                        "Channel cannot be accessed and will be excluded");
                    report.unreachable.push(name.clone());
                }
            }
        }

        info!(group = %self.label, channels = self.channels.len(),
            "Initial acquisition of channels for restoring them later");
        let mut values = Vec::with_capacity(self.channels.len());
        for channel in &self.channels {
            let value = self
                .access
                .get(channel)
                .await
                .map_err(|e| ScanError::Channel(format!("{}: {e}", channel.name)))?;
            values.push(value);
        }
        self.reference = values;
        self.restore_armed.store(true, Ordering::SeqCst);
        Ok(report)
    }

    /// Write the stored snapshot back.
    ///
    /// Only the first call after a `store` writes; later calls return `Ok(0)`
    /// once the first one has completed. A failed write is logged and the
    /// remaining channels are still restored.
    pub async fn restore(&self) -> ScanResult<usize> {
        let _guard = self.restore_lock.lock().await;
        if !self.restore_armed.swap(false, Ordering::SeqCst) {
            debug!(group = %self.label, "Nothing to restore");
            return Ok(0);
        }

        info!(group = %self.label, channels = self.channels.len(), "Restoring channels");
        let mut failed = Vec::new();
        for (channel, value) in self.channels.iter().zip(&self.reference) {
            if let Err(e) = self.access.put(channel, value).await {
                warn!(group = %self.label, channel = %channel.name, error = %e, "Restore failed");
                failed.push(channel.name.clone());
            }
        }

        if failed.is_empty() {
            Ok(self.channels.len())
        } else {
            Err(ScanError::Channel(format!(
                "failed to restore {}",
                failed.join(", ")
            )))
        }
    }

    /// Current values of all connected channels, in connection order.
    pub async fn read(&self) -> ScanResult<Vec<ChannelValue>> {
        let mut values = Vec::with_capacity(self.channels.len());
        for channel in &self.channels {
            let value = self
                .access
                .get(channel)
                .await
                .map_err(|e| ScanError::Channel(format!("{}: {e}", channel.name)))?;
            values.push(value);
        }
        Ok(values)
    }

    /// Write explicit values; names that are not part of the group are ignored.
    pub async fn write(&self, values: &BTreeMap<String, ChannelValue>) -> ScanResult<()> {
        for channel in &self.channels {
            if let Some(value) = values.get(&channel.name) {
                self.access
                    .put(channel, value)
                    .await
                    .map_err(|e| ScanError::Channel(format!("{}: {e}", channel.name)))?;
            }
        }
        Ok(())
    }

    /// Write one value by channel position.
    pub async fn put_at(&self, index: usize, value: &ChannelValue) -> ScanResult<()> {
        let channel = self.channels.get(index).ok_or_else(|| {
            ScanError::Channel(format!("{}: no channel at index {index}", self.label))
        })?;
        self.access
            .put(channel, value)
            .await
            .map_err(|e| ScanError::Channel(format!("{}: {e}", channel.name)))
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn names(&self) -> Vec<String> {
        self.channels.iter().map(|c| c.name.clone()).collect()
    }

    pub fn channels(&self) -> &[ChannelRef] {
        &self.channels
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Value captured at `store` time.
    pub fn stored_value(&self, name: &str) -> Option<&ChannelValue> {
        self.channels
            .iter()
            .position(|c| c.name == name)
            .and_then(|i| self.reference.get(i))
    }

    /// Whether a `restore` would still write.
    pub fn is_restore_pending(&self) -> bool {
        self.restore_armed.load(Ordering::SeqCst)
    }
}
