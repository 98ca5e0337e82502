//! Configuration snapshots.
//!
//! A run captures the state of the machine once, right before acquisition
//! starts, and hands it to the persistence collaborator with the data.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::channel::{ChannelAccess, ChannelValue};

/// Machine state captured before a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    pub taken: DateTime<Utc>,
    pub values: BTreeMap<String, ChannelValue>,
    /// Channels that could not be read
    #[serde(default)]
    pub missing: Vec<String>,
}

/// Capability: Configuration Snapshot
#[async_trait]
pub trait SnapshotProvider: Send + Sync {
    /// Capture the current configuration.
    async fn capture(&self) -> Result<ConfigSnapshot>;
}

/// Reads a fixed list of channels.
pub struct ChannelListSnapshot {
    access: Arc<dyn ChannelAccess>,
    channels: Vec<String>,
    connect_timeout: Duration,
}

impl ChannelListSnapshot {
    pub fn new(access: Arc<dyn ChannelAccess>, channels: Vec<String>, connect_timeout: Duration) -> Self {
        Self {
            access,
            channels,
            connect_timeout,
        }
    }
}

#[async_trait]
impl SnapshotProvider for ChannelListSnapshot {
    async fn capture(&self) -> Result<ConfigSnapshot> {
        let mut snapshot = ConfigSnapshot {
            taken: Utc::now(),
            values: BTreeMap::new(),
            missing: Vec::new(),
        };
        for name in &self.channels {
            let value = match self.access.connect(name, self.connect_timeout).await {
                Ok(channel) => self.access.get(&channel).await,
                Err(e) => Err(e),
            };
            match value {
                Ok(value) => {
                    snapshot.values.insert(name.clone(), value);
                }
                Err(e) => {
                    warn!(channel = %name, error = %e, "Channel missing from snapshot");
                    snapshot.missing.push(name.clone());
                }
            }
        }
        debug!(
            channels = snapshot.values.len(),
            missing = snapshot.missing.len(),
            "Configuration snapshot taken"
        );
        Ok(snapshot)
    }
}
