//! Process Channel Access
//!
//! Channels are the named process values of the control system: actuator
//! set-points, their readbacks, and slow auxiliary sensors. This module defines
//! the value model and the transport capability the engine consumes:
//!
//! - [`ChannelValue`] / [`ChannelShape`] / [`ValueKind`] - what a channel carries
//! - [`ChannelRef`] - a connected channel, owned by the group that connected it
//! - [`ChannelAccess`] - the transport (connect, get, put), implemented outside
//!   the engine
//! - [`ChannelGroup`] - store/restore/read/write over a set of channels
//!
//! # Design Philosophy
//!
//! `ChannelAccess` follows the capability-trait conventions of the hardware
//! layer:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Uses anyhow::Result for errors
//!
//! # Example
//!
//! ```rust,ignore
//! let mut group = ChannelGroup::new("preaction", access.clone(), Duration::from_millis(500));
//! let report = group.store(&["SINEG01-RMSM:SM-SET".to_string()]).await?;
//! assert!(report.is_complete());
//! group.write(&values).await?;
//! // ... scan ...
//! group.restore().await?;
//! ```

pub mod group;
pub mod sim;

pub use group::{ChannelGroup, StoreReport};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Value shape, fixed per channel at classification time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelShape {
    /// Single value per sample
    Scalar,
    /// Fixed-length waveform per sample
    Array(usize),
}

impl ChannelShape {
    /// Number of elements one sample occupies.
    pub fn len(self) -> usize {
        match self {
            ChannelShape::Scalar => 1,
            ChannelShape::Array(n) => n,
        }
    }

    pub fn is_empty(self) -> bool {
        self.len() == 0
    }

    /// Trailing dimensions appended to a buffer shape.
    pub fn dims(self) -> Vec<usize> {
        match self {
            ChannelShape::Scalar => Vec::new(),
            ChannelShape::Array(n) => vec![n],
        }
    }
}

/// Element type as reported by the control system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ValueKind {
    #[default]
    Floating,
    Integer,
    Enumerated,
}

/// A value read from or written to a channel.
///
/// Integer and enumerated channels are carried as `f64`; the original kind is
/// kept on the [`ChannelRef`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChannelValue {
    Scalar(f64),
    Array(Vec<f64>),
}

impl ChannelValue {
    pub fn shape(&self) -> ChannelShape {
        match self {
            ChannelValue::Scalar(_) => ChannelShape::Scalar,
            ChannelValue::Array(values) => ChannelShape::Array(values.len()),
        }
    }

    /// Scalar reading, or the first element of a one-element array.
    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            ChannelValue::Scalar(v) => Some(*v),
            ChannelValue::Array(values) if values.len() == 1 => Some(values[0]),
            ChannelValue::Array(_) => None,
        }
    }

    /// Flat view of the elements.
    pub fn as_slice(&self) -> &[f64] {
        match self {
            ChannelValue::Scalar(v) => std::slice::from_ref(v),
            ChannelValue::Array(values) => values,
        }
    }
}

impl From<f64> for ChannelValue {
    fn from(value: f64) -> Self {
        ChannelValue::Scalar(value)
    }
}

impl From<Vec<f64>> for ChannelValue {
    fn from(values: Vec<f64>) -> Self {
        ChannelValue::Array(values)
    }
}

/// Opaque connection handle issued by a [`ChannelAccess`] implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelHandle(pub u64);

/// Catalog description of a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub name: String,
    pub shape: ChannelShape,
    #[serde(default)]
    pub kind: ValueKind,
}

impl ChannelInfo {
    pub fn scalar(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            shape: ChannelShape::Scalar,
            kind: ValueKind::Floating,
        }
    }

    pub fn array(name: impl Into<String>, len: usize) -> Self {
        Self {
            name: name.into(),
            shape: ChannelShape::Array(len),
            kind: ValueKind::Floating,
        }
    }
}

/// A connected channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelRef {
    pub name: String,
    pub handle: ChannelHandle,
    pub shape: ChannelShape,
    pub kind: ValueKind,
}

impl ChannelRef {
    pub fn info(&self) -> ChannelInfo {
        ChannelInfo {
            name: self.name.clone(),
            shape: self.shape,
            kind: self.kind,
        }
    }
}

/// Capability: Process Value Access
///
/// The transport used to reach individual named channels.
///
/// # Contract
/// - `connect` resolves a name within `timeout`, reporting shape and kind
/// - `get` returns the current value
/// - `put` writes a new value and returns once the write was accepted; it does
///   not wait for a readback to follow
///
/// # Thread Safety
/// - All methods take `&self`; implementations use interior mutability
#[async_trait]
pub trait ChannelAccess: Send + Sync {
    /// Connect to a channel by name.
    ///
    /// # Returns
    /// - Ok(ChannelRef) once connected
    /// - Err if the channel is unreachable within `timeout`
    async fn connect(&self, name: &str, timeout: Duration) -> Result<ChannelRef>;

    /// Read the current value.
    async fn get(&self, channel: &ChannelRef) -> Result<ChannelValue>;

    /// Write a new value.
    async fn put(&self, channel: &ChannelRef, value: &ChannelValue) -> Result<()>;
}
