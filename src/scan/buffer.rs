//! Sample buffer.
//!
//! Dense per-channel storage addressed by `(step, sample)` for actuated scans
//! or by `sample` alone for time recordings. Every column is allocated once
//! with the channel's fixed shape; unfilled slots hold `NaN`. The pulse id of
//! each recorded sample goes into the parallel [`SHOT_ID`] column.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::channel::{ChannelInfo, ChannelShape, ChannelValue, ValueKind};
use crate::error::{ScanError, ScanResult};

/// Name of the pulse id column.
pub const SHOT_ID: &str = "Shot:ID";

/// Outer dimensions of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BufferLayout {
    /// Number of steps; `None` for a time recording
    pub steps: Option<usize>,
    /// Samples per step (or in total for a time recording)
    pub samples: usize,
}

impl BufferLayout {
    pub fn time_recording(samples: usize) -> Self {
        Self {
            steps: None,
            samples,
        }
    }

    pub fn scan(steps: usize, samples: usize) -> Self {
        Self {
            steps: Some(steps),
            samples,
        }
    }

    pub fn is_scan(&self) -> bool {
        self.steps.is_some()
    }

    /// Number of steps, 1 for a time recording.
    pub fn steps(&self) -> usize {
        self.steps.unwrap_or(1)
    }

    /// Total number of samples the run records.
    ///
    /// Only meaningful for layouts that passed [`BufferLayout::checked_total`].
    pub fn total(&self) -> usize {
        self.steps() * self.samples
    }

    /// Total number of samples, `None` if it does not fit in `usize`.
    pub fn checked_total(&self) -> Option<usize> {
        self.steps().checked_mul(self.samples)
    }

    /// `[steps, samples]` or `[samples]`.
    pub fn shape(&self) -> Vec<usize> {
        match self.steps {
            Some(steps) => vec![steps, self.samples],
            None => vec![self.samples],
        }
    }

    fn slot(&self, step: usize, sample: usize) -> Option<usize> {
        (step < self.steps() && sample < self.samples).then(|| step * self.samples + sample)
    }
}

/// Where a column's values come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnSource {
    /// Carried by the telemetry stream
    Stream,
    /// Read through the channel transport for every sample
    Polled,
}

/// One channel's data.
#[derive(Debug, Clone, Serialize)]
pub struct Column {
    pub shape: ChannelShape,
    pub kind: ValueKind,
    pub source: ColumnSource,
    data: Vec<f64>,
}

impl Column {
    /// Flat row-major data, `shape.len()` values per slot.
    pub fn data(&self) -> &[f64] {
        &self.data
    }

    fn width(&self) -> usize {
        self.shape.len()
    }
}

/// Fixed-shape storage for one run.
#[derive(Debug, Clone, Serialize)]
pub struct SampleBuffer {
    layout: BufferLayout,
    columns: BTreeMap<String, Column>,
    #[serde(rename = "Shot:ID")]
    shot_ids: Vec<Option<u64>>,
    timestamps: Vec<Option<DateTime<Utc>>>,
    recorded: usize,
}

impl SampleBuffer {
    /// Allocate one column per channel.
    pub fn allocate<I>(layout: BufferLayout, channels: I) -> Self
    where
        I: IntoIterator<Item = (ChannelInfo, ColumnSource)>,
    {
        let slots = layout.total();
        let columns = channels
            .into_iter()
            .map(|(info, source)| {
                let column = Column {
                    shape: info.shape,
                    kind: info.kind,
                    source,
                    data: vec![f64::NAN; slots * info.shape.len()],
                };
                (info.name, column)
            })
            .collect();
        Self {
            layout,
            columns,
            shot_ids: vec![None; slots],
            timestamps: vec![None; slots],
            recorded: 0,
        }
    }

    /// Whether `value` fits the column `name`.
    pub fn accepts(&self, name: &str, value: &ChannelValue) -> bool {
        self.columns
            .get(name)
            .is_some_and(|column| column.shape == value.shape())
    }

    /// Store one sample. Nothing is written unless every value fits.
    pub fn record(
        &mut self,
        step: usize,
        sample: usize,
        pulse_id: u64,
        timestamp: DateTime<Utc>,
        values: &[(&str, &ChannelValue)],
    ) -> ScanResult<()> {
        let slot = self.layout.slot(step, sample).ok_or_else(|| {
            ScanError::Configuration(format!(
                "sample ({step}, {sample}) outside buffer of shape {:?}",
                self.layout.shape()
            ))
        })?;
        if let Some((name, _)) = values.iter().find(|(name, value)| !self.accepts(name, value)) {
            return Err(ScanError::Channel(format!(
                "{name}: value does not match the allocated column"
            )));
        }

        for (name, value) in values {
            if let Some(column) = self.columns.get_mut(*name) {
                let width = column.width();
                column.data[slot * width..(slot + 1) * width].copy_from_slice(value.as_slice());
            }
        }
        if self.shot_ids[slot].is_none() {
            self.recorded += 1;
        }
        self.shot_ids[slot] = Some(pulse_id);
        self.timestamps[slot] = Some(timestamp);
        Ok(())
    }

    pub fn layout(&self) -> BufferLayout {
        self.layout
    }

    /// Outer shape, `[steps, samples]` or `[samples]`.
    pub fn shape(&self) -> Vec<usize> {
        self.layout.shape()
    }

    /// Full shape of a column including the channel's own dimensions.
    pub fn column_shape(&self, name: &str) -> Option<Vec<usize>> {
        self.columns.get(name).map(|column| {
            let mut shape = self.layout.shape();
            shape.extend(column.shape.dims());
            shape
        })
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(String::as_str)
    }

    /// Values of `name` at one address.
    pub fn get(&self, name: &str, step: usize, sample: usize) -> Option<&[f64]> {
        let slot = self.layout.slot(step, sample)?;
        let column = self.columns.get(name)?;
        let width = column.width();
        column.data.get(slot * width..(slot + 1) * width)
    }

    pub fn shot_id(&self, step: usize, sample: usize) -> Option<u64> {
        self.layout.slot(step, sample).and_then(|slot| self.shot_ids[slot])
    }

    /// Pulse ids in slot order.
    pub fn shot_ids(&self) -> &[Option<u64>] {
        &self.shot_ids
    }

    /// Packet time of the sample at one address.
    pub fn timestamp(&self, step: usize, sample: usize) -> Option<DateTime<Utc>> {
        self.layout.slot(step, sample).and_then(|slot| self.timestamps[slot])
    }

    /// Number of filled slots.
    pub fn recorded(&self) -> usize {
        self.recorded
    }

    pub fn is_full(&self) -> bool {
        self.recorded == self.layout.total()
    }
}
