//! Scan requests as loaded from configuration or built in code.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::actuator::ActuatorDefinition;
use super::buffer::BufferLayout;
use crate::channel::ChannelValue;
use crate::error::{ScanError, ScanResult};

/// Kind of run, as written into run summaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanType {
    #[serde(rename = "Scan")]
    Scan,
    #[serde(rename = "Time Recording")]
    TimeRecording,
}

impl std::fmt::Display for ScanType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScanType::Scan => write!(f, "Scan"),
            ScanType::TimeRecording => write!(f, "Time Recording"),
        }
    }
}

fn default_name() -> String {
    "scan".to_string()
}

fn default_steps() -> usize {
    1
}

fn default_timeout() -> Duration {
    Duration::from_secs(10)
}

/// Everything one run needs to know.
///
/// ```toml
/// [scan]
/// name = "gun-phase"
/// sensors = ["SARFE10-PBPG050:ENERGY", "SINEG01-DBPM340:X1"]
/// samples = 10
/// steps = 11
/// settle = "200ms"
/// timeout = "5s"
///
/// [scan.actuators."SINEG01-RSYS:SET-BEAM-PHASE"]
/// start = -5.0
/// end = 5.0
/// relative = true
/// readback = "SINEG01-RSYS:GET-BEAM-PHASE"
/// tolerance = 0.1
///
/// [scan.preaction]
/// "SINEG01-LASER:SHUTTER" = 1.0
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanRequest {
    #[serde(default = "default_name")]
    pub name: String,
    /// Actuator channel to ramp definition; empty for a time recording
    #[serde(default)]
    pub actuators: BTreeMap<String, ActuatorDefinition>,
    /// Channels to record, stream or auxiliary
    #[serde(default)]
    pub sensors: Vec<String>,
    /// Samples per step (in total for a time recording)
    pub samples: usize,
    /// Number of actuator steps; ignored for a time recording
    #[serde(default = "default_steps")]
    pub steps: usize,
    #[serde(default, with = "humantime_serde")]
    pub settle: Duration,
    /// Readback timeout per step
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    /// One-shot writes applied before the run and undone after it
    #[serde(default)]
    pub preaction: BTreeMap<String, ChannelValue>,
}

impl ScanRequest {
    /// Record `samples` samples of `sensors` without actuation.
    pub fn time_recording<I, S>(sensors: I, samples: usize) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: default_name(),
            actuators: BTreeMap::new(),
            sensors: sensors.into_iter().map(Into::into).collect(),
            samples,
            steps: default_steps(),
            settle: Duration::ZERO,
            timeout: default_timeout(),
            preaction: BTreeMap::new(),
        }
    }

    /// Step through `steps` points, recording `samples` samples at each.
    pub fn scan<I, S>(sensors: I, steps: usize, samples: usize) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            steps,
            ..Self::time_recording(sensors, samples)
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_actuator(mut self, channel: impl Into<String>, definition: ActuatorDefinition) -> Self {
        self.actuators.insert(channel.into(), definition);
        self
    }

    pub fn with_preaction(mut self, channel: impl Into<String>, value: impl Into<ChannelValue>) -> Self {
        self.preaction.insert(channel.into(), value.into());
        self
    }

    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn scan_type(&self) -> ScanType {
        if self.actuators.is_empty() {
            ScanType::TimeRecording
        } else {
            ScanType::Scan
        }
    }

    /// Buffer layout of this request.
    pub fn layout(&self) -> BufferLayout {
        match self.scan_type() {
            ScanType::Scan => BufferLayout::scan(self.steps, self.samples),
            ScanType::TimeRecording => BufferLayout::time_recording(self.samples),
        }
    }

    /// Reject requests that cannot produce a run.
    ///
    /// Actuator definitions themselves are checked when the actuators are
    /// initialized.
    pub fn validate(&self) -> ScanResult<()> {
        if self.samples == 0 {
            return Err(ScanError::Configuration(
                "samples must be at least 1".into(),
            ));
        }
        if self.sensors.is_empty() {
            return Err(ScanError::Configuration("no sensor channels requested".into()));
        }
        if self.scan_type() == ScanType::Scan && self.steps == 0 {
            return Err(ScanError::Configuration(
                "an actuated scan needs at least one step".into(),
            ));
        }
        if self.layout().checked_total().is_none() {
            return Err(ScanError::Configuration(format!(
                "{} steps of {} samples exceed the addressable buffer size",
                self.steps, self.samples
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_from_toml() {
        let request: ScanRequest = toml::from_str(
            r#"
            sensors = ["BPM:X"]
            samples = 3
            steps = 5
            settle = "150ms"

            [actuators."MAG:SET"]
            start = 0.0
            end = 10.0
            readback = "MAG:RB"
            tolerance = 0.1

            [preaction]
            "LASER:SHUTTER" = 1.0
            "#,
        )
        .unwrap();

        assert_eq!(request.name, "scan");
        assert_eq!(request.settle, Duration::from_millis(150));
        assert_eq!(request.timeout, Duration::from_secs(10));
        assert_eq!(request.scan_type(), ScanType::Scan);
        assert_eq!(request.layout(), BufferLayout::scan(5, 3));
        assert_eq!(
            request.actuators["MAG:SET"],
            ActuatorDefinition::new(0.0, 10.0).with_readback("MAG:RB", 0.1)
        );
        assert_eq!(
            request.preaction["LASER:SHUTTER"],
            ChannelValue::Scalar(1.0)
        );
        assert!(request.validate().is_ok());
    }

    #[test]
    fn test_time_recording_layout() {
        let request = ScanRequest::time_recording(["BPM:X"], 100);
        assert_eq!(request.scan_type(), ScanType::TimeRecording);
        assert_eq!(request.layout().shape(), vec![100]);
        assert_eq!(request.scan_type().to_string(), "Time Recording");
    }

    #[test]
    fn test_validate_rejects_empty_requests() {
        assert!(ScanRequest::time_recording(["BPM:X"], 0).validate().is_err());
        assert!(ScanRequest::time_recording(Vec::<String>::new(), 5)
            .validate()
            .is_err());
        let no_steps = ScanRequest::scan(["BPM:X"], 0, 3)
            .with_actuator("MAG:SET", ActuatorDefinition::new(0.0, 1.0));
        assert!(matches!(
            no_steps.validate(),
            Err(ScanError::Configuration(_))
        ));
    }

    #[test]
    fn test_validate_rejects_oversized_buffer() {
        let oversized = ScanRequest::scan(["BPM:X"], usize::MAX, 2)
            .with_actuator("MAG:SET", ActuatorDefinition::new(0.0, 1.0));
        assert!(matches!(
            oversized.validate(),
            Err(ScanError::Configuration(_))
        ));

        let largest = ScanRequest::scan(["BPM:X"], usize::MAX / 2, 2)
            .with_actuator("MAG:SET", ActuatorDefinition::new(0.0, 1.0));
        assert_eq!(largest.layout().checked_total(), Some(usize::MAX - 1));
    }
}
