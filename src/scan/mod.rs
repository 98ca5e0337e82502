//! Scan engine.
//!
//! A run steps one or more actuators through a ramp while recording samples
//! from a telemetry stream. Two tasks cooperate through a [`ScanGate`]:
//!
//! - the step task ([`actuator`]) writes set-points, waits for readbacks and
//!   marks the gate ready
//! - the acquisition loop ([`acquisition`]) drops every packet the gate does
//!   not admit and fills the [`SampleBuffer`]
//!
//! [`ScanOrchestrator`] sequences both and guarantees that actuator and
//! preaction channels are restored exactly once, whatever ends the run.

pub mod acquisition;
pub mod actuator;
pub mod buffer;
pub mod events;
pub mod gate;
pub mod orchestrator;
pub mod request;
pub mod state;

pub use acquisition::{
    classify, AcquisitionLoop, AcquisitionOptions, AcquisitionPlan, Classification, LoopOutcome,
};
pub use actuator::{linspace, ActuatorController, ActuatorDefinition, RampTable};
pub use buffer::{BufferLayout, Column, ColumnSource, SampleBuffer, SHOT_ID};
pub use events::ScanEvent;
pub use gate::{GateSnapshot, ScanGate};
pub use orchestrator::ScanOrchestrator;
pub use request::{ScanRequest, ScanType};
pub use state::ScanState;
