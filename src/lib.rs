//! # scan_daq
//!
//! Actuator-stepping scan engine for stream-based data acquisition.
//!
//! A scan moves a set of process channels (actuators) through a linear ramp
//! and, at every step, records a fixed number of samples from a beam-synchronous
//! telemetry stream, optionally completed with slowly polled auxiliary
//! channels. A time recording is the same run without actuators.
//!
//! ## Crate Structure
//!
//! - **`channel`**: the `ChannelAccess` capability, `ChannelGroup` store/restore
//!   and a simulated control system.
//! - **`stream`**: `TelemetrySource`/`TelemetryStream` capabilities, the channel
//!   catalog, a simulated stream and a polling fallback.
//! - **`scan`**: gate, actuator step task, sample buffer, acquisition loop and
//!   the `ScanOrchestrator` that sequences a run.
//! - **`snapshot`**: configuration snapshot taken before each run.
//! - **`record`**: `RunResult` and its JSON persistence.
//! - **`config`**: Figment-based configuration (TOML file plus environment).
//! - **`logging`**: `tracing` subscriber setup.
//! - **`error`**: `ScanError` and the `RunStatus` termination codes.

pub mod channel;
pub mod config;
pub mod error;
pub mod logging;
pub mod record;
pub mod scan;
pub mod snapshot;
pub mod stream;

pub use error::{RunStatus, ScanError, ScanResult};
pub use scan::{ScanEvent, ScanOrchestrator, ScanRequest, ScanState};
