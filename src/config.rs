//! Configuration loading with Figment.
//!
//! Configuration is merged from:
//! 1. a TOML file (`config/scan.toml` by default)
//! 2. environment variables prefixed with `SCAN_DAQ_`, nested keys separated
//!    by a double underscore
//!
//! Example: `SCAN_DAQ_ENGINE__MAX_RETRIES=200` overrides `engine.max_retries`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{ScanError, ScanResult};
use crate::logging::{self, OutputFormat};
use crate::scan::acquisition::{AcquisitionOptions, DEFAULT_MAX_RETRIES};
use crate::scan::actuator::DEFAULT_POLL_INTERVAL;
use crate::scan::ScanRequest;

/// Default configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/scan.toml";

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    pub application: ApplicationConfig,
    #[serde(default)]
    pub engine: EngineSettings,
    /// The scan to run
    pub scan: ScanRequest,
    /// Simulated backend used by the command line tool
    #[serde(default)]
    pub simulation: SimulationConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    #[serde(default)]
    pub log_format: OutputFormat,
    /// Directory for run summaries; none are written when unset
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
}

/// Engine tuning shared by every run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Readback poll interval of the step task
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Consecutive incomplete packets tolerated
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    /// Fraction of the total between progress events
    #[serde(default = "default_progress_fraction")]
    pub progress_fraction: f64,
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Capacity of the event broadcast channel
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    /// Channels captured in the configuration snapshot before each run
    #[serde(default)]
    pub snapshot: Vec<String>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            max_retries: default_max_retries(),
            progress_fraction: default_progress_fraction(),
            connect_timeout: default_connect_timeout(),
            event_capacity: default_event_capacity(),
            snapshot: Vec::new(),
        }
    }
}

impl EngineSettings {
    pub fn acquisition_options(&self) -> AcquisitionOptions {
        AcquisitionOptions {
            max_retries: self.max_retries,
            progress_fraction: self.progress_fraction,
        }
    }

    pub fn validate(&self) -> ScanResult<()> {
        if self.poll_interval.is_zero() {
            return Err(ScanError::Configuration(
                "engine.poll_interval must be positive".into(),
            ));
        }
        if !(self.progress_fraction > 0.0 && self.progress_fraction <= 1.0) {
            return Err(ScanError::Configuration(format!(
                "engine.progress_fraction {} must be in (0, 1]",
                self.progress_fraction
            )));
        }
        if self.event_capacity == 0 {
            return Err(ScanError::Configuration(
                "engine.event_capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Simulated control system and stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Time between two stream packets
    #[serde(default = "default_stream_period", with = "humantime_serde")]
    pub stream_period: Duration,
    /// How long readbacks lag behind their set-points
    #[serde(default = "default_readback_lag", with = "humantime_serde")]
    pub readback_lag: Duration,
    /// Uniform noise amplitude on stream values
    #[serde(default)]
    pub noise: f64,
    /// Initial values of simulated process channels
    #[serde(default)]
    pub channels: BTreeMap<String, f64>,
    /// Channels carried by the simulated stream
    #[serde(default)]
    pub stream: Vec<SimStreamChannel>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            stream_period: default_stream_period(),
            readback_lag: default_readback_lag(),
            noise: 0.0,
            channels: BTreeMap::new(),
            stream: Vec::new(),
        }
    }
}

/// One simulated stream channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimStreamChannel {
    pub name: String,
    /// Waveform length; scalar when unset
    #[serde(default)]
    pub length: Option<usize>,
    /// Process channel whose value, times `gain`, this channel reports
    #[serde(default)]
    pub follow: Option<String>,
    #[serde(default = "default_gain")]
    pub gain: f64,
    /// Constant value when not following a channel
    #[serde(default)]
    pub value: f64,
}

fn default_poll_interval() -> Duration {
    DEFAULT_POLL_INTERVAL
}

fn default_max_retries() -> usize {
    DEFAULT_MAX_RETRIES
}

fn default_progress_fraction() -> f64 {
    0.1
}

fn default_connect_timeout() -> Duration {
    Duration::from_millis(500)
}

fn default_event_capacity() -> usize {
    1024
}

fn default_stream_period() -> Duration {
    Duration::from_millis(10)
}

fn default_readback_lag() -> Duration {
    Duration::from_millis(50)
}

fn default_gain() -> f64 {
    1.0
}

impl ScanConfig {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment.
    pub fn load() -> ScanResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file and the environment.
    pub fn load_from<P: AsRef<Path>>(path: P) -> ScanResult<Self> {
        let config = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("SCAN_DAQ_").split("__"))
            .extract()?;
        Ok(config)
    }

    /// Validate semantics after loading.
    pub fn validate(&self) -> ScanResult<()> {
        logging::parse_log_level(&self.application.log_level)?;
        self.engine.validate()?;
        self.scan.validate()?;

        let mut names = std::collections::HashSet::new();
        for channel in &self.simulation.stream {
            if !names.insert(channel.name.as_str()) {
                return Err(ScanError::Configuration(format!(
                    "Duplicate simulated stream channel: {}",
                    channel.name
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    const CONFIG: &str = r#"
        [application]
        name = "scan_daq test"
        log_level = "debug"
        log_format = "compact"

        [engine]
        poll_interval = "20ms"

        [scan]
        name = "phase"
        sensors = ["BPM:X", "GAUGE:P"]
        samples = 3
        steps = 5

        [scan.actuators."MAG:SET"]
        start = 0.0
        end = 10.0
        readback = "MAG:RB"
        tolerance = 0.1

        [simulation]
        stream_period = "5ms"

        [[simulation.stream]]
        name = "BPM:X"
        follow = "MAG:SET"
        gain = 0.5
    "#;

    #[test]
    fn test_load_from_file() {
        Jail::expect_with(|jail| {
            jail.create_file("scan.toml", CONFIG)?;
            let config = ScanConfig::load_from("scan.toml").map_err(|e| e.to_string())?;

            assert_eq!(config.application.log_format, OutputFormat::Compact);
            assert_eq!(config.engine.poll_interval, Duration::from_millis(20));
            assert_eq!(config.engine.max_retries, DEFAULT_MAX_RETRIES);
            assert_eq!(config.scan.steps, 5);
            assert_eq!(config.simulation.stream[0].gain, 0.5);
            assert_eq!(config.simulation.readback_lag, Duration::from_millis(50));
            assert!(config.validate().is_ok());
            Ok(())
        });
    }

    #[test]
    fn test_environment_overrides() {
        Jail::expect_with(|jail| {
            jail.create_file("scan.toml", CONFIG)?;
            jail.set_env("SCAN_DAQ_ENGINE__MAX_RETRIES", "25");
            jail.set_env("SCAN_DAQ_APPLICATION__LOG_LEVEL", "warn");
            let config = ScanConfig::load_from("scan.toml").map_err(|e| e.to_string())?;

            assert_eq!(config.engine.max_retries, 25);
            assert_eq!(config.engine.acquisition_options().max_retries, 25);
            assert_eq!(config.application.log_level, "warn");
            Ok(())
        });
    }

    #[test]
    fn test_invalid_values_rejected() {
        Jail::expect_with(|jail| {
            jail.create_file("scan.toml", CONFIG)?;
            jail.set_env("SCAN_DAQ_APPLICATION__LOG_LEVEL", "loud");
            let config = ScanConfig::load_from("scan.toml").map_err(|e| e.to_string())?;
            assert!(config.validate().is_err());
            Ok(())
        });

        let settings = EngineSettings {
            progress_fraction: 0.0,
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_missing_file_is_an_error() {
        Jail::expect_with(|_jail| {
            assert!(matches!(
                ScanConfig::load_from("absent.toml"),
                Err(ScanError::Config(_))
            ));
            Ok(())
        });
    }
}
