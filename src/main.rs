//! CLI entry point for scan_daq
//!
//! Runs the scan described in a configuration file against the simulated
//! control system and stream configured in its `[simulation]` section.
//!
//! # Usage
//!
//! Run a scan:
//! ```bash
//! scan_daq run --config config/scan.toml --output runs/
//! ```
//!
//! Validate a configuration and print the ramp:
//! ```bash
//! scan_daq check --config config/scan.toml
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use scan_daq::channel::sim::SimChannelAccess;
use scan_daq::channel::{ChannelAccess, ChannelInfo, ChannelValue};
use scan_daq::config::{ScanConfig, SimulationConfig, DEFAULT_CONFIG_PATH};
use scan_daq::logging;
use scan_daq::record::JsonRecorder;
use scan_daq::scan::{RampTable, ScanEvent, ScanOrchestrator, ScanRequest};
use scan_daq::snapshot::ChannelListSnapshot;
use scan_daq::stream::sim::{SimTelemetrySource, Signal};

#[derive(Parser)]
#[command(name = "scan_daq")]
#[command(about = "Actuator-stepping scan engine for stream acquisition", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the configured scan against the simulated backend
    Run {
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,

        /// Directory for the run summary, overrides `application.output_dir`
        #[arg(long)]
        output: Option<PathBuf>,

        /// Abort the run after this many milliseconds
        #[arg(long)]
        abort_after_ms: Option<u64>,
    },

    /// Validate a configuration file and print the ramp
    Check {
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            output,
            abort_after_ms,
        } => run_scan(config, output, abort_after_ms.map(Duration::from_millis)).await,
        Commands::Check { config } => check_config(config),
    }
}

fn load(path: &Path) -> Result<ScanConfig> {
    let config = ScanConfig::load_from(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

fn check_config(path: PathBuf) -> Result<()> {
    let config = load(&path)?;
    let scan = &config.scan;
    println!("Configuration OK: {}", path.display());
    println!("  scan:     {} ({})", scan.name, scan.scan_type());
    println!("  sensors:  {}", scan.sensors.join(", "));
    println!("  shape:    {:?}", scan.layout().shape());

    if !scan.actuators.is_empty() {
        let access = simulated_access(&config.simulation, scan);
        let ramp = RampTable::build(&scan.actuators, scan.steps, |name| {
            access.value(name).and_then(|value| value.as_scalar())
        })?;
        for channel in ramp.channels() {
            println!("  {channel}: {:?}", ramp.values(channel).unwrap_or_default());
        }
    }
    Ok(())
}

async fn run_scan(
    path: PathBuf,
    output: Option<PathBuf>,
    abort_after: Option<Duration>,
) -> Result<()> {
    let config = load(&path)?;
    logging::init_from_config(&config)?;
    info!(app = %config.application.name, config = %path.display(), "Configuration loaded");

    let access = simulated_access(&config.simulation, &config.scan);
    let source = Arc::new(simulated_stream(&config.simulation, access.clone()));

    let dyn_access: Arc<dyn ChannelAccess> = access.clone();
    let mut orchestrator = ScanOrchestrator::new(
        dyn_access.clone(),
        source.clone(),
        source,
        config.engine.clone(),
    );
    if !config.engine.snapshot.is_empty() {
        orchestrator = orchestrator.with_snapshot(Arc::new(ChannelListSnapshot::new(
            dyn_access,
            config.engine.snapshot.clone(),
            config.engine.connect_timeout,
        )));
    }
    if let Some(dir) = output.or_else(|| config.application.output_dir.clone()) {
        orchestrator = orchestrator.with_recorder(Arc::new(JsonRecorder::new(dir)));
    }
    let orchestrator = Arc::new(orchestrator);

    let mut events = orchestrator.subscribe();
    let reporter = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ScanEvent::StepTimeout { step } => warn!(step, "Readback did not settle"),
                ScanEvent::Terminated { .. } => {
                    info!(%event, "Run finished");
                    break;
                }
                event => info!(%event, "Scan event"),
            }
        }
    });

    if let Some(delay) = abort_after {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = orchestrator.abort().await {
                warn!(error = %e, "Abort incomplete");
            }
        });
    }

    let result = orchestrator.run(&config.scan).await?;
    let _ = reporter.await;

    println!(
        "Run {} finished: {} ({} samples, shape {:?})",
        result.run_id,
        result.status,
        result.processed,
        result.buffer.shape()
    );
    if result.step_timeouts.iter().any(|timed_out| *timed_out) {
        println!("  steps with readback timeout: {:?}", result.step_timeouts);
    }
    Ok(())
}

/// Control system holding every channel the scan touches.
fn simulated_access(simulation: &SimulationConfig, scan: &ScanRequest) -> Arc<SimChannelAccess> {
    let access = Arc::new(SimChannelAccess::new());
    let initial = |name: &str| simulation.channels.get(name).copied().unwrap_or(0.0);

    for (name, value) in &simulation.channels {
        access.add_scalar(name, *value);
    }
    for (name, definition) in &scan.actuators {
        if access.value(name).is_none() {
            access.add_scalar(name, initial(name));
        }
        if let Some(readback) = &definition.readback {
            if access.value(readback).is_none() {
                access.add_scalar(readback, initial(name));
            }
            access.link_readback(readback, name, simulation.readback_lag);
        }
    }
    for (name, value) in &scan.preaction {
        if access.value(name).is_some() {
            continue;
        }
        match value {
            ChannelValue::Scalar(_) => access.add_scalar(name, 0.0),
            ChannelValue::Array(values) => access.add_array(name, vec![0.0; values.len()]),
        }
    }
    access
}

fn simulated_stream(simulation: &SimulationConfig, access: Arc<SimChannelAccess>) -> SimTelemetrySource {
    let mut source = SimTelemetrySource::new(simulation.stream_period)
        .with_access(access)
        .with_noise(simulation.noise);
    for channel in &simulation.stream {
        let info = match channel.length {
            Some(len) => ChannelInfo::array(&channel.name, len),
            None => ChannelInfo::scalar(&channel.name),
        };
        let signal = match &channel.follow {
            Some(follow) => Signal::Follow {
                channel: follow.clone(),
                gain: channel.gain,
            },
            None => Signal::Constant(channel.value),
        };
        source = source.with_channel(info, signal);
    }
    source
}
