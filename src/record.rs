//! Run results and their persistence.
//!
//! [`RunResult`] is produced exactly once per run. A [`RunRecorder`] receives
//! it after restoration finished; [`JsonRecorder`] dumps it as JSON, one file
//! per run.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::error::RunStatus;
use crate::scan::{RampTable, SampleBuffer, ScanType};
use crate::snapshot::ConfigSnapshot;

/// Outcome of one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    /// Unique run identifier
    pub run_id: String,
    pub name: String,
    pub scan_type: ScanType,
    pub status: RunStatus,
    /// Samples recorded before the loop ended
    pub processed: usize,
    pub buffer: SampleBuffer,
    /// Ramp actually used, `None` for a time recording
    pub ramp: Option<RampTable>,
    /// One flag per step whose readbacks did not settle in time
    pub step_timeouts: Vec<bool>,
    pub snapshot: Option<ConfigSnapshot>,
    pub started: DateTime<Utc>,
    pub finished: DateTime<Utc>,
}

impl RunResult {
    /// Termination code as published in `Terminated`.
    pub fn code(&self) -> i32 {
        self.status.code()
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Default file name: `<name>_<YYYYmmdd_HHMMSS>_<run id>.json`.
    pub fn default_filename(&self) -> String {
        format!(
            "{}_{}_{}.json",
            self.name,
            self.started.format("%Y%m%d_%H%M%S"),
            self.run_id
        )
    }
}

/// Capability: Run Persistence
#[async_trait]
pub trait RunRecorder: Send + Sync {
    /// Persist a finished run.
    async fn record(&self, result: &RunResult) -> Result<()>;
}

/// Writes every run as pretty-printed JSON into a directory.
#[derive(Debug, Clone)]
pub struct JsonRecorder {
    dir: PathBuf,
}

impl JsonRecorder {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Where `result` is written.
    pub fn path_for(&self, result: &RunResult) -> PathBuf {
        self.dir.join(result.default_filename())
    }
}

#[async_trait]
impl RunRecorder for JsonRecorder {
    async fn record(&self, result: &RunResult) -> Result<()> {
        let json = serde_json::to_vec_pretty(result).context("Failed to serialize run result")?;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create output directory {:?}", self.dir))?;
        let path = self.path_for(result);
        tokio::fs::write(&path, json)
            .await
            .with_context(|| format!("Failed to write run result to {:?}", path))?;
        info!(path = %path.display(), code = result.code(), "Run result written");
        Ok(())
    }
}
