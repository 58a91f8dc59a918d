//! Crash reports written when the tick loop dies.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::Local;
use serde::Serialize;

use crate::fault::FaultRecord;
use crate::timings::TimingSummary;

/// Failure to persist a crash report.
#[derive(Debug, thiserror::Error)]
pub enum CrashReportError {
    /// The report directory or file could not be written.
    #[error("could not write crash report to {path}: {source}")]
    Io {
        /// The file or directory involved.
        path: PathBuf,
        /// The underlying error.
        source: io::Error,
    },
    /// The report could not be serialized.
    #[error("could not serialize crash report: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Everything known about the server at the moment of a fatal fault.
#[derive(Debug, Clone, Serialize)]
pub struct CrashReport {
    /// Headline, e.g. "Exception ticking world".
    pub title: String,
    /// Local time the report was assembled, RFC 3339.
    pub time: String,
    /// The fault that killed the loop.
    pub fault: FaultRecord,
    /// Phase and unit the loop was in.
    pub profiler_position: String,
    /// Number of connected sessions.
    pub session_count: usize,
    /// Ticks completed before the fault.
    pub ticks_completed: u64,
    /// Configured ticks per second.
    pub tick_rate: f32,
    /// Recent tick timings.
    pub timings: TimingSummary,
    /// Recoverable faults seen shortly before, oldest first.
    pub recent_faults: Vec<FaultRecord>,
    /// Per-unit state supplied by the simulation.
    pub units: serde_json::Value,
}

impl CrashReport {
    /// Title used for a fault in `phase`.
    #[must_use]
    pub fn title_for(phase: &str, per_unit: bool) -> String {
        if per_unit {
            format!("Exception in {phase}")
        } else {
            "Exception in server tick loop".to_owned()
        }
    }

    /// Current local time in the report's format.
    #[must_use]
    pub fn now() -> String {
        Local::now().to_rfc3339()
    }
}

/// Writes crash reports into a directory.
#[derive(Debug, Clone)]
pub struct CrashReporter {
    dir: PathBuf,
}

impl CrashReporter {
    /// Creates a reporter writing into `dir`, created on first use.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The directory reports go to.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Saves `report` as pretty JSON and returns the file it went to.
    ///
    /// Files are named `crash-<date>_<time>-server.json`; a numeric suffix is
    /// added if a report with the same timestamp already exists.
    pub fn write(&self, report: &CrashReport) -> Result<PathBuf, CrashReportError> {
        fs::create_dir_all(&self.dir).map_err(|source| CrashReportError::Io {
            path: self.dir.clone(),
            source,
        })?;

        let stamp = Local::now().format("%Y-%m-%d_%H.%M.%S");
        let mut path = self.dir.join(format!("crash-{stamp}-server.json"));
        let mut suffix = 1;
        while path.exists() {
            path = self.dir.join(format!("crash-{stamp}-server-{suffix}.json"));
            suffix += 1;
        }

        let contents = serde_json::to_string_pretty(report)?;
        fs::write(&path, contents).map_err(|source| CrashReportError::Io {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }
}
