//! Run directory layout and the persisted run summary.

use std::fs::File;
use std::io::BufWriter;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use chrono::DateTime;
use chrono::Local;
use chrono::Utc;
use error_stack::Report;
use error_stack::ResultExt;
use serde::Serialize;

use crate::config::FleetConfig;
use crate::domain::benchmark::BenchmarkReport;
use crate::domain::BenchmarkSpec;
use crate::error::RunError;

pub const SUMMARY_FILE: &str = "run.json";

/// Directory name of a run started at `start`, ISO-8601 with microseconds.
pub fn run_dir_name(start: DateTime<Local>) -> String {
    start.format("%Y-%m-%dT%H:%M:%S%.6f").to_string()
}

/// Creates `<output_dir>/<start>` and returns its absolute path.
pub fn create_run_dir(output_dir: &Path, start: DateTime<Local>) -> std::io::Result<PathBuf> {
    let dir = output_dir.join(run_dir_name(start));
    std::fs::create_dir_all(&dir)?;
    // virtiofsd shares it with guests, relative paths would break there
    dir.canonicalize()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Succeeded,
    Failed {
        /// Top level context, e.g. `Benchmark failed`
        stage: String,
        error: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub version: &'static str,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed_secs: f64,
    pub fleet: FleetConfig,
    pub benchmark: BenchmarkSpec,
    pub outcome: RunOutcome,
    /// Absent when the run failed before the benchmark finished
    pub report: Option<BenchmarkReport>,
    /// Guests whose kernel modules could not be inserted
    pub module_failures: Vec<String>,
}

pub fn write_summary(run_dir: &Path, summary: &RunSummary) -> Result<PathBuf, Report<RunError>> {
    let path = run_dir.join(SUMMARY_FILE);
    let file = File::create(&path)
        .change_context(RunError::Artifacts)
        .attach_printable_lazy(|| path.display().to_string())?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, summary).change_context(RunError::Artifacts)?;
    writer.flush().change_context(RunError::Artifacts)?;
    Ok(path)
}
