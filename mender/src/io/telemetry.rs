//! Run telemetry: an ordered event log plus final metrics, persisted as JSON.
//!
//! The engine only talks to the [`Telemetry`] trait. [`JsonTelemetry`] keeps an
//! in-memory [`ExperimentData`] snapshot and writes it to
//! `<log_dir>/experiment_data.json`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::core::summary::{FileSummary, RunSummary};
use crate::io::config::write_atomic;

pub const EXPERIMENT_FILE_NAME: &str = "experiment_data.json";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryEvent {
    pub timestamp: String,
    #[serde(rename = "event_type")]
    pub kind: String,
    pub payload: Value,
}

impl TelemetryEvent {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            timestamp: Local::now().to_rfc3339(),
            kind: kind.into(),
            payload,
        }
    }

    /// Failure events are mirrored into the snapshot's error list.
    pub fn is_error(&self) -> bool {
        self.kind.ends_with("_failed") || self.kind.ends_with("error")
    }
}

/// Aggregates recorded once when a run finalizes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FinalMetrics {
    pub status: String,
    pub total_iterations: u32,
    pub files_processed: usize,
    pub files_successful: usize,
    pub files_failed: usize,
    pub initial_score: f64,
    pub final_score: f64,
    pub score_improvement: f64,
    pub tests_run: u32,
    pub tests_passed: u32,
    pub tests_failed: u32,
    pub file_results: Vec<FileSummary>,
}

impl From<&RunSummary> for FinalMetrics {
    fn from(summary: &RunSummary) -> Self {
        Self {
            status: summary.status.as_str().to_string(),
            total_iterations: summary.global_iterations,
            files_processed: summary.files_processed,
            files_successful: summary.files_successful,
            files_failed: summary.files_failed,
            initial_score: summary.initial_average,
            final_score: summary.final_average,
            score_improvement: summary.score_improvement(),
            tests_run: summary.tests.run,
            tests_passed: summary.tests.passed,
            tests_failed: summary.tests.failed,
            file_results: summary.files.clone(),
        }
    }
}

pub trait Telemetry {
    fn append(&mut self, event: TelemetryEvent);
    fn record_final_metrics(&mut self, metrics: FinalMetrics);
    /// Write a durable snapshot and return where it landed.
    fn persist(&mut self) -> Result<PathBuf>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorEntry {
    pub timestamp: String,
    pub error_type: String,
    pub message: String,
    pub file: Option<String>,
}

impl ErrorEntry {
    fn from_event(event: &TelemetryEvent) -> Self {
        let field = |name: &str| event.payload.get(name).and_then(Value::as_str).map(str::to_string);
        Self {
            timestamp: event.timestamp.clone(),
            error_type: event.kind.clone(),
            message: field("error").unwrap_or_default(),
            file: field("file"),
        }
    }
}

/// Everything written to `experiment_data.json`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExperimentData {
    pub experiment_id: String,
    pub started_at: String,
    pub completed_at: Option<String>,
    pub target_directory: String,
    pub max_iterations: u32,
    pub tools_used: Vec<String>,
    pub results: Option<FinalMetrics>,
    pub duration_seconds: f64,
    pub events: Vec<TelemetryEvent>,
    pub errors: Vec<ErrorEntry>,
}

#[derive(Debug)]
pub struct JsonTelemetry {
    path: PathBuf,
    started: DateTime<Local>,
    auto_save_interval: usize,
    data: ExperimentData,
}

impl JsonTelemetry {
    pub fn new(
        log_dir: &Path,
        target_directory: &Path,
        max_iterations: u32,
        auto_save_interval: usize,
    ) -> Self {
        let started = Local::now();
        Self {
            path: log_dir.join(EXPERIMENT_FILE_NAME),
            started,
            auto_save_interval: auto_save_interval.max(1),
            data: ExperimentData {
                experiment_id: format!("exp_{}", started.format("%Y%m%d_%H%M%S")),
                started_at: started.to_rfc3339(),
                completed_at: None,
                target_directory: target_directory.display().to_string(),
                max_iterations,
                tools_used: vec![
                    "pylint".to_string(),
                    "pytest".to_string(),
                    "sandbox".to_string(),
                ],
                results: None,
                duration_seconds: 0.0,
                events: Vec::new(),
                errors: Vec::new(),
            },
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn data(&self) -> &ExperimentData {
        &self.data
    }

    fn write_snapshot(&mut self) -> Result<()> {
        let elapsed = Local::now().signed_duration_since(self.started);
        self.data.duration_seconds = elapsed.num_milliseconds() as f64 / 1000.0;
        let mut buf =
            serde_json::to_string_pretty(&self.data).context("serialize experiment data")?;
        buf.push('\n');
        write_atomic(&self.path, &buf)
    }
}

impl Telemetry for JsonTelemetry {
    fn append(&mut self, event: TelemetryEvent) {
        if event.is_error() {
            self.data.errors.push(ErrorEntry::from_event(&event));
        }
        self.data.events.push(event);
        if self.data.events.len() % self.auto_save_interval == 0 {
            // A crash loses at most one interval of events.
            if let Err(err) = self.write_snapshot() {
                warn!(err = %format!("{err:#}"), "telemetry auto-save failed");
            }
        }
    }

    fn record_final_metrics(&mut self, metrics: FinalMetrics) {
        self.data.completed_at = Some(Local::now().to_rfc3339());
        self.data.results = Some(metrics);
    }

    fn persist(&mut self) -> Result<PathBuf> {
        self.write_snapshot()
            .with_context(|| format!("persist telemetry {}", self.path.display()))?;
        debug!(path = %self.path.display(), events = self.data.events.len(), "telemetry persisted");
        Ok(self.path.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;

    fn read_json(path: &Path) -> Value {
        serde_json::from_str(&fs::read_to_string(path).expect("read")).expect("json")
    }

    #[test]
    fn failure_events_are_mirrored_into_errors() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut telemetry = JsonTelemetry::new(temp.path(), Path::new("/src"), 3, 100);
        telemetry.append(TelemetryEvent::new("file_analyzed", json!({"file": "a.py"})));
        telemetry.append(TelemetryEvent::new(
            "fix_failed",
            json!({"file": "a.py", "error": "no code"}),
        ));
        telemetry.append(TelemetryEvent::new("run_error", json!({"error": "boom"})));

        let data = telemetry.data();
        assert_eq!(data.events.len(), 3);
        assert_eq!(data.errors.len(), 2);
        assert_eq!(data.errors[0].error_type, "fix_failed");
        assert_eq!(data.errors[0].file.as_deref(), Some("a.py"));
        assert_eq!(data.errors[1].message, "boom");
        assert!(data.experiment_id.starts_with("exp_"));
    }

    #[test]
    fn persist_writes_snapshot_atomically() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log_dir = temp.path().join("logs");
        let mut telemetry = JsonTelemetry::new(&log_dir, Path::new("/src"), 3, 100);
        telemetry.append(TelemetryEvent::new("initialization_complete", json!({"files": 2})));
        telemetry.record_final_metrics(FinalMetrics {
            status: "partial".to_string(),
            total_iterations: 4,
            files_processed: 2,
            files_successful: 1,
            files_failed: 1,
            initial_score: 4.5,
            final_score: 6.5,
            score_improvement: 2.0,
            tests_run: 0,
            tests_passed: 0,
            tests_failed: 0,
            file_results: Vec::new(),
        });

        let path = telemetry.persist().expect("persist");
        assert_eq!(path, log_dir.join(EXPERIMENT_FILE_NAME));
        let value = read_json(&path);
        assert_eq!(value["results"]["status"], "partial");
        assert_eq!(value["events"][0]["event_type"], "initialization_complete");
        assert!(value["completed_at"].is_string());
        assert!(!log_dir.join("experiment_data.json.tmp").exists());
    }

    #[test]
    fn auto_saves_every_interval() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut telemetry = JsonTelemetry::new(temp.path(), Path::new("/src"), 3, 2);
        telemetry.append(TelemetryEvent::new("a", json!({})));
        assert!(!telemetry.path().exists());
        telemetry.append(TelemetryEvent::new("b", json!({})));
        assert!(telemetry.path().exists());
        assert_eq!(read_json(telemetry.path())["events"].as_array().map(Vec::len), Some(2));
    }
}
