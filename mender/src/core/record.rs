//! Per-artifact record and its guarded lifecycle transitions.

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::core::error::MenderError;
use crate::core::error_log::ErrorLog;
use crate::core::types::{Issue, LifecycleStatus, PlanStep, TestResult, Verdict};

/// Everything the workflow tracks about one source file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArtifactRecord {
    path: PathBuf,
    status: LifecycleStatus,
    pub original_score: f64,
    pub current_score: f64,
    pub issues: Vec<Issue>,
    pub plan: Vec<PlanStep>,
    iteration_count: u32,
    change_log: Vec<String>,
    pub error_log: ErrorLog,
    pub tests_passed: bool,
    pub last_tests: Option<TestResult>,
    pub verdict: Option<Verdict>,
}

impl ArtifactRecord {
    pub fn new(path: PathBuf, max_error_log_entries: usize) -> Self {
        Self {
            path,
            status: LifecycleStatus::Pending,
            original_score: 0.0,
            current_score: 0.0,
            issues: Vec::new(),
            plan: Vec::new(),
            iteration_count: 0,
            change_log: Vec::new(),
            error_log: ErrorLog::new(max_error_log_entries),
            tests_passed: false,
            last_tests: None,
            verdict: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn status(&self) -> LifecycleStatus {
        self.status
    }

    pub fn iteration_count(&self) -> u32 {
        self.iteration_count
    }

    pub fn change_log(&self) -> &[String] {
        &self.change_log
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Move to `next`, rejecting edges the lifecycle does not allow.
    pub fn transition(&mut self, next: LifecycleStatus) -> Result<(), MenderError> {
        if !self.status.can_transition_to(next) {
            return Err(MenderError::InvalidTransition {
                path: self.path.clone(),
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Count one repair attempt, whether or not it produced code.
    pub fn record_attempt(&mut self) {
        self.iteration_count += 1;
    }

    pub fn record_change(&mut self, change: impl Into<String>) {
        self.change_log.push(change.into());
    }

    pub fn record_error(&mut self, message: impl Into<String>) {
        self.error_log.push(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> ArtifactRecord {
        ArtifactRecord::new(PathBuf::from("/sandbox/a.py"), 50)
    }

    #[test]
    fn walks_full_lifecycle() {
        let mut rec = record();
        rec.transition(LifecycleStatus::Analyzed).expect("analyzed");
        rec.transition(LifecycleStatus::Fixing).expect("fixing");
        rec.transition(LifecycleStatus::Evaluated).expect("evaluated");
        rec.transition(LifecycleStatus::Fixing).expect("fixing again");
        rec.transition(LifecycleStatus::Evaluated).expect("evaluated again");
        rec.transition(LifecycleStatus::Success).expect("success");
        assert!(rec.is_terminal());
    }

    #[test]
    fn terminal_status_never_changes() {
        let mut rec = record();
        rec.transition(LifecycleStatus::AnalysisFailed).expect("failed analysis");
        rec.transition(LifecycleStatus::Fixing).expect("fixing");
        rec.transition(LifecycleStatus::Evaluated).expect("evaluated");
        rec.transition(LifecycleStatus::Failed).expect("failed");

        let err = rec
            .transition(LifecycleStatus::Fixing)
            .expect_err("terminal record must not move");
        assert!(matches!(
            err,
            MenderError::InvalidTransition {
                from: LifecycleStatus::Failed,
                to: LifecycleStatus::Fixing,
                ..
            }
        ));
        assert_eq!(rec.status(), LifecycleStatus::Failed);
    }

    #[test]
    fn cannot_skip_analysis() {
        let mut rec = record();
        assert!(rec.transition(LifecycleStatus::Fixing).is_err());
        assert_eq!(rec.status(), LifecycleStatus::Pending);
    }

    #[test]
    fn change_log_is_append_only() {
        let mut rec = record();
        rec.record_change("renamed x");
        rec.record_change("added docstring");
        assert_eq!(rec.change_log(), ["renamed x", "added docstring"]);
    }
}
