//! Aggregate metrics computed when a run finalizes.

use std::path::PathBuf;

use serde::Serialize;

use crate::core::state::WorkflowState;
use crate::core::types::{LifecycleStatus, RunStatus, Verdict};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileSummary {
    pub path: PathBuf,
    pub status: LifecycleStatus,
    pub verdict: Option<Verdict>,
    pub original_score: f64,
    pub current_score: f64,
    pub iterations: u32,
    pub tests_passed: bool,
    pub changes: usize,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TestTotals {
    pub run: u32,
    pub passed: u32,
    pub failed: u32,
}

/// End-of-run report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub status: RunStatus,
    pub initial_average: f64,
    pub final_average: f64,
    pub success_ratio: f64,
    pub files_processed: usize,
    pub files_successful: usize,
    pub files_failed: usize,
    pub global_iterations: u32,
    pub tests: TestTotals,
    pub files: Vec<FileSummary>,
}

impl RunSummary {
    pub fn score_improvement(&self) -> f64 {
        round2(self.final_average - self.initial_average)
    }

    /// Whether tooling built on this report should exit non-zero.
    pub fn has_failures(&self) -> bool {
        self.files_failed > 0
    }
}

/// Summarize `state`.
///
/// Run status is taken from `status_override` when given (cancellation), and
/// otherwise derived: `success` iff every record settled as `Success`.
pub fn summarize(state: &WorkflowState, status_override: Option<RunStatus>) -> RunSummary {
    let files: Vec<FileSummary> = state
        .records()
        .map(|record| FileSummary {
            path: record.path().to_path_buf(),
            status: record.status(),
            verdict: record.verdict,
            original_score: record.original_score,
            current_score: record.current_score,
            iterations: record.iteration_count(),
            tests_passed: record.tests_passed,
            changes: record.change_log().len(),
            last_error: record.error_log.last().map(str::to_string),
        })
        .collect();

    let processed = files.len();
    let successful = files
        .iter()
        .filter(|file| file.status == LifecycleStatus::Success)
        .count();
    let failed = files
        .iter()
        .filter(|file| file.status == LifecycleStatus::Failed)
        .count();

    let mut tests = TestTotals::default();
    for record in state.records() {
        if let Some(result) = &record.last_tests {
            tests.run += result.total_tests;
            tests.passed += result.passed;
            tests.failed += result.failed;
        }
    }

    let status = status_override.unwrap_or(if processed == 0 {
        RunStatus::NoFiles
    } else if successful == processed {
        RunStatus::Success
    } else {
        RunStatus::Partial
    });

    RunSummary {
        status,
        initial_average: average(files.iter().map(|file| file.original_score)),
        final_average: average(files.iter().map(|file| file.current_score)),
        success_ratio: if processed == 0 {
            0.0
        } else {
            round2(successful as f64 / processed as f64)
        },
        files_processed: processed,
        files_successful: successful,
        files_failed: failed,
        global_iterations: state.global_iterations(),
        tests,
        files,
    }
}

fn average(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, count) = values.fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
    if count == 0 {
        return 0.0;
    }
    round2(sum / count as f64)
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::TestResult;
    use std::path::Path;

    fn settle(state: &mut WorkflowState, original: f64, current: f64, verdict: Verdict) {
        let record = state.current_mut().expect("current");
        record.original_score = original;
        record.current_score = current;
        record.transition(LifecycleStatus::Analyzed).expect("analyzed");
        record.transition(LifecycleStatus::Fixing).expect("fixing");
        record.record_attempt();
        record.transition(LifecycleStatus::Evaluated).expect("evaluated");
        record.verdict = Some(verdict);
        record.last_tests = Some(TestResult {
            success: verdict == Verdict::Success,
            passed: 2,
            failed: 1,
            total_tests: 3,
            failures: Vec::new(),
        });
        state.decide().expect("decide");
    }

    #[test]
    fn mixed_outcomes_are_partial_with_averages() {
        let mut state = WorkflowState::new(
            vec![PathBuf::from("/s/a.py"), PathBuf::from("/s/b.py")],
            1,
            50,
        );
        settle(&mut state, 5.0, 9.0, Verdict::Success);
        settle(&mut state, 4.0, 4.0, Verdict::Retry);

        let summary = summarize(&state, None);
        assert_eq!(summary.status, RunStatus::Partial);
        assert_eq!(summary.initial_average, 4.5);
        assert_eq!(summary.final_average, 6.5);
        assert_eq!(summary.success_ratio, 0.5);
        assert_eq!(summary.files_failed, 1);
        assert!(summary.has_failures());
        assert_eq!(summary.score_improvement(), 2.0);
        assert_eq!(summary.tests.run, 6);
        assert_eq!(
            summary.files[1].path,
            Path::new("/s/b.py").to_path_buf()
        );
    }

    #[test]
    fn all_success_is_success() {
        let mut state = WorkflowState::new(vec![PathBuf::from("/s/a.py")], 3, 50);
        settle(&mut state, 6.666, 8.333, Verdict::Success);
        let summary = summarize(&state, None);
        assert_eq!(summary.status, RunStatus::Success);
        assert_eq!(summary.initial_average, 6.67);
        assert_eq!(summary.final_average, 8.33);
        assert!(!summary.has_failures());
    }

    #[test]
    fn empty_state_reports_no_files() {
        let state = WorkflowState::new(Vec::new(), 3, 50);
        let summary = summarize(&state, None);
        assert_eq!(summary.status, RunStatus::NoFiles);
        assert_eq!(summary.initial_average, 0.0);
        assert_eq!(summary.success_ratio, 0.0);
    }

    #[test]
    fn override_wins() {
        let state = WorkflowState::new(vec![PathBuf::from("/s/a.py")], 3, 50);
        let summary = summarize(&state, Some(RunStatus::Cancelled));
        assert_eq!(summary.status, RunStatus::Cancelled);
    }
}
