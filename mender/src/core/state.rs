//! Whole-run workflow state and the pure decision function.
//!
//! The queue discipline is strictly FIFO: the current path is always the head
//! of the pending queue, and it only changes when the head reaches a terminal
//! status.

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};

use anyhow::{Result, anyhow};

use crate::core::record::ArtifactRecord;
use crate::core::types::{Decision, LifecycleStatus, RunStatus, Verdict};

/// Terminal status the decision function picked for the current artifact, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Retry,
    Settle(LifecycleStatus),
}

/// Decide what happens to an artifact after an evaluation.
///
/// `SUCCESS` settles as success. `FAILURE` or an exhausted iteration budget
/// settles as failed. Everything else loops back to repair.
pub fn settle(verdict: Verdict, iteration_count: u32, max_iterations: u32) -> Settlement {
    match verdict {
        Verdict::Success => Settlement::Settle(LifecycleStatus::Success),
        Verdict::Failure => Settlement::Settle(LifecycleStatus::Failed),
        Verdict::Retry if iteration_count >= max_iterations => {
            Settlement::Settle(LifecycleStatus::Failed)
        }
        Verdict::Retry => Settlement::Retry,
    }
}

#[derive(Debug, Clone)]
pub struct WorkflowState {
    records: BTreeMap<PathBuf, ArtifactRecord>,
    pending: VecDeque<PathBuf>,
    global_iterations: u32,
    max_iterations: u32,
    status: RunStatus,
}

impl WorkflowState {
    /// Build the state for discovered files, queued in lexicographic order.
    pub fn new(mut paths: Vec<PathBuf>, max_iterations: u32, max_error_log_entries: usize) -> Self {
        paths.sort();
        paths.dedup();
        let records = paths
            .iter()
            .map(|path| {
                (
                    path.clone(),
                    ArtifactRecord::new(path.clone(), max_error_log_entries),
                )
            })
            .collect();
        let status = if paths.is_empty() {
            RunStatus::NoFiles
        } else {
            RunStatus::Running
        };
        Self {
            records,
            pending: paths.into(),
            global_iterations: 0,
            max_iterations,
            status,
        }
    }

    pub fn current_path(&self) -> Option<&Path> {
        self.pending.front().map(PathBuf::as_path)
    }

    pub fn current(&self) -> Option<&ArtifactRecord> {
        self.current_path().and_then(|path| self.records.get(path))
    }

    pub fn current_mut(&mut self) -> Option<&mut ArtifactRecord> {
        let path = self.pending.front()?;
        self.records.get_mut(path)
    }

    pub fn records(&self) -> impl Iterator<Item = &ArtifactRecord> {
        self.records.values()
    }

    pub fn record(&self, path: &Path) -> Option<&ArtifactRecord> {
        self.records.get(path)
    }

    pub fn pending(&self) -> impl Iterator<Item = &Path> {
        self.pending.iter().map(PathBuf::as_path)
    }

    pub fn max_iterations(&self) -> u32 {
        self.max_iterations
    }

    pub fn global_iterations(&self) -> u32 {
        self.global_iterations
    }

    pub fn count_evaluation(&mut self) {
        self.global_iterations += 1;
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn set_status(&mut self, status: RunStatus) {
        self.status = status;
    }

    /// Apply the decision for the current artifact and advance the queue.
    ///
    /// Retires the head the instant it becomes terminal.
    pub fn decide(&mut self) -> Result<Decision> {
        let max_iterations = self.max_iterations;
        let record = self
            .current_mut()
            .ok_or_else(|| anyhow!("decide called with an empty queue"))?;
        let verdict = record.verdict.unwrap_or(Verdict::Retry);

        match settle(verdict, record.iteration_count(), max_iterations) {
            Settlement::Retry => Ok(Decision::Continue),
            Settlement::Settle(terminal) => {
                record.transition(terminal)?;
                self.pending.pop_front();
                if self.pending.is_empty() {
                    Ok(Decision::End)
                } else {
                    Ok(Decision::NextFile)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn evaluated(state: &mut WorkflowState, verdict: Verdict) {
        let record = state.current_mut().expect("current");
        if record.status() == LifecycleStatus::Pending {
            record.transition(LifecycleStatus::Analyzed).expect("analyzed");
        }
        record.transition(LifecycleStatus::Fixing).expect("fixing");
        record.record_attempt();
        record.transition(LifecycleStatus::Evaluated).expect("evaluated");
        record.verdict = Some(verdict);
    }

    #[test]
    fn settle_covers_every_verdict() {
        assert_eq!(
            settle(Verdict::Success, 1, 3),
            Settlement::Settle(LifecycleStatus::Success)
        );
        assert_eq!(
            settle(Verdict::Failure, 1, 3),
            Settlement::Settle(LifecycleStatus::Failed)
        );
        assert_eq!(settle(Verdict::Retry, 2, 3), Settlement::Retry);
        assert_eq!(
            settle(Verdict::Retry, 3, 3),
            Settlement::Settle(LifecycleStatus::Failed)
        );
    }

    #[test]
    fn queue_is_lexicographic_and_head_is_current() {
        let state = WorkflowState::new(
            vec![PathBuf::from("/s/b.py"), PathBuf::from("/s/a.py")],
            3,
            50,
        );
        assert_eq!(state.current_path(), Some(Path::new("/s/a.py")));
        let queued: Vec<&Path> = state.pending().collect();
        assert_eq!(queued, vec![Path::new("/s/a.py"), Path::new("/s/b.py")]);
        assert_eq!(state.status(), RunStatus::Running);
    }

    #[test]
    fn empty_discovery_is_no_files() {
        let state = WorkflowState::new(Vec::new(), 3, 50);
        assert_eq!(state.status(), RunStatus::NoFiles);
        assert!(state.current_path().is_none());
    }

    #[test]
    fn success_advances_then_ends() {
        let mut state = WorkflowState::new(
            vec![PathBuf::from("/s/a.py"), PathBuf::from("/s/b.py")],
            3,
            50,
        );
        evaluated(&mut state, Verdict::Success);
        assert_eq!(state.decide().expect("decide"), Decision::NextFile);
        assert_eq!(state.current_path(), Some(Path::new("/s/b.py")));
        assert_eq!(
            state.record(Path::new("/s/a.py")).expect("a").status(),
            LifecycleStatus::Success
        );

        evaluated(&mut state, Verdict::Failure);
        assert_eq!(state.decide().expect("decide"), Decision::End);
        assert!(state.current_path().is_none());
    }

    #[test]
    fn retry_stays_on_same_artifact_until_budget_runs_out() {
        let mut state = WorkflowState::new(vec![PathBuf::from("/s/a.py")], 2, 50);
        evaluated(&mut state, Verdict::Retry);
        assert_eq!(state.decide().expect("decide"), Decision::Continue);
        assert_eq!(state.current_path(), Some(Path::new("/s/a.py")));

        evaluated(&mut state, Verdict::Retry);
        assert_eq!(state.decide().expect("decide"), Decision::End);
        let record = state.record(Path::new("/s/a.py")).expect("a");
        assert_eq!(record.status(), LifecycleStatus::Failed);
        assert_eq!(record.iteration_count(), 2);
    }
}
