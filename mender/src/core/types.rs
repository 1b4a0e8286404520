//! Shared deterministic types for the workflow core.
//!
//! These types define stable contracts between the engine, the stage agents and
//! the collaborator adapters. They carry no I/O.

use serde::{Deserialize, Serialize};

/// Tri-state outcome of evaluating one repair attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    Success,
    Retry,
    Failure,
}

impl Verdict {
    /// Lenient parse of a verdict label produced by the evaluation collaborator.
    ///
    /// Anything unrecognised maps to `Retry`.
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_uppercase().as_str() {
            "SUCCESS" => Verdict::Success,
            "FAILURE" | "FAILED" | "FAIL" => Verdict::Failure,
            _ => Verdict::Retry,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Verdict::Success => "SUCCESS",
            Verdict::Retry => "RETRY",
            Verdict::Failure => "FAILURE",
        }
    }
}

/// Per-artifact lifecycle.
///
/// `Pending → Analyzed|AnalysisFailed → (Fixing ⇄ Evaluated) → Success|Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleStatus {
    Pending,
    Analyzed,
    AnalysisFailed,
    Fixing,
    Evaluated,
    Success,
    Failed,
}

impl LifecycleStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, LifecycleStatus::Success | LifecycleStatus::Failed)
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: LifecycleStatus) -> bool {
        use LifecycleStatus as S;
        matches!(
            (self, next),
            (S::Pending, S::Analyzed | S::AnalysisFailed)
                | (S::Analyzed | S::AnalysisFailed, S::Fixing)
                | (S::Fixing, S::Evaluated)
                | (S::Evaluated, S::Fixing | S::Success | S::Failed)
        )
    }
}

/// Overall status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    Partial,
    NoFiles,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Partial => "partial",
            RunStatus::NoFiles => "no_files",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

/// Where the driver goes after an evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Loop back to repair on the same artifact.
    Continue,
    /// Current artifact is terminal; another one is queued.
    NextFile,
    /// Current artifact is terminal and the queue is empty.
    End,
}

/// One finding reported by the analysis stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Issue {
    #[serde(rename = "type")]
    pub kind: String,
    pub line: Option<u32>,
    pub priority: String,
    pub description: String,
    pub fix: String,
}

/// One planned repair action.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlanStep {
    pub step: u32,
    pub priority: String,
    pub action: String,
    pub rationale: String,
}

/// One message from the static-analysis collaborator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LintMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub line: u32,
    pub symbol: String,
    pub message: String,
}

/// Output of the static-analysis collaborator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    /// Quality score clamped to `[0, 10]`.
    pub score: f64,
    pub messages: Vec<LintMessage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestFailure {
    pub file: String,
    pub reason: String,
}

/// Output of the test-runner collaborator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResult {
    pub success: bool,
    pub passed: u32,
    pub failed: u32,
    pub total_tests: u32,
    pub failures: Vec<TestFailure>,
}

/// Clamp a raw quality score into `[0, 10]`.
pub fn clamp_score(raw: f64) -> f64 {
    if raw.is_nan() {
        return 0.0;
    }
    raw.clamp(0.0, 10.0)
}
