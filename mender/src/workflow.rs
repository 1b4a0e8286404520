//! Workflow engine: drives every discovered file through analyze, repair and
//! evaluate until it settles, then summarizes the run.
//!
//! The engine owns the [`WorkflowState`]; stages only see the record in flight.
//! Stage failures are absorbed into that record's error log. Only errors that
//! [`MenderError::aborts_run`] classifies as fatal escape, and telemetry is
//! persisted on every exit path.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result, anyhow};
use serde_json::json;
use tracing::{info, instrument, warn};

use crate::agents::StageContext;
use crate::agents::auditor::audit;
use crate::agents::fixer::{RepairRequest, repair};
use crate::agents::judge::{EvaluationRequest, evaluate};
use crate::core::error::MenderError;
use crate::core::extract::Extractor;
use crate::core::record::ArtifactRecord;
use crate::core::state::WorkflowState;
use crate::core::summary::{RunSummary, summarize};
use crate::core::types::{Decision, LifecycleStatus, RunStatus, Verdict};
use crate::core::verdict::VerdictPolicy;
use crate::io::analyzer::StaticAnalyzer;
use crate::io::config::{MenderConfig, SandboxConfig};
use crate::io::discover::discover_files;
use crate::io::generator::TextGenerator;
use crate::io::prompt::PromptEngine;
use crate::io::retry::{RetryPolicy, Sleeper};
use crate::io::sandbox::Sandbox;
use crate::io::syntax::SyntaxValidator;
use crate::io::telemetry::{FinalMetrics, Telemetry, TelemetryEvent};
use crate::io::test_runner::TestRunner;

/// External capabilities the engine calls.
pub struct Collaborators<'a> {
    pub generator: &'a dyn TextGenerator,
    pub analyzer: &'a dyn StaticAnalyzer,
    pub test_runner: &'a dyn TestRunner,
    pub validator: &'a dyn SyntaxValidator,
    pub sleeper: &'a dyn Sleeper,
}

#[derive(Debug, Clone)]
pub struct WorkflowOptions {
    pub max_iterations: u32,
    pub max_error_log_entries: usize,
    pub feedback_tail_entries: usize,
    pub verdict: VerdictPolicy,
    pub retry: RetryPolicy,
    pub discovery: SandboxConfig,
}

impl Default for WorkflowOptions {
    fn default() -> Self {
        Self::from(&MenderConfig::default())
    }
}

impl From<&MenderConfig> for WorkflowOptions {
    fn from(cfg: &MenderConfig) -> Self {
        Self {
            max_iterations: cfg.workflow.max_iterations,
            max_error_log_entries: cfg.workflow.max_error_log_entries,
            feedback_tail_entries: cfg.workflow.feedback_tail_entries,
            verdict: cfg.verdict,
            retry: RetryPolicy::from(&cfg.retry),
            discovery: cfg.sandbox.clone(),
        }
    }
}

/// How the driver loop stopped.
enum Finish {
    Completed,
    Cancelled,
}

pub struct Workflow<'a> {
    sandbox: &'a Sandbox,
    collaborators: Collaborators<'a>,
    options: WorkflowOptions,
    prompts: PromptEngine,
    extractor: Extractor,
    cancel: Arc<AtomicBool>,
}

impl<'a> Workflow<'a> {
    pub fn new(
        sandbox: &'a Sandbox,
        collaborators: Collaborators<'a>,
        options: WorkflowOptions,
    ) -> Self {
        Self {
            sandbox,
            collaborators,
            options,
            prompts: PromptEngine::new(),
            extractor: Extractor::default(),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Share a flag that stops the run before the next stage once set.
    pub fn with_cancel_flag(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    /// Discover files under the sandbox root and process them all.
    #[instrument(skip_all, fields(root = %self.sandbox.root().display()))]
    pub fn run(&self, telemetry: &mut dyn Telemetry) -> Result<RunSummary> {
        let files = match discover_files(self.sandbox.root(), &self.options.discovery) {
            Ok(files) => files,
            Err(err) => {
                let state = self.initial_state(Vec::new());
                return Err(abort(&state, telemetry, err));
            }
        };
        self.run_files(files, telemetry)
    }

    /// Process an explicit file list.
    pub fn run_files(
        &self,
        files: Vec<PathBuf>,
        telemetry: &mut dyn Telemetry,
    ) -> Result<RunSummary> {
        let mut state = self.initial_state(files);
        let queued: Vec<String> = state.pending().map(display).collect();
        info!(files = queued.len(), dry_run = self.sandbox.is_dry_run(), "workflow initialized");
        telemetry.append(TelemetryEvent::new(
            "initialization_complete",
            json!({
                "file_count": queued.len(),
                "files": queued,
                "dry_run": self.sandbox.is_dry_run(),
            }),
        ));

        let summary = match self.drive(&mut state, telemetry) {
            Ok(Finish::Completed) => {
                let summary = summarize(&state, None);
                telemetry.append(TelemetryEvent::new(
                    "workflow_complete",
                    json!({
                        "status": summary.status.as_str(),
                        "files_processed": summary.files_processed,
                        "files_successful": summary.files_successful,
                        "initial_score": summary.initial_average,
                        "final_score": summary.final_average,
                    }),
                ));
                summary
            }
            Ok(Finish::Cancelled) => {
                warn!("run cancelled");
                telemetry.append(TelemetryEvent::new(
                    "run_cancelled",
                    json!({
                        "file": state.current_path().map(display),
                        "pending": state.pending().count(),
                    }),
                ));
                summarize(&state, Some(RunStatus::Cancelled))
            }
            Err(err) => return Err(abort(&state, telemetry, err)),
        };

        state.set_status(summary.status);
        telemetry.record_final_metrics(FinalMetrics::from(&summary));
        telemetry.persist().context("persist telemetry")?;
        info!(
            status = summary.status.as_str(),
            successful = summary.files_successful,
            failed = summary.files_failed,
            "workflow finished"
        );
        Ok(summary)
    }

    fn initial_state(&self, files: Vec<PathBuf>) -> WorkflowState {
        WorkflowState::new(
            files,
            self.options.max_iterations,
            self.options.max_error_log_entries,
        )
    }

    fn stage_context(&self) -> StageContext<'_> {
        StageContext {
            generator: self.collaborators.generator,
            sleeper: self.collaborators.sleeper,
            retry: &self.options.retry,
            prompts: &self.prompts,
            extractor: &self.extractor,
        }
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    fn drive(&self, state: &mut WorkflowState, telemetry: &mut dyn Telemetry) -> Result<Finish> {
        let ctx = self.stage_context();
        while let Some(path) = state.current_path().map(Path::to_path_buf) {
            if self.cancelled() {
                return Ok(Finish::Cancelled);
            }
            self.analyze(&ctx, state, &path, telemetry)?;

            loop {
                if self.cancelled() {
                    return Ok(Finish::Cancelled);
                }
                self.fix(&ctx, state, &path, telemetry)?;
                if self.cancelled() {
                    return Ok(Finish::Cancelled);
                }
                self.evaluate(&ctx, state, &path, telemetry)?;

                match state.decide()? {
                    Decision::Continue => {}
                    Decision::NextFile | Decision::End => break,
                }
            }

            let record = state
                .record(&path)
                .ok_or_else(|| anyhow!("record for {} vanished", path.display()))?;
            info!(
                path = %path.display(),
                status = ?record.status(),
                iterations = record.iteration_count(),
                "file settled"
            );
            telemetry.append(TelemetryEvent::new(
                "file_completed",
                json!({
                    "file": display(&path),
                    "status": record.status(),
                    "verdict": record.verdict.map(Verdict::as_str),
                    "iterations": record.iteration_count(),
                    "original_score": record.original_score,
                    "final_score": record.current_score,
                }),
            ));
        }
        Ok(Finish::Completed)
    }

    fn analyze(
        &self,
        ctx: &StageContext<'_>,
        state: &mut WorkflowState,
        path: &Path,
        telemetry: &mut dyn Telemetry,
    ) -> Result<()> {
        let outcome = audit(ctx, self.sandbox, self.collaborators.analyzer, path);
        let record = in_flight(state)?;
        match outcome {
            Ok(outcome) => {
                record.original_score = outcome.analysis.score;
                record.current_score = outcome.analysis.score;
                record.issues = outcome.issues;
                record.plan = outcome.plan;
                record.transition(LifecycleStatus::Analyzed)?;
                telemetry.append(TelemetryEvent::new(
                    "file_analyzed",
                    json!({
                        "file": display(path),
                        "score": record.original_score,
                        "issues_count": record.issues.len(),
                        "plan_steps": record.plan.len(),
                        "degraded": outcome.degraded,
                    }),
                ));
            }
            Err(err) => {
                if MenderError::aborts_run(&err) {
                    return Err(err);
                }
                let message = format!("analysis failed: {err:#}");
                warn!(path = %path.display(), err = %message, "analysis stage failed");
                record.record_error(message.clone());
                record.transition(LifecycleStatus::AnalysisFailed)?;
                telemetry.append(TelemetryEvent::new(
                    "analysis_failed",
                    json!({ "file": display(path), "error": message }),
                ));
            }
        }
        Ok(())
    }

    fn fix(
        &self,
        ctx: &StageContext<'_>,
        state: &mut WorkflowState,
        path: &Path,
        telemetry: &mut dyn Telemetry,
    ) -> Result<()> {
        let max_iterations = state.max_iterations();
        let record = in_flight(state)?;
        record.transition(LifecycleStatus::Fixing)?;
        // Counted up front so failed attempts consume the budget too.
        record.record_attempt();
        let attempt = record.iteration_count();

        let outcome = {
            let feedback = record.error_log.tail(self.options.feedback_tail_entries);
            let request = RepairRequest {
                path,
                attempt,
                max_iterations,
                plan: &record.plan,
                issues: &record.issues,
                feedback: &feedback,
                changes: record.change_log(),
            };
            repair(ctx, self.sandbox, self.collaborators.validator, &request)
        };

        match outcome {
            Ok(outcome) => {
                for change in &outcome.changes {
                    record.record_change(change.clone());
                }
                telemetry.append(TelemetryEvent::new(
                    "file_fixed",
                    json!({
                        "file": display(path),
                        "iteration": attempt,
                        "changes": outcome.changes,
                        "strategy": outcome.strategy,
                        "backup": outcome.write.backup.as_deref().map(display),
                        "dry_run": outcome.write.skipped,
                    }),
                ));
            }
            Err(err) => {
                if MenderError::aborts_run(&err) {
                    return Err(err);
                }
                let message = format!("iteration {attempt}: repair failed: {err:#}");
                warn!(path = %path.display(), err = %message, "repair stage failed");
                record.record_error(message.clone());
                telemetry.append(TelemetryEvent::new(
                    "fix_failed",
                    json!({ "file": display(path), "iteration": attempt, "error": message }),
                ));
            }
        }
        Ok(())
    }

    fn evaluate(
        &self,
        ctx: &StageContext<'_>,
        state: &mut WorkflowState,
        path: &Path,
        telemetry: &mut dyn Telemetry,
    ) -> Result<()> {
        state.count_evaluation();
        let record = in_flight(state)?;
        let outcome = evaluate(
            ctx,
            self.collaborators.analyzer,
            self.collaborators.test_runner,
            &self.options.verdict,
            &EvaluationRequest {
                path,
                original_score: record.original_score,
                changes: record.change_log(),
            },
        );

        match outcome {
            Ok(outcome) => {
                record.current_score = outcome.analysis.score;
                record.tests_passed = outcome.tests.success;
                record.verdict = Some(outcome.verdict);
                if outcome.verdict == Verdict::Retry && !outcome.advisory.feedback.is_empty() {
                    record.record_error(format!(
                        "iteration {}: {}",
                        record.iteration_count(),
                        outcome.advisory.feedback
                    ));
                }
                telemetry.append(TelemetryEvent::new(
                    "file_evaluated",
                    json!({
                        "file": display(path),
                        "iteration": record.iteration_count(),
                        "verdict": outcome.verdict.as_str(),
                        "advisory_verdict": outcome.advisory.verdict.as_str(),
                        "original_score": record.original_score,
                        "new_score": outcome.analysis.score,
                        "tests_passed": outcome.tests.success,
                        "tests_total": outcome.tests.total_tests,
                    }),
                ));
                record.last_tests = Some(outcome.tests);
            }
            Err(err) => {
                if MenderError::aborts_run(&err) {
                    return Err(err);
                }
                let message = format!("evaluation failed: {err:#}");
                warn!(path = %path.display(), err = %message, "evaluation stage failed");
                record.verdict = Some(Verdict::Retry);
                record.record_error(message.clone());
                telemetry.append(TelemetryEvent::new(
                    "evaluation_failed",
                    json!({ "file": display(path), "error": message }),
                ));
            }
        }
        record.transition(LifecycleStatus::Evaluated)?;
        Ok(())
    }
}

fn in_flight(state: &mut WorkflowState) -> Result<&mut ArtifactRecord> {
    state
        .current_mut()
        .ok_or_else(|| anyhow!("no artifact in flight"))
}

fn display(path: &Path) -> String {
    path.display().to_string()
}

/// Record an aborting error in telemetry and flush it before handing the error back.
fn abort(state: &WorkflowState, telemetry: &mut dyn Telemetry, err: anyhow::Error) -> anyhow::Error {
    let message = format!("{err:#}");
    warn!(err = %message, "run aborted");
    telemetry.append(TelemetryEvent::new(
        "run_error",
        json!({
            "file": state.current_path().map(display),
            "error": message,
        }),
    ));
    telemetry.record_final_metrics(FinalMetrics::from(&summarize(state, None)));
    if let Err(persist_err) = telemetry.persist() {
        warn!(err = %format!("{persist_err:#}"), "telemetry not persisted after abort");
    }
    err
}
