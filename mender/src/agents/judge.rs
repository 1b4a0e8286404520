//! Evaluation stage: objective re-measurement plus a non-authoritative advisory.

use std::path::Path;

use anyhow::{Context, Result};
use serde_json::{Value, json};
use tracing::{info, instrument, warn};

use crate::agents::{StageContext, validate_schema};
use crate::core::error::MenderError;
use crate::core::types::{AnalysisResult, TestResult, Verdict};
use crate::core::verdict::VerdictPolicy;
use crate::io::analyzer::StaticAnalyzer;
use crate::io::prompt::{EvaluationPrompt, JUDGE_SYSTEM};
use crate::io::test_runner::TestRunner;

const EVALUATION_SCHEMA: &str = include_str!("schemas/evaluation.schema.json");
const UNPARSABLE_FEEDBACK: &str = "unable to parse evaluation, review manually";

/// What the evaluation collaborator recommended. Feedback only.
#[derive(Debug, Clone, PartialEq)]
pub struct Advisory {
    pub verdict: Verdict,
    pub feedback: String,
    /// False when the response was unusable and this is the fallback.
    pub parsed: bool,
}

impl Advisory {
    fn unparsable() -> Self {
        Self {
            verdict: Verdict::Retry,
            feedback: UNPARSABLE_FEEDBACK.to_string(),
            parsed: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationOutcome {
    pub analysis: AnalysisResult,
    pub tests: TestResult,
    pub advisory: Advisory,
    /// Authoritative verdict from the policy.
    pub verdict: Verdict,
}

pub struct EvaluationRequest<'a> {
    pub path: &'a Path,
    pub original_score: f64,
    pub changes: &'a [String],
}

/// Evaluate the current content of `request.path`.
///
/// Analyzer and test-runner failures fail the stage. A failed advisory call
/// only costs the advisory unless the failure is fatal for the run.
#[instrument(skip_all, fields(path = %request.path.display()))]
pub fn evaluate(
    ctx: &StageContext<'_>,
    analyzer: &dyn StaticAnalyzer,
    test_runner: &dyn TestRunner,
    policy: &VerdictPolicy,
    request: &EvaluationRequest<'_>,
) -> Result<EvaluationOutcome> {
    let analysis = analyzer
        .analyze(request.path)
        .context("static analysis during evaluation")?;
    let test_dir = request.path.parent().unwrap_or(Path::new("."));
    let tests = test_runner.run(test_dir).context("run tests")?;

    let file_path = request.path.display().to_string();
    let prompt = ctx.prompts.render_evaluation(&EvaluationPrompt {
        file_path: &file_path,
        original_score: request.original_score,
        new_score: analysis.score,
        tests: &tests,
        changes: request.changes,
    })?;
    let advisory = match ctx.invoke("evaluation", JUDGE_SYSTEM, &prompt) {
        Ok(response) => parse_advisory(ctx, &response),
        Err(err) if MenderError::aborts_run(&err) => return Err(err),
        Err(err) => {
            warn!(err = %format!("{err:#}"), "advisory unavailable");
            Advisory::unparsable()
        }
    };

    let verdict = policy.decide(analysis.score, request.original_score, &tests);
    if advisory.parsed && advisory.verdict != verdict {
        info!(
            advisory = advisory.verdict.as_str(),
            verdict = verdict.as_str(),
            "advisory overruled by policy"
        );
    }
    info!(
        score = analysis.score,
        tests_passed = tests.passed,
        tests_total = tests.total_tests,
        verdict = verdict.as_str(),
        "evaluation complete"
    );
    Ok(EvaluationOutcome {
        analysis,
        tests,
        advisory,
        verdict,
    })
}

fn parse_advisory(ctx: &StageContext<'_>, response: &str) -> Advisory {
    let fallback = json!({
        "verdict": Verdict::Retry.as_str(),
        "feedback_for_fixer": UNPARSABLE_FEEDBACK,
    });
    let value = ctx.extractor.extract_or(response, Some(fallback.clone()));
    if value == fallback {
        warn!("advisory response unparsable");
        return Advisory::unparsable();
    }
    if let Err(err) = validate_schema(&value, EVALUATION_SCHEMA) {
        warn!(err = %format!("{err:#}"), "advisory rejected");
        return Advisory::unparsable();
    }
    let verdict = value
        .get("verdict")
        .and_then(Value::as_str)
        .map(Verdict::from_label)
        .unwrap_or(Verdict::Retry);
    let feedback = value
        .get("feedback_for_fixer")
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or_default()
        .to_string();
    Advisory {
        verdict,
        feedback,
        parsed: true,
    }
}
