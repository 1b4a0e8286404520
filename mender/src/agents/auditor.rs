//! Analysis stage: static analysis plus a generated issue list and repair plan.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{info, instrument, warn};

use crate::agents::{StageContext, validate_schema};
use crate::core::error::MenderError;
use crate::core::types::{AnalysisResult, Issue, PlanStep};
use crate::io::analyzer::{StaticAnalyzer, format_lint_report};
use crate::io::prompt::{AUDITOR_SYSTEM, AnalysisPrompt};
use crate::io::sandbox::Sandbox;

const ANALYSIS_SCHEMA: &str = include_str!("schemas/analysis.schema.json");

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AnalysisPayload {
    summary: String,
    issues: Vec<Issue>,
    refactoring_plan: Vec<PlanStep>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AuditOutcome {
    pub analysis: AnalysisResult,
    pub summary: String,
    pub issues: Vec<Issue>,
    pub plan: Vec<PlanStep>,
    /// Why the generated payload was discarded, if it was.
    pub degraded: Option<String>,
}

/// Analyze `path`.
///
/// Read, static-analysis and invocation failures fail the stage. A response
/// that does not parse or match the schema only empties the issues and plan.
#[instrument(skip_all, fields(path = %path.display()))]
pub fn audit(
    ctx: &StageContext<'_>,
    sandbox: &Sandbox,
    analyzer: &dyn StaticAnalyzer,
    path: &Path,
) -> Result<AuditOutcome> {
    let code = sandbox.read(path)?;
    let analysis = analyzer.analyze(path).context("static analysis")?;
    let lint_report = format_lint_report(&analysis.messages);
    let file_path = path.display().to_string();

    let prompt = ctx.prompts.render_analysis(&AnalysisPrompt {
        file_path: &file_path,
        code: &code,
        score: analysis.score,
        lint_report: &lint_report,
    })?;
    let response = ctx
        .invoke("analysis", AUDITOR_SYSTEM, &prompt)
        .context("invoke generator for analysis")?;

    let (payload, degraded) = match parse_payload(ctx, &response) {
        Ok(payload) => (payload, None),
        Err(err) => {
            let reason = format!("{err:#}");
            warn!(err = %reason, "analysis response unusable, continuing with an empty plan");
            (AnalysisPayload::default(), Some(reason))
        }
    };

    info!(
        score = analysis.score,
        issues = payload.issues.len(),
        plan_steps = payload.refactoring_plan.len(),
        "analysis complete"
    );
    Ok(AuditOutcome {
        analysis,
        summary: payload.summary,
        issues: payload.issues,
        plan: payload.refactoring_plan,
        degraded,
    })
}

fn parse_payload(ctx: &StageContext<'_>, response: &str) -> Result<AnalysisPayload> {
    let extraction = ctx.extractor.extract(response)?;
    validate_schema(&extraction.value, ANALYSIS_SCHEMA)
        .map_err(|err| MenderError::ParseFailure(format!("{err:#}")))?;
    let payload = serde_json::from_value(extraction.value)
        .map_err(|err| MenderError::ParseFailure(err.to_string()))?;
    Ok(payload)
}
