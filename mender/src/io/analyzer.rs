//! Static-analysis adapter backed by pylint.

use std::path::Path;
use std::process::Command;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use crate::core::types::{AnalysisResult, LintMessage, clamp_score};
use crate::io::config::{PythonConfig, TimeoutConfig};
use crate::io::process::{CommandOutput, run_command_with_timeout};

static SCORE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Your code has been rated at (-?\d+\.?\d*)/10").unwrap());

/// Pylint exit status bit signalling a usage error; the other bits report findings.
const PYLINT_USAGE_ERROR: i32 = 32;

/// Pylint's `json2` reporter: messages plus run statistics in one document.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Json2Report {
    messages: Vec<LintMessage>,
    statistics: Json2Statistics,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Json2Statistics {
    score: Option<f64>,
}

const REPORT_ORDER: &[&str] = &["fatal", "error", "warning", "convention", "refactor", "info"];

pub trait StaticAnalyzer {
    fn analyze(&self, path: &Path) -> Result<AnalysisResult>;
}

#[derive(Debug, Clone)]
pub struct PylintAnalyzer {
    interpreter: String,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl PylintAnalyzer {
    pub fn new(python: &PythonConfig, timeouts: &TimeoutConfig) -> Self {
        Self {
            interpreter: python.interpreter.clone(),
            timeout: timeouts.call_timeout(),
            output_limit_bytes: timeouts.output_limit_bytes,
        }
    }

    fn pylint(&self, path: &Path, format_args: &[&str]) -> Result<CommandOutput> {
        let mut cmd = Command::new(&self.interpreter);
        cmd.args(["-m", "pylint"]).arg(path).args(format_args);
        if let Some(dir) = path.parent() {
            cmd.current_dir(dir);
        }
        let output = run_command_with_timeout(cmd, None, self.timeout, self.output_limit_bytes)?;
        output.check_timeout("pylint", self.timeout)?;
        if let Some(code) = output.status.code()
            && code & PYLINT_USAGE_ERROR != 0
        {
            return Err(anyhow!(
                "pylint usage error (exit {code}): {}",
                output.stderr_text().trim()
            ));
        }
        Ok(output)
    }
}

impl StaticAnalyzer for PylintAnalyzer {
    #[instrument(skip_all, fields(path = %path.display()))]
    fn analyze(&self, path: &Path) -> Result<AnalysisResult> {
        let output = self
            .pylint(path, &["--output-format=json2", "--score=y"])
            .context("run pylint")?;
        let result = parse_report(&output.stdout_text(), &output.stderr_text());
        debug!(
            score = result.score,
            messages = result.messages.len(),
            "pylint finished"
        );
        Ok(result)
    }
}

/// Parse one pylint `json2` run into a score and its messages.
///
/// When stdout is not a `json2` document the score falls back to a text
/// score line anywhere in the output, and the message list is empty.
pub fn parse_report(stdout: &str, stderr: &str) -> AnalysisResult {
    match serde_json::from_str::<Json2Report>(stdout.trim()) {
        Ok(report) => AnalysisResult {
            score: report.statistics.score.map(clamp_score).unwrap_or(0.0),
            messages: report.messages,
        },
        Err(err) => {
            warn!(err = %err, "pylint json2 output did not parse");
            AnalysisResult {
                score: parse_score(&format!("{stdout}{stderr}")),
                messages: Vec::new(),
            }
        }
    }
}

/// Read the score from pylint's text report, clamped to `[0, 10]`.
///
/// A report without a score line scores 0.
pub fn parse_score(report: &str) -> f64 {
    SCORE_RE
        .captures(report)
        .and_then(|caps| caps[1].parse::<f64>().ok())
        .map(clamp_score)
        .unwrap_or(0.0)
}

/// Render lint messages grouped by severity for prompts.
pub fn format_lint_report(messages: &[LintMessage]) -> String {
    if messages.is_empty() {
        return "No issues found.".to_string();
    }
    let mut out = String::from("Pylint Analysis Report\n");
    for kind in REPORT_ORDER {
        let group: Vec<&LintMessage> = messages
            .iter()
            .filter(|msg| msg.kind.eq_ignore_ascii_case(kind))
            .collect();
        if group.is_empty() {
            continue;
        }
        out.push_str(&format!("\n{}S ({})\n", kind.to_uppercase(), group.len()));
        for msg in group {
            out.push_str(&format!(
                "  Line {}: [{}] {}\n",
                msg.line, msg.symbol, msg.message
            ));
        }
    }
    let other: Vec<&LintMessage> = messages
        .iter()
        .filter(|msg| !REPORT_ORDER.iter().any(|k| msg.kind.eq_ignore_ascii_case(k)))
        .collect();
    if !other.is_empty() {
        out.push_str(&format!("\nOTHER ({})\n", other.len()));
        for msg in other {
            out.push_str(&format!(
                "  Line {}: [{}] {}\n",
                msg.line, msg.symbol, msg.message
            ));
        }
    }
    out
}
