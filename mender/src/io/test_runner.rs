//! Test-runner adapter backed by pytest.

use std::path::Path;
use std::process::Command;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result};
use regex::Regex;
use tracing::{debug, instrument};

use crate::core::types::{TestFailure, TestResult};
use crate::io::config::{PythonConfig, TimeoutConfig};
use crate::io::process::run_command_with_timeout;

static COUNT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(\d+)\s+(passed|failed|errors?|skipped)\b").unwrap());
static FAILURE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^FAILED\s+(\S+?)::\S+\s+-\s+(.+)$").unwrap());

/// pytest exit status when no tests were collected.
const PYTEST_NO_TESTS: i32 = 5;

pub trait TestRunner {
    /// Run the tests found in `dir`.
    fn run(&self, dir: &Path) -> Result<TestResult>;
}

#[derive(Debug, Clone)]
pub struct PytestRunner {
    interpreter: String,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl PytestRunner {
    pub fn new(python: &PythonConfig, timeouts: &TimeoutConfig) -> Self {
        Self {
            interpreter: python.interpreter.clone(),
            timeout: timeouts.call_timeout(),
            output_limit_bytes: timeouts.output_limit_bytes,
        }
    }
}

impl TestRunner for PytestRunner {
    #[instrument(skip_all, fields(dir = %dir.display()))]
    fn run(&self, dir: &Path) -> Result<TestResult> {
        let mut cmd = Command::new(&self.interpreter);
        cmd.args(["-m", "pytest"])
            .arg(dir)
            .args(["-q", "--tb=short"])
            .current_dir(dir);
        let output = run_command_with_timeout(cmd, None, self.timeout, self.output_limit_bytes)
            .context("run pytest")?;
        output.check_timeout("pytest", self.timeout)?;

        let code = output.status.code();
        if code == Some(PYTEST_NO_TESTS) {
            debug!("no tests collected");
            return Ok(TestResult::default());
        }

        let mut result =
            parse_pytest_output(&format!("{}{}", output.stdout_text(), output.stderr_text()));
        result.success = code == Some(0);
        debug!(
            success = result.success,
            passed = result.passed,
            failed = result.failed,
            total = result.total_tests,
            "pytest finished"
        );
        Ok(result)
    }
}

/// Parse counts and failure lines from pytest's `-q` output.
///
/// `success` is left `false`; only the exit status decides it.
pub fn parse_pytest_output(output: &str) -> TestResult {
    let mut result = TestResult::default();
    let mut errors = 0;
    let mut skipped = 0;
    for caps in COUNT_RE.captures_iter(output) {
        let Ok(count) = caps[1].parse::<u32>() else {
            continue;
        };
        match caps[2].to_ascii_lowercase().as_str() {
            "passed" => result.passed = count,
            "failed" => result.failed = count,
            "error" | "errors" => errors = count,
            "skipped" => skipped = count,
            _ => {}
        }
    }
    result.total_tests = result.passed + result.failed + errors + skipped;
    result.failures = FAILURE_RE
        .captures_iter(output)
        .map(|caps| TestFailure {
            file: caps[1].to_string(),
            reason: caps[2].trim().to_string(),
        })
        .collect();
    result
}
