//! Syntax validation of generated code before it reaches disk.

use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::instrument;

use crate::core::error::MenderError;
use crate::io::config::{PythonConfig, TimeoutConfig};
use crate::io::process::run_command_with_timeout;

const PARSE_SNIPPET: &str = "import ast, sys; ast.parse(sys.stdin.read())";

pub trait SyntaxValidator {
    /// Fail with [`MenderError::SyntaxValidation`] when `code` does not parse.
    fn validate(&self, code: &str) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct PythonSyntaxValidator {
    interpreter: String,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl PythonSyntaxValidator {
    pub fn new(python: &PythonConfig, timeouts: &TimeoutConfig) -> Self {
        Self {
            interpreter: python.interpreter.clone(),
            timeout: timeouts.call_timeout(),
            output_limit_bytes: timeouts.output_limit_bytes,
        }
    }
}

impl SyntaxValidator for PythonSyntaxValidator {
    #[instrument(skip_all, fields(bytes = code.len()))]
    fn validate(&self, code: &str) -> Result<()> {
        let mut cmd = Command::new(&self.interpreter);
        cmd.args(["-c", PARSE_SNIPPET]);
        let output = run_command_with_timeout(
            cmd,
            Some(code.as_bytes()),
            self.timeout,
            self.output_limit_bytes,
        )
        .context("run python syntax check")?;
        output.check_timeout("syntax check", self.timeout)?;

        if output.status.success() {
            return Ok(());
        }
        let stderr = output.stderr_text();
        let message = stderr
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .unwrap_or("python rejected the code")
            .trim()
            .to_string();
        Err(MenderError::SyntaxValidation(message).into())
    }
}
