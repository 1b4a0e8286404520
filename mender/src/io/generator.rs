//! Text-generation adapter.
//!
//! The [`TextGenerator`] trait decouples the stage agents from the service that
//! produces analysis, repair and evaluation text. [`CommandGenerator`] drives any
//! CLI that takes a system prompt flag and reads the user prompt on stdin.

use std::process::Command;
use std::time::Duration;

use anyhow::{Result, anyhow};
use tracing::{debug, instrument};

use crate::core::error::MenderError;
use crate::io::config::{GeneratorConfig, TimeoutConfig};
use crate::io::process::run_command_with_timeout;

pub trait TextGenerator {
    /// Produce a response for the prompt pair. Output carries no format guarantee.
    fn invoke(&self, system_prompt: &str, user_prompt: &str) -> Result<String>;
}

#[derive(Debug, Clone)]
pub struct CommandGenerator {
    command: Vec<String>,
    system_flag: String,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl CommandGenerator {
    pub fn new(cfg: &GeneratorConfig, timeouts: &TimeoutConfig) -> Self {
        Self {
            command: cfg.command.clone(),
            system_flag: cfg.system_flag.clone(),
            timeout: timeouts.call_timeout(),
            output_limit_bytes: timeouts.output_limit_bytes,
        }
    }

    fn build_command(&self, system_prompt: &str) -> Result<Command> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("generator command is empty"))?;
        let mut cmd = Command::new(program);
        cmd.args(args);
        if !self.system_flag.is_empty() {
            cmd.arg(&self.system_flag).arg(system_prompt);
        }
        Ok(cmd)
    }
}

impl TextGenerator for CommandGenerator {
    #[instrument(skip_all, fields(program = %self.command.first().map(String::as_str).unwrap_or_default()))]
    fn invoke(&self, system_prompt: &str, user_prompt: &str) -> Result<String> {
        let cmd = self.build_command(system_prompt)?;
        let output = run_command_with_timeout(
            cmd,
            Some(user_prompt.as_bytes()),
            self.timeout,
            self.output_limit_bytes,
        )?;
        output.check_timeout("text generation", self.timeout)?;

        if !output.status.success() {
            // Keep the service's own wording so the retry wrapper can classify it.
            let stderr = output.stderr_text();
            let message = stderr.trim();
            return Err(anyhow!(
                "generator exited with {:?}: {}",
                output.status.code(),
                if message.is_empty() { "no stderr" } else { message }
            ));
        }

        let text = output.stdout_text();
        if text.trim().is_empty() {
            return Err(MenderError::TransientService("generator returned empty output".into()).into());
        }
        debug!(bytes = text.len(), "generator responded");
        Ok(text)
    }
}
