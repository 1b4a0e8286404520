//! Workflow configuration stored in `mender.toml` at the target root.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::verdict::VerdictPolicy;

/// File name looked up in the target root when `--config` is not given.
pub const CONFIG_FILE_NAME: &str = "mender.toml";

/// Mender configuration (TOML).
///
/// This file is intended to be edited by humans. Missing sections and fields
/// fall back to the defaults below.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MenderConfig {
    pub workflow: WorkflowConfig,
    pub verdict: VerdictPolicy,
    pub retry: RetryConfig,
    pub timeouts: TimeoutConfig,
    pub sandbox: SandboxConfig,
    pub generator: GeneratorConfig,
    pub python: PythonConfig,
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WorkflowConfig {
    /// Repair attempts allowed per file before it is marked failed.
    pub max_iterations: u32,
    /// Capacity of each file's bounded error log.
    pub max_error_log_entries: usize,
    /// Run every stage but never touch files on disk.
    pub dry_run: bool,
    /// Error log entries fed back into an iterative repair prompt.
    pub feedback_tail_entries: usize,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            max_error_log_entries: 50,
            dry_run: false,
            feedback_tail_entries: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub exponential_base: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 2_000,
            max_delay_ms: 60_000,
            exponential_base: 2.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Hard wall-clock limit for every collaborator subprocess.
    pub call_timeout_secs: u64,
    /// Truncate collaborator stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            call_timeout_secs: 120,
            output_limit_bytes: 1_000_000,
        }
    }
}

impl TimeoutConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SandboxConfig {
    /// Backup directory, relative to the sandbox root.
    pub backup_dir: String,
    /// File extensions (without the dot) picked up by discovery.
    pub allowed_extensions: Vec<String>,
    pub max_file_size_bytes: u64,
    /// Keep at most this many backups per file. Unset keeps all of them.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_backups_per_file: Option<usize>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            backup_dir: ".backups".to_string(),
            allowed_extensions: vec!["py".to_string()],
            max_file_size_bytes: 1_000_000,
            max_backups_per_file: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GeneratorConfig {
    /// Text-generation command (e.g. `["llm", "-m", "gpt-4o"]`). The user prompt goes to stdin.
    pub command: Vec<String>,
    /// Flag preceding the system prompt argument.
    pub system_flag: String,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            command: vec!["llm".to_string()],
            system_flag: "--system".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PythonConfig {
    pub interpreter: String,
}

impl Default for PythonConfig {
    fn default() -> Self {
        Self {
            interpreter: "python3".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Directory for `experiment_data.json`, relative to the working directory.
    pub log_dir: PathBuf,
    /// Persist the snapshot after this many events.
    pub auto_save_interval: usize,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("logs"),
            auto_save_interval: 10,
        }
    }
}

impl MenderConfig {
    pub fn validate(&self) -> Result<()> {
        if self.workflow.max_iterations == 0 {
            return Err(anyhow!("workflow.max_iterations must be > 0"));
        }
        if self.workflow.max_error_log_entries == 0 {
            return Err(anyhow!("workflow.max_error_log_entries must be > 0"));
        }
        for (name, value) in [
            (
                "verdict.success_score_threshold",
                self.verdict.success_score_threshold,
            ),
            (
                "verdict.regression_threshold",
                self.verdict.regression_threshold,
            ),
        ] {
            if !(0.0..=10.0).contains(&value) {
                return Err(anyhow!("{name} must be within [0, 10], got {value}"));
            }
        }
        if self.retry.max_attempts == 0 {
            return Err(anyhow!("retry.max_attempts must be > 0"));
        }
        if self.retry.exponential_base < 1.0 {
            return Err(anyhow!("retry.exponential_base must be >= 1"));
        }
        if self.retry.max_delay_ms < self.retry.initial_delay_ms {
            return Err(anyhow!("retry.max_delay_ms must be >= retry.initial_delay_ms"));
        }
        if self.timeouts.call_timeout_secs == 0 {
            return Err(anyhow!("timeouts.call_timeout_secs must be > 0"));
        }
        if self.timeouts.output_limit_bytes == 0 {
            return Err(anyhow!("timeouts.output_limit_bytes must be > 0"));
        }
        if self.sandbox.backup_dir.trim().is_empty()
            || Path::new(&self.sandbox.backup_dir).is_absolute()
        {
            return Err(anyhow!("sandbox.backup_dir must be a relative directory name"));
        }
        if self.sandbox.allowed_extensions.is_empty() {
            return Err(anyhow!("sandbox.allowed_extensions must not be empty"));
        }
        if self.sandbox.max_backups_per_file == Some(0) {
            return Err(anyhow!("sandbox.max_backups_per_file must be > 0 when set"));
        }
        if self.generator.command.is_empty() || self.generator.command[0].trim().is_empty() {
            return Err(anyhow!("generator.command must be a non-empty array"));
        }
        if self.python.interpreter.trim().is_empty() {
            return Err(anyhow!("python.interpreter must not be empty"));
        }
        if self.telemetry.auto_save_interval == 0 {
            return Err(anyhow!("telemetry.auto_save_interval must be > 0"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `MenderConfig::default()`.
pub fn load_config(path: &Path) -> Result<MenderConfig> {
    if !path.exists() {
        let cfg = MenderConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: MenderConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &MenderConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

/// Replace `path` with `contents` through a sibling temp file and a rename.
pub(crate) fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let file_name = path
        .file_name()
        .with_context(|| format!("path missing file name {}", path.display()))?;
    let tmp_path = parent.join(format!("{}.tmp", file_name.to_string_lossy()));
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, MenderConfig::default());
        assert_eq!(cfg.workflow.max_iterations, 10);
        assert_eq!(cfg.timeouts.call_timeout(), Duration::from_secs(120));
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join(CONFIG_FILE_NAME);
        let mut cfg = MenderConfig::default();
        cfg.sandbox.max_backups_per_file = Some(5);
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
        assert!(!temp.path().join("mender.toml.tmp").exists());
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join(CONFIG_FILE_NAME);
        fs::write(
            &path,
            "[workflow]\nmax_iterations = 3\n\n[verdict]\nsuccess_score_threshold = 9.0\n",
        )
        .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.workflow.max_iterations, 3);
        assert_eq!(cfg.workflow.max_error_log_entries, 50);
        assert_eq!(cfg.verdict.success_score_threshold, 9.0);
        assert_eq!(cfg.verdict.regression_threshold, 2.0);
        assert_eq!(cfg.retry, RetryConfig::default());
    }

    #[test]
    fn rejects_nonsense_values() {
        let mut cfg = MenderConfig::default();
        cfg.workflow.max_iterations = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = MenderConfig::default();
        cfg.verdict.success_score_threshold = 11.0;
        assert!(cfg.validate().is_err());

        let mut cfg = MenderConfig::default();
        cfg.retry.exponential_base = 0.5;
        assert!(cfg.validate().is_err());

        let mut cfg = MenderConfig::default();
        cfg.sandbox.backup_dir = "/tmp/backups".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn invalid_file_reports_path() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join(CONFIG_FILE_NAME);
        fs::write(&path, "[timeouts]\ncall_timeout_secs = 0\n").expect("write");
        let err = load_config(&path).expect_err("invalid");
        assert!(format!("{err:#}").contains("call_timeout_secs"));
    }
}
