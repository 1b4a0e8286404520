//! Repair stage: generate a corrected file, validate it, write it through the sandbox.

use std::path::Path;

use anyhow::{Context, Result};
use tracing::{info, instrument};

use crate::agents::{StageContext, string_list};
use crate::core::error::MenderError;
use crate::core::extract::extract_code;
use crate::core::types::{Issue, PlanStep};
use crate::io::prompt::{FIXER_SYSTEM, IterativeRepairPrompt, RepairPrompt};
use crate::io::sandbox::{Sandbox, WriteOutcome};
use crate::io::syntax::SyntaxValidator;

/// Inputs for one repair attempt.
pub struct RepairRequest<'a> {
    pub path: &'a Path,
    /// 1-based number of this attempt.
    pub attempt: u32,
    pub max_iterations: u32,
    pub plan: &'a [PlanStep],
    pub issues: &'a [Issue],
    /// Recent error log entries, oldest first. Used from the second attempt on.
    pub feedback: &'a [&'a str],
    pub changes: &'a [String],
}

#[derive(Debug, Clone, PartialEq)]
pub struct RepairOutcome {
    pub changes: Vec<String>,
    pub write: WriteOutcome,
    /// Extraction strategy that yielded the code.
    pub strategy: &'static str,
}

/// Run one repair attempt on `request.path`.
///
/// Fails with `ParseFailure` when no code can be recovered and with
/// `SyntaxValidation` when the recovered code does not parse. Neither failure
/// touches the file.
#[instrument(skip_all, fields(path = %request.path.display(), attempt = request.attempt))]
pub fn repair(
    ctx: &StageContext<'_>,
    sandbox: &Sandbox,
    validator: &dyn SyntaxValidator,
    request: &RepairRequest<'_>,
) -> Result<RepairOutcome> {
    let code = sandbox.read(request.path)?;
    let file_path = request.path.display().to_string();

    let first_attempt = request.attempt <= 1;
    let prompt = if first_attempt {
        ctx.prompts.render_repair(&RepairPrompt {
            file_path: &file_path,
            code: &code,
            plan: request.plan,
            issues: request.issues,
        })?
    } else {
        ctx.prompts.render_iterative_repair(&IterativeRepairPrompt {
            file_path: &file_path,
            code: &code,
            feedback: request.feedback,
            changes: request.changes,
            iteration: request.attempt,
            max_iterations: request.max_iterations,
        })?
    };
    let response = ctx
        .invoke("repair", FIXER_SYSTEM, &prompt)
        .context("invoke generator for repair")?;

    let extraction = ctx.extractor.extract(&response).ok();
    let (fixed_code, strategy) = match extraction
        .as_ref()
        .and_then(|e| e.fixed_code().map(|code| (code.to_string(), e.strategy)))
    {
        Some(found) => found,
        None => match extract_code(&response) {
            Some(code) => (code, "best_effort_code"),
            None => {
                return Err(MenderError::ParseFailure(
                    "repair response carried no recoverable code".to_string(),
                )
                .into());
            }
        },
    };

    validator.validate(&fixed_code)?;

    let mut content = fixed_code;
    if !content.ends_with('\n') {
        content.push('\n');
    }
    let write = sandbox.write(request.path, &content)?;

    let change_key = if first_attempt {
        "changes_made"
    } else {
        "new_changes"
    };
    let mut changes = extraction
        .as_ref()
        .map(|e| string_list(&e.value, change_key))
        .unwrap_or_default();
    if changes.is_empty() {
        let name = request
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or(file_path);
        changes.push(format!("iteration {}: rewrote {name}", request.attempt));
    }

    info!(
        strategy,
        changes = changes.len(),
        backup = ?write.backup,
        dry_run = write.skipped,
        "repair written"
    );
    Ok(RepairOutcome {
        changes,
        write,
        strategy,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::extract::Extractor;
    use crate::io::config::SandboxConfig;
    use crate::io::prompt::PromptEngine;
    use crate::io::retry::RetryPolicy;
    use crate::test_support::{AcceptAllSyntax, RecordingSleeper, RejectSyntax, ScriptedGenerator};
    use std::fs;
    use tempfile::TempDir;

    const ORIGINAL: &str = "def add(a, b):\n    return a - b\n";

    struct Fixture {
        _temp: TempDir,
        path: std::path::PathBuf,
        sandbox: Sandbox,
    }

    fn fixture() -> Fixture {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("calc.py");
        fs::write(&path, ORIGINAL).expect("seed");
        let sandbox = Sandbox::new(temp.path(), &SandboxConfig::default(), false).expect("sandbox");
        Fixture {
            path: sandbox.root().join("calc.py"),
            sandbox,
            _temp: temp,
        }
    }

    fn attempt(
        fx: &Fixture,
        generator: &ScriptedGenerator,
        validator: &dyn SyntaxValidator,
        attempt: u32,
    ) -> Result<RepairOutcome> {
        let sleeper = RecordingSleeper::default();
        let retry = RetryPolicy::default();
        let prompts = PromptEngine::new();
        let extractor = Extractor::default();
        let ctx = StageContext {
            generator,
            sleeper: &sleeper,
            retry: &retry,
            prompts: &prompts,
            extractor: &extractor,
        };
        let changes = vec!["iteration 1: rewrote calc.py".to_string()];
        repair(
            &ctx,
            &fx.sandbox,
            validator,
            &RepairRequest {
                path: &fx.path,
                attempt,
                max_iterations: 3,
                plan: &[],
                issues: &[],
                feedback: &["tests failed"],
                changes: &changes,
            },
        )
    }

    #[test]
    fn writes_fixed_code_and_records_changes() {
        let fx = fixture();
        let generator = ScriptedGenerator::new([Ok(r#"```json
{"fixed_code": "def add(a, b):\n    return a + b", "changes_made": ["use +"]}
```"#
            .to_string())]);
        let outcome = attempt(&fx, &generator, &AcceptAllSyntax, 1).expect("repair");
        assert_eq!(outcome.changes, vec!["use +"]);
        assert_eq!(outcome.strategy, "tagged_json_fence");
        assert_eq!(
            fs::read_to_string(&fx.path).expect("read"),
            "def add(a, b):\n    return a + b\n"
        );
        assert!(outcome.write.backup.is_some());
    }

    #[test]
    fn second_attempt_uses_feedback_prompt_and_new_changes() {
        let fx = fixture();
        let generator = ScriptedGenerator::new([Ok(
            "```json\n{\"fixed_code\": \"x = 1\", \"new_changes\": [\"simplified\"]}\n```".to_string(),
        )]);
        let outcome = attempt(&fx, &generator, &AcceptAllSyntax, 2).expect("repair");
        assert_eq!(outcome.changes, vec!["simplified"]);
        let prompt = &generator.prompts()[0].1;
        assert!(prompt.contains("attempt 2 of 3"));
        assert!(prompt.contains("- tests failed"));
    }

    #[test]
    fn falls_back_to_code_fence_with_default_change() {
        let fx = fixture();
        let generator = ScriptedGenerator::new([Ok(
            "Sure:\n```python\ndef add(a, b):\n    return a + b\n```".to_string(),
        )]);
        let outcome = attempt(&fx, &generator, &AcceptAllSyntax, 1).expect("repair");
        assert_eq!(outcome.strategy, "code_fence");
        assert_eq!(outcome.changes, vec!["iteration 1: rewrote calc.py"]);
    }

    #[test]
    fn no_code_is_parse_failure_and_file_untouched() {
        let fx = fixture();
        let generator = ScriptedGenerator::new([Ok("I am not sure what to do.".to_string())]);
        let err = attempt(&fx, &generator, &AcceptAllSyntax, 1).expect_err("no code");
        assert!(matches!(
            MenderError::find(&err),
            Some(MenderError::ParseFailure(_))
        ));
        assert_eq!(fs::read_to_string(&fx.path).expect("read"), ORIGINAL);
    }

    #[test]
    fn syntax_rejection_leaves_file_untouched() {
        let fx = fixture();
        let generator =
            ScriptedGenerator::new([Ok("```python\ndef add(a, b) return\n```".to_string())]);
        let err = attempt(&fx, &generator, &RejectSyntax, 1).expect_err("bad syntax");
        assert!(matches!(
            MenderError::find(&err),
            Some(MenderError::SyntaxValidation(_))
        ));
        assert_eq!(fs::read_to_string(&fx.path).expect("read"), ORIGINAL);
        assert!(!fx.sandbox.backup_dir().exists());
    }
}
