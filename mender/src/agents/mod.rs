//! Stage agents: analysis (auditor), repair (fixer) and evaluation (judge).
//!
//! Each agent combines prompt rendering, resilient invocation of the text
//! generator, structured extraction and schema validation into one stage call.

use anyhow::{Context, Result, anyhow};
use jsonschema::Draft;
use serde_json::Value;
use tracing::debug;

use crate::core::extract::Extractor;
use crate::io::generator::TextGenerator;
use crate::io::prompt::PromptEngine;
use crate::io::retry::{RetryPolicy, Sleeper};

pub mod auditor;
pub mod fixer;
pub mod judge;

/// Shared services every stage call needs.
pub struct StageContext<'a> {
    pub generator: &'a dyn TextGenerator,
    pub sleeper: &'a dyn Sleeper,
    pub retry: &'a RetryPolicy,
    pub prompts: &'a PromptEngine,
    pub extractor: &'a Extractor,
}

impl StageContext<'_> {
    /// Call the text generator through the retry wrapper.
    pub(crate) fn invoke(&self, operation: &str, system: &str, user: &str) -> Result<String> {
        self.retry.run(operation, self.sleeper, |attempt| {
            debug!(operation, attempt, prompt_bytes = user.len(), "invoking generator");
            self.generator.invoke(system, user)
        })
    }
}

pub(crate) fn validate_schema(instance: &Value, schema_source: &str) -> Result<()> {
    let schema: Value = serde_json::from_str(schema_source).context("parse json schema")?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .map_err(|err| anyhow!("compile json schema: {err}"))?;
    let messages: Vec<String> = compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        return Err(anyhow!(
            "schema validation failed:\n- {}",
            messages.join("\n- ")
        ));
    }
    Ok(())
}

/// Collect a list of strings from `payload[key]`, skipping blanks.
pub(crate) fn string_list(payload: &Value, key: &str) -> Vec<String> {
    payload
        .get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
