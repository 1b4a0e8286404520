//! Recover structured payloads (or at least code) from free-form model output.
//!
//! Extraction is an ordered chain of independent strategies. The first strategy
//! that yields a value wins:
//!
//! 1. [`TaggedJsonFence`]: a fence tagged `json`.
//! 2. [`UntaggedFence`]: an untagged fence whose body starts with `{` or `[`.
//! 3. [`BalancedBraces`]: the first balanced `{ ... }` span anywhere in the text.
//! 4. [`CodeFence`]: a fence tagged as source code, wrapped as `{"fixed_code": ...}`.
//! 5. [`CodeHeuristic`]: bare text containing code keywords, wrapped the same way.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Value, json};

use crate::core::error::MenderError;

/// Key under which recovered source code is stored.
pub const FIXED_CODE_KEY: &str = "fixed_code";

/// Raw text kept in the diagnostic envelope is cut to this many characters.
pub const RAW_RESPONSE_PREVIEW_CHARS: usize = 500;

const CODE_FENCE_TAGS: &[&str] = &["python", "py", "python3"];
const CODE_KEYWORDS: &[&str] = &["def ", "class ", "import "];

static JSON_FENCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)```json[ \t]*\r?\n?(.*?)```").unwrap());
static UNTAGGED_FENCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```[ \t]*\r?\n(.*?)```").unwrap());
static TAGGED_FENCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```([A-Za-z0-9_+-]+)[ \t]*\r?\n(.*?)```").unwrap());
static OPENING_FENCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^```[A-Za-z0-9_+-]*[ \t]*\r?\n?").unwrap());
static CLOSING_FENCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\r?\n?```[ \t]*$").unwrap());

/// One link in the extraction chain.
pub trait ExtractStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    fn extract(&self, text: &str) -> Option<Value>;
}

pub struct TaggedJsonFence;

impl ExtractStrategy for TaggedJsonFence {
    fn name(&self) -> &'static str {
        "tagged_json_fence"
    }

    fn extract(&self, text: &str) -> Option<Value> {
        JSON_FENCE_RE
            .captures_iter(text)
            .find_map(|caps| serde_json::from_str(caps[1].trim()).ok())
    }
}

pub struct UntaggedFence;

impl ExtractStrategy for UntaggedFence {
    fn name(&self) -> &'static str {
        "untagged_fence"
    }

    fn extract(&self, text: &str) -> Option<Value> {
        UNTAGGED_FENCE_RE.captures_iter(text).find_map(|caps| {
            let body = caps[1].trim();
            if body.starts_with('{') || body.starts_with('[') {
                serde_json::from_str(body).ok()
            } else {
                None
            }
        })
    }
}

pub struct BalancedBraces;

impl ExtractStrategy for BalancedBraces {
    fn name(&self) -> &'static str {
        "balanced_braces"
    }

    fn extract(&self, text: &str) -> Option<Value> {
        let span = outermost_braces(text)?;
        serde_json::from_str(span).ok()
    }
}

pub struct CodeFence;

impl ExtractStrategy for CodeFence {
    fn name(&self) -> &'static str {
        "code_fence"
    }

    fn extract(&self, text: &str) -> Option<Value> {
        code_fence_body(text).map(wrap_code)
    }
}

pub struct CodeHeuristic;

impl ExtractStrategy for CodeHeuristic {
    fn name(&self) -> &'static str {
        "code_heuristic"
    }

    fn extract(&self, text: &str) -> Option<Value> {
        if !CODE_KEYWORDS.iter().any(|kw| text.contains(kw)) {
            return None;
        }
        let trimmed = text.trim();
        let without_open = OPENING_FENCE_RE.replace(trimmed, "");
        let cleaned = CLOSING_FENCE_RE.replace(&without_open, "");
        let cleaned = cleaned.trim();
        if cleaned.is_empty() {
            return None;
        }
        Some(wrap_code(cleaned))
    }
}

/// Successful extraction plus the strategy that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub value: Value,
    pub strategy: &'static str,
}

impl Extraction {
    /// Recovered code, if the payload carries a non-empty `fixed_code` string.
    pub fn fixed_code(&self) -> Option<&str> {
        self.value
            .get(FIXED_CODE_KEY)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|code| !code.is_empty())
    }
}

/// Ordered chain of extraction strategies.
pub struct Extractor {
    strategies: Vec<Box<dyn ExtractStrategy>>,
}

impl Default for Extractor {
    fn default() -> Self {
        Self::new(vec![
            Box::new(TaggedJsonFence),
            Box::new(UntaggedFence),
            Box::new(BalancedBraces),
            Box::new(CodeFence),
            Box::new(CodeHeuristic),
        ])
    }
}

impl Extractor {
    pub fn new(strategies: Vec<Box<dyn ExtractStrategy>>) -> Self {
        Self { strategies }
    }

    /// Run the chain in order; `ParseFailure` when no strategy matches.
    pub fn extract(&self, text: &str) -> Result<Extraction, MenderError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(MenderError::ParseFailure("empty response".to_string()));
        }
        self.strategies
            .iter()
            .find_map(|strategy| {
                strategy.extract(text).map(|value| Extraction {
                    value,
                    strategy: strategy.name(),
                })
            })
            .ok_or_else(|| {
                MenderError::ParseFailure(format!(
                    "no extraction strategy matched {} chars of output",
                    text.chars().count()
                ))
            })
    }

    /// Like [`Extractor::extract`], degrading to `fallback` or a diagnostic envelope.
    pub fn extract_or(&self, text: &str, fallback: Option<Value>) -> Value {
        match self.extract(text) {
            Ok(extraction) => extraction.value,
            Err(_) => fallback.unwrap_or_else(|| diagnostic_envelope(text)),
        }
    }
}

/// Best-effort code recovery that ignores payload shape.
///
/// Tries the `fixed_code` field of a `json` fence, then a code-tagged fence.
pub fn extract_code(text: &str) -> Option<String> {
    let from_json = TaggedJsonFence.extract(text).and_then(|value| {
        value
            .get(FIXED_CODE_KEY)
            .and_then(Value::as_str)
            .map(str::to_string)
    });
    from_json
        .or_else(|| code_fence_body(text).map(str::to_string))
        .map(|code| code.trim().to_string())
        .filter(|code| !code.is_empty())
}

/// Envelope returned when nothing could be recovered, kept for auditing.
pub fn diagnostic_envelope(text: &str) -> Value {
    let preview: String = text.chars().take(RAW_RESPONSE_PREVIEW_CHARS).collect();
    json!({
        "error": "failed to parse response",
        "raw_response": preview,
    })
}

fn wrap_code(code: &str) -> Value {
    json!({ FIXED_CODE_KEY: code.trim() })
}

fn code_fence_body(text: &str) -> Option<&str> {
    TAGGED_FENCE_RE.captures_iter(text).find_map(|caps| {
        let tag = caps.get(1)?.as_str().to_ascii_lowercase();
        if !CODE_FENCE_TAGS.contains(&tag.as_str()) {
            return None;
        }
        let body = caps.get(2)?.as_str().trim();
        (!body.is_empty()).then_some(body)
    })
}

/// First `{` through its matching `}`, tracking nesting depth.
fn outermost_braces(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    for (offset, ch) in text[start..].char_indices() {
        match ch {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + ch.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tagged_json_fence_wins() {
        let got = Extractor::default()
            .extract("```json\n{\"a\":1}\n```")
            .expect("extract");
        assert_eq!(got.value, json!({"a": 1}));
        assert_eq!(got.strategy, "tagged_json_fence");
    }

    #[test]
    fn tagged_json_fence_is_case_insensitive() {
        let got = TaggedJsonFence.extract("Result:\n```JSON\n[1, 2]\n```\n");
        assert_eq!(got, Some(json!([1, 2])));
    }

    #[test]
    fn untagged_fence_requires_json_shape() {
        assert_eq!(
            UntaggedFence.extract("```\n{\"verdict\": \"RETRY\"}\n```"),
            Some(json!({"verdict": "RETRY"}))
        );
        assert_eq!(UntaggedFence.extract("```\nprint('hi')\n```"), None);
        // A tagged fence is not an untagged one.
        assert_eq!(UntaggedFence.extract("```python\n{}\n```"), None);
    }

    #[test]
    fn balanced_braces_handles_nesting_and_prose() {
        let text = "Here you go: {\"a\": {\"b\": [1, {\"c\": 2}]}} hope that helps {not json}";
        assert_eq!(
            BalancedBraces.extract(text),
            Some(json!({"a": {"b": [1, {"c": 2}]}}))
        );
        assert_eq!(BalancedBraces.extract("{\"a\": 1"), None);
        assert_eq!(BalancedBraces.extract("no braces"), None);
    }

    #[test]
    fn code_fence_wraps_python() {
        let got = Extractor::default()
            .extract("Fixed:\n```python\ndef add(a, b):\n    return a + b\n```")
            .expect("extract");
        assert_eq!(got.strategy, "code_fence");
        assert_eq!(got.fixed_code(), Some("def add(a, b):\n    return a + b"));
    }

    #[test]
    fn heuristic_strips_stray_fences() {
        let got = CodeHeuristic
            .extract("```\nimport os\nprint(os.getcwd())")
            .expect("heuristic");
        assert_eq!(got, json!({"fixed_code": "import os\nprint(os.getcwd())"}));
    }

    #[test]
    fn json_beats_code_when_both_present() {
        let text = "```python\ndef f(): pass\n```\n```json\n{\"fixed_code\": \"def g(): pass\"}\n```";
        let got = Extractor::default().extract(text).expect("extract");
        assert_eq!(got.strategy, "tagged_json_fence");
        assert_eq!(got.fixed_code(), Some("def g(): pass"));
    }

    #[test]
    fn no_match_returns_fallback_unchanged() {
        let fallback = json!({"issues": [], "refactoring_plan": []});
        let got = Extractor::default().extract_or("nothing to see here", Some(fallback.clone()));
        assert_eq!(got, fallback);
    }

    #[test]
    fn no_match_without_fallback_returns_truncated_envelope() {
        let long = "x".repeat(2 * RAW_RESPONSE_PREVIEW_CHARS);
        let got = Extractor::default().extract_or(&long, None);
        assert_eq!(got["error"], "failed to parse response");
        assert_eq!(
            got["raw_response"].as_str().map(str::len),
            Some(RAW_RESPONSE_PREVIEW_CHARS)
        );
    }

    #[test]
    fn empty_input_is_parse_failure() {
        let err = Extractor::default().extract("   ").expect_err("empty");
        assert!(matches!(err, MenderError::ParseFailure(_)));
    }

    #[test]
    fn extract_code_uses_only_fences() {
        assert_eq!(
            extract_code("```json\n{\"fixed_code\": \"x = 1\"}\n```").as_deref(),
            Some("x = 1")
        );
        assert_eq!(
            extract_code("```py\ny = 2\n```").as_deref(),
            Some("y = 2")
        );
        // Bare code is left to the full chain.
        assert_eq!(extract_code("def f():\n    return 1"), None);
        assert_eq!(extract_code("{\"fixed_code\": \"z = 3\"}"), None);
    }

    #[test]
    fn custom_chain_is_respected() {
        let only_braces = Extractor::new(vec![Box::new(BalancedBraces)]);
        assert!(only_braces.extract("```python\ndef f(): pass\n```").is_err());
        assert!(only_braces.extract("{\"k\": true}").is_ok());
    }
}
