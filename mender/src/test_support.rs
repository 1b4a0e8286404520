//! Scripted collaborators for driving stages and the engine in tests.
//!
//! Each fake replays a fixed script of results in order and records what it
//! was asked. Running past the end of a script is an error, not a panic, so a
//! test that under-scripts fails with a readable message.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tempfile::TempDir;

use crate::core::error::MenderError;
use crate::core::types::{AnalysisResult, TestResult};
use crate::io::analyzer::StaticAnalyzer;
use crate::io::generator::TextGenerator;
use crate::io::retry::Sleeper;
use crate::io::syntax::SyntaxValidator;
use crate::io::telemetry::{FinalMetrics, Telemetry, TelemetryEvent};
use crate::io::test_runner::TestRunner;

fn next_scripted<T>(script: &RefCell<VecDeque<Result<T>>>, what: &str) -> Result<T> {
    script
        .borrow_mut()
        .pop_front()
        .unwrap_or_else(|| Err(anyhow!("{what} script exhausted")))
}

/// Text generator replaying scripted responses.
#[derive(Default)]
pub struct ScriptedGenerator {
    script: RefCell<VecDeque<Result<String>>>,
    prompts: RefCell<Vec<(String, String)>>,
}

impl ScriptedGenerator {
    pub fn new(script: impl IntoIterator<Item = Result<String>>) -> Self {
        Self {
            script: RefCell::new(script.into_iter().collect()),
            prompts: RefCell::new(Vec::new()),
        }
    }

    /// Append more responses to the end of the script.
    pub fn push(&self, response: Result<String>) {
        self.script.borrow_mut().push_back(response);
    }

    /// `(system, user)` prompt pairs received so far.
    pub fn prompts(&self) -> Vec<(String, String)> {
        self.prompts.borrow().clone()
    }

    pub fn calls(&self) -> usize {
        self.prompts.borrow().len()
    }
}

impl TextGenerator for ScriptedGenerator {
    fn invoke(&self, system: &str, user: &str) -> Result<String> {
        self.prompts
            .borrow_mut()
            .push((system.to_string(), user.to_string()));
        next_scripted(&self.script, "generator")
    }
}

/// Static analyzer replaying scripted results.
#[derive(Default)]
pub struct ScriptedAnalyzer {
    script: RefCell<VecDeque<Result<AnalysisResult>>>,
    paths: RefCell<Vec<PathBuf>>,
}

impl ScriptedAnalyzer {
    pub fn new(script: impl IntoIterator<Item = Result<AnalysisResult>>) -> Self {
        Self {
            script: RefCell::new(script.into_iter().collect()),
            paths: RefCell::new(Vec::new()),
        }
    }

    /// Script of scores with no lint messages.
    pub fn scores(scores: impl IntoIterator<Item = f64>) -> Self {
        Self::new(scores.into_iter().map(|score| {
            Ok(AnalysisResult {
                score,
                messages: Vec::new(),
            })
        }))
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.paths.borrow().clone()
    }
}

impl StaticAnalyzer for ScriptedAnalyzer {
    fn analyze(&self, path: &Path) -> Result<AnalysisResult> {
        self.paths.borrow_mut().push(path.to_path_buf());
        next_scripted(&self.script, "analyzer")
    }
}

/// Test runner replaying scripted results.
#[derive(Default)]
pub struct ScriptedTestRunner {
    script: RefCell<VecDeque<Result<TestResult>>>,
    dirs: RefCell<Vec<PathBuf>>,
}

impl ScriptedTestRunner {
    pub fn new(script: impl IntoIterator<Item = Result<TestResult>>) -> Self {
        Self {
            script: RefCell::new(script.into_iter().collect()),
            dirs: RefCell::new(Vec::new()),
        }
    }

    /// `n` runs in a row that collected no tests.
    pub fn no_tests(n: usize) -> Self {
        Self::new((0..n).map(|_| Ok(TestResult::default())))
    }

    pub fn dirs(&self) -> Vec<PathBuf> {
        self.dirs.borrow().clone()
    }
}

impl TestRunner for ScriptedTestRunner {
    fn run(&self, dir: &Path) -> Result<TestResult> {
        self.dirs.borrow_mut().push(dir.to_path_buf());
        next_scripted(&self.script, "test runner")
    }
}

/// Syntax validator that accepts everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAllSyntax;

impl SyntaxValidator for AcceptAllSyntax {
    fn validate(&self, _code: &str) -> Result<()> {
        Ok(())
    }
}

/// Syntax validator that rejects everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct RejectSyntax;

impl SyntaxValidator for RejectSyntax {
    fn validate(&self, _code: &str) -> Result<()> {
        Err(MenderError::SyntaxValidation("invalid syntax".to_string()).into())
    }
}

/// Sleeper that records requested delays instead of sleeping.
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    delays: RefCell<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn delays(&self) -> Vec<Duration> {
        self.delays.borrow().clone()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) {
        self.delays.borrow_mut().push(duration);
    }
}

/// Telemetry sink that keeps everything in memory.
#[derive(Debug, Default)]
pub struct MemoryTelemetry {
    pub events: Vec<TelemetryEvent>,
    pub final_metrics: Option<FinalMetrics>,
    pub persist_count: usize,
}

impl MemoryTelemetry {
    pub fn kinds(&self) -> Vec<&str> {
        self.events.iter().map(|event| event.kind.as_str()).collect()
    }

    pub fn count(&self, kind: &str) -> usize {
        self.events.iter().filter(|event| event.kind == kind).count()
    }
}

impl Telemetry for MemoryTelemetry {
    fn append(&mut self, event: TelemetryEvent) {
        self.events.push(event);
    }

    fn record_final_metrics(&mut self, metrics: FinalMetrics) {
        self.final_metrics = Some(metrics);
    }

    fn persist(&mut self) -> Result<PathBuf> {
        self.persist_count += 1;
        Ok(PathBuf::from("memory"))
    }
}

/// Temporary target directory holding source files.
pub struct TestTree {
    _temp: TempDir,
    root: PathBuf,
}

impl TestTree {
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir().context("create temp dir")?;
        let root = temp.path().canonicalize().context("canonicalize temp dir")?;
        Ok(Self { _temp: temp, root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write `contents` to `rel` under the root, creating parents.
    pub fn write(&self, rel: &str, contents: &str) -> Result<PathBuf> {
        let path = self.root.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))?;
        Ok(path)
    }

    pub fn read(&self, rel: &str) -> Result<String> {
        let path = self.root.join(rel);
        fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))
    }
}
