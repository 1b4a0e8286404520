//! Prompt rendering for the three stage agents.

use anyhow::{Context, Result};
use minijinja::{Environment, context};

use crate::core::types::{Issue, PlanStep, TestResult};

pub const AUDITOR_SYSTEM: &str = include_str!("prompts/auditor_system.md");
pub const FIXER_SYSTEM: &str = include_str!("prompts/fixer_system.md");
pub const JUDGE_SYSTEM: &str = include_str!("prompts/judge_system.md");

const AUDITOR_TEMPLATE: &str = include_str!("prompts/auditor.md");
const FIXER_TEMPLATE: &str = include_str!("prompts/fixer.md");
const FIXER_ITERATIVE_TEMPLATE: &str = include_str!("prompts/fixer_iterative.md");
const JUDGE_TEMPLATE: &str = include_str!("prompts/judge.md");

pub struct AnalysisPrompt<'a> {
    pub file_path: &'a str,
    pub code: &'a str,
    pub score: f64,
    pub lint_report: &'a str,
}

pub struct RepairPrompt<'a> {
    pub file_path: &'a str,
    pub code: &'a str,
    pub plan: &'a [PlanStep],
    pub issues: &'a [Issue],
}

pub struct IterativeRepairPrompt<'a> {
    pub file_path: &'a str,
    pub code: &'a str,
    pub feedback: &'a [&'a str],
    pub changes: &'a [String],
    pub iteration: u32,
    pub max_iterations: u32,
}

pub struct EvaluationPrompt<'a> {
    pub file_path: &'a str,
    pub original_score: f64,
    pub new_score: f64,
    pub tests: &'a TestResult,
    pub changes: &'a [String],
}

/// Template engine wrapper around minijinja.
pub struct PromptEngine {
    env: Environment<'static>,
}

impl Default for PromptEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptEngine {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("auditor", AUDITOR_TEMPLATE)
            .expect("auditor template should be valid");
        env.add_template("fixer", FIXER_TEMPLATE)
            .expect("fixer template should be valid");
        env.add_template("fixer_iterative", FIXER_ITERATIVE_TEMPLATE)
            .expect("fixer_iterative template should be valid");
        env.add_template("judge", JUDGE_TEMPLATE)
            .expect("judge template should be valid");
        Self { env }
    }

    pub fn render_analysis(&self, input: &AnalysisPrompt<'_>) -> Result<String> {
        let template = self.env.get_template("auditor")?;
        template
            .render(context! {
                file_path => input.file_path,
                code => input.code.trim_end(),
                score => format!("{:.2}", input.score),
                lint_report => input.lint_report.trim(),
            })
            .context("render analysis prompt")
    }

    pub fn render_repair(&self, input: &RepairPrompt<'_>) -> Result<String> {
        let template = self.env.get_template("fixer")?;
        template
            .render(context! {
                file_path => input.file_path,
                code => input.code.trim_end(),
                plan => input.plan,
                issues => input.issues,
            })
            .context("render repair prompt")
    }

    pub fn render_iterative_repair(&self, input: &IterativeRepairPrompt<'_>) -> Result<String> {
        let template = self.env.get_template("fixer_iterative")?;
        template
            .render(context! {
                file_path => input.file_path,
                code => input.code.trim_end(),
                feedback => input.feedback,
                changes => input.changes,
                iteration => input.iteration,
                max_iterations => input.max_iterations,
            })
            .context("render iterative repair prompt")
    }

    pub fn render_evaluation(&self, input: &EvaluationPrompt<'_>) -> Result<String> {
        let template = self.env.get_template("judge")?;
        template
            .render(context! {
                file_path => input.file_path,
                original_score => format!("{:.2}", input.original_score),
                new_score => format!("{:.2}", input.new_score),
                score_delta => format!("{:+.2}", input.new_score - input.original_score),
                tests => input.tests,
                changes => input.changes,
            })
            .context("render evaluation prompt")
    }
}
