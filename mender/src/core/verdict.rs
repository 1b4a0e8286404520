//! Objective verdict policy for one repair attempt.
//!
//! The advisory verdict from the evaluation collaborator is deliberately not an
//! input here; it only ever reaches the next repair prompt as feedback text.

use serde::{Deserialize, Serialize};

use crate::core::types::{TestResult, Verdict};

/// Thresholds driving [`VerdictPolicy::decide`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerdictPolicy {
    /// Score at or above which an attempt counts as good enough.
    pub success_score_threshold: f64,
    /// Drop below the original score that counts as a regression.
    pub regression_threshold: f64,
}

impl Default for VerdictPolicy {
    fn default() -> Self {
        Self {
            success_score_threshold: 8.0,
            regression_threshold: 2.0,
        }
    }
}

impl VerdictPolicy {
    pub fn decide(&self, new_score: f64, original_score: f64, tests: &TestResult) -> Verdict {
        let improved = new_score > original_score;
        let good_enough = new_score >= self.success_score_threshold;

        if tests.success && (improved || good_enough) {
            return Verdict::Success;
        }
        if tests.total_tests == 0 {
            return if good_enough || improved {
                Verdict::Success
            } else {
                Verdict::Retry
            };
        }
        if new_score < original_score - self.regression_threshold {
            return Verdict::Failure;
        }
        Verdict::Retry
    }
}
