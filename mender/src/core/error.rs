//! Typed failure kinds shared across the workflow.
//!
//! Orchestration code carries these inside `anyhow::Error` chains (either as the
//! root error or as a context layer) and classifies them with `downcast_ref`.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::core::types::LifecycleStatus;

#[derive(Debug, Error)]
pub enum MenderError {
    /// Path resolves outside the sandbox root.
    #[error("path {} escapes sandbox root {}", path.display(), root.display())]
    ContainmentViolation { path: PathBuf, root: PathBuf },

    #[error("file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("file {} is {size} bytes (limit {limit})", path.display())]
    FileTooLarge {
        path: PathBuf,
        size: u64,
        limit: u64,
    },

    /// Retryable failure of an external service.
    #[error("transient service error: {0}")]
    TransientService(String),

    /// Credential/authentication class failure; never retried.
    #[error("fatal service error (not retried)")]
    FatalService,

    #[error("gave up after {attempts} attempts")]
    MaxRetriesExceeded { attempts: u32 },

    #[error("could not parse response: {0}")]
    ParseFailure(String),

    #[error("generated code failed syntax validation: {0}")]
    SyntaxValidation(String),

    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    #[error("illegal transition for {}: {from:?} -> {to:?}", path.display())]
    InvalidTransition {
        path: PathBuf,
        from: LifecycleStatus,
        to: LifecycleStatus,
    },
}

impl MenderError {
    /// Find the outermost typed kind in an error chain.
    pub fn find(err: &anyhow::Error) -> Option<&MenderError> {
        Self::kinds(err).next()
    }

    /// Whether `err` must abort the whole run rather than be absorbed into an
    /// artifact's error log.
    pub fn aborts_run(err: &anyhow::Error) -> bool {
        Self::kinds(err).any(|kind| {
            matches!(
                kind,
                MenderError::ContainmentViolation { .. }
                    | MenderError::FatalService
                    | MenderError::InvalidTransition { .. }
            )
        })
    }

    // `anyhow::Error::downcast_ref` sees context layers, `chain()` sees root causes.
    fn kinds(err: &anyhow::Error) -> impl Iterator<Item = &MenderError> {
        err.downcast_ref::<MenderError>().into_iter().chain(
            err.chain()
                .filter_map(|cause| cause.downcast_ref::<MenderError>()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{Context, anyhow};

    #[test]
    fn containment_violation_aborts_through_context() {
        let err = anyhow::Error::new(MenderError::ContainmentViolation {
            path: PathBuf::from("/etc/passwd"),
            root: PathBuf::from("/sandbox"),
        })
        .context("write fixed code");
        assert!(MenderError::aborts_run(&err));
        assert!(err.to_string().contains("write fixed code"));
    }

    #[test]
    fn fatal_service_as_context_layer_aborts() {
        let err = anyhow!("invalid_api_key").context(MenderError::FatalService);
        assert!(MenderError::aborts_run(&err));
        assert!(matches!(
            MenderError::find(&err),
            Some(MenderError::FatalService)
        ));
    }

    #[test]
    fn stage_failures_are_absorbed() {
        let err = anyhow!("connection reset").context(MenderError::MaxRetriesExceeded { attempts: 3 });
        assert!(!MenderError::aborts_run(&err));

        let err = anyhow::Error::new(MenderError::SyntaxValidation("line 3".to_string()));
        assert!(!MenderError::aborts_run(&err));
    }

    #[test]
    fn timeout_display_names_operation() {
        let err = MenderError::Timeout {
            operation: "pylint".to_string(),
            after: Duration::from_secs(2),
        };
        assert_eq!(err.to_string(), "pylint timed out after 2s");
    }
}
