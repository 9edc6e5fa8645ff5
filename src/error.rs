//! Error types for the workflow orchestrator

use crate::models::FailureKind;
use thiserror::Error;

/// Result type alias for orchestrator operations
pub type Result<T> = std::result::Result<T, OrchestrationError>;

#[derive(Error, Debug)]
pub enum OrchestrationError {

    // =============================
    // Routing Errors (terminal for a request)
    // =============================

    #[error("No confident workflow match for request: {request}")]
    NoConfidentMatch {
        request: String,
        candidates: Vec<String>,
    },

    #[error("Unknown workflow: {0}")]
    UnknownWorkflow(String),

    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    #[error("Invalid workflow definition: {0}")]
    InvalidWorkflow(String),

    // =============================
    // Execution Errors
    // =============================

    #[error("Unknown capability: {0}")]
    UnknownCapability(String),

    #[error("Capability failure ({kind}): {message}")]
    CapabilityFailure { kind: FailureKind, message: String },

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Max iterations reached: {0}")]
    MaxIterationsReached(u32),

    #[error("Partial failure: {succeeded} succeeded, {failed} failed")]
    PartialFailure { succeeded: usize, failed: usize },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Task failed: {0}")]
    TaskFailed(String),

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl OrchestrationError {
    /// Terminal errors end the request without partial results.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::NoConfidentMatch { .. } | Self::UnknownWorkflow(_) | Self::InvalidPlan(_)
        )
    }

    /// User-facing clarification for an ambiguous or unmatched request.
    pub fn clarification(&self) -> Option<String> {
        let Self::NoConfidentMatch { candidates, .. } = self else {
            return None;
        };

        if candidates.is_empty() {
            return Some(
                "I couldn't match your request to a workflow. Could you describe what you \
                 need in more detail (for example portfolio review, onboarding, or compliance)?"
                    .to_string(),
            );
        }

        Some(format!(
            "Your request could match several workflows: {}. Which one did you mean?",
            candidates.join(", ")
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clarification_lists_candidates() {
        let err = OrchestrationError::NoConfidentMatch {
            request: "review".to_string(),
            candidates: vec!["ADV001".to_string(), "ADV002".to_string()],
        };

        let text = err.clarification().unwrap();
        assert!(text.contains("ADV001, ADV002"));
        assert!(err.is_terminal());
    }

    #[test]
    fn test_non_routing_errors_have_no_clarification() {
        let err = OrchestrationError::Timeout("deadline".to_string());
        assert!(err.clarification().is_none());
        assert!(!err.is_terminal());
    }
}
