//! Capability trait and registry
//!
//! A capability is a named, asynchronous business operation (portfolio
//! summary, risk analysis, client notification, ...). The engine treats each
//! one as opaque: JSON in, JSON out, plus a failure classification the
//! invoker uses for its retry decision.

pub mod builtin;
pub mod http;
pub mod invoker;

pub use builtin::create_default_registry;
pub use http::HttpCapability;
pub use invoker::{CapabilityInvoker, RetryPolicy};

use crate::context::ExecutionContext;
use crate::error::OrchestrationError;
use crate::models::FailureKind;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Classified failure returned by a capability.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{kind}: {message}")]
pub struct CapabilityError {
    pub kind: FailureKind,
    pub message: String,
}

impl CapabilityError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Network, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(FailureKind::ServiceUnavailable, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Validation, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Internal, message)
    }
}

impl From<CapabilityError> for OrchestrationError {
    fn from(err: CapabilityError) -> Self {
        OrchestrationError::CapabilityFailure {
            kind: err.kind,
            message: err.message,
        }
    }
}

/// Trait for a single capability
#[async_trait::async_trait]
pub trait Capability: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// Per-call timeout; the invoker falls back to the engine default.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// Input fields that must be present and non-null.
    fn required_fields(&self) -> &[String] {
        &[]
    }

    async fn invoke(
        &self,
        input: &Value,
        context: &ExecutionContext,
    ) -> std::result::Result<Value, CapabilityError>;
}

/// Capability registry for looking up capabilities by name
pub struct CapabilityRegistry {
    capabilities: HashMap<String, Arc<dyn Capability>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self {
            capabilities: HashMap::new(),
        }
    }

    /// Register a capability, replacing any previous one with the same name.
    pub fn register(&mut self, capability: Arc<dyn Capability>) {
        self.capabilities
            .insert(capability.name().to_string(), capability);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Capability>> {
        self.capabilities.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.capabilities.contains_key(name)
    }

    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.capabilities.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.capabilities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedCapability;

    #[test]
    fn test_register_replaces_by_name() {
        let mut registry = CapabilityRegistry::new();
        registry.register(Arc::new(ScriptedCapability::ok("get_portfolio_summary")));
        registry.register(Arc::new(ScriptedCapability::ok("get_portfolio_summary")));
        registry.register(Arc::new(ScriptedCapability::ok("analyze_portfolio_risk")));

        assert_eq!(registry.len(), 2);
        assert_eq!(
            registry.list(),
            vec!["analyze_portfolio_risk", "get_portfolio_summary"]
        );
        assert!(registry.get("unknown").is_none());
    }

    #[test]
    fn test_capability_error_converts_to_orchestration_error() {
        let err: OrchestrationError = CapabilityError::validation("missing account_id").into();
        assert!(matches!(
            err,
            OrchestrationError::CapabilityFailure {
                kind: FailureKind::Validation,
                ..
            }
        ));
    }
}
