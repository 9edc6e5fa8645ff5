//! Uniform call contract over named capabilities
//!
//! The invoker is the only component that crosses the external boundary.
//! It owns the per-call timeout and the retry policy for transient failures,
//! and produces exactly one `CapabilityInvocation` per call.

use super::{CapabilityError, CapabilityRegistry};
use crate::context::ExecutionContext;
use crate::models::{CapabilityInvocation, FailureKind, InvocationOutcome};
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(200),
            multiplier: 2.0,
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay,
            ..Self::default()
        }
    }

    /// Backoff before retrying after failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let delay = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::from_secs_f64(delay).min(self.max_delay)
    }
}

pub struct CapabilityInvoker {
    registry: Arc<CapabilityRegistry>,
    retry: RetryPolicy,
    default_timeout: Duration,
}

impl CapabilityInvoker {
    pub fn new(registry: Arc<CapabilityRegistry>, retry: RetryPolicy, default_timeout: Duration) -> Self {
        Self {
            registry,
            retry,
            default_timeout,
        }
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    /// Invoke a capability by name.
    ///
    /// `timeout` is the step override; without one the capability's own
    /// timeout applies, then the engine default. Failures are reported in
    /// the returned invocation, never as `Err`.
    pub async fn invoke(
        &self,
        name: &str,
        input: Value,
        context: &ExecutionContext,
        timeout: Option<Duration>,
        iteration: Option<u32>,
    ) -> CapabilityInvocation {
        let started_at = Utc::now();
        let (outcome, attempts) = self.call(name, &input, context, timeout).await;
        let ended_at = Utc::now();

        CapabilityInvocation {
            invocation_id: Uuid::new_v4(),
            capability: name.to_string(),
            input,
            attempts,
            iteration,
            started_at,
            ended_at,
            duration_ms: (ended_at - started_at).num_milliseconds().max(0) as u64,
            outcome,
        }
    }

    async fn call(
        &self,
        name: &str,
        input: &Value,
        context: &ExecutionContext,
        timeout: Option<Duration>,
    ) -> (InvocationOutcome, u32) {
        let Some(capability) = self.registry.get(name) else {
            warn!(capability = name, "Unknown capability");
            return (
                failure(FailureKind::UnknownCapability, format!("no capability named '{}'", name)),
                0,
            );
        };

        let missing: Vec<&str> = capability
            .required_fields()
            .iter()
            .filter(|field| input.get(field.as_str()).map_or(true, Value::is_null))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return (
                failure(
                    FailureKind::Validation,
                    format!("missing required input: {}", missing.join(", ")),
                ),
                0,
            );
        }

        let timeout = timeout
            .or_else(|| capability.timeout())
            .unwrap_or(self.default_timeout);

        let mut attempt = 0;
        loop {
            attempt += 1;
            debug!(capability = name, attempt, "Invoking capability");

            let result = match tokio::time::timeout(timeout, capability.invoke(input, context)).await {
                Ok(result) => result,
                Err(_) => Err(CapabilityError::new(
                    FailureKind::Timeout,
                    format!("timed out after {}ms", timeout.as_millis()),
                )),
            };

            match result {
                Ok(value) => return (InvocationOutcome::Success { value }, attempt),
                Err(err) if err.kind.is_transient() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        capability = name,
                        attempt,
                        kind = %err.kind,
                        delay_ms = delay.as_millis() as u64,
                        "Transient capability failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    warn!(capability = name, attempt, kind = %err.kind, error = %err.message, "Capability failed");
                    return (failure(err.kind, err.message), attempt);
                }
            }
        }
    }
}

fn failure(kind: FailureKind, message: String) -> InvocationOutcome {
    InvocationOutcome::Failure { kind, message }
}
