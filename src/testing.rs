//! Test-only scripted capabilities and environment builders.

use crate::capabilities::{Capability, CapabilityError, CapabilityInvoker, CapabilityRegistry, RetryPolicy};
use crate::context::ExecutionContext;
use crate::execution::{ExecutionConfig, ExecutionEnv};
use crate::models::{FailureKind, WorkflowDefinition};
use crate::registry::WorkflowRegistry;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

type Responder = fn(&Value, &ExecutionContext, u32) -> Value;

/// Capability whose latency, failures and response are scripted per call.
pub struct ScriptedCapability {
    name: String,
    required: Vec<String>,
    latencies: Vec<Duration>,
    fail_first: u32,
    fail_kind: FailureKind,
    respond: Option<Responder>,
    calls: AtomicU32,
    spans: Mutex<Vec<(Instant, Instant)>>,
}

impl ScriptedCapability {
    pub fn ok(name: &str) -> Self {
        Self {
            name: name.to_string(),
            required: Vec::new(),
            latencies: Vec::new(),
            fail_first: 0,
            fail_kind: FailureKind::Internal,
            respond: None,
            calls: AtomicU32::new(0),
            spans: Mutex::new(Vec::new()),
        }
    }

    /// Fails every call with the given kind.
    pub fn failing(name: &str, kind: FailureKind) -> Self {
        Self::ok(name).failing_first(u32::MAX, kind)
    }

    pub fn failing_first(mut self, count: u32, kind: FailureKind) -> Self {
        self.fail_first = count;
        self.fail_kind = kind;
        self
    }

    pub fn with_latency(self, latency: Duration) -> Self {
        self.with_latencies(&[latency])
    }

    /// Latency per call; the last entry repeats.
    pub fn with_latencies(mut self, latencies: &[Duration]) -> Self {
        self.latencies = latencies.to_vec();
        self
    }

    pub fn requiring(mut self, fields: &[&str]) -> Self {
        self.required = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn responding(mut self, respond: Responder) -> Self {
        self.respond = Some(respond);
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Start and end instants of every call, in call order.
    pub fn spans(&self) -> Vec<(Instant, Instant)> {
        self.spans.lock().clone()
    }
}

#[async_trait::async_trait]
impl Capability for ScriptedCapability {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "scripted test capability"
    }

    fn required_fields(&self) -> &[String] {
        &self.required
    }

    async fn invoke(&self, input: &Value, context: &ExecutionContext) -> Result<Value, CapabilityError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let started = Instant::now();

        let latency = self
            .latencies
            .get(call as usize - 1)
            .or_else(|| self.latencies.last())
            .copied()
            .unwrap_or_default();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.spans.lock().push((started, Instant::now()));

        if call <= self.fail_first {
            return Err(CapabilityError::new(
                self.fail_kind,
                format!("{} scripted failure #{}", self.name, call),
            ));
        }

        Ok(match self.respond {
            Some(respond) => respond(input, context, call),
            None => json!({ "capability": self.name, "call": call }),
        })
    }
}

pub fn invoker_with(capabilities: Vec<Arc<ScriptedCapability>>) -> CapabilityInvoker {
    let mut registry = CapabilityRegistry::new();
    for capability in capabilities {
        registry.register(capability);
    }
    CapabilityInvoker::new(
        Arc::new(registry),
        RetryPolicy::new(3, Duration::from_millis(200)),
        Duration::from_secs(30),
    )
}

pub fn env_with(
    capabilities: Vec<Arc<ScriptedCapability>>,
    workflows: Vec<WorkflowDefinition>,
) -> ExecutionEnv {
    let registry = WorkflowRegistry::new();
    for workflow in workflows {
        if let Err(e) = registry.register(workflow) {
            panic!("test workflow rejected: {}", e);
        }
    }
    ExecutionEnv::new(
        Arc::new(invoker_with(capabilities)),
        Arc::new(registry),
        ExecutionConfig::default(),
    )
}
