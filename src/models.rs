//! Core data models for the workflow orchestrator

use crate::conditions::{CompletionPredicate, Recurrence, TriggerCondition};
use crate::context::{ExecutionContext, Namespace, LAST_EVENT};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

//
// ================= Enums =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PatternType {
    Sequential,
    Parallel,
    Loop,
    EventDriven,
    Scheduled,
    MasterOrchestration,
}

impl PatternType {
    pub const ALL: [PatternType; 6] = [
        PatternType::Sequential,
        PatternType::Parallel,
        PatternType::Loop,
        PatternType::EventDriven,
        PatternType::Scheduled,
        PatternType::MasterOrchestration,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PatternType::Sequential => "sequential",
            PatternType::Parallel => "parallel",
            PatternType::Loop => "loop",
            PatternType::EventDriven => "event_driven",
            PatternType::Scheduled => "scheduled",
            PatternType::MasterOrchestration => "master_orchestration",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowCategory {
    Advisor,
    Client,
    Operations,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Completed,
    PartialSuccess,
    Failed,
    TimedOut,
    MaxIterationsReached,
}

impl ExecutionStatus {
    /// A result that produced nothing usable.
    pub fn is_failure(&self) -> bool {
        matches!(self, ExecutionStatus::Failed | ExecutionStatus::TimedOut)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Network,
    ServiceUnavailable,
    Validation,
    Authorization,
    Timeout,
    UnknownCapability,
    Internal,
}

impl FailureKind {
    /// Transient kinds are retried by the invoker.
    pub fn is_transient(&self) -> bool {
        matches!(self, FailureKind::Network | FailureKind::ServiceUnavailable)
    }
}

//
// ================= Workflow Definition =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub workflow_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub category: WorkflowCategory,
    pub pattern: PatternType,
    /// Classification hints matched against incoming requests
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub steps: Vec<CapabilityStep>,
    #[serde(default)]
    pub completion: Option<CompletionPredicate>,
    #[serde(default)]
    pub max_iterations: Option<u32>,
    #[serde(default)]
    pub trigger: Option<TriggerCondition>,
    #[serde(default)]
    pub recurrence: Option<Recurrence>,
    /// Handler shape for event-driven and scheduled workflows
    #[serde(default)]
    pub inner_pattern: Option<PatternType>,
    /// Ordered stages of sub-workflow ids (master orchestration only)
    #[serde(default)]
    pub stages: Vec<Vec<String>>,
}

impl WorkflowDefinition {
    pub fn new(
        workflow_id: impl Into<String>,
        name: impl Into<String>,
        category: WorkflowCategory,
        pattern: PatternType,
    ) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            name: name.into(),
            description: String::new(),
            category,
            pattern,
            keywords: Vec::new(),
            steps: Vec::new(),
            completion: None,
            max_iterations: None,
            trigger: None,
            recurrence: None,
            inner_pattern: None,
            stages: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_keywords(mut self, keywords: &[&str]) -> Self {
        self.keywords = keywords.iter().map(|k| k.to_string()).collect();
        self
    }

    pub fn with_step(mut self, step: CapabilityStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_completion(mut self, predicate: CompletionPredicate) -> Self {
        self.completion = Some(predicate);
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = Some(max_iterations);
        self
    }

    pub fn with_trigger(mut self, trigger: TriggerCondition) -> Self {
        self.trigger = Some(trigger);
        self
    }

    pub fn with_recurrence(mut self, recurrence: Recurrence) -> Self {
        self.recurrence = Some(recurrence);
        self
    }

    pub fn with_inner_pattern(mut self, pattern: PatternType) -> Self {
        self.inner_pattern = Some(pattern);
        self
    }

    pub fn with_stage(mut self, workflow_ids: &[&str]) -> Self {
        self.stages
            .push(workflow_ids.iter().map(|id| id.to_string()).collect());
        self
    }

    /// Handler shape used by event-driven and scheduled workflows.
    pub fn handler_pattern(&self) -> PatternType {
        self.inner_pattern.unwrap_or(PatternType::Sequential)
    }
}

//
// ================= Capability Steps =================
//

fn default_required() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityStep {
    pub capability: String,
    #[serde(default)]
    pub input: BTreeMap<String, InputSource>,
    #[serde(default = "default_required")]
    pub required: bool,
    #[serde(default)]
    pub output_key: Option<String>,
    /// Output fields copied into `remembered-entities` on success
    #[serde(default)]
    pub remember: Vec<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl CapabilityStep {
    pub fn required(capability: impl Into<String>) -> Self {
        Self {
            capability: capability.into(),
            input: BTreeMap::new(),
            required: true,
            output_key: None,
            remember: Vec::new(),
            timeout_ms: None,
        }
    }

    pub fn optional(capability: impl Into<String>) -> Self {
        Self {
            required: false,
            ..Self::required(capability)
        }
    }

    pub fn with_input(mut self, field: impl Into<String>, source: InputSource) -> Self {
        self.input.insert(field.into(), source);
        self
    }

    pub fn with_output_key(mut self, key: impl Into<String>) -> Self {
        self.output_key = Some(key.into());
        self
    }

    pub fn remembering(mut self, field: impl Into<String>) -> Self {
        self.remember.push(field.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Key under which the step output lands in `step-outputs`.
    pub fn output_key(&self) -> &str {
        self.output_key.as_deref().unwrap_or(&self.capability)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// Build the capability input object from the mapping rules.
    pub fn resolve_input(&self, context: &ExecutionContext, request: &str) -> Value {
        let mut input = serde_json::Map::with_capacity(self.input.len());
        for (field, source) in &self.input {
            input.insert(field.clone(), source.resolve(context, request));
        }
        Value::Object(input)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "from", rename_all = "snake_case")]
pub enum InputSource {
    Literal {
        value: Value,
    },
    Context {
        namespace: Namespace,
        key: String,
    },
    StepOutput {
        key: String,
        #[serde(default)]
        path: Option<String>,
    },
    Request,
    /// Field of the event that triggered the current run
    Event {
        path: String,
    },
}

impl InputSource {
    pub fn literal(value: impl Into<Value>) -> Self {
        Self::Literal {
            value: value.into(),
        }
    }

    pub fn context(namespace: Namespace, key: impl Into<String>) -> Self {
        Self::Context {
            namespace,
            key: key.into(),
        }
    }

    pub fn step_output(key: impl Into<String>, path: Option<&str>) -> Self {
        Self::StepOutput {
            key: key.into(),
            path: path.map(str::to_string),
        }
    }

    pub fn event(path: &str) -> Self {
        Self::Event {
            path: path.to_string(),
        }
    }

    fn resolve(&self, context: &ExecutionContext, request: &str) -> Value {
        match self {
            InputSource::Literal { value } => value.clone(),
            InputSource::Context { namespace, key } => {
                context.get(*namespace, key).cloned().unwrap_or(Value::Null)
            }
            InputSource::StepOutput { key, path } => {
                let output = context.get(Namespace::StepOutputs, key);
                match (output, path) {
                    (Some(output), Some(path)) => lookup(output, path).cloned().unwrap_or(Value::Null),
                    (Some(output), None) => output.clone(),
                    (None, _) => Value::Null,
                }
            }
            InputSource::Request => Value::String(request.to_string()),
            InputSource::Event { path } => context
                .get(Namespace::ConversationContext, LAST_EVENT)
                .and_then(|event| lookup(event, path))
                .cloned()
                .unwrap_or(Value::Null),
        }
    }
}

/// Look up a dotted path (`metrics.risk_score`) inside a JSON value.
pub fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }
    let pointer = format!("/{}", path.replace('.', "/"));
    value.pointer(&pointer)
}

//
// ================= Classification =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub workflow_id: String,
    pub confidence: f32,
    pub matched_keywords: Vec<String>,
}

/// Ordered stages of workflow ids; members of a stage may run concurrently.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DecompositionPlan {
    pub stages: Vec<Vec<String>>,
}

impl DecompositionPlan {
    pub fn new(stages: Vec<Vec<String>>) -> Self {
        Self { stages }
    }

    pub fn workflow_count(&self) -> usize {
        self.stages.iter().map(Vec::len).sum()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationResult {
    /// Ranked by confidence, highest first
    pub candidates: Vec<Candidate>,
    pub requires_decomposition: bool,
    pub decomposition: Option<DecompositionPlan>,
    pub classified_at: DateTime<Utc>,
}

impl ClassificationResult {
    pub fn top(&self) -> Option<&Candidate> {
        self.candidates.first()
    }
}

//
// ================= Invocations =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum InvocationOutcome {
    Success { value: Value },
    Failure { kind: FailureKind, message: String },
}

impl InvocationOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, InvocationOutcome::Success { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityInvocation {
    pub invocation_id: Uuid,
    pub capability: String,
    pub input: Value,
    pub attempts: u32,
    #[serde(default)]
    pub iteration: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(flatten)]
    pub outcome: InvocationOutcome,
}

impl CapabilityInvocation {
    pub fn succeeded(&self) -> bool {
        self.outcome.is_success()
    }
}

//
// ================= Execution Result =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub execution_id: Uuid,
    pub workflow_id: String,
    pub pattern: PatternType,
    pub status: ExecutionStatus,
    pub invocations: Vec<CapabilityInvocation>,
    pub iterations: u32,
    /// Sub-workflow results (master orchestration, event dispatch)
    #[serde(default)]
    pub children: Vec<ExecutionResult>,
    pub trace: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl ExecutionResult {
    /// Start a result record; executors fill it before returning it.
    pub(crate) fn begin(workflow_id: impl Into<String>, pattern: PatternType) -> Self {
        let now = Utc::now();
        Self {
            execution_id: Uuid::new_v4(),
            workflow_id: workflow_id.into(),
            pattern,
            status: ExecutionStatus::Completed,
            invocations: Vec::new(),
            iterations: 0,
            children: Vec::new(),
            trace: Vec::new(),
            started_at: now,
            completed_at: now,
            duration_ms: 0,
        }
    }

    pub(crate) fn finish(mut self, status: ExecutionStatus) -> Self {
        self.status = status;
        self.completed_at = Utc::now();
        self.duration_ms = (self.completed_at - self.started_at)
            .num_milliseconds()
            .max(0) as u64;
        self
    }

    /// Invocations of this result and every nested child, depth first.
    pub fn all_invocations(&self) -> Vec<(&str, &CapabilityInvocation)> {
        let mut out: Vec<(&str, &CapabilityInvocation)> = self
            .invocations
            .iter()
            .map(|inv| (self.workflow_id.as_str(), inv))
            .collect();
        for child in &self.children {
            out.extend(child.all_invocations());
        }
        out
    }

    pub fn invoked(&self, capability: &str) -> bool {
        self.all_invocations()
            .iter()
            .any(|(_, inv)| inv.capability == capability)
    }
}

impl fmt::Display for PatternType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::PartialSuccess => "partial_success",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::TimedOut => "timed_out",
            ExecutionStatus::MaxIterationsReached => "max_iterations_reached",
        };
        write!(f, "{}", s)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::Network => "network",
            FailureKind::ServiceUnavailable => "service_unavailable",
            FailureKind::Validation => "validation",
            FailureKind::Authorization => "authorization",
            FailureKind::Timeout => "timeout",
            FailureKind::UnknownCapability => "unknown_capability",
            FailureKind::Internal => "internal",
        };
        write!(f, "{}", s)
    }
}
