//! Result aggregation
//!
//! Folds an `ExecutionResult` tree into the single response handed back to
//! the caller, and combines sibling statuses under the partial-failure
//! policy.

use crate::error::OrchestrationError;
use crate::models::{ExecutionResult, ExecutionStatus, InvocationOutcome, PatternType};
use crate::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Overall status of sibling results.
///
/// Empty or all completed ⇒ completed. Every member failed ⇒ failed, or
/// timed out when every member timed out. Anything else is partial.
pub fn combine_status(statuses: &[ExecutionStatus]) -> ExecutionStatus {
    if statuses.iter().all(|s| *s == ExecutionStatus::Completed) {
        return ExecutionStatus::Completed;
    }
    if statuses.iter().all(|s| *s == ExecutionStatus::TimedOut) {
        return ExecutionStatus::TimedOut;
    }
    if statuses.iter().all(|s| s.is_failure()) {
        return ExecutionStatus::Failed;
    }
    ExecutionStatus::PartialSuccess
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepReport {
    pub workflow_id: String,
    pub capability: String,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iteration: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSummary {
    pub workflow_id: String,
    pub pattern: PatternType,
    pub status: ExecutionStatus,
    pub invocations: usize,
    pub iterations: u32,
    pub duration_ms: u64,
}

/// Caller-facing view of one orchestrated request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationResponse {
    pub execution_id: Uuid,
    pub workflow_id: String,
    pub pattern: PatternType,
    pub status: ExecutionStatus,
    pub summary: String,
    pub workflows: Vec<WorkflowSummary>,
    pub succeeded: Vec<StepReport>,
    pub failed: Vec<StepReport>,
    pub trace: Vec<String>,
    pub duration_ms: u64,
}

impl OrchestrationResponse {
    /// `Err(PartialFailure)` unless every step of every workflow succeeded.
    pub fn ensure_complete(&self) -> Result<()> {
        if self.status == ExecutionStatus::Completed && self.failed.is_empty() {
            return Ok(());
        }
        Err(OrchestrationError::PartialFailure {
            succeeded: self.succeeded.len(),
            failed: self.failed.len(),
        })
    }
}

pub fn aggregate(result: &ExecutionResult) -> OrchestrationResponse {
    let mut workflows = Vec::new();
    collect_workflows(result, &mut workflows);

    let mut succeeded = Vec::new();
    let mut failed = Vec::new();
    for (workflow_id, invocation) in result.all_invocations() {
        let mut report = StepReport {
            workflow_id: workflow_id.to_string(),
            capability: invocation.capability.clone(),
            attempts: invocation.attempts,
            iteration: invocation.iteration,
            output: None,
            error: None,
        };
        match &invocation.outcome {
            InvocationOutcome::Success { value } => {
                report.output = Some(value.clone());
                succeeded.push(report);
            }
            InvocationOutcome::Failure { kind, message } => {
                report.error = Some(format!("{}: {}", kind, message));
                failed.push(report);
            }
        }
    }

    let mut trace = Vec::new();
    collect_trace(result, &mut trace);

    let summary = summarize(result, &workflows, succeeded.len(), failed.len());

    OrchestrationResponse {
        execution_id: result.execution_id,
        workflow_id: result.workflow_id.clone(),
        pattern: result.pattern,
        status: result.status,
        summary,
        workflows,
        succeeded,
        failed,
        trace,
        duration_ms: result.duration_ms,
    }
}

fn collect_workflows(result: &ExecutionResult, out: &mut Vec<WorkflowSummary>) {
    // Container results (master, dispatch) only summarize their children
    if result.children.is_empty() || !result.invocations.is_empty() {
        out.push(WorkflowSummary {
            workflow_id: result.workflow_id.clone(),
            pattern: result.pattern,
            status: result.status,
            invocations: result.invocations.len(),
            iterations: result.iterations,
            duration_ms: result.duration_ms,
        });
    }
    for child in &result.children {
        collect_workflows(child, out);
    }
}

fn collect_trace(result: &ExecutionResult, out: &mut Vec<String>) {
    for line in &result.trace {
        out.push(format!("[{}] {}", result.workflow_id, line));
    }
    for child in &result.children {
        collect_trace(child, out);
    }
}

fn summarize(result: &ExecutionResult, workflows: &[WorkflowSummary], succeeded: usize, failed: usize) -> String {
    let headline = match result.status {
        ExecutionStatus::Completed => "Completed",
        ExecutionStatus::PartialSuccess => "Completed with some failures",
        ExecutionStatus::Failed => "Failed",
        ExecutionStatus::TimedOut => "Timed out",
        ExecutionStatus::MaxIterationsReached => "Stopped at the iteration limit",
    };

    let mut summary = format!(
        "{} {}: {} step(s) succeeded, {} failed",
        headline, result.workflow_id, succeeded, failed
    );
    if workflows.len() > 1 {
        summary.push_str(&format!(" across {} workflows", workflows.len()));
    }
    if result.pattern == PatternType::Loop {
        summary.push_str(&format!(" in {} iteration(s)", result.iterations));
    }
    summary
}
