//! Sequential executor
//!
//! Steps run strictly in order and feed each other through the context.
//! A required failure halts the run; optional failures are tolerated and
//! downgrade the status to partial success.

use super::{run_sequence, ExecutionEnv, PatternExecutor};
use crate::context::ExecutionContext;
use crate::models::{ExecutionResult, ExecutionStatus, PatternType, WorkflowDefinition};
use tracing::debug;

pub struct SequentialExecutor;

/// Run the workflow's steps in order, appending to `result`.
pub(crate) async fn run_steps(
    workflow: &WorkflowDefinition,
    context: &mut ExecutionContext,
    env: &ExecutionEnv,
    result: &mut ExecutionResult,
) -> ExecutionStatus {
    let outcome = run_sequence(&workflow.steps, context, env, None, &mut result.trace).await;
    let status = outcome.status();
    result.invocations.extend(outcome.invocations);
    status
}

#[async_trait::async_trait]
impl PatternExecutor for SequentialExecutor {
    fn pattern(&self) -> PatternType {
        PatternType::Sequential
    }

    async fn execute(
        &self,
        workflow: &WorkflowDefinition,
        context: &mut ExecutionContext,
        env: &ExecutionEnv,
    ) -> ExecutionResult {
        debug!(workflow_id = %workflow.workflow_id, steps = workflow.steps.len(), "Starting sequential execution");

        let mut result = ExecutionResult::begin(&workflow.workflow_id, PatternType::Sequential);
        let status = run_steps(workflow, context, env, &mut result).await;

        debug!(workflow_id = %workflow.workflow_id, %status, "Sequential execution finished");
        result.finish(status)
    }
}
