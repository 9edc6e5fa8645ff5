//! Parallel executor
//!
//! Every step is dispatched at once, bounded by the per-request concurrency
//! limit. Branches run on forked contexts and never cancel each other; the
//! forks are merged back in completion order after the last branch ends.

use super::{fan_out, run_step, trace_line, ExecutionEnv, PatternExecutor};
use crate::context::ExecutionContext;
use crate::models::{ExecutionResult, ExecutionStatus, PatternType, WorkflowDefinition};
use futures::FutureExt;
use tracing::debug;

pub struct ParallelExecutor;

/// Run the workflow's steps concurrently, appending to `result`.
pub(crate) async fn run_steps(
    workflow: &WorkflowDefinition,
    context: &mut ExecutionContext,
    env: &ExecutionEnv,
    result: &mut ExecutionResult,
) -> ExecutionStatus {
    if env.deadline.is_elapsed() {
        result
            .trace
            .push(format!("deadline elapsed; {} branch(es) not dispatched", workflow.steps.len()));
        return ExecutionStatus::TimedOut;
    }

    let branches = fan_out(
        workflow.steps.iter().collect::<Vec<_>>(),
        context,
        env.concurrency(),
        |step, mut fork| {
            async move {
                // Waiting for a permit can outlast the deadline
                if env.deadline.is_elapsed() {
                    return (None, fork);
                }
                let invocation = run_step(step, &mut fork, env, None).await;
                (Some(invocation), fork)
            }
            .boxed()
        },
    )
    .await;

    let mut succeeded = 0;
    let mut skipped = 0;
    for branch in branches {
        match branch {
            Some(invocation) => {
                if invocation.succeeded() {
                    succeeded += 1;
                }
                result.trace.push(trace_line(&invocation));
                result.invocations.push(invocation);
            }
            None => skipped += 1,
        }
    }

    if skipped > 0 {
        result
            .trace
            .push(format!("deadline elapsed; {} branch(es) not dispatched", skipped));
        return ExecutionStatus::TimedOut;
    }

    match succeeded {
        n if n == workflow.steps.len() => ExecutionStatus::Completed,
        0 => ExecutionStatus::Failed,
        _ => ExecutionStatus::PartialSuccess,
    }
}

#[async_trait::async_trait]
impl PatternExecutor for ParallelExecutor {
    fn pattern(&self) -> PatternType {
        PatternType::Parallel
    }

    async fn execute(
        &self,
        workflow: &WorkflowDefinition,
        context: &mut ExecutionContext,
        env: &ExecutionEnv,
    ) -> ExecutionResult {
        debug!(
            workflow_id = %workflow.workflow_id,
            branches = workflow.steps.len(),
            max_concurrency = env.concurrency(),
            "Starting parallel execution"
        );

        let mut result = ExecutionResult::begin(&workflow.workflow_id, PatternType::Parallel);
        let status = run_steps(workflow, context, env, &mut result).await;

        debug!(workflow_id = %workflow.workflow_id, %status, "Parallel execution finished");
        result.finish(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::ExecutionConfig;
    use crate::models::{CapabilityStep, FailureKind, WorkflowCategory};
    use crate::testing::{env_with, ScriptedCapability};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::Instant;

    fn workflow(names: &[&str]) -> WorkflowDefinition {
        let mut workflow =
            WorkflowDefinition::new("PAR1", "parallel", WorkflowCategory::Advisor, PatternType::Parallel);
        workflow.steps = names.iter().map(|n| CapabilityStep::required(*n)).collect();
        workflow
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_failure_is_partial_success_and_runs_concurrently() {
        let a = Arc::new(ScriptedCapability::ok("a").with_latency(Duration::from_millis(300)));
        let b = Arc::new(
            ScriptedCapability::failing("b", FailureKind::Validation).with_latency(Duration::from_millis(100)),
        );
        let c = Arc::new(ScriptedCapability::ok("c").with_latency(Duration::from_millis(200)));
        let env = env_with(vec![a, b, c], vec![]);

        let started = Instant::now();
        let result = ParallelExecutor
            .execute(&workflow(&["a", "b", "c"]), &mut ExecutionContext::new(), &env)
            .await;

        assert_eq!(result.status, ExecutionStatus::PartialSuccess);
        assert_eq!(result.invocations.len(), 3);
        // Wall time tracks the slowest branch, not the sum
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(300) && elapsed < Duration::from_millis(400));
        let order: Vec<&str> = result.invocations.iter().map(|i| i.capability.as_str()).collect();
        assert_eq!(order, vec!["b", "c", "a"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_limit_bounds_branches() {
        let caps: Vec<Arc<ScriptedCapability>> = ["a", "b", "c", "d"]
            .iter()
            .map(|n| Arc::new(ScriptedCapability::ok(n).with_latency(Duration::from_millis(100))))
            .collect();
        let mut env = env_with(caps, vec![]);
        env.config = ExecutionConfig {
            max_concurrency: 2,
            ..ExecutionConfig::default()
        };

        let started = Instant::now();
        let result = ParallelExecutor
            .execute(&workflow(&["a", "b", "c", "d"]), &mut ExecutionContext::new(), &env)
            .await;

        assert_eq!(result.status, ExecutionStatus::Completed);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(200) && elapsed < Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_all_failures_is_failed() {
        let a = Arc::new(ScriptedCapability::failing("a", FailureKind::Internal));
        let b = Arc::new(ScriptedCapability::failing("b", FailureKind::Authorization));
        let env = env_with(vec![a, b], vec![]);

        let result = ParallelExecutor
            .execute(&workflow(&["a", "b"]), &mut ExecutionContext::new(), &env)
            .await;
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.invocations.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forks_merge_in_completion_order() {
        let slow = Arc::new(
            ScriptedCapability::ok("slow")
                .with_latency(Duration::from_millis(200))
                .responding(|_, _, _| json!("slow")),
        );
        let fast = Arc::new(
            ScriptedCapability::ok("fast")
                .with_latency(Duration::from_millis(50))
                .responding(|_, _, _| json!("fast")),
        );
        let env = env_with(vec![slow, fast], vec![]);

        let mut wf = workflow(&[]);
        wf.steps = vec![
            CapabilityStep::required("slow").with_output_key("winner"),
            CapabilityStep::required("fast").with_output_key("winner"),
        ];

        let mut context = ExecutionContext::new();
        ParallelExecutor.execute(&wf, &mut context, &env).await;

        // The slow branch finished last, so its write wins
        assert_eq!(context.step_output("winner"), Some(&json!("slow")));
    }

    #[tokio::test]
    async fn test_branch_context_with_writes_forks_again_without_loss() {
        let a = Arc::new(ScriptedCapability::ok("a"));
        let b = Arc::new(ScriptedCapability::ok("b"));
        let env = env_with(vec![a, b], vec![]);

        let mut parent = ExecutionContext::new();
        let mut branch = parent.fork();
        branch.record_conversation("last_request", json!("rebalance"));
        ParallelExecutor
            .execute(&workflow(&["a", "b"]), &mut branch, &env)
            .await;
        parent.merge(branch);

        assert_eq!(
            parent.get(crate::context::Namespace::ConversationContext, "last_request"),
            Some(&json!("rebalance"))
        );
        assert!(parent.step_output("a").is_some());
        assert!(parent.step_output("b").is_some());
    }
}
