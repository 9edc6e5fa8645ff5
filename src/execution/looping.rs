//! Loop executor
//!
//! Running → Running | Completed | MaxIterationsReached
//!
//! Each iteration runs the step list as a sequential sub-plan, then checks
//! the completion predicate. Invocation history accumulates across
//! iterations and is never replaced.

use super::{run_sequence, ExecutionEnv, PatternExecutor};
use crate::context::ExecutionContext;
use crate::models::{ExecutionResult, ExecutionStatus, PatternType, WorkflowDefinition};
use tracing::{debug, info};

pub struct LoopExecutor;

impl LoopExecutor {
    /// Iteration ceiling: the workflow may lower the engine's, never raise it.
    pub fn ceiling(workflow: &WorkflowDefinition, env: &ExecutionEnv) -> u32 {
        let engine = env.config.loop_max_iterations.max(1);
        workflow
            .max_iterations
            .map_or(engine, |declared| declared.clamp(1, engine))
    }
}

#[async_trait::async_trait]
impl PatternExecutor for LoopExecutor {
    fn pattern(&self) -> PatternType {
        PatternType::Loop
    }

    async fn execute(
        &self,
        workflow: &WorkflowDefinition,
        context: &mut ExecutionContext,
        env: &ExecutionEnv,
    ) -> ExecutionResult {
        let mut result = ExecutionResult::begin(&workflow.workflow_id, PatternType::Loop);

        let Some(predicate) = &workflow.completion else {
            result
                .trace
                .push("loop workflow has no completion predicate".to_string());
            return result.finish(ExecutionStatus::Failed);
        };

        let ceiling = Self::ceiling(workflow, env);
        debug!(workflow_id = %workflow.workflow_id, ceiling, "Starting loop execution");

        for iteration in 1..=ceiling {
            result.iterations = iteration;

            let outcome = run_sequence(
                &workflow.steps,
                context,
                env,
                Some(iteration),
                &mut result.trace,
            )
            .await;
            let satisfied = !outcome.required_failed
                && !outcome.timed_out
                && predicate.evaluate(context, &outcome.invocations);
            let status = outcome.status();
            result.invocations.extend(outcome.invocations);

            if matches!(status, ExecutionStatus::Failed | ExecutionStatus::TimedOut) {
                return result.finish(status);
            }

            if satisfied {
                result
                    .trace
                    .push(format!("completion criteria met after iteration {}", iteration));
                info!(workflow_id = %workflow.workflow_id, iteration, "Loop completed");
                return result.finish(ExecutionStatus::Completed);
            }

            debug!(workflow_id = %workflow.workflow_id, iteration, "Completion criteria not met");
        }

        result
            .trace
            .push(format!("stopped at the {}-iteration ceiling", ceiling));
        info!(workflow_id = %workflow.workflow_id, ceiling, "Loop reached max iterations");
        result.finish(ExecutionStatus::MaxIterationsReached)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conditions::CompletionPredicate;
    use crate::models::{CapabilityStep, FailureKind, WorkflowCategory};
    use crate::testing::{env_with, ScriptedCapability};
    use serde_json::json;
    use std::sync::Arc;

    fn loop_workflow(predicate: CompletionPredicate) -> WorkflowDefinition {
        WorkflowDefinition::new("LOOP1", "loop", WorkflowCategory::Client, PatternType::Loop)
            .with_step(CapabilityStep::required("measure"))
            .with_completion(predicate)
    }

    #[tokio::test]
    async fn test_never_satisfied_stops_at_ceiling() {
        let measure = Arc::new(ScriptedCapability::ok("measure").responding(|_, _, _| json!({"score": 1})));
        let env = env_with(vec![measure.clone()], vec![]);

        let wf = loop_workflow(CompletionPredicate::output_at_least("measure", "score", 10.0));
        let result = LoopExecutor.execute(&wf, &mut ExecutionContext::new(), &env).await;

        assert_eq!(result.status, ExecutionStatus::MaxIterationsReached);
        assert_eq!(result.iterations, 5);
        assert_eq!(measure.calls(), 5);
        let tags: Vec<Option<u32>> = result.invocations.iter().map(|i| i.iteration).collect();
        assert_eq!(tags, vec![Some(1), Some(2), Some(3), Some(4), Some(5)]);
    }

    #[tokio::test]
    async fn test_satisfied_on_second_iteration() {
        let measure = Arc::new(
            ScriptedCapability::ok("measure").responding(|_, _, call| json!({"score": call * 10})),
        );
        let env = env_with(vec![measure.clone()], vec![]);

        let wf = loop_workflow(CompletionPredicate::output_at_least("measure", "score", 20.0));
        let result = LoopExecutor.execute(&wf, &mut ExecutionContext::new(), &env).await;

        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(result.iterations, 2);
        assert_eq!(measure.calls(), 2);
    }

    #[tokio::test]
    async fn test_workflow_may_lower_but_not_raise_ceiling() {
        let measure = Arc::new(ScriptedCapability::ok("measure"));
        let env = env_with(vec![measure.clone()], vec![]);
        let never = CompletionPredicate::output_equals("measure", "call", json!(-1));

        let lowered = loop_workflow(never.clone()).with_max_iterations(2);
        assert_eq!(LoopExecutor::ceiling(&lowered, &env), 2);

        let raised = loop_workflow(never).with_max_iterations(50);
        let result = LoopExecutor.execute(&raised, &mut ExecutionContext::new(), &env).await;
        assert_eq!(result.iterations, 5);
        assert_eq!(result.status, ExecutionStatus::MaxIterationsReached);
    }

    #[tokio::test]
    async fn test_required_failure_fails_loop() {
        let measure = Arc::new(ScriptedCapability::ok("measure").failing_first(2, FailureKind::Validation));
        let env = env_with(vec![measure.clone()], vec![]);

        let wf = loop_workflow(CompletionPredicate::AllStepsSucceeded);
        let result = LoopExecutor.execute(&wf, &mut ExecutionContext::new(), &env).await;

        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.iterations, 1);
        assert_eq!(measure.calls(), 1);
    }
}
