//! Master orchestration
//!
//! Drives several workflows as one request. Stages run in order; the
//! members of a stage run concurrently on forked contexts, each with the
//! executor of its own pattern. A stage in which every member failed aborts
//! the remaining stages.

use super::{execute_workflow, fan_out, ExecutionEnv, PatternExecutor};
use crate::context::ExecutionContext;
use crate::error::OrchestrationError;
use crate::models::{DecompositionPlan, ExecutionResult, ExecutionStatus, PatternType, WorkflowDefinition};
use crate::registry::WorkflowRegistry;
use crate::Result;
use futures::FutureExt;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const AD_HOC_PLAN_ID: &str = "ad-hoc-orchestration";

/// Decomposition resolved against the registry.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    pub plan_id: String,
    pub stages: Vec<Vec<Arc<WorkflowDefinition>>>,
}

impl ExecutionPlan {
    pub fn workflow_ids(&self) -> Vec<Vec<&str>> {
        self.stages
            .iter()
            .map(|stage| stage.iter().map(|w| w.workflow_id.as_str()).collect())
            .collect()
    }
}

/// Resolve every workflow id of the decomposition up front.
pub fn build_plan(
    plan_id: impl Into<String>,
    decomposition: &DecompositionPlan,
    registry: &WorkflowRegistry,
) -> Result<ExecutionPlan> {
    let plan_id = plan_id.into();
    if decomposition.stages.is_empty() {
        return Err(OrchestrationError::InvalidPlan(format!("{} has no stages", plan_id)));
    }

    let mut stages = Vec::with_capacity(decomposition.stages.len());
    for (index, ids) in decomposition.stages.iter().enumerate() {
        if ids.is_empty() {
            return Err(OrchestrationError::InvalidPlan(format!(
                "{} stage {} is empty",
                plan_id,
                index + 1
            )));
        }

        let mut stage = Vec::with_capacity(ids.len());
        for id in ids {
            let workflow = registry
                .get(id)
                .ok_or_else(|| OrchestrationError::UnknownWorkflow(id.clone()))?;
            if workflow.pattern == PatternType::MasterOrchestration {
                return Err(OrchestrationError::InvalidPlan(format!(
                    "{} nests master workflow {}",
                    plan_id, id
                )));
            }
            stage.push(workflow);
        }
        stages.push(stage);
    }

    Ok(ExecutionPlan { plan_id, stages })
}

/// Plan of a registered master workflow, resolved from its declared stages.
pub fn plan_for(workflow: &WorkflowDefinition, registry: &WorkflowRegistry) -> Result<ExecutionPlan> {
    let decomposition = DecompositionPlan::new(workflow.stages.clone());
    build_plan(&workflow.workflow_id, &decomposition, registry)
}

/// Run a resolved plan stage by stage.
pub async fn run_plan(plan: &ExecutionPlan, context: &mut ExecutionContext, env: &ExecutionEnv) -> ExecutionResult {
    let mut result = ExecutionResult::begin(&plan.plan_id, PatternType::MasterOrchestration);
    let mut all_completed = true;

    info!(plan_id = %plan.plan_id, stages = plan.stages.len(), "Starting master orchestration");

    for (index, stage) in plan.stages.iter().enumerate() {
        let number = index + 1;

        if env.deadline.is_elapsed() {
            warn!(plan_id = %plan.plan_id, stage = number, "Request deadline elapsed, aborting plan");
            result.trace.push(format!(
                "deadline elapsed before stage {}; {} stage(s) not started",
                number,
                plan.stages.len() - index
            ));
            return result.finish(ExecutionStatus::TimedOut);
        }

        let ids: Vec<&str> = stage.iter().map(|w| w.workflow_id.as_str()).collect();
        debug!(plan_id = %plan.plan_id, stage = number, workflows = ?ids, "Starting stage");
        result.trace.push(format!("stage {}: {}", number, ids.join(", ")));

        let children = fan_out(stage.clone(), context, env.concurrency(), |workflow, mut fork| {
            async move {
                let child = execute_workflow(&workflow, &mut fork, env).await;
                (child, fork)
            }
            .boxed()
        })
        .await;

        for child in &children {
            result
                .trace
                .push(format!("stage {}: {} {}", number, child.workflow_id, child.status));
        }
        let stage_failed = children.iter().all(|c| c.status.is_failure());
        let any_timed_out = children.iter().any(|c| c.status == ExecutionStatus::TimedOut);
        all_completed &= children.iter().all(|c| c.status == ExecutionStatus::Completed);
        result.children.extend(children);

        if stage_failed {
            let remaining = plan.stages.len() - number;
            if any_timed_out || env.deadline.is_elapsed() {
                warn!(plan_id = %plan.plan_id, stage = number, remaining, "Request deadline elapsed during stage");
                result.trace.push(format!(
                    "stage {} timed out; {} later stage(s) aborted",
                    number, remaining
                ));
                return result.finish(ExecutionStatus::TimedOut);
            }
            warn!(plan_id = %plan.plan_id, stage = number, remaining, "Every workflow in stage failed");
            result.trace.push(format!(
                "stage {} failed; {} later stage(s) aborted",
                number, remaining
            ));
            return result.finish(ExecutionStatus::Failed);
        }
    }

    let status = if all_completed {
        ExecutionStatus::Completed
    } else {
        ExecutionStatus::PartialSuccess
    };
    info!(plan_id = %plan.plan_id, %status, "Master orchestration finished");
    result.finish(status)
}

pub struct MasterExecutor;

#[async_trait::async_trait]
impl PatternExecutor for MasterExecutor {
    fn pattern(&self) -> PatternType {
        PatternType::MasterOrchestration
    }

    async fn execute(
        &self,
        workflow: &WorkflowDefinition,
        context: &mut ExecutionContext,
        env: &ExecutionEnv,
    ) -> ExecutionResult {
        // The orchestrator resolves plans before dispatch; here a resolution
        // error can only be reported as a failed run
        match plan_for(workflow, &env.registry) {
            Ok(plan) => run_plan(&plan, context, env).await,
            Err(e) => {
                let mut result = ExecutionResult::begin(&workflow.workflow_id, PatternType::MasterOrchestration);
                result.trace.push(format!("could not build plan: {}", e));
                result.finish(ExecutionStatus::Failed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CapabilityStep, FailureKind, InputSource, WorkflowCategory};
    use crate::execution::Deadline;
    use crate::testing::{env_with, ScriptedCapability};
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::Instant;

    fn single(id: &str, capability: &str) -> WorkflowDefinition {
        WorkflowDefinition::new(id, id, WorkflowCategory::Advisor, PatternType::Sequential)
            .with_step(CapabilityStep::required(capability))
    }

    fn plan(stages: &[&[&str]]) -> DecompositionPlan {
        DecompositionPlan::new(
            stages
                .iter()
                .map(|stage| stage.iter().map(|id| id.to_string()).collect())
                .collect(),
        )
    }

    #[test]
    fn test_build_plan_rejects_unknown_and_nested() {
        let env = env_with(
            vec![],
            vec![
                single("W1", "a"),
                WorkflowDefinition::new("M1", "master", WorkflowCategory::Advisor, PatternType::MasterOrchestration)
                    .with_stage(&["W1"]),
            ],
        );

        let unknown = build_plan("p", &plan(&[&["W1"], &["W404"]]), &env.registry);
        assert!(matches!(unknown, Err(OrchestrationError::UnknownWorkflow(id)) if id == "W404"));

        let nested = build_plan("p", &plan(&[&["M1"]]), &env.registry);
        assert!(matches!(nested, Err(OrchestrationError::InvalidPlan(_))));

        let empty = build_plan("p", &plan(&[]), &env.registry);
        assert!(matches!(empty, Err(OrchestrationError::InvalidPlan(_))));

        let ok = build_plan("p", &plan(&[&["W1"]]), &env.registry).unwrap();
        assert_eq!(ok.workflow_ids(), vec![vec!["W1"]]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stage_members_run_concurrently_and_stages_in_order() {
        let a = Arc::new(ScriptedCapability::ok("a").with_latency(Duration::from_millis(200)));
        let b = Arc::new(ScriptedCapability::ok("b").with_latency(Duration::from_millis(100)));
        let c = Arc::new(ScriptedCapability::ok("c").with_latency(Duration::from_millis(50)));
        let env = env_with(
            vec![a.clone(), b.clone(), c.clone()],
            vec![single("W1", "a"), single("W2", "b"), single("W3", "c")],
        );

        let started = Instant::now();
        let plan = build_plan(AD_HOC_PLAN_ID, &plan(&[&["W1", "W2"], &["W3"]]), &env.registry).unwrap();
        let result = run_plan(&plan, &mut ExecutionContext::new(), &env).await;

        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(result.children.len(), 3);
        assert!(result.invocations.is_empty());

        let (a_span, b_span, c_span) = (a.spans()[0], b.spans()[0], c.spans()[0]);
        // W1 and W2 overlap; W3 starts after both ended
        assert!(b_span.0 < a_span.1 && a_span.0 < b_span.1);
        assert!(c_span.0 >= a_span.1 && c_span.0 >= b_span.1);
        assert!(started.elapsed() < Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_failed_stage_aborts_later_stages() {
        let a = Arc::new(ScriptedCapability::failing("a", FailureKind::Validation));
        let b = Arc::new(ScriptedCapability::failing("b", FailureKind::Internal));
        let c = Arc::new(ScriptedCapability::ok("c"));
        let env = env_with(
            vec![a, b, c.clone()],
            vec![single("W1", "a"), single("W2", "b"), single("W3", "c")],
        );

        let plan = build_plan("p", &plan(&[&["W1", "W2"], &["W3"]]), &env.registry).unwrap();
        let result = run_plan(&plan, &mut ExecutionContext::new(), &env).await;

        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(c.calls(), 0);
        assert!(result.trace.iter().any(|l| l.contains("1 later stage(s) aborted")));
    }

    #[tokio::test]
    async fn test_one_failed_member_is_partial_and_continues() {
        let a = Arc::new(ScriptedCapability::ok("a"));
        let b = Arc::new(ScriptedCapability::failing("b", FailureKind::Internal));
        let c = Arc::new(ScriptedCapability::ok("c"));
        let env = env_with(
            vec![a, b, c.clone()],
            vec![single("W1", "a"), single("W2", "b"), single("W3", "c")],
        );

        let plan = build_plan("p", &plan(&[&["W1", "W2"], &["W3"]]), &env.registry).unwrap();
        let result = run_plan(&plan, &mut ExecutionContext::new(), &env).await;

        assert_eq!(result.status, ExecutionStatus::PartialSuccess);
        assert_eq!(c.calls(), 1);
    }

    #[tokio::test]
    async fn test_later_stages_see_earlier_outputs() {
        let a = Arc::new(ScriptedCapability::ok("a").responding(|_, _, _| json!({"risk_score": 6.5})));
        let c = Arc::new(ScriptedCapability::ok("c").responding(|input, _, _| input.clone()));
        let reader = WorkflowDefinition::new("W3", "reader", WorkflowCategory::Advisor, PatternType::Sequential)
            .with_step(CapabilityStep::required("c").with_input("risk", InputSource::step_output("a", Some("risk_score"))));
        let master = WorkflowDefinition::new("M1", "master", WorkflowCategory::Advisor, PatternType::MasterOrchestration)
            .with_stage(&["W1"])
            .with_stage(&["W3"]);
        let env = env_with(vec![a, c], vec![single("W1", "a"), reader, master.clone()]);

        let mut context = ExecutionContext::new();
        let result = MasterExecutor.execute(&master, &mut context, &env).await;

        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(context.step_output("c"), Some(&json!({"risk": 6.5})));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_inside_stage_times_out_plan() {
        let a = Arc::new(ScriptedCapability::ok("a").with_latency(Duration::from_millis(200)));
        let b = Arc::new(ScriptedCapability::ok("b"));
        let c = Arc::new(ScriptedCapability::ok("c"));
        let slow = WorkflowDefinition::new("W1", "slow", WorkflowCategory::Advisor, PatternType::Sequential)
            .with_step(CapabilityStep::required("a"))
            .with_step(CapabilityStep::required("b"));
        let env = env_with(vec![a, b.clone(), c.clone()], vec![slow, single("W3", "c")])
            .with_deadline(Deadline::after(Duration::from_millis(100)));

        let plan = build_plan("p", &plan(&[&["W1"], &["W3"]]), &env.registry).unwrap();
        let result = run_plan(&plan, &mut ExecutionContext::new(), &env).await;

        assert_eq!(result.children[0].status, ExecutionStatus::TimedOut);
        assert_eq!(result.status, ExecutionStatus::TimedOut);
        assert_eq!(b.calls(), 0);
        assert_eq!(c.calls(), 0);
        assert!(result.trace.iter().any(|l| l.contains("stage 1 timed out")));
    }

    #[test]
    fn test_plan_for_reports_missing_stage_member() {
        let master = WorkflowDefinition::new("M1", "master", WorkflowCategory::Advisor, PatternType::MasterOrchestration)
            .with_stage(&["W1"])
            .with_stage(&["W2"]);
        let env = env_with(vec![], vec![single("W1", "a")]);

        let err = plan_for(&master, &env.registry).unwrap_err();
        assert!(matches!(err, OrchestrationError::UnknownWorkflow(id) if id == "W2"));
    }

    #[tokio::test]
    async fn test_parallel_member_keeps_stage_writes_after_parent_wrote() {
        let a = Arc::new(ScriptedCapability::ok("a"));
        let b = Arc::new(ScriptedCapability::ok("b"));
        let c = Arc::new(ScriptedCapability::ok("c"));
        let fan = WorkflowDefinition::new("W2", "fan", WorkflowCategory::Advisor, PatternType::Parallel)
            .with_step(CapabilityStep::required("b"))
            .with_step(CapabilityStep::required("c"));
        let env = env_with(vec![a, b, c], vec![single("W1", "a"), fan]);

        let mut context = ExecutionContext::new();
        context.remember_account("WM100001");
        let plan = build_plan("p", &plan(&[&["W1"], &["W2"]]), &env.registry).unwrap();
        let result = run_plan(&plan, &mut context, &env).await;

        assert_eq!(result.status, ExecutionStatus::Completed);
        for key in ["a", "b", "c"] {
            assert!(context.step_output(key).is_some(), "missing output of {}", key);
        }
        assert_eq!(context.current_account(), Some("WM100001"));
    }
}
