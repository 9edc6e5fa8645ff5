//! Pattern executors
//!
//! One executor per `PatternType`, all behind the same `PatternExecutor`
//! contract. Dispatch is a `match` on the closed pattern enum.
//!
//! Executors never return `Err`: every outcome, including failures and
//! timeouts, is reported as an `ExecutionResult` carrying the full trace.

pub mod event;
pub mod looping;
pub mod master;
pub mod parallel;
pub mod scheduled;
pub mod sequential;

pub use event::{EventDispatcher, EventDrivenExecutor};
pub use looping::LoopExecutor;
pub use master::{build_plan, ExecutionPlan, MasterExecutor};
pub use parallel::ParallelExecutor;
pub use scheduled::{ScheduleHandle, ScheduleSummary, ScheduledExecutor, Scheduler};
pub use sequential::SequentialExecutor;

use crate::capabilities::CapabilityInvoker;
use crate::conditions::Event;
use crate::context::ExecutionContext;
use crate::models::{
    lookup, CapabilityInvocation, CapabilityStep, ExecutionResult, ExecutionStatus, InvocationOutcome,
    PatternType, WorkflowDefinition,
};
use crate::registry::WorkflowRegistry;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, warn};

pub const DEFAULT_MAX_CONCURRENCY: usize = 16;
pub const DEFAULT_LOOP_MAX_ITERATIONS: u32 = 5;

#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    /// Per-request bound on concurrently running branches
    pub max_concurrency: usize,
    /// Engine ceiling; workflows may lower it, never raise it
    pub loop_max_iterations: u32,
    pub request_deadline: Option<Duration>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            loop_max_iterations: DEFAULT_LOOP_MAX_ITERATIONS,
            request_deadline: Some(Duration::from_secs(120)),
        }
    }
}

/// Point after which no new step is dispatched.
#[derive(Debug, Clone, Copy, Default)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    pub fn none() -> Self {
        Self(None)
    }

    pub fn after(duration: Duration) -> Self {
        Self(Some(Instant::now() + duration))
    }

    pub fn is_elapsed(&self) -> bool {
        self.0.is_some_and(|at| Instant::now() >= at)
    }
}

/// Everything an executor needs besides the workflow and the context.
#[derive(Clone)]
pub struct ExecutionEnv {
    pub invoker: Arc<CapabilityInvoker>,
    pub registry: Arc<WorkflowRegistry>,
    pub config: ExecutionConfig,
    pub deadline: Deadline,
    pub request: Arc<str>,
    /// Event being handled, when the run was triggered by one
    pub event: Option<Arc<Event>>,
}

impl ExecutionEnv {
    pub fn new(invoker: Arc<CapabilityInvoker>, registry: Arc<WorkflowRegistry>, config: ExecutionConfig) -> Self {
        Self {
            invoker,
            registry,
            config,
            deadline: Deadline::none(),
            request: Arc::from(""),
            event: None,
        }
    }

    /// Copy scoped to one top-level request, with its own deadline.
    pub fn for_request(&self, request: &str) -> Self {
        Self {
            deadline: self
                .config
                .request_deadline
                .map_or(Deadline::none(), Deadline::after),
            request: Arc::from(request),
            event: None,
            ..self.clone()
        }
    }

    pub fn for_event(&self, event: Event) -> Self {
        let text = event
            .payload
            .get("text")
            .and_then(|v| v.as_str())
            .unwrap_or(event.event_type.as_str())
            .to_string();
        Self {
            event: Some(Arc::new(event)),
            ..self.for_request(&text)
        }
    }

    pub fn with_deadline(mut self, deadline: Deadline) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn concurrency(&self) -> usize {
        self.config.max_concurrency.max(1)
    }
}

/// Common contract for every execution strategy.
#[async_trait::async_trait]
pub trait PatternExecutor: Send + Sync {
    fn pattern(&self) -> PatternType;

    async fn execute(
        &self,
        workflow: &WorkflowDefinition,
        context: &mut ExecutionContext,
        env: &ExecutionEnv,
    ) -> ExecutionResult;
}

static SEQUENTIAL: SequentialExecutor = SequentialExecutor;
static PARALLEL: ParallelExecutor = ParallelExecutor;
static LOOP: LoopExecutor = LoopExecutor;
static EVENT_DRIVEN: EventDrivenExecutor = EventDrivenExecutor;
static SCHEDULED: ScheduledExecutor = ScheduledExecutor;
static MASTER: MasterExecutor = MasterExecutor;

pub fn executor_for(pattern: PatternType) -> &'static dyn PatternExecutor {
    match pattern {
        PatternType::Sequential => &SEQUENTIAL,
        PatternType::Parallel => &PARALLEL,
        PatternType::Loop => &LOOP,
        PatternType::EventDriven => &EVENT_DRIVEN,
        PatternType::Scheduled => &SCHEDULED,
        PatternType::MasterOrchestration => &MASTER,
    }
}

/// Run a workflow with the executor matching its declared pattern.
pub fn execute_workflow<'a>(
    workflow: &'a WorkflowDefinition,
    context: &'a mut ExecutionContext,
    env: &'a ExecutionEnv,
) -> BoxFuture<'a, ExecutionResult> {
    executor_for(workflow.pattern).execute(workflow, context, env)
}

// ================= Step helpers =================

/// Invoke one step and fold a successful output into the context.
pub(crate) async fn run_step(
    step: &CapabilityStep,
    context: &mut ExecutionContext,
    env: &ExecutionEnv,
    iteration: Option<u32>,
) -> CapabilityInvocation {
    let input = step.resolve_input(context, &env.request);
    let invocation = env
        .invoker
        .invoke(&step.capability, input, context, step.timeout(), iteration)
        .await;

    if let InvocationOutcome::Success { value } = &invocation.outcome {
        for field in &step.remember {
            let Some(remembered) = lookup(value, field) else {
                continue;
            };
            let key = field.rsplit('.').next().unwrap_or(field);
            match (key, remembered.as_str()) {
                ("account_id", Some(account)) => context.remember_account(account),
                _ => context.remember(key, remembered.clone()),
            }
        }
        context.record_step_output(step.output_key(), value.clone());
    }

    invocation
}

pub(crate) fn trace_line(invocation: &CapabilityInvocation) -> String {
    let prefix = match invocation.iteration {
        Some(iteration) => format!("[iteration {}] ", iteration),
        None => String::new(),
    };
    match &invocation.outcome {
        InvocationOutcome::Success { .. } => format!(
            "{}{} succeeded in {}ms ({} attempt(s))",
            prefix, invocation.capability, invocation.duration_ms, invocation.attempts
        ),
        InvocationOutcome::Failure { kind, message } => format!(
            "{}{} failed ({}): {}",
            prefix, invocation.capability, kind, message
        ),
    }
}

/// Outcome flags of an ordered step list.
#[derive(Debug, Default)]
pub(crate) struct SequenceOutcome {
    pub invocations: Vec<CapabilityInvocation>,
    pub required_failed: bool,
    pub optional_failed: bool,
    pub timed_out: bool,
}

impl SequenceOutcome {
    pub fn status(&self) -> ExecutionStatus {
        if self.timed_out {
            ExecutionStatus::TimedOut
        } else if self.required_failed {
            ExecutionStatus::Failed
        } else if self.optional_failed {
            ExecutionStatus::PartialSuccess
        } else {
            ExecutionStatus::Completed
        }
    }
}

/// Run steps strictly in order, stopping at the first required failure.
pub(crate) async fn run_sequence(
    steps: &[CapabilityStep],
    context: &mut ExecutionContext,
    env: &ExecutionEnv,
    iteration: Option<u32>,
    trace: &mut Vec<String>,
) -> SequenceOutcome {
    let mut outcome = SequenceOutcome::default();

    for (index, step) in steps.iter().enumerate() {
        if env.deadline.is_elapsed() {
            warn!(capability = %step.capability, "Request deadline elapsed, not dispatching");
            trace.push(format!(
                "deadline elapsed before {}; {} step(s) not dispatched",
                step.capability,
                steps.len() - index
            ));
            outcome.timed_out = true;
            break;
        }

        let invocation = run_step(step, context, env, iteration).await;
        trace.push(trace_line(&invocation));
        let succeeded = invocation.succeeded();
        outcome.invocations.push(invocation);

        if !succeeded {
            if step.required {
                debug!(capability = %step.capability, "Required step failed, halting sequence");
                trace.push(format!(
                    "halted after required step {}; {} step(s) skipped",
                    step.capability,
                    steps.len() - index - 1
                ));
                outcome.required_failed = true;
                break;
            }
            outcome.optional_failed = true;
        }
    }

    outcome
}

/// Run branches concurrently on forked contexts, bounded by `limit`.
///
/// Forks are merged back in completion order once every branch has
/// finished; results are returned in that same order.
pub(crate) async fn fan_out<'a, T, R, F>(
    items: Vec<T>,
    context: &mut ExecutionContext,
    limit: usize,
    branch: F,
) -> Vec<R>
where
    F: Fn(T, ExecutionContext) -> BoxFuture<'a, (R, ExecutionContext)>,
{
    let semaphore = Semaphore::new(limit.max(1));
    let semaphore = &semaphore;

    let mut pending: FuturesUnordered<_> = items
        .into_iter()
        .map(|item| {
            let branch_future = branch(item, context.fork());
            async move {
                // Local to this call and never closed, so acquiring cannot fail
                let _permit = semaphore.acquire().await;
                branch_future.await
            }
        })
        .collect();

    let mut finished = Vec::new();
    while let Some(done) = pending.next().await {
        finished.push(done);
    }
    drop(pending);

    let mut results = Vec::with_capacity(finished.len());
    for (result, fork) in finished {
        context.merge(fork);
        results.push(result);
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conditions::CompletionPredicate;
    use crate::context::Namespace;
    use crate::models::{InputSource, WorkflowCategory};
    use crate::testing::{env_with, ScriptedCapability};
    use serde_json::json;

    #[tokio::test]
    async fn test_dispatch_matches_declared_pattern() {
        for pattern in PatternType::ALL {
            assert_eq!(executor_for(pattern).pattern(), pattern);
        }

        let workflow = WorkflowDefinition::new("LP1", "loop", WorkflowCategory::Client, PatternType::Loop)
            .with_step(CapabilityStep::required("a"))
            .with_completion(CompletionPredicate::AllStepsSucceeded);
        let env = env_with(vec![Arc::new(ScriptedCapability::ok("a"))], vec![]);

        let result = execute_workflow(&workflow, &mut ExecutionContext::new(), &env).await;
        assert_eq!(result.pattern, PatternType::Loop);
        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(result.iterations, 1);
    }

    #[tokio::test]
    async fn test_run_step_records_output_and_remembers_fields() {
        let profile = Arc::new(
            ScriptedCapability::ok("create_client_profile")
                .responding(|_, _, _| json!({"account_id": "WM777", "profile": {"segment": "hnw"}})),
        );
        let env = env_with(vec![profile], vec![]);
        let step = CapabilityStep::required("create_client_profile")
            .with_output_key("profile")
            .remembering("account_id")
            .remembering("profile.segment");

        let mut context = ExecutionContext::new();
        let invocation = run_step(&step, &mut context, &env, None).await;

        assert!(invocation.succeeded());
        assert_eq!(context.current_account(), Some("WM777"));
        assert_eq!(context.get(Namespace::RememberedEntities, "segment"), Some(&json!("hnw")));
        assert_eq!(context.step_output("profile").unwrap()["account_id"], json!("WM777"));
    }

    #[tokio::test]
    async fn test_run_step_resolves_input_from_request() {
        let echo = Arc::new(ScriptedCapability::ok("echo").responding(|input, _, _| input.clone()));
        let env = env_with(vec![echo], vec![]).for_request("prepare for Monday");
        let step = CapabilityStep::required("echo").with_input("topic", InputSource::Request);

        let mut context = ExecutionContext::new();
        run_step(&step, &mut context, &env, None).await;
        assert_eq!(context.step_output("echo"), Some(&json!({"topic": "prepare for Monday"})));
    }

    #[tokio::test(start_paused = true)]
    async fn test_elapsed_deadline_dispatches_nothing() {
        let a = Arc::new(ScriptedCapability::ok("a"));
        let env = env_with(vec![a.clone()], vec![]).with_deadline(Deadline::after(Duration::ZERO));
        let steps = vec![CapabilityStep::required("a")];

        let mut trace = Vec::new();
        let outcome = run_sequence(&steps, &mut ExecutionContext::new(), &env, None, &mut trace).await;

        assert_eq!(outcome.status(), ExecutionStatus::TimedOut);
        assert_eq!(a.calls(), 0);
        assert!(trace[0].contains("deadline elapsed"));
    }
}
