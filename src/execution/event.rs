//! Event-driven executor and dispatcher
//!
//! A workflow's trigger is evaluated against the event; on a match the
//! handler plan runs exactly once as a sequential or parallel
//! sub-execution. Non-matching events are a no-op.
//!
//! The dispatcher fans one event out to every registered event-driven
//! workflow whose trigger matches. Matches are independent: no
//! deduplication across workflows.

use super::{executor_for, fan_out, parallel, sequential, ExecutionEnv, PatternExecutor};
use crate::aggregator::combine_status;
use crate::conditions::Event;
use crate::context::{ExecutionContext, LAST_EVENT};
use crate::models::{ExecutionResult, ExecutionStatus, PatternType, WorkflowDefinition};
use futures::FutureExt;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info};

pub struct EventDrivenExecutor;

/// Run the handler plan with the workflow's declared inner shape.
pub(crate) async fn run_handler(
    workflow: &WorkflowDefinition,
    context: &mut ExecutionContext,
    env: &ExecutionEnv,
    result: &mut ExecutionResult,
) -> ExecutionStatus {
    match workflow.handler_pattern() {
        PatternType::Parallel => parallel::run_steps(workflow, context, env, result).await,
        _ => sequential::run_steps(workflow, context, env, result).await,
    }
}

#[async_trait::async_trait]
impl PatternExecutor for EventDrivenExecutor {
    fn pattern(&self) -> PatternType {
        PatternType::EventDriven
    }

    async fn execute(
        &self,
        workflow: &WorkflowDefinition,
        context: &mut ExecutionContext,
        env: &ExecutionEnv,
    ) -> ExecutionResult {
        let mut result = ExecutionResult::begin(&workflow.workflow_id, PatternType::EventDriven);

        let Some(trigger) = &workflow.trigger else {
            result.trace.push("event-driven workflow has no trigger".to_string());
            return result.finish(ExecutionStatus::Failed);
        };

        // Routed requests arrive as a `user_request` event
        let event = env
            .event
            .clone()
            .unwrap_or_else(|| Arc::new(Event::from_request(&env.request)));

        if !trigger.evaluate(&event) {
            debug!(workflow_id = %workflow.workflow_id, event_type = %event.event_type, "Trigger not matched");
            result.trace.push(format!(
                "event '{}' did not match the trigger; no action taken",
                event.event_type
            ));
            return result.finish(ExecutionStatus::Completed);
        }

        info!(
            workflow_id = %workflow.workflow_id,
            event_id = %event.event_id,
            event_type = %event.event_type,
            "Trigger matched, running handler"
        );
        result.trace.push(format!(
            "event '{}' matched the trigger; running {} handler",
            event.event_type,
            workflow.handler_pattern()
        ));
        let mut payload = event.payload.clone();
        if let Some(object) = payload.as_object_mut() {
            object
                .entry("event_type")
                .or_insert_with(|| json!(event.event_type));
            object
                .entry("event_id")
                .or_insert_with(|| json!(event.event_id));
        }
        context.record_conversation(LAST_EVENT, payload);

        let status = run_handler(workflow, context, env, &mut result).await;
        result.finish(status)
    }
}

pub struct EventDispatcher;

impl EventDispatcher {
    /// Registered event-driven workflows whose trigger matches the event.
    pub fn matching(event: &Event, env: &ExecutionEnv) -> Vec<Arc<WorkflowDefinition>> {
        env.registry
            .by_pattern(PatternType::EventDriven)
            .into_iter()
            .filter(|w| w.trigger.as_ref().is_some_and(|t| t.evaluate(event)))
            .collect()
    }

    /// Dispatch one event to every matching workflow concurrently.
    pub async fn dispatch(event: Event, context: &mut ExecutionContext, env: &ExecutionEnv) -> ExecutionResult {
        let mut result = ExecutionResult::begin(
            format!("event:{}", event.event_type),
            PatternType::EventDriven,
        );

        let matches = Self::matching(&event, env);
        let ids: Vec<&str> = matches.iter().map(|w| w.workflow_id.as_str()).collect();
        info!(event_type = %event.event_type, matched = ?ids, "Dispatching event");

        if matches.is_empty() {
            result
                .trace
                .push(format!("no workflow subscribed to event '{}'", event.event_type));
            return result.finish(ExecutionStatus::Completed);
        }
        result.trace.push(format!("dispatching to {}", ids.join(", ")));

        let scoped = env.for_event(event);
        let scoped = &scoped;
        let children = fan_out(matches, context, scoped.concurrency(), |workflow, mut fork| {
            async move {
                let child = executor_for(PatternType::EventDriven)
                    .execute(&workflow, &mut fork, scoped)
                    .await;
                (child, fork)
            }
            .boxed()
        })
        .await;

        let statuses: Vec<ExecutionStatus> = children.iter().map(|c| c.status).collect();
        result.children = children;
        result.finish(combine_status(&statuses))
    }
}
