//! Scheduled executor and scheduler
//!
//! A routed request runs the handler once, immediately, and reports the
//! next scheduled instant. `Scheduler::schedule` starts the recurring loop:
//! the handler fires at or after each instant, never before. Instants that
//! pass while a handler is still running are skipped and counted, never
//! queued, so firings never overlap.

use super::event::run_handler;
use super::{ExecutionEnv, PatternExecutor};
use crate::context::ExecutionContext;
use crate::error::OrchestrationError;
use crate::models::{ExecutionResult, ExecutionStatus, PatternType, WorkflowDefinition};
use crate::Result;
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub struct ScheduledExecutor;

#[async_trait::async_trait]
impl PatternExecutor for ScheduledExecutor {
    fn pattern(&self) -> PatternType {
        PatternType::Scheduled
    }

    async fn execute(
        &self,
        workflow: &WorkflowDefinition,
        context: &mut ExecutionContext,
        env: &ExecutionEnv,
    ) -> ExecutionResult {
        let mut result = ExecutionResult::begin(&workflow.workflow_id, PatternType::Scheduled);

        let Some(recurrence) = &workflow.recurrence else {
            result.trace.push("scheduled workflow has no recurrence".to_string());
            return result.finish(ExecutionStatus::Failed);
        };

        result.trace.push("running scheduled handler on demand".to_string());
        let status = run_handler(workflow, context, env, &mut result).await;

        match recurrence.next_after(Utc::now()) {
            Some(next) => result
                .trace
                .push(format!("next scheduled run at {}", next.to_rfc3339())),
            None => result.trace.push("no further runs scheduled".to_string()),
        }

        result.finish(status)
    }
}

/// Firing results of a finished schedule.
#[derive(Debug, Default, Serialize)]
pub struct ScheduleSummary {
    pub workflow_id: String,
    pub firings: Vec<ExecutionResult>,
    /// Instants that passed while a handler was still running
    pub skipped: u32,
}

pub struct ScheduleHandle {
    workflow_id: String,
    cancel: watch::Sender<bool>,
    task: JoinHandle<ScheduleSummary>,
}

impl ScheduleHandle {
    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    /// Stop future firings. A handler already running is left to finish.
    pub fn cancel(&self) {
        let _ = self.cancel.send(true);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the schedule to stop and collect its firings.
    pub async fn join(self) -> Result<ScheduleSummary> {
        self.task
            .await
            .map_err(|e| OrchestrationError::TaskFailed(format!("schedule {}: {}", self.workflow_id, e)))
    }
}

pub struct Scheduler;

impl Scheduler {
    /// Start a recurring schedule for a scheduled workflow.
    ///
    /// The schedule owns `context`; every firing sees the writes of the
    /// previous ones. It stops on `cancel`, when the handle is dropped, or
    /// after `max_firings`.
    pub fn schedule(
        workflow: Arc<WorkflowDefinition>,
        mut context: ExecutionContext,
        env: ExecutionEnv,
        max_firings: Option<u32>,
    ) -> Result<ScheduleHandle> {
        if workflow.pattern != PatternType::Scheduled {
            return Err(OrchestrationError::InvalidWorkflow(format!(
                "{} is {}, not scheduled",
                workflow.workflow_id, workflow.pattern
            )));
        }
        let Some(recurrence) = workflow.recurrence.clone() else {
            return Err(OrchestrationError::InvalidWorkflow(format!(
                "{} has no recurrence",
                workflow.workflow_id
            )));
        };
        if !recurrence.is_valid() {
            return Err(OrchestrationError::InvalidWorkflow(format!(
                "{} has an invalid recurrence {:?}",
                workflow.workflow_id, recurrence
            )));
        }

        let (cancel, mut cancelled) = watch::channel(false);
        let workflow_id = workflow.workflow_id.clone();

        info!(workflow_id = %workflow_id, ?recurrence, ?max_firings, "Starting schedule");

        let task = tokio::spawn(async move {
            let period = recurrence.period();
            let mut next = Instant::now() + recurrence.initial_delay(Utc::now());
            let mut summary = ScheduleSummary {
                workflow_id: workflow.workflow_id.clone(),
                ..ScheduleSummary::default()
            };

            loop {
                if max_firings.is_some_and(|max| summary.firings.len() as u32 >= max) {
                    break;
                }

                tokio::select! {
                    _ = tokio::time::sleep_until(next) => {}
                    changed = cancelled.changed() => {
                        // Err means the handle was dropped
                        if changed.is_err() || *cancelled.borrow() {
                            break;
                        }
                        continue;
                    }
                }
                if *cancelled.borrow() {
                    break;
                }

                let firing = summary.firings.len() + 1;
                debug!(workflow_id = %workflow.workflow_id, firing, "Schedule firing");

                let scoped = env.for_request(&format!("scheduled run of {}", workflow.workflow_id));
                let mut result = ExecutionResult::begin(&workflow.workflow_id, PatternType::Scheduled);
                result.trace.push(format!("scheduled firing #{}", firing));
                let status = run_handler(&workflow, &mut context, &scoped, &mut result).await;
                summary.firings.push(result.finish(status));

                next += period;
                let now = Instant::now();
                while next <= now {
                    warn!(workflow_id = %workflow.workflow_id, "Handler overran its slot, skipping firing");
                    summary.skipped += 1;
                    next += period;
                }
            }

            info!(
                workflow_id = %summary.workflow_id,
                firings = summary.firings.len(),
                skipped = summary.skipped,
                "Schedule stopped"
            );
            summary
        });

        Ok(ScheduleHandle {
            workflow_id,
            cancel,
            task,
        })
    }
}
