//! Main orchestrator
//!
//! REQUEST → CLASSIFY → {single workflow | decomposition} → EXECUTE → AUDIT
//!
//! Ambiguous or unmatched requests, unknown workflows and invalid plans end
//! the request with an error. Everything else comes back as an
//! `ExecutionResult`, whatever its status.

use crate::aggregator::{aggregate, OrchestrationResponse};
use crate::audit::{AuditLog, ExecutionRecord, ExecutorStats};
use crate::capabilities::http::register_financial_api;
use crate::capabilities::{create_default_registry, CapabilityInvoker};
use crate::classifier::{select_single, Classifier, KeywordClassifier};
use crate::conditions::Event;
use crate::config::EngineConfig;
use crate::context::{ExecutionContext, LAST_REQUEST, LAST_WORKFLOW};
use crate::error::OrchestrationError;
use crate::execution::master::{plan_for, run_plan, AD_HOC_PLAN_ID};
use crate::execution::{
    build_plan, execute_workflow, EventDispatcher, ExecutionConfig, ExecutionEnv, ScheduleHandle, Scheduler,
};
use crate::models::{ExecutionResult, PatternType};
use crate::registry::{RegistryStats, WorkflowRegistry};
use crate::state::{InMemorySessionStore, SessionStore};
use crate::Result;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct Orchestrator {
    classifier: Box<dyn Classifier>,
    registry: Arc<WorkflowRegistry>,
    env: ExecutionEnv,
    sessions: Box<dyn SessionStore>,
    audit_log: AuditLog,
}

impl Orchestrator {
    pub fn new(
        classifier: Box<dyn Classifier>,
        registry: Arc<WorkflowRegistry>,
        invoker: Arc<CapabilityInvoker>,
        config: ExecutionConfig,
        sessions: Box<dyn SessionStore>,
        audit_log: AuditLog,
    ) -> Self {
        let env = ExecutionEnv::new(invoker, registry.clone(), config);
        Self {
            classifier,
            registry,
            env,
            sessions,
            audit_log,
        }
    }

    /// Default catalog and built-in capabilities, adjusted by `config`.
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        let registry = WorkflowRegistry::with_default_catalog()?;
        if let Some(path) = &config.workflows_file {
            let loaded = registry.load_json(path)?;
            info!(path = %path.display(), loaded, "Loaded workflow definitions");
        }

        let mut capabilities = create_default_registry();
        if let Some(base_url) = &config.financial_api_base_url {
            let routed = register_financial_api(&mut capabilities, base_url)?;
            info!(%base_url, routed, "Routing capabilities to the financial API");
        }

        let invoker = CapabilityInvoker::new(
            Arc::new(capabilities),
            config.retry_policy(),
            config.capability_timeout,
        );

        Ok(Self::new(
            Box::new(KeywordClassifier::new(config.min_confidence)),
            Arc::new(registry),
            Arc::new(invoker),
            config.execution(),
            Box::new(InMemorySessionStore::new()),
            AuditLog::with_capacity(config.audit_capacity),
        ))
    }

    pub fn registry(&self) -> &WorkflowRegistry {
        &self.registry
    }

    pub fn audit_log(&self) -> &AuditLog {
        &self.audit_log
    }

    pub fn sessions(&self) -> &dyn SessionStore {
        self.sessions.as_ref()
    }

    /// Classify and execute one request against `context`.
    pub async fn run(&self, request: &str, context: &mut ExecutionContext) -> Result<ExecutionResult> {
        self.execute(None, request, context).await
    }

    /// `run`, folded into a single caller-facing response.
    pub async fn respond(&self, request: &str, context: &mut ExecutionContext) -> Result<OrchestrationResponse> {
        let result = self.run(request, context).await?;
        Ok(aggregate(&result))
    }

    /// `run` with the context carried across the turns of a session.
    pub async fn run_session(&self, session_id: &str, request: &str) -> Result<ExecutionResult> {
        let mut context = self.sessions.load(session_id).await?;
        let result = self.execute(Some(session_id), request, &mut context).await;
        // Routing errors leave nothing worth keeping
        if result.is_ok() {
            self.sessions.save(session_id, &context).await?;
        }
        result
    }

    async fn execute(
        &self,
        session_id: Option<&str>,
        request: &str,
        context: &mut ExecutionContext,
    ) -> Result<ExecutionResult> {
        info!(session_id = ?session_id, request = %request, "Received request");

        let env = self.env.for_request(request);
        let classification = self.classifier.classify(request, &self.registry.view())?;
        context.record_conversation(LAST_REQUEST, json!(request));

        let result = match classification.decomposition.as_ref().filter(|_| classification.requires_decomposition) {
            Some(decomposition) => {
                let plan = build_plan(AD_HOC_PLAN_ID, decomposition, &self.registry)?;
                info!(stages = ?plan.workflow_ids(), "Request decomposed into a plan");
                run_plan(&plan, context, &env).await
            }
            None => {
                let candidate = select_single(&classification, request)?;
                let workflow = self
                    .registry
                    .get(&candidate.workflow_id)
                    .ok_or_else(|| OrchestrationError::UnknownWorkflow(candidate.workflow_id.clone()))?;
                debug!(
                    workflow_id = %workflow.workflow_id,
                    confidence = candidate.confidence,
                    matched = ?candidate.matched_keywords,
                    "Routing to workflow"
                );
                if workflow.pattern == PatternType::MasterOrchestration {
                    let plan = plan_for(&workflow, &self.registry)?;
                    run_plan(&plan, context, &env).await
                } else {
                    execute_workflow(&workflow, context, &env).await
                }
            }
        };

        context.record_conversation(LAST_WORKFLOW, json!(result.workflow_id));
        self.audit(session_id, request, &result, context).await?;

        info!(
            workflow_id = %result.workflow_id,
            status = %result.status,
            duration_ms = result.duration_ms,
            "Request finished"
        );
        Ok(result)
    }

    /// Dispatch an external event to every subscribed workflow.
    pub async fn handle_event(&self, event: Event, context: &mut ExecutionContext) -> Result<ExecutionResult> {
        let label = format!("event {}", event.event_type);
        let result = EventDispatcher::dispatch(event, context, &self.env).await;
        self.audit(None, &label, &result, context).await?;
        Ok(result)
    }

    /// Start the recurring schedule of a registered scheduled workflow.
    pub fn schedule(
        &self,
        workflow_id: &str,
        context: ExecutionContext,
        max_firings: Option<u32>,
    ) -> Result<ScheduleHandle> {
        let workflow = self
            .registry
            .get(workflow_id)
            .ok_or_else(|| OrchestrationError::UnknownWorkflow(workflow_id.to_string()))?;
        Scheduler::schedule(workflow, context, self.env.clone(), max_firings)
    }

    /// Start every registered scheduled workflow, each with its own context.
    pub fn start_schedules(&self) -> Result<Vec<ScheduleHandle>> {
        self.registry
            .by_pattern(PatternType::Scheduled)
            .into_iter()
            .map(|workflow| Scheduler::schedule(workflow, ExecutionContext::new(), self.env.clone(), None))
            .collect()
    }

    pub async fn stats(&self) -> ExecutorStats {
        self.audit_log.stats().await
    }

    pub fn registry_stats(&self) -> RegistryStats {
        self.registry.stats()
    }

    async fn audit(
        &self,
        session_id: Option<&str>,
        request: &str,
        result: &ExecutionResult,
        context: &ExecutionContext,
    ) -> Result<()> {
        let record = ExecutionRecord::new(session_id, request, result, context);
        if result.status.is_failure() {
            warn!(workflow_id = %result.workflow_id, status = %result.status, "Recording failed execution");
        }
        self.audit_log.record(record).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Namespace;
    use crate::models::{ExecutionStatus, WorkflowCategory, WorkflowDefinition};
    use tokio_test::{assert_err, assert_ok};

    fn orchestrator() -> Orchestrator {
        Orchestrator::from_config(&EngineConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_single_workflow_request() {
        let orchestrator = orchestrator();
        let mut context = ExecutionContext::new();
        context.remember_account("WM123456");

        let result = assert_ok!(
            orchestrator
                .run("Prepare for my client meeting on Thursday", &mut context)
                .await
        );

        assert_eq!(result.workflow_id, "ADV001");
        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(result.invocations.len(), 4);
        assert_eq!(context.current_account(), Some("WM123456"));
        assert_eq!(
            context.get(Namespace::ConversationContext, LAST_WORKFLOW),
            Some(&json!("ADV001"))
        );
        assert_eq!(orchestrator.stats().await.total_executions, 1);
    }

    #[tokio::test]
    async fn test_risk_loop_converges() {
        let orchestrator = orchestrator();
        let result = orchestrator
            .run("Run a risk assessment and hedge the concentration", &mut ExecutionContext::new())
            .await
            .unwrap();

        assert_eq!(result.workflow_id, "ADV003");
        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(result.iterations, 3);
    }

    #[tokio::test]
    async fn test_sequenced_request_runs_as_plan() {
        let orchestrator = orchestrator();
        let response = orchestrator
            .respond(
                "Review performance against the benchmark then prepare the meeting agenda",
                &mut ExecutionContext::new(),
            )
            .await
            .unwrap();

        assert_eq!(response.workflow_id, AD_HOC_PLAN_ID);
        assert_eq!(response.pattern, PatternType::MasterOrchestration);
        let order: Vec<&str> = response.workflows.iter().map(|w| w.workflow_id.as_str()).collect();
        assert_eq!(order, vec!["ADV002", "ADV001"]);
        assert_eq!(response.status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn test_registered_master_workflow() {
        let orchestrator = orchestrator();
        let result = orchestrator
            .run("Time for the annual review", &mut ExecutionContext::new())
            .await
            .unwrap();

        assert_eq!(result.workflow_id, "MST001");
        assert_eq!(result.children.len(), 3);
        assert_eq!(result.children[2].workflow_id, "ADV001");
    }

    #[tokio::test]
    async fn test_master_with_missing_member_is_an_error() {
        let orchestrator = orchestrator();
        let master = WorkflowDefinition::new(
            "MST900",
            "Zebra Sweep",
            WorkflowCategory::Operations,
            PatternType::MasterOrchestration,
        )
        .with_keywords(&["zebra sweep"])
        .with_stage(&["ADV001"])
        .with_stage(&["ADV404"]);
        assert_ok!(orchestrator.registry().register(master));

        let err = assert_err!(
            orchestrator
                .run("kick off the zebra sweep", &mut ExecutionContext::new())
                .await
        );

        assert!(matches!(err, OrchestrationError::UnknownWorkflow(ref id) if id == "ADV404"));
        assert_eq!(orchestrator.stats().await.total_executions, 0);
    }

    #[tokio::test]
    async fn test_unmatched_request_asks_for_clarification() {
        let orchestrator = orchestrator();
        let err = assert_err!(
            orchestrator
                .run("what's the weather like", &mut ExecutionContext::new())
                .await
        );

        assert!(matches!(err, OrchestrationError::NoConfidentMatch { .. }));
        assert!(err.clarification().is_some());
        assert_eq!(orchestrator.stats().await.total_executions, 0);
    }

    #[tokio::test]
    async fn test_trade_without_quantity_fails_validation() {
        let orchestrator = orchestrator();
        let result = orchestrator
            .run("Place a trade order", &mut ExecutionContext::new())
            .await
            .unwrap();

        assert_eq!(result.workflow_id, "OPS002");
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.invocations.len(), 1);
        assert!(!result.invoked("order_execution"));
    }

    #[tokio::test]
    async fn test_market_event_reaches_volatility_workflow() {
        let orchestrator = orchestrator();
        let mut context = ExecutionContext::new();
        let result = orchestrator
            .handle_event(Event::new("market_update", json!({"vix": 42.0})), &mut context)
            .await
            .unwrap();

        let ids: Vec<&str> = result.children.iter().map(|c| c.workflow_id.as_str()).collect();
        assert_eq!(ids, vec!["ADV007"]);
        assert!(result.invoked("analyze_market_volatility"));
        assert_eq!(
            context.step_output("analyze_market_volatility").and_then(|v| v.get("level")),
            Some(&json!("extreme"))
        );
    }

    #[tokio::test]
    async fn test_session_context_carries_across_turns() {
        let orchestrator = orchestrator();
        orchestrator
            .run_session("s1", "Onboard a new client and open an account")
            .await
            .unwrap();
        let remembered = orchestrator.sessions().load("s1").await.unwrap();
        let account = remembered.current_account().map(str::to_string);
        assert!(account.is_some());

        orchestrator
            .run_session("s1", "Prepare for the client meeting")
            .await
            .unwrap();
        let after = orchestrator.sessions().load("s1").await.unwrap();
        assert_eq!(after.current_account().map(str::to_string), account);
        assert_eq!(orchestrator.audit_log().list_for_session("s1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_schedule_rejects_unknown_and_non_scheduled() {
        let orchestrator = orchestrator();
        assert!(matches!(
            orchestrator.schedule("NOPE", ExecutionContext::new(), Some(1)),
            Err(OrchestrationError::UnknownWorkflow(_))
        ));
        assert!(matches!(
            orchestrator.schedule("ADV001", ExecutionContext::new(), Some(1)),
            Err(OrchestrationError::InvalidWorkflow(_))
        ));
        let handle = orchestrator.schedule("ADV010", ExecutionContext::new(), Some(1)).unwrap();
        handle.cancel();
        assert!(handle.join().await.unwrap().firings.is_empty());
    }
}
