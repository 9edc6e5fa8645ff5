//! Workflow registry
//!
//! Catalog mapping a workflow id to its declared pattern, capability plan
//! and completion criteria. Definitions are validated on registration and
//! immutable afterwards; replacing an id swaps the `Arc` under one write lock.

pub mod catalog;

use crate::error::OrchestrationError;
use crate::models::{PatternType, WorkflowCategory, WorkflowDefinition};
use crate::Result;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

pub struct WorkflowRegistry {
    workflows: RwLock<HashMap<String, Arc<WorkflowDefinition>>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub total_workflows: usize,
    pub by_pattern: BTreeMap<String, usize>,
    pub by_category: BTreeMap<String, usize>,
}

/// Immutable snapshot of the registry handed to classifiers.
#[derive(Debug, Clone)]
pub struct RegistryView {
    workflows: Vec<Arc<WorkflowDefinition>>,
}

impl RegistryView {
    pub fn new(mut workflows: Vec<Arc<WorkflowDefinition>>) -> Self {
        workflows.sort_by(|a, b| a.workflow_id.cmp(&b.workflow_id));
        Self { workflows }
    }

    pub fn workflows(&self) -> &[Arc<WorkflowDefinition>] {
        &self.workflows
    }

    pub fn get(&self, workflow_id: &str) -> Option<&Arc<WorkflowDefinition>> {
        self.workflows.iter().find(|w| w.workflow_id == workflow_id)
    }
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self {
            workflows: RwLock::new(HashMap::new()),
        }
    }

    /// Registry preloaded with the default wealth-management catalog.
    pub fn with_default_catalog() -> Result<Self> {
        let registry = Self::new();
        for workflow in catalog::default_workflows() {
            registry.register(workflow)?;
        }
        Ok(registry)
    }

    /// Validate and insert; an existing id is replaced atomically.
    pub fn register(&self, workflow: WorkflowDefinition) -> Result<()> {
        validate(&workflow)?;

        let workflow_id = workflow.workflow_id.clone();
        let replaced = self
            .workflows
            .write()
            .insert(workflow_id.clone(), Arc::new(workflow))
            .is_some();

        debug!(workflow_id = %workflow_id, replaced, "Registered workflow");
        Ok(())
    }

    /// Register every definition in a JSON array file.
    pub fn load_json(&self, path: impl AsRef<Path>) -> Result<usize> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let definitions: Vec<WorkflowDefinition> = serde_json::from_str(&raw)?;

        // Validate the whole file before touching the registry
        for definition in &definitions {
            validate(definition)?;
        }

        let count = definitions.len();
        for definition in definitions {
            self.register(definition)?;
        }

        info!(path = %path.as_ref().display(), count, "Loaded workflow definitions");
        Ok(count)
    }

    pub fn get(&self, workflow_id: &str) -> Option<Arc<WorkflowDefinition>> {
        self.workflows.read().get(workflow_id).cloned()
    }

    pub fn contains(&self, workflow_id: &str) -> bool {
        self.workflows.read().contains_key(workflow_id)
    }

    pub fn len(&self) -> usize {
        self.workflows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.workflows.read().is_empty()
    }

    /// All workflows ordered by id.
    pub fn list(&self) -> Vec<Arc<WorkflowDefinition>> {
        self.view().workflows
    }

    pub fn by_pattern(&self, pattern: PatternType) -> Vec<Arc<WorkflowDefinition>> {
        self.filtered(|w| w.pattern == pattern)
    }

    pub fn by_category(&self, category: WorkflowCategory) -> Vec<Arc<WorkflowDefinition>> {
        self.filtered(|w| w.category == category)
    }

    /// Case-insensitive match on name, description and keywords.
    pub fn search(&self, query: &str) -> Vec<Arc<WorkflowDefinition>> {
        let query = query.trim().to_lowercase();
        if query.is_empty() {
            return Vec::new();
        }

        self.filtered(|w| {
            w.name.to_lowercase().contains(&query)
                || w.description.to_lowercase().contains(&query)
                || w.keywords.iter().any(|k| k.to_lowercase().contains(&query))
        })
    }

    pub fn stats(&self) -> RegistryStats {
        let workflows = self.workflows.read();
        let mut by_pattern = BTreeMap::new();
        let mut by_category = BTreeMap::new();

        for workflow in workflows.values() {
            *by_pattern.entry(workflow.pattern.to_string()).or_insert(0) += 1;
            let category = serde_json::to_value(workflow.category)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default();
            *by_category.entry(category).or_insert(0) += 1;
        }

        RegistryStats {
            total_workflows: workflows.len(),
            by_pattern,
            by_category,
        }
    }

    pub fn view(&self) -> RegistryView {
        RegistryView::new(self.workflows.read().values().cloned().collect())
    }

    fn filtered(&self, keep: impl Fn(&WorkflowDefinition) -> bool) -> Vec<Arc<WorkflowDefinition>> {
        self.view()
            .workflows
            .into_iter()
            .filter(|w| keep(w))
            .collect()
    }
}

impl Default for WorkflowRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn invalid(workflow: &WorkflowDefinition, reason: &str) -> OrchestrationError {
    OrchestrationError::InvalidWorkflow(format!("{}: {}", workflow.workflow_id, reason))
}

/// Structural checks per pattern.
pub fn validate(workflow: &WorkflowDefinition) -> Result<()> {
    if workflow.workflow_id.trim().is_empty() {
        return Err(OrchestrationError::InvalidWorkflow(
            "workflow_id must not be empty".to_string(),
        ));
    }

    if workflow.steps.iter().any(|s| s.capability.trim().is_empty()) {
        return Err(invalid(workflow, "step with empty capability name"));
    }

    if let Some(inner) = workflow.inner_pattern {
        if !matches!(inner, PatternType::Sequential | PatternType::Parallel) {
            return Err(invalid(workflow, "inner pattern must be sequential or parallel"));
        }
    }

    match workflow.pattern {
        PatternType::MasterOrchestration => {
            if workflow.stages.is_empty() || workflow.stages.iter().any(Vec::is_empty) {
                return Err(invalid(workflow, "master orchestration needs non-empty stages"));
            }
            if !workflow.steps.is_empty() {
                return Err(invalid(workflow, "master orchestration declares stages, not steps"));
            }
            if workflow.stages.iter().flatten().any(|id| *id == workflow.workflow_id) {
                return Err(invalid(workflow, "master orchestration cannot include itself"));
            }
            return Ok(());
        }
        PatternType::Loop => {
            if workflow.completion.is_none() {
                return Err(invalid(workflow, "loop requires a completion predicate"));
            }
            if workflow.max_iterations == Some(0) {
                return Err(invalid(workflow, "max_iterations must be at least 1"));
            }
        }
        PatternType::EventDriven => {
            if workflow.trigger.is_none() {
                return Err(invalid(workflow, "event-driven workflow requires a trigger"));
            }
        }
        PatternType::Scheduled => match &workflow.recurrence {
            None => return Err(invalid(workflow, "scheduled workflow requires a recurrence")),
            Some(r) if !r.is_valid() => return Err(invalid(workflow, "invalid recurrence")),
            Some(_) => {}
        },
        PatternType::Sequential | PatternType::Parallel => {}
    }

    if workflow.steps.is_empty() {
        return Err(invalid(workflow, "at least one step is required"));
    }

    Ok(())
}
