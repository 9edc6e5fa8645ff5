//! Audit log and executor statistics
//!
//! Every orchestrated request leaves one `ExecutionRecord`. The log is
//! bounded: once full, the oldest record is evicted.

use crate::context::ExecutionContext;
use crate::models::{ExecutionResult, ExecutionStatus, PatternType};
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

pub const DEFAULT_AUDIT_CAPACITY: usize = 256;
const MOST_EXECUTED_LIMIT: usize = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub audit_id: Uuid,
    pub execution_id: Uuid,
    pub session_id: Option<String>,
    pub request: String,
    pub workflow_id: String,
    pub pattern: PatternType,
    pub status: ExecutionStatus,
    pub invocations: usize,
    pub failed_invocations: usize,
    /// SHA-256 of the context after the run
    pub context_fingerprint: String,
    pub duration_ms: u64,
    pub created_at: DateTime<Utc>,
}

impl ExecutionRecord {
    pub fn new(
        session_id: Option<&str>,
        request: &str,
        result: &ExecutionResult,
        context: &ExecutionContext,
    ) -> Self {
        let invocations = result.all_invocations();
        Self {
            audit_id: Uuid::new_v4(),
            execution_id: result.execution_id,
            session_id: session_id.map(str::to_string),
            request: request.to_string(),
            workflow_id: result.workflow_id.clone(),
            pattern: result.pattern,
            status: result.status,
            invocations: invocations.len(),
            failed_invocations: invocations.iter().filter(|(_, i)| !i.succeeded()).count(),
            context_fingerprint: context.fingerprint(),
            duration_ms: result.duration_ms,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowCount {
    pub workflow_id: String,
    pub executions: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutorStats {
    pub total_executions: usize,
    pub successful_executions: usize,
    pub failed_executions: usize,
    pub success_rate: f64,
    pub average_duration_ms: f64,
    pub most_executed_workflows: Vec<WorkflowCount>,
}

/// Audit trail storage
pub struct AuditLog {
    records: Arc<RwLock<VecDeque<ExecutionRecord>>>,
    capacity: usize,
}

impl AuditLog {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_AUDIT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: Arc::new(RwLock::new(VecDeque::new())),
            capacity: capacity.max(1),
        }
    }

    /// Store an execution record
    pub async fn record(&self, record: ExecutionRecord) -> Result<Uuid> {
        let audit_id = record.audit_id;
        let mut records = self.records.write().await;
        while records.len() >= self.capacity {
            records.pop_front();
        }
        records.push_back(record);
        Ok(audit_id)
    }

    /// Retrieve a record by audit ID
    pub async fn get(&self, audit_id: Uuid) -> Result<Option<ExecutionRecord>> {
        let records = self.records.read().await;
        Ok(records.iter().find(|r| r.audit_id == audit_id).cloned())
    }

    /// Records of one session, oldest first
    pub async fn list_for_session(&self, session_id: &str) -> Result<Vec<ExecutionRecord>> {
        let records = self.records.read().await;
        Ok(records
            .iter()
            .filter(|r| r.session_id.as_deref() == Some(session_id))
            .cloned()
            .collect())
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn stats(&self) -> ExecutorStats {
        let records = self.records.read().await;

        let total = records.len();
        let successful = records
            .iter()
            .filter(|r| r.status == ExecutionStatus::Completed)
            .count();
        let failed = records.iter().filter(|r| r.status.is_failure()).count();
        let average_duration_ms = if total == 0 {
            0.0
        } else {
            records.iter().map(|r| r.duration_ms as f64).sum::<f64>() / total as f64
        };

        let mut counts: HashMap<&str, usize> = HashMap::new();
        for record in records.iter() {
            *counts.entry(record.workflow_id.as_str()).or_default() += 1;
        }
        let mut most_executed: Vec<WorkflowCount> = counts
            .into_iter()
            .map(|(workflow_id, executions)| WorkflowCount {
                workflow_id: workflow_id.to_string(),
                executions,
            })
            .collect();
        // Ties broken by id to keep the ranking stable
        most_executed.sort_by(|a, b| {
            b.executions
                .cmp(&a.executions)
                .then_with(|| a.workflow_id.cmp(&b.workflow_id))
        });
        most_executed.truncate(MOST_EXECUTED_LIMIT);

        ExecutorStats {
            total_executions: total,
            successful_executions: successful,
            failed_executions: failed,
            success_rate: successful as f64 / total.max(1) as f64,
            average_duration_ms,
            most_executed_workflows: most_executed,
        }
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new()
    }
}
