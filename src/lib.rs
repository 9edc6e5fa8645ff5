//! Wealth Workflow Orchestrator
//!
//! Routes natural-language wealth-management requests to registered
//! workflows and runs them with one of six execution patterns:
//! sequential, parallel, loop, event-driven, scheduled and master
//! orchestration.
//!
//! REQUEST → CLASSIFY → {WORKFLOW | PLAN} → EXECUTE → AGGREGATE

pub mod agent;
pub mod aggregator;
pub mod api;
pub mod audit;
pub mod capabilities;
pub mod classifier;
pub mod conditions;
pub mod config;
pub mod context;
pub mod error;
pub mod execution;
pub mod models;
pub mod registry;
pub mod state;

#[cfg(test)]
mod testing;

pub use error::Result;

// Re-export common types
pub use agent::Orchestrator;
pub use classifier::{Classifier, KeywordClassifier};
pub use context::{ExecutionContext, Namespace};
pub use models::*;
