//! Engine configuration
//!
//! Read from the environment (after `.env` is loaded by the binaries).
//! Unset variables fall back to defaults; set but malformed ones are errors.

use crate::audit::DEFAULT_AUDIT_CAPACITY;
use crate::capabilities::RetryPolicy;
use crate::classifier::DEFAULT_MIN_CONFIDENCE;
use crate::error::OrchestrationError;
use crate::execution::{ExecutionConfig, DEFAULT_LOOP_MAX_ITERATIONS, DEFAULT_MAX_CONCURRENCY};
use crate::Result;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_REQUEST_DEADLINE_MS: u64 = 120_000;
pub const DEFAULT_CAPABILITY_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 200;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_concurrency: usize,
    pub loop_max_iterations: u32,
    pub request_deadline: Duration,
    pub capability_timeout: Duration,
    pub retry_attempts: u32,
    pub retry_delay: Duration,
    pub min_confidence: f32,
    pub audit_capacity: usize,
    /// Extra workflow definitions registered on top of the default catalog
    pub workflows_file: Option<PathBuf>,
    pub financial_api_base_url: Option<String>,
    pub port: u16,
    pub schedules_enabled: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            loop_max_iterations: DEFAULT_LOOP_MAX_ITERATIONS,
            request_deadline: Duration::from_millis(DEFAULT_REQUEST_DEADLINE_MS),
            capability_timeout: Duration::from_millis(DEFAULT_CAPABILITY_TIMEOUT_MS),
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
            min_confidence: DEFAULT_MIN_CONFIDENCE,
            audit_capacity: DEFAULT_AUDIT_CAPACITY,
            workflows_file: None,
            financial_api_base_url: None,
            port: DEFAULT_PORT,
            schedules_enabled: false,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; `from_env` passes the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let config = Self {
            max_concurrency: parse(&var, "ORCHESTRATOR_MAX_CONCURRENCY", defaults.max_concurrency)?,
            loop_max_iterations: parse(&var, "ORCHESTRATOR_LOOP_MAX_ITERATIONS", defaults.loop_max_iterations)?,
            request_deadline: Duration::from_millis(parse(
                &var,
                "ORCHESTRATOR_REQUEST_DEADLINE_MS",
                DEFAULT_REQUEST_DEADLINE_MS,
            )?),
            capability_timeout: Duration::from_millis(parse(
                &var,
                "ORCHESTRATOR_CAPABILITY_TIMEOUT_MS",
                DEFAULT_CAPABILITY_TIMEOUT_MS,
            )?),
            retry_attempts: parse(&var, "ORCHESTRATOR_RETRY_ATTEMPTS", defaults.retry_attempts)?,
            retry_delay: Duration::from_millis(parse(&var, "ORCHESTRATOR_RETRY_DELAY_MS", DEFAULT_RETRY_DELAY_MS)?),
            min_confidence: parse(&var, "ORCHESTRATOR_MIN_CONFIDENCE", defaults.min_confidence)?,
            audit_capacity: parse(&var, "ORCHESTRATOR_AUDIT_CAPACITY", defaults.audit_capacity)?,
            workflows_file: var("ORCHESTRATOR_WORKFLOWS_FILE").map(PathBuf::from),
            financial_api_base_url: var("FINANCIAL_API_BASE_URL"),
            port: match var("PORT") {
                Some(_) => parse(&var, "PORT", DEFAULT_PORT)?,
                None => parse(&var, "API_PORT", DEFAULT_PORT)?,
            },
            schedules_enabled: parse_flag(&var, "ORCHESTRATOR_SCHEDULES_ENABLED")?,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            return Err(OrchestrationError::Config(
                "ORCHESTRATOR_MAX_CONCURRENCY must be at least 1".to_string(),
            ));
        }
        if self.loop_max_iterations == 0 {
            return Err(OrchestrationError::Config(
                "ORCHESTRATOR_LOOP_MAX_ITERATIONS must be at least 1".to_string(),
            ));
        }
        if self.capability_timeout.is_zero() {
            return Err(OrchestrationError::Config(
                "ORCHESTRATOR_CAPABILITY_TIMEOUT_MS must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.min_confidence) {
            return Err(OrchestrationError::Config(format!(
                "ORCHESTRATOR_MIN_CONFIDENCE must be within 0..=1, got {}",
                self.min_confidence
            )));
        }
        Ok(())
    }

    pub fn execution(&self) -> ExecutionConfig {
        ExecutionConfig {
            max_concurrency: self.max_concurrency,
            loop_max_iterations: self.loop_max_iterations,
            request_deadline: Some(self.request_deadline),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_attempts, self.retry_delay)
    }
}

fn parse<T: FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match var(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| OrchestrationError::Config(format!("{}={:?}: {}", key, raw, e))),
    }
}

fn parse_flag(var: &impl Fn(&str) -> Option<String>, key: &str) -> Result<bool> {
    match var(key).map(|v| v.trim().to_ascii_lowercase()) {
        None => Ok(false),
        Some(v) => match v.as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(OrchestrationError::Config(format!("{}={:?} is not a boolean", key, v))),
        },
    }
}
