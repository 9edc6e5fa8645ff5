//! Declarative conditions: loop completion predicates, event triggers and
//! schedule recurrences.

use crate::context::{ExecutionContext, Namespace};
use crate::models::{lookup, CapabilityInvocation};
use chrono::{DateTime, Duration as ChronoDuration, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use uuid::Uuid;

fn as_number(value: Option<&Value>) -> Option<f64> {
    value.and_then(Value::as_f64)
}

//
// ================= Completion Predicate =================
//

/// Loop termination test, evaluated after every iteration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CompletionPredicate {
    OutputAtLeast {
        key: String,
        #[serde(default)]
        path: String,
        threshold: f64,
    },
    OutputAtMost {
        key: String,
        #[serde(default)]
        path: String,
        threshold: f64,
    },
    OutputEquals {
        key: String,
        #[serde(default)]
        path: String,
        value: Value,
    },
    AllStepsSucceeded,
    All {
        conditions: Vec<CompletionPredicate>,
    },
    Any {
        conditions: Vec<CompletionPredicate>,
    },
}

impl CompletionPredicate {
    pub fn output_at_least(key: &str, path: &str, threshold: f64) -> Self {
        Self::OutputAtLeast {
            key: key.to_string(),
            path: path.to_string(),
            threshold,
        }
    }

    pub fn output_at_most(key: &str, path: &str, threshold: f64) -> Self {
        Self::OutputAtMost {
            key: key.to_string(),
            path: path.to_string(),
            threshold,
        }
    }

    pub fn output_equals(key: &str, path: &str, value: Value) -> Self {
        Self::OutputEquals {
            key: key.to_string(),
            path: path.to_string(),
            value,
        }
    }

    /// `latest` holds only the invocations of the iteration just finished.
    pub fn evaluate(&self, context: &ExecutionContext, latest: &[CapabilityInvocation]) -> bool {
        let output = |key: &str, path: &str| {
            context
                .get(Namespace::StepOutputs, key)
                .and_then(|value| lookup(value, path))
        };

        match self {
            Self::OutputAtLeast { key, path, threshold } => {
                as_number(output(key, path)).is_some_and(|v| v >= *threshold)
            }
            Self::OutputAtMost { key, path, threshold } => {
                as_number(output(key, path)).is_some_and(|v| v <= *threshold)
            }
            Self::OutputEquals { key, path, value } => output(key, path) == Some(value),
            Self::AllStepsSucceeded => {
                !latest.is_empty() && latest.iter().all(CapabilityInvocation::succeeded)
            }
            Self::All { conditions } => conditions.iter().all(|c| c.evaluate(context, latest)),
            Self::Any { conditions } => conditions.iter().any(|c| c.evaluate(context, latest)),
        }
    }
}

//
// ================= Events =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_id: Uuid,
    pub event_type: String,
    #[serde(default)]
    pub payload: Value,
    pub occurred_at: DateTime<Utc>,
}

impl Event {
    pub const USER_REQUEST: &'static str = "user_request";

    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type: event_type.into(),
            payload,
            occurred_at: Utc::now(),
        }
    }

    /// Wrap a routed request so event-driven workflows can be run directly.
    pub fn from_request(request: &str) -> Self {
        Self::new(Self::USER_REQUEST, json!({ "text": request }))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerCondition {
    EventType { event_type: String },
    FieldAtLeast { path: String, threshold: f64 },
    FieldAtMost { path: String, threshold: f64 },
    FieldEquals { path: String, value: Value },
    TextContains { any: Vec<String> },
    All { conditions: Vec<TriggerCondition> },
    Any { conditions: Vec<TriggerCondition> },
}

impl TriggerCondition {
    pub fn event_type(event_type: &str) -> Self {
        Self::EventType {
            event_type: event_type.to_string(),
        }
    }

    pub fn field_at_least(path: &str, threshold: f64) -> Self {
        Self::FieldAtLeast {
            path: path.to_string(),
            threshold,
        }
    }

    pub fn text_contains(any: &[&str]) -> Self {
        Self::TextContains {
            any: any.iter().map(|s| s.to_lowercase()).collect(),
        }
    }

    pub fn evaluate(&self, event: &Event) -> bool {
        match self {
            Self::EventType { event_type } => event.event_type == *event_type,
            Self::FieldAtLeast { path, threshold } => {
                as_number(lookup(&event.payload, path)).is_some_and(|v| v >= *threshold)
            }
            Self::FieldAtMost { path, threshold } => {
                as_number(lookup(&event.payload, path)).is_some_and(|v| v <= *threshold)
            }
            Self::FieldEquals { path, value } => lookup(&event.payload, path) == Some(value),
            Self::TextContains { any } => {
                let text = event_text(event).to_lowercase();
                any.iter().any(|needle| text.contains(&needle.to_lowercase()))
            }
            Self::All { conditions } => conditions.iter().all(|c| c.evaluate(event)),
            Self::Any { conditions } => conditions.iter().any(|c| c.evaluate(event)),
        }
    }
}

/// Free text carried by an event: `payload.text`, else the whole payload.
fn event_text(event: &Event) -> String {
    match event.payload.get("text").and_then(Value::as_str) {
        Some(text) => text.to_string(),
        None => event.payload.to_string(),
    }
}

//
// ================= Recurrence =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Recurrence {
    Interval { period_ms: u64 },
    /// Wall-clock time of day in UTC
    DailyAt { hour: u32, minute: u32 },
}

impl Recurrence {
    pub fn every(period: Duration) -> Self {
        Self::Interval {
            period_ms: period.as_millis() as u64,
        }
    }

    pub fn is_valid(&self) -> bool {
        match self {
            Self::Interval { period_ms } => *period_ms > 0,
            Self::DailyAt { hour, minute } => *hour < 24 && *minute < 60,
        }
    }

    /// Wait until the first firing, measured from `now`.
    pub fn initial_delay(&self, now: DateTime<Utc>) -> Duration {
        match self {
            Self::Interval { period_ms } => Duration::from_millis(*period_ms),
            Self::DailyAt { .. } => self
                .next_after(now)
                .and_then(|next| (next - now).to_std().ok())
                .unwrap_or_default(),
        }
    }

    /// Fixed spacing between consecutive firings.
    pub fn period(&self) -> Duration {
        match self {
            Self::Interval { period_ms } => Duration::from_millis(*period_ms),
            Self::DailyAt { .. } => Duration::from_secs(24 * 60 * 60),
        }
    }

    /// Next wall-clock firing strictly after `now`.
    pub fn next_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Interval { period_ms } => {
                Some(now + ChronoDuration::milliseconds(i64::try_from(*period_ms).ok()?))
            }
            Self::DailyAt { hour, minute } => {
                let time = NaiveTime::from_hms_opt(*hour, *minute, 0)?;
                let today = now.date_naive().and_time(time).and_utc();
                if today > now {
                    Some(today)
                } else {
                    Some(today + ChronoDuration::days(1))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FailureKind, InvocationOutcome};
    use chrono::TimeZone;

    fn invocation(outcome: InvocationOutcome) -> CapabilityInvocation {
        let now = Utc::now();
        CapabilityInvocation {
            invocation_id: Uuid::new_v4(),
            capability: "analyze_portfolio_risk".to_string(),
            input: Value::Null,
            attempts: 1,
            iteration: Some(1),
            started_at: now,
            ended_at: now,
            duration_ms: 0,
            outcome,
        }
    }

    #[test]
    fn test_completion_threshold_reads_step_output() {
        let mut context = ExecutionContext::new();
        let predicate = CompletionPredicate::output_at_most("risk", "risk_score", 5.0);
        assert!(!predicate.evaluate(&context, &[]));

        context.record_step_output("risk", json!({"risk_score": 7.5}));
        assert!(!predicate.evaluate(&context, &[]));

        context.record_step_output("risk", json!({"risk_score": 4.0}));
        assert!(predicate.evaluate(&context, &[]));
    }

    #[test]
    fn test_all_steps_succeeded_uses_latest_iteration() {
        let context = ExecutionContext::new();
        let ok = invocation(InvocationOutcome::Success { value: json!({}) });
        let failed = invocation(InvocationOutcome::Failure {
            kind: FailureKind::Internal,
            message: "boom".to_string(),
        });

        assert!(CompletionPredicate::AllStepsSucceeded.evaluate(&context, &[ok.clone()]));
        assert!(!CompletionPredicate::AllStepsSucceeded.evaluate(&context, &[ok, failed]));
        assert!(!CompletionPredicate::AllStepsSucceeded.evaluate(&context, &[]));
    }

    #[test]
    fn test_trigger_conditions() {
        let event = Event::new("market_update", json!({"volatility": {"vix": 32.0}}));
        let trigger = TriggerCondition::All {
            conditions: vec![
                TriggerCondition::event_type("market_update"),
                TriggerCondition::field_at_least("volatility.vix", 30.0),
            ],
        };
        assert!(trigger.evaluate(&event));

        let calm = Event::new("market_update", json!({"volatility": {"vix": 14.0}}));
        assert!(!trigger.evaluate(&calm));

        let request = Event::from_request("The market is CRASHING, help");
        assert!(TriggerCondition::text_contains(&["crash"]).evaluate(&request));
    }

    #[test]
    fn test_daily_recurrence_rolls_over() {
        let recurrence = Recurrence::DailyAt { hour: 7, minute: 30 };
        let before = Utc.with_ymd_and_hms(2024, 3, 1, 6, 0, 0).unwrap();
        let after = Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap();

        assert_eq!(
            recurrence.next_after(before),
            Some(Utc.with_ymd_and_hms(2024, 3, 1, 7, 30, 0).unwrap())
        );
        assert_eq!(
            recurrence.next_after(after),
            Some(Utc.with_ymd_and_hms(2024, 3, 2, 7, 30, 0).unwrap())
        );
        assert_eq!(recurrence.initial_delay(before), Duration::from_secs(90 * 60));
        assert!(!Recurrence::DailyAt { hour: 24, minute: 0 }.is_valid());
        assert!(!Recurrence::Interval { period_ms: 0 }.is_valid());
    }
}
