//! Default wealth-management workflow catalog

use crate::conditions::{CompletionPredicate, Recurrence, TriggerCondition};
use crate::context::Namespace;
use crate::models::{CapabilityStep, InputSource, PatternType, WorkflowCategory, WorkflowDefinition};
use std::time::Duration;

const WEEK: Duration = Duration::from_secs(7 * 24 * 60 * 60);

fn step(capability: &str) -> CapabilityStep {
    CapabilityStep::required(capability)
}

fn from_step(key: &str, path: &str) -> InputSource {
    InputSource::step_output(key, Some(path))
}

pub fn default_workflows() -> Vec<WorkflowDefinition> {
    vec![
        client_meeting_preparation(),
        portfolio_performance_review(),
        risk_assessment(),
        client_onboarding(),
        market_volatility_response(),
        regulatory_compliance(),
        crisis_management(),
        tax_optimization(),
        goal_tracking(),
        trade_execution(),
        comprehensive_client_review(),
    ]
}

// ================= Advisor workflows =================

fn client_meeting_preparation() -> WorkflowDefinition {
    WorkflowDefinition::new(
        "ADV001",
        "Client Meeting Preparation and Follow-up",
        WorkflowCategory::Advisor,
        PatternType::Sequential,
    )
    .with_description("Agenda creation, portfolio briefing and post-meeting action items")
    .with_keywords(&["meeting", "client meeting", "prepare for", "agenda", "follow-up"])
    .with_step(step("get_portfolio_summary").remembering("account_id"))
    .with_step(step("generate_market_commentary"))
    .with_step(
        step("create_meeting_agenda")
            .with_input("commentary", InputSource::step_output("generate_market_commentary", None))
            .with_input("topic", InputSource::Request),
    )
    .with_step(
        CapabilityStep::optional("track_action_items")
            .with_input("agenda", from_step("create_meeting_agenda", "agenda")),
    )
}

fn portfolio_performance_review() -> WorkflowDefinition {
    WorkflowDefinition::new(
        "ADV002",
        "Portfolio Performance Review and Reporting",
        WorkflowCategory::Advisor,
        PatternType::Sequential,
    )
    .with_description("Performance against benchmarks with a client-ready report")
    .with_keywords(&["performance", "performance review", "benchmark", "returns", "quarterly report"])
    .with_step(step("calculate_performance_metrics"))
    .with_step(
        step("benchmark_comparison")
            .with_input("return_pct", from_step("calculate_performance_metrics", "return_pct")),
    )
    .with_step(
        step("create_performance_report")
            .with_input("excess_return_pct", from_step("benchmark_comparison", "excess_return_pct")),
    )
}

fn risk_assessment() -> WorkflowDefinition {
    WorkflowDefinition::new(
        "ADV003",
        "Risk Assessment and Management",
        WorkflowCategory::Advisor,
        PatternType::Loop,
    )
    .with_description("Iterative risk reduction until the portfolio is within tolerance")
    .with_keywords(&["risk", "risk assessment", "hedge", "concentration", "stress test"])
    .with_step(step("assess_portfolio_risk"))
    .with_step(step("hedging_recommendations"))
    .with_completion(CompletionPredicate::output_at_most(
        "assess_portfolio_risk",
        "risk_score",
        5.0,
    ))
    .with_max_iterations(5)
}

fn client_onboarding() -> WorkflowDefinition {
    WorkflowDefinition::new(
        "ADV005",
        "Client Acquisition and Onboarding",
        WorkflowCategory::Advisor,
        PatternType::Parallel,
    )
    .with_description("KYC, risk profiling, goal setting and profile creation for a new client")
    .with_keywords(&["onboard", "new client", "prospect", "kyc", "open an account"])
    .with_step(
        step("collect_kyc_information")
            .with_input("client_name", InputSource::context(Namespace::ConversationContext, "client_name")),
    )
    .with_step(step("assess_risk_tolerance"))
    .with_step(step("set_investment_goals"))
    .with_step(
        step("create_client_profile")
            .with_input("client_name", InputSource::context(Namespace::ConversationContext, "client_name"))
            .remembering("account_id"),
    )
}

fn market_volatility_response() -> WorkflowDefinition {
    WorkflowDefinition::new(
        "ADV007",
        "Market Volatility Response",
        WorkflowCategory::Advisor,
        PatternType::EventDriven,
    )
    .with_description("Impact assessment and proactive outreach when volatility spikes")
    .with_keywords(&["volatility", "vix", "market drop", "market decline", "sell-off"])
    .with_trigger(TriggerCondition::Any {
        conditions: vec![
            TriggerCondition::All {
                conditions: vec![
                    TriggerCondition::event_type("market_update"),
                    TriggerCondition::field_at_least("vix", 30.0),
                ],
            },
            TriggerCondition::All {
                conditions: vec![
                    TriggerCondition::event_type(crate::conditions::Event::USER_REQUEST),
                    TriggerCondition::text_contains(&["volatil", "vix", "market drop", "sell-off"]),
                ],
            },
        ],
    })
    .with_step(step("analyze_market_volatility").with_input("vix", InputSource::event("vix")))
    .with_step(step("assess_portfolio_impact"))
    .with_step(step("generate_market_commentary").with_input("vix", InputSource::event("vix")))
    .with_step(CapabilityStep::optional("trigger_proactive_outreach"))
}

fn regulatory_compliance() -> WorkflowDefinition {
    WorkflowDefinition::new(
        "ADV008",
        "Regulatory Compliance Management",
        WorkflowCategory::Advisor,
        PatternType::Scheduled,
    )
    .with_description("Daily regulatory monitoring, fiduciary review and AML screening")
    .with_keywords(&["compliance", "regulatory", "aml", "fiduciary", "audit"])
    .with_recurrence(Recurrence::DailyAt { hour: 6, minute: 0 })
    .with_inner_pattern(PatternType::Parallel)
    .with_step(step("monitor_regulatory_changes"))
    .with_step(step("assess_fiduciary_compliance"))
    .with_step(step("conduct_aml_screening"))
}

fn crisis_management() -> WorkflowDefinition {
    WorkflowDefinition::new(
        "ADV009",
        "Crisis Management and Communication",
        WorkflowCategory::Advisor,
        PatternType::EventDriven,
    )
    .with_description("Emergency protocol, scenario analysis and client crisis communication")
    .with_keywords(&["crisis", "crash", "emergency", "panic"])
    .with_trigger(TriggerCondition::Any {
        conditions: vec![
            TriggerCondition::event_type("market_crash"),
            TriggerCondition::All {
                conditions: vec![
                    TriggerCondition::event_type(crate::conditions::Event::USER_REQUEST),
                    TriggerCondition::text_contains(&["crisis", "crash", "emergency", "panic"]),
                ],
            },
        ],
    })
    .with_step(step("initiate_emergency_protocol"))
    .with_step(step("prepare_scenario_analysis"))
    .with_step(step("crisis_communication"))
    .with_step(CapabilityStep::optional("provide_behavioral_coaching"))
}

fn tax_optimization() -> WorkflowDefinition {
    WorkflowDefinition::new(
        "ADV010",
        "Tax Optimization and Planning",
        WorkflowCategory::Advisor,
        PatternType::Scheduled,
    )
    .with_description("Weekly tax savings review and loss-harvesting candidates")
    .with_keywords(&["tax", "tax-loss", "harvest", "tax optimization"])
    .with_recurrence(Recurrence::every(WEEK))
    .with_step(step("calculate_tax_optimization"))
    .with_step(step("tax_loss_harvesting"))
}

// ================= Client workflows =================

fn goal_tracking() -> WorkflowDefinition {
    WorkflowDefinition::new(
        "CLI002",
        "Investment Goal Setting and Tracking",
        WorkflowCategory::Client,
        PatternType::Loop,
    )
    .with_description("Adjust the savings plan until the goal projection is on track")
    .with_keywords(&["goal", "retirement", "savings plan", "on track"])
    .with_step(step("set_investment_goals"))
    .with_step(step("project_goal_timeline"))
    .with_step(step("suggest_goal_adjustments"))
    .with_completion(CompletionPredicate::output_at_least(
        "project_goal_timeline",
        "success_probability",
        0.8,
    ))
    .with_max_iterations(4)
}

// ================= Operations workflows =================

fn trade_execution() -> WorkflowDefinition {
    WorkflowDefinition::new(
        "OPS002",
        "Trade Execution and Settlement",
        WorkflowCategory::Operations,
        PatternType::Sequential,
    )
    .with_description("Order validation, execution, settlement and confirmation")
    .with_keywords(&["trade", "order", "settlement", "buy", "sell"])
    .with_step(
        step("trade_validation")
            .with_input("quantity", InputSource::context(Namespace::ConversationContext, "order_quantity")),
    )
    .with_step(step("order_execution").with_input("order_id", from_step("trade_validation", "order_id")))
    .with_step(
        step("settlement_processing")
            .with_input("order_id", from_step("order_execution", "order_id")),
    )
    .with_step(CapabilityStep::optional("confirmation_generation"))
}

// ================= Orchestrations =================

fn comprehensive_client_review() -> WorkflowDefinition {
    WorkflowDefinition::new(
        "MST001",
        "Comprehensive Client Review",
        WorkflowCategory::Advisor,
        PatternType::MasterOrchestration,
    )
    .with_description("Performance and risk analysis in parallel, then meeting preparation")
    .with_keywords(&["full client review", "annual review", "complete review"])
    .with_stage(&["ADV002", "ADV003"])
    .with_stage(&["ADV001"])
}
