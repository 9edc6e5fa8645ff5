//! In-process wealth-management capabilities
//!
//! Deterministic stand-ins for the CRM, custodian, market data, compliance
//! and communication services. Outputs depend only on the input and the
//! execution context, so repeated runs produce the same reports.

use super::{Capability, CapabilityError, CapabilityRegistry};
use crate::context::ExecutionContext;
use serde_json::{json, Value};
use std::sync::Arc;

type Handler = fn(&Value, &ExecutionContext) -> Result<Value, CapabilityError>;

const HOUSE_ACCOUNT: &str = "WM000000";

/// Capability backed by a plain function.
pub struct MockCapability {
    name: &'static str,
    description: &'static str,
    required: Vec<String>,
    handler: Handler,
}

impl MockCapability {
    pub fn new(name: &'static str, description: &'static str, handler: Handler) -> Self {
        Self {
            name,
            description,
            required: Vec::new(),
            handler,
        }
    }

    pub fn requiring(mut self, fields: &[&str]) -> Self {
        self.required = fields.iter().map(|f| f.to_string()).collect();
        self
    }
}

#[async_trait::async_trait]
impl Capability for MockCapability {
    fn name(&self) -> &str {
        self.name
    }

    fn description(&self) -> &str {
        self.description
    }

    fn required_fields(&self) -> &[String] {
        &self.required
    }

    async fn invoke(&self, input: &Value, context: &ExecutionContext) -> Result<Value, CapabilityError> {
        (self.handler)(input, context)
    }
}

// ================= Helpers =================

fn account_of<'a>(input: &'a Value, context: &'a ExecutionContext) -> &'a str {
    input
        .get("account_id")
        .and_then(Value::as_str)
        .or_else(|| context.current_account())
        .unwrap_or(HOUSE_ACCOUNT)
}

/// Stable pseudo-random number in [0, 1) derived from an account id.
fn seed(account_id: &str) -> f64 {
    let sum: u32 = account_id.bytes().map(u32::from).sum();
    f64::from(sum % 100) / 100.0
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Round counter stored by an earlier iteration of the same loop.
fn previous_round(context: &ExecutionContext, key: &str) -> u64 {
    context
        .step_output(key)
        .and_then(|v| v.get("round"))
        .and_then(Value::as_u64)
        .unwrap_or(0)
}

// ================= Portfolio & meetings =================

fn get_portfolio_summary(input: &Value, context: &ExecutionContext) -> Result<Value, CapabilityError> {
    let account_id = account_of(input, context);
    let s = seed(account_id);
    let total = round2(250_000.0 + s * 1_750_000.0);
    Ok(json!({
        "account_id": account_id,
        "total_value": total,
        "holdings_count": 12 + (s * 30.0) as u64,
        "allocation": {
            "equities": round2(0.45 + s * 0.2),
            "fixed_income": round2(0.40 - s * 0.15),
            "cash": round2(0.15 - s * 0.05),
        },
        "ytd_return_pct": round2(3.5 + s * 6.0),
    }))
}

fn generate_market_commentary(input: &Value, _context: &ExecutionContext) -> Result<Value, CapabilityError> {
    let tone = match input.get("vix").and_then(Value::as_f64) {
        Some(vix) if vix >= 30.0 => "cautious",
        Some(_) => "constructive",
        None => "balanced",
    };
    Ok(json!({
        "tone": tone,
        "headline": format!("Markets update: {} outlook for the coming quarter", tone),
        "talking_points": [
            "Diversification continues to cushion drawdowns",
            "Rates remain the primary driver of fixed income returns",
        ],
    }))
}

fn create_meeting_agenda(input: &Value, context: &ExecutionContext) -> Result<Value, CapabilityError> {
    let account_id = account_of(input, context);
    let mut items = vec![
        "Portfolio performance review".to_string(),
        "Market outlook".to_string(),
    ];
    if let Some(headline) = input.get("commentary").and_then(|c| c.get("headline")).and_then(Value::as_str) {
        items.push(format!("Discuss: {}", headline));
    }
    if let Some(topic) = input.get("topic").and_then(Value::as_str) {
        items.push(format!("Client question: {}", topic));
    }
    items.push("Action items and next steps".to_string());
    Ok(json!({ "account_id": account_id, "agenda": items, "duration_minutes": 45 }))
}

fn track_action_items(input: &Value, context: &ExecutionContext) -> Result<Value, CapabilityError> {
    let agenda_len = input
        .get("agenda")
        .and_then(Value::as_array)
        .map_or(0, Vec::len);
    Ok(json!({
        "account_id": account_of(input, context),
        "open_items": agenda_len,
        "follow_up_in_days": 14,
    }))
}

// ================= Performance =================

fn calculate_performance_metrics(input: &Value, context: &ExecutionContext) -> Result<Value, CapabilityError> {
    let account_id = account_of(input, context);
    let s = seed(account_id);
    Ok(json!({
        "account_id": account_id,
        "return_pct": round2(4.0 + s * 8.0),
        "volatility_pct": round2(8.0 + s * 6.0),
        "sharpe_ratio": round2(0.6 + s),
    }))
}

fn benchmark_comparison(input: &Value, _context: &ExecutionContext) -> Result<Value, CapabilityError> {
    let portfolio = input.get("return_pct").and_then(Value::as_f64).unwrap_or(0.0);
    let benchmark = 7.2;
    Ok(json!({
        "benchmark": "60/40 balanced index",
        "benchmark_return_pct": benchmark,
        "excess_return_pct": round2(portfolio - benchmark),
    }))
}

fn create_performance_report(input: &Value, context: &ExecutionContext) -> Result<Value, CapabilityError> {
    let excess = input.get("excess_return_pct").and_then(Value::as_f64).unwrap_or(0.0);
    let verdict = if excess >= 0.0 { "outperformed" } else { "underperformed" };
    Ok(json!({
        "account_id": account_of(input, context),
        "summary": format!("Portfolio {} its benchmark by {:.2}%", verdict, excess.abs()),
        "sections": ["returns", "attribution", "benchmark", "outlook"],
    }))
}

// ================= Risk =================

fn assess_portfolio_risk(input: &Value, context: &ExecutionContext) -> Result<Value, CapabilityError> {
    let hedges = previous_round(context, "hedging_recommendations") as f64;
    let score = (7.5 - 1.5 * hedges).max(1.0);
    Ok(json!({
        "account_id": account_of(input, context),
        "risk_score": score,
        "concentration_flags": if score > 5.0 { json!(["technology > 30%"]) } else { json!([]) },
    }))
}

fn hedging_recommendations(input: &Value, context: &ExecutionContext) -> Result<Value, CapabilityError> {
    let round = previous_round(context, "hedging_recommendations") + 1;
    Ok(json!({
        "account_id": account_of(input, context),
        "round": round,
        "recommendation": format!("Trim concentrated positions, tranche {}", round),
    }))
}

// ================= Onboarding =================

fn collect_kyc_information(input: &Value, _context: &ExecutionContext) -> Result<Value, CapabilityError> {
    let name = input.get("client_name").and_then(Value::as_str).unwrap_or("Prospective Client");
    Ok(json!({ "client_name": name, "kyc_status": "verified", "documents": ["id", "proof_of_address"] }))
}

fn assess_risk_tolerance(_input: &Value, context: &ExecutionContext) -> Result<Value, CapabilityError> {
    let tolerance = context
        .preference("risk_tolerance")
        .and_then(Value::as_str)
        .unwrap_or("moderate")
        .to_string();
    Ok(json!({ "risk_tolerance": tolerance, "questionnaire_score": 62 }))
}

fn create_client_profile(input: &Value, _context: &ExecutionContext) -> Result<Value, CapabilityError> {
    let name = input.get("client_name").and_then(Value::as_str).unwrap_or("Prospective Client");
    let account_id = format!("WM{:06}", name.bytes().map(u32::from).sum::<u32>() * 37 % 1_000_000);
    Ok(json!({ "client_name": name, "account_id": account_id, "segment": "mass_affluent" }))
}

// ================= Goals =================

fn set_investment_goals(input: &Value, context: &ExecutionContext) -> Result<Value, CapabilityError> {
    let target = input.get("target_amount").and_then(Value::as_f64).unwrap_or(1_000_000.0);
    Ok(json!({
        "account_id": account_of(input, context),
        "goals": [{ "name": "retirement", "target_amount": target, "horizon_years": 20 }],
    }))
}

fn project_goal_timeline(_input: &Value, context: &ExecutionContext) -> Result<Value, CapabilityError> {
    let adjustments = previous_round(context, "suggest_goal_adjustments") as f64;
    let probability = round2((0.6 + 0.2 * adjustments).min(0.99));
    Ok(json!({ "success_probability": probability, "projected_years": 20 }))
}

fn suggest_goal_adjustments(_input: &Value, context: &ExecutionContext) -> Result<Value, CapabilityError> {
    let round = previous_round(context, "suggest_goal_adjustments") + 1;
    Ok(json!({
        "round": round,
        "suggestion": format!("Increase monthly contribution by {}%", round * 5),
    }))
}

// ================= Market events =================

fn analyze_market_volatility(input: &Value, _context: &ExecutionContext) -> Result<Value, CapabilityError> {
    let vix = input.get("vix").and_then(Value::as_f64).unwrap_or(24.0);
    let level = match vix {
        v if v >= 40.0 => "extreme",
        v if v >= 30.0 => "elevated",
        _ => "normal",
    };
    Ok(json!({ "vix": vix, "level": level }))
}

fn assess_portfolio_impact(input: &Value, context: &ExecutionContext) -> Result<Value, CapabilityError> {
    let account_id = account_of(input, context);
    let drawdown = round2(2.0 + seed(account_id) * 6.0);
    Ok(json!({ "account_id": account_id, "estimated_drawdown_pct": drawdown }))
}

fn trigger_proactive_outreach(input: &Value, context: &ExecutionContext) -> Result<Value, CapabilityError> {
    Ok(json!({
        "account_id": account_of(input, context),
        "channel": context.preference("contact_channel").cloned().unwrap_or(json!("email")),
        "queued": true,
    }))
}

fn initiate_emergency_protocol(_input: &Value, _context: &ExecutionContext) -> Result<Value, CapabilityError> {
    Ok(json!({ "protocol": "market-crisis-level-2", "war_room": true }))
}

fn prepare_scenario_analysis(input: &Value, context: &ExecutionContext) -> Result<Value, CapabilityError> {
    let account_id = account_of(input, context);
    let s = seed(account_id);
    Ok(json!({
        "account_id": account_id,
        "scenarios": {
            "mild": round2(-5.0 - s * 3.0),
            "severe": round2(-18.0 - s * 8.0),
        },
    }))
}

fn crisis_communication(input: &Value, context: &ExecutionContext) -> Result<Value, CapabilityError> {
    Ok(json!({
        "account_id": account_of(input, context),
        "message": "We are monitoring markets closely and your plan remains on track.",
        "sent": true,
    }))
}

fn provide_behavioral_coaching(_input: &Value, _context: &ExecutionContext) -> Result<Value, CapabilityError> {
    Ok(json!({ "script": "Stay invested; avoid selling into panic." }))
}

// ================= Compliance & tax =================

fn monitor_regulatory_changes(_input: &Value, _context: &ExecutionContext) -> Result<Value, CapabilityError> {
    Ok(json!({ "changes": ["Form ADV annual amendment due"], "count": 1 }))
}

fn assess_fiduciary_compliance(input: &Value, context: &ExecutionContext) -> Result<Value, CapabilityError> {
    Ok(json!({ "account_id": account_of(input, context), "compliant": true, "flags": [] }))
}

fn conduct_aml_screening(input: &Value, context: &ExecutionContext) -> Result<Value, CapabilityError> {
    Ok(json!({ "account_id": account_of(input, context), "matches": 0, "status": "clear" }))
}

fn calculate_tax_optimization(input: &Value, context: &ExecutionContext) -> Result<Value, CapabilityError> {
    let account_id = account_of(input, context);
    Ok(json!({
        "account_id": account_id,
        "estimated_savings": round2(1_200.0 + seed(account_id) * 4_800.0),
    }))
}

fn tax_loss_harvesting(input: &Value, context: &ExecutionContext) -> Result<Value, CapabilityError> {
    Ok(json!({
        "account_id": account_of(input, context),
        "candidates": ["INTL-EQ-FUND", "EM-BOND-ETF"],
    }))
}

// ================= Trading =================

fn trade_validation(input: &Value, _context: &ExecutionContext) -> Result<Value, CapabilityError> {
    let quantity = input.get("quantity").and_then(Value::as_f64).unwrap_or(0.0);
    if quantity <= 0.0 {
        return Err(CapabilityError::validation("order quantity must be positive"));
    }
    Ok(json!({ "order_id": format!("ORD-{}", quantity as u64), "valid": true }))
}

fn order_execution(input: &Value, _context: &ExecutionContext) -> Result<Value, CapabilityError> {
    let order_id = input.get("order_id").and_then(Value::as_str).unwrap_or("ORD-0");
    Ok(json!({ "order_id": order_id, "status": "filled", "fill_price": 101.25 }))
}

fn settlement_processing(input: &Value, _context: &ExecutionContext) -> Result<Value, CapabilityError> {
    let order_id = input.get("order_id").and_then(Value::as_str).unwrap_or("ORD-0");
    Ok(json!({ "order_id": order_id, "settlement": "T+1" }))
}

fn confirmation_generation(input: &Value, context: &ExecutionContext) -> Result<Value, CapabilityError> {
    Ok(json!({ "account_id": account_of(input, context), "confirmation_sent": true }))
}

/// Registry with every built-in capability.
pub fn create_default_registry() -> CapabilityRegistry {
    let mut registry = CapabilityRegistry::new();

    let capabilities = vec![
        MockCapability::new("get_portfolio_summary", "Portfolio value, holdings and allocation", get_portfolio_summary),
        MockCapability::new("generate_market_commentary", "Market commentary for client conversations", generate_market_commentary),
        MockCapability::new("create_meeting_agenda", "Client meeting agenda", create_meeting_agenda),
        MockCapability::new("track_action_items", "Post-meeting action items", track_action_items),
        MockCapability::new("calculate_performance_metrics", "Return, volatility and Sharpe ratio", calculate_performance_metrics),
        MockCapability::new("benchmark_comparison", "Compare returns against a benchmark", benchmark_comparison),
        MockCapability::new("create_performance_report", "Client performance report", create_performance_report),
        MockCapability::new("assess_portfolio_risk", "Portfolio risk score and concentration flags", assess_portfolio_risk),
        MockCapability::new("hedging_recommendations", "Risk mitigation proposals", hedging_recommendations),
        MockCapability::new("collect_kyc_information", "KYC document collection", collect_kyc_information),
        MockCapability::new("assess_risk_tolerance", "Risk tolerance questionnaire", assess_risk_tolerance),
        MockCapability::new("set_investment_goals", "Record client investment goals", set_investment_goals),
        MockCapability::new("create_client_profile", "Create the CRM client profile", create_client_profile),
        MockCapability::new("project_goal_timeline", "Monte Carlo goal projection", project_goal_timeline),
        MockCapability::new("suggest_goal_adjustments", "Savings plan adjustments", suggest_goal_adjustments),
        MockCapability::new("analyze_market_volatility", "Classify current volatility", analyze_market_volatility),
        MockCapability::new("assess_portfolio_impact", "Estimate drawdown from a market move", assess_portfolio_impact),
        MockCapability::new("trigger_proactive_outreach", "Queue proactive client outreach", trigger_proactive_outreach),
        MockCapability::new("initiate_emergency_protocol", "Start the crisis response protocol", initiate_emergency_protocol),
        MockCapability::new("prepare_scenario_analysis", "Stress scenarios for a portfolio", prepare_scenario_analysis),
        MockCapability::new("crisis_communication", "Client crisis communication", crisis_communication),
        MockCapability::new("provide_behavioral_coaching", "Behavioral coaching script", provide_behavioral_coaching),
        MockCapability::new("monitor_regulatory_changes", "Regulatory change feed", monitor_regulatory_changes),
        MockCapability::new("assess_fiduciary_compliance", "Fiduciary compliance review", assess_fiduciary_compliance),
        MockCapability::new("conduct_aml_screening", "Anti-money-laundering screening", conduct_aml_screening),
        MockCapability::new("calculate_tax_optimization", "Estimate tax savings opportunities", calculate_tax_optimization),
        MockCapability::new("tax_loss_harvesting", "Tax-loss harvesting candidates", tax_loss_harvesting),
        MockCapability::new("trade_validation", "Validate an order", trade_validation).requiring(&["quantity"]),
        MockCapability::new("order_execution", "Execute a validated order", order_execution).requiring(&["order_id"]),
        MockCapability::new("settlement_processing", "Settle an executed order", settlement_processing).requiring(&["order_id"]),
        MockCapability::new("confirmation_generation", "Send trade confirmations", confirmation_generation),
    ];

    for capability in capabilities {
        registry.register(Arc::new(capability));
    }

    registry
}
