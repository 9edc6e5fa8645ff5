use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use wealth_workflow_orchestrator::{
    agent::Orchestrator,
    aggregator::{aggregate, OrchestrationResponse},
    conditions::Event,
    config::EngineConfig,
    context::{ExecutionContext, Namespace},
};

const SAMPLE_REQUESTS: &[&str] = &[
    "Prepare for my client meeting with the Hendersons",
    "Run a risk assessment and hedge the concentration",
    "Is my retirement savings plan on track?",
    "Review performance against the benchmark then prepare the meeting agenda",
    "Time for the annual review",
    "Buy 150 shares and process the settlement",
    "Can you help me with something?",
];

fn print_report(request: &str, response: &OrchestrationResponse) {
    println!("\n=== {} ===", request);
    println!("Workflow: {} ({})", response.workflow_id, response.pattern);
    println!("Status:   {}", response.status);
    println!("Summary:  {}", response.summary);
    if !response.failed.is_empty() {
        println!("Failures:");
        for step in &response.failed {
            println!(
                "  {} / {}: {}",
                step.workflow_id,
                step.capability,
                step.error.as_deref().unwrap_or("unknown")
            );
        }
    }
    println!("Trace:");
    for (i, line) in response.trace.iter().enumerate() {
        println!("  {}: {}", i + 1, line);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Wealth workflow orchestrator demo starting");

    let config = EngineConfig::from_env()?;
    let orchestrator = Orchestrator::from_config(&config)?;

    let stats = orchestrator.registry_stats();
    info!(
        total = stats.total_workflows,
        by_pattern = ?stats.by_pattern,
        "Workflow catalog loaded"
    );

    let mut context = ExecutionContext::new();
    context.remember_account("WM123456");
    context.set_preference("contact_channel", json!("phone"));
    context.set(Namespace::ConversationContext, "order_quantity", json!(150));

    for request in SAMPLE_REQUESTS {
        match orchestrator.respond(request, &mut context).await {
            Ok(response) => print_report(request, &response),
            Err(e) => match e.clarification() {
                Some(question) => println!("\n=== {} ===\nClarification: {}", request, question),
                None => {
                    warn!(error = %e, "Request failed");
                    eprintln!("\n=== {} ===\nFailed: {}", request, e);
                }
            },
        }
    }

    let event = Event::new("market_update", json!({ "vix": 38.4, "index": "S&P 500", "change_pct": -4.1 }));
    let dispatched = orchestrator.handle_event(event, &mut context).await?;
    print_report("market_update event (VIX 38.4)", &aggregate(&dispatched));

    if config.schedules_enabled {
        let handle = orchestrator.schedule("ADV008", context.clone(), Some(1))?;
        info!(workflow_id = handle.workflow_id(), "Waiting for the next compliance run");
        let summary = handle.join().await?;
        for firing in &summary.firings {
            print_report("scheduled compliance run", &aggregate(firing));
        }
    }

    let executor = orchestrator.stats().await;
    println!("\n=== EXECUTOR STATS ===");
    println!("Executions:   {}", executor.total_executions);
    println!("Success rate: {:.1}%", executor.success_rate * 100.0);
    println!("Average:      {:.1} ms", executor.average_duration_ms);
    for entry in &executor.most_executed_workflows {
        println!("  {} x{}", entry.workflow_id, entry.executions);
    }

    Ok(())
}
