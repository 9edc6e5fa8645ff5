//! HTTP-backed capabilities
//!
//! Calls the financial API service. The resolved step input is posted as
//! JSON and the HTTP status is mapped onto a `FailureKind` so the invoker
//! can decide whether to retry.

use super::{Capability, CapabilityError, CapabilityRegistry};
use crate::context::ExecutionContext;
use crate::error::OrchestrationError;
use crate::models::FailureKind;
use crate::Result;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Capability name to API route.
const FINANCIAL_API_ROUTES: &[(&str, &str)] = &[
    ("get_portfolio_summary", "/portfolio/summary"),
    ("calculate_performance_metrics", "/portfolio/performance"),
    ("assess_portfolio_risk", "/risk/assess"),
    ("generate_market_commentary", "/market/commentary"),
    ("analyze_market_volatility", "/market/volatility"),
    ("conduct_aml_screening", "/compliance/aml"),
    ("assess_fiduciary_compliance", "/compliance/fiduciary"),
    ("trade_validation", "/trading/validate"),
    ("order_execution", "/trading/execute"),
];

#[derive(Clone)]
pub struct FinancialApiClient {
    client: Client,
    base_url: String,
}

impl FinancialApiClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(60))
            .pool_max_idle_per_host(8)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn post_json(&self, path: &str, body: &Value) -> std::result::Result<Value, CapabilityError> {
        let url = format!("{}{}", self.base_url, path);

        let response = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| classify_transport_error(path, &e))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(CapabilityError::new(
                classify_status(status),
                format!("Financial API returned {} for {}: {}", status, path, detail),
            ));
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| CapabilityError::internal(format!("Invalid JSON response from {}: {}", path, e)))
    }
}

pub fn classify_status(status: StatusCode) -> FailureKind {
    match status.as_u16() {
        429 | 502 | 503 | 504 => FailureKind::ServiceUnavailable,
        400 | 422 => FailureKind::Validation,
        401 | 403 => FailureKind::Authorization,
        _ => FailureKind::Internal,
    }
}

fn classify_transport_error(path: &str, err: &reqwest::Error) -> CapabilityError {
    let kind = if err.is_timeout() {
        FailureKind::Timeout
    } else if err.is_connect() || err.is_request() {
        FailureKind::Network
    } else {
        FailureKind::Internal
    };
    CapabilityError::new(kind, format!("Financial API request failed for {}: {}", path, err))
}

pub struct HttpCapability {
    name: String,
    description: String,
    path: String,
    api: FinancialApiClient,
    timeout: Option<Duration>,
    required: Vec<String>,
}

impl HttpCapability {
    pub fn new(name: &str, path: &str, api: FinancialApiClient) -> Self {
        Self {
            name: name.to_string(),
            description: format!("Financial API call to {}", path),
            path: path.to_string(),
            api,
            timeout: None,
            required: Vec::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn requiring(mut self, fields: &[&str]) -> Self {
        self.required = fields.iter().map(|f| f.to_string()).collect();
        self
    }
}

#[async_trait::async_trait]
impl Capability for HttpCapability {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    fn required_fields(&self) -> &[String] {
        &self.required
    }

    async fn invoke(&self, input: &Value, context: &ExecutionContext) -> std::result::Result<Value, CapabilityError> {
        let mut body = input.clone();
        // Fill the session account when the step did not map one explicitly
        if let (Some(object), Some(account)) = (body.as_object_mut(), context.current_account()) {
            object
                .entry("account_id")
                .or_insert_with(|| Value::String(account.to_string()));
        }

        debug!(capability = %self.name, path = %self.path, "Calling financial API");
        self.api.post_json(&self.path, &body).await
    }
}

/// Replace built-in capabilities with HTTP calls to the financial API.
pub fn register_financial_api(registry: &mut CapabilityRegistry, base_url: &str) -> Result<usize> {
    if base_url.trim().is_empty() {
        return Err(OrchestrationError::Config(
            "FINANCIAL_API_BASE_URL is empty".to_string(),
        ));
    }

    let api = FinancialApiClient::new(base_url)?;
    for (name, path) in FINANCIAL_API_ROUTES {
        registry.register(Arc::new(HttpCapability::new(name, path, api.clone())));
    }
    Ok(FINANCIAL_API_ROUTES.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_mapping() {
        assert_eq!(classify_status(StatusCode::SERVICE_UNAVAILABLE), FailureKind::ServiceUnavailable);
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), FailureKind::ServiceUnavailable);
        assert_eq!(classify_status(StatusCode::UNPROCESSABLE_ENTITY), FailureKind::Validation);
        assert_eq!(classify_status(StatusCode::FORBIDDEN), FailureKind::Authorization);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), FailureKind::Internal);
    }

    #[tokio::test]
    async fn test_posts_input_with_session_account() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/portfolio/summary")
            .match_body(mockito::Matcher::PartialJson(json!({"account_id": "WM100001"})))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"total_value": 1250000.0}"#)
            .create_async()
            .await;

        let api = FinancialApiClient::new(&server.url()).unwrap();
        let capability = HttpCapability::new("get_portfolio_summary", "/portfolio/summary", api);
        let mut context = ExecutionContext::new();
        context.remember_account("WM100001");

        let output = capability.invoke(&json!({}), &context).await.unwrap();
        assert_eq!(output["total_value"], json!(1250000.0));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_unavailable_service_is_transient() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/risk/assess")
            .with_status(503)
            .with_body("maintenance")
            .create_async()
            .await;

        let api = FinancialApiClient::new(&server.url()).unwrap();
        let capability = HttpCapability::new("assess_portfolio_risk", "/risk/assess", api);

        let err = capability
            .invoke(&json!({"account_id": "WM1"}), &ExecutionContext::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::ServiceUnavailable);
        assert!(err.kind.is_transient());
        assert!(err.message.contains("maintenance"));
    }

    #[test]
    fn test_register_financial_api_overrides_builtins() {
        let mut registry = crate::capabilities::create_default_registry();
        let before = registry.len();
        let added = register_financial_api(&mut registry, "http://localhost:9000/").unwrap();

        assert_eq!(added, FINANCIAL_API_ROUTES.len());
        assert_eq!(registry.len(), before);
        assert!(register_financial_api(&mut registry, " ").is_err());
    }
}
