//! `http_request` action.
//!
//! Any HTTP response, including 4xx/5xx, is a successful invocation whose
//! output carries the status; only transport failures are errors, and those
//! are retryable.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use reqwest::header::{HeaderName, HeaderValue};
use reqwest::{Method, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::{Action, ActionContext, SchemaPart, SchemaViolation};
use crate::domain::{ActionResult, ErrorCode};

#[derive(Debug, Clone, Deserialize)]
pub struct HttpRequestConfig {
    pub url: String,

    #[serde(default = "default_method")]
    pub method: String,

    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Per-request timeout
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

fn default_method() -> String {
    "POST".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpResponseOutput {
    pub status: u16,
    pub status_text: String,
    pub headers: HashMap<String, String>,

    /// Parsed JSON when the body is JSON, otherwise the raw text
    pub body: Value,

    /// True for 2xx statuses
    pub success: bool,
}

#[derive(Clone, Default)]
pub struct HttpRequestAction {
    client: reqwest::Client,
}

impl HttpRequestAction {
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

fn parse_method(method: &str) -> Result<Method, SchemaViolation> {
    Method::from_bytes(method.to_ascii_uppercase().as_bytes()).map_err(|e| {
        SchemaViolation::new("http_request", SchemaPart::Config, format!("method: {}", e))
    })
}

/// Accept only absolute http(s) URLs
pub(crate) fn validate_url(action_type: &str, field: &str, url: &str) -> Result<(), SchemaViolation> {
    let parsed = Url::parse(url).map_err(|e| {
        SchemaViolation::new(action_type, SchemaPart::Config, format!("{}: {}", field, e))
    })?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(SchemaViolation::new(
            action_type,
            SchemaPart::Config,
            format!("{}: unsupported scheme '{}'", field, parsed.scheme()),
        ));
    }
    Ok(())
}

/// Header names and values must be sendable as-is
pub(crate) fn validate_headers(
    action_type: &str,
    headers: &HashMap<String, String>,
) -> Result<(), SchemaViolation> {
    for (name, value) in headers {
        HeaderName::from_bytes(name.as_bytes()).map_err(|_| {
            SchemaViolation::new(
                action_type,
                SchemaPart::Config,
                format!("headers: invalid header name '{}'", name),
            )
        })?;
        HeaderValue::from_str(value).map_err(|_| {
            SchemaViolation::new(
                action_type,
                SchemaPart::Config,
                format!("headers: invalid value for '{}'", name),
            )
        })?;
    }
    Ok(())
}

#[async_trait]
impl Action for HttpRequestAction {
    type Config = HttpRequestConfig;
    type Input = Value;
    type Output = HttpResponseOutput;

    fn action_type(&self) -> &str {
        "http_request"
    }

    fn description(&self) -> &str {
        "Send the input as JSON to an HTTP endpoint"
    }

    fn validate_config(&self, config: &HttpRequestConfig) -> Result<(), SchemaViolation> {
        validate_url("http_request", "url", &config.url)?;
        parse_method(&config.method)?;
        validate_headers("http_request", &config.headers)
    }

    async fn execute(
        &self,
        ctx: &ActionContext,
        input: Value,
        config: HttpRequestConfig,
    ) -> Result<ActionResult<HttpResponseOutput>> {
        let method = match parse_method(&config.method) {
            Ok(method) => method,
            Err(violation) => {
                return Ok(ActionResult::fatal(ErrorCode::ValidationFailed, violation.to_string()))
            }
        };

        let mut request = self.client.request(method.clone(), &config.url);
        if !config.headers.keys().any(|k| k.eq_ignore_ascii_case("content-type")) {
            request = request.header("Content-Type", "application/json");
        }
        for (name, value) in &config.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if method != Method::GET {
            request = request.json(&input);
        }
        if let Some(timeout_ms) = config.timeout_ms {
            request = request.timeout(Duration::from_millis(timeout_ms));
        }

        debug!(run_id = %ctx.run_id, attempt = ctx.attempt, method = %method, url = %config.url, "Sending HTTP request");

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                return Ok(ActionResult::retryable(
                    ErrorCode::ExternalServiceError,
                    format!("HTTP request failed: {}", e),
                ))
            }
        };

        let status = response.status();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_string(), value.to_string()))
            })
            .collect();

        let text = match response.text().await {
            Ok(text) => text,
            Err(e) => {
                return Ok(ActionResult::retryable(
                    ErrorCode::ExternalServiceError,
                    format!("Failed to read HTTP response body: {}", e),
                ))
            }
        };
        let body = serde_json::from_str(&text).unwrap_or(Value::String(text));

        Ok(ActionResult::success(HttpResponseOutput {
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            headers,
            body,
            success: status.is_success(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::ActionRegistry;
    use serde_json::json;

    #[test]
    fn test_config_defaults() {
        let config: HttpRequestConfig =
            serde_json::from_value(json!({"url": "https://example.com/hook"})).unwrap();
        assert_eq!(config.method, "POST");
        assert!(config.headers.is_empty());
    }

    #[test]
    fn test_config_validation() {
        let registry = ActionRegistry::with_builtins();
        let action = registry.get("http_request").unwrap();

        assert!(action
            .validate(&json!({"url": "https://example.com"}), &json!({}))
            .is_ok());
        assert!(action.validate(&json!({}), &json!({})).is_err());
        assert!(action
            .validate(&json!({"url": "not a url"}), &json!({}))
            .is_err());
        assert!(action
            .validate(&json!({"url": "ftp://example.com"}), &json!({}))
            .is_err());
        assert!(action
            .validate(
                &json!({"url": "https://example.com", "method": "NOT A METHOD"}),
                &json!({})
            )
            .is_err());
    }

    #[test]
    fn test_invalid_headers_rejected_before_execution() {
        let registry = ActionRegistry::with_builtins();
        let action = registry.get("http_request").unwrap();

        let bad_name = action
            .validate(
                &json!({"url": "https://example.com", "headers": {"bad header": "x"}}),
                &json!({}),
            )
            .unwrap_err();
        assert_eq!(bad_name.part, SchemaPart::Config);
        assert!(bad_name.message.contains("bad header"));

        assert!(action
            .validate(
                &json!({"url": "https://example.com", "headers": {"X-Trace": "line\nbreak"}}),
                &json!({})
            )
            .is_err());
        assert!(action
            .validate(
                &json!({"url": "https://example.com", "headers": {"X-Trace": "abc"}}),
                &json!({})
            )
            .is_ok());
    }

    #[tokio::test]
    async fn test_transport_failure_is_retryable() {
        // Nothing listens on port 9 locally
        let ctx = ActionContext::new("run_1", "scn_1", "c1");
        let config = HttpRequestConfig {
            url: "http://127.0.0.1:9/unreachable".to_string(),
            method: "POST".to_string(),
            headers: HashMap::new(),
            timeout_ms: Some(500),
        };

        let result = HttpRequestAction::default()
            .execute(&ctx, json!({"a": 1}), config)
            .await
            .unwrap();

        assert_eq!(result.kind(), crate::domain::ResultKind::RetryableError);
        assert_eq!(result.error().unwrap().code, ErrorCode::ExternalServiceError);
    }
}
