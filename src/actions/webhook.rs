//! `webhook_send` action: deliver the input as a JSON event to a webhook.
//!
//! With a `secret`, the exact body bytes are signed with HMAC-SHA256 and the
//! signature is sent as `X-Stepwise-Signature: sha256=<hex>`. Every attempt
//! of one run carries the same `X-Stepwise-Delivery` id so receivers can
//! drop retried deliveries.
//!
//! 2xx is a success. 408, 429 and 5xx responses and transport failures are
//! retryable; any other status means the receiver rejected the event and is
//! fatal.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use hmac::digest::InvalidLength;
use hmac::{Hmac, Mac};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;
use tracing::{debug, warn};

use super::http::{validate_headers, validate_url};
use super::{Action, ActionContext, SchemaPart, SchemaViolation};
use crate::domain::{ActionResult, ErrorCode};

pub const SIGNATURE_HEADER: &str = "X-Stepwise-Signature";
pub const EVENT_HEADER: &str = "X-Stepwise-Event";
pub const DELIVERY_HEADER: &str = "X-Stepwise-Delivery";

const USER_AGENT: &str = concat!("stepwise-webhooks/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookConfig {
    pub webhook_url: String,

    /// Signing secret; unsigned when absent
    #[serde(default)]
    pub secret: Option<String>,

    #[serde(default)]
    pub headers: HashMap<String, String>,

    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default = "default_event_type")]
    pub event_type: String,
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_event_type() -> String {
    "scenario_webhook".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookDelivery {
    pub success: bool,
    pub status_code: u16,
    pub status_text: String,
    pub response_body: String,
    pub response_headers: HashMap<String, String>,
    pub event_type: String,
    pub signed: bool,

    /// Unix milliseconds when the delivery was sent
    pub timestamp: i64,
}

/// `sha256=<hex>` HMAC-SHA256 signature of `body`
pub fn sign_payload(secret: &str, body: &[u8]) -> Result<String, InvalidLength> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())?;
    mac.update(body);
    Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
}

#[derive(Clone, Default)]
pub struct WebhookSendAction {
    client: reqwest::Client,
}

impl WebhookSendAction {
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Action for WebhookSendAction {
    type Config = WebhookConfig;
    type Input = Value;
    type Output = WebhookDelivery;

    fn action_type(&self) -> &str {
        "webhook_send"
    }

    fn description(&self) -> &str {
        "Deliver the input as a signed JSON event to a webhook"
    }

    fn validate_config(&self, config: &WebhookConfig) -> Result<(), SchemaViolation> {
        if config.webhook_url.trim().is_empty() {
            return Err(SchemaViolation::new(
                "webhook_send",
                SchemaPart::Config,
                "webhook_url is required",
            ));
        }
        validate_url("webhook_send", "webhook_url", &config.webhook_url)?;
        if config.secret.as_deref() == Some("") {
            return Err(SchemaViolation::new(
                "webhook_send",
                SchemaPart::Config,
                "secret cannot be empty",
            ));
        }
        validate_headers("webhook_send", &config.headers)
    }

    async fn execute(
        &self,
        ctx: &ActionContext,
        input: Value,
        config: WebhookConfig,
    ) -> Result<ActionResult<WebhookDelivery>> {
        let body = serde_json::to_vec(&input)?;
        let timestamp = Utc::now().timestamp_millis();

        let mut request = self
            .client
            .post(&config.webhook_url)
            .timeout(Duration::from_millis(config.timeout_ms))
            .header("Content-Type", "application/json")
            .header("User-Agent", USER_AGENT);
        for (name, value) in &config.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        request = request
            .header(EVENT_HEADER, config.event_type.as_str())
            .header(DELIVERY_HEADER, ctx.run_id.as_str());

        let signed = match config.secret.as_deref() {
            Some(secret) => {
                let signature = match sign_payload(secret, &body) {
                    Ok(signature) => signature,
                    Err(e) => {
                        return Ok(ActionResult::fatal(
                            ErrorCode::ValidationFailed,
                            format!("Cannot sign webhook payload: {}", e),
                        ))
                    }
                };
                request = request.header(SIGNATURE_HEADER, signature);
                true
            }
            None => false,
        };

        debug!(
            run_id = %ctx.run_id,
            attempt = ctx.attempt,
            url = %config.webhook_url,
            event_type = %config.event_type,
            signed,
            "Sending webhook"
        );

        let response = match request.body(body).send().await {
            Ok(response) => response,
            Err(e) => {
                return Ok(ActionResult::retryable(
                    ErrorCode::ExternalServiceError,
                    format!("Webhook send failed: {}", e),
                ))
            }
        };

        let status = response.status();
        let response_headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_string(), value.to_string()))
            })
            .collect();
        let response_body = response.text().await.unwrap_or_default();

        if status.is_success() {
            return Ok(ActionResult::success(WebhookDelivery {
                success: true,
                status_code: status.as_u16(),
                status_text: status.canonical_reason().unwrap_or_default().to_string(),
                response_body,
                response_headers,
                event_type: config.event_type,
                signed,
                timestamp,
            }));
        }

        warn!(run_id = %ctx.run_id, status = status.as_u16(), url = %config.webhook_url, "Webhook not accepted");
        let message = format!("Webhook returned HTTP {}", status);
        if is_retryable_status(status) {
            Ok(ActionResult::retryable(ErrorCode::ExternalServiceError, message))
        } else {
            Ok(ActionResult::fatal("WEBHOOK_REJECTED", message))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::ActionRegistry;
    use crate::domain::ResultKind;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    fn config(url: &str, secret: Option<&str>) -> WebhookConfig {
        serde_json::from_value(json!({
            "webhook_url": url,
            "secret": secret,
            "headers": {"X-Tenant": "acme"},
            "timeout_ms": 2000,
        }))
        .unwrap()
    }

    fn header_end(buf: &[u8]) -> Option<usize> {
        buf.windows(4).position(|w| w == b"\r\n\r\n")
    }

    /// Accept one request, answer with `status_line`, return the raw request
    async fn serve_once(status_line: &'static str) -> (String, JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/hooks/orders", listener.local_addr().unwrap());

        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut chunk = [0u8; 1024];
            loop {
                let n = socket.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&chunk[..n]);
                if let Some(end) = header_end(&request) {
                    let head = String::from_utf8_lossy(&request[..end]).to_lowercase();
                    let length = head
                        .lines()
                        .find_map(|line| line.strip_prefix("content-length:"))
                        .and_then(|v| v.trim().parse::<usize>().ok())
                        .unwrap_or(0);
                    if request.len() >= end + 4 + length {
                        break;
                    }
                }
            }

            let response = format!(
                "{}\r\ncontent-length: 8\r\nconnection: close\r\n\r\nreceived",
                status_line
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            request
        });

        (url, handle)
    }

    #[test]
    fn test_sign_payload_matches_known_vector() {
        let signature =
            sign_payload("key", b"The quick brown fox jumps over the lazy dog").unwrap();
        assert_eq!(
            signature,
            "sha256=f7bc83f430538424b13298e6aa6fb143ef4d59a14946175997479dbc2d1a3cd8"
        );
    }

    #[test]
    fn test_config_validation() {
        let registry = ActionRegistry::with_builtins();
        let action = registry.get("webhook_send").unwrap();

        let missing = action.validate(&json!({}), &json!({})).unwrap_err();
        assert_eq!(missing.part, SchemaPart::Config);
        assert!(action
            .validate(&json!({"webhook_url": ""}), &json!({}))
            .is_err());
        assert!(action
            .validate(&json!({"webhook_url": "ftp://example.com"}), &json!({}))
            .is_err());
        assert!(action
            .validate(
                &json!({"webhook_url": "https://example.com", "headers": {"a b": "c"}}),
                &json!({})
            )
            .is_err());
        assert!(action
            .validate(
                &json!({"webhook_url": "https://example.com/hook", "secret": "s3cret"}),
                &json!({"order": 1})
            )
            .is_ok());
    }

    #[tokio::test]
    async fn test_signed_delivery() {
        let (url, server) = serve_once("HTTP/1.1 200 OK").await;
        let ctx = ActionContext::new("run_wh", "scn_1", "c1");
        let input = json!({"order_id": 1042, "total": 99.5});

        let result = WebhookSendAction::default()
            .execute(&ctx, input.clone(), config(&url, Some("s3cret")))
            .await
            .unwrap();

        let delivery = result.data().unwrap();
        assert!(delivery.success);
        assert!(delivery.signed);
        assert_eq!(delivery.status_code, 200);
        assert_eq!(delivery.response_body, "received");
        assert_eq!(delivery.event_type, "scenario_webhook");

        let request = server.await.unwrap();
        let end = header_end(&request).unwrap();
        let head = String::from_utf8_lossy(&request[..end]).to_lowercase();
        let body = &request[end + 4..];

        assert_eq!(serde_json::from_slice::<Value>(body).unwrap(), input);
        let expected = sign_payload("s3cret", body).unwrap();
        assert!(head.contains(&format!("x-stepwise-signature: {}", expected)));
        assert!(head.contains("x-stepwise-event: scenario_webhook"));
        assert!(head.contains("x-stepwise-delivery: run_wh"));
        assert!(head.contains("x-tenant: acme"));
    }

    #[tokio::test]
    async fn test_unsigned_delivery_has_no_signature() {
        let (url, server) = serve_once("HTTP/1.1 202 Accepted").await;
        let ctx = ActionContext::new("run_wh", "scn_1", "c1");

        let result = WebhookSendAction::default()
            .execute(&ctx, json!({"a": 1}), config(&url, None))
            .await
            .unwrap();

        assert!(!result.data().unwrap().signed);
        let request = String::from_utf8_lossy(&server.await.unwrap()).to_lowercase();
        assert!(!request.contains("x-stepwise-signature"));
    }

    #[tokio::test]
    async fn test_server_error_is_retryable() {
        let (url, _server) = serve_once("HTTP/1.1 503 Service Unavailable").await;
        let ctx = ActionContext::new("run_wh", "scn_1", "c1");

        let result = WebhookSendAction::default()
            .execute(&ctx, json!({}), config(&url, None))
            .await
            .unwrap();

        assert_eq!(result.kind(), ResultKind::RetryableError);
        assert_eq!(result.error().unwrap().code, ErrorCode::ExternalServiceError);
    }

    #[tokio::test]
    async fn test_client_error_is_fatal() {
        let (url, _server) = serve_once("HTTP/1.1 410 Gone").await;
        let ctx = ActionContext::new("run_wh", "scn_1", "c1");

        let result = WebhookSendAction::default()
            .execute(&ctx, json!({}), config(&url, None))
            .await
            .unwrap();

        assert!(result.is_fatal());
        assert_eq!(result.error().unwrap().code.as_str(), "WEBHOOK_REJECTED");
    }

    #[tokio::test]
    async fn test_transport_failure_is_retryable() {
        // Nothing listens on port 9 locally
        let ctx = ActionContext::new("run_wh", "scn_1", "c1");

        let result = WebhookSendAction::default()
            .execute(&ctx, json!({}), config("http://127.0.0.1:9/hook", None))
            .await
            .unwrap();

        assert_eq!(result.kind(), ResultKind::RetryableError);
        assert_eq!(result.error().unwrap().code, ErrorCode::ExternalServiceError);
    }
}
