//! Outbound webhook dispatch to vendor tool endpoints.
//!
//! Every delivery posts a signed [`WebhookEnvelope`] to the tool's configured
//! URL. Failures are classified: 5xx and transport errors go to the retry
//! queue, anything else is logged and dropped. Access-change events
//! invalidate the entitlement cache before any delivery work happens.

use std::time::{Duration, Instant};

use reqwest::Client;
use serde_json::Value;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::cache::EntitlementCache;
use crate::crypto::{self, SIGNATURE_HEADER};
use crate::error::{BillingError, BillingResult};
use crate::events::{WebhookEnvelope, WebhookEventType};
use crate::retry::{self, EnqueueParams};

/// User-Agent sent on every outbound delivery.
pub const WEBHOOK_USER_AGENT: &str = "1Sub-Webhooks/1.0";

/// Per-request timeout for deliveries.
pub const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(15);

/// Response bodies are truncated to this many chars before storage.
const MAX_STORED_BODY: usize = 4096;

/// Shared HTTP client for webhook deliveries.
pub fn build_http_client() -> BillingResult<Client> {
    Client::builder()
        .timeout(WEBHOOK_TIMEOUT)
        .user_agent(WEBHOOK_USER_AGENT)
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .map_err(|e| BillingError::Internal(format!("failed to build webhook HTTP client: {e}")))
}

/// A tool's webhook destination, as stored on the `tools` row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ToolWebhookConfig {
    pub id: Uuid,
    pub webhook_url: Option<String>,
    pub webhook_secret_enc: Option<String>,
    /// NULL means subscribed to every event.
    pub subscribed_events: Option<Vec<String>>,
}

/// Outcome of a single HTTP delivery attempt.
#[derive(Debug, Clone)]
pub struct DeliveryAttempt {
    pub status_code: Option<u16>,
    pub error: Option<String>,
    pub latency_ms: i64,
    /// Raw `Retry-After` response header when present. Recorded for
    /// operators; scheduling always follows the fixed backoff table.
    pub retry_after: Option<String>,
    pub success: bool,
}

/// Whether a failed attempt should be handed to the retry queue.
///
/// 5xx responses and transport-level failures (timeout, connect, DNS) are
/// retryable. Any other HTTP status means the endpoint saw and rejected
/// the delivery, so resending the same payload will not help.
pub fn is_retryable(status_code: Option<u16>, error: &str) -> bool {
    match status_code {
        Some(code) => code >= 500,
        None => {
            let lower = error.to_lowercase();
            ["timeout", "timed out", "connect", "dns", "reset", "refused", "unreachable"]
                .iter()
                .any(|needle| lower.contains(needle))
        }
    }
}

/// Whether `event` passes the tool's subscribed-events allowlist.
fn subscribed(config: &ToolWebhookConfig, event: WebhookEventType) -> bool {
    match &config.subscribed_events {
        None => true,
        Some(list) => list.iter().any(|name| name == event.as_str()),
    }
}

/// POST a serialized envelope to `url` and classify the result.
///
/// Takes the envelope as a JSON value so retries can resend the stored
/// body verbatim. The signature is computed with a fresh timestamp at
/// send time, so a retried delivery never carries an expired header.
pub async fn attempt_delivery(
    http: &Client,
    url: &str,
    secret: &str,
    payload: &Value,
) -> DeliveryAttempt {
    let body = match serde_json::to_vec(payload) {
        Ok(body) => body,
        Err(e) => {
            return DeliveryAttempt {
                status_code: None,
                error: Some(format!("payload serialization failed: {e}")),
                latency_ms: 0,
                retry_after: None,
                success: false,
            };
        }
    };

    let timestamp = OffsetDateTime::now_utc().unix_timestamp();
    let signature = crypto::signature_header(secret, timestamp, &body);

    let start = Instant::now();
    let result = http
        .post(url)
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .header(SIGNATURE_HEADER, signature)
        .body(body)
        .send()
        .await;
    let latency_ms = start.elapsed().as_millis() as i64;

    match result {
        Ok(response) => {
            let status = response.status().as_u16();
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.to_string());

            if (200..300).contains(&status) {
                DeliveryAttempt {
                    status_code: Some(status),
                    error: None,
                    latency_ms,
                    retry_after,
                    success: true,
                }
            } else {
                let snippet: String = response
                    .text()
                    .await
                    .unwrap_or_default()
                    .chars()
                    .take(MAX_STORED_BODY)
                    .collect();
                let error = if snippet.is_empty() {
                    format!("HTTP {status}")
                } else {
                    format!("HTTP {status}: {snippet}")
                };
                DeliveryAttempt {
                    status_code: Some(status),
                    error: Some(error),
                    latency_ms,
                    retry_after,
                    success: false,
                }
            }
        }
        Err(e) => {
            let error = if e.is_timeout() {
                format!("request timeout ({}s)", WEBHOOK_TIMEOUT.as_secs())
            } else if e.is_connect() {
                format!("connection failed: {e}")
            } else {
                format!("request error: {e}")
            };
            DeliveryAttempt {
                status_code: None,
                error: Some(error),
                latency_ms,
                retry_after: None,
                success: false,
            }
        }
    }
}

pub(crate) struct DeliveryLogEntry<'a> {
    pub tool_id: Uuid,
    pub event_id: Uuid,
    pub event_type: &'a str,
    pub url: &'a str,
    pub attempt_number: i32,
    pub is_retry: bool,
}

/// Best-effort append to the delivery log. Never fails the caller.
pub(crate) async fn log_delivery(
    pool: &PgPool,
    entry: DeliveryLogEntry<'_>,
    attempt: &DeliveryAttempt,
) {
    let result = sqlx::query(
        r#"
        INSERT INTO webhook_delivery_log
            (tool_id, event_id, event_type, url, status_code, error,
             latency_ms, attempt, is_retry, success, retry_after)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        "#,
    )
    .bind(entry.tool_id)
    .bind(entry.event_id)
    .bind(entry.event_type)
    .bind(entry.url)
    .bind(attempt.status_code.map(|c| c as i32))
    .bind(attempt.error.as_deref())
    .bind(attempt.latency_ms)
    .bind(entry.attempt_number)
    .bind(entry.is_retry)
    .bind(attempt.success)
    .bind(attempt.retry_after.as_deref())
    .execute(pool)
    .await;

    if let Err(e) = result {
        tracing::error!(
            tool_id = %entry.tool_id,
            event_id = %entry.event_id,
            error = %e,
            "Failed to record webhook delivery attempt"
        );
    }
}

/// Sends signed event notifications to vendor tools.
///
/// All delivery problems are absorbed here: callers can treat `notify`
/// as infallible and must never gate their own success on it.
#[derive(Clone)]
pub struct WebhookDispatcher {
    pool: PgPool,
    http: Client,
    encryption_key: [u8; 32],
    cache: EntitlementCache,
}

impl WebhookDispatcher {
    pub fn new(
        pool: PgPool,
        http: Client,
        encryption_key: [u8; 32],
        cache: EntitlementCache,
    ) -> Self {
        Self {
            pool,
            http,
            encryption_key,
            cache,
        }
    }

    /// Deliver one event to one tool, synchronously.
    ///
    /// `data` becomes the envelope's `data` object, enriched with
    /// `oneSubUserId` and (when resolvable) `userEmail`. For access-change
    /// events the cached entitlement for `(tool, user)` is dropped before
    /// anything else, including when the tool has no webhook configured.
    pub async fn notify(
        &self,
        tool_id: Uuid,
        user_id: Uuid,
        event_type: WebhookEventType,
        mut data: Value,
    ) {
        if event_type.is_access_change() {
            self.cache.invalidate(tool_id, user_id).await;
        }

        let config = match self.load_tool_config(tool_id).await {
            Ok(Some(config)) => config,
            Ok(None) => {
                tracing::debug!(tool_id = %tool_id, "Webhook skipped: tool not found");
                return;
            }
            Err(e) => {
                tracing::error!(
                    tool_id = %tool_id,
                    event = %event_type,
                    error = %e,
                    "Failed to load tool webhook config"
                );
                return;
            }
        };

        let (Some(url), Some(secret_enc)) = (&config.webhook_url, &config.webhook_secret_enc)
        else {
            tracing::debug!(
                tool_id = %tool_id,
                event = %event_type,
                "Webhook skipped: tool has no webhook configured"
            );
            return;
        };

        if !subscribed(&config, event_type) {
            tracing::debug!(
                tool_id = %tool_id,
                event = %event_type,
                "Webhook skipped: tool not subscribed to event"
            );
            return;
        }

        let secret = match crypto::decrypt_webhook_secret(secret_enc, &self.encryption_key) {
            Ok(secret) => secret,
            Err(e) => {
                tracing::error!(
                    tool_id = %tool_id,
                    event = %event_type,
                    error = %e,
                    "Failed to decrypt webhook secret, delivery dropped"
                );
                return;
            }
        };

        if let Value::Object(ref mut map) = data {
            map.insert("oneSubUserId".into(), serde_json::json!(user_id));
            if let Some(email) = self.lookup_user_email(user_id).await {
                map.insert("userEmail".into(), Value::String(email));
            }
        }

        let envelope = WebhookEnvelope::new(event_type, data);
        let payload = match serde_json::to_value(&envelope) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(
                    tool_id = %tool_id,
                    event = %event_type,
                    error = %e,
                    "Failed to serialize webhook envelope"
                );
                return;
            }
        };
        let attempt = attempt_delivery(&self.http, url, &secret, &payload).await;

        log_delivery(
            &self.pool,
            DeliveryLogEntry {
                tool_id,
                event_id: envelope.id,
                event_type: event_type.as_str(),
                url,
                attempt_number: 1,
                is_retry: false,
            },
            &attempt,
        )
        .await;

        if attempt.success {
            tracing::info!(
                tool_id = %tool_id,
                event = %event_type,
                event_id = %envelope.id,
                status = ?attempt.status_code,
                latency_ms = attempt.latency_ms,
                "Webhook delivered"
            );
            return;
        }

        let error = attempt.error.as_deref().unwrap_or("unknown error");
        if is_retryable(attempt.status_code, error) {
            match retry::enqueue(
                &self.pool,
                EnqueueParams {
                    tool_id,
                    event_id: envelope.id,
                    event_type: event_type.as_str(),
                    url,
                    payload: &payload,
                    webhook_secret_enc: secret_enc,
                    last_error: Some(error),
                    last_status_code: attempt.status_code.map(|c| c as i32),
                },
            )
            .await
            {
                Ok(true) => {
                    tracing::info!(
                        tool_id = %tool_id,
                        event = %event_type,
                        event_id = %envelope.id,
                        status = ?attempt.status_code,
                        "Webhook delivery failed, queued for retry"
                    );
                }
                Ok(false) => {
                    tracing::debug!(
                        tool_id = %tool_id,
                        event_id = %envelope.id,
                        "Retry already queued for event"
                    );
                }
                Err(e) => {
                    tracing::error!(
                        tool_id = %tool_id,
                        event_id = %envelope.id,
                        error = %e,
                        "Failed to enqueue webhook retry"
                    );
                }
            }
        } else {
            tracing::warn!(
                tool_id = %tool_id,
                event = %event_type,
                event_id = %envelope.id,
                status = ?attempt.status_code,
                error = %error,
                "Webhook delivery rejected, not retrying"
            );
        }
    }

    /// Fire-and-forget variant for request paths that must not wait on
    /// vendor endpoints.
    pub fn notify_background(
        &self,
        tool_id: Uuid,
        user_id: Uuid,
        event_type: WebhookEventType,
        data: Value,
    ) {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            dispatcher.notify(tool_id, user_id, event_type, data).await;
        });
    }

    async fn load_tool_config(&self, tool_id: Uuid) -> Result<Option<ToolWebhookConfig>, sqlx::Error> {
        sqlx::query_as::<_, ToolWebhookConfig>(
            "SELECT id, webhook_url, webhook_secret_enc, subscribed_events FROM tools WHERE id = $1",
        )
        .bind(tool_id)
        .fetch_optional(&self.pool)
        .await
    }

    async fn lookup_user_email(&self, user_id: Uuid) -> Option<String> {
        match sqlx::query_scalar::<_, String>("SELECT email FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
        {
            Ok(email) => email,
            Err(e) => {
                tracing::warn!(
                    user_id = %user_id,
                    error = %e,
                    "Failed to resolve user email for webhook payload"
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use serde_json::json;

    fn config_with_events(events: Option<Vec<&str>>) -> ToolWebhookConfig {
        ToolWebhookConfig {
            id: Uuid::new_v4(),
            webhook_url: Some("https://tool.example/hooks".into()),
            webhook_secret_enc: Some("enc".into()),
            subscribed_events: events.map(|e| e.into_iter().map(String::from).collect()),
        }
    }

    #[test]
    fn subscription_filter_defaults_to_all_events() {
        let all = config_with_events(None);
        assert!(subscribed(&all, WebhookEventType::CreditsConsumed));
        assert!(subscribed(&all, WebhookEventType::SubscriptionCanceled));

        let some = config_with_events(Some(vec!["credits.consumed", "credits.low"]));
        assert!(subscribed(&some, WebhookEventType::CreditsConsumed));
        assert!(!subscribed(&some, WebhookEventType::SubscriptionCanceled));

        let none = config_with_events(Some(vec![]));
        assert!(!subscribed(&none, WebhookEventType::CreditsConsumed));
    }

    #[test]
    fn retryability_classification() {
        assert!(is_retryable(Some(500), "HTTP 500"));
        assert!(is_retryable(Some(503), "HTTP 503"));
        assert!(is_retryable(Some(599), "HTTP 599"));

        assert!(!is_retryable(Some(400), "HTTP 400"));
        assert!(!is_retryable(Some(404), "HTTP 404"));
        assert!(!is_retryable(Some(410), "HTTP 410"));
        assert!(!is_retryable(Some(429), "HTTP 429"));
        assert!(!is_retryable(Some(301), "HTTP 301"));

        assert!(is_retryable(None, "request timeout (15s)"));
        assert!(is_retryable(None, "connection failed: tcp connect error"));
        assert!(is_retryable(None, "dns error: failed to lookup host"));
        assert!(is_retryable(None, "connection reset by peer"));
        assert!(!is_retryable(None, "payload serialization failed: oops"));
    }

    #[tokio::test]
    async fn delivery_posts_signed_envelope() {
        let mut server = mockito::Server::new_async().await;
        let user_id = Uuid::new_v4();
        let mock = server
            .mock("POST", "/hooks")
            .match_header("content-type", "application/json")
            .match_header(
                SIGNATURE_HEADER,
                Matcher::Regex(r"^t=\d+,v1=[0-9a-f]{64}$".into()),
            )
            .match_body(Matcher::PartialJson(json!({
                "type": "subscription.activated",
                "data": { "oneSubUserId": user_id },
            })))
            .with_status(200)
            .create_async()
            .await;

        let http = build_http_client().unwrap();
        let payload = serde_json::to_value(WebhookEnvelope::new(
            WebhookEventType::SubscriptionActivated,
            json!({ "oneSubUserId": user_id }),
        ))
        .unwrap();
        let url = format!("{}/hooks", server.url());
        let attempt = attempt_delivery(&http, &url, "whsec_test", &payload).await;

        mock.assert_async().await;
        assert!(attempt.success);
        assert_eq!(attempt.status_code, Some(200));
        assert!(attempt.error.is_none());
    }

    #[tokio::test]
    async fn server_errors_are_retryable_failures() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/hooks")
            .with_status(503)
            .with_body("upstream unavailable")
            .create_async()
            .await;

        let http = build_http_client().unwrap();
        let payload =
            serde_json::to_value(WebhookEnvelope::new(WebhookEventType::CreditsConsumed, json!({})))
                .unwrap();
        let url = format!("{}/hooks", server.url());
        let attempt = attempt_delivery(&http, &url, "whsec_test", &payload).await;

        mock.assert_async().await;
        assert!(!attempt.success);
        assert_eq!(attempt.status_code, Some(503));
        let error = attempt.error.unwrap();
        assert!(error.contains("HTTP 503"));
        assert!(error.contains("upstream unavailable"));
        assert!(is_retryable(Some(503), &error));
    }

    #[tokio::test]
    async fn client_errors_are_permanent_failures() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/hooks")
            .with_status(404)
            .create_async()
            .await;

        let http = build_http_client().unwrap();
        let payload =
            serde_json::to_value(WebhookEnvelope::new(WebhookEventType::CreditsLow, json!({})))
                .unwrap();
        let url = format!("{}/hooks", server.url());
        let attempt = attempt_delivery(&http, &url, "whsec_test", &payload).await;

        mock.assert_async().await;
        assert!(!attempt.success);
        assert_eq!(attempt.status_code, Some(404));
        assert!(!is_retryable(attempt.status_code, &attempt.error.unwrap()));
    }

    #[tokio::test]
    async fn retry_after_header_is_captured() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/hooks")
            .with_status(503)
            .with_header("Retry-After", "120")
            .create_async()
            .await;

        let http = build_http_client().unwrap();
        let payload =
            serde_json::to_value(WebhookEnvelope::new(WebhookEventType::CreditsDepleted, json!({})))
                .unwrap();
        let url = format!("{}/hooks", server.url());
        let attempt = attempt_delivery(&http, &url, "whsec_test", &payload).await;

        mock.assert_async().await;
        assert_eq!(attempt.retry_after.as_deref(), Some("120"));
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_retryable() {
        let http = build_http_client().unwrap();
        let payload =
            serde_json::to_value(WebhookEnvelope::new(WebhookEventType::CreditsConsumed, json!({})))
                .unwrap();
        // Port 1 is never listening.
        let attempt = attempt_delivery(&http, "http://127.0.0.1:1/hooks", "whsec_test", &payload).await;

        assert!(!attempt.success);
        assert_eq!(attempt.status_code, None);
        assert!(is_retryable(None, &attempt.error.unwrap()));
    }
}
