//! Credit consumption and balance endpoints.

use axum::extract::{Path, State};
use axum::{Extension, Json};
use onesub_billing::{ConsumeOutcome, ConsumeRequest, ConsumeStatus, WebhookEventType};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::auth::AuthTool;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// Balance at or below which a successful consume announces `credits.low`.
const LOW_BALANCE_THRESHOLD: i64 = 50;

#[derive(Debug, Deserialize)]
pub struct ConsumeBody {
    pub user_id: Uuid,
    pub amount: i64,
    pub reason: String,
    pub idempotency_key: String,
    #[serde(default)]
    pub metadata: Option<Value>,
}

/// `POST /api/v1/credits/consume`. Vendor-authenticated, rate limited
/// per tool. Replays of the same idempotency key return the original
/// result with `is_duplicate: true` and fire no second webhook.
pub async fn consume_credits(
    State(state): State<AppState>,
    Extension(tool): Extension<AuthTool>,
    Json(body): Json<ConsumeBody>,
) -> ApiResult<Json<Value>> {
    let limit = state.rate_limiter.check_tool(tool.id, None).await;
    if !limit.allowed {
        tracing::warn!(tool_id = %tool.id, tool = %tool.name, "consume rate limit hit");
        return Err(ApiError::RateLimited {
            retry_after: limit.retry_after_seconds,
            limit: limit.limit,
            remaining: limit.remaining,
        });
    }

    let amount = body.amount;
    let user_id = body.user_id;
    let outcome = state
        .billing
        .ledger
        .consume(ConsumeRequest {
            user_id,
            amount,
            reason: body.reason,
            idempotency_key: body.idempotency_key,
            tool_id: Some(tool.id),
            metadata: body.metadata,
        })
        .await?;

    match outcome.status {
        ConsumeStatus::InsufficientCredits => Err(ApiError::InsufficientCredits {
            current_balance: outcome.balance_before,
            required: amount,
        }),
        ConsumeStatus::Success | ConsumeStatus::Duplicate => {
            let duplicate = outcome.status == ConsumeStatus::Duplicate;
            if !duplicate {
                state.billing.entitlements.invalidate(user_id, tool.id).await;
                announce_consumption(&state, tool.id, user_id, amount, &outcome);
            }
            Ok(Json(json!({
                "success": true,
                "new_balance": outcome.balance_after,
                "transaction_id": outcome.transaction_id,
                "is_duplicate": duplicate,
            })))
        }
    }
}

/// `GET /api/v1/credits/balance/{user_id}`. Collaborator balance read.
pub async fn get_balance(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    let balance = state.billing.ledger.balance(user_id).await?;
    Ok(Json(json!({
        "user_id": user_id,
        "balance": balance,
    })))
}

/// Announce a fresh consumption to the tool's webhook endpoint, plus the
/// low/depleted threshold events when the balance crossed a boundary.
/// Delivery is fire-and-forget; the HTTP response never waits on it.
fn announce_consumption(
    state: &AppState,
    tool_id: Uuid,
    user_id: Uuid,
    amount: i64,
    outcome: &ConsumeOutcome,
) {
    let webhooks = &state.billing.webhooks;
    webhooks.notify_background(
        tool_id,
        user_id,
        WebhookEventType::CreditsConsumed,
        json!({
            "amount": amount,
            "remainingCredits": outcome.balance_after,
            "transactionId": outcome.transaction_id,
        }),
    );

    if outcome.balance_after == 0 {
        webhooks.notify_background(
            tool_id,
            user_id,
            WebhookEventType::CreditsDepleted,
            json!({ "remainingCredits": 0 }),
        );
    } else if low_water_crossed(outcome.balance_before, outcome.balance_after) {
        webhooks.notify_background(
            tool_id,
            user_id,
            WebhookEventType::CreditsLow,
            json!({
                "remainingCredits": outcome.balance_after,
                "threshold": LOW_BALANCE_THRESHOLD,
            }),
        );
    }
}

/// True when this consume moved the balance from above the low-water mark
/// to at or below it. Repeated consumes under the mark stay quiet.
fn low_water_crossed(before: i64, after: i64) -> bool {
    before > LOW_BALANCE_THRESHOLD && after <= LOW_BALANCE_THRESHOLD
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_low_water_crossed_on_boundary() {
        assert!(low_water_crossed(51, 50));
        assert!(low_water_crossed(200, 3));
    }

    #[test]
    fn test_low_water_quiet_below_mark() {
        // Already under the mark before the consume: no repeat announcement.
        assert!(!low_water_crossed(50, 49));
        assert!(!low_water_crossed(10, 1));
    }

    #[test]
    fn test_low_water_quiet_above_mark() {
        assert!(!low_water_crossed(500, 51));
    }

    #[test]
    fn test_consume_body_metadata_defaults_to_none() {
        let body: ConsumeBody = serde_json::from_value(json!({
            "user_id": "5e1f6c1a-8d35-4f3e-9f2a-1c0d9b8a7e6f",
            "amount": 5,
            "reason": "api call",
            "idempotency_key": "req-1",
        }))
        .unwrap();
        assert_eq!(body.amount, 5);
        assert!(body.metadata.is_none());
    }

    #[test]
    fn test_consume_body_rejects_missing_idempotency_key() {
        let result: Result<ConsumeBody, _> = serde_json::from_value(json!({
            "user_id": "5e1f6c1a-8d35-4f3e-9f2a-1c0d9b8a7e6f",
            "amount": 5,
            "reason": "api call",
        }));
        assert!(result.is_err());
    }
}
