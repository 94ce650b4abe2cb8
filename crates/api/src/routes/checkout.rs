//! Checkout completion endpoints for the payment collaborator.
//!
//! Called server-to-server once funds have cleared. Both endpoints are
//! idempotent under redelivery: a completed checkout returns the original
//! result instead of granting twice.

use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::ApiResult;
use crate::routes::subscriptions::SubscriptionResponse;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CompleteCheckoutBody {
    pub checkout_id: Uuid,
}

/// `POST /api/v1/checkout/credits/complete`. Grants the purchased credits
/// and flips the checkout to completed.
pub async fn complete_credit_checkout(
    State(state): State<AppState>,
    Json(body): Json<CompleteCheckoutBody>,
) -> ApiResult<Json<Value>> {
    let outcome = state
        .billing
        .checkouts
        .complete_credit_checkout(body.checkout_id)
        .await?;

    Ok(Json(json!({
        "success": true,
        "new_balance": outcome.balance_after,
        "transaction_id": outcome.transaction_id,
        "is_duplicate": outcome.duplicate,
    })))
}

/// `POST /api/v1/checkout/tools/complete`. Creates the subscription (or,
/// on redelivery, returns the existing one) and grants included credits.
pub async fn complete_tool_checkout(
    State(state): State<AppState>,
    Json(body): Json<CompleteCheckoutBody>,
) -> ApiResult<Json<SubscriptionResponse>> {
    let subscription = state
        .billing
        .checkouts
        .complete_tool_checkout(body.checkout_id)
        .await?;

    Ok(Json(SubscriptionResponse::from(subscription)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_body_requires_checkout_id() {
        let result: Result<CompleteCheckoutBody, _> = serde_json::from_value(json!({}));
        assert!(result.is_err());

        let body: CompleteCheckoutBody = serde_json::from_value(json!({
            "checkout_id": "5e1f6c1a-8d35-4f3e-9f2a-1c0d9b8a7e6f"
        }))
        .unwrap();
        assert_eq!(
            body.checkout_id.to_string(),
            "5e1f6c1a-8d35-4f3e-9f2a-1c0d9b8a7e6f"
        );
    }
}
