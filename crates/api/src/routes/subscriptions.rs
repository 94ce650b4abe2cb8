//! Subscription lifecycle endpoints for the payment collaborator.

use axum::extract::State;
use axum::Json;
use onesub_billing::ToolSubscription;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CancelBody {
    pub user_id: Uuid,
    pub tool_id: Uuid,
    /// True: keep access until the paid period runs out. False: revoke now.
    #[serde(default)]
    pub at_period_end: bool,
}

#[derive(Debug, Deserialize)]
pub struct RenewBody {
    pub user_id: Uuid,
    pub tool_id: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    pub next_billing_date: OffsetDateTime,
}

/// Subscription state as reported back to the collaborator.
#[derive(Debug, Serialize)]
pub struct SubscriptionResponse {
    pub success: bool,
    pub subscription_id: Uuid,
    pub user_id: Uuid,
    pub tool_id: Uuid,
    pub status: String,
    pub plan_id: String,
    #[serde(with = "time::serde::rfc3339::option")]
    pub next_billing_date: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
}

impl From<ToolSubscription> for SubscriptionResponse {
    fn from(subscription: ToolSubscription) -> Self {
        let cancel_at_period_end = subscription
            .metadata
            .get("cancel_at_period_end")
            .and_then(|flag| flag.as_bool())
            .unwrap_or(false);

        Self {
            success: true,
            subscription_id: subscription.id,
            user_id: subscription.user_id,
            tool_id: subscription.tool_id,
            status: subscription.status,
            plan_id: subscription.period,
            next_billing_date: subscription.next_billing_date,
            cancel_at_period_end,
        }
    }
}

/// `POST /api/v1/subscriptions/cancel`.
pub async fn cancel_subscription(
    State(state): State<AppState>,
    Json(body): Json<CancelBody>,
) -> ApiResult<Json<SubscriptionResponse>> {
    let subscription = state
        .billing
        .subscriptions
        .cancel(body.user_id, body.tool_id, body.at_period_end)
        .await?;

    Ok(Json(SubscriptionResponse::from(subscription)))
}

/// `POST /api/v1/subscriptions/renew`. Advances the billing period and
/// grants the period's included credits (idempotent per period).
pub async fn renew_subscription(
    State(state): State<AppState>,
    Json(body): Json<RenewBody>,
) -> ApiResult<Json<SubscriptionResponse>> {
    let subscription = state
        .billing
        .subscriptions
        .record_renewal(body.user_id, body.tool_id, body.next_billing_date)
        .await?;

    Ok(Json(SubscriptionResponse::from(subscription)))
}
