//! Checkout completion: turns paid checkouts into credits and subscriptions.
//!
//! Called by the payment collaborator after funds clear. Payment events can
//! be redelivered, so completion is idempotent end to end: the credit grant
//! dedupes on the `checkout:<id>` key, the subscription insert dedupes on
//! the originating checkout id, and the status flip is a no-op the second
//! time. Webhooks fire only on the first completion.

use serde_json::json;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::cache::EntitlementCache;
use crate::dispatcher::WebhookDispatcher;
use crate::entitlements::{ToolSubscription, SUBSCRIPTION_COLUMNS};
use crate::error::{BillingError, BillingResult};
use crate::events::WebhookEventType;
use crate::ledger::{GrantOutcome, GrantRequest, LedgerService, TransactionType};

/// A checkout row as created by the storefront.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Checkout {
    pub id: Uuid,
    pub user_id: Uuid,
    pub tool_id: Option<Uuid>,
    pub kind: String,
    pub status: String,
    pub plan_label: Option<String>,
    pub credits_amount: i64,
    pub features: serde_json::Value,
    pub limits: serde_json::Value,
    pub created_at: OffsetDateTime,
    pub completed_at: Option<OffsetDateTime>,
}

/// Days in a billing period for a plan label.
fn period_duration_days(plan_label: &str) -> i64 {
    match plan_label {
        "yearly" | "annual" => 365,
        _ => 30,
    }
}

/// One grant per checkout, however often the payment event is redelivered.
fn checkout_idempotency_key(checkout_id: Uuid) -> String {
    format!("checkout:{checkout_id}")
}

pub struct CheckoutService {
    pool: PgPool,
    ledger: LedgerService,
    cache: EntitlementCache,
    webhooks: WebhookDispatcher,
}

impl CheckoutService {
    pub fn new(
        pool: PgPool,
        ledger: LedgerService,
        cache: EntitlementCache,
        webhooks: WebhookDispatcher,
    ) -> Self {
        Self {
            pool,
            ledger,
            cache,
            webhooks,
        }
    }

    async fn load_checkout(&self, checkout_id: Uuid) -> BillingResult<Checkout> {
        sqlx::query_as::<_, Checkout>(
            r#"
            SELECT id, user_id, tool_id, kind, status, plan_label, credits_amount,
                   features, limits, created_at, completed_at
            FROM checkouts
            WHERE id = $1
            "#,
        )
        .bind(checkout_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(BillingError::CheckoutNotFound(checkout_id))
    }

    async fn mark_completed(&self, checkout_id: Uuid) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE checkouts
            SET status = 'completed', completed_at = COALESCE(completed_at, NOW())
            WHERE id = $1
            "#,
        )
        .bind(checkout_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Complete a paid credits checkout: grant the purchased credits and
    /// flip the checkout to completed.
    ///
    /// Redelivery returns the original grant with `duplicate = true` and
    /// sends no second webhook.
    pub async fn complete_credit_checkout(
        &self,
        checkout_id: Uuid,
    ) -> BillingResult<GrantOutcome> {
        let checkout = self.load_checkout(checkout_id).await?;

        if checkout.kind != "credits" {
            return Err(BillingError::Validation(format!(
                "checkout {checkout_id} is not a credits checkout"
            )));
        }
        if checkout.status == "failed" {
            return Err(BillingError::CheckoutNotPending(checkout_id));
        }
        if checkout.credits_amount <= 0 {
            return Err(BillingError::Validation(format!(
                "credits checkout {checkout_id} has no credits amount"
            )));
        }

        let outcome = self
            .ledger
            .grant(GrantRequest {
                user_id: checkout.user_id,
                amount: checkout.credits_amount,
                reason: "Credit purchase".to_string(),
                idempotency_key: Some(checkout_idempotency_key(checkout_id)),
                transaction_type: TransactionType::Grant,
                tool_id: checkout.tool_id,
                checkout_id: Some(checkout_id),
                metadata: None,
            })
            .await?;

        self.mark_completed(checkout_id).await?;

        tracing::info!(
            checkout_id = %checkout_id,
            user_id = %checkout.user_id,
            credits = checkout.credits_amount,
            duplicate = outcome.duplicate,
            "Credit checkout completed"
        );

        // Purchases tied to a tool notify that tool's webhook; platform-wide
        // credit purchases have no destination.
        if !outcome.duplicate {
            if let Some(tool_id) = checkout.tool_id {
                self.webhooks.notify_background(
                    tool_id,
                    checkout.user_id,
                    WebhookEventType::PurchaseCompleted,
                    json!({
                        "checkoutId": checkout_id,
                        "credits": checkout.credits_amount,
                    }),
                );
            }
        }

        Ok(outcome)
    }

    /// Complete a paid tool checkout: create the subscription, grant any
    /// included credits, flip the checkout to completed.
    pub async fn complete_tool_checkout(
        &self,
        checkout_id: Uuid,
    ) -> BillingResult<ToolSubscription> {
        let checkout = self.load_checkout(checkout_id).await?;

        if checkout.kind != "tool" {
            return Err(BillingError::Validation(format!(
                "checkout {checkout_id} is not a tool checkout"
            )));
        }
        if checkout.status == "failed" {
            return Err(BillingError::CheckoutNotPending(checkout_id));
        }
        let tool_id = checkout.tool_id.ok_or_else(|| {
            BillingError::Validation(format!("tool checkout {checkout_id} has no tool id"))
        })?;

        // One subscription per originating checkout, so a redelivered
        // payment event reuses the row instead of creating a sibling.
        let existing: Option<ToolSubscription> = sqlx::query_as(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM tool_subscriptions WHERE checkout_id = $1 LIMIT 1"
        ))
        .bind(checkout_id)
        .fetch_optional(&self.pool)
        .await?;
        let redelivery = existing.is_some();

        let subscription = match existing {
            Some(subscription) => subscription,
            None => {
                let period = checkout
                    .plan_label
                    .clone()
                    .unwrap_or_else(|| "monthly".to_string());
                let next_billing_date = OffsetDateTime::now_utc()
                    + time::Duration::days(period_duration_days(&period));
                let metadata = json!({
                    "features": checkout.features,
                    "limits": checkout.limits,
                });

                sqlx::query_as(&format!(
                    "INSERT INTO tool_subscriptions
                         (user_id, tool_id, status, period, credits_per_period,
                          next_billing_date, checkout_id, metadata)
                     VALUES ($1, $2, 'active', $3, $4, $5, $6, $7)
                     RETURNING {SUBSCRIPTION_COLUMNS}"
                ))
                .bind(checkout.user_id)
                .bind(tool_id)
                .bind(&period)
                .bind(checkout.credits_amount)
                .bind(next_billing_date)
                .bind(checkout_id)
                .bind(&metadata)
                .fetch_one(&self.pool)
                .await?
            }
        };

        if checkout.credits_amount > 0 {
            self.ledger
                .grant(GrantRequest {
                    user_id: checkout.user_id,
                    amount: checkout.credits_amount,
                    reason: format!("Included credits ({})", subscription.period),
                    idempotency_key: Some(checkout_idempotency_key(checkout_id)),
                    transaction_type: TransactionType::Grant,
                    tool_id: Some(tool_id),
                    checkout_id: Some(checkout_id),
                    metadata: None,
                })
                .await?;
        }

        self.mark_completed(checkout_id).await?;
        self.cache.invalidate(tool_id, checkout.user_id).await;

        tracing::info!(
            checkout_id = %checkout_id,
            user_id = %checkout.user_id,
            tool_id = %tool_id,
            subscription_id = %subscription.id,
            plan = %subscription.period,
            redelivery = redelivery,
            "Tool checkout completed"
        );

        if !redelivery {
            self.webhooks.notify_background(
                tool_id,
                checkout.user_id,
                WebhookEventType::SubscriptionCreated,
                json!({
                    "subscriptionId": subscription.id,
                    "planId": subscription.period,
                    "status": subscription.status,
                }),
            );
        }

        Ok(subscription)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_labels_map_to_period_lengths() {
        assert_eq!(period_duration_days("monthly"), 30);
        assert_eq!(period_duration_days("yearly"), 365);
        assert_eq!(period_duration_days("annual"), 365);
        assert_eq!(period_duration_days("team-pro"), 30);
    }

    #[test]
    fn checkout_keys_are_stable_per_checkout() {
        let id = Uuid::new_v4();
        assert_eq!(checkout_idempotency_key(id), format!("checkout:{id}"));
        assert_eq!(checkout_idempotency_key(id), checkout_idempotency_key(id));
        assert_ne!(
            checkout_idempotency_key(id),
            checkout_idempotency_key(Uuid::new_v4())
        );
    }
}
