//! Subscription lifecycle mutations driven by the payment collaborator.
//!
//! Every mutation invalidates the entitlement cache for the pair before
//! returning, then notifies the tool in the background. The cache drop is
//! awaited so a verify call racing the mutation can never re-read the old
//! grant from this process.

use serde_json::json;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::cache::EntitlementCache;
use crate::dispatcher::WebhookDispatcher;
use crate::entitlements::{epoch_millis, SubscriptionStatus, ToolSubscription, SUBSCRIPTION_COLUMNS};
use crate::error::{BillingError, BillingResult};
use crate::events::WebhookEventType;
use crate::ledger::{GrantRequest, LedgerService, TransactionType};

/// Which event a status transition announces to the vendor.
fn status_change_event(previous: &str, new_status: SubscriptionStatus) -> WebhookEventType {
    match new_status {
        SubscriptionStatus::Active if matches!(previous, "trialing" | "past_due") => {
            WebhookEventType::SubscriptionActivated
        }
        SubscriptionStatus::Cancelled => WebhookEventType::SubscriptionCanceled,
        _ => WebhookEventType::SubscriptionUpdated,
    }
}

/// One grant per subscription per billing date, however often the payment
/// collaborator redelivers the renewal event.
fn renewal_idempotency_key(subscription_id: Uuid, next_billing_date: OffsetDateTime) -> String {
    format!(
        "renewal:{}:{}",
        subscription_id,
        next_billing_date.unix_timestamp()
    )
}

pub struct SubscriptionService {
    pool: PgPool,
    ledger: LedgerService,
    cache: EntitlementCache,
    webhooks: WebhookDispatcher,
}

impl SubscriptionService {
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

    /// Latest not-yet-cancelled subscription for the pair.
    async fn current_subscription(
        &self,
        user_id: Uuid,
        tool_id: Uuid,
    ) -> BillingResult<ToolSubscription> {
        sqlx::query_as::<_, ToolSubscription>(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM tool_subscriptions
             WHERE user_id = $1 AND tool_id = $2 AND status <> 'cancelled'
             ORDER BY created_at DESC
             LIMIT 1"
        ))
        .bind(user_id)
        .bind(tool_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(BillingError::SubscriptionNotFound { user_id, tool_id })
    }

    /// Cancel a subscription, either at the period boundary or immediately.
    ///
    /// Period-end cancellation keeps the current status and sets the
    /// `cancel_at_period_end` metadata flag, so access runs out with the
    /// paid period; immediate cancellation revokes access now.
    pub async fn cancel(
        &self,
        user_id: Uuid,
        tool_id: Uuid,
        at_period_end: bool,
    ) -> BillingResult<ToolSubscription> {
        let subscription = self.current_subscription(user_id, tool_id).await?;

        let updated: ToolSubscription = if at_period_end {
            sqlx::query_as(&format!(
                "UPDATE tool_subscriptions
                 SET metadata = jsonb_set(metadata, '{{cancel_at_period_end}}', 'true'::jsonb),
                     cancelled_at = COALESCE(cancelled_at, NOW()),
                     updated_at = NOW()
                 WHERE id = $1
                 RETURNING {SUBSCRIPTION_COLUMNS}"
            ))
            .bind(subscription.id)
            .fetch_one(&self.pool)
            .await?
        } else {
            sqlx::query_as(&format!(
                "UPDATE tool_subscriptions
                 SET status = 'cancelled',
                     cancelled_at = COALESCE(cancelled_at, NOW()),
                     updated_at = NOW()
                 WHERE id = $1
                 RETURNING {SUBSCRIPTION_COLUMNS}"
            ))
            .bind(subscription.id)
            .fetch_one(&self.pool)
            .await?
        };

        self.cache.invalidate(tool_id, user_id).await;

        tracing::info!(
            user_id = %user_id,
            tool_id = %tool_id,
            subscription_id = %updated.id,
            at_period_end = at_period_end,
            "Subscription cancelled"
        );

        self.webhooks.notify_background(
            tool_id,
            user_id,
            WebhookEventType::SubscriptionCanceled,
            json!({
                "subscriptionId": updated.id,
                "planId": updated.period,
                "atPeriodEnd": at_period_end,
                "status": updated.status,
            }),
        );

        Ok(updated)
    }

    /// Apply an upstream payment-state transition.
    ///
    /// Same-status calls are no-ops. A transition to active from
    /// trialing/past_due announces `subscription.activated`, a transition
    /// to cancelled announces `subscription.canceled`, everything else
    /// `subscription.updated`.
    pub async fn set_status(
        &self,
        user_id: Uuid,
        tool_id: Uuid,
        new_status: SubscriptionStatus,
    ) -> BillingResult<ToolSubscription> {
        if new_status == SubscriptionStatus::None {
            return Err(BillingError::Validation(
                "cannot store the synthetic 'none' status".to_string(),
            ));
        }

        let subscription = self.current_subscription(user_id, tool_id).await?;

        if subscription.status == new_status.as_str() {
            tracing::debug!(
                subscription_id = %subscription.id,
                status = %new_status,
                "Subscription status unchanged"
            );
            return Ok(subscription);
        }

        let updated: ToolSubscription = sqlx::query_as(&format!(
            "UPDATE tool_subscriptions
             SET status = $2,
                 cancelled_at = CASE WHEN $2 = 'cancelled'
                                     THEN COALESCE(cancelled_at, NOW())
                                     ELSE cancelled_at END,
                 updated_at = NOW()
             WHERE id = $1
             RETURNING {SUBSCRIPTION_COLUMNS}"
        ))
        .bind(subscription.id)
        .bind(new_status.as_str())
        .fetch_one(&self.pool)
        .await?;

        self.cache.invalidate(tool_id, user_id).await;

        tracing::info!(
            user_id = %user_id,
            tool_id = %tool_id,
            subscription_id = %updated.id,
            previous = %subscription.status,
            status = %new_status,
            "Subscription status changed"
        );

        self.webhooks.notify_background(
            tool_id,
            user_id,
            status_change_event(&subscription.status, new_status),
            json!({
                "subscriptionId": updated.id,
                "planId": updated.period,
                "previousStatus": subscription.status,
                "status": updated.status,
            }),
        );

        Ok(updated)
    }

    /// Advance the billing period and grant the period's included credits.
    pub async fn record_renewal(
        &self,
        user_id: Uuid,
        tool_id: Uuid,
        next_billing_date: OffsetDateTime,
    ) -> BillingResult<ToolSubscription> {
        let subscription = self.current_subscription(user_id, tool_id).await?;

        let updated: ToolSubscription = sqlx::query_as(&format!(
            "UPDATE tool_subscriptions
             SET next_billing_date = $2, updated_at = NOW()
             WHERE id = $1
             RETURNING {SUBSCRIPTION_COLUMNS}"
        ))
        .bind(subscription.id)
        .bind(next_billing_date)
        .fetch_one(&self.pool)
        .await?;

        if subscription.credits_per_period > 0 {
            self.ledger
                .grant(GrantRequest {
                    user_id,
                    amount: subscription.credits_per_period,
                    reason: format!("Subscription renewal ({})", subscription.period),
                    idempotency_key: Some(renewal_idempotency_key(
                        subscription.id,
                        next_billing_date,
                    )),
                    transaction_type: TransactionType::Grant,
                    tool_id: Some(tool_id),
                    checkout_id: None,
                    metadata: None,
                })
                .await?;
        }

        self.cache.invalidate(tool_id, user_id).await;

        tracing::info!(
            user_id = %user_id,
            tool_id = %tool_id,
            subscription_id = %updated.id,
            next_billing_date = %next_billing_date,
            credits_granted = subscription.credits_per_period,
            "Subscription renewed"
        );

        self.webhooks.notify_background(
            tool_id,
            user_id,
            WebhookEventType::SubscriptionUpdated,
            json!({
                "subscriptionId": updated.id,
                "planId": updated.period,
                "nextBillingDate": updated.next_billing_date.map(epoch_millis),
                "creditsGranted": subscription.credits_per_period,
            }),
        );

        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn activation_only_from_trialing_or_past_due() {
        assert_eq!(
            status_change_event("trialing", SubscriptionStatus::Active),
            WebhookEventType::SubscriptionActivated
        );
        assert_eq!(
            status_change_event("past_due", SubscriptionStatus::Active),
            WebhookEventType::SubscriptionActivated
        );
        assert_eq!(
            status_change_event("paused", SubscriptionStatus::Active),
            WebhookEventType::SubscriptionUpdated
        );
    }

    #[test]
    fn cancellation_announces_canceled() {
        assert_eq!(
            status_change_event("active", SubscriptionStatus::Cancelled),
            WebhookEventType::SubscriptionCanceled
        );
    }

    #[test]
    fn other_transitions_announce_updated() {
        assert_eq!(
            status_change_event("active", SubscriptionStatus::PastDue),
            WebhookEventType::SubscriptionUpdated
        );
        assert_eq!(
            status_change_event("active", SubscriptionStatus::Paused),
            WebhookEventType::SubscriptionUpdated
        );
        assert_eq!(
            status_change_event("trialing", SubscriptionStatus::Failed),
            WebhookEventType::SubscriptionUpdated
        );
    }

    #[test]
    fn renewal_keys_are_scoped_to_the_billing_date() {
        let sub_id = Uuid::new_v4();
        let date_a = OffsetDateTime::from_unix_timestamp(1_706_400_000).unwrap();
        let date_b = OffsetDateTime::from_unix_timestamp(1_709_078_400).unwrap();

        assert_eq!(
            renewal_idempotency_key(sub_id, date_a),
            renewal_idempotency_key(sub_id, date_a)
        );
        assert_ne!(
            renewal_idempotency_key(sub_id, date_a),
            renewal_idempotency_key(sub_id, date_b)
        );
        assert!(renewal_idempotency_key(sub_id, date_a).starts_with("renewal:"));
    }
}
