//! Entitlement resolution: merges the authoritative tool subscription,
//! tool/plan metadata and the live credit balance into one access view.
//!
//! Resolution order: (1) the single authoritative subscription row, (2) the
//! live balance (best-effort, a failure leaves `creditsRemaining` null
//! rather than failing the call), (3) tool-level features/limits merged
//! with the plan metadata frozen on the originating checkout, (4) derived
//! flags. Subscription/metadata query failures surface as
//! [`BillingError::LookupFailed`]; callers treat that as deny.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::cache::{CacheOptions, CachedEntitlements, EntitlementCache};
use crate::error::{BillingError, BillingResult};
use crate::ledger::LedgerService;

/// Subscription lifecycle status. `None` is resolver-only (no stored row).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Trialing,
    PastDue,
    Cancelled,
    Paused,
    Failed,
    None,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Trialing => "trialing",
            Self::PastDue => "past_due",
            Self::Cancelled => "cancelled",
            Self::Paused => "paused",
            Self::Failed => "failed",
            Self::None => "none",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "trialing" => Some(Self::Trialing),
            "past_due" => Some(Self::PastDue),
            "cancelled" => Some(Self::Cancelled),
            "paused" => Some(Self::Paused),
            "failed" => Some(Self::Failed),
            "none" => Some(Self::None),
            _ => None,
        }
    }

    /// Statuses that make a subscription row authoritative for entitlement
    /// purposes (past_due keeps access while payment recovery runs).
    pub fn is_authoritative(&self) -> bool {
        matches!(self, Self::Active | Self::Trialing | Self::PastDue)
    }

    /// Statuses that grant access right now.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active | Self::Trialing)
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A user's enrollment in a tool's billing plan.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ToolSubscription {
    pub id: Uuid,
    pub user_id: Uuid,
    pub tool_id: Uuid,
    pub status: String,
    /// Plan label doubling as planId ("monthly", "yearly", vendor-specific).
    pub period: String,
    pub credits_per_period: i64,
    pub next_billing_date: Option<OffsetDateTime>,
    pub cancelled_at: Option<OffsetDateTime>,
    pub checkout_id: Option<Uuid>,
    pub metadata: serde_json::Value,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// The resolved access view for a (user, tool) pair. Computed, never stored.
/// Serializes camelCase; timestamps are epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Entitlements {
    pub plan_id: Option<String>,
    pub credits_remaining: Option<i64>,
    pub features: Vec<String>,
    pub limits: BTreeMap<String, i64>,
    pub status: SubscriptionStatus,
    pub active: bool,
    pub current_period_end: Option<i64>,
    pub cancel_at_period_end: bool,
}

/// Typed feature/limit metadata parsed at the boundary from the JSONB
/// blobs on `tools` and `checkouts`. Unknown or non-conforming entries are
/// ignored rather than rejected.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct PlanMeta {
    pub features: Vec<String>,
    pub limits: BTreeMap<String, i64>,
}

impl PlanMeta {
    pub(crate) fn from_json(features: &serde_json::Value, limits: &serde_json::Value) -> Self {
        let features = features
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();
        let limits = limits
            .as_object()
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|(k, v)| v.as_i64().map(|n| (k.clone(), n)))
                    .collect()
            })
            .unwrap_or_default();
        Self { features, limits }
    }
}

/// Known subscription metadata flags; unknown keys are ignored.
#[derive(Debug, Default, Deserialize)]
struct SubscriptionFlags {
    #[serde(default)]
    cancel_at_period_end: bool,
}

fn parse_flags(metadata: &serde_json::Value) -> SubscriptionFlags {
    serde_json::from_value(metadata.clone()).unwrap_or_default()
}

pub(crate) fn epoch_millis(t: OffsetDateTime) -> i64 {
    (t.unix_timestamp_nanos() / 1_000_000) as i64
}

/// Merge a resolved subscription with metadata and balance. Pure; the
/// service methods only do the fetching.
fn resolve_entitlements(
    sub: &ToolSubscription,
    balance: Option<i64>,
    tool_meta: &PlanMeta,
    plan_meta: Option<&PlanMeta>,
) -> Entitlements {
    let status = SubscriptionStatus::parse(&sub.status).unwrap_or(SubscriptionStatus::None);

    // Features union tool-level and plan-level; plan limits override
    // tool-level defaults key by key.
    let mut features: BTreeSet<String> = tool_meta.features.iter().cloned().collect();
    let mut limits = tool_meta.limits.clone();
    if let Some(plan) = plan_meta {
        features.extend(plan.features.iter().cloned());
        limits.extend(plan.limits.iter().map(|(k, v)| (k.clone(), *v)));
    }

    Entitlements {
        plan_id: Some(sub.period.clone()),
        credits_remaining: balance,
        features: features.into_iter().collect(),
        limits,
        status,
        active: status.is_active(),
        current_period_end: sub.next_billing_date.map(epoch_millis),
        cancel_at_period_end: parse_flags(&sub.metadata).cancel_at_period_end,
    }
}

/// Access view when no authoritative subscription exists: `cancelled` when
/// a historical cancelled row is present, `none` otherwise.
fn inactive_entitlements(cancelled: Option<&ToolSubscription>) -> Entitlements {
    match cancelled {
        Some(sub) => Entitlements {
            plan_id: Some(sub.period.clone()),
            credits_remaining: None,
            features: Vec::new(),
            limits: BTreeMap::new(),
            status: SubscriptionStatus::Cancelled,
            active: false,
            current_period_end: sub.next_billing_date.map(epoch_millis),
            cancel_at_period_end: parse_flags(&sub.metadata).cancel_at_period_end,
        },
        None => Entitlements {
            plan_id: None,
            credits_remaining: None,
            features: Vec::new(),
            limits: BTreeMap::new(),
            status: SubscriptionStatus::None,
            active: false,
            current_period_end: None,
            cancel_at_period_end: false,
        },
    }
}

pub(crate) const SUBSCRIPTION_COLUMNS: &str =
    "id, user_id, tool_id, status, period, credits_per_period, \
     next_billing_date, cancelled_at, checkout_id, metadata, created_at, updated_at";

/// The single authoritative subscription row for (user, tool): status in
/// {active, trialing, past_due}, most recently created wins.
pub(crate) async fn authoritative_subscription(
    pool: &PgPool,
    user_id: Uuid,
    tool_id: Uuid,
) -> Result<Option<ToolSubscription>, sqlx::Error> {
    sqlx::query_as::<_, ToolSubscription>(&format!(
        "SELECT {SUBSCRIPTION_COLUMNS} FROM tool_subscriptions
         WHERE user_id = $1 AND tool_id = $2
           AND status IN ('active', 'trialing', 'past_due')
         ORDER BY created_at DESC
         LIMIT 1"
    ))
    .bind(user_id)
    .bind(tool_id)
    .fetch_optional(pool)
    .await
}

async fn cancelled_subscription(
    pool: &PgPool,
    user_id: Uuid,
    tool_id: Uuid,
) -> Result<Option<ToolSubscription>, sqlx::Error> {
    sqlx::query_as::<_, ToolSubscription>(&format!(
        "SELECT {SUBSCRIPTION_COLUMNS} FROM tool_subscriptions
         WHERE user_id = $1 AND tool_id = $2 AND status = 'cancelled'
         ORDER BY created_at DESC
         LIMIT 1"
    ))
    .bind(user_id)
    .bind(tool_id)
    .fetch_optional(pool)
    .await
}

async fn fetch_tool_meta(pool: &PgPool, tool_id: Uuid) -> Result<PlanMeta, sqlx::Error> {
    let row: Option<(serde_json::Value, serde_json::Value)> =
        sqlx::query_as("SELECT features, limits FROM tools WHERE id = $1")
            .bind(tool_id)
            .fetch_optional(pool)
            .await?;
    Ok(row
        .map(|(features, limits)| PlanMeta::from_json(&features, &limits))
        .unwrap_or_default())
}

async fn fetch_checkout_meta(pool: &PgPool, checkout_id: Uuid) -> Result<Option<PlanMeta>, sqlx::Error> {
    let row: Option<(serde_json::Value, serde_json::Value)> =
        sqlx::query_as("SELECT features, limits FROM checkouts WHERE id = $1")
            .bind(checkout_id)
            .fetch_optional(pool)
            .await?;
    Ok(row.map(|(features, limits)| PlanMeta::from_json(&features, &limits)))
}

/// Entitlement resolver plus its read-through cache.
#[derive(Clone)]
pub struct EntitlementService {
    pool: PgPool,
    ledger: LedgerService,
    cache: EntitlementCache,
}

impl EntitlementService {
    pub fn new(pool: PgPool, cache: EntitlementCache) -> Self {
        let ledger = LedgerService::new(pool.clone());
        Self {
            pool,
            ledger,
            cache,
        }
    }

    /// Resolve entitlements for one (user, tool) pair, uncached.
    pub async fn get_entitlements(
        &self,
        user_id: Uuid,
        tool_id: Uuid,
    ) -> BillingResult<Entitlements> {
        let sub = authoritative_subscription(&self.pool, user_id, tool_id)
            .await
            .map_err(|e| {
                tracing::error!(user_id = %user_id, tool_id = %tool_id, error = %e, "subscription lookup failed");
                BillingError::LookupFailed(e.to_string())
            })?;

        let Some(sub) = sub else {
            let cancelled = cancelled_subscription(&self.pool, user_id, tool_id)
                .await
                .map_err(|e| BillingError::LookupFailed(e.to_string()))?;
            return Ok(inactive_entitlements(cancelled.as_ref()));
        };

        // Best-effort: a balance failure degrades to creditsRemaining null.
        let balance = match self.ledger.balance(user_id).await {
            Ok(balance) => Some(balance),
            Err(e) => {
                tracing::warn!(user_id = %user_id, error = %e, "balance lookup failed during entitlement resolution");
                None
            }
        };

        let tool_meta = fetch_tool_meta(&self.pool, tool_id)
            .await
            .map_err(|e| BillingError::LookupFailed(e.to_string()))?;
        let plan_meta = match sub.checkout_id {
            Some(checkout_id) => fetch_checkout_meta(&self.pool, checkout_id)
                .await
                .map_err(|e| BillingError::LookupFailed(e.to_string()))?,
            None => None,
        };

        Ok(resolve_entitlements(
            &sub,
            balance,
            &tool_meta,
            plan_meta.as_ref(),
        ))
    }

    /// Bulk resolution for dashboard-style views: one subscription query and
    /// one balance lookup for all tools. Features/limits are tool-level only
    /// on this path (no per-checkout plan join).
    pub async fn get_entitlements_for_tools(
        &self,
        user_id: Uuid,
        tool_ids: &[Uuid],
    ) -> BillingResult<HashMap<Uuid, Entitlements>> {
        if tool_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let subs = sqlx::query_as::<_, ToolSubscription>(&format!(
            "SELECT DISTINCT ON (tool_id) {SUBSCRIPTION_COLUMNS}
             FROM tool_subscriptions
             WHERE user_id = $1 AND tool_id = ANY($2)
               AND status IN ('active', 'trialing', 'past_due')
             ORDER BY tool_id, created_at DESC"
        ))
        .bind(user_id)
        .bind(tool_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| BillingError::LookupFailed(e.to_string()))?;

        let balance = match self.ledger.balance(user_id).await {
            Ok(balance) => Some(balance),
            Err(e) => {
                tracing::warn!(user_id = %user_id, error = %e, "balance lookup failed during bulk entitlement resolution");
                None
            }
        };

        let meta_rows: Vec<(Uuid, serde_json::Value, serde_json::Value)> =
            sqlx::query_as("SELECT id, features, limits FROM tools WHERE id = ANY($1)")
                .bind(tool_ids)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| BillingError::LookupFailed(e.to_string()))?;
        let tool_metas: HashMap<Uuid, PlanMeta> = meta_rows
            .into_iter()
            .map(|(id, features, limits)| (id, PlanMeta::from_json(&features, &limits)))
            .collect();

        let authoritative: HashMap<Uuid, ToolSubscription> =
            subs.into_iter().map(|s| (s.tool_id, s)).collect();

        let missing: Vec<Uuid> = tool_ids
            .iter()
            .filter(|id| !authoritative.contains_key(id))
            .copied()
            .collect();
        let cancelled: HashMap<Uuid, ToolSubscription> = if missing.is_empty() {
            HashMap::new()
        } else {
            sqlx::query_as::<_, ToolSubscription>(&format!(
                "SELECT DISTINCT ON (tool_id) {SUBSCRIPTION_COLUMNS}
                 FROM tool_subscriptions
                 WHERE user_id = $1 AND tool_id = ANY($2) AND status = 'cancelled'
                 ORDER BY tool_id, created_at DESC"
            ))
            .bind(user_id)
            .bind(&missing)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| BillingError::LookupFailed(e.to_string()))?
            .into_iter()
            .map(|s| (s.tool_id, s))
            .collect()
        };

        let empty = PlanMeta::default();
        let mut result = HashMap::with_capacity(tool_ids.len());
        for tool_id in tool_ids {
            let entry = match authoritative.get(tool_id) {
                Some(sub) => resolve_entitlements(
                    sub,
                    balance,
                    tool_metas.get(tool_id).unwrap_or(&empty),
                    None,
                ),
                None => inactive_entitlements(cancelled.get(tool_id)),
            };
            result.insert(*tool_id, entry);
        }
        Ok(result)
    }

    /// Read-through cached resolution with the vendor-facing authority
    /// window. See [`CacheOptions`] for the knobs.
    pub async fn get_with_cache(
        &self,
        user_id: Uuid,
        tool_id: Uuid,
        opts: CacheOptions,
    ) -> BillingResult<CachedEntitlements> {
        if !opts.bypass_cache {
            if let Some(hit) = self.cache.get(tool_id, user_id).await {
                let mut entitlements = hit.entitlements;
                // Bounded-cost refresh: on request, overlay just the live
                // balance without a full resolver pass. Only meaningful for
                // entries whose resolution carried a balance at all.
                if opts.fresh_credits && entitlements.status.is_authoritative() {
                    match self.ledger.balance(user_id).await {
                        Ok(balance) => entitlements.credits_remaining = Some(balance),
                        Err(e) => {
                            tracing::warn!(user_id = %user_id, error = %e, "fresh credits overlay failed; serving cached balance");
                        }
                    }
                }
                return Ok(CachedEntitlements {
                    entitlements,
                    from_cache: true,
                    authority_expires_at: epoch_millis(hit.expires_at),
                });
            }
        }

        let entitlements = self.get_entitlements(user_id, tool_id).await?;
        let expires_at = self
            .cache
            .insert(tool_id, user_id, entitlements.clone(), opts.ttl)
            .await;
        Ok(CachedEntitlements {
            entitlements,
            from_cache: false,
            authority_expires_at: epoch_millis(expires_at),
        })
    }

    /// Evict the cached view for (user, tool). Must complete before any
    /// webhook announcing the underlying change goes out.
    pub async fn invalidate(&self, user_id: Uuid, tool_id: Uuid) {
        self.cache.invalidate(tool_id, user_id).await;
    }

    pub fn cache(&self) -> &EntitlementCache {
        &self.cache
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn subscription(status: &str, metadata: serde_json::Value) -> ToolSubscription {
        let now = OffsetDateTime::now_utc();
        ToolSubscription {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            tool_id: Uuid::new_v4(),
            status: status.to_string(),
            period: "monthly".to_string(),
            credits_per_period: 500,
            next_billing_date: Some(now + time::Duration::days(30)),
            cancelled_at: None,
            checkout_id: None,
            metadata,
            created_at: now,
            updated_at: now,
        }
    }

    fn meta(features: &[&str], limits: &[(&str, i64)]) -> PlanMeta {
        PlanMeta {
            features: features.iter().map(|s| s.to_string()).collect(),
            limits: limits.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
        }
    }

    #[test]
    fn active_subscription_with_balance() {
        let sub = subscription("active", json!({}));
        let resolved = resolve_entitlements(&sub, Some(85), &meta(&["api"], &[]), None);
        assert!(resolved.active);
        assert_eq!(resolved.status, SubscriptionStatus::Active);
        assert_eq!(resolved.credits_remaining, Some(85));
        assert_eq!(resolved.plan_id.as_deref(), Some("monthly"));
        assert!(resolved.current_period_end.is_some());
    }

    #[test]
    fn features_union_and_plan_limits_override() {
        let sub = subscription("active", json!({}));
        let tool_meta = meta(&["api", "export"], &[("requests_per_day", 100), ("seats", 1)]);
        let plan_meta = meta(&["export", "priority"], &[("requests_per_day", 1000)]);
        let resolved = resolve_entitlements(&sub, Some(10), &tool_meta, Some(&plan_meta));

        assert_eq!(resolved.features, vec!["api", "export", "priority"]);
        assert_eq!(resolved.limits.get("requests_per_day"), Some(&1000));
        assert_eq!(resolved.limits.get("seats"), Some(&1));
    }

    #[test]
    fn past_due_is_authoritative_but_not_active() {
        let sub = subscription("past_due", json!({}));
        let resolved = resolve_entitlements(&sub, Some(10), &PlanMeta::default(), None);
        assert_eq!(resolved.status, SubscriptionStatus::PastDue);
        assert!(!resolved.active);
        assert!(resolved.status.is_authoritative());
    }

    #[test]
    fn trialing_is_active() {
        let sub = subscription("trialing", json!({}));
        let resolved = resolve_entitlements(&sub, None, &PlanMeta::default(), None);
        assert!(resolved.active);
    }

    #[test]
    fn balance_failure_leaves_credits_null() {
        let sub = subscription("active", json!({}));
        let resolved = resolve_entitlements(&sub, None, &PlanMeta::default(), None);
        assert!(resolved.active);
        assert_eq!(resolved.credits_remaining, None);
    }

    #[test]
    fn cancel_at_period_end_flag_parses() {
        let flagged = subscription("active", json!({"cancel_at_period_end": true}));
        assert!(resolve_entitlements(&flagged, None, &PlanMeta::default(), None).cancel_at_period_end);

        let unflagged = subscription("active", json!({}));
        assert!(!resolve_entitlements(&unflagged, None, &PlanMeta::default(), None).cancel_at_period_end);

        // Unknown keys and junk shapes are ignored, not errors.
        let junk = subscription("active", json!({"cancel_at_period_end": "yes", "unknown": 1}));
        assert!(!resolve_entitlements(&junk, None, &PlanMeta::default(), None).cancel_at_period_end);
    }

    #[test]
    fn no_subscription_resolves_to_none() {
        let resolved = inactive_entitlements(None);
        assert_eq!(resolved.status, SubscriptionStatus::None);
        assert!(!resolved.active);
        assert_eq!(resolved.plan_id, None);
        assert_eq!(resolved.credits_remaining, None);
    }

    #[test]
    fn cancelled_row_resolves_to_cancelled() {
        let cancelled = subscription("cancelled", json!({"cancel_at_period_end": true}));
        let resolved = inactive_entitlements(Some(&cancelled));
        assert_eq!(resolved.status, SubscriptionStatus::Cancelled);
        assert!(!resolved.active);
        assert_eq!(resolved.plan_id.as_deref(), Some("monthly"));
        assert!(resolved.cancel_at_period_end);
    }

    #[test]
    fn plan_meta_ignores_malformed_entries() {
        let parsed = PlanMeta::from_json(
            &json!(["api", 7, {"nested": true}, "export"]),
            &json!({"rate": 10, "label": "premium", "fraction": 0.5}),
        );
        assert_eq!(parsed.features, vec!["api", "export"]);
        assert_eq!(parsed.limits.len(), 1);
        assert_eq!(parsed.limits.get("rate"), Some(&10));

        let not_even_close = PlanMeta::from_json(&json!("nope"), &json!(42));
        assert_eq!(not_even_close, PlanMeta::default());
    }

    #[test]
    fn status_string_roundtrip() {
        for status in [
            SubscriptionStatus::Active,
            SubscriptionStatus::Trialing,
            SubscriptionStatus::PastDue,
            SubscriptionStatus::Cancelled,
            SubscriptionStatus::Paused,
            SubscriptionStatus::Failed,
            SubscriptionStatus::None,
        ] {
            assert_eq!(SubscriptionStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(SubscriptionStatus::parse("bogus"), None);
    }

    #[test]
    fn entitlements_serialize_camel_case() {
        let sub = subscription("active", json!({}));
        let resolved = resolve_entitlements(&sub, Some(42), &PlanMeta::default(), None);
        let value = serde_json::to_value(&resolved).unwrap();

        assert_eq!(value["planId"], json!("monthly"));
        assert_eq!(value["creditsRemaining"], json!(42));
        assert_eq!(value["status"], json!("active"));
        assert_eq!(value["active"], json!(true));
        assert!(value.get("currentPeriodEnd").is_some());
        assert_eq!(value["cancelAtPeriodEnd"], json!(false));
    }

    #[test]
    fn epoch_millis_matches_unix_seconds() {
        let t = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
        assert_eq!(epoch_millis(t), 1_700_000_000_000);
    }
}
