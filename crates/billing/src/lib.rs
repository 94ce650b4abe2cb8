// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! 1sub Billing Core
//!
//! The entitlement and credit engine behind the 1sub marketplace.
//!
//! ## Features
//!
//! - **Credit Ledger**: Append-only transactions with atomic, idempotent
//!   consume and grant
//! - **Entitlements**: Subscription + balance + plan metadata resolved into
//!   a single access view
//! - **Entitlement Cache**: Process-local read-through cache with TTL expiry
//! - **Webhooks**: Signed event notifications to vendor tools
//! - **Retry Queue**: Fixed-backoff redelivery with a dead-letter sink
//! - **Checkout Completion**: Payment-collaborator driven credit purchases
//!   and subscription creation

pub mod cache;
pub mod checkout;
pub mod crypto;
pub mod dispatcher;
pub mod entitlements;
pub mod error;
pub mod events;
pub mod ledger;
pub mod retry;
pub mod subscriptions;

#[cfg(test)]
mod edge_case_tests;

// Cache
pub use cache::{CacheOptions, CachedEntitlements, EntitlementCache, DEFAULT_TTL};

// Checkout
pub use checkout::{Checkout, CheckoutService};

// Crypto
pub use crypto::{SIGNATURE_HEADER, SIGNATURE_TOLERANCE_SECS};

// Dispatcher
pub use dispatcher::{
    build_http_client, is_retryable, DeliveryAttempt, ToolWebhookConfig, WebhookDispatcher,
    WEBHOOK_TIMEOUT, WEBHOOK_USER_AGENT,
};

// Entitlements
pub use entitlements::{EntitlementService, Entitlements, SubscriptionStatus, ToolSubscription};

// Error
pub use error::{BillingError, BillingResult};

// Events
pub use events::{WebhookEnvelope, WebhookEventType};

// Ledger
pub use ledger::{
    ConsumeOutcome, ConsumeRequest, ConsumeStatus, CreditTransaction, GrantOutcome, GrantRequest,
    LedgerService, TransactionType, MAX_AMOUNT, MAX_IDEMPOTENCY_KEY_LEN, MAX_REASON_LEN,
};

// Retry
pub use retry::{
    backoff_interval_secs, DeadLetterEntry, RetryQueueEntry, RetryService, RetrySweepStats,
    BACKOFF_SCHEDULE_SECS, MAX_RETRIES,
};

// Subscriptions
pub use subscriptions::SubscriptionService;

use std::time::Duration;

use sqlx::PgPool;

/// Runtime configuration for the billing services.
#[derive(Clone)]
pub struct BillingConfig {
    /// AES-256 key for webhook secrets at rest (`WEBHOOK_ENCRYPTION_KEY`,
    /// 64 hex chars).
    pub webhook_encryption_key: [u8; 32],
    /// TTL for cached entitlements (`ENTITLEMENT_CACHE_TTL_SECS`).
    pub entitlement_cache_ttl: Duration,
}

impl BillingConfig {
    /// Load from environment variables.
    pub fn from_env() -> BillingResult<Self> {
        let hex_key = std::env::var("WEBHOOK_ENCRYPTION_KEY").map_err(|_| {
            BillingError::Internal("WEBHOOK_ENCRYPTION_KEY is not set".to_string())
        })?;
        let webhook_encryption_key = crypto::parse_encryption_key(&hex_key)?;

        let entitlement_cache_ttl = std::env::var("ENTITLEMENT_CACHE_TTL_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TTL);

        Ok(Self {
            webhook_encryption_key,
            entitlement_cache_ttl,
        })
    }
}

/// Main billing service that combines all billing functionality.
///
/// One instance per process: the entitlement cache and the webhook HTTP
/// client are shared by every sub-service wired here, which is what makes
/// cache invalidation from one path visible to all the others.
pub struct BillingService {
    pub ledger: LedgerService,
    pub entitlements: EntitlementService,
    pub subscriptions: SubscriptionService,
    pub checkouts: CheckoutService,
    pub webhooks: WebhookDispatcher,
    pub retries: RetryService,
}

impl BillingService {
    /// Create a new billing service from environment variables.
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        Self::new(BillingConfig::from_env()?, pool)
    }

    /// Create a new billing service with explicit config.
    pub fn new(config: BillingConfig, pool: PgPool) -> BillingResult<Self> {
        let http = build_http_client()?;
        let cache = EntitlementCache::with_ttl(config.entitlement_cache_ttl);
        let ledger = LedgerService::new(pool.clone());
        let webhooks = WebhookDispatcher::new(
            pool.clone(),
            http.clone(),
            config.webhook_encryption_key,
            cache.clone(),
        );

        Ok(Self {
            ledger: ledger.clone(),
            entitlements: EntitlementService::new(pool.clone(), cache.clone()),
            subscriptions: SubscriptionService::new(
                pool.clone(),
                ledger.clone(),
                cache.clone(),
                webhooks.clone(),
            ),
            checkouts: CheckoutService::new(pool.clone(), ledger, cache, webhooks.clone()),
            webhooks,
            retries: RetryService::new(pool, http, config.webhook_encryption_key),
        })
    }
}
