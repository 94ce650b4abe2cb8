//! Application state

use std::sync::Arc;

use onesub_billing::BillingService;
use onesub_shared::RateLimiter;
use sqlx::PgPool;

use crate::config::Config;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Config,
    /// Billing core: ledger, entitlements, checkout completion, webhooks.
    pub billing: Arc<BillingService>,
    /// Per-tool request throttling for vendor endpoints.
    pub rate_limiter: RateLimiter,
}

impl AppState {
    /// Assemble the application state. The billing service reads its own
    /// configuration (encryption key, cache TTL) from the environment.
    pub fn new(pool: PgPool, config: Config) -> anyhow::Result<Self> {
        let billing = BillingService::from_env(pool.clone())?;
        tracing::info!("Billing service initialized");

        let rate_limiter = RateLimiter::new_in_memory();
        tracing::info!("Rate limiter initialized");

        Ok(Self {
            pool,
            config,
            billing: Arc::new(billing),
            rate_limiter,
        })
    }
}
