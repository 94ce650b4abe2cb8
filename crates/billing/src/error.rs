//! Error types for the billing core.

use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by billing operations.
///
/// Insufficient credits is deliberately NOT an error: it is a normal
/// business outcome carried in [`crate::ledger::ConsumeOutcome`]. Webhook
/// delivery failures never surface here either; they are logged and queued
/// for retry without touching the triggering operation.
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("validation error: {0}")]
    Validation(String),

    /// Entitlement subscription lookup failed; callers must treat this as
    /// "deny" (fail closed), never as an access grant.
    #[error("entitlement lookup failed: {0}")]
    LookupFailed(String),

    #[error("checkout not found: {0}")]
    CheckoutNotFound(Uuid),

    #[error("checkout {0} is not pending")]
    CheckoutNotPending(Uuid),

    #[error("no subscription for user {user_id} on tool {tool_id}")]
    SubscriptionNotFound { user_id: Uuid, tool_id: Uuid },

    #[error("webhook signature invalid: {0}")]
    SignatureInvalid(String),

    #[error("encryption error: {0}")]
    Encryption(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type BillingResult<T> = Result<T, BillingError>;
