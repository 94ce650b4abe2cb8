//! Append-only credit ledger and the atomic consume/grant operations.
//!
//! Every balance-affecting event is one immutable `credit_transactions` row
//! carrying a signed delta and a `balance_after` snapshot. The denormalized
//! `credit_balances` row for the user is updated in the same database
//! transaction and locked with `SELECT ... FOR UPDATE`, which is the sole
//! serialization point for concurrent debits: two consumes that individually
//! fit but jointly overdraw can never both commit.
//!
//! The ledger is a pure primitive: cache invalidation and webhook
//! notification are the caller's responsibility.

use serde::Serialize;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// Largest single grant or consumption accepted by the API.
pub const MAX_AMOUNT: i64 = 1_000_000;
/// Longest accepted `reason` text.
pub const MAX_REASON_LEN: usize = 500;
/// Longest accepted idempotency key.
pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 255;

/// Kind of ledger entry. Stored as text in `credit_transactions`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Grant,
    Consumption,
    Refund,
    Adjustment,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Grant => "grant",
            Self::Consumption => "consumption",
            Self::Refund => "refund",
            Self::Adjustment => "adjustment",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "grant" => Some(Self::Grant),
            "consumption" => Some(Self::Consumption),
            "refund" => Some(Self::Refund),
            "adjustment" => Some(Self::Adjustment),
            _ => None,
        }
    }

    /// Positive-delta entry kinds.
    pub fn is_credit(&self) -> bool {
        matches!(self, Self::Grant | Self::Refund | Self::Adjustment)
    }

    pub fn is_debit(&self) -> bool {
        matches!(self, Self::Consumption)
    }
}

impl std::fmt::Display for TransactionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One immutable ledger row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CreditTransaction {
    pub id: Uuid,
    pub user_id: Uuid,
    /// Signed credit delta: positive = grant, negative = consumption.
    pub delta: i64,
    /// Balance snapshot after applying `delta`.
    pub balance_after: i64,
    pub transaction_type: String,
    pub reason: String,
    pub idempotency_key: Option<String>,
    pub tool_id: Option<Uuid>,
    pub checkout_id: Option<Uuid>,
    pub metadata: serde_json::Value,
    pub created_at: OffsetDateTime,
}

/// Outcome classification for a consume call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumeStatus {
    Success,
    InsufficientCredits,
    Duplicate,
}

impl ConsumeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::InsufficientCredits => "insufficient_credits",
            Self::Duplicate => "duplicate",
        }
    }
}

/// Parameters for a credit consumption.
#[derive(Debug, Clone)]
pub struct ConsumeRequest {
    pub user_id: Uuid,
    /// Credits to debit. Must be positive and at most [`MAX_AMOUNT`].
    pub amount: i64,
    /// Human-readable reason recorded on the ledger row.
    pub reason: String,
    /// Mandatory for consumption: callers retry on network failure and the
    /// key is what makes the retry an at-most-once economic effect.
    pub idempotency_key: String,
    /// Tool attributed with the usage, when known.
    pub tool_id: Option<Uuid>,
    pub metadata: Option<serde_json::Value>,
}

/// Result of a consume call.
#[derive(Debug, Clone)]
pub struct ConsumeOutcome {
    pub status: ConsumeStatus,
    pub balance_before: i64,
    pub balance_after: i64,
    /// The written (or, for duplicates, the original) transaction id.
    /// `None` when status is `InsufficientCredits`.
    pub transaction_id: Option<Uuid>,
}

/// Parameters for a grant/top-up (or refund/adjustment).
#[derive(Debug, Clone)]
pub struct GrantRequest {
    pub user_id: Uuid,
    /// Credits to add. Must be positive and at most [`MAX_AMOUNT`].
    pub amount: i64,
    pub reason: String,
    /// Optional; same replay contract as consume when present.
    pub idempotency_key: Option<String>,
    /// Must be a credit kind (`grant`, `refund` or `adjustment`).
    pub transaction_type: TransactionType,
    pub tool_id: Option<Uuid>,
    pub checkout_id: Option<Uuid>,
    pub metadata: Option<serde_json::Value>,
}

/// Result of a grant call.
#[derive(Debug, Clone)]
pub struct GrantOutcome {
    pub balance_after: i64,
    pub transaction_id: Uuid,
    /// True when the idempotency key matched a prior transaction and no new
    /// row was written.
    pub duplicate: bool,
}

fn validate_amount(amount: i64) -> BillingResult<()> {
    if amount <= 0 {
        return Err(BillingError::Validation("amount must be positive".into()));
    }
    if amount > MAX_AMOUNT {
        return Err(BillingError::Validation(format!(
            "amount must be at most {MAX_AMOUNT}"
        )));
    }
    Ok(())
}

fn validate_reason(reason: &str) -> BillingResult<()> {
    if reason.trim().is_empty() {
        return Err(BillingError::Validation("reason must not be empty".into()));
    }
    if reason.len() > MAX_REASON_LEN {
        return Err(BillingError::Validation(format!(
            "reason must be at most {MAX_REASON_LEN} characters"
        )));
    }
    Ok(())
}

fn validate_idempotency_key(key: &str) -> BillingResult<()> {
    if key.trim().is_empty() {
        return Err(BillingError::Validation(
            "idempotency_key must not be empty".into(),
        ));
    }
    if key.len() > MAX_IDEMPOTENCY_KEY_LEN {
        return Err(BillingError::Validation(format!(
            "idempotency_key must be at most {MAX_IDEMPOTENCY_KEY_LEN} characters"
        )));
    }
    Ok(())
}

fn validate_consume(req: &ConsumeRequest) -> BillingResult<()> {
    validate_amount(req.amount)?;
    validate_reason(&req.reason)?;
    validate_idempotency_key(&req.idempotency_key)
}

fn validate_grant(req: &GrantRequest) -> BillingResult<()> {
    validate_amount(req.amount)?;
    validate_reason(&req.reason)?;
    if !req.transaction_type.is_credit() {
        return Err(BillingError::Validation(format!(
            "transaction_type {} is not a credit kind",
            req.transaction_type
        )));
    }
    if let Some(key) = &req.idempotency_key {
        validate_idempotency_key(key)?;
    }
    Ok(())
}

/// Prior transaction found by idempotency-key replay lookup.
#[derive(Debug, sqlx::FromRow)]
struct PriorTransaction {
    id: Uuid,
    delta: i64,
    balance_after: i64,
}

/// Ledger store service. Cheap to clone; shares the pool.
#[derive(Clone)]
pub struct LedgerService {
    pool: PgPool,
}

impl LedgerService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Atomically debit `amount` credits from the user.
    ///
    /// Returns `InsufficientCredits` without writing when the balance does
    /// not cover the amount, and `Duplicate` with the original result when
    /// the idempotency key was already used by this user.
    pub async fn consume(&self, req: ConsumeRequest) -> BillingResult<ConsumeOutcome> {
        validate_consume(&req)?;

        let mut tx = self.pool.begin().await?;
        let balance = Self::lock_balance(&mut tx, req.user_id).await?;

        // Replay check under the row lock so a concurrent retry of the same
        // key serializes behind the first writer.
        if let Some(prior) =
            Self::find_by_idempotency_key(&mut tx, req.user_id, &req.idempotency_key).await?
        {
            tx.rollback().await?;
            tracing::info!(
                user_id = %req.user_id,
                transaction_id = %prior.id,
                "consume replayed via idempotency key"
            );
            return Ok(ConsumeOutcome {
                status: ConsumeStatus::Duplicate,
                balance_before: prior.balance_after - prior.delta,
                balance_after: prior.balance_after,
                transaction_id: Some(prior.id),
            });
        }

        if balance < req.amount {
            tx.rollback().await?;
            return Ok(ConsumeOutcome {
                status: ConsumeStatus::InsufficientCredits,
                balance_before: balance,
                balance_after: balance,
                transaction_id: None,
            });
        }

        let balance_after = balance - req.amount;
        let transaction_id = Self::append_transaction(
            &mut tx,
            AppendParams {
                user_id: req.user_id,
                delta: -req.amount,
                balance_after,
                transaction_type: TransactionType::Consumption,
                reason: &req.reason,
                idempotency_key: Some(&req.idempotency_key),
                tool_id: req.tool_id,
                checkout_id: None,
                metadata: req.metadata,
            },
        )
        .await?;
        tx.commit().await?;

        tracing::info!(
            user_id = %req.user_id,
            amount = req.amount,
            balance_after,
            transaction_id = %transaction_id,
            tool_id = ?req.tool_id,
            "credits consumed"
        );
        Ok(ConsumeOutcome {
            status: ConsumeStatus::Success,
            balance_before: balance,
            balance_after,
            transaction_id: Some(transaction_id),
        })
    }

    /// Atomically add credits to the user. No balance floor applies.
    pub async fn grant(&self, req: GrantRequest) -> BillingResult<GrantOutcome> {
        validate_grant(&req)?;

        let mut tx = self.pool.begin().await?;
        let balance = Self::lock_balance(&mut tx, req.user_id).await?;

        if let Some(key) = &req.idempotency_key {
            if let Some(prior) = Self::find_by_idempotency_key(&mut tx, req.user_id, key).await? {
                tx.rollback().await?;
                tracing::info!(
                    user_id = %req.user_id,
                    transaction_id = %prior.id,
                    "grant replayed via idempotency key"
                );
                return Ok(GrantOutcome {
                    balance_after: prior.balance_after,
                    transaction_id: prior.id,
                    duplicate: true,
                });
            }
        }

        let balance_after = balance + req.amount;
        let transaction_id = Self::append_transaction(
            &mut tx,
            AppendParams {
                user_id: req.user_id,
                delta: req.amount,
                balance_after,
                transaction_type: req.transaction_type,
                reason: &req.reason,
                idempotency_key: req.idempotency_key.as_deref(),
                tool_id: req.tool_id,
                checkout_id: req.checkout_id,
                metadata: req.metadata,
            },
        )
        .await?;
        tx.commit().await?;

        tracing::info!(
            user_id = %req.user_id,
            amount = req.amount,
            balance_after,
            transaction_id = %transaction_id,
            transaction_type = %req.transaction_type,
            "credits granted"
        );
        Ok(GrantOutcome {
            balance_after,
            transaction_id,
            duplicate: false,
        })
    }

    /// Current balance for a user. The single balance-read path; 0 when the
    /// user has no ledger activity yet.
    pub async fn balance(&self, user_id: Uuid) -> BillingResult<i64> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT balance FROM credit_balances WHERE user_id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(balance,)| balance).unwrap_or(0))
    }

    /// Most-recent-first page of the user's ledger.
    pub async fn history(&self, user_id: Uuid, limit: i64) -> BillingResult<Vec<CreditTransaction>> {
        let rows = sqlx::query_as::<_, CreditTransaction>(
            r#"
            SELECT id, user_id, delta, balance_after, transaction_type, reason,
                   idempotency_key, tool_id, checkout_id, metadata, created_at
            FROM credit_transactions
            WHERE user_id = $1
            ORDER BY created_at DESC, id DESC
            LIMIT $2
            "#,
        )
        .bind(user_id)
        .bind(limit.clamp(1, 500))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Ensure the balance row exists, then lock it for the transaction.
    async fn lock_balance(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        user_id: Uuid,
    ) -> BillingResult<i64> {
        sqlx::query(
            "INSERT INTO credit_balances (user_id, balance) VALUES ($1, 0)
             ON CONFLICT (user_id) DO NOTHING",
        )
        .bind(user_id)
        .execute(&mut **tx)
        .await?;

        let (balance,): (i64,) =
            sqlx::query_as("SELECT balance FROM credit_balances WHERE user_id = $1 FOR UPDATE")
                .bind(user_id)
                .fetch_one(&mut **tx)
                .await?;
        Ok(balance)
    }

    async fn find_by_idempotency_key(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        user_id: Uuid,
        key: &str,
    ) -> BillingResult<Option<PriorTransaction>> {
        let prior = sqlx::query_as::<_, PriorTransaction>(
            "SELECT id, delta, balance_after FROM credit_transactions
             WHERE user_id = $1 AND idempotency_key = $2",
        )
        .bind(user_id)
        .bind(key)
        .fetch_optional(&mut **tx)
        .await?;
        Ok(prior)
    }

    async fn append_transaction(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        params: AppendParams<'_>,
    ) -> BillingResult<Uuid> {
        sqlx::query(
            "UPDATE credit_balances SET balance = $2, updated_at = NOW() WHERE user_id = $1",
        )
        .bind(params.user_id)
        .bind(params.balance_after)
        .execute(&mut **tx)
        .await?;

        let (id,): (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO credit_transactions
                (user_id, delta, balance_after, transaction_type, reason,
                 idempotency_key, tool_id, checkout_id, metadata)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING id
            "#,
        )
        .bind(params.user_id)
        .bind(params.delta)
        .bind(params.balance_after)
        .bind(params.transaction_type.as_str())
        .bind(params.reason)
        .bind(params.idempotency_key)
        .bind(params.tool_id)
        .bind(params.checkout_id)
        .bind(params.metadata.unwrap_or_else(|| serde_json::json!({})))
        .fetch_one(&mut **tx)
        .await?;
        Ok(id)
    }
}

struct AppendParams<'a> {
    user_id: Uuid,
    delta: i64,
    balance_after: i64,
    transaction_type: TransactionType,
    reason: &'a str,
    idempotency_key: Option<&'a str>,
    tool_id: Option<Uuid>,
    checkout_id: Option<Uuid>,
    metadata: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn consume_request(amount: i64, reason: &str, key: &str) -> ConsumeRequest {
        ConsumeRequest {
            user_id: Uuid::new_v4(),
            amount,
            reason: reason.to_string(),
            idempotency_key: key.to_string(),
            tool_id: None,
            metadata: None,
        }
    }

    #[test]
    fn amount_bounds() {
        assert!(validate_amount(1).is_ok());
        assert!(validate_amount(MAX_AMOUNT).is_ok());
        assert!(validate_amount(0).is_err());
        assert!(validate_amount(-5).is_err());
        assert!(validate_amount(MAX_AMOUNT + 1).is_err());
    }

    #[test]
    fn reason_bounds() {
        assert!(validate_reason("API call").is_ok());
        assert!(validate_reason("").is_err());
        assert!(validate_reason("   ").is_err());
        assert!(validate_reason(&"x".repeat(MAX_REASON_LEN)).is_ok());
        assert!(validate_reason(&"x".repeat(MAX_REASON_LEN + 1)).is_err());
    }

    #[test]
    fn idempotency_key_bounds() {
        assert!(validate_idempotency_key("k1").is_ok());
        assert!(validate_idempotency_key("").is_err());
        assert!(validate_idempotency_key(&"k".repeat(MAX_IDEMPOTENCY_KEY_LEN)).is_ok());
        assert!(validate_idempotency_key(&"k".repeat(MAX_IDEMPOTENCY_KEY_LEN + 1)).is_err());
    }

    #[test]
    fn transaction_type_roundtrip() {
        for ty in [
            TransactionType::Grant,
            TransactionType::Consumption,
            TransactionType::Refund,
            TransactionType::Adjustment,
        ] {
            assert_eq!(TransactionType::parse(ty.as_str()), Some(ty));
        }
        assert_eq!(TransactionType::parse("bogus"), None);
    }

    #[test]
    fn credit_and_debit_kinds() {
        assert!(TransactionType::Grant.is_credit());
        assert!(TransactionType::Refund.is_credit());
        assert!(TransactionType::Adjustment.is_credit());
        assert!(!TransactionType::Consumption.is_credit());
        assert!(TransactionType::Consumption.is_debit());
    }

    #[test]
    fn consume_status_wire_names() {
        assert_eq!(ConsumeStatus::Success.as_str(), "success");
        assert_eq!(
            ConsumeStatus::InsufficientCredits.as_str(),
            "insufficient_credits"
        );
        assert_eq!(ConsumeStatus::Duplicate.as_str(), "duplicate");
    }

    #[test]
    fn grant_validation_rejects_debit_kind() {
        let mut req = GrantRequest {
            user_id: Uuid::new_v4(),
            amount: 10,
            reason: "renewal".into(),
            idempotency_key: None,
            transaction_type: TransactionType::Consumption,
            tool_id: None,
            checkout_id: None,
            metadata: None,
        };
        assert!(matches!(
            validate_grant(&req),
            Err(BillingError::Validation(_))
        ));
        req.transaction_type = TransactionType::Refund;
        assert!(validate_grant(&req).is_ok());
    }

    #[test]
    fn consume_validation_checks_all_fields() {
        assert!(validate_consume(&consume_request(15, "tool usage", "k1")).is_ok());
        assert!(validate_consume(&consume_request(0, "tool usage", "k1")).is_err());
        assert!(validate_consume(&consume_request(15, "", "k1")).is_err());
        assert!(validate_consume(&consume_request(15, "tool usage", "")).is_err());
    }
}
