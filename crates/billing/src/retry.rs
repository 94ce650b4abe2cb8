//! Durable retry queue and dead-letter sink for webhook deliveries.
//!
//! A queue row is one retry chain for one `(tool, event)` pair. Rows move
//! `pending -> retrying -> pending` until the delivery succeeds (row
//! deleted), the response is non-retryable, or the schedule is exhausted
//! (row moved to the dead-letter table in the same transaction).

use std::time::Duration;

use reqwest::Client;
use serde_json::Value;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::crypto;
use crate::dispatcher::{attempt_delivery, is_retryable, log_delivery, DeliveryLogEntry};
use crate::error::BillingResult;

/// Fixed backoff schedule: 1 min, 5 min, 15 min, 1 h, 6 h.
pub const BACKOFF_SCHEDULE_SECS: [i64; 5] = [60, 300, 900, 3600, 21600];

/// Maximum retries after the initial delivery attempt.
pub const MAX_RETRIES: i32 = 5;

/// Pause between entries within one sweep, so a deep backlog cannot
/// hammer vendor endpoints or exhaust the pool.
const SWEEP_THROTTLE: Duration = Duration::from_millis(500);

/// Delay before retry `retry_ordinal` (1-based). Ordinals beyond the
/// table reuse the last interval.
pub fn backoff_interval_secs(retry_ordinal: i32) -> i64 {
    let idx = (retry_ordinal.clamp(1, BACKOFF_SCHEDULE_SECS.len() as i32) - 1) as usize;
    BACKOFF_SCHEDULE_SECS[idx]
}

/// Reconstruct when the first delivery attempt happened, given how many
/// retries have completed. The queue row does not store the original
/// attempt time, so it is backed out of the backoff schedule.
pub fn approximate_first_attempt(
    completed_retries: i32,
    now: OffsetDateTime,
) -> OffsetDateTime {
    let slots = (completed_retries.max(0) as usize).min(BACKOFF_SCHEDULE_SECS.len());
    let elapsed: i64 = BACKOFF_SCHEDULE_SECS[..slots].iter().sum();
    now - time::Duration::seconds(elapsed)
}

/// A queued delivery awaiting its next retry slot.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RetryQueueEntry {
    pub id: Uuid,
    pub tool_id: Uuid,
    pub event_id: Uuid,
    pub event_type: String,
    pub url: String,
    /// Full envelope, re-sent verbatim so the vendor sees the original
    /// event id and creation time.
    pub payload: Value,
    pub webhook_secret_enc: String,
    pub retry_count: i32,
    pub max_retries: i32,
    pub next_retry_at: OffsetDateTime,
    pub status: String,
    pub last_error: Option<String>,
    pub last_status_code: Option<i32>,
    pub created_at: OffsetDateTime,
}

/// A delivery that will never be retried again.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DeadLetterEntry {
    pub id: Uuid,
    pub tool_id: Uuid,
    pub event_id: Uuid,
    pub event_type: String,
    pub url: String,
    pub payload: Value,
    pub retry_count: i32,
    pub first_attempted_at: OffsetDateTime,
    pub last_error: Option<String>,
    pub last_status_code: Option<i32>,
    pub created_at: OffsetDateTime,
}

/// Counters for one sweep of the retry queue.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RetrySweepStats {
    pub processed: usize,
    pub delivered: usize,
    pub rescheduled: usize,
    pub dead_lettered: usize,
}

pub(crate) struct EnqueueParams<'a> {
    pub tool_id: Uuid,
    pub event_id: Uuid,
    pub event_type: &'a str,
    pub url: &'a str,
    pub payload: &'a Value,
    pub webhook_secret_enc: &'a str,
    pub last_error: Option<&'a str>,
    pub last_status_code: Option<i32>,
}

/// Idempotent enqueue: one retry chain per `(tool, event)`. Returns false
/// when a chain for the event already exists.
pub(crate) async fn enqueue(
    pool: &PgPool,
    params: EnqueueParams<'_>,
) -> Result<bool, sqlx::Error> {
    let next_retry_at =
        OffsetDateTime::now_utc() + time::Duration::seconds(backoff_interval_secs(1));

    let result = sqlx::query(
        r#"
        INSERT INTO webhook_retry_queue
            (tool_id, event_id, event_type, url, payload, webhook_secret_enc,
             retry_count, max_retries, next_retry_at, status, last_error, last_status_code)
        VALUES ($1, $2, $3, $4, $5, $6, 0, $7, $8, 'pending', $9, $10)
        ON CONFLICT (tool_id, event_id) DO NOTHING
        "#,
    )
    .bind(params.tool_id)
    .bind(params.event_id)
    .bind(params.event_type)
    .bind(params.url)
    .bind(params.payload)
    .bind(params.webhook_secret_enc)
    .bind(MAX_RETRIES)
    .bind(next_retry_at)
    .bind(params.last_error)
    .bind(params.last_status_code)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

enum RetryOutcome {
    Delivered,
    Rescheduled,
    DeadLettered,
    Skipped,
}

/// Works the retry queue: picks due entries and re-attempts delivery.
///
/// Designed to run from a single scheduled job, but a concurrent sweep is
/// tolerated: entries marked `retrying` stay due, so a crashed sweep's
/// claims are picked up again and deliveries stay at-least-once.
#[derive(Clone)]
pub struct RetryService {
    pool: PgPool,
    http: Client,
    encryption_key: [u8; 32],
}

impl RetryService {
    pub fn new(pool: PgPool, http: Client, encryption_key: [u8; 32]) -> Self {
        Self {
            pool,
            http,
            encryption_key,
        }
    }

    /// Process up to `limit` due entries, oldest first, sequentially with
    /// a fixed pause between entries.
    pub async fn process_retries(&self, limit: i64) -> BillingResult<RetrySweepStats> {
        let due: Vec<RetryQueueEntry> = sqlx::query_as(
            r#"
            SELECT id, tool_id, event_id, event_type, url, payload, webhook_secret_enc,
                   retry_count, max_retries, next_retry_at, status, last_error,
                   last_status_code, created_at
            FROM webhook_retry_queue
            WHERE next_retry_at <= NOW() AND status IN ('pending', 'retrying')
            ORDER BY next_retry_at ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut stats = RetrySweepStats::default();
        for (i, entry) in due.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(SWEEP_THROTTLE).await;
            }
            stats.processed += 1;
            match self.process_one(entry).await {
                RetryOutcome::Delivered => stats.delivered += 1,
                RetryOutcome::Rescheduled => stats.rescheduled += 1,
                RetryOutcome::DeadLettered => stats.dead_lettered += 1,
                RetryOutcome::Skipped => {}
            }
        }

        if stats.processed > 0 {
            tracing::info!(
                processed = stats.processed,
                delivered = stats.delivered,
                rescheduled = stats.rescheduled,
                dead_lettered = stats.dead_lettered,
                "Webhook retry sweep complete"
            );
        }
        Ok(stats)
    }

    async fn process_one(&self, entry: &RetryQueueEntry) -> RetryOutcome {
        if let Err(e) = sqlx::query(
            "UPDATE webhook_retry_queue SET status = 'retrying', updated_at = NOW() WHERE id = $1",
        )
        .bind(entry.id)
        .execute(&self.pool)
        .await
        {
            tracing::error!(
                queue_id = %entry.id,
                error = %e,
                "Failed to mark retry entry in flight"
            );
            return RetryOutcome::Skipped;
        }

        let retry_ordinal = entry.retry_count + 1;

        let secret =
            match crypto::decrypt_webhook_secret(&entry.webhook_secret_enc, &self.encryption_key) {
                Ok(secret) => secret,
                Err(e) => {
                    // A secret that cannot be decrypted now never will be.
                    return self
                        .dead_letter(
                            entry,
                            entry.retry_count,
                            &format!("webhook secret undecryptable: {e}"),
                            None,
                            "undecryptable secret",
                        )
                        .await;
                }
            };

        let attempt = attempt_delivery(&self.http, &entry.url, &secret, &entry.payload).await;

        log_delivery(
            &self.pool,
            DeliveryLogEntry {
                tool_id: entry.tool_id,
                event_id: entry.event_id,
                event_type: &entry.event_type,
                url: &entry.url,
                // The initial delivery was attempt 1.
                attempt_number: retry_ordinal + 1,
                is_retry: true,
            },
            &attempt,
        )
        .await;

        if attempt.success {
            if let Err(e) = sqlx::query("DELETE FROM webhook_retry_queue WHERE id = $1")
                .bind(entry.id)
                .execute(&self.pool)
                .await
            {
                tracing::error!(
                    queue_id = %entry.id,
                    error = %e,
                    "Failed to remove delivered entry from retry queue"
                );
            }
            tracing::info!(
                tool_id = %entry.tool_id,
                event = %entry.event_type,
                event_id = %entry.event_id,
                retry = retry_ordinal,
                status = ?attempt.status_code,
                latency_ms = attempt.latency_ms,
                "Webhook retry delivered"
            );
            return RetryOutcome::Delivered;
        }

        let error = attempt.error.as_deref().unwrap_or("unknown error");
        let new_count = entry.retry_count + 1;
        let status_code = attempt.status_code.map(|c| c as i32);

        if !is_retryable(attempt.status_code, error) {
            return self
                .dead_letter(entry, new_count, error, status_code, "non-retryable response")
                .await;
        }
        if new_count >= entry.max_retries {
            return self
                .dead_letter(entry, new_count, error, status_code, "retries exhausted")
                .await;
        }

        let next_retry_at = OffsetDateTime::now_utc()
            + time::Duration::seconds(backoff_interval_secs(new_count + 1));
        match sqlx::query(
            r#"
            UPDATE webhook_retry_queue
            SET retry_count = $2, next_retry_at = $3, status = 'pending',
                last_error = $4, last_status_code = $5, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(entry.id)
        .bind(new_count)
        .bind(next_retry_at)
        .bind(error)
        .bind(status_code)
        .execute(&self.pool)
        .await
        {
            Ok(_) => {
                tracing::info!(
                    tool_id = %entry.tool_id,
                    event = %entry.event_type,
                    event_id = %entry.event_id,
                    retry = retry_ordinal,
                    status = ?attempt.status_code,
                    next_retry_at = %next_retry_at,
                    "Webhook retry failed, rescheduled"
                );
                RetryOutcome::Rescheduled
            }
            Err(e) => {
                tracing::error!(
                    queue_id = %entry.id,
                    error = %e,
                    "Failed to reschedule retry entry"
                );
                RetryOutcome::Skipped
            }
        }
    }

    async fn dead_letter(
        &self,
        entry: &RetryQueueEntry,
        final_count: i32,
        error: &str,
        status_code: Option<i32>,
        reason: &str,
    ) -> RetryOutcome {
        match self
            .move_to_dead_letter(entry, final_count, error, status_code)
            .await
        {
            Ok(()) => {
                tracing::warn!(
                    tool_id = %entry.tool_id,
                    event = %entry.event_type,
                    event_id = %entry.event_id,
                    retries = final_count,
                    reason = reason,
                    "Webhook moved to dead letter queue"
                );
                RetryOutcome::DeadLettered
            }
            Err(e) => {
                tracing::error!(
                    queue_id = %entry.id,
                    error = %e,
                    "Failed to dead-letter webhook"
                );
                RetryOutcome::Skipped
            }
        }
    }

    /// Insert into the dead-letter table and drop the queue row in one
    /// transaction, so an event is never in both or neither.
    async fn move_to_dead_letter(
        &self,
        entry: &RetryQueueEntry,
        final_count: i32,
        error: &str,
        status_code: Option<i32>,
    ) -> Result<(), sqlx::Error> {
        let first_attempted_at =
            approximate_first_attempt(final_count, OffsetDateTime::now_utc());

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO webhook_dead_letter_queue
                (tool_id, event_id, event_type, url, payload, retry_count,
                 first_attempted_at, last_error, last_status_code)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(entry.tool_id)
        .bind(entry.event_id)
        .bind(&entry.event_type)
        .bind(&entry.url)
        .bind(&entry.payload)
        .bind(final_count)
        .bind(first_attempted_at)
        .bind(error)
        .bind(status_code)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM webhook_retry_queue WHERE id = $1")
            .bind(entry.id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await
    }

    /// Most recent dead-lettered deliveries, for operator inspection.
    pub async fn dead_letters(&self, limit: i64) -> BillingResult<Vec<DeadLetterEntry>> {
        let rows = sqlx::query_as::<_, DeadLetterEntry>(
            r#"
            SELECT id, tool_id, event_id, event_type, url, payload, retry_count,
                   first_attempted_at, last_error, last_status_code, created_at
            FROM webhook_dead_letter_queue
            ORDER BY created_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit.clamp(1, 500))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_table_is_fixed_and_increasing() {
        assert_eq!(BACKOFF_SCHEDULE_SECS, [60, 300, 900, 3600, 21600]);
        for window in BACKOFF_SCHEDULE_SECS.windows(2) {
            assert!(window[1] > window[0]);
        }
        assert_eq!(BACKOFF_SCHEDULE_SECS.iter().sum::<i64>(), 26_460);
    }

    #[test]
    fn retry_ordinals_map_onto_the_table() {
        assert_eq!(backoff_interval_secs(1), 60);
        assert_eq!(backoff_interval_secs(2), 300);
        assert_eq!(backoff_interval_secs(3), 900);
        assert_eq!(backoff_interval_secs(4), 3600);
        assert_eq!(backoff_interval_secs(5), 21600);
    }

    #[test]
    fn ordinals_beyond_the_table_reuse_the_last_interval() {
        assert_eq!(backoff_interval_secs(6), 21600);
        assert_eq!(backoff_interval_secs(100), 21600);
    }

    #[test]
    fn out_of_range_ordinals_clamp_to_the_first_interval() {
        assert_eq!(backoff_interval_secs(0), 60);
        assert_eq!(backoff_interval_secs(-3), 60);
    }

    #[test]
    fn fourth_retry_lands_in_the_one_hour_slot() {
        // After three failed retries the next attempt waits an hour.
        assert_eq!(backoff_interval_secs(3 + 1), 3600);
    }

    #[test]
    fn first_attempt_reconstruction_walks_the_schedule_backwards() {
        let now = OffsetDateTime::from_unix_timestamp(1_706_400_000).unwrap();

        assert_eq!(approximate_first_attempt(0, now), now);
        assert_eq!(
            approximate_first_attempt(2, now),
            now - time::Duration::seconds(60 + 300)
        );
        assert_eq!(
            approximate_first_attempt(5, now),
            now - time::Duration::seconds(26_460)
        );
        // Counts past the table length cannot reach further back.
        assert_eq!(
            approximate_first_attempt(9, now),
            approximate_first_attempt(5, now)
        );
    }
}
