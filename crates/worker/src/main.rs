// Worker clippy configuration
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! 1sub Background Worker
//!
//! Handles scheduled jobs:
//! - Webhook retry sweep (every minute)
//! - Delivery log and retry queue cleanup (daily at 3:00 AM UTC)
//! - Heartbeat with queue depth and recent dead letters (hourly)

use std::sync::Arc;
use std::time::Duration;

use onesub_billing::BillingService;
use onesub_shared::{create_migration_pool, create_pool, run_migrations};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

/// Sweep batch size. Bounded so a backlog of slow endpoints cannot hold
/// one sweep run far past its next scheduled start.
const RETRY_SWEEP_BATCH: i64 = 50;

/// Delivery log rows older than this are dropped by the daily cleanup.
const DELIVERY_LOG_RETENTION_DAYS: i32 = 30;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    info!("Starting 1sub Worker");

    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL environment variable is not set"))?;

    let pool = create_pool(&database_url).await?;
    info!("Database pool created");

    // Run migrations on a dedicated pool with longer timeouts. Harmless
    // when the API server already applied them; sqlx takes an advisory
    // lock so concurrent startups do not race.
    let migration_pool = create_migration_pool(&database_url).await?;
    run_migrations(&migration_pool).await?;
    migration_pool.close().await;
    info!("Database migrations complete");

    let billing = Arc::new(BillingService::from_env(pool.clone())?);
    info!("Billing service initialized");

    // Create scheduler
    let scheduler = JobScheduler::new().await?;

    // Job 1: Webhook retry sweep (every minute)
    // Delivers due queue entries; exhausted entries move to the dead letter sink.
    let sweep_service = billing.clone();
    scheduler
        .add(Job::new_async("0 * * * * *", move |_uuid, _l| {
            let billing = sweep_service.clone();
            Box::pin(async move {
                match billing.retries.process_retries(RETRY_SWEEP_BATCH).await {
                    Ok(stats) if stats.processed > 0 => {
                        info!(
                            processed = stats.processed,
                            delivered = stats.delivered,
                            rescheduled = stats.rescheduled,
                            dead_lettered = stats.dead_lettered,
                            "Retry sweep complete"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "Retry sweep failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Webhook retry sweep (every minute)");

    // Job 2: Webhook storage cleanup (daily at 3:00 AM UTC)
    let cleanup_pool = pool.clone();
    scheduler
        .add(Job::new_async("0 0 3 * * *", move |_uuid, _l| {
            let pool = cleanup_pool.clone();
            Box::pin(async move {
                info!("Running webhook storage cleanup");

                match sqlx::query(
                    "DELETE FROM webhook_delivery_log
                     WHERE created_at < NOW() - make_interval(days => $1)",
                )
                .bind(DELIVERY_LOG_RETENTION_DAYS)
                .execute(&pool)
                .await
                {
                    Ok(r) => info!(deleted = r.rows_affected(), "Delivery log cleanup complete"),
                    Err(e) => error!(error = %e, "Delivery log cleanup failed"),
                }

                // Queue rows whose event already reached the dead letter
                // sink are leftovers from an interrupted sweep.
                match sqlx::query(
                    "DELETE FROM webhook_retry_queue q
                     WHERE EXISTS (
                         SELECT 1 FROM webhook_dead_letter_queue d
                         WHERE d.event_id = q.event_id AND d.tool_id = q.tool_id
                     )",
                )
                .execute(&pool)
                .await
                {
                    Ok(r) if r.rows_affected() > 0 => {
                        warn!(
                            deleted = r.rows_affected(),
                            "Removed queue rows already dead-lettered"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "Retry queue cleanup failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Webhook storage cleanup (daily at 3:00 AM UTC)");

    // Job 3: Heartbeat with queue depth and recent dead letters (hourly)
    let heartbeat_pool = pool.clone();
    let heartbeat_service = billing.clone();
    scheduler
        .add(Job::new_async("0 0 * * * *", move |_uuid, _l| {
            let pool = heartbeat_pool.clone();
            let billing = heartbeat_service.clone();
            Box::pin(async move {
                let queue_depth: i64 =
                    sqlx::query_scalar("SELECT COUNT(*) FROM webhook_retry_queue")
                        .fetch_one(&pool)
                        .await
                        .unwrap_or(-1);
                info!(queue_depth = queue_depth, "Worker heartbeat");

                match billing.retries.dead_letters(5).await {
                    Ok(entries) => {
                        for entry in &entries {
                            warn!(
                                event_id = %entry.event_id,
                                tool_id = %entry.tool_id,
                                event_type = %entry.event_type,
                                retry_count = entry.retry_count,
                                last_error = ?entry.last_error,
                                "Dead-lettered delivery awaiting operator attention"
                            );
                        }
                    }
                    Err(e) => error!(error = %e, "Dead letter inspection failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Heartbeat with queue depth (hourly)");

    // Start the scheduler
    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("1sub Worker started successfully with {} scheduled jobs", 3);

    // Keep the main task running
    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
