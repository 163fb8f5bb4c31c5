#![cfg_attr(test, allow(clippy::unwrap_used))]

//! IVA Background Worker
//!
//! Handles scheduled jobs including:
//! - Payment event ledger retention (daily at 3:30 AM UTC)
//! - Tenant invariant checks (hourly)
//! - Heartbeat (every 5 minutes)

use std::sync::Arc;
use std::time::Duration;

use iva_billing::{InvariantCheckSummary, InvariantChecker, ViolationSeverity};
use iva_shared::{create_pool, PgStore, PoolSettings, Store};
use time::OffsetDateTime;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

/// Default ledger retention
const DEFAULT_RETENTION_DAYS: i64 = 90;

/// Redelivery window of the processor is a few days; never prune below this
const MIN_RETENTION_DAYS: i64 = 7;

/// Lock timeout of the store handle; the worker takes no provisioning locks
const STORE_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Create a database connection pool
async fn create_db_pool() -> anyhow::Result<sqlx::PgPool> {
    let database_url = std::env::var("DB_POOLER_URL")
        .or_else(|_| std::env::var("DATABASE_URL"))
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;

    let pool = create_pool(
        &database_url,
        &PoolSettings {
            max_connections: 5,
            ..PoolSettings::default()
        },
    )
    .await?;

    Ok(pool)
}

/// Ledger retention from `PAYMENT_EVENT_RETENTION_DAYS`
fn retention_days(raw: Option<&str>) -> anyhow::Result<i64> {
    let days = match raw {
        Some(raw) => raw
            .trim()
            .parse::<i64>()
            .map_err(|_| anyhow::anyhow!("invalid PAYMENT_EVENT_RETENTION_DAYS: {}", raw))?,
        None => DEFAULT_RETENTION_DAYS,
    };

    if days < MIN_RETENTION_DAYS {
        anyhow::bail!(
            "PAYMENT_EVENT_RETENTION_DAYS must be at least {} (got {})",
            MIN_RETENTION_DAYS,
            days
        );
    }
    Ok(days)
}

fn retention_cutoff(now: OffsetDateTime, days: i64) -> OffsetDateTime {
    now - time::Duration::days(days)
}

/// Log results of an invariant run
fn log_invariant_summary(summary: &InvariantCheckSummary) {
    if summary.healthy {
        info!(checks_run = summary.checks_run, "Tenant invariants healthy");
        return;
    }

    warn!(
        checks_run = summary.checks_run,
        checks_failed = summary.checks_failed,
        violations = summary.violations.len(),
        "Tenant invariant violations detected"
    );

    for violation in &summary.violations {
        match violation.severity {
            ViolationSeverity::Critical | ViolationSeverity::High => error!(
                invariant = %violation.invariant,
                severity = %violation.severity,
                business_ids = ?violation.business_ids,
                context = %violation.context,
                "{}",
                violation.description
            ),
            ViolationSeverity::Medium | ViolationSeverity::Low => warn!(
                invariant = %violation.invariant,
                severity = %violation.severity,
                business_ids = ?violation.business_ids,
                "{}",
                violation.description
            ),
        }
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    if std::env::var("LOG_FORMAT").as_deref() == Ok("json") {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    // Initialize logging
    init_tracing();

    info!("Starting IVA Worker");

    let retention = retention_days(std::env::var("PAYMENT_EVENT_RETENTION_DAYS").ok().as_deref())?;

    // Create database pool
    let pool = create_db_pool().await?;
    let store = Arc::new(PgStore::new(pool.clone(), STORE_LOCK_TIMEOUT));
    let checker = Arc::new(InvariantChecker::new(pool.clone()));

    // Create scheduler
    let mut scheduler = JobScheduler::new().await?;

    // Job 1: Prune the payment event ledger
    // Cron: At 03:30 every day
    let retention_store = store.clone();
    scheduler
        .add(Job::new_async("0 30 3 * * *", move |_uuid, _l| {
            let store = retention_store.clone();
            Box::pin(async move {
                let cutoff = retention_cutoff(OffsetDateTime::now_utc(), retention);
                info!(cutoff = %cutoff, "Running payment event ledger retention");
                match store.prune_payment_events(cutoff).await {
                    Ok(removed) => info!(removed = removed, "Payment event ledger pruned"),
                    Err(e) => error!(error = %e, "Failed to prune payment event ledger"),
                }
            })
        })?)
        .await?;
    info!(retention_days = retention, "Scheduled: Ledger retention (03:30 UTC)");

    // Job 2: Tenant invariant checks
    // Cron: At minute 10 past every hour
    let invariant_checker = checker.clone();
    scheduler
        .add(Job::new_async("0 10 * * * *", move |_uuid, _l| {
            let checker = invariant_checker.clone();
            Box::pin(async move {
                info!("Running tenant invariant checks");
                match checker.run_all_checks().await {
                    Ok(summary) => log_invariant_summary(&summary),
                    Err(e) => error!(error = %e, "Failed to run tenant invariant checks"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Tenant invariant checks (hourly)");

    // Job 3: Health check heartbeat (every 5 minutes)
    let heartbeat_store = store.clone();
    scheduler
        .add(Job::new_async("0 */5 * * * *", move |_uuid, _l| {
            let store = heartbeat_store.clone();
            Box::pin(async move {
                match store.ping().await {
                    Ok(()) => info!("Worker heartbeat - all systems operational"),
                    Err(e) => warn!(error = %e, "Worker heartbeat - database unreachable"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Health check heartbeat (every 5 minutes)");

    // Start the scheduler
    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("IVA Worker started successfully with {} scheduled jobs", 3);

    // Scheduler runs jobs in background tasks until shutdown
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping scheduler");

    scheduler.shutdown().await?;
    pool.close().await;

    Ok(())
}
