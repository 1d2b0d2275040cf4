// Test code patterns:
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! CourseBridge Background Worker
//!
//! Handles scheduled jobs including:
//! - Job queue drain (every 5 seconds)
//! - Failed enrollment retry sweep (RETRY_SWEEP_CRON, hourly by default)
//! - Stuck job recovery (every 10 minutes)
//! - Heartbeat with queue and failure counts (every 5 minutes)

mod config;
mod probe;

use std::sync::Arc;

use coursebridge_enrollment::EnrollmentService;
use coursebridge_shared::{connect_store, create_migration_pool, create_pool, run_migrations};
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::WorkerConfig;
use crate::probe::{probe_moodle, startup_backoff};

async fn check_moodle(enrollment: &EnrollmentService) {
    match probe_moodle(enrollment.moodle.as_ref(), startup_backoff()).await {
        Ok(report) if report.is_ready() => info!(
            site = %report.site_name,
            release = %report.release,
            "Moodle connectivity verified"
        ),
        Ok(report) => warn!(
            site = %report.site_name,
            missing = ?report.missing_functions,
            "Moodle token cannot call every required function"
        ),
        // Jobs retry on their own schedule, so an unreachable Moodle is not fatal.
        Err(e) => error!(error = %e, error_kind = %e.kind(), "Moodle connectivity check failed"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    // Initialize logging (LOG_FORMAT=json for structured output)
    let registry = tracing_subscriber::registry().with(
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
    );
    if std::env::var("LOG_FORMAT").is_ok_and(|format| format.eq_ignore_ascii_case("json")) {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    info!("Starting CourseBridge Worker v{}", env!("CARGO_PKG_VERSION"));

    let config = WorkerConfig::from_env()?;
    info!(?config, "Configuration loaded");

    let migration_pool = create_migration_pool(&config.database_url).await?;
    run_migrations(&migration_pool).await?;
    migration_pool.close().await;

    let pool = create_pool(&config.database_url).await?;
    info!("Database pool created");

    let store = connect_store(config.redis_url.as_deref()).await?;
    let enrollment = Arc::new(EnrollmentService::from_env(pool, store)?);

    check_moodle(&enrollment).await;

    let mut scheduler = JobScheduler::new().await?;

    // Job 1: Drain the job queue (every 5 seconds)
    // Overlapping ticks are skipped while a batch is still running.
    let drain_service = enrollment.clone();
    let drain_lock = Arc::new(Mutex::new(()));
    scheduler
        .add(Job::new_async("*/5 * * * * *", move |_uuid, _l| {
            let service = drain_service.clone();
            let lock = drain_lock.clone();
            Box::pin(async move {
                let Ok(_guard) = lock.try_lock() else {
                    return;
                };
                if let Err(e) = service.jobs.run_due().await {
                    error!(error = %e, "Job queue drain failed");
                }
            })
        })?)
        .await?;
    info!(
        concurrency = enrollment.jobs.config().concurrency,
        "Scheduled: Job queue drain (every 5 seconds)"
    );

    // Job 2: Retry unresolved failed enrollments
    let sweep_service = enrollment.clone();
    let sweep_days = config.retry_sweep_days;
    scheduler
        .add(Job::new_async(config.retry_sweep_cron.as_str(), move |_uuid, _l| {
            let service = sweep_service.clone();
            Box::pin(async move {
                info!(days = sweep_days, "Running failed enrollment retry sweep");
                match service.retry_failed_enrollments(sweep_days).await {
                    Ok(resolved) => info!(resolved, "Retry sweep complete"),
                    Err(e) => error!(error = %e, "Retry sweep failed"),
                }
            })
        })?)
        .await?;
    info!(
        cron = %config.retry_sweep_cron,
        days = sweep_days,
        "Scheduled: Failed enrollment retry sweep"
    );

    // Job 3: Re-queue jobs left running by a crashed worker (every 10 minutes)
    let stuck_service = enrollment.clone();
    scheduler
        .add(Job::new_async("0 */10 * * * *", move |_uuid, _l| {
            let service = stuck_service.clone();
            Box::pin(async move {
                if let Err(e) = service.jobs.recover_stuck().await {
                    error!(error = %e, "Stuck job recovery failed");
                }
            })
        })?)
        .await?;
    info!("Scheduled: Stuck job recovery (every 10 minutes)");

    // Job 4: Heartbeat (every 5 minutes)
    let heartbeat_service = enrollment.clone();
    scheduler
        .add(Job::new_async("0 */5 * * * *", move |_uuid, _l| {
            let service = heartbeat_service.clone();
            Box::pin(async move {
                let counts = service.queue.counts().await;
                let unresolved = service.compensation.failures().count_unresolved().await;
                match (counts, unresolved) {
                    (Ok(counts), Ok(unresolved)) => info!(
                        pending = counts.pending,
                        running = counts.running,
                        failed_jobs = counts.failed,
                        unresolved_enrollments = unresolved,
                        "Worker heartbeat"
                    ),
                    (Err(e), _) | (_, Err(e)) => {
                        warn!(error = %e, "Worker heartbeat could not read counts")
                    }
                }
            })
        })?)
        .await?;
    info!("Scheduled: Heartbeat (every 5 minutes)");

    info!("Starting job scheduler");
    scheduler.start().await?;
    info!("CourseBridge Worker started successfully with {} scheduled jobs", 4);

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping scheduler");
    scheduler.shutdown().await?;

    Ok(())
}
