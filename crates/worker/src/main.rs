// Worker clippy configuration
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Larder Background Worker
//!
//! Handles scheduled jobs including:
//! - Profile drift sweep, re-running failed cascades (every 15 minutes)
//! - Failed provider event report (hourly)
//! - Heartbeat (every 5 minutes)

mod error;
mod report;
mod sweep;

use std::sync::Arc;
use std::time::Duration;

use larder_billing::{
    CascadePropagator, EventLedger, PgEventLedger, PgFamilyMembership, PgProfileStore,
};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

use crate::report::{report_failed_events, REPORT_LIMIT};
use crate::sweep::{run_drift_sweep, RetryPolicy};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting Larder Worker");

    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
    let pool = larder_shared::create_pool(&database_url).await?;
    info!("Database pool created");

    let propagator = CascadePropagator::new(
        Arc::new(PgProfileStore::new(pool.clone())),
        Arc::new(PgFamilyMembership::new(pool.clone())),
    );
    let ledger: Arc<dyn EventLedger> = Arc::new(PgEventLedger::new(pool.clone()));

    let scheduler = JobScheduler::new().await?;

    // Job 1: Profile drift sweep (every 15 minutes)
    let sweep_pool = pool.clone();
    scheduler
        .add(Job::new_async("0 */15 * * * *", move |_uuid, _l| {
            let pool = sweep_pool.clone();
            let propagator = propagator.clone();
            Box::pin(async move {
                info!("Running profile drift sweep");
                if let Err(e) = run_drift_sweep(&pool, &propagator, &RetryPolicy::default()).await
                {
                    error!(error = %e, "Profile drift sweep failed");
                }
            })
        })?)
        .await?;
    info!("Scheduled: Profile drift sweep (every 15 minutes)");

    // Job 2: Failed provider event report (hourly)
    scheduler
        .add(Job::new_async("0 0 * * * *", move |_uuid, _l| {
            let ledger = ledger.clone();
            Box::pin(async move {
                if let Err(e) = report_failed_events(ledger.as_ref(), REPORT_LIMIT).await {
                    error!(error = %e, "Failed event report could not read the ledger");
                }
            })
        })?)
        .await?;
    info!("Scheduled: Failed provider event report (hourly)");

    // Job 3: Heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Heartbeat (every 5 minutes)");

    info!("Starting job scheduler");
    scheduler.start().await?;
    info!("Larder Worker started successfully with {} scheduled jobs", 3);

    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
