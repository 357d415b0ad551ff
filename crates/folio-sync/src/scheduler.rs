use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

use crate::config::SyncConfig;
use crate::orchestrator::BatchOrchestrator;
use crate::retention::RetentionPass;

/// Cron jobs for the nightly batch and the retention pass. `None` when
/// `FOLIO_SCHEDULER_ENABLED` is off; the caller starts the returned scheduler.
pub async fn maybe_build_scheduler(
    config: &SyncConfig,
    orchestrator: Arc<BatchOrchestrator>,
    retention: Arc<RetentionPass>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;

    let batch_job = Job::new_async(config.sync_cron.as_str(), move |_uuid, _l| {
        let orchestrator = orchestrator.clone();
        Box::pin(async move {
            match orchestrator.run(Utc::now()).await {
                Ok(summary) => info!(
                    items_synced = summary.items_synced,
                    items_failed = summary.items_failed,
                    "scheduled batch finished"
                ),
                Err(err) => error!(error = %err, "scheduled batch failed"),
            }
        })
    })
    .with_context(|| format!("creating batch job for cron {}", config.sync_cron))?;
    sched.add(batch_job).await.context("adding batch job")?;

    let retention_job = Job::new_async(config.retention_cron.as_str(), move |_uuid, _l| {
        let retention = retention.clone();
        Box::pin(async move {
            match retention.run(Utc::now()).await {
                Ok(report) => info!(
                    daily_months = report.daily_months_archived.len(),
                    transaction_months = report.transaction_months_archived.len(),
                    "scheduled retention finished"
                ),
                Err(err) => error!(error = %err, "scheduled retention failed"),
            }
        })
    })
    .with_context(|| format!("creating retention job for cron {}", config.retention_cron))?;
    sched.add(retention_job).await.context("adding retention job")?;

    info!(sync_cron = %config.sync_cron, retention_cron = %config.retention_cron, "scheduler configured");
    Ok(Some(sched))
}
