//! Cron-driven incremental re-drain.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::MigrationConfig;
use crate::{run_migration, MigrateRequest};

/// Cron-driven incremental re-drains while the legacy system is still live.
pub async fn maybe_build_scheduler(config: &MigrationConfig) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let running = Arc::new(AtomicBool::new(false));
    let job_config = config.clone();
    let cron = &config.sync_cron;
    let job = Job::new_async(cron, move |_uuid, _l| {
        let config = job_config.clone();
        let running = Arc::clone(&running);
        Box::pin(async move {
            if running.swap(true, Ordering::SeqCst) {
                warn!("previous scheduled migration still running; skipping trigger");
                return;
            }
            let request = MigrateRequest {
                entity: None,
                resume_exhausted: true,
            };
            match run_migration(&config, &request, CancellationToken::new()).await {
                Ok(summary) => info!(
                    run_id = %summary.run_id,
                    migrated = summary.migrated,
                    quarantined = summary.quarantined,
                    "scheduled migration finished"
                ),
                Err(err) => error!(error = %format!("{err:#}"), "scheduled migration failed"),
            }
            running.store(false, Ordering::SeqCst);
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_scheduler_is_not_built() {
        let config = MigrationConfig::for_workspace(".");
        assert!(maybe_build_scheduler(&config).await.unwrap().is_none());
    }
}
