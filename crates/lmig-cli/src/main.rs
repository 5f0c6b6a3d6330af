use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use lmig_sync::{MigrateRequest, MigrationConfig};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "lmig-cli")]
#[command(about = "Legacy data migration pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Drain every enabled entity type (or one) into the target store.
    Migrate {
        #[arg(long)]
        entity: Option<String>,
        /// Re-drain sources whose cursor is already exhausted.
        #[arg(long)]
        resume_exhausted: bool,
    },
    Health,
    Schema {
        #[arg(long)]
        entity: String,
    },
    ResetCursor {
        #[arg(long)]
        entity: String,
    },
    /// Run the cron-driven incremental re-drain until interrupted.
    Schedule,
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; finishing in-flight batches");
            token.cancel();
        }
    });
    cancel
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lmig_sync=info,lmig_storage=info,lmig_adapters=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = MigrationConfig::from_env()?;

    match cli.command.unwrap_or(Commands::Migrate {
        entity: None,
        resume_exhausted: false,
    }) {
        Commands::Migrate {
            entity,
            resume_exhausted,
        } => {
            let request = MigrateRequest {
                entity,
                resume_exhausted,
            };
            let summary = lmig_sync::run_migration(&config, &request, cancel_on_ctrl_c()).await?;
            println!(
                "migration complete: run_id={} entity_types={} migrated={} skipped={} quarantined={} reports={}",
                summary.run_id,
                summary.entity_types,
                summary.migrated,
                summary.skipped,
                summary.quarantined,
                summary.reports_dir
            );
            if !summary.is_clean() {
                bail!(
                    "run finished with failed entity types {:?} and {} perf budget violation(s)",
                    summary.failed_entities,
                    summary.budget_violations.len()
                );
            }
        }
        Commands::Health => {
            let statuses = lmig_sync::check_health(&config).await?;
            for status in &statuses {
                println!(
                    "{:<32} {}",
                    status.component,
                    if status.healthy { "ok" } else { "UNREACHABLE" }
                );
            }
            if statuses.iter().any(|s| !s.healthy) {
                bail!("one or more components are unhealthy");
            }
        }
        Commands::Schema { entity } => {
            let schema = lmig_sync::describe_schema(&config, &entity).await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&schema).context("serializing schema")?
            );
        }
        Commands::ResetCursor { entity } => {
            lmig_sync::reset_cursor(&config, &entity).await?;
            println!("cursor for {entity} reset; next run starts from the beginning");
        }
        Commands::Schedule => {
            let Some(mut sched) = lmig_sync::maybe_build_scheduler(&config).await? else {
                bail!("scheduler disabled; set LMIG_SCHEDULER_ENABLED=true");
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.sync_cron, "scheduler running; ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}
