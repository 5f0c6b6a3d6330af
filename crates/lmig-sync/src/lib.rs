//! Migration pipeline orchestration: transform chain, conflict detection, per-record
//! fault isolation, stage timing and the resumable entity-type driver.

pub mod config;
pub mod conflict;
pub mod driver;
pub mod outcome;
pub mod perf;
pub mod record;
pub mod report;
pub mod schedule;
pub mod transform;
pub mod workflow;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use lmig_adapters::{adapter_for_source, LegacyAdapter};
use lmig_core::LegacySchema;
use lmig_storage::{
    CursorStore, HttpClientConfig, HttpFetcher, MemoryTargetStore, PgStoreConfig, PgTargetStore,
    SnapshotStore, TargetStore,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

pub use config::{EntityConfig, EntityRegistryFile, MigrationConfig, TargetKind};
pub use conflict::{
    detector_from_spec, ConflictDetector, ConflictDetectorRegistry, ConflictMatch, DetectorSpec,
    FuzzyNameDetector, NaturalKeyDetector, NoConflictDetector, RegistryError,
};
pub use driver::{
    BatchReport, DriverError, DriverOptions, EntityBinding, EntityReport, MigrationDriver,
    OutcomeCounts, RunReport,
};
pub use outcome::{classify, OutcomeWrapper, StageError, StageErrorKind};
pub use perf::{check_budgets, BudgetViolation, BudgetViolations, PerfBudgets, PerfTracker};
pub use record::{EntityPlan, RecordPipeline};
pub use report::{write_run_reports, OutcomeLog};
pub use schedule::maybe_build_scheduler;
pub use transform::{TransformChain, TransformStep};
pub use workflow::{EditWindowCheck, LockedDocuments, OpenEditWindow, WorkflowLocked};

pub const CRATE_NAME: &str = "lmig-sync";

#[derive(Debug, Clone, Default)]
pub struct MigrateRequest {
    /// Restrict the run to one entity type (runs it even when disabled in the registry file).
    pub entity: Option<String>,
    pub resume_exhausted: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub entity_types: usize,
    pub migrated: usize,
    pub skipped: usize,
    pub quarantined: usize,
    pub failed_entities: Vec<String>,
    pub budget_violations: Vec<BudgetViolation>,
    pub reports_dir: String,
    pub parquet_manifest: String,
}

impl RunSummary {
    pub fn is_clean(&self) -> bool {
        self.failed_entities.is_empty() && self.budget_violations.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub component: String,
    pub healthy: bool,
}

fn http_fetcher(config: &MigrationConfig) -> Result<Arc<HttpFetcher>> {
    let fetcher = HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        ..Default::default()
    })?;
    Ok(Arc::new(fetcher))
}

pub fn build_adapter(
    config: &MigrationConfig,
    entity: &EntityConfig,
    http: Arc<HttpFetcher>,
) -> Result<Arc<dyn LegacyAdapter>> {
    adapter_for_source(
        &entity.entity_type,
        &entity.source,
        &entity.columns,
        &config.workspace_root,
        Some(http),
    )
    .with_context(|| format!("building adapter for {}", entity.entity_type))
}

pub async fn connect_target(config: &MigrationConfig) -> Result<Arc<dyn TargetStore>> {
    match config.target {
        TargetKind::Memory => {
            warn!("using the in-memory target store; nothing will be persisted");
            Ok(Arc::new(MemoryTargetStore::new()))
        }
        TargetKind::Postgres => {
            let store = PgTargetStore::connect(&PgStoreConfig::new(config.database_url.clone()))
                .await
                .context("connecting to target database")?;
            store.migrate().await.context("applying target migrations")?;
            Ok(Arc::new(store))
        }
    }
}

/// Resolve adapters, schemas and detectors for every selected entity type. Any wiring
/// mistake fails here, before a single record is touched.
pub async fn prepare_driver(
    config: &MigrationConfig,
    file: &EntityRegistryFile,
    store: Arc<dyn TargetStore>,
    request: &MigrateRequest,
    cancel: CancellationToken,
) -> Result<MigrationDriver> {
    let run_id = Uuid::new_v4();
    let http = http_fetcher(config)?;
    let entities = file.enabled_entities(request.entity.as_deref())?;

    let mut registry = ConflictDetectorRegistry::new();
    let mut staged = Vec::new();
    for entity in entities {
        let adapter = build_adapter(config, entity, Arc::clone(&http))?;
        let schema = adapter
            .get_schema(&entity.entity_type)
            .await
            .with_context(|| format!("reading legacy schema for {}", entity.entity_type))?;
        registry.register(
            &entity.entity_type,
            detector_from_spec(&entity.entity_type, &entity.detector),
        )?;
        staged.push((entity, adapter, schema));
    }

    let pipeline = Arc::new(RecordPipeline::new(
        run_id,
        Arc::new(TransformChain::with_defaults()),
        store,
        SnapshotStore::new(config.snapshots_dir()),
        Arc::new(OpenEditWindow),
        Arc::new(PerfTracker::new()),
    ));
    let options = DriverOptions {
        batch_size: config.batch_size,
        workers: config.workers,
        entity_parallelism: config.entity_parallelism,
        resume_exhausted: request.resume_exhausted,
        ..DriverOptions::default()
    };
    let mut driver = MigrationDriver::new(
        pipeline,
        CursorStore::new(config.cursors_dir()),
        config.reports_dir().join(run_id.to_string()),
        options,
    )
    .with_cancellation(cancel);

    for (entity, adapter, schema) in staged {
        let detector = registry.get_conflict_detector(&entity.entity_type)?;
        let plan = EntityPlan::new(&entity.entity_type, schema, detector)
            .with_field_map(entity.field_map.clone())
            .with_required_fields(entity.required_fields.clone())
            .with_resolution(entity.resolution)
            .with_verb(&entity.verb);
        driver = driver.with_entity(EntityBinding { plan, adapter });
    }
    Ok(driver)
}

/// Run a prepared driver, then write reports and evaluate perf budgets.
pub async fn execute(driver: &MigrationDriver, budgets: &PerfBudgets) -> Result<RunSummary> {
    let mut report = driver.run().await;
    if let Err(violations) = check_budgets(&report.perf, budgets) {
        warn!("{violations}");
        report.budget_violations = violations.0;
    }
    let paths = write_run_reports(driver.run_dir(), &report).await?;

    for binding in driver.bindings() {
        if let Err(err) = binding.adapter.close().await {
            warn!(entity_type = %binding.plan.entity_type, error = %err, "closing adapter");
        }
    }

    let totals = report.totals();
    let summary = RunSummary {
        run_id: report.run_id,
        started_at: report.started_at,
        finished_at: report.finished_at,
        entity_types: report.entities.len(),
        migrated: totals.migrated,
        skipped: totals.skipped,
        quarantined: totals.quarantined,
        failed_entities: report.failed_entities(),
        budget_violations: report.budget_violations.clone(),
        reports_dir: paths.reports_dir.display().to_string(),
        parquet_manifest: paths.parquet_manifest.display().to_string(),
    };
    info!(
        run_id = %summary.run_id,
        migrated = summary.migrated,
        skipped = summary.skipped,
        quarantined = summary.quarantined,
        "migration run finished"
    );
    Ok(summary)
}

pub async fn run_migration(
    config: &MigrationConfig,
    request: &MigrateRequest,
    cancel: CancellationToken,
) -> Result<RunSummary> {
    let file = EntityRegistryFile::load(&config.registry_file).await?;
    let store = connect_target(config).await?;
    let driver = prepare_driver(config, &file, store, request, cancel).await?;
    execute(&driver, &file.perf_budgets).await
}

pub async fn run_migration_once_from_env() -> Result<RunSummary> {
    let config = MigrationConfig::from_env()?;
    run_migration(&config, &MigrateRequest::default(), CancellationToken::new()).await
}

pub async fn check_health(config: &MigrationConfig) -> Result<Vec<HealthStatus>> {
    let file = EntityRegistryFile::load(&config.registry_file).await?;
    let http = http_fetcher(config)?;
    let mut statuses = Vec::new();
    for entity in file.enabled_entities(None)? {
        let adapter = build_adapter(config, entity, Arc::clone(&http))?;
        statuses.push(HealthStatus {
            component: format!("source:{}", entity.entity_type),
            healthy: adapter.health_check().await,
        });
    }
    let target_healthy = match connect_target(config).await {
        Ok(store) => store.health_check().await,
        Err(err) => {
            warn!(error = %format!("{err:#}"), "target store unreachable");
            false
        }
    };
    statuses.push(HealthStatus {
        component: "target".to_string(),
        healthy: target_healthy,
    });
    Ok(statuses)
}

pub async fn describe_schema(config: &MigrationConfig, entity_type: &str) -> Result<LegacySchema> {
    let file = EntityRegistryFile::load(&config.registry_file).await?;
    let entity = file
        .enabled_entities(Some(entity_type))?
        .into_iter()
        .next()
        .with_context(|| format!("entity type `{entity_type}` is not declared"))?;
    let adapter = build_adapter(config, entity, http_fetcher(config)?)?;
    adapter
        .get_schema(entity_type)
        .await
        .with_context(|| format!("reading legacy schema for {entity_type}"))
}

pub async fn reset_cursor(config: &MigrationConfig, entity_type: &str) -> Result<()> {
    CursorStore::new(config.cursors_dir()).reset(entity_type).await
}
