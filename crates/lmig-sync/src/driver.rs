//! Entity-type loops: extract a batch, fan records out to a bounded worker pool, make
//! the outcomes durable, and only then advance the cursor.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use lmig_adapters::{AdapterError, LegacyAdapter};
use lmig_core::{BatchResult, Cursor, LegacyRecord, OutcomeStatus, RecordOutcome};
use lmig_storage::{BackoffPolicy, CursorStore, RetryDisposition};
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::outcome::OutcomeWrapper;
use crate::perf::{BudgetViolation, PerfReport};
use crate::record::{EntityPlan, RecordPipeline};
use crate::report::OutcomeLog;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("extracting {entity_type} at {cursor}: {source}")]
    Extract {
        entity_type: String,
        cursor: String,
        #[source]
        source: AdapterError,
    },
    #[error("batch size must be at least 1")]
    ZeroBatchSize,
    #[error("{entity_type} returned an empty page that does not move the cursor past {cursor}")]
    Stalled { entity_type: String, cursor: String },
    #[error(transparent)]
    State(#[from] anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct DriverOptions {
    pub batch_size: usize,
    pub workers: usize,
    pub entity_parallelism: usize,
    /// Re-drain sources whose cursor is already exhausted, starting from the last batch.
    pub resume_exhausted: bool,
    pub extract_backoff: BackoffPolicy,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            batch_size: 500,
            workers: 8,
            entity_parallelism: 2,
            resume_exhausted: false,
            extract_backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Clone)]
pub struct EntityBinding {
    pub plan: EntityPlan,
    pub adapter: Arc<dyn LegacyAdapter>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OutcomeCounts {
    pub migrated: usize,
    pub skipped: usize,
    pub quarantined: usize,
}

impl OutcomeCounts {
    fn add(&mut self, status: OutcomeStatus) {
        match status {
            OutcomeStatus::Migrated => self.migrated += 1,
            OutcomeStatus::Skipped => self.skipped += 1,
            OutcomeStatus::Quarantined => self.quarantined += 1,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub entity_type: String,
    pub batch_index: usize,
    pub cursor: Option<Cursor>,
    pub next_cursor: Option<Cursor>,
    pub migrated: usize,
    pub skipped: usize,
    pub quarantined: usize,
    pub quarantined_records: Vec<RecordOutcome>,
}

impl BatchReport {
    pub fn new(
        entity_type: &str,
        batch_index: usize,
        cursor: Option<Cursor>,
        next_cursor: Option<Cursor>,
        outcomes: &[RecordOutcome],
    ) -> Self {
        let mut counts = OutcomeCounts::default();
        for outcome in outcomes {
            counts.add(outcome.status);
        }
        Self {
            entity_type: entity_type.to_string(),
            batch_index,
            cursor,
            next_cursor,
            migrated: counts.migrated,
            skipped: counts.skipped,
            quarantined: counts.quarantined,
            quarantined_records: outcomes
                .iter()
                .filter(|o| o.is_quarantined())
                .cloned()
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EntityReport {
    pub entity_type: String,
    pub resumed_from: Option<Cursor>,
    pub migrated: usize,
    pub skipped: usize,
    pub quarantined: usize,
    pub exhausted: bool,
    pub cancelled: bool,
    pub error: Option<String>,
    pub batches: Vec<BatchReport>,
}

impl EntityReport {
    fn new(entity_type: &str) -> Self {
        Self {
            entity_type: entity_type.to_string(),
            resumed_from: None,
            migrated: 0,
            skipped: 0,
            quarantined: 0,
            exhausted: false,
            cancelled: false,
            error: None,
            batches: Vec::new(),
        }
    }

    fn push(&mut self, batch: BatchReport) {
        self.migrated += batch.migrated;
        self.skipped += batch.skipped;
        self.quarantined += batch.quarantined;
        self.batches.push(batch);
    }

    pub fn status(&self) -> &'static str {
        if self.error.is_some() {
            "failed"
        } else if self.cancelled {
            "cancelled"
        } else if self.exhausted {
            "complete"
        } else {
            "partial"
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub entities: Vec<EntityReport>,
    pub perf: PerfReport,
    pub budget_violations: Vec<BudgetViolation>,
}

impl RunReport {
    pub fn totals(&self) -> OutcomeCounts {
        self.entities.iter().fold(OutcomeCounts::default(), |mut acc, e| {
            acc.migrated += e.migrated;
            acc.skipped += e.skipped;
            acc.quarantined += e.quarantined;
            acc
        })
    }

    pub fn failed_entities(&self) -> Vec<String> {
        self.entities
            .iter()
            .filter(|e| e.error.is_some())
            .map(|e| e.entity_type.clone())
            .collect()
    }
}

pub struct MigrationDriver {
    bindings: Vec<EntityBinding>,
    pipeline: Arc<RecordPipeline>,
    wrapper: OutcomeWrapper,
    cursors: CursorStore,
    run_dir: PathBuf,
    options: DriverOptions,
    cancel: CancellationToken,
}

impl MigrationDriver {
    pub fn new(
        pipeline: Arc<RecordPipeline>,
        cursors: CursorStore,
        run_dir: impl Into<PathBuf>,
        options: DriverOptions,
    ) -> Self {
        Self {
            bindings: Vec::new(),
            pipeline,
            wrapper: OutcomeWrapper::default(),
            cursors,
            run_dir: run_dir.into(),
            options,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_entity(mut self, binding: EntityBinding) -> Self {
        self.bindings.push(binding);
        self
    }

    pub fn with_wrapper(mut self, wrapper: OutcomeWrapper) -> Self {
        self.wrapper = wrapper;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn run_id(&self) -> Uuid {
        self.pipeline.run_id()
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn bindings(&self) -> &[EntityBinding] {
        &self.bindings
    }

    /// Drive every bound entity type; at most `entity_parallelism` run at once.
    pub async fn run(&self) -> RunReport {
        let started_at = Utc::now();
        let loops = self
            .bindings
            .iter()
            .map(|binding| self.run_entity(binding))
            .collect::<Vec<_>>();
        let entities = stream::iter(loops)
            .buffered(self.options.entity_parallelism.max(1))
            .collect::<Vec<_>>()
            .await;
        RunReport {
            run_id: self.run_id(),
            started_at,
            finished_at: Utc::now(),
            entities,
            perf: self.pipeline.perf().report(),
            budget_violations: Vec::new(),
        }
    }

    pub async fn run_entity(&self, binding: &EntityBinding) -> EntityReport {
        let entity_type = binding.plan.entity_type.as_str();
        let span = info_span!("migrate_entity", run_id = %self.run_id(), entity_type);
        async {
            let mut report = EntityReport::new(entity_type);
            if let Err(err) = self.drain(binding, &mut report).await {
                error!(error = %err, "entity migration stopped");
                report.error = Some(err.to_string());
            }
            info!(
                migrated = report.migrated,
                skipped = report.skipped,
                quarantined = report.quarantined,
                status = report.status(),
                "entity migration finished"
            );
            report
        }
        .instrument(span)
        .await
    }

    async fn drain(&self, binding: &EntityBinding, report: &mut EntityReport) -> Result<(), DriverError> {
        if self.options.batch_size == 0 {
            return Err(DriverError::ZeroBatchSize);
        }
        let entity_type = binding.plan.entity_type.as_str();
        let state = self.cursors.load(entity_type).await?;
        let mut cursor = if state.exhausted {
            if !self.options.resume_exhausted {
                info!("source already drained; nothing to do");
                report.exhausted = true;
                return Ok(());
            }
            state.last_position.clone()
        } else {
            state.cursor.clone()
        };
        report.resumed_from = cursor.clone();

        let log = OutcomeLog::new(&self.run_dir, entity_type);
        let mut batch_index = 0usize;
        loop {
            if self.cancel.is_cancelled() {
                info!(batch = batch_index, "cancellation requested; stopping between batches");
                report.cancelled = true;
                return Ok(());
            }

            let batch = self.extract(binding, cursor.as_ref()).await?;
            if batch.records.is_empty() && batch.next_cursor.is_some() && batch.next_cursor == cursor {
                return Err(DriverError::Stalled {
                    entity_type: entity_type.to_string(),
                    cursor: cursor.as_ref().map_or_else(|| "start".to_string(), ToString::to_string),
                });
            }
            let outcomes = self.process_batch(&binding.plan, batch.records).await;

            log.append(&outcomes).await?;
            self.cursors
                .advance(entity_type, cursor.as_ref(), batch.next_cursor.as_ref())
                .await?;

            let batch_report = BatchReport::new(
                entity_type,
                batch_index,
                cursor.clone(),
                batch.next_cursor.clone(),
                &outcomes,
            );
            info!(
                batch = batch_index,
                migrated = batch_report.migrated,
                skipped = batch_report.skipped,
                quarantined = batch_report.quarantined,
                "batch committed"
            );
            report.push(batch_report);
            batch_index += 1;

            match batch.next_cursor {
                Some(next) => cursor = Some(next),
                None => {
                    report.exhausted = true;
                    return Ok(());
                }
            }
        }
    }

    async fn extract(
        &self,
        binding: &EntityBinding,
        cursor: Option<&Cursor>,
    ) -> Result<BatchResult, DriverError> {
        let entity_type = binding.plan.entity_type.as_str();
        let backoff = self.options.extract_backoff;
        let mut attempt = 0usize;
        loop {
            let timer = self.pipeline.perf().start("extract");
            let result = binding
                .adapter
                .extract_batch(entity_type, self.options.batch_size, cursor)
                .await;
            timer.stop();

            let err = match result {
                Ok(batch) => return Ok(batch),
                Err(err) => err,
            };
            let retryable = !err.is_configuration_error()
                && err.disposition() == RetryDisposition::Retryable
                && attempt < backoff.max_retries;
            if !retryable {
                return Err(DriverError::Extract {
                    entity_type: entity_type.to_string(),
                    cursor: cursor.map_or_else(|| "start".to_string(), ToString::to_string),
                    source: err,
                });
            }
            let delay = backoff.delay_for_attempt(attempt);
            warn!(
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "batch extraction failed; retrying"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// Outcomes come back in record order regardless of completion order.
    async fn process_batch(&self, plan: &EntityPlan, records: Vec<LegacyRecord>) -> Vec<RecordOutcome> {
        let attempts = records
            .into_iter()
            .map(|record| self.process_record(plan, record))
            .collect::<Vec<_>>();
        stream::iter(attempts)
            .buffered(self.options.workers.max(1))
            .collect()
            .await
    }

    async fn process_record(&self, plan: &EntityPlan, record: LegacyRecord) -> RecordOutcome {
        let pipeline = &self.pipeline;
        self.wrapper
            .run(&plan.entity_type, &record.legacy_id, |attempt| {
                pipeline.process(plan, &record, attempt)
            })
            .await
    }
}
