//! One attempt at moving one legacy record: extract check, transform, then detect,
//! reserve and load inside a single target transaction, then snapshot.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use lmig_core::{
    deterministic_target_id, CandidateRow, ConflictResolution, FailureStage, FieldMap,
    LegacyRecord, LegacySchema, LoadSnapshot, RecordOutcome,
};
use lmig_storage::{SnapshotStore, TargetStore, TargetTx};
use serde_json::Value as JsonValue;
use tracing::debug;
use uuid::Uuid;

use crate::conflict::{ConflictDetector, ConflictMatch};
use crate::outcome::StageError;
use crate::perf::PerfTracker;
use crate::transform::TransformChain;
use crate::workflow::EditWindowCheck;

pub const DEFAULT_VERB: &str = "migrate";

/// Everything the pipeline needs to know about one entity type, resolved at startup.
#[derive(Clone)]
pub struct EntityPlan {
    pub entity_type: String,
    pub schema: LegacySchema,
    /// Legacy column name to target field name.
    pub field_map: BTreeMap<String, String>,
    /// Target fields that must be non-null after normalization.
    pub required_fields: Vec<String>,
    pub detector: Arc<dyn ConflictDetector>,
    pub resolution: ConflictResolution,
    pub verb: String,
}

impl EntityPlan {
    pub fn new(entity_type: &str, schema: LegacySchema, detector: Arc<dyn ConflictDetector>) -> Self {
        Self {
            entity_type: entity_type.to_string(),
            schema,
            field_map: BTreeMap::new(),
            required_fields: Vec::new(),
            detector,
            resolution: ConflictResolution::default(),
            verb: DEFAULT_VERB.to_string(),
        }
    }

    pub fn with_resolution(mut self, resolution: ConflictResolution) -> Self {
        self.resolution = resolution;
        self
    }

    pub fn with_field_map(mut self, field_map: BTreeMap<String, String>) -> Self {
        self.field_map = field_map;
        self
    }

    pub fn with_required_fields(mut self, fields: Vec<String>) -> Self {
        self.required_fields = fields;
        self
    }

    pub fn with_verb(mut self, verb: &str) -> Self {
        self.verb = verb.to_string();
        self
    }
}

enum Detected {
    Replay { target_id: Uuid, owned: bool },
    Conflict(ConflictMatch),
    Fresh,
}

enum Staged {
    Loaded {
        target_id: Uuid,
        resolution: Option<ConflictResolution>,
        before: Option<FieldMap>,
        after: FieldMap,
    },
    Skipped {
        target_id: Uuid,
        resolution: ConflictResolution,
        commit: bool,
    },
}

fn is_blank(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => true,
        JsonValue::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

/// A committed load whose snapshot write failed; the next attempt only finishes the write.
struct UnwrittenSnapshot {
    snapshot: LoadSnapshot,
    resolution: Option<ConflictResolution>,
}

pub struct RecordPipeline {
    run_id: Uuid,
    chain: Arc<TransformChain>,
    store: Arc<dyn TargetStore>,
    snapshots: SnapshotStore,
    workflow: Arc<dyn EditWindowCheck>,
    perf: Arc<PerfTracker>,
    /// Keyed by (entity type, legacy id).
    unwritten: Mutex<HashMap<(String, String), UnwrittenSnapshot>>,
}

impl RecordPipeline {
    pub fn new(
        run_id: Uuid,
        chain: Arc<TransformChain>,
        store: Arc<dyn TargetStore>,
        snapshots: SnapshotStore,
        workflow: Arc<dyn EditWindowCheck>,
        perf: Arc<PerfTracker>,
    ) -> Self {
        Self {
            run_id,
            chain,
            store,
            snapshots,
            workflow,
            perf,
            unwritten: Mutex::new(HashMap::new()),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn perf(&self) -> &Arc<PerfTracker> {
        &self.perf
    }

    /// `attempt` is the 0-based retry index supplied by the outcome wrapper.
    pub async fn process(
        &self,
        plan: &EntityPlan,
        record: &LegacyRecord,
        attempt: u32,
    ) -> Result<RecordOutcome, StageError> {
        let timer = self.perf.start("record");
        let result = self.process_once(plan, record).await;
        timer.stop();
        result.map(|outcome| outcome.with_attempts(attempt + 1))
    }

    async fn process_once(
        &self,
        plan: &EntityPlan,
        record: &LegacyRecord,
    ) -> Result<RecordOutcome, StageError> {
        if let Some(reason) = &record.malformed {
            return Err(StageError::rejected(
                FailureStage::Extract,
                "MALFORMED_RECORD",
                reason.clone(),
            ));
        }

        let key = (plan.entity_type.clone(), record.legacy_id.clone());
        let unwritten = self.unwritten.lock().ok().and_then(|mut m| m.remove(&key));
        if let Some(unwritten) = unwritten {
            return self.finish_snapshot(key, unwritten).await;
        }

        let timer = self.perf.start("transform");
        let candidate = self
            .chain
            .apply(&plan.entity_type, &plan.schema, &plan.field_map, record);
        timer.stop();
        if let Some(missing) = plan
            .required_fields
            .iter()
            .find(|f| candidate.fields.get(*f).map_or(true, is_blank))
        {
            return Err(StageError::rejected(
                FailureStage::Transform,
                "REQUIRED_FIELD_MISSING",
                format!("`{missing}` is empty after normalization"),
            ));
        }

        let mut tx = self
            .store
            .begin()
            .await
            .map_err(StageError::store(FailureStage::Detect))?;
        let staged = match self.stage(plan, &candidate, tx.as_mut()).await {
            Ok(staged) => staged,
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    debug!(error = %rollback_err, "rollback after failed stage");
                }
                return Err(err);
            }
        };

        match staged {
            Staged::Skipped {
                target_id,
                resolution,
                commit,
            } => {
                let finished = if commit { tx.commit().await } else { tx.rollback().await };
                finished.map_err(StageError::store(FailureStage::Load))?;
                debug!(
                    entity_type = %plan.entity_type,
                    legacy_id = %record.legacy_id,
                    %target_id,
                    resolution = resolution.as_str(),
                    "conflict left target untouched"
                );
                Ok(RecordOutcome::skipped(
                    &plan.entity_type,
                    &record.legacy_id,
                    target_id,
                    resolution,
                ))
            }
            Staged::Loaded {
                target_id,
                resolution,
                before,
                after,
            } => {
                tx.commit()
                    .await
                    .map_err(StageError::store(FailureStage::Load))?;

                let unwritten = UnwrittenSnapshot {
                    snapshot: LoadSnapshot {
                        run_id: self.run_id,
                        entity_type: plan.entity_type.clone(),
                        legacy_id: record.legacy_id.clone(),
                        target_id,
                        loaded_at: Utc::now(),
                        before,
                        after,
                        source: record.data.clone(),
                    },
                    resolution,
                };
                self.finish_snapshot(key, unwritten).await
            }
        }
    }

    /// Writes the audit snapshot of a committed load. On failure the snapshot is kept so the
    /// retry records the original `before` instead of re-staging against the loaded row.
    async fn finish_snapshot(
        &self,
        key: (String, String),
        unwritten: UnwrittenSnapshot,
    ) -> Result<RecordOutcome, StageError> {
        let timer = self.perf.start("snapshot");
        let stored = self.snapshots.store_snapshot(&unwritten.snapshot).await;
        timer.stop();
        if let Err(err) = stored {
            if let Ok(mut pending) = self.unwritten.lock() {
                pending.insert(key, unwritten);
            }
            return Err(StageError::other(FailureStage::Snapshot, format!("{err:#}")));
        }

        let snapshot = &unwritten.snapshot;
        let outcome =
            RecordOutcome::migrated(&snapshot.entity_type, &snapshot.legacy_id, snapshot.target_id);
        Ok(match unwritten.resolution {
            Some(resolution) => outcome.with_resolution(resolution),
            None => outcome,
        })
    }

    async fn stage(
        &self,
        plan: &EntityPlan,
        candidate: &CandidateRow,
        tx: &mut dyn TargetTx,
    ) -> Result<Staged, StageError> {
        let entity_type = plan.entity_type.as_str();
        let legacy_id = candidate.legacy_id.as_str();

        let timer = self.perf.start("detect");
        let detected = self.detect(plan, candidate, tx).await;
        timer.stop();

        let (target_id, resolution) = match detected? {
            Detected::Replay {
                target_id,
                owned: true,
            } => (target_id, None),
            // Bound earlier to a row another record (or the target system) owns.
            Detected::Replay {
                target_id,
                owned: false,
            } => (target_id, Some(plan.resolution)),
            Detected::Conflict(hit) => {
                debug!(
                    entity_type,
                    legacy_id,
                    detector = %hit.detector,
                    score = hit.score,
                    existing = ?hit.existing_legacy_id,
                    "conflict detected"
                );
                (hit.target_id, Some(plan.resolution))
            }
            Detected::Fresh => (deterministic_target_id(entity_type, legacy_id), None),
        };
        if resolution == Some(ConflictResolution::Review) {
            return Ok(Staged::Skipped {
                target_id,
                resolution: ConflictResolution::Review,
                commit: false,
            });
        }

        let timer = self.perf.start("reserve");
        let reserved = tx.reserve_identity(entity_type, legacy_id, target_id).await;
        timer.stop();
        let target_id = reserved.map_err(StageError::store(FailureStage::Reserve))?;

        if resolution == Some(ConflictResolution::Skip) {
            return Ok(Staged::Skipped {
                target_id,
                resolution: ConflictResolution::Skip,
                commit: true,
            });
        }

        let timer = self.perf.start("load");
        let loaded = self.load(plan, candidate, target_id, tx).await;
        timer.stop();
        let before = loaded?;

        let mut after = before.clone().unwrap_or_default();
        after.extend(candidate.fields.clone());
        Ok(Staged::Loaded {
            target_id,
            resolution,
            before,
            after,
        })
    }

    /// Identity-map replay first; the detector only runs for records never reserved.
    async fn detect(
        &self,
        plan: &EntityPlan,
        candidate: &CandidateRow,
        tx: &mut dyn TargetTx,
    ) -> Result<Detected, StageError> {
        let replayed = tx
            .lookup_identity(&plan.entity_type, &candidate.legacy_id)
            .await
            .map_err(StageError::store(FailureStage::Detect))?;
        if let Some(target_id) = replayed {
            let owned = tx
                .fetch_row(&plan.entity_type, target_id)
                .await
                .map_err(StageError::store(FailureStage::Detect))?
                .map_or(true, |row| {
                    row.legacy_id.as_deref() == Some(candidate.legacy_id.as_str())
                });
            return Ok(Detected::Replay { target_id, owned });
        }
        Ok(match plan.detector.detect(tx, candidate).await? {
            Some(hit) => Detected::Conflict(hit),
            None => Detected::Fresh,
        })
    }

    async fn load(
        &self,
        plan: &EntityPlan,
        candidate: &CandidateRow,
        target_id: Uuid,
        tx: &mut dyn TargetTx,
    ) -> Result<Option<FieldMap>, StageError> {
        self.workflow
            .check_edit_window(&plan.entity_type, target_id, &plan.verb)
            .map_err(|locked| StageError::new(FailureStage::Load, locked))?;
        let before = tx
            .fetch_row(&plan.entity_type, target_id)
            .await
            .map_err(StageError::store(FailureStage::Load))?
            .map(|row| row.fields);
        tx.upsert(
            &plan.entity_type,
            target_id,
            &candidate.legacy_id,
            &candidate.fields,
        )
        .await
        .map_err(StageError::store(FailureStage::Load))?;
        Ok(before)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::{NaturalKeyDetector, NoConflictDetector};
    use crate::workflow::{LockedDocuments, OpenEditWindow};
    use lmig_core::{ColumnDef, ColumnRole, OutcomeStatus};
    use lmig_storage::{MemoryTargetStore, StoreError, StoreOp};
    use serde_json::json;
    use tempfile::tempdir;

    fn customer_plan() -> EntityPlan {
        let schema = LegacySchema {
            table_name: "customers".into(),
            columns: vec![
                ColumnDef::new("EMAIL", "email", ColumnRole::NaturalKey),
                ColumnDef::new("NAME", "string", ColumnRole::Attribute),
            ],
        };
        let mut field_map = BTreeMap::new();
        field_map.insert("EMAIL".to_string(), "email".to_string());
        field_map.insert("NAME".to_string(), "name".to_string());
        EntityPlan::new(
            "customer",
            schema,
            Arc::new(NaturalKeyDetector::new("customer", vec!["email".into()])),
        )
        .with_field_map(field_map)
        .with_required_fields(vec!["email".into()])
    }

    fn record(id: &str, email: &str, name: &str) -> LegacyRecord {
        LegacyRecord::new(
            id,
            serde_json::from_value(json!({"EMAIL": email, "NAME": name})).unwrap(),
        )
    }

    fn pipeline(
        store: &MemoryTargetStore,
        snapshots: &std::path::Path,
        workflow: Arc<dyn EditWindowCheck>,
    ) -> RecordPipeline {
        RecordPipeline::new(
            Uuid::new_v4(),
            Arc::new(TransformChain::with_defaults()),
            Arc::new(store.clone()),
            SnapshotStore::new(snapshots),
            workflow,
            Arc::new(PerfTracker::new()),
        )
    }

    #[tokio::test]
    async fn new_record_is_loaded_with_deterministic_id_and_snapshotted() {
        let dir = tempdir().unwrap();
        let store = MemoryTargetStore::new();
        let pipeline = pipeline(&store, dir.path(), Arc::new(OpenEditWindow));
        let plan = customer_plan();

        let outcome = pipeline
            .process(&plan, &record("C1", "Ann.Lee@Gmail.com", " Ann "), 0)
            .await
            .unwrap();
        let expected_id = deterministic_target_id("customer", "C1");
        assert_eq!(outcome, RecordOutcome::migrated("customer", "C1", expected_id));

        let rows = store.rows("customer").await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].fields["email"], json!("annlee@gmail.com"));
        assert_eq!(rows[0].fields["name"], json!("Ann"));

        let snapshots = SnapshotStore::new(dir.path())
            .snapshots_for("customer", expected_id)
            .await
            .unwrap();
        assert_eq!(snapshots.len(), 1);
        assert!(snapshots[0].before.is_none());
        for label in ["record", "transform", "detect", "reserve", "load", "snapshot"] {
            assert_eq!(pipeline.perf().stats(label).count, 1, "{label}");
        }
    }

    #[tokio::test]
    async fn replay_reapplies_without_duplicating() {
        let dir = tempdir().unwrap();
        let store = MemoryTargetStore::new();
        let pipeline = pipeline(&store, dir.path(), Arc::new(OpenEditWindow));
        let plan = customer_plan();
        let rec = record("C1", "ann@example.com", "Ann");

        let first = pipeline.process(&plan, &rec, 0).await.unwrap();
        let second = pipeline.process(&plan, &rec, 0).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(store.row_count("customer").await, 1);
    }

    #[tokio::test]
    async fn conflict_resolutions_follow_the_plan() {
        let dir = tempdir().unwrap();
        let store = MemoryTargetStore::new();
        let existing = store
            .seed_row(
                "customer",
                serde_json::from_value(json!({"email": "ann@example.com", "tier": "gold"})).unwrap(),
            )
            .await;
        let pipeline = pipeline(&store, dir.path(), Arc::new(OpenEditWindow));

        let review = customer_plan().with_resolution(ConflictResolution::Review);
        let outcome = pipeline
            .process(&review, &record("R1", "ann@example.com", "Ann"), 0)
            .await
            .unwrap();
        assert_eq!(outcome.status, OutcomeStatus::Skipped);
        assert_eq!(outcome.resolution, Some(ConflictResolution::Review));
        assert!(store.identity("customer", "R1").await.is_none());

        let skip = customer_plan();
        let outcome = pipeline
            .process(&skip, &record("S1", "ann@example.com", "Ann"), 0)
            .await
            .unwrap();
        assert_eq!(outcome.status, OutcomeStatus::Skipped);
        assert_eq!(outcome.target_id, Some(existing));
        assert_eq!(store.identity("customer", "S1").await, Some(existing));

        let merge = customer_plan().with_resolution(ConflictResolution::Merge);
        let outcome = pipeline
            .process(&merge, &record("M1", "ann@example.com", "Ann Lee"), 0)
            .await
            .unwrap();
        assert_eq!(outcome.status, OutcomeStatus::Migrated);
        assert_eq!(outcome.resolution, Some(ConflictResolution::Merge));
        let rows = store.rows("customer").await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].fields["tier"], json!("gold"));
        assert_eq!(rows[0].fields["name"], json!("Ann Lee"));
    }

    #[tokio::test]
    async fn replaying_a_skipped_record_stays_skipped() {
        let dir = tempdir().unwrap();
        let store = MemoryTargetStore::new();
        let existing = store
            .seed_row(
                "customer",
                serde_json::from_value(json!({"email": "ann@example.com", "name": "Ann"})).unwrap(),
            )
            .await;
        let pipeline = pipeline(&store, dir.path(), Arc::new(OpenEditWindow));
        let plan = customer_plan();
        let rec = record("S1", "ann@example.com", "Somebody Else");

        let first = pipeline.process(&plan, &rec, 0).await.unwrap();
        let second = pipeline.process(&plan, &rec, 0).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(second.status, OutcomeStatus::Skipped);
        assert_eq!(second.target_id, Some(existing));
        let rows = store.rows("customer").await;
        assert_eq!(rows[0].fields["name"], json!("Ann"));
    }

    #[tokio::test]
    async fn stage_failures_carry_their_stage() {
        let dir = tempdir().unwrap();
        let store = MemoryTargetStore::new();
        let locked_id = deterministic_target_id("customer", "L1");
        let pipeline = pipeline(
            &store,
            dir.path(),
            Arc::new(LockedDocuments::new().lock("customer", locked_id, "approved")),
        );
        let plan = customer_plan();

        let malformed = LegacyRecord::malformed("row-3", FieldMap::new(), "wrong field count");
        let err = pipeline.process(&plan, &malformed, 0).await.unwrap_err();
        assert_eq!(err.stage, Some(FailureStage::Extract));

        let err = pipeline
            .process(&plan, &record("E1", "   ", "No Mail"), 0)
            .await
            .unwrap_err();
        assert_eq!(err.stage, Some(FailureStage::Transform));

        let err = pipeline
            .process(&plan, &record("L1", "locked@example.com", "Locked"), 0)
            .await
            .unwrap_err();
        assert_eq!(err.stage, Some(FailureStage::Load));
        assert!(err.to_string().contains("approved"));
        assert_eq!(store.row_count("customer").await, 0);
        assert!(store.identity("customer", "L1").await.is_none());

        store
            .inject_fault(StoreOp::Reserve, StoreError::status("23505", "duplicate key"), 1)
            .await;
        let err = pipeline
            .process(&plan, &record("D1", "dup@example.com", "Dup"), 0)
            .await
            .unwrap_err();
        assert_eq!(err.stage, Some(FailureStage::Reserve));
    }

    #[tokio::test]
    async fn failed_snapshot_write_is_retried_with_the_original_before() {
        let dir = tempdir().unwrap();
        let snapshots_root = dir.path().join("snapshots");
        std::fs::write(&snapshots_root, b"not a directory").unwrap();
        let store = MemoryTargetStore::new();
        let pipeline = pipeline(&store, &snapshots_root, Arc::new(OpenEditWindow));
        let plan = customer_plan();
        let rec = record("C9", "new@example.com", "New");

        let err = pipeline.process(&plan, &rec, 0).await.unwrap_err();
        assert_eq!(err.stage, Some(FailureStage::Snapshot));
        assert_eq!(store.row_count("customer").await, 1);
        let commits = store.commit_count().await;

        std::fs::remove_file(&snapshots_root).unwrap();
        let outcome = pipeline.process(&plan, &rec, 1).await.unwrap();
        let target_id = deterministic_target_id("customer", "C9");
        assert_eq!(outcome.target_id, Some(target_id));
        assert_eq!(outcome.attempts, 2);
        assert_eq!(store.commit_count().await, commits);

        let written = SnapshotStore::new(&snapshots_root)
            .snapshots_for("customer", target_id)
            .await
            .unwrap();
        assert_eq!(written.len(), 1);
        assert!(written[0].before.is_none());
        assert_eq!(written[0].after["email"], json!("new@example.com"));
    }

    #[tokio::test]
    async fn ledger_entries_without_keys_always_append() {
        let dir = tempdir().unwrap();
        let store = MemoryTargetStore::new();
        let pipeline = pipeline(&store, dir.path(), Arc::new(OpenEditWindow));
        let plan = EntityPlan::new(
            "ledger_entry",
            LegacySchema {
                table_name: "ledger".into(),
                columns: vec![ColumnDef::new("AMOUNT", "decimal", ColumnRole::Attribute)],
            },
            Arc::new(NoConflictDetector::new("ledger_entry")),
        );
        for id in ["1", "2"] {
            let rec = LegacyRecord::new(id, serde_json::from_value(json!({"AMOUNT": "10.00"})).unwrap());
            let outcome = pipeline.process(&plan, &rec, 2).await.unwrap();
            assert_eq!(outcome.attempts, 3);
        }
        let rows = store.rows("ledger_entry").await;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].fields["AMOUNT"], json!(10.0));
    }
}
