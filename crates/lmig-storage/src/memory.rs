//! In-process target store with optimistic serializable validation.
//!
//! Used for dry runs and tests. A transaction records what it read; at commit time any row
//! or identity committed by someone else after the transaction began that would have changed
//! those reads aborts the commit with a serialization failure, mirroring what a serializable
//! relational store reports for write skew.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use lmig_core::FieldMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::target::{StoreError, TargetRow, TargetStore, TargetTx};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Begin,
    LookupIdentity,
    FindByKeys,
    Reserve,
    Upsert,
    Commit,
}

#[derive(Debug, Clone)]
struct VersionedRow {
    row: TargetRow,
    version: u64,
}

#[derive(Debug, Default)]
struct MemoryState {
    version: u64,
    rows: HashMap<(String, Uuid), VersionedRow>,
    identities: HashMap<(String, String), (Uuid, u64)>,
    faults: Vec<(StoreOp, StoreError)>,
    commits: u64,
}

impl MemoryState {
    fn take_fault(&mut self, op: StoreOp) -> Result<(), StoreError> {
        match self.faults.iter().position(|(o, _)| *o == op) {
            Some(idx) => Err(self.faults.remove(idx).1),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryTargetStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryTargetStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` calls of `op` with `error`.
    pub async fn inject_fault(&self, op: StoreOp, error: StoreError, times: usize) {
        let mut state = self.state.lock().await;
        for _ in 0..times {
            state.faults.push((op, error.clone()));
        }
    }

    /// Insert a pre-existing target row that has no legacy origin.
    pub async fn seed_row(&self, entity_type: &str, fields: FieldMap) -> Uuid {
        let mut state = self.state.lock().await;
        state.version += 1;
        let version = state.version;
        let target_id = Uuid::new_v4();
        state.rows.insert(
            (entity_type.to_string(), target_id),
            VersionedRow {
                row: TargetRow {
                    target_id,
                    legacy_id: None,
                    fields,
                },
                version,
            },
        );
        target_id
    }

    pub async fn rows(&self, entity_type: &str) -> Vec<TargetRow> {
        let state = self.state.lock().await;
        let mut rows = state
            .rows
            .iter()
            .filter(|((entity, _), _)| entity == entity_type)
            .map(|(_, v)| v.row.clone())
            .collect::<Vec<_>>();
        rows.sort_by(|a, b| a.legacy_id.cmp(&b.legacy_id).then(a.target_id.cmp(&b.target_id)));
        rows
    }

    pub async fn row_count(&self, entity_type: &str) -> usize {
        let state = self.state.lock().await;
        state.rows.keys().filter(|(entity, _)| entity == entity_type).count()
    }

    pub async fn identity(&self, entity_type: &str, legacy_id: &str) -> Option<Uuid> {
        let state = self.state.lock().await;
        state
            .identities
            .get(&(entity_type.to_string(), legacy_id.to_string()))
            .map(|(id, _)| *id)
    }

    pub async fn commit_count(&self) -> u64 {
        self.state.lock().await.commits
    }
}

#[async_trait]
impl TargetStore for MemoryTargetStore {
    async fn begin(&self) -> Result<Box<dyn TargetTx>, StoreError> {
        let mut state = self.state.lock().await;
        state.take_fault(StoreOp::Begin)?;
        Ok(Box::new(MemoryTx {
            state: Arc::clone(&self.state),
            start_version: state.version,
            identity_reads: Vec::new(),
            key_reads: Vec::new(),
            reserved: Vec::new(),
            writes: Vec::new(),
        }))
    }

    async fn health_check(&self) -> bool {
        true
    }
}

struct MemoryTx {
    state: Arc<Mutex<MemoryState>>,
    start_version: u64,
    identity_reads: Vec<(String, String)>,
    key_reads: Vec<(String, FieldMap)>,
    reserved: Vec<(String, String, Uuid)>,
    writes: Vec<(String, TargetRow)>,
}

impl MemoryTx {
    fn pending_row(&self, entity_type: &str, target_id: Uuid) -> Option<&TargetRow> {
        self.writes
            .iter()
            .rev()
            .find(|(entity, row)| entity == entity_type && row.target_id == target_id)
            .map(|(_, row)| row)
    }

    fn validate(&self, state: &MemoryState) -> Result<(), StoreError> {
        for (entity, legacy_id) in &self.identity_reads {
            if let Some((_, version)) = state.identities.get(&(entity.clone(), legacy_id.clone())) {
                if *version > self.start_version {
                    return Err(StoreError::serialization_failure(format!(
                        "could not serialize access: identity {entity}/{legacy_id} changed concurrently"
                    )));
                }
            }
        }
        for (entity, keys) in &self.key_reads {
            let concurrent = state.rows.iter().any(|((e, _), v)| {
                e == entity && v.version > self.start_version && v.row.matches_keys(keys)
            });
            if concurrent {
                return Err(StoreError::serialization_failure(format!(
                    "could not serialize access: {entity} rows matching natural key changed concurrently"
                )));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl TargetTx for MemoryTx {
    async fn lookup_identity(
        &mut self,
        entity_type: &str,
        legacy_id: &str,
    ) -> Result<Option<Uuid>, StoreError> {
        if let Some((_, _, id)) = self
            .reserved
            .iter()
            .find(|(e, l, _)| e == entity_type && l == legacy_id)
        {
            return Ok(Some(*id));
        }
        let mut state = self.state.lock().await;
        state.take_fault(StoreOp::LookupIdentity)?;
        self.identity_reads
            .push((entity_type.to_string(), legacy_id.to_string()));
        Ok(state
            .identities
            .get(&(entity_type.to_string(), legacy_id.to_string()))
            .filter(|(_, version)| *version <= self.start_version)
            .map(|(id, _)| *id))
    }

    async fn fetch_row(
        &mut self,
        entity_type: &str,
        target_id: Uuid,
    ) -> Result<Option<TargetRow>, StoreError> {
        if let Some(row) = self.pending_row(entity_type, target_id) {
            return Ok(Some(row.clone()));
        }
        let state = self.state.lock().await;
        Ok(state
            .rows
            .get(&(entity_type.to_string(), target_id))
            .filter(|v| v.version <= self.start_version)
            .map(|v| v.row.clone()))
    }

    async fn find_by_keys(
        &mut self,
        entity_type: &str,
        keys: &FieldMap,
    ) -> Result<Vec<TargetRow>, StoreError> {
        let mut state = self.state.lock().await;
        state.take_fault(StoreOp::FindByKeys)?;
        self.key_reads.push((entity_type.to_string(), keys.clone()));

        let mut found: HashMap<Uuid, TargetRow> = state
            .rows
            .iter()
            .filter(|((e, _), v)| {
                e == entity_type && v.version <= self.start_version && v.row.matches_keys(keys)
            })
            .map(|((_, id), v)| (*id, v.row.clone()))
            .collect();
        drop(state);

        for (entity, row) in &self.writes {
            if entity == entity_type && row.matches_keys(keys) {
                found.insert(row.target_id, row.clone());
            }
        }
        let mut rows = found.into_values().collect::<Vec<_>>();
        rows.sort_by_key(|r| r.target_id);
        Ok(rows)
    }

    async fn reserve_identity(
        &mut self,
        entity_type: &str,
        legacy_id: &str,
        target_id: Uuid,
    ) -> Result<Uuid, StoreError> {
        if let Some(existing) = self.lookup_identity(entity_type, legacy_id).await? {
            return Ok(existing);
        }
        let mut state = self.state.lock().await;
        state.take_fault(StoreOp::Reserve)?;
        drop(state);
        self.reserved
            .push((entity_type.to_string(), legacy_id.to_string(), target_id));
        Ok(target_id)
    }

    async fn upsert(
        &mut self,
        entity_type: &str,
        target_id: Uuid,
        legacy_id: &str,
        fields: &FieldMap,
    ) -> Result<(), StoreError> {
        let existing = self.fetch_row(entity_type, target_id).await?;
        let mut state = self.state.lock().await;
        state.take_fault(StoreOp::Upsert)?;
        drop(state);

        let row = match existing {
            Some(mut row) => {
                row.fields
                    .extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
                if row.legacy_id.is_none() {
                    row.legacy_id = Some(legacy_id.to_string());
                }
                row
            }
            None => TargetRow {
                target_id,
                legacy_id: Some(legacy_id.to_string()),
                fields: fields.clone(),
            },
        };
        self.writes.push((entity_type.to_string(), row));
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.take_fault(StoreOp::Commit)?;
        self.validate(&state)?;

        state.version += 1;
        let version = state.version;
        for (entity, legacy_id, target_id) in &self.reserved {
            state
                .identities
                .entry((entity.clone(), legacy_id.clone()))
                .or_insert((*target_id, version));
        }
        for (entity, row) in &self.writes {
            state.rows.insert(
                (entity.clone(), row.target_id),
                VersionedRow {
                    row: row.clone(),
                    version,
                },
            );
        }
        state.commits += 1;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codes;
    use serde_json::json;

    fn fields(email: &str) -> FieldMap {
        let mut f = FieldMap::new();
        f.insert("email".into(), json!(email));
        f
    }

    #[tokio::test]
    async fn committed_upsert_is_visible_and_merges_on_second_write() {
        let store = MemoryTargetStore::new();
        let id = Uuid::new_v4();

        let mut tx = store.begin().await.unwrap();
        assert_eq!(tx.reserve_identity("customer", "C-1", id).await.unwrap(), id);
        tx.upsert("customer", id, "C-1", &fields("a@x.com")).await.unwrap();
        tx.commit().await.unwrap();

        let mut extra = FieldMap::new();
        extra.insert("name".into(), json!("Ada"));
        let mut tx = store.begin().await.unwrap();
        assert_eq!(
            tx.reserve_identity("customer", "C-1", Uuid::new_v4()).await.unwrap(),
            id
        );
        tx.upsert("customer", id, "C-1", &extra).await.unwrap();
        tx.commit().await.unwrap();

        let rows = store.rows("customer").await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].fields["email"], json!("a@x.com"));
        assert_eq!(rows[0].fields["name"], json!("Ada"));
        assert_eq!(store.identity("customer", "C-1").await, Some(id));
    }

    #[tokio::test]
    async fn concurrent_natural_key_insert_aborts_with_serialization_failure() {
        let store = MemoryTargetStore::new();
        let keys = fields("dup@x.com");

        let mut a = store.begin().await.unwrap();
        let mut b = store.begin().await.unwrap();
        assert!(a.find_by_keys("customer", &keys).await.unwrap().is_empty());
        assert!(b.find_by_keys("customer", &keys).await.unwrap().is_empty());

        let id_a = a.reserve_identity("customer", "C-1", Uuid::new_v4()).await.unwrap();
        a.upsert("customer", id_a, "C-1", &keys).await.unwrap();
        let id_b = b.reserve_identity("customer", "C-2", Uuid::new_v4()).await.unwrap();
        b.upsert("customer", id_b, "C-2", &keys).await.unwrap();

        a.commit().await.unwrap();
        let err = b.commit().await.unwrap_err();
        assert_eq!(err.code(), Some(codes::SERIALIZATION_FAILURE));
        assert_eq!(store.row_count("customer").await, 1);
    }

    #[tokio::test]
    async fn injected_faults_fire_the_requested_number_of_times() {
        let store = MemoryTargetStore::new();
        store
            .inject_fault(StoreOp::Upsert, StoreError::status(codes::DEADLOCK_DETECTED, "deadlock"), 1)
            .await;

        let id = Uuid::new_v4();
        let mut tx = store.begin().await.unwrap();
        let err = tx.upsert("ledger", id, "L-1", &FieldMap::new()).await.unwrap_err();
        assert_eq!(err.code(), Some(codes::DEADLOCK_DETECTED));
        tx.upsert("ledger", id, "L-1", &FieldMap::new()).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(store.commit_count().await, 1);
    }
}
