//! Target store access, run-state files and HTTP fetch utilities for LMIG.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use lmig_core::{Cursor, FieldMap, LoadSnapshot};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

mod http;
mod memory;
mod postgres;
mod target;

pub use http::{FetchError, HttpClientConfig, HttpFetcher};
pub use memory::{MemoryTargetStore, StoreOp};
pub use postgres::{PgStoreConfig, PgTargetStore};
pub use target::{
    classify_message, classify_store_code, codes, StoreError, TargetRow, TargetStore, TargetTx,
};

pub const CRATE_NAME: &str = "lmig-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Write `bytes` to `path` through a sibling temp file and rename, so readers never see a torn file.
pub async fn write_atomically(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.sync_all()
        .await
        .with_context(|| format!("syncing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct StoredSnapshot {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

#[derive(Serialize)]
struct SnapshotContent<'a> {
    entity_type: &'a str,
    legacy_id: &'a str,
    target_id: Uuid,
    before: Option<&'a FieldMap>,
    after: &'a FieldMap,
    source: &'a FieldMap,
}

impl<'a> SnapshotContent<'a> {
    fn of(snapshot: &'a LoadSnapshot) -> Self {
        Self {
            entity_type: &snapshot.entity_type,
            legacy_id: &snapshot.legacy_id,
            target_id: snapshot.target_id,
            before: snapshot.before.as_ref(),
            after: &snapshot.after,
            source: &snapshot.source,
        }
    }
}

/// Immutable, content-addressed audit records of every successful load.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn snapshot_relative_path(entity_type: &str, target_id: Uuid, content_hash: &str) -> PathBuf {
        PathBuf::from(entity_type)
            .join(target_id.to_string())
            .join(format!("{content_hash}.json"))
    }

    /// The path is keyed on the row content only, so re-recording the same load from a later
    /// attempt or run keeps the first file.
    pub async fn store_snapshot(&self, snapshot: &LoadSnapshot) -> anyhow::Result<StoredSnapshot> {
        let content = serde_json::to_vec(&SnapshotContent::of(snapshot))
            .context("serializing load snapshot content")?;
        let content_hash = sha256_hex(&content);
        let bytes = serde_json::to_vec_pretty(snapshot).context("serializing load snapshot")?;
        let relative_path =
            Self::snapshot_relative_path(&snapshot.entity_type, snapshot.target_id, &content_hash);
        let absolute_path = self.root.join(&relative_path);

        let exists = fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking snapshot path {}", absolute_path.display()))?;
        if !exists {
            write_atomically(&absolute_path, &bytes).await?;
        }

        Ok(StoredSnapshot {
            content_hash,
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
            deduplicated: exists,
        })
    }

    /// All snapshots recorded for one target row, oldest first.
    pub async fn snapshots_for(
        &self,
        entity_type: &str,
        target_id: Uuid,
    ) -> anyhow::Result<Vec<LoadSnapshot>> {
        let dir = self.root.join(entity_type).join(target_id.to_string());
        if !fs::try_exists(&dir).await.unwrap_or(false) {
            return Ok(Vec::new());
        }
        let mut entries = fs::read_dir(&dir)
            .await
            .with_context(|| format!("reading {}", dir.display()))?;
        let mut out = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let text = fs::read_to_string(&path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            let snapshot: LoadSnapshot = serde_json::from_str(&text)
                .with_context(|| format!("parsing {}", path.display()))?;
            out.push(snapshot);
        }
        out.sort_by_key(|s| s.loaded_at);
        Ok(out)
    }
}

/// Persisted progress of one entity type through its legacy source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorState {
    pub entity_type: String,
    /// Where the next batch starts; `None` once the source is exhausted.
    pub cursor: Option<Cursor>,
    pub exhausted: bool,
    /// Cursor of the last extracted batch, kept so an exhausted source can be re-drained.
    #[serde(default)]
    pub last_position: Option<Cursor>,
    pub updated_at: DateTime<Utc>,
}

impl CursorState {
    pub fn fresh(entity_type: &str) -> Self {
        Self {
            entity_type: entity_type.to_string(),
            cursor: None,
            exhausted: false,
            last_position: None,
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CursorStore {
    root: PathBuf,
}

impl CursorStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, entity_type: &str) -> PathBuf {
        self.root.join(format!("{entity_type}.json"))
    }

    pub async fn load(&self, entity_type: &str) -> anyhow::Result<CursorState> {
        let path = self.path_for(entity_type);
        if !fs::try_exists(&path)
            .await
            .with_context(|| format!("checking cursor file {}", path.display()))?
        {
            return Ok(CursorState::fresh(entity_type));
        }
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// Persist the position after a batch whose outcomes are already durable.
    pub async fn advance(
        &self,
        entity_type: &str,
        batch_cursor: Option<&Cursor>,
        next_cursor: Option<&Cursor>,
    ) -> anyhow::Result<CursorState> {
        let state = CursorState {
            entity_type: entity_type.to_string(),
            cursor: next_cursor.cloned(),
            exhausted: next_cursor.is_none(),
            last_position: batch_cursor.cloned(),
            updated_at: Utc::now(),
        };
        let bytes = serde_json::to_vec_pretty(&state).context("serializing cursor state")?;
        write_atomically(&self.path_for(entity_type), &bytes).await?;
        Ok(state)
    }

    pub async fn reset(&self, entity_type: &str) -> anyhow::Result<()> {
        let path = self.path_for(entity_type);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("removing {}", path.display())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lmig_core::FieldMap;
    use serde_json::json;
    use tempfile::tempdir;

    fn snapshot(target_id: Uuid) -> LoadSnapshot {
        let mut after = FieldMap::new();
        after.insert("email".into(), json!("ada@example.com"));
        LoadSnapshot {
            run_id: Uuid::nil(),
            entity_type: "customer".into(),
            legacy_id: "C-1".into(),
            target_id,
            loaded_at: DateTime::parse_from_rfc3339("2026-02-24T12:00:00Z")
                .expect("ts")
                .with_timezone(&Utc),
            before: None,
            after: after.clone(),
            source: after,
        }
    }

    #[tokio::test]
    async fn identical_snapshots_deduplicate_by_hash_path() {
        let dir = tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path());
        let target_id = Uuid::new_v4();

        let first = store.store_snapshot(&snapshot(target_id)).await.expect("first");
        let second = store.store_snapshot(&snapshot(target_id)).await.expect("second");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.relative_path, second.relative_path);
        assert_eq!(first.content_hash.len(), 64);
        assert!(first
            .relative_path
            .ends_with(format!("{}.json", first.content_hash)));
        assert!(first.absolute_path.exists());

        let listed = store.snapshots_for("customer", target_id).await.expect("list");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].legacy_id, "C-1");
    }

    #[tokio::test]
    async fn reloading_the_same_content_in_a_later_run_keeps_the_first_snapshot() {
        let dir = tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path());
        let target_id = Uuid::new_v4();

        let first = store.store_snapshot(&snapshot(target_id)).await.expect("first");
        let mut later = snapshot(target_id);
        later.run_id = Uuid::new_v4();
        later.loaded_at = Utc::now();
        let second = store.store_snapshot(&later).await.expect("second");
        assert!(second.deduplicated);
        assert_eq!(first.content_hash, second.content_hash);

        let mut changed = snapshot(target_id);
        changed.after.insert("email".into(), json!("ada@example.org"));
        let third = store.store_snapshot(&changed).await.expect("third");
        assert!(!third.deduplicated);

        let listed = store.snapshots_for("customer", target_id).await.expect("list");
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].run_id, Uuid::nil());
    }

    #[tokio::test]
    async fn cursor_store_round_trips_progress_and_reset() {
        let dir = tempdir().expect("tempdir");
        let store = CursorStore::new(dir.path());

        let fresh = store.load("customer").await.expect("fresh");
        assert!(fresh.cursor.is_none());
        assert!(!fresh.exhausted);

        store
            .advance("customer", None, Some(&Cursor::offset(10)))
            .await
            .expect("advance");
        let state = store.load("customer").await.expect("load");
        assert_eq!(state.cursor, Some(Cursor::offset(10)));
        assert!(!state.exhausted);

        store
            .advance("customer", Some(&Cursor::offset(10)), None)
            .await
            .expect("exhaust");
        let state = store.load("customer").await.expect("load");
        assert!(state.exhausted);
        assert_eq!(state.last_position, Some(Cursor::offset(10)));

        store.reset("customer").await.expect("reset");
        store.reset("customer").await.expect("reset twice");
        assert!(!store.load("customer").await.expect("load").exhausted);
    }

    #[test]
    fn backoff_doubles_from_base_delay_and_caps() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(800));

        let capped = BackoffPolicy {
            max_delay: Duration::from_secs(1),
            ..BackoffPolicy::default()
        };
        assert_eq!(capped.delay_for_attempt(3), Duration::from_secs(1));
        assert_eq!(capped.delay_for_attempt(64), Duration::from_secs(1));
    }
}
