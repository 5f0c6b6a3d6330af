//! Postgres-backed target store.
//!
//! Migrated rows land in a JSONB staging table keyed by `(entity_type, target_id)`; the
//! legacy-to-target identity map lives beside it. Every transaction runs at SERIALIZABLE so
//! write skew between concurrent record workers surfaces as SQLSTATE 40001.

use std::time::Duration;

use async_trait::async_trait;
use lmig_core::FieldMap;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{Postgres, Row, Transaction};
use tracing::debug;
use uuid::Uuid;

use crate::target::{StoreError, TargetRow, TargetStore, TargetTx};

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) => match db.code() {
                Some(code) => StoreError::status(code.into_owned(), db.message()),
                None => StoreError::Message(db.message().to_string()),
            },
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => StoreError::Connection(err.to_string()),
            _ => StoreError::Message(err.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PgStoreConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    pub statement_timeout: Option<Duration>,
}

impl PgStoreConfig {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            max_connections: 16,
            acquire_timeout: Duration::from_secs(10),
            statement_timeout: Some(Duration::from_secs(30)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PgTargetStore {
    pool: PgPool,
    statement_timeout: Option<Duration>,
}

impl PgTargetStore {
    pub async fn connect(config: &PgStoreConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.database_url)
            .await?;
        Ok(Self {
            pool,
            statement_timeout: config.statement_timeout,
        })
    }

    /// Apply the staging-table migrations shipped with the workspace.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Message(format!("running target migrations: {e}")))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl TargetStore for PgTargetStore {
    async fn begin(&self) -> Result<Box<dyn TargetTx>, StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await?;
        if let Some(timeout) = self.statement_timeout {
            sqlx::query(&format!("SET LOCAL statement_timeout = {}", timeout.as_millis()))
                .execute(&mut *tx)
                .await?;
        }
        Ok(Box::new(PgTargetTx { tx }))
    }

    async fn health_check(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }
}

struct PgTargetTx {
    tx: Transaction<'static, Postgres>,
}

fn row_from_pg(row: &sqlx::postgres::PgRow) -> Result<TargetRow, StoreError> {
    let Json(fields): Json<FieldMap> = row.try_get("data")?;
    Ok(TargetRow {
        target_id: row.try_get("target_id")?,
        legacy_id: row.try_get("legacy_id")?,
        fields,
    })
}

#[async_trait]
impl TargetTx for PgTargetTx {
    async fn lookup_identity(
        &mut self,
        entity_type: &str,
        legacy_id: &str,
    ) -> Result<Option<Uuid>, StoreError> {
        let row = sqlx::query(
            "SELECT target_id FROM lmig_identity WHERE entity_type = $1 AND legacy_id = $2",
        )
        .bind(entity_type)
        .bind(legacy_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        match row {
            Some(row) => Ok(Some(row.try_get("target_id")?)),
            None => Ok(None),
        }
    }

    async fn fetch_row(
        &mut self,
        entity_type: &str,
        target_id: Uuid,
    ) -> Result<Option<TargetRow>, StoreError> {
        let row = sqlx::query(
            "SELECT target_id, legacy_id, data FROM lmig_target_rows \
             WHERE entity_type = $1 AND target_id = $2",
        )
        .bind(entity_type)
        .bind(target_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        row.as_ref().map(row_from_pg).transpose()
    }

    async fn find_by_keys(
        &mut self,
        entity_type: &str,
        keys: &FieldMap,
    ) -> Result<Vec<TargetRow>, StoreError> {
        let rows = sqlx::query(
            "SELECT target_id, legacy_id, data FROM lmig_target_rows \
             WHERE entity_type = $1 AND data @> $2 ORDER BY target_id",
        )
        .bind(entity_type)
        .bind(Json(keys))
        .fetch_all(&mut *self.tx)
        .await?;
        rows.iter().map(row_from_pg).collect()
    }

    async fn reserve_identity(
        &mut self,
        entity_type: &str,
        legacy_id: &str,
        target_id: Uuid,
    ) -> Result<Uuid, StoreError> {
        // The no-op update makes RETURNING yield the already-bound id on conflict.
        let row = sqlx::query(
            "INSERT INTO lmig_identity (entity_type, legacy_id, target_id) VALUES ($1, $2, $3) \
             ON CONFLICT (entity_type, legacy_id) DO UPDATE SET legacy_id = EXCLUDED.legacy_id \
             RETURNING target_id",
        )
        .bind(entity_type)
        .bind(legacy_id)
        .bind(target_id)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(row.try_get("target_id")?)
    }

    async fn upsert(
        &mut self,
        entity_type: &str,
        target_id: Uuid,
        legacy_id: &str,
        fields: &FieldMap,
    ) -> Result<(), StoreError> {
        debug!(entity_type, %target_id, legacy_id, "upserting target row");
        sqlx::query(
            "INSERT INTO lmig_target_rows (entity_type, target_id, legacy_id, data, updated_at) \
             VALUES ($1, $2, $3, $4, now()) \
             ON CONFLICT (entity_type, target_id) DO UPDATE SET \
               data = lmig_target_rows.data || EXCLUDED.data, \
               legacy_id = COALESCE(lmig_target_rows.legacy_id, EXCLUDED.legacy_id), \
               updated_at = now()",
        )
        .bind(entity_type)
        .bind(target_id)
        .bind(legacy_id)
        .bind(Json(fields))
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}
