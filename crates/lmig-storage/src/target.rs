use async_trait::async_trait;
use lmig_core::FieldMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::RetryDisposition;

/// Store status codes (SQLSTATE) the migration pipeline cares about.
pub mod codes {
    pub const SERIALIZATION_FAILURE: &str = "40001";
    pub const DEADLOCK_DETECTED: &str = "40P01";
    pub const QUERY_CANCELED: &str = "57014";
    pub const LOCK_NOT_AVAILABLE: &str = "55P03";
    pub const CONNECTION_EXCEPTION: &str = "08000";
    pub const UNABLE_TO_CONNECT: &str = "08001";
    pub const CONNECTION_DOES_NOT_EXIST: &str = "08003";
    pub const CONNECTION_REJECTED: &str = "08004";
    pub const CONNECTION_FAILURE: &str = "08006";
    pub const UNIQUE_VIOLATION: &str = "23505";
    pub const NOT_NULL_VIOLATION: &str = "23502";
    pub const CHECK_VIOLATION: &str = "23514";
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("store status {code}: {message}")]
    Status { code: String, message: String },
    #[error("connection lost: {0}")]
    Connection(String),
    #[error("{0}")]
    Message(String),
}

impl StoreError {
    pub fn status(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Status {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn serialization_failure(message: impl Into<String>) -> Self {
        Self::status(codes::SERIALIZATION_FAILURE, message)
    }

    /// Provider status code, if the failure carried one.
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Status { code, .. } => Some(code),
            Self::Connection(_) => Some(codes::CONNECTION_FAILURE),
            Self::Message(_) => None,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Status { message, .. } => message,
            Self::Connection(message) | Self::Message(message) => message,
        }
    }

    pub fn disposition(&self) -> RetryDisposition {
        if let Some(code) = self.code() {
            if classify_store_code(code) == RetryDisposition::Retryable {
                return RetryDisposition::Retryable;
            }
        }
        classify_message(self.message())
    }
}

/// Serialization failures, deadlocks, statement timeouts, lock waits and connection loss retry.
pub fn classify_store_code(code: &str) -> RetryDisposition {
    match code {
        codes::SERIALIZATION_FAILURE
        | codes::DEADLOCK_DETECTED
        | codes::QUERY_CANCELED
        | codes::LOCK_NOT_AVAILABLE => RetryDisposition::Retryable,
        c if c.starts_with("08") => RetryDisposition::Retryable,
        _ => RetryDisposition::NonRetryable,
    }
}

const TRANSIENT_MESSAGE_PATTERNS: &[&str] = &[
    "timeout",
    "timed out",
    "connection reset",
    "connection refused",
    "connection closed",
    "broken pipe",
    "econnreset",
    "etimedout",
    "could not serialize access",
    "deadlock detected",
];

pub fn classify_message(message: &str) -> RetryDisposition {
    let lower = message.to_ascii_lowercase();
    if TRANSIENT_MESSAGE_PATTERNS.iter().any(|p| lower.contains(p)) {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// One row of the target store as seen by conflict detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetRow {
    pub target_id: Uuid,
    pub legacy_id: Option<String>,
    pub fields: FieldMap,
}

impl TargetRow {
    pub fn matches_keys(&self, keys: &FieldMap) -> bool {
        keys.iter()
            .all(|(name, value)| self.fields.get(name) == Some(value))
    }
}

/// A serializable transaction against the target store.
#[async_trait]
pub trait TargetTx: Send {
    /// Target id previously reserved for this legacy row, if any.
    async fn lookup_identity(
        &mut self,
        entity_type: &str,
        legacy_id: &str,
    ) -> Result<Option<Uuid>, StoreError>;

    async fn fetch_row(
        &mut self,
        entity_type: &str,
        target_id: Uuid,
    ) -> Result<Option<TargetRow>, StoreError>;

    /// Rows whose fields contain every `(name, value)` pair in `keys`.
    async fn find_by_keys(
        &mut self,
        entity_type: &str,
        keys: &FieldMap,
    ) -> Result<Vec<TargetRow>, StoreError>;

    /// Bind `legacy_id` to `target_id`; returns the id already bound if one exists.
    async fn reserve_identity(
        &mut self,
        entity_type: &str,
        legacy_id: &str,
        target_id: Uuid,
    ) -> Result<Uuid, StoreError>;

    /// Insert the row or merge `fields` over the existing one.
    async fn upsert(
        &mut self,
        entity_type: &str,
        target_id: Uuid,
        legacy_id: &str,
        fields: &FieldMap,
    ) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

#[async_trait]
pub trait TargetStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn TargetTx>, StoreError>;

    async fn health_check(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn store_codes_split_transient_from_permanent() {
        for code in ["40001", "40P01", "57014", "55P03", "08006", "08003"] {
            assert_eq!(classify_store_code(code), RetryDisposition::Retryable, "{code}");
        }
        for code in ["23505", "23502", "42P01", "P0001"] {
            assert_eq!(classify_store_code(code), RetryDisposition::NonRetryable, "{code}");
        }
    }

    #[test]
    fn message_patterns_catch_uncoded_timeouts() {
        assert_eq!(
            StoreError::Message("statement Timed Out after 30s".into()).disposition(),
            RetryDisposition::Retryable
        );
        assert_eq!(
            StoreError::Message("read: connection reset by peer".into()).disposition(),
            RetryDisposition::Retryable
        );
        assert_eq!(
            StoreError::Message("value too long for column".into()).disposition(),
            RetryDisposition::NonRetryable
        );
        assert_eq!(
            StoreError::Connection("pool closed".into()).code(),
            Some(codes::CONNECTION_FAILURE)
        );
    }

    #[test]
    fn target_row_key_matching_requires_every_key() {
        let mut fields = FieldMap::new();
        fields.insert("email".into(), json!("a@x.com"));
        fields.insert("country".into(), json!("NL"));
        let row = TargetRow {
            target_id: Uuid::nil(),
            legacy_id: None,
            fields,
        };

        let mut keys = FieldMap::new();
        keys.insert("email".into(), json!("a@x.com"));
        assert!(row.matches_keys(&keys));
        keys.insert("country".into(), json!("DE"));
        assert!(!row.matches_keys(&keys));
    }
}
