//! Core domain model for LMIG: legacy rows, cursors, schemas and record outcomes.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

pub const CRATE_NAME: &str = "lmig-core";

/// Loosely shaped field map of one legacy row or candidate row.
pub type FieldMap = BTreeMap<String, JsonValue>;

/// Immutable snapshot of one source row at extraction time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegacyRecord {
    pub legacy_id: String,
    pub data: FieldMap,
    /// Set by an adapter for a row it could not fully decode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub malformed: Option<String>,
}

impl LegacyRecord {
    pub fn new(legacy_id: impl Into<String>, data: FieldMap) -> Self {
        Self {
            legacy_id: legacy_id.into(),
            data,
            malformed: None,
        }
    }

    pub fn malformed(legacy_id: impl Into<String>, data: FieldMap, reason: impl Into<String>) -> Self {
        Self {
            legacy_id: legacy_id.into(),
            data,
            malformed: Some(reason.into()),
        }
    }

    pub fn get(&self, field: &str) -> Option<&JsonValue> {
        self.data.get(field).filter(|v| !v.is_null())
    }

    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.get(field).and_then(JsonValue::as_str)
    }

    pub fn get_i64(&self, field: &str) -> Option<i64> {
        match self.get(field)? {
            JsonValue::Number(n) => n.as_i64(),
            JsonValue::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn get_f64(&self, field: &str) -> Option<f64> {
        match self.get(field)? {
            JsonValue::Number(n) => n.as_f64(),
            JsonValue::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn get_bool(&self, field: &str) -> Option<bool> {
        match self.get(field)? {
            JsonValue::Bool(b) => Some(*b),
            JsonValue::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "t" | "yes" | "y" | "1" => Some(true),
                "false" | "f" | "no" | "n" | "0" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }
}

/// Adapter-defined resumption token. `None` at the call sites means the source is exhausted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Cursor {
    Offset { offset: u64 },
    Keyset { column: String, last: String },
    Token { token: String },
}

impl Cursor {
    pub fn offset(offset: u64) -> Self {
        Self::Offset { offset }
    }

    pub fn as_offset(&self) -> Option<u64> {
        match self {
            Self::Offset { offset } => Some(*offset),
            _ => None,
        }
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Offset { offset } => write!(f, "offset:{offset}"),
            Self::Keyset { column, last } => write!(f, "keyset:{column}>{last}"),
            Self::Token { token } => write!(f, "token:{token}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    pub records: Vec<LegacyRecord>,
    pub next_cursor: Option<Cursor>,
}

impl BatchResult {
    pub fn is_last(&self) -> bool {
        self.next_cursor.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnRole {
    NaturalKey,
    #[default]
    Attribute,
    Reference,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
    #[serde(default)]
    pub role: ColumnRole,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>, role: ColumnRole) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            role,
        }
    }
}

/// Shape of a legacy source, used to pick transform steps per field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacySchema {
    pub table_name: String,
    pub columns: Vec<ColumnDef>,
}

impl LegacySchema {
    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }
}

/// Normalized row handed from the transform chain to detection and load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateRow {
    pub entity_type: String,
    pub legacy_id: String,
    pub fields: FieldMap,
}

impl CandidateRow {
    pub fn field_str(&self, field: &str) -> Option<&str> {
        self.fields.get(field).and_then(JsonValue::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Migrated,
    Quarantined,
    Skipped,
}

impl OutcomeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Migrated => "migrated",
            Self::Quarantined => "quarantined",
            Self::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Transient,
    Permanent,
}

impl ErrorClass {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Permanent => "permanent",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    Extract,
    Transform,
    Detect,
    Reserve,
    Load,
    Snapshot,
}

impl FailureStage {
    pub const ALL: [FailureStage; 6] = [
        Self::Extract,
        Self::Transform,
        Self::Detect,
        Self::Reserve,
        Self::Load,
        Self::Snapshot,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Extract => "extract",
            Self::Transform => "transform",
            Self::Detect => "detect",
            Self::Reserve => "reserve",
            Self::Load => "load",
            Self::Snapshot => "snapshot",
        }
    }
}

impl fmt::Display for FailureStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the pipeline does when a detector matches a record from a different legacy row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    /// Leave the existing target row untouched.
    #[default]
    Skip,
    /// Upsert the incoming fields into the matched target row.
    Merge,
    /// Leave the target untouched and flag the pair for manual review.
    Review,
}

impl ConflictResolution {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Skip => "skip",
            Self::Merge => "merge",
            Self::Review => "review",
        }
    }
}

/// Terminal result for one attempted legacy record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordOutcome {
    pub entity_type: String,
    pub legacy_id: String,
    pub status: OutcomeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_class: Option<ErrorClass>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_stage: Option<FailureStage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<ConflictResolution>,
    pub attempts: u32,
}

impl RecordOutcome {
    pub fn migrated(entity_type: &str, legacy_id: &str, target_id: Uuid) -> Self {
        Self {
            entity_type: entity_type.to_string(),
            legacy_id: legacy_id.to_string(),
            status: OutcomeStatus::Migrated,
            error_class: None,
            error_code: None,
            failure_stage: None,
            error_message: None,
            target_id: Some(target_id),
            resolution: None,
            attempts: 1,
        }
    }

    pub fn skipped(
        entity_type: &str,
        legacy_id: &str,
        target_id: Uuid,
        resolution: ConflictResolution,
    ) -> Self {
        Self {
            status: OutcomeStatus::Skipped,
            resolution: Some(resolution),
            ..Self::migrated(entity_type, legacy_id, target_id)
        }
    }

    pub fn quarantined(
        entity_type: &str,
        legacy_id: &str,
        error_class: ErrorClass,
        error_code: String,
        failure_stage: FailureStage,
        error_message: Option<String>,
    ) -> Self {
        Self {
            entity_type: entity_type.to_string(),
            legacy_id: legacy_id.to_string(),
            status: OutcomeStatus::Quarantined,
            error_class: Some(error_class),
            error_code: Some(error_code),
            failure_stage: Some(failure_stage),
            error_message,
            target_id: None,
            resolution: None,
            attempts: 1,
        }
    }

    pub fn with_resolution(mut self, resolution: ConflictResolution) -> Self {
        self.resolution = Some(resolution);
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn is_quarantined(&self) -> bool {
        self.status == OutcomeStatus::Quarantined
    }
}

/// Audit/rollback record written after a successful load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadSnapshot {
    pub run_id: Uuid,
    pub entity_type: String,
    pub legacy_id: String,
    pub target_id: Uuid,
    pub loaded_at: DateTime<Utc>,
    /// Target fields before the load; `None` when the row was created.
    pub before: Option<FieldMap>,
    pub after: FieldMap,
    pub source: FieldMap,
}

/// Stable target identity for a legacy row, so a replayed reservation lands on the same id.
/// The entity type is length-prefixed, so ids containing `:` cannot collide across entities.
pub fn deterministic_target_id(entity_type: &str, legacy_id: &str) -> Uuid {
    let name = format!("lmig:{}:{entity_type}:{legacy_id}", entity_type.len());
    Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes())
}
