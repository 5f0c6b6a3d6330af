//! Conflict detectors that find an existing target row for an incoming candidate, and the
//! registry that hands them out per entity type.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use lmig_core::{CandidateRow, FailureStage, FieldMap};
use lmig_storage::TargetTx;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

use crate::outcome::StageError;

pub const DEFAULT_FUZZY_THRESHOLD: f64 = 0.92;

/// An existing target row that a candidate collides with.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictMatch {
    pub target_id: Uuid,
    pub detector: String,
    pub score: f64,
    pub existing_legacy_id: Option<String>,
}

#[async_trait]
pub trait ConflictDetector: Send + Sync {
    fn entity_type(&self) -> &str;

    fn name(&self) -> &str;

    /// Target fields compared against existing rows. May be empty.
    fn match_keys(&self) -> &[String];

    async fn detect(
        &self,
        tx: &mut dyn TargetTx,
        candidate: &CandidateRow,
    ) -> Result<Option<ConflictMatch>, StageError>;
}

fn key_values(candidate: &CandidateRow, keys: &[String]) -> Result<FieldMap, StageError> {
    let mut out = FieldMap::new();
    for key in keys {
        match candidate.fields.get(key) {
            Some(value) if !value.is_null() => {
                out.insert(key.clone(), value.clone());
            }
            _ => {
                return Err(StageError::rejected(
                    FailureStage::Detect,
                    "NATURAL_KEY_MISSING",
                    format!("{} {} has no value for `{key}`", candidate.entity_type, candidate.legacy_id),
                ))
            }
        }
    }
    Ok(out)
}

/// Exact match on every natural-key value.
#[derive(Debug, Clone)]
pub struct NaturalKeyDetector {
    entity_type: String,
    match_keys: Vec<String>,
}

impl NaturalKeyDetector {
    pub fn new(entity_type: &str, match_keys: Vec<String>) -> Self {
        Self {
            entity_type: entity_type.to_string(),
            match_keys,
        }
    }
}

#[async_trait]
impl ConflictDetector for NaturalKeyDetector {
    fn entity_type(&self) -> &str {
        &self.entity_type
    }

    fn name(&self) -> &str {
        "natural_key"
    }

    fn match_keys(&self) -> &[String] {
        &self.match_keys
    }

    async fn detect(
        &self,
        tx: &mut dyn TargetTx,
        candidate: &CandidateRow,
    ) -> Result<Option<ConflictMatch>, StageError> {
        if self.match_keys.is_empty() {
            return Ok(None);
        }
        let keys = key_values(candidate, &self.match_keys)?;
        let rows = tx
            .find_by_keys(&self.entity_type, &keys)
            .await
            .map_err(StageError::store(FailureStage::Detect))?;
        Ok(rows.into_iter().next().map(|row| ConflictMatch {
            target_id: row.target_id,
            detector: self.name().to_string(),
            score: 1.0,
            existing_legacy_id: row.legacy_id,
        }))
    }
}

/// Append-only entity types (ledger lines, audit events) never collide.
#[derive(Debug, Clone)]
pub struct NoConflictDetector {
    entity_type: String,
    match_keys: Vec<String>,
}

impl NoConflictDetector {
    pub fn new(entity_type: &str) -> Self {
        Self {
            entity_type: entity_type.to_string(),
            match_keys: Vec::new(),
        }
    }
}

#[async_trait]
impl ConflictDetector for NoConflictDetector {
    fn entity_type(&self) -> &str {
        &self.entity_type
    }

    fn name(&self) -> &str {
        "none"
    }

    fn match_keys(&self) -> &[String] {
        &self.match_keys
    }

    async fn detect(
        &self,
        _tx: &mut dyn TargetTx,
        _candidate: &CandidateRow,
    ) -> Result<Option<ConflictMatch>, StageError> {
        Ok(None)
    }
}

/// Blocks on one exact key, then scores a name field with Jaro-Winkler.
#[derive(Debug, Clone)]
pub struct FuzzyNameDetector {
    entity_type: String,
    name_field: String,
    threshold: f64,
    match_keys: Vec<String>,
}

impl FuzzyNameDetector {
    pub fn new(entity_type: &str, block_key: &str, name_field: &str, threshold: f64) -> Self {
        Self {
            entity_type: entity_type.to_string(),
            name_field: name_field.to_string(),
            threshold,
            match_keys: vec![block_key.to_string(), name_field.to_string()],
        }
    }

    fn block_key(&self) -> &str {
        &self.match_keys[0]
    }
}

pub fn normalize_name(s: &str) -> String {
    s.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[async_trait]
impl ConflictDetector for FuzzyNameDetector {
    fn entity_type(&self) -> &str {
        &self.entity_type
    }

    fn name(&self) -> &str {
        "fuzzy_name"
    }

    fn match_keys(&self) -> &[String] {
        &self.match_keys
    }

    async fn detect(
        &self,
        tx: &mut dyn TargetTx,
        candidate: &CandidateRow,
    ) -> Result<Option<ConflictMatch>, StageError> {
        let block = key_values(candidate, &self.match_keys[..1])?;
        let Some(name) = candidate.field_str(&self.name_field).map(normalize_name) else {
            return Ok(None);
        };
        let rows = tx
            .find_by_keys(&self.entity_type, &block)
            .await
            .map_err(StageError::store(FailureStage::Detect))?;

        let best = rows
            .into_iter()
            .filter_map(|row| {
                let existing = match row.fields.get(&self.name_field) {
                    Some(JsonValue::String(s)) => normalize_name(s),
                    _ => return None,
                };
                let score = strsim::jaro_winkler(&name, &existing);
                Some((row, score))
            })
            .max_by(|a, b| a.1.total_cmp(&b.1));

        Ok(best
            .filter(|(_, score)| *score >= self.threshold)
            .map(|(row, score)| {
                tracing::debug!(
                    entity_type = %self.entity_type,
                    block_key = self.block_key(),
                    score,
                    "fuzzy name match"
                );
                ConflictMatch {
                    target_id: row.target_id,
                    detector: self.name().to_string(),
                    score,
                    existing_legacy_id: row.legacy_id,
                }
            }))
    }
}

/// Detector selection as written in the entity registry file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DetectorSpec {
    NaturalKey {
        match_keys: Vec<String>,
    },
    None,
    FuzzyName {
        block_key: String,
        name_field: String,
        #[serde(default = "default_threshold")]
        threshold: f64,
    },
}

fn default_threshold() -> f64 {
    DEFAULT_FUZZY_THRESHOLD
}

pub fn detector_from_spec(entity_type: &str, spec: &DetectorSpec) -> Arc<dyn ConflictDetector> {
    match spec {
        DetectorSpec::NaturalKey { match_keys } => {
            Arc::new(NaturalKeyDetector::new(entity_type, match_keys.clone()))
        }
        DetectorSpec::None => Arc::new(NoConflictDetector::new(entity_type)),
        DetectorSpec::FuzzyName {
            block_key,
            name_field,
            threshold,
        } => Arc::new(FuzzyNameDetector::new(
            entity_type,
            block_key,
            name_field,
            *threshold,
        )),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("no conflict detector registered for entity type `{entity_type}`")]
    NoDetector { entity_type: String },
    #[error("detector `{detector}` handles `{reported}` but was registered for `{key}`")]
    IdentityMismatch {
        key: String,
        reported: String,
        detector: String,
    },
    #[error("entity type `{entity_type}` already has a conflict detector")]
    Duplicate { entity_type: String },
}

/// Entity type to detector map, filled at startup and read-only afterwards.
#[derive(Clone, Default)]
pub struct ConflictDetectorRegistry {
    detectors: HashMap<String, Arc<dyn ConflictDetector>>,
}

impl ConflictDetectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        entity_type: &str,
        detector: Arc<dyn ConflictDetector>,
    ) -> Result<(), RegistryError> {
        if detector.entity_type() != entity_type {
            return Err(RegistryError::IdentityMismatch {
                key: entity_type.to_string(),
                reported: detector.entity_type().to_string(),
                detector: detector.name().to_string(),
            });
        }
        if self.detectors.contains_key(entity_type) {
            return Err(RegistryError::Duplicate {
                entity_type: entity_type.to_string(),
            });
        }
        self.detectors.insert(entity_type.to_string(), detector);
        Ok(())
    }

    pub fn get_conflict_detector(
        &self,
        entity_type: &str,
    ) -> Result<Arc<dyn ConflictDetector>, RegistryError> {
        let detector = self
            .detectors
            .get(entity_type)
            .ok_or_else(|| RegistryError::NoDetector {
                entity_type: entity_type.to_string(),
            })?;
        if detector.entity_type() != entity_type {
            return Err(RegistryError::IdentityMismatch {
                key: entity_type.to_string(),
                reported: detector.entity_type().to_string(),
                detector: detector.name().to_string(),
            });
        }
        Ok(Arc::clone(detector))
    }

    pub fn entity_types(&self) -> Vec<String> {
        let mut keys = self.detectors.keys().cloned().collect::<Vec<_>>();
        keys.sort();
        keys
    }
}
