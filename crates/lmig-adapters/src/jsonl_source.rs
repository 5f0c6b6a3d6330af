use std::collections::BTreeSet;
use std::path::PathBuf;

use anyhow::Context;
use async_trait::async_trait;
use lmig_core::{BatchResult, ColumnDef, Cursor, FieldMap, LegacyRecord, LegacySchema};
use serde_json::Value as JsonValue;
use tokio::fs;

use crate::{declared_or_string, next_offset_cursor, offset_of, AdapterError, LegacyAdapter};

/// Newline-delimited JSON export, one object per non-blank line.
#[derive(Debug, Clone)]
pub struct JsonLinesAdapter {
    entity_type: String,
    path: PathBuf,
    id_field: String,
    columns: Vec<ColumnDef>,
}

impl JsonLinesAdapter {
    pub fn new(entity_type: &str, path: impl Into<PathBuf>, id_field: &str) -> Self {
        Self {
            entity_type: entity_type.to_string(),
            path: path.into(),
            id_field: id_field.to_string(),
            columns: Vec::new(),
        }
    }

    pub fn with_columns(mut self, columns: Vec<ColumnDef>) -> Self {
        self.columns = columns;
        self
    }

    /// Non-blank lines; a line that is not UTF-8 stays in place as its decode error.
    async fn lines(&self) -> Result<Vec<Result<String, String>>, AdapterError> {
        let bytes = fs::read(&self.path)
            .await
            .with_context(|| format!("reading legacy export {}", self.path.display()))?;
        Ok(bytes
            .split(|b| *b == b'\n')
            .map(|raw| raw.strip_suffix(b"\r").unwrap_or(raw))
            .filter(|raw| !raw.iter().all(u8::is_ascii_whitespace))
            .map(|raw| {
                std::str::from_utf8(raw)
                    .map(ToString::to_string)
                    .map_err(|e| format!("line is not valid UTF-8: {e}"))
            })
            .collect())
    }

    fn to_record(&self, row_index: u64, line: &Result<String, String>) -> LegacyRecord {
        let synthetic_id = format!("line-{}", row_index + 1);
        let line = match line {
            Ok(line) => line,
            Err(reason) => {
                return LegacyRecord::malformed(synthetic_id, FieldMap::new(), reason.clone())
            }
        };
        let data: FieldMap = match serde_json::from_str::<JsonValue>(line) {
            Ok(JsonValue::Object(map)) => map.into_iter().collect(),
            Ok(_) => {
                return LegacyRecord::malformed(synthetic_id, FieldMap::new(), "line is not a JSON object")
            }
            Err(err) => {
                return LegacyRecord::malformed(synthetic_id, FieldMap::new(), format!("invalid JSON: {err}"))
            }
        };

        let legacy_id = match data.get(&self.id_field) {
            Some(JsonValue::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Some(JsonValue::Number(n)) => Some(n.to_string()),
            _ => None,
        };
        match legacy_id {
            Some(id) => LegacyRecord::new(id, data),
            None => LegacyRecord::malformed(
                synthetic_id,
                data,
                format!("missing value for id field `{}`", self.id_field),
            ),
        }
    }
}

#[async_trait]
impl LegacyAdapter for JsonLinesAdapter {
    fn name(&self) -> &str {
        "jsonl"
    }

    fn entity_types(&self) -> Vec<String> {
        vec![self.entity_type.clone()]
    }

    async fn extract_batch(
        &self,
        entity_type: &str,
        batch_size: usize,
        cursor: Option<&Cursor>,
    ) -> Result<BatchResult, AdapterError> {
        if entity_type != self.entity_type {
            return Err(AdapterError::UnknownEntityType {
                adapter: self.name().to_string(),
                entity_type: entity_type.to_string(),
            });
        }
        let offset = offset_of(self.name(), cursor)?;
        let lines = self.lines().await?;
        let records = lines
            .iter()
            .enumerate()
            .skip(offset as usize)
            .take(batch_size)
            .map(|(idx, line)| self.to_record(idx as u64, line))
            .collect::<Vec<_>>();
        let next_cursor = next_offset_cursor(offset, batch_size, records.len());
        Ok(BatchResult {
            records,
            next_cursor,
        })
    }

    async fn get_schema(&self, entity_type: &str) -> Result<LegacySchema, AdapterError> {
        if entity_type != self.entity_type {
            return Err(AdapterError::UnknownEntityType {
                adapter: self.name().to_string(),
                entity_type: entity_type.to_string(),
            });
        }
        let mut names = BTreeSet::new();
        for line in self.lines().await?.into_iter().flatten() {
            if let Ok(JsonValue::Object(map)) = serde_json::from_str::<JsonValue>(&line) {
                names.extend(map.keys().cloned());
            }
        }
        Ok(LegacySchema {
            table_name: self.entity_type.clone(),
            columns: names
                .iter()
                .map(|name| declared_or_string(name, &self.columns))
                .collect(),
        })
    }

    async fn health_check(&self) -> bool {
        matches!(self.lines().await, Ok(lines) if !lines.is_empty())
    }

    async fn close(&self) -> Result<(), AdapterError> {
        Ok(())
    }
}
