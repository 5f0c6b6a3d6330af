use std::path::PathBuf;

use anyhow::Context;
use async_trait::async_trait;
use lmig_core::{BatchResult, ColumnDef, Cursor, FieldMap, LegacyRecord, LegacySchema};
use serde_json::Value as JsonValue;
use tokio::fs;
use tracing::debug;

use crate::{declared_or_string, next_offset_cursor, offset_of, AdapterError, LegacyAdapter};

/// Reference adapter over a flat-file export with a header row.
#[derive(Debug, Clone)]
pub struct CsvAdapter {
    entity_type: String,
    path: PathBuf,
    id_column: String,
    columns: Vec<ColumnDef>,
    delimiter: u8,
}

impl CsvAdapter {
    pub fn new(entity_type: &str, path: impl Into<PathBuf>, id_column: &str) -> Self {
        Self {
            entity_type: entity_type.to_string(),
            path: path.into(),
            id_column: id_column.to_string(),
            columns: Vec::new(),
            delimiter: b',',
        }
    }

    pub fn with_columns(mut self, columns: Vec<ColumnDef>) -> Self {
        self.columns = columns;
        self
    }

    pub fn with_delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }

    fn ensure_entity(&self, entity_type: &str) -> Result<(), AdapterError> {
        if entity_type != self.entity_type {
            return Err(AdapterError::UnknownEntityType {
                adapter: self.name().to_string(),
                entity_type: entity_type.to_string(),
            });
        }
        Ok(())
    }

    async fn read_source(&self) -> Result<Vec<u8>, AdapterError> {
        let bytes = fs::read(&self.path)
            .await
            .with_context(|| format!("reading legacy csv {}", self.path.display()))?;
        Ok(bytes)
    }

    fn reader<'a>(&self, bytes: &'a [u8]) -> csv::Reader<&'a [u8]> {
        csv::ReaderBuilder::new()
            .delimiter(self.delimiter)
            .flexible(true)
            .from_reader(bytes)
    }

    fn to_record(&self, headers: &csv::StringRecord, row_index: u64, row: &csv::StringRecord) -> LegacyRecord {
        let mut data = FieldMap::new();
        for (name, value) in headers.iter().zip(row.iter()) {
            let value = if value.is_empty() {
                JsonValue::Null
            } else {
                JsonValue::String(value.to_string())
            };
            data.insert(name.to_string(), value);
        }

        let legacy_id = data
            .get(&self.id_column)
            .and_then(JsonValue::as_str)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        let synthetic_id = format!("row-{}", row_index + 1);

        match legacy_id {
            None => LegacyRecord::malformed(
                synthetic_id,
                data,
                format!("missing value for id column `{}`", self.id_column),
            ),
            Some(id) if row.len() != headers.len() => LegacyRecord::malformed(
                id,
                data,
                format!("expected {} fields, found {}", headers.len(), row.len()),
            ),
            Some(id) => LegacyRecord::new(id, data),
        }
    }
}

#[async_trait]
impl LegacyAdapter for CsvAdapter {
    fn name(&self) -> &str {
        "csv"
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
        self.ensure_entity(entity_type)?;
        let offset = offset_of(self.name(), cursor)?;
        let bytes = self.read_source().await?;
        let mut reader = self.reader(&bytes);
        let headers = reader
            .headers()
            .with_context(|| format!("reading csv header of {}", self.path.display()))?
            .clone();

        let mut records = Vec::with_capacity(batch_size);
        for (idx, row) in reader
            .records()
            .enumerate()
            .skip(offset as usize)
            .take(batch_size)
        {
            let row_index = idx as u64;
            let record = match row {
                Ok(row) => self.to_record(&headers, row_index, &row),
                Err(err) => LegacyRecord::malformed(
                    format!("row-{}", row_index + 1),
                    FieldMap::new(),
                    format!("undecodable csv row: {err}"),
                ),
            };
            records.push(record);
        }

        let next_cursor = next_offset_cursor(offset, batch_size, records.len());
        debug!(
            entity_type,
            offset,
            returned = records.len(),
            exhausted = next_cursor.is_none(),
            "extracted csv batch"
        );
        Ok(BatchResult {
            records,
            next_cursor,
        })
    }

    async fn get_schema(&self, entity_type: &str) -> Result<LegacySchema, AdapterError> {
        self.ensure_entity(entity_type)?;
        let bytes = self.read_source().await?;
        let table_name = self
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| self.entity_type.clone());
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(LegacySchema {
                table_name,
                columns: Vec::new(),
            });
        }

        let mut reader = self.reader(&bytes);
        let headers = reader
            .headers()
            .with_context(|| format!("reading csv header of {}", self.path.display()))?;
        Ok(LegacySchema {
            table_name,
            columns: headers
                .iter()
                .map(|name| declared_or_string(name, &self.columns))
                .collect(),
        })
    }

    async fn health_check(&self) -> bool {
        let Ok(bytes) = fs::read(&self.path).await else {
            return false;
        };
        let mut reader = self.reader(&bytes);
        let has_row = reader.records().next().is_some();
        has_row
    }

    async fn close(&self) -> Result<(), AdapterError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lmig_core::ColumnRole;
    use tempfile::tempdir;

    fn write_csv(dir: &std::path::Path, body: &str) -> PathBuf {
        let path = dir.join("customers.csv");
        std::fs::write(&path, body).expect("write csv");
        path
    }

    #[tokio::test]
    async fn rows_become_records_keyed_by_id_column() {
        let dir = tempdir().expect("tempdir");
        let path = write_csv(dir.path(), "CUST_NO,EMAIL,PHONE\n7,Ada@Example.com,\n8,bob@x.org,555\n");
        let adapter = CsvAdapter::new("customer", path, "CUST_NO");

        let batch = adapter.extract_batch("customer", 10, None).await.unwrap();
        assert!(batch.is_last());
        assert_eq!(batch.records.len(), 2);
        assert_eq!(batch.records[0].legacy_id, "7");
        assert_eq!(batch.records[0].get_str("EMAIL"), Some("Ada@Example.com"));
        assert_eq!(batch.records[0].data["PHONE"], JsonValue::Null);
        assert!(batch.records[1].malformed.is_none());
    }

    #[tokio::test]
    async fn short_or_idless_rows_are_flagged_not_dropped() {
        let dir = tempdir().expect("tempdir");
        let path = write_csv(dir.path(), "ID,NAME\n1,ok\n,no id\n3\n");
        let adapter = CsvAdapter::new("customer", path, "ID");

        let batch = adapter.extract_batch("customer", 10, None).await.unwrap();
        assert_eq!(batch.records.len(), 3);
        assert!(batch.records[0].malformed.is_none());
        assert_eq!(batch.records[1].legacy_id, "row-2");
        assert!(batch.records[1].malformed.is_some());
        assert_eq!(batch.records[2].legacy_id, "3");
        assert!(batch.records[2]
            .malformed
            .as_deref()
            .unwrap()
            .contains("expected 2 fields"));
    }

    #[tokio::test]
    async fn unconfigured_entity_type_fails_loudly() {
        let dir = tempdir().expect("tempdir");
        let path = write_csv(dir.path(), "ID\n1\n");
        let adapter = CsvAdapter::new("customer", path, "ID");

        let err = adapter.extract_batch("invoice", 10, None).await.unwrap_err();
        assert!(matches!(err, AdapterError::UnknownEntityType { .. }));
        assert!(err.to_string().contains("invoice"));
        assert!(adapter.get_schema("invoice").await.is_err());
    }

    #[tokio::test]
    async fn empty_source_has_no_columns_and_fails_health() {
        let dir = tempdir().expect("tempdir");
        let path = write_csv(dir.path(), "");
        let adapter = CsvAdapter::new("customer", path, "ID");

        let schema = adapter.get_schema("customer").await.unwrap();
        assert!(schema.columns.is_empty());
        assert!(!adapter.health_check().await);

        let batch = adapter.extract_batch("customer", 10, None).await.unwrap();
        assert!(batch.records.is_empty());
        assert!(batch.is_last());
    }

    #[tokio::test]
    async fn schema_applies_declared_types_and_defaults_the_rest() {
        let dir = tempdir().expect("tempdir");
        let path = write_csv(dir.path(), "ID,EMAIL,NOTE\n1,a@b.c,hi\n");
        let adapter = CsvAdapter::new("customer", path, "ID").with_columns(vec![ColumnDef::new(
            "EMAIL",
            "email",
            ColumnRole::NaturalKey,
        )]);

        let schema = adapter.get_schema("customer").await.unwrap();
        assert_eq!(schema.table_name, "customers");
        assert_eq!(schema.column("EMAIL").unwrap().data_type, "email");
        assert_eq!(schema.column("EMAIL").unwrap().role, ColumnRole::NaturalKey);
        assert_eq!(schema.column("NOTE").unwrap().data_type, "string");
        assert!(adapter.health_check().await);
    }

    #[tokio::test]
    async fn semicolon_exports_parse_with_configured_delimiter() {
        let dir = tempdir().expect("tempdir");
        let path = write_csv(dir.path(), "ID;CITY\n1;Delft\n");
        let adapter = CsvAdapter::new("customer", path, "ID").with_delimiter(b';');

        let batch = adapter.extract_batch("customer", 5, None).await.unwrap();
        assert_eq!(batch.records[0].get_str("CITY"), Some("Delft"));
    }
}
