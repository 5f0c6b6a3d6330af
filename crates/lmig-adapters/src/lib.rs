//! Legacy source adapter contract + file and remote-API adapter implementations.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use lmig_core::{BatchResult, ColumnDef, ColumnRole, Cursor, LegacySchema};
use lmig_storage::{FetchError, HttpFetcher, RetryDisposition};
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod csv_source;
mod jsonl_source;
mod rest_source;

pub use csv_source::CsvAdapter;
pub use jsonl_source::JsonLinesAdapter;
pub use rest_source::{RestApiAdapter, RestPage};

pub const CRATE_NAME: &str = "lmig-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("adapter `{adapter}` is not configured for entity type `{entity_type}`")]
    UnknownEntityType { adapter: String, entity_type: String },
    #[error("adapter `{adapter}` cannot resume from cursor {cursor}")]
    UnsupportedCursor { adapter: String, cursor: Cursor },
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl AdapterError {
    /// Wiring mistakes that must stop the run instead of being retried.
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            Self::UnknownEntityType { .. } | Self::UnsupportedCursor { .. }
        )
    }

    pub fn disposition(&self) -> RetryDisposition {
        match self {
            Self::Fetch(err) => err.disposition(),
            Self::Anyhow(err) => lmig_storage::classify_message(&format!("{err:#}")),
            _ => RetryDisposition::NonRetryable,
        }
    }
}

/// Uniform extraction interface over any legacy source.
///
/// A `None` cursor passed to `extract_batch` means "start from the beginning"; a `None`
/// `next_cursor` in the result means the source is exhausted for that entity type.
#[async_trait]
pub trait LegacyAdapter: Send + Sync {
    fn name(&self) -> &str;

    fn entity_types(&self) -> Vec<String>;

    async fn extract_batch(
        &self,
        entity_type: &str,
        batch_size: usize,
        cursor: Option<&Cursor>,
    ) -> Result<BatchResult, AdapterError>;

    async fn get_schema(&self, entity_type: &str) -> Result<LegacySchema, AdapterError>;

    async fn health_check(&self) -> bool;

    async fn close(&self) -> Result<(), AdapterError>;
}

/// How one entity type's legacy source is reached, as written in `migration.yaml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceSpec {
    Csv {
        path: PathBuf,
        id_column: String,
        #[serde(default)]
        delimiter: Option<char>,
    },
    Jsonl {
        path: PathBuf,
        id_field: String,
    },
    RestApi {
        base_url: String,
        endpoint: String,
        id_field: String,
        #[serde(default = "default_health_path")]
        health_path: String,
    },
}

fn default_health_path() -> String {
    "/health".to_string()
}

impl SourceSpec {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Csv { .. } => "csv",
            Self::Jsonl { .. } => "jsonl",
            Self::RestApi { .. } => "rest_api",
        }
    }
}

/// Build the adapter serving `entity_type` from its configured source.
pub fn adapter_for_source(
    entity_type: &str,
    spec: &SourceSpec,
    columns: &[ColumnDef],
    workspace_root: &Path,
    http: Option<Arc<HttpFetcher>>,
) -> Result<Arc<dyn LegacyAdapter>, AdapterError> {
    let resolve = |p: &Path| {
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            workspace_root.join(p)
        }
    };

    match spec {
        SourceSpec::Csv {
            path,
            id_column,
            delimiter,
        } => {
            let delimiter = match delimiter {
                Some(c) if c.is_ascii() => *c as u8,
                Some(c) => {
                    return Err(AdapterError::Message(format!(
                        "csv delimiter {c:?} for {entity_type} must be a single ASCII character"
                    )))
                }
                None => b',',
            };
            Ok(Arc::new(
                CsvAdapter::new(entity_type, resolve(path), id_column)
                    .with_columns(columns.to_vec())
                    .with_delimiter(delimiter),
            ))
        }
        SourceSpec::Jsonl { path, id_field } => Ok(Arc::new(
            JsonLinesAdapter::new(entity_type, resolve(path), id_field)
                .with_columns(columns.to_vec()),
        )),
        SourceSpec::RestApi {
            base_url,
            endpoint,
            id_field,
            health_path,
        } => {
            let http = http.ok_or_else(|| {
                AdapterError::Message(format!(
                    "rest_api source for {entity_type} needs an HTTP fetcher"
                ))
            })?;
            Ok(Arc::new(
                RestApiAdapter::new(base_url, http)
                    .with_endpoint(entity_type, endpoint, id_field, columns.to_vec())
                    .with_health_path(health_path),
            ))
        }
    }
}

/// Schema column for `name`, preferring what configuration declares.
pub(crate) fn declared_or_string(name: &str, declared: &[ColumnDef]) -> ColumnDef {
    declared
        .iter()
        .find(|c| c.name == name)
        .cloned()
        .unwrap_or_else(|| ColumnDef::new(name, "string", ColumnRole::Attribute))
}

pub(crate) fn offset_of(adapter: &str, cursor: Option<&Cursor>) -> Result<u64, AdapterError> {
    match cursor {
        None => Ok(0),
        Some(Cursor::Offset { offset }) => Ok(*offset),
        Some(other) => Err(AdapterError::UnsupportedCursor {
            adapter: adapter.to_string(),
            cursor: other.clone(),
        }),
    }
}

/// Offset paging rule shared by the file adapters: a short or empty page means the source is
/// exhausted.
pub(crate) fn next_offset_cursor(offset: u64, batch_size: usize, returned: usize) -> Option<Cursor> {
    if returned == 0 || returned < batch_size {
        None
    } else {
        Some(Cursor::offset(offset + batch_size as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_page_never_yields_another_cursor() {
        assert_eq!(next_offset_cursor(5, 0, 0), None);
        assert_eq!(next_offset_cursor(5, 3, 0), None);
        assert_eq!(next_offset_cursor(5, 3, 2), None);
        assert_eq!(next_offset_cursor(5, 3, 3), Some(Cursor::offset(8)));
    }

    #[test]
    fn source_specs_parse_from_tagged_yaml_shapes() {
        let spec: SourceSpec = serde_json::from_value(serde_json::json!({
            "kind": "csv",
            "path": "legacy/customers.csv",
            "id_column": "CUST_NO"
        }))
        .unwrap();
        assert_eq!(spec.kind(), "csv");

        let spec: SourceSpec = serde_json::from_value(serde_json::json!({
            "kind": "rest_api",
            "base_url": "http://legacy.local",
            "endpoint": "/api/invoices",
            "id_field": "id"
        }))
        .unwrap();
        match spec {
            SourceSpec::RestApi { health_path, .. } => assert_eq!(health_path, "/health"),
            other => panic!("unexpected spec {other:?}"),
        }
    }

    #[test]
    fn short_page_ends_the_offset_sequence() {
        assert_eq!(next_offset_cursor(0, 10, 10), Some(Cursor::offset(10)));
        assert_eq!(next_offset_cursor(20, 10, 5), None);
        assert_eq!(next_offset_cursor(30, 10, 0), None);
    }

    #[test]
    fn rest_source_without_fetcher_is_a_configuration_failure() {
        let spec = SourceSpec::RestApi {
            base_url: "http://legacy.local".into(),
            endpoint: "/api/x".into(),
            id_field: "id".into(),
            health_path: "/health".into(),
        };
        let err = adapter_for_source("invoice", &spec, &[], Path::new("."), None)
            .err()
            .expect("missing fetcher must fail");
        assert!(err.to_string().contains("HTTP fetcher"));
    }

    #[test]
    fn foreign_cursor_kinds_are_rejected_by_offset_adapters() {
        let err = offset_of("csv", Some(&Cursor::Token { token: "abc".into() })).unwrap_err();
        assert!(err.is_configuration_error());
    }
}
