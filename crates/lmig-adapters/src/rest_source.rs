use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use lmig_core::{BatchResult, ColumnDef, Cursor, FieldMap, LegacyRecord, LegacySchema};
use lmig_storage::HttpFetcher;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::{declared_or_string, AdapterError, LegacyAdapter};

/// One page of a paged legacy API response.
#[derive(Debug, Clone, Deserialize)]
pub struct RestPage {
    #[serde(default)]
    pub records: Vec<JsonValue>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

impl RestPage {
    pub fn next_cursor(&self) -> Option<Cursor> {
        self.next_page_token
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(|t| Cursor::Token {
                token: t.to_string(),
            })
    }

    /// `page_token` is the token this page was requested with (`None` for the first page); it
    /// keeps the fallback ids of id-less items distinct across pages.
    pub fn into_records(self, id_field: &str, page_token: Option<&str>) -> Vec<LegacyRecord> {
        let page = page_token.unwrap_or("start");
        self.records
            .into_iter()
            .enumerate()
            .map(|(idx, value)| record_from_value(page, idx, value, id_field))
            .collect()
    }
}

fn record_from_value(page: &str, idx: usize, value: JsonValue, id_field: &str) -> LegacyRecord {
    let synthetic_id = format!("page-{page}/item-{}", idx + 1);
    let JsonValue::Object(map) = value else {
        return LegacyRecord::malformed(synthetic_id, FieldMap::new(), "page item is not an object");
    };
    let data: FieldMap = map.into_iter().collect();
    let legacy_id = match data.get(id_field) {
        Some(JsonValue::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Some(JsonValue::Number(n)) => Some(n.to_string()),
        _ => None,
    };
    match legacy_id {
        Some(id) => LegacyRecord::new(id, data),
        None => LegacyRecord::malformed(
            synthetic_id,
            data,
            format!("missing value for id field `{id_field}`"),
        ),
    }
}

#[derive(Debug, Clone)]
struct Endpoint {
    path: String,
    id_field: String,
    columns: Vec<ColumnDef>,
}

/// Remote legacy API paged with opaque provider tokens.
#[derive(Debug, Clone)]
pub struct RestApiAdapter {
    base_url: String,
    health_path: String,
    http: Arc<HttpFetcher>,
    endpoints: BTreeMap<String, Endpoint>,
}

impl RestApiAdapter {
    pub fn new(base_url: &str, http: Arc<HttpFetcher>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            health_path: "/health".to_string(),
            http,
            endpoints: BTreeMap::new(),
        }
    }

    pub fn with_endpoint(
        mut self,
        entity_type: &str,
        path: &str,
        id_field: &str,
        columns: Vec<ColumnDef>,
    ) -> Self {
        self.endpoints.insert(
            entity_type.to_string(),
            Endpoint {
                path: path.to_string(),
                id_field: id_field.to_string(),
                columns,
            },
        );
        self
    }

    pub fn with_health_path(mut self, path: &str) -> Self {
        self.health_path = path.to_string();
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn endpoint(&self, entity_type: &str) -> Result<&Endpoint, AdapterError> {
        self.endpoints
            .get(entity_type)
            .ok_or_else(|| AdapterError::UnknownEntityType {
                adapter: self.name().to_string(),
                entity_type: entity_type.to_string(),
            })
    }

    async fn fetch_page(
        &self,
        endpoint: &Endpoint,
        page_size: usize,
        token: Option<&str>,
    ) -> Result<RestPage, AdapterError> {
        let mut query = vec![("page_size", page_size.to_string())];
        if let Some(token) = token {
            query.push(("page_token", token.to_string()));
        }
        Ok(self.http.get_json(&self.url(&endpoint.path), &query).await?)
    }
}

#[async_trait]
impl LegacyAdapter for RestApiAdapter {
    fn name(&self) -> &str {
        "rest_api"
    }

    fn entity_types(&self) -> Vec<String> {
        self.endpoints.keys().cloned().collect()
    }

    async fn extract_batch(
        &self,
        entity_type: &str,
        batch_size: usize,
        cursor: Option<&Cursor>,
    ) -> Result<BatchResult, AdapterError> {
        let endpoint = self.endpoint(entity_type)?;
        let token = match cursor {
            None => None,
            Some(Cursor::Token { token }) => Some(token.as_str()),
            Some(other) => {
                return Err(AdapterError::UnsupportedCursor {
                    adapter: self.name().to_string(),
                    cursor: other.clone(),
                })
            }
        };

        let page = self.fetch_page(endpoint, batch_size, token).await?;
        let next_cursor = page.next_cursor();
        let records = page.into_records(&endpoint.id_field, token);
        debug!(entity_type, returned = records.len(), "extracted api page");
        Ok(BatchResult {
            records,
            next_cursor,
        })
    }

    async fn get_schema(&self, entity_type: &str) -> Result<LegacySchema, AdapterError> {
        let endpoint = self.endpoint(entity_type)?;
        if !endpoint.columns.is_empty() {
            return Ok(LegacySchema {
                table_name: entity_type.to_string(),
                columns: endpoint.columns.clone(),
            });
        }

        let page = self.fetch_page(endpoint, 1, None).await?;
        let names = page
            .records
            .iter()
            .filter_map(JsonValue::as_object)
            .flat_map(|m| m.keys().cloned())
            .collect::<BTreeSet<_>>();
        Ok(LegacySchema {
            table_name: entity_type.to_string(),
            columns: names
                .iter()
                .map(|name| declared_or_string(name, &endpoint.columns))
                .collect(),
        })
    }

    async fn health_check(&self) -> bool {
        self.http.probe(&self.url(&self.health_path)).await.is_ok()
    }

    async fn close(&self) -> Result<(), AdapterError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn page_token_drives_the_cursor() {
        let page: RestPage = serde_json::from_value(json!({
            "records": [{"id": 5, "name": "x"}, {"name": "no id"}, "oops"],
            "next_page_token": "p2"
        }))
        .unwrap();
        assert_eq!(page.next_cursor(), Some(Cursor::Token { token: "p2".into() }));

        let records = page.into_records("id", None);
        assert_eq!(records[0].legacy_id, "5");
        assert!(records[1].malformed.is_some());
        assert_eq!(records[2].legacy_id, "page-start/item-3");
    }

    #[test]
    fn id_less_items_on_different_pages_get_distinct_ids() {
        let page = || -> RestPage {
            serde_json::from_value(json!({"records": [{"name": "no id"}, "oops"]})).unwrap()
        };
        let first = page().into_records("id", None);
        let second = page().into_records("id", Some("p2"));
        assert_eq!(second[0].legacy_id, "page-p2/item-1");
        for (a, b) in first.iter().zip(&second) {
            assert_ne!(a.legacy_id, b.legacy_id);
        }
    }

    #[test]
    fn blank_or_missing_token_means_exhausted() {
        let last: RestPage = serde_json::from_value(json!({"records": [], "next_page_token": " "})).unwrap();
        assert_eq!(last.next_cursor(), None);
        let last: RestPage = serde_json::from_value(json!({"records": []})).unwrap();
        assert_eq!(last.next_cursor(), None);
    }

    #[tokio::test]
    async fn unknown_entity_is_rejected_before_any_request() {
        let http = Arc::new(HttpFetcher::new(Default::default()).unwrap());
        let adapter = RestApiAdapter::new("http://127.0.0.1:9", http).with_endpoint(
            "invoice",
            "/api/invoices",
            "id",
            Vec::new(),
        );
        let err = adapter.extract_batch("payroll", 10, None).await.unwrap_err();
        assert!(matches!(err, AdapterError::UnknownEntityType { .. }));
        assert_eq!(adapter.entity_types(), vec!["invoice".to_string()]);
    }
}
