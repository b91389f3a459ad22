use std::sync::Arc;

use civ_core::SocrataConfig;
use civ_storage::{FetchRequest, Transport};
use serde_json::Value;
use tracing::debug;

use crate::raw::RawRecord;
use crate::AdapterError;

/// `$where` / `$order` parameters for one paginated dataset read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SoqlQuery {
    pub where_clause: String,
    pub order: Option<String>,
}

impl SoqlQuery {
    pub fn new(where_clause: impl Into<String>) -> Self {
        Self {
            where_clause: where_clause.into(),
            ..Self::default()
        }
    }

    pub fn order_desc(mut self, field: &str) -> Self {
        self.order = Some(format!("{field} DESC"));
        self
    }
}

/// Paginated SODA reader shared by every Socrata-backed adapter.
#[derive(Clone)]
pub struct SocrataClient {
    source_id: &'static str,
    transport: Arc<dyn Transport>,
    config: SocrataConfig,
    app_token: Option<String>,
}

impl SocrataClient {
    pub fn new(
        source_id: &'static str,
        transport: Arc<dyn Transport>,
        config: SocrataConfig,
        app_token: Option<String>,
    ) -> Self {
        Self {
            source_id,
            transport,
            config,
            app_token,
        }
    }

    pub fn config(&self) -> &SocrataConfig {
        &self.config
    }

    fn request(&self, dataset_id: &str) -> FetchRequest {
        let request = FetchRequest::new(self.source_id, self.config.dataset_url(dataset_id));
        match &self.app_token {
            Some(token) => request.header("X-App-Token", token.clone()),
            None => request,
        }
    }

    /// Reads pages of `page_size` until a short page or `max_pages`.
    pub async fn fetch_all(
        &self,
        dataset_id: &str,
        query: &SoqlQuery,
    ) -> Result<Vec<RawRecord>, AdapterError> {
        let page_size = self.config.page_size.max(1);
        let mut records = Vec::new();

        for page in 0..self.config.max_pages.max(1) {
            let mut request = self
                .request(dataset_id)
                .query("$where", query.where_clause.clone())
                .query("$limit", page_size.to_string())
                .query("$offset", (page * page_size).to_string());
            if let Some(order) = &query.order {
                request = request.query("$order", order.clone());
            }

            let rows = self.rows(&request).await?;
            let received = rows.len();
            records.extend(rows);
            debug!(source_id = self.source_id, page, received, "socrata page");

            if received < page_size {
                break;
            }
        }

        Ok(records)
    }

    /// Single unpaginated read with equality filters, used for enrichment lookups.
    pub async fn lookup_rows(
        &self,
        dataset_id: &str,
        filters: &[(&str, &str)],
        limit: usize,
    ) -> Result<Vec<RawRecord>, AdapterError> {
        let mut request = self.request(dataset_id);
        for (field, value) in filters {
            request = request.query(*field, *value);
        }
        request = request.query("$limit", limit.to_string());
        self.rows(&request).await
    }

    async fn rows(&self, request: &FetchRequest) -> Result<Vec<RawRecord>, AdapterError> {
        match self.transport.get_json(request).await? {
            Value::Array(items) => Ok(items.into_iter().filter_map(RawRecord::from_value).collect()),
            other => Err(AdapterError::Malformed {
                source_id: self.source_id,
                message: format!("expected a JSON array, got {}", json_kind(&other)),
            }),
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}


#[cfg(test)]
mod tests {
    use super::testing::Scripted;
    use super::*;

    fn rows(n: usize) -> String {
        let items: Vec<_> = (0..n).map(|i| serde_json::json!({ "id": i.to_string() })).collect();
        Value::Array(items).to_string()
    }

    fn client(transport: Arc<Scripted>, page_size: usize, max_pages: usize) -> SocrataClient {
        let config = SocrataConfig {
            page_size,
            max_pages,
            ..SocrataConfig::default()
        };
        SocrataClient::new("test", transport, config, Some("tok".into()))
    }

    #[tokio::test]
    async fn pagination_stops_on_a_short_page() {
        let transport = Arc::new(Scripted::new(vec![Ok(rows(2)), Ok(rows(2)), Ok(rows(1))]));
        let records = client(transport.clone(), 2, 10)
            .fetch_all("abcd-1234", &SoqlQuery::new("x > 1").order_desc("created_date"))
            .await
            .expect("fetch");

        assert_eq!(records.len(), 5);
        let requests = transport.requests();
        assert_eq!(requests.len(), 3);
        let offsets: Vec<_> = requests.iter().map(|r| r.query_value("$offset").unwrap()).collect();
        assert_eq!(offsets, ["0", "2", "4"]);
        assert_eq!(requests[0].query_value("$order"), Some("created_date DESC"));
        assert_eq!(requests[0].headers, vec![("X-App-Token".to_string(), "tok".to_string())]);
    }

    #[tokio::test]
    async fn pagination_is_capped_by_max_pages() {
        let transport = Arc::new(Scripted::with_fallback(vec![], Ok(rows(3))));
        let records = client(transport.clone(), 3, 2)
            .fetch_all("abcd-1234", &SoqlQuery::new("1 = 1"))
            .await
            .expect("fetch");
        assert_eq!(records.len(), 6);
        assert_eq!(transport.requests().len(), 2);
    }

    #[tokio::test]
    async fn non_array_payloads_are_malformed() {
        let transport = Arc::new(Scripted::new(vec![Ok(r#"{"error":"bad query"}"#.into())]));
        let err = client(transport, 10, 1)
            .fetch_all("abcd-1234", &SoqlQuery::new("1 = 1"))
            .await
            .expect_err("malformed");
        assert!(matches!(err, AdapterError::Malformed { .. }));
    }
}
