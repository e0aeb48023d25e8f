//! PostgREST-style HTTP cloud adapter.
//!
//! Talks to a hosted Postgres REST gateway (`/rest/v1/{table}`), using the
//! API key both as `apikey` header and bearer token.

use async_trait::async_trait;
use reqwest::{header, Client, RequestBuilder, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;
use url::Url;

use hybridsync_common::{CloudError, Error, Record, RecordFilter, Result, TableName};

use crate::cloud::{CloudAdapter, CloudResult};

/// REST path prefix for table endpoints.
const REST_PREFIX: &str = "rest/v1/";

/// Request timeout for a single call.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Cloud adapter over a PostgREST-compatible HTTP API.
pub struct RestCloudAdapter {
    http: Client,
    base_url: Url,
    api_key: String,
}

impl RestCloudAdapter {
    /// Create a new adapter.
    ///
    /// # Errors
    /// - `Config` if the URL does not parse or the HTTP client cannot be built
    pub fn new(base_url: &str, api_key: impl Into<String>) -> Result<Self> {
        let mut base_url =
            Url::parse(base_url).map_err(|e| Error::Config(format!("Invalid cloud URL: {}", e)))?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let http = Client::builder()
            .user_agent("hybridsync/0.1")
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url,
            api_key: api_key.into(),
        })
    }

    fn table_url(&self, table: &TableName) -> CloudResult<Url> {
        self.base_url
            .join(&format!("{}{}", REST_PREFIX, table))
            .map_err(|e| CloudError::Validation(format!("Invalid table URL: {}", e)))
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("apikey", &self.api_key)
            .header(header::AUTHORIZATION, format!("Bearer {}", self.api_key))
    }

    /// Send a request and map the outcome onto a categorized failure.
    async fn execute(&self, request: RequestBuilder) -> CloudResult<()> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| CloudError::Network(format!("Request failed: {}", e)))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let retry_after = response
            .headers()
            .get(header::RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, retry_after.as_deref(), &body))
    }
}

/// Map a non-success HTTP status to a cloud error category.
pub(crate) fn classify_status(
    status: StatusCode,
    retry_after: Option<&str>,
    body: &str,
) -> CloudError {
    let message = format!("{} - {}", status, body);
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => CloudError::Auth(message),
        StatusCode::TOO_MANY_REQUESTS => CloudError::RateLimit {
            message,
            retry_after: retry_after.and_then(parse_retry_after),
        },
        StatusCode::BAD_REQUEST
        | StatusCode::NOT_FOUND
        | StatusCode::CONFLICT
        | StatusCode::UNPROCESSABLE_ENTITY => CloudError::Validation(message),
        _ => CloudError::Network(message),
    }
}

/// Parse a `Retry-After` header given in whole seconds.
fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

/// Render a filter as PostgREST `column=eq.value` query pairs.
pub(crate) fn filter_query(filter: &RecordFilter) -> Vec<(String, String)> {
    filter
        .iter()
        .map(|(column, value)| {
            let rendered = match value {
                Value::String(s) => s.clone(),
                Value::Null => "null".to_string(),
                other => other.to_string(),
            };
            let op = if value.is_null() { "is" } else { "eq" };
            (column.clone(), format!("{}.{}", op, rendered))
        })
        .collect()
}

fn require_filter(filter: &RecordFilter, action: &str) -> CloudResult<()> {
    if filter.is_empty() {
        return Err(CloudError::Validation(format!(
            "{} without filter is not allowed",
            action
        )));
    }
    Ok(())
}

#[async_trait]
impl CloudAdapter for RestCloudAdapter {
    fn name(&self) -> &str {
        "rest"
    }

    async fn upsert(&self, table: &TableName, rows: Vec<Record>) -> CloudResult<()> {
        let url = self.table_url(table)?;
        debug!("POST {} ({} rows)", url, rows.len());
        let request = self
            .http
            .post(url)
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(&rows);
        self.execute(request).await
    }

    async fn update(
        &self,
        table: &TableName,
        changes: Record,
        filter: &RecordFilter,
    ) -> CloudResult<()> {
        require_filter(filter, "update")?;
        let url = self.table_url(table)?;
        debug!("PATCH {} where {}", url, filter);
        let request = self
            .http
            .patch(url)
            .query(&filter_query(filter))
            .header("Prefer", "return=minimal")
            .json(&changes);
        self.execute(request).await
    }

    async fn delete(&self, table: &TableName, filter: &RecordFilter) -> CloudResult<()> {
        require_filter(filter, "delete")?;
        let url = self.table_url(table)?;
        debug!("DELETE {} where {}", url, filter);
        let request = self.http.delete(url).query(&filter_query(filter));
        self.execute(request).await
    }

    async fn ping(&self) -> CloudResult<()> {
        let url = self
            .base_url
            .join(REST_PREFIX)
            .map_err(|e| CloudError::Validation(format!("Invalid URL: {}", e)))?;
        self.execute(self.http.get(url)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, None, ""),
            CloudError::Auth(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN, None, ""),
            CloudError::Auth(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::UNPROCESSABLE_ENTITY, None, "bad"),
            CloudError::Validation(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, None, ""),
            CloudError::Network(_)
        ));
    }

    #[test]
    fn test_rate_limit_retry_after() {
        let err = classify_status(StatusCode::TOO_MANY_REQUESTS, Some("7"), "");
        assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));

        let err = classify_status(
            StatusCode::TOO_MANY_REQUESTS,
            Some("Wed, 21 Oct 2015 07:28:00 GMT"),
            "",
        );
        assert!(matches!(err, CloudError::RateLimit { retry_after: None, .. }));
    }

    #[test]
    fn test_filter_query() {
        let filter = RecordFilter::by_id("c1").eq("shop_id", 4).eq("deleted_at", Value::Null);
        let pairs = filter_query(&filter);

        assert!(pairs.contains(&("id".to_string(), "eq.c1".to_string())));
        assert!(pairs.contains(&("shop_id".to_string(), "eq.4".to_string())));
        assert!(pairs.contains(&("deleted_at".to_string(), "is.null".to_string())));
    }

    #[test]
    fn test_table_url() {
        let adapter = RestCloudAdapter::new("https://example.supabase.co", "key").unwrap();
        let url = adapter
            .table_url(&TableName::new("customers").unwrap())
            .unwrap();
        assert_eq!(url.as_str(), "https://example.supabase.co/rest/v1/customers");

        assert!(RestCloudAdapter::new("not a url", "key").is_err());
    }

    #[tokio::test]
    async fn test_unfiltered_delete_is_rejected_locally() {
        let adapter = RestCloudAdapter::new("http://127.0.0.1:9", "key").unwrap();
        let err = adapter
            .delete(&TableName::new("customers").unwrap(), &RecordFilter::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CloudError::Validation(_)));

        let changes = json!({"name": "Ada"}).as_object().cloned().unwrap();
        let err = adapter
            .update(&TableName::new("customers").unwrap(), changes, &RecordFilter::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CloudError::Validation(_)));
    }
}
