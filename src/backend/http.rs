use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, error};
use url::Url;

use crate::audit::task::{AuditOptions, PartialResult, StatusSnapshot, TaskId};
use crate::backend::{AuditBackend, BackendError, CancelResponse, StartResponse};
use crate::cli::config::BackendSettings;

#[derive(Debug, Serialize)]
struct StartRequest<'a> {
    url: &'a str,
    options: &'a AuditOptions,
}

#[derive(Debug, Serialize)]
struct TaskRequest<'a> {
    task_id: &'a TaskId,
}

/// Backend reached through hosted edge functions and the REST table API
pub struct EdgeFunctionBackend {
    client: Client,
    base_url: String,
    api_key: String,
}

impl EdgeFunctionBackend {
    pub fn new(settings: &BackendSettings) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .build()
            .context("Failed to create HTTP client")?;

        Url::parse(&settings.base_url)
            .context(format!("Invalid backend URL: {}", settings.base_url))?;

        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            api_key: settings.api_key.clone(),
        })
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        if self.api_key.is_empty() {
            return request;
        }
        request
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
    }

    fn table_url(&self, table: &str, filters: &[(&str, String)]) -> Result<Url, BackendError> {
        let mut url = Url::parse(&format!("{}/rest/v1/{}", self.base_url, table))
            .map_err(|e| BackendError::Transport(format!("Invalid table URL: {}", e)))?;
        {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in filters {
                pairs.append_pair(key, value);
            }
        }
        Ok(url)
    }

    /// Call an edge function and decode its JSON body
    async fn invoke<B, R>(&self, function: &str, body: &B) -> Result<R, BackendError>
    where
        B: Serialize + Sync,
        R: DeserializeOwned,
    {
        let endpoint = format!("{}/functions/v1/{}", self.base_url, function);
        debug!("Invoking edge function: {}", function);

        let request = self.authorize(self.client.post(&endpoint).json(body));
        let value = Self::read_json(request).await?;

        if value.get("success").and_then(Value::as_bool) == Some(false) {
            let message = error_message(&value).unwrap_or_else(|| format!("{} reported failure", function));
            return Err(BackendError::Rejected(message));
        }
        if let Some(message) = value.get("error").and_then(Value::as_str) {
            return Err(BackendError::Rejected(message.to_string()));
        }

        serde_json::from_value(value).map_err(|e| BackendError::Decode(format!("{}: {}", function, e)))
    }

    /// Read rows from a table
    async fn select(&self, table: &str, filters: &[(&str, String)]) -> Result<Vec<Value>, BackendError> {
        let url = self.table_url(table, filters)?;
        debug!("Reading table: {}", table);

        let request = self.authorize(self.client.get(url));
        let value = Self::read_json(request).await?;

        match value {
            Value::Array(rows) => Ok(rows),
            other => Err(BackendError::Decode(format!(
                "Expected rows from {}, got {}",
                table, other
            ))),
        }
    }

    async fn read_json(request: RequestBuilder) -> Result<Value, BackendError> {
        // Send the request
        let response = request
            .send()
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?;

        // Read the whole body before looking at the status
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?;

        // Server side trouble is transient
        if status.is_server_error() {
            error!("Backend returned {}: {}", status, body);
            return Err(BackendError::Transport(format!("HTTP {}", status)));
        }

        // Parse the body, an empty one reads as null
        let value: Value = if body.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&body).map_err(|e| BackendError::Decode(e.to_string()))?
        };

        // Client errors carry the backend's own message when it sent one
        if status.is_client_error() {
            let message = error_message(&value).unwrap_or_else(|| format!("HTTP {}", status));
            return Err(BackendError::Rejected(message));
        }

        Ok(value)
    }
}

fn error_message(value: &Value) -> Option<String> {
    ["error", "message", "msg"]
        .iter()
        .find_map(|key| value.get(*key).and_then(Value::as_str))
        .map(str::to_string)
}

#[async_trait]
impl AuditBackend for EdgeFunctionBackend {
    async fn start_audit(&self, url: &str, options: &AuditOptions) -> Result<StartResponse, BackendError> {
        self.invoke("audit-start", &StartRequest { url, options }).await
    }

    async fn audit_status(&self, task_id: &TaskId) -> Result<StatusSnapshot, BackendError> {
        self.invoke("audit-status", &TaskRequest { task_id }).await
    }

    async fn cancel_audit(&self, task_id: &TaskId) -> Result<CancelResponse, BackendError> {
        let endpoint = format!("{}/functions/v1/audit-cancel", self.base_url);
        let request = self.authorize(self.client.post(&endpoint).json(&TaskRequest { task_id }));
        let value = Self::read_json(request).await?;

        // A refused cancel is still a well-formed answer here
        serde_json::from_value(value).map_err(|e| BackendError::Decode(format!("audit-cancel: {}", e)))
    }

    async fn partial_results(&self, task_id: &TaskId) -> Result<Option<PartialResult>, BackendError> {
        let rows = self
            .select(
                "audit_results",
                &[
                    ("select", "task_id,audit_data,completion_percentage".to_string()),
                    ("task_id", format!("eq.{}", task_id)),
                    ("is_partial", "eq.true".to_string()),
                    ("order", "updated_at.desc".to_string()),
                    ("limit", "1".to_string()),
                ],
            )
            .await?;

        rows.into_iter()
            .next()
            .map(|row| serde_json::from_value(row).map_err(|e| BackendError::Decode(e.to_string())))
            .transpose()
    }

    async fn audit_data(&self, task_id: &TaskId) -> Result<Value, BackendError> {
        let rows = self
            .select(
                "audit_results",
                &[
                    ("select", "audit_data".to_string()),
                    ("task_id", format!("eq.{}", task_id)),
                    ("is_partial", "eq.false".to_string()),
                    ("limit", "1".to_string()),
                ],
            )
            .await?;

        rows.into_iter()
            .next()
            .and_then(|row| match row {
                Value::Object(mut columns) => columns.remove("audit_data"),
                _ => None,
            })
            .ok_or_else(|| BackendError::Rejected(format!("No audit data for task {}", task_id)))
    }

    async fn recommendations(&self, url: &str) -> Result<Value, BackendError> {
        let rows = self
            .select(
                "audit_recommendations",
                &[("url", format!("eq.{}", url)), ("order", "priority.asc".to_string())],
            )
            .await?;
        Ok(Value::Array(rows))
    }

    async fn history(&self, url: &str) -> Result<Value, BackendError> {
        let rows = self
            .select(
                "audit_history",
                &[("url", format!("eq.{}", url)), ("order", "created_at.desc".to_string())],
            )
            .await?;
        Ok(Value::Array(rows))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::task::{AuditType, TaskStatus};
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn backend(server: &MockServer) -> EdgeFunctionBackend {
        EdgeFunctionBackend::new(&BackendSettings {
            base_url: server.uri(),
            api_key: "anon-key".to_string(),
            request_timeout_secs: 5,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_start_audit_posts_url_and_options() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/functions/v1/audit-start"))
            .and(header("apikey", "anon-key"))
            .and(body_json(json!({
                "url": "https://example.com/",
                "options": { "maxPages": 50, "type": "quick" }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "task_id": "abc123",
                "message": "Audit started"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let options = AuditOptions { max_pages: 50, audit_type: AuditType::Quick };
        let response = backend(&server).start_audit("https://example.com/", &options).await.unwrap();

        assert_eq!(response.task_id, Some(TaskId::new("abc123")));
        assert_eq!(response.message.as_deref(), Some("Audit started"));
    }

    #[tokio::test]
    async fn test_audit_status_decodes_snapshot() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/functions/v1/audit-status"))
            .and(body_json(json!({ "task_id": "abc123" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "task_id": "abc123",
                "url": "https://example.com/",
                "status": "processing",
                "pages_scanned": 5,
                "total_pages": 12,
                "progress": 40,
                "stage": "indexing"
            })))
            .mount(&server)
            .await;

        let snapshot = backend(&server).audit_status(&TaskId::new("abc123")).await.unwrap();
        assert_eq!(snapshot.status, TaskStatus::Processing);
        assert_eq!(snapshot.pages_scanned, 5);
        assert_eq!(snapshot.progress, Some(40));
    }

    #[tokio::test]
    async fn test_audit_status_accepts_loose_numbers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/functions/v1/audit-status"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "task_id": "abc123",
                "url": null,
                "status": "completed",
                "pages_scanned": 12,
                "total_pages": null,
                "progress": 99.6
            })))
            .mount(&server)
            .await;

        let snapshot = backend(&server).audit_status(&TaskId::new("abc123")).await.unwrap();
        assert_eq!(snapshot.status, TaskStatus::Completed);
        assert_eq!(snapshot.total_pages, 0);
        assert_eq!(snapshot.progress, Some(100));
    }

    #[tokio::test]
    async fn test_server_error_is_transport() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/functions/v1/audit-status"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = backend(&server).audit_status(&TaskId::new("abc123")).await.unwrap_err();
        assert!(matches!(err, BackendError::Transport(_)));
        assert_eq!(err.kind(), "transport");
    }

    #[tokio::test]
    async fn test_application_failure_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/functions/v1/audit-start"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": false,
                "error": "URL is not reachable"
            })))
            .mount(&server)
            .await;

        let err = backend(&server)
            .start_audit("https://example.com/", &AuditOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err, BackendError::Rejected("URL is not reachable".to_string()));
    }

    #[tokio::test]
    async fn test_client_error_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/functions/v1/audit-start"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({ "message": "maxPages too large" })))
            .mount(&server)
            .await;

        let err = backend(&server)
            .start_audit("https://example.com/", &AuditOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err, BackendError::Rejected("maxPages too large".to_string()));
    }

    #[tokio::test]
    async fn test_malformed_body_is_decode_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/functions/v1/audit-status"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
            .mount(&server)
            .await;

        let err = backend(&server).audit_status(&TaskId::new("abc123")).await.unwrap_err();
        assert!(matches!(err, BackendError::Decode(_)));
    }

    #[tokio::test]
    async fn test_cancel_returns_refusal_as_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/functions/v1/audit-cancel"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": false,
                "message": "Task already finished"
            })))
            .mount(&server)
            .await;

        let response = backend(&server).cancel_audit(&TaskId::new("abc123")).await.unwrap();
        assert!(!response.success);
        assert_eq!(response.message.as_deref(), Some("Task already finished"));
    }

    #[tokio::test]
    async fn test_partial_results_filters_on_task_and_flag() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/audit_results"))
            .and(query_param("task_id", "eq.abc123"))
            .and(query_param("is_partial", "eq.true"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{
                "task_id": "abc123",
                "audit_data": { "score": 71 },
                "completion_percentage": 60
            }])))
            .mount(&server)
            .await;

        let partial = backend(&server)
            .partial_results(&TaskId::new("abc123"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(partial.completion_percentage, 60);
        assert_eq!(partial.audit_data_fragment.get("score"), Some(&json!(71)));
    }

    #[tokio::test]
    async fn test_partial_results_empty_table() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/audit_results"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;

        let partial = backend(&server).partial_results(&TaskId::new("abc123")).await.unwrap();
        assert!(partial.is_none());
    }

    #[tokio::test]
    async fn test_audit_data_missing_row_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/audit_results"))
            .and(query_param("is_partial", "eq.false"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;

        let err = backend(&server).audit_data(&TaskId::new("abc123")).await.unwrap_err();
        assert!(matches!(err, BackendError::Rejected(_)));
    }

    #[tokio::test]
    async fn test_history_returns_rows() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/audit_history"))
            .and(query_param("url", "eq.https://example.com/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                { "score": 64 },
                { "score": 58 }
            ])))
            .mount(&server)
            .await;

        let history = backend(&server).history("https://example.com/").await.unwrap();
        assert_eq!(history.as_array().map(Vec::len), Some(2));
    }

    #[test]
    fn test_rejects_invalid_base_url() {
        let result = EdgeFunctionBackend::new(&BackendSettings {
            base_url: "not a url".to_string(),
            api_key: String::new(),
            request_timeout_secs: 5,
        });
        assert!(result.is_err());
    }
}
