pub mod http;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::audit::task::{AuditOptions, PartialResult, StatusSnapshot, TaskId};

// Re-export common types
pub use http::EdgeFunctionBackend;

/// Failure of a single backend call.
///
/// Transport and application failures are kept apart so they can be logged
/// differently, even though the lifecycle policy treats them the same way.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// Connection failure, timeout or 5xx response
    #[error("transport error: {0}")]
    Transport(String),

    /// The backend answered but refused the request (4xx or `success: false`)
    #[error("rejected by backend: {0}")]
    Rejected(String),

    /// The response body did not match the expected shape
    #[error("malformed response: {0}")]
    Decode(String),
}

impl BackendError {
    /// Short label used in log fields
    pub fn kind(&self) -> &'static str {
        match self {
            BackendError::Transport(_) => "transport",
            BackendError::Rejected(_) => "rejected",
            BackendError::Decode(_) => "decode",
        }
    }
}

/// Body returned by `audit-start`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StartResponse {
    #[serde(default)]
    pub task_id: Option<TaskId>,

    #[serde(default)]
    pub message: Option<String>,
}

/// Body returned by `audit-cancel`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelResponse {
    pub success: bool,

    #[serde(default)]
    pub message: Option<String>,
}

/// The hosted service that runs audits
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AuditBackend: Send + Sync {
    /// `POST audit-start`
    async fn start_audit(&self, url: &str, options: &AuditOptions) -> Result<StartResponse, BackendError>;

    /// `POST audit-status`
    async fn audit_status(&self, task_id: &TaskId) -> Result<StatusSnapshot, BackendError>;

    /// `POST audit-cancel`
    async fn cancel_audit(&self, task_id: &TaskId) -> Result<CancelResponse, BackendError>;

    /// Latest partial result for a task, if any was published yet
    async fn partial_results(&self, task_id: &TaskId) -> Result<Option<PartialResult>, BackendError>;

    /// Final (non-partial) audit data of a task
    async fn audit_data(&self, task_id: &TaskId) -> Result<Value, BackendError>;

    /// Recommendations for a URL
    async fn recommendations(&self, url: &str) -> Result<Value, BackendError>;

    /// Audit history for a URL
    async fn history(&self, url: &str) -> Result<Value, BackendError>;
}
