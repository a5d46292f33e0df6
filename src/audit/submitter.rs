use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{info, warn};

use crate::audit::error::AuditError;
use crate::audit::task::{normalize_url, AuditOptions, TaskId};
use crate::backend::AuditBackend;

/// A task the backend accepted
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub task_id: TaskId,
    pub url: String,
    pub options: AuditOptions,
    pub message: String,
    pub submitted_at: DateTime<Utc>,
}

/// Issues `audit-start` requests. Does not start polling.
pub struct Submitter {
    backend: Arc<dyn AuditBackend>,
}

impl Submitter {
    pub fn new(backend: Arc<dyn AuditBackend>) -> Self {
        Self { backend }
    }

    /// Submit an audit for `url`
    pub async fn start_audit(&self, url: &str, options: &AuditOptions) -> Result<Submission, AuditError> {
        let url = normalize_url(url)?;
        if options.max_pages == 0 {
            return Err(AuditError::Submission("maxPages must be at least 1".to_string()));
        }

        let response = self.backend.start_audit(&url, options).await.map_err(|e| {
            warn!(kind = e.kind(), "Audit submission for {} failed: {}", url, e);
            AuditError::Submission(e.to_string())
        })?;

        let task_id = match response.task_id {
            Some(task_id) if !task_id.as_str().is_empty() => task_id,
            _ => {
                warn!("Backend accepted {} without returning a task id", url);
                return Err(AuditError::Submission(
                    response
                        .message
                        .unwrap_or_else(|| "The backend did not return a task id".to_string()),
                ));
            }
        };

        info!("Audit task {} created for {} ({})", task_id, url, options.audit_type);

        Ok(Submission {
            task_id,
            url,
            options: options.clone(),
            message: response.message.unwrap_or_else(|| "Audit started".to_string()),
            submitted_at: Utc::now(),
        })
    }
}
