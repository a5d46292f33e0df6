use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

use crate::audit::error::AuditError;
use crate::audit::task::{AuditTask, TaskId, TaskStatus};
use crate::backend::AuditBackend;

/// Authoritative results of a completed audit
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditResults {
    pub task_id: TaskId,
    pub url: String,
    pub audit_data: Value,
    pub recommendations: Value,
    pub history: Value,
}

impl AuditResults {
    /// Page count reported inside the audit data
    pub fn page_count(&self) -> Option<u64> {
        self.audit_data
            .get("pageCount")
            .or_else(|| self.audit_data.get("page_count"))
            .and_then(Value::as_u64)
    }
}

/// Fetches the full result set once a task completed. Read-only.
pub struct Materializer {
    backend: Arc<dyn AuditBackend>,
}

impl Materializer {
    pub fn new(backend: Arc<dyn AuditBackend>) -> Self {
        Self { backend }
    }

    /// Fetch audit data, recommendations and history together.
    ///
    /// All three must succeed; any single failure fails the whole call.
    pub async fn materialize(&self, task: &AuditTask) -> Result<AuditResults, AuditError> {
        if task.status != TaskStatus::Completed {
            return Err(AuditError::Materialization(format!(
                "Task {} is {}, not completed",
                task.task_id, task.status
            )));
        }

        let (audit_data, recommendations, history) = futures::try_join!(
            self.backend.audit_data(&task.task_id),
            self.backend.recommendations(&task.url),
            self.backend.history(&task.url),
        )
        .map_err(|e| {
            warn!(kind = e.kind(), "Materializing {} failed: {}", task.task_id, e);
            AuditError::Materialization(e.to_string())
        })?;

        info!("Fetched results for {}", task.task_id);

        Ok(AuditResults {
            task_id: task.task_id.clone(),
            url: task.url.clone(),
            audit_data,
            recommendations,
            history,
        })
    }
}
