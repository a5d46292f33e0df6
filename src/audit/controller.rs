use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::audit::error::AuditError;
use crate::audit::governor::RetryGuard;
use crate::audit::materializer::{AuditResults, Materializer};
use crate::audit::session::{SessionEvent, SessionOutcome, SessionRegistry, SessionSettings, SessionWatch};
use crate::audit::submitter::{Submission, Submitter};
use crate::audit::task::{AuditOptions, AuditTask, TaskId, TaskStatus};
use crate::backend::{AuditBackend, BackendError, CancelResponse};

/// Entry point tying submission, polling, retry and materialization together
pub struct AuditController {
    backend: Arc<dyn AuditBackend>,
    settings: SessionSettings,
    submitter: Submitter,
    sessions: Mutex<SessionRegistry>,
    retry_guard: RetryGuard,
    events: Option<mpsc::UnboundedSender<SessionEvent>>,
}

impl AuditController {
    pub fn new(backend: Arc<dyn AuditBackend>, settings: SessionSettings) -> Self {
        Self {
            submitter: Submitter::new(backend.clone()),
            backend,
            settings,
            sessions: Mutex::new(SessionRegistry::new()),
            retry_guard: RetryGuard::new(),
            events: None,
        }
    }

    /// Publish session events to `events`
    pub fn with_events(mut self, events: mpsc::UnboundedSender<SessionEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Submit an audit without tracking it
    pub async fn submit(&self, url: &str, options: &AuditOptions) -> Result<Submission, AuditError> {
        self.submitter.start_audit(url, options).await
    }

    /// Start polling a task. An existing session for the same task is torn
    /// down before the new one polls.
    pub async fn track(&self, task_id: TaskId, url: &str) -> SessionWatch {
        let task = AuditTask::pending(task_id, url);
        let mut sessions = self.sessions.lock().await;

        // Forget sessions that ended since the last call
        let reaped = sessions.reap();
        if reaped > 0 {
            debug!("Forgot {} finished sessions", reaped);
        }

        sessions
            .start(self.backend.clone(), task, self.settings.clone(), self.events.clone())
            .await
    }

    /// Submit, poll and materialize one audit
    pub async fn run(&self, url: &str, options: &AuditOptions) -> SessionOutcome {
        let submission = self.submit(url, options).await?;
        let mut watch = self.track(submission.task_id.clone(), &submission.url).await;
        watch.outcome().await
    }

    /// Abandon `previous` and run a fresh audit for the same URL.
    ///
    /// Returns `None` without doing anything while another retry is running.
    pub async fn retry(
        &self,
        previous: Option<&TaskId>,
        url: &str,
        options: &AuditOptions,
    ) -> Option<SessionOutcome> {
        let _permit = match self.retry_guard.try_begin() {
            Some(permit) => permit,
            None => {
                info!("Retry for {} ignored, one is already running", url);
                return None;
            }
        };

        if let Some(previous) = previous {
            if self.sessions.lock().await.dispose(previous).await {
                info!("Abandoned session for {}", previous);
            }
        }

        info!("Retrying audit for {}", url);
        Some(self.run(url, options).await)
    }

    /// Stop tracking a task on this side only. The backend task keeps running.
    pub async fn cancel(&self, task_id: &TaskId) -> bool {
        self.sessions.lock().await.dispose(task_id).await
    }

    /// Stop tracking a task and ask the backend to cancel it
    pub async fn cancel_remote(&self, task_id: &TaskId) -> Result<CancelResponse, BackendError> {
        self.cancel(task_id).await;
        let response = self.backend.cancel_audit(task_id).await?;
        if !response.success {
            warn!(
                "Backend refused to cancel {}: {}",
                task_id,
                response.message.as_deref().unwrap_or("no reason given")
            );
        }
        Ok(response)
    }

    /// One status round-trip, outside of any session
    pub async fn status(&self, task_id: &TaskId) -> Result<AuditTask, BackendError> {
        let snapshot = self.backend.audit_status(task_id).await?;
        let mut task = AuditTask::pending(task_id.clone(), snapshot.url.clone());
        if !task.apply(&snapshot) {
            return Err(BackendError::Decode(format!(
                "Status answer was for {}, not {}",
                snapshot.task_id, task_id
            )));
        }
        Ok(task)
    }

    /// Fetch the results of an already completed task again
    pub async fn rematerialize(&self, task_id: &TaskId) -> Result<AuditResults, AuditError> {
        let task = self
            .status(task_id)
            .await
            .map_err(|e| AuditError::Materialization(e.to_string()))?;

        if task.status != TaskStatus::Completed {
            return Err(AuditError::Materialization(format!(
                "Task {} is {}",
                task_id, task.status
            )));
        }

        Materializer::new(self.backend.clone()).materialize(&task).await
    }

    pub async fn active_sessions(&self) -> usize {
        self.sessions.lock().await.active_count()
    }

    /// Dispose every session
    pub async fn shutdown(&self) {
        self.sessions.lock().await.dispose_all().await;
    }
}
