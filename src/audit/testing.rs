//! In-memory backend with scripted answers, shared by the lifecycle tests.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

use crate::audit::task::{AuditOptions, PartialResult, StatusSnapshot, TaskId, TaskStatus};
use crate::backend::{AuditBackend, BackendError, CancelResponse, StartResponse};

pub fn snapshot(task_id: &str, status: TaskStatus, scanned: u32, progress: Option<u32>) -> StatusSnapshot {
    StatusSnapshot {
        task_id: TaskId::new(task_id),
        url: "https://example.com/".to_string(),
        status,
        pages_scanned: scanned,
        total_pages: 12,
        progress,
        stage: None,
        current_url: None,
        error_message: None,
    }
}

pub fn transport_error() -> BackendError {
    BackendError::Transport("connection reset by peer".to_string())
}

#[derive(Default)]
pub struct ScriptedBackend {
    task_ids: Mutex<VecDeque<String>>,
    started: AtomicUsize,
    statuses: Mutex<HashMap<TaskId, VecDeque<Result<StatusSnapshot, BackendError>>>>,
    partials: Mutex<HashMap<TaskId, PartialResult>>,
    audit_data: Mutex<HashMap<TaskId, Value>>,
    audit_data_calls: AtomicUsize,
    status_delay: Mutex<Duration>,
    status_calls: Mutex<Vec<(TaskId, Instant)>>,
    cancel_calls: Mutex<Vec<TaskId>>,
    history_fails: AtomicBool,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ids handed out by `start_audit`, in order; afterwards `task-N`
    pub fn with_task_ids(self, ids: &[&str]) -> Self {
        self.task_ids
            .lock()
            .unwrap()
            .extend(ids.iter().map(|id| id.to_string()));
        self
    }

    /// Status answers for a task; once exhausted the task reports `processing`
    pub fn script(&self, task_id: &str, answers: Vec<Result<StatusSnapshot, BackendError>>) {
        self.statuses
            .lock()
            .unwrap()
            .insert(TaskId::new(task_id), answers.into());
    }

    pub fn set_partial(&self, partial: PartialResult) {
        self.partials
            .lock()
            .unwrap()
            .insert(partial.task_id.clone(), partial);
    }

    pub fn set_audit_data(&self, task_id: &str, data: Value) {
        self.audit_data
            .lock()
            .unwrap()
            .insert(TaskId::new(task_id), data);
    }

    /// Every status answer takes this long to arrive
    pub fn delay_status(&self, delay: Duration) {
        *self.status_delay.lock().unwrap() = delay;
    }

    pub fn fail_history(&self) {
        self.history_fails.store(true, Ordering::SeqCst);
    }

    pub fn heal_history(&self) {
        self.history_fails.store(false, Ordering::SeqCst);
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn status_calls(&self, task_id: &str) -> usize {
        self.status_calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id.as_str() == task_id)
            .count()
    }

    pub fn status_call_times(&self, task_id: &str) -> Vec<Instant> {
        self.status_calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id.as_str() == task_id)
            .map(|(_, at)| *at)
            .collect()
    }

    pub fn audit_data_calls(&self) -> usize {
        self.audit_data_calls.load(Ordering::SeqCst)
    }

    pub fn cancel_calls(&self) -> Vec<TaskId> {
        self.cancel_calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl AuditBackend for ScriptedBackend {
    async fn start_audit(&self, _url: &str, _options: &AuditOptions) -> Result<StartResponse, BackendError> {
        let n = self.started.fetch_add(1, Ordering::SeqCst) + 1;
        let id = self
            .task_ids
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| format!("task-{}", n));
        Ok(StartResponse {
            task_id: Some(TaskId::new(id)),
            message: Some("Audit started".to_string()),
        })
    }

    async fn audit_status(&self, task_id: &TaskId) -> Result<StatusSnapshot, BackendError> {
        self.status_calls
            .lock()
            .unwrap()
            .push((task_id.clone(), Instant::now()));

        let answer = self
            .statuses
            .lock()
            .unwrap()
            .get_mut(task_id)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Ok(snapshot(task_id.as_str(), TaskStatus::Processing, 1, None)));

        let delay = *self.status_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        answer
    }

    async fn cancel_audit(&self, task_id: &TaskId) -> Result<CancelResponse, BackendError> {
        self.cancel_calls.lock().unwrap().push(task_id.clone());
        Ok(CancelResponse {
            success: true,
            message: None,
        })
    }

    async fn partial_results(&self, task_id: &TaskId) -> Result<Option<PartialResult>, BackendError> {
        Ok(self.partials.lock().unwrap().get(task_id).cloned())
    }

    async fn audit_data(&self, task_id: &TaskId) -> Result<Value, BackendError> {
        self.audit_data_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .audit_data
            .lock()
            .unwrap()
            .get(task_id)
            .cloned()
            .unwrap_or_else(|| json!({ "pageCount": 0 })))
    }

    async fn recommendations(&self, _url: &str) -> Result<Value, BackendError> {
        Ok(json!([{ "title": "Add meta descriptions", "priority": "high" }]))
    }

    async fn history(&self, _url: &str) -> Result<Value, BackendError> {
        if self.history_fails.load(Ordering::SeqCst) {
            return Err(transport_error());
        }
        Ok(json!([{ "score": 64 }]))
    }
}
