use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use tracing::debug;
use url::Url;

use crate::audit::error::AuditError;

/// Opaque identifier assigned by the backend when an audit is submitted
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Depth of the audit requested from the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum AuditType {
    #[default]
    Quick,
    Deep,
}

impl fmt::Display for AuditType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuditType::Quick => f.write_str("quick"),
            AuditType::Deep => f.write_str("deep"),
        }
    }
}

/// Options sent along with an `audit-start` request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditOptions {
    #[serde(rename = "maxPages")]
    pub max_pages: u32,

    #[serde(rename = "type")]
    pub audit_type: AuditType,
}

impl Default for AuditOptions {
    fn default() -> Self {
        Self {
            max_pages: 100,
            audit_type: AuditType::Quick,
        }
    }
}

/// Remote status of an audit task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// No transition leaves a terminal status
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

/// Free-form sub-stage reported by the backend. Display only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Stage {
    Initializing,
    Starting,
    Exploring,
    Discovery,
    Indexing,
    Finalizing,
    Completed,
    Error,
    Other(String),
}

/// UI-facing description of a stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageInfo {
    pub title: &'static str,
    pub description: String,
}

impl Stage {
    pub fn label(&self) -> &str {
        match self {
            Stage::Initializing => "initializing",
            Stage::Starting => "starting",
            Stage::Exploring => "exploring",
            Stage::Discovery => "discovery",
            Stage::Indexing => "indexing",
            Stage::Finalizing => "finalizing",
            Stage::Completed => "completed",
            Stage::Error => "error",
            Stage::Other(label) => label,
        }
    }

    /// Convert the raw label into text suitable for a progress display
    pub fn info(&self) -> StageInfo {
        let (title, description) = match self {
            Stage::Initializing => ("Initializing", "Preparing the audit".to_string()),
            Stage::Starting => ("Starting", "Connecting to the site".to_string()),
            Stage::Exploring => ("Exploring", "Scanning site structure".to_string()),
            Stage::Discovery => ("Discovery", "Discovering linked pages".to_string()),
            Stage::Indexing => ("Indexing", "Analyzing page content".to_string()),
            Stage::Finalizing => ("Finalizing", "Compiling audit results".to_string()),
            Stage::Completed => ("Completed", "Audit finished".to_string()),
            Stage::Error => ("Error", "The audit ran into a problem".to_string()),
            Stage::Other(label) => ("Processing", format!("Working ({})", label)),
        };
        StageInfo { title, description }
    }
}

impl From<String> for Stage {
    fn from(label: String) -> Self {
        match label.to_ascii_lowercase().as_str() {
            "initializing" => Stage::Initializing,
            "starting" => Stage::Starting,
            "exploring" => Stage::Exploring,
            "discovery" => Stage::Discovery,
            "indexing" => Stage::Indexing,
            "finalizing" => Stage::Finalizing,
            "completed" => Stage::Completed,
            "error" => Stage::Error,
            _ => Stage::Other(label),
        }
    }
}

impl From<Stage> for String {
    fn from(stage: Stage) -> Self {
        stage.label().to_string()
    }
}

/// One `audit-status` response. Snapshots are full replacements, not deltas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub task_id: TaskId,

    #[serde(default, deserialize_with = "null_as_empty")]
    pub url: String,

    pub status: TaskStatus,

    #[serde(default, deserialize_with = "lenient_count")]
    pub pages_scanned: u32,

    #[serde(default, deserialize_with = "lenient_count")]
    pub total_pages: u32,

    #[serde(default, deserialize_with = "lenient_number")]
    pub progress: Option<u32>,

    #[serde(default)]
    pub stage: Option<Stage>,

    #[serde(default)]
    pub current_url: Option<String>,

    #[serde(default)]
    pub error_message: Option<String>,
}

// Counters and progress are advisory. A null, fractional or quoted number
// must not make the whole snapshot unreadable.

fn null_as_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

fn lenient_count<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(lenient_number(deserializer)?.unwrap_or(0))
}

/// Integers, floats (rounded) and numeric strings; anything else is absent
fn lenient_number<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    let number = match Option::<Value>::deserialize(deserializer)? {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    // `as` saturates, so negatives land on 0
    Ok(number.map(|n| n.round() as u32))
}

/// The displayed state of one audit task
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditTask {
    pub task_id: TaskId,
    pub url: String,
    pub status: TaskStatus,
    pub stage: Stage,
    pub pages_scanned: u32,
    pub estimated_total_pages: u32,
    pub progress: u8,
    pub current_url: Option<String>,
    pub error_message: Option<String>,
}

impl AuditTask {
    /// A freshly submitted task
    pub fn pending(task_id: TaskId, url: impl Into<String>) -> Self {
        Self {
            task_id,
            url: url.into(),
            status: TaskStatus::Pending,
            stage: Stage::Initializing,
            pages_scanned: 0,
            estimated_total_pages: 0,
            progress: 0,
            current_url: None,
            error_message: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Apply a status snapshot. Returns `false` when the snapshot was rejected
    /// because the task is already terminal or the snapshot is for another task.
    pub fn apply(&mut self, snapshot: &StatusSnapshot) -> bool {
        if self.is_terminal() {
            debug!("Ignoring snapshot for terminal task {}", self.task_id);
            return false;
        }
        if snapshot.task_id != self.task_id {
            debug!("Ignoring snapshot for {} on task {}", snapshot.task_id, self.task_id);
            return false;
        }

        if snapshot.status.is_terminal() {
            self.pages_scanned = snapshot.pages_scanned.max(self.pages_scanned);
            self.estimated_total_pages = snapshot.total_pages.max(self.pages_scanned);
        } else {
            self.pages_scanned = self.pages_scanned.max(snapshot.pages_scanned);
            self.estimated_total_pages = self.estimated_total_pages.max(snapshot.total_pages);
        }

        if !snapshot.url.is_empty() {
            self.url = snapshot.url.clone();
        }

        self.progress = match (snapshot.status, snapshot.progress) {
            (TaskStatus::Completed, _) => 100,
            (_, Some(progress)) => progress.min(100) as u8,
            (_, None) => self.synthesized_progress(),
        };

        self.stage = match (&snapshot.stage, snapshot.status) {
            (Some(stage), _) => stage.clone(),
            (None, TaskStatus::Completed) => Stage::Completed,
            (None, TaskStatus::Failed) => Stage::Error,
            (None, _) => self.stage.clone(),
        };

        if snapshot.current_url.is_some() {
            self.current_url = snapshot.current_url.clone();
        }

        self.error_message = if snapshot.status == TaskStatus::Failed {
            snapshot.error_message.clone()
        } else {
            None
        };

        self.status = snapshot.status;
        true
    }

    fn synthesized_progress(&self) -> u8 {
        if self.estimated_total_pages == 0 {
            return self.progress;
        }
        let ratio = u64::from(self.pages_scanned) * 100 / u64::from(self.estimated_total_pages);
        ratio.min(99) as u8
    }
}

/// Provisional audit data published while a task is processing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialResult {
    pub task_id: TaskId,

    #[serde(rename = "audit_data", default)]
    pub audit_data_fragment: Map<String, Value>,

    #[serde(default)]
    pub completion_percentage: u8,
}

/// Normalize user input into a scheme-qualified URL
pub fn normalize_url(raw: &str) -> Result<String, AuditError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(AuditError::Submission("A URL is required".to_string()));
    }

    // Only a `://` ahead of any path, query or fragment marks a scheme
    let has_scheme = match trimmed.find("://") {
        Some(at) => !trimmed[..at].contains(|c| matches!(c, '/' | '?' | '#')),
        None => false,
    };
    let candidate = if has_scheme {
        trimmed.to_string()
    } else {
        format!("https://{}", trimmed)
    };

    let parsed = Url::parse(&candidate)
        .map_err(|e| AuditError::Submission(format!("Invalid URL '{}': {}", trimmed, e)))?;

    match parsed.scheme() {
        "http" | "https" if parsed.host_str().is_some() => Ok(parsed.to_string()),
        _ => Err(AuditError::Submission(format!("Unsupported URL '{}'", trimmed))),
    }
}
