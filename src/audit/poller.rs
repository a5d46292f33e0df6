use std::sync::Arc;
use tokio::time::Instant;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::audit::task::{AuditTask, TaskStatus};
use crate::backend::AuditBackend;
use crate::utils::metrics::PollMetrics;

/// Fallback text when the backend fails a task without saying why
pub const GENERIC_FAILURE_MESSAGE: &str = "The audit failed without an error message";

/// Lifecycle of the poller for one task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerState {
    Idle,
    Polling,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

/// Inputs that drive [`PollerState`] transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerEvent {
    Start,
    Snapshot(TaskStatus),
    TransientError,
    Cancel,
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("illegal poller transition from {from:?} on {event:?}")]
pub struct IllegalTransition {
    pub from: PollerState,
    pub event: PollerEvent,
}

impl PollerState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, PollerState::Idle | PollerState::Polling)
    }

    /// Transition table
    pub fn on(self, event: PollerEvent) -> Result<PollerState, IllegalTransition> {
        use PollerEvent as E;
        use PollerState as S;

        let next = match (self, event) {
            (S::Idle, E::Start) => S::Polling,
            (S::Idle, E::Cancel) => S::Cancelled,

            (S::Polling, E::Snapshot(TaskStatus::Completed)) => S::Completed,
            (S::Polling, E::Snapshot(TaskStatus::Failed)) => S::Failed,
            (S::Polling, E::Snapshot(TaskStatus::Cancelled)) => S::Cancelled,
            (S::Polling, E::Snapshot(_)) => S::Polling,
            (S::Polling, E::TransientError) => S::Polling,
            (S::Polling, E::Cancel) => S::Cancelled,
            (S::Polling, E::Timeout) => S::TimedOut,

            (from, event) => return Err(IllegalTransition { from, event }),
        };
        Ok(next)
    }
}

/// User-facing notification produced on terminal transitions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Success(String),
    Failure(String),
}

impl Notification {
    pub fn message(&self) -> &str {
        match self {
            Notification::Success(message) | Notification::Failure(message) => message,
        }
    }
}

/// Result of one poll round-trip
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    Progress(AuditTask),
    Completed(AuditTask, Notification),
    Failed(AuditTask, Notification),
    Cancelled(AuditTask),
    TransientError { consecutive: u32 },
}

/// Sole writer of the task state while it is in flight
pub struct StatusPoller {
    backend: Arc<dyn AuditBackend>,
    task: AuditTask,
    state: PollerState,
    attempts: u64,
    consecutive_failures: u32,
    metrics: PollMetrics,
}

impl StatusPoller {
    pub fn new(backend: Arc<dyn AuditBackend>, task: AuditTask) -> Self {
        Self {
            backend,
            task,
            state: PollerState::Idle,
            attempts: 0,
            consecutive_failures: 0,
            metrics: PollMetrics::new(),
        }
    }

    pub fn state(&self) -> PollerState {
        self.state
    }

    pub fn task(&self) -> &AuditTask {
        &self.task
    }

    pub fn attempts(&self) -> u64 {
        self.attempts
    }

    pub fn metrics(&self) -> &PollMetrics {
        &self.metrics
    }

    /// Move from `Idle` to `Polling`
    pub fn start(&mut self) -> Result<(), IllegalTransition> {
        self.transition(PollerEvent::Start)
    }

    fn transition(&mut self, event: PollerEvent) -> Result<(), IllegalTransition> {
        let next = self.state.on(event)?;
        if next != self.state {
            debug!("Poller for {}: {:?} -> {:?}", self.task.task_id, self.state, next);
        }
        self.state = next;
        Ok(())
    }

    /// Perform exactly one `audit-status` round-trip.
    ///
    /// Network and backend errors are swallowed and reported as
    /// [`TickOutcome::TransientError`]; the poller stays in `Polling`.
    pub async fn tick(&mut self) -> Result<TickOutcome, IllegalTransition> {
        if self.state != PollerState::Polling {
            return Err(IllegalTransition {
                from: self.state,
                event: PollerEvent::TransientError,
            });
        }

        self.attempts += 1;
        let started = Instant::now();
        let result = self.backend.audit_status(&self.task.task_id).await;
        let elapsed = started.elapsed();

        let snapshot = match result {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.metrics.record_failure(elapsed);
                self.consecutive_failures += 1;
                warn!(
                    kind = e.kind(),
                    attempt = self.attempts,
                    "Status poll for {} failed: {}",
                    self.task.task_id,
                    e
                );
                self.transition(PollerEvent::TransientError)?;
                return Ok(TickOutcome::TransientError {
                    consecutive: self.consecutive_failures,
                });
            }
        };

        if !self.task.apply(&snapshot) {
            // Answer for some other task; nothing usable this tick
            self.metrics.record_failure(elapsed);
            self.consecutive_failures += 1;
            warn!("Discarding status of {} while polling {}", snapshot.task_id, self.task.task_id);
            return Ok(TickOutcome::TransientError {
                consecutive: self.consecutive_failures,
            });
        }
        self.metrics.record_success(elapsed);
        self.consecutive_failures = 0;
        self.transition(PollerEvent::Snapshot(snapshot.status))?;

        let outcome = match self.state {
            PollerState::Completed => {
                let message = format!("Audit completed: {} pages scanned", self.task.pages_scanned);
                info!("{} ({})", message, self.task.task_id);
                TickOutcome::Completed(self.task.clone(), Notification::Success(message))
            }
            PollerState::Failed => {
                let message = self
                    .task
                    .error_message
                    .clone()
                    .filter(|m| !m.trim().is_empty())
                    .unwrap_or_else(|| GENERIC_FAILURE_MESSAGE.to_string());
                warn!("Audit {} failed: {}", self.task.task_id, message);
                TickOutcome::Failed(self.task.clone(), Notification::Failure(message))
            }
            PollerState::Cancelled => {
                info!("Audit {} was cancelled by the backend", self.task.task_id);
                TickOutcome::Cancelled(self.task.clone())
            }
            _ => {
                debug!(
                    "Audit {} {} [{}] {}/{} pages, {}%",
                    self.task.task_id,
                    self.task.status,
                    self.task.stage.label(),
                    self.task.pages_scanned,
                    self.task.estimated_total_pages,
                    self.task.progress
                );
                TickOutcome::Progress(self.task.clone())
            }
        };

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::task::{StatusSnapshot, TaskId};
    use crate::backend::{BackendError, MockAuditBackend};

    fn snapshot(status: TaskStatus, scanned: u32) -> StatusSnapshot {
        StatusSnapshot {
            task_id: TaskId::new("abc123"),
            url: "https://example.com/".to_string(),
            status,
            pages_scanned: scanned,
            total_pages: 12,
            progress: None,
            stage: None,
            current_url: None,
            error_message: None,
        }
    }

    fn poller(backend: MockAuditBackend) -> StatusPoller {
        let task = AuditTask::pending(TaskId::new("abc123"), "https://example.com/");
        let mut poller = StatusPoller::new(Arc::new(backend), task);
        poller.start().unwrap();
        poller
    }

    #[test]
    fn test_transition_table() {
        use PollerEvent as E;
        use PollerState as S;

        assert_eq!(S::Idle.on(E::Start), Ok(S::Polling));
        assert_eq!(S::Polling.on(E::Snapshot(TaskStatus::Processing)), Ok(S::Polling));
        assert_eq!(S::Polling.on(E::Snapshot(TaskStatus::Pending)), Ok(S::Polling));
        assert_eq!(S::Polling.on(E::TransientError), Ok(S::Polling));
        assert_eq!(S::Polling.on(E::Snapshot(TaskStatus::Completed)), Ok(S::Completed));
        assert_eq!(S::Polling.on(E::Snapshot(TaskStatus::Failed)), Ok(S::Failed));
        assert_eq!(S::Polling.on(E::Snapshot(TaskStatus::Cancelled)), Ok(S::Cancelled));
        assert_eq!(S::Polling.on(E::Timeout), Ok(S::TimedOut));
        assert_eq!(S::Polling.on(E::Cancel), Ok(S::Cancelled));
    }

    #[test]
    fn test_terminal_states_accept_nothing() {
        use PollerEvent as E;
        use PollerState as S;

        for state in [S::Completed, S::Failed, S::Cancelled, S::TimedOut] {
            assert!(state.is_terminal());
            for event in [E::Start, E::Snapshot(TaskStatus::Processing), E::TransientError, E::Cancel, E::Timeout] {
                assert_eq!(state.on(event), Err(IllegalTransition { from: state, event }));
            }
        }
        assert!(S::Idle.on(E::Timeout).is_err());
        assert!(S::Idle.on(E::Snapshot(TaskStatus::Completed)).is_err());
    }

    #[tokio::test]
    async fn test_tick_without_start_is_illegal() {
        let backend = MockAuditBackend::new();
        let task = AuditTask::pending(TaskId::new("abc123"), "https://example.com/");
        let mut poller = StatusPoller::new(Arc::new(backend), task);

        assert!(poller.tick().await.is_err());
        assert_eq!(poller.attempts(), 0);
    }

    #[tokio::test]
    async fn test_progress_tick_keeps_polling() {
        let mut backend = MockAuditBackend::new();
        backend
            .expect_audit_status()
            .times(1)
            .returning(|_| Ok(snapshot(TaskStatus::Processing, 5)));

        let mut poller = poller(backend);
        let outcome = poller.tick().await.unwrap();

        assert!(matches!(outcome, TickOutcome::Progress(ref task) if task.pages_scanned == 5));
        assert_eq!(poller.state(), PollerState::Polling);
    }

    #[tokio::test]
    async fn test_completed_tick_notifies_page_count() {
        let mut backend = MockAuditBackend::new();
        backend
            .expect_audit_status()
            .returning(|_| Ok(snapshot(TaskStatus::Completed, 12)));

        let mut poller = poller(backend);
        let outcome = poller.tick().await.unwrap();

        assert_eq!(poller.state(), PollerState::Completed);
        match outcome {
            TickOutcome::Completed(task, Notification::Success(message)) => {
                assert_eq!(task.pages_scanned, 12);
                assert_eq!(message, "Audit completed: 12 pages scanned");
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(poller.tick().await.is_err());
    }

    #[tokio::test]
    async fn test_failed_tick_uses_fallback_message() {
        let mut backend = MockAuditBackend::new();
        backend
            .expect_audit_status()
            .returning(|_| Ok(snapshot(TaskStatus::Failed, 2)));

        let mut poller = poller(backend);
        let outcome = poller.tick().await.unwrap();

        assert_eq!(
            outcome,
            TickOutcome::Failed(
                poller.task().clone(),
                Notification::Failure(GENERIC_FAILURE_MESSAGE.to_string())
            )
        );
    }

    #[tokio::test]
    async fn test_transient_error_is_swallowed() {
        let mut backend = MockAuditBackend::new();
        let mut seq = mockall::Sequence::new();
        backend
            .expect_audit_status()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_| Err(BackendError::Transport("connection reset".to_string())));
        backend
            .expect_audit_status()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(snapshot(TaskStatus::Processing, 3)));

        let mut poller = poller(backend);
        assert_eq!(poller.tick().await.unwrap(), TickOutcome::TransientError { consecutive: 1 });
        assert_eq!(poller.tick().await.unwrap(), TickOutcome::TransientError { consecutive: 2 });
        assert!(matches!(poller.tick().await.unwrap(), TickOutcome::Progress(_)));

        assert_eq!(poller.state(), PollerState::Polling);
        assert_eq!(poller.attempts(), 3);
        assert_eq!(poller.metrics().failures(), 2);
        assert_eq!(poller.metrics().longest_failure_streak(), 2);
    }

    #[tokio::test]
    async fn test_status_of_other_task_counts_as_failure() {
        let mut backend = MockAuditBackend::new();
        let mut seq = mockall::Sequence::new();
        backend
            .expect_audit_status()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_| {
                let mut other = snapshot(TaskStatus::Completed, 9);
                other.task_id = TaskId::new("other");
                Ok(other)
            });
        backend
            .expect_audit_status()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(snapshot(TaskStatus::Processing, 3)));

        let mut poller = poller(backend);
        assert_eq!(poller.tick().await.unwrap(), TickOutcome::TransientError { consecutive: 1 });
        assert_eq!(poller.tick().await.unwrap(), TickOutcome::TransientError { consecutive: 2 });
        assert_eq!(poller.state(), PollerState::Polling);
        assert_eq!(poller.task().pages_scanned, 0);
        assert_eq!(poller.metrics().failures(), 2);
        assert_eq!(poller.metrics().longest_failure_streak(), 2);

        assert!(matches!(poller.tick().await.unwrap(), TickOutcome::Progress(_)));
        assert_eq!(poller.metrics().attempts(), 3);
        assert_eq!(poller.metrics().failures(), 2);
    }
}
