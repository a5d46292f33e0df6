use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep_until;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::audit::error::AuditError;
use crate::audit::governor::{TimeoutGovernor, DEFAULT_POLL_BUDGET};
use crate::audit::materializer::{AuditResults, Materializer};
use crate::audit::poller::{
    IllegalTransition, Notification, PollerEvent, PollerState, StatusPoller, TickOutcome,
};
use crate::audit::reconciler::{observe_partial_results, PartialView};
use crate::audit::task::{AuditTask, TaskId};
use crate::backend::AuditBackend;
use crate::cli::config::PollingSettings;
use crate::utils::metrics::PollSummary;

/// Timing knobs of a polling session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSettings {
    pub poll_interval: Duration,
    pub partial_interval: Duration,
    pub budget: Duration,
    /// Consecutive poll failures before a warning is published; 0 disables it
    pub transient_warning_threshold: u32,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(3),
            partial_interval: Duration::from_secs(4),
            budget: DEFAULT_POLL_BUDGET,
            transient_warning_threshold: 5,
        }
    }
}

impl From<&PollingSettings> for SessionSettings {
    fn from(settings: &PollingSettings) -> Self {
        Self {
            poll_interval: Duration::from_millis(settings.interval_ms),
            partial_interval: Duration::from_millis(settings.partial_interval_ms),
            budget: Duration::from_secs(settings.timeout_secs),
            transient_warning_threshold: settings.transient_warning_threshold,
        }
    }
}

/// A completed audit together with its results
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedAudit {
    pub task: AuditTask,
    pub results: AuditResults,
    pub metrics: PollSummary,
}

pub type SessionOutcome = Result<CompletedAudit, AuditError>;

/// Which component may write the displayed snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnerPhase {
    Poller,
    Materializer,
    Closed,
}

/// The displayed snapshot of one session
#[derive(Debug, Clone)]
pub struct SessionView {
    pub phase: OwnerPhase,
    pub state: PollerState,
    pub task: AuditTask,
    pub partial: Option<PartialView>,
    pub results: Option<AuditResults>,
    pub outcome: Option<SessionOutcome>,
}

impl SessionView {
    fn new(task: AuditTask) -> Self {
        Self {
            phase: OwnerPhase::Poller,
            state: PollerState::Polling,
            task,
            partial: None,
            results: None,
            outcome: None,
        }
    }
}

/// Notifications published while a session runs
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Progress(AuditTask),
    Partial(TaskId, PartialView),
    TransientWarning { task_id: TaskId, consecutive: u32 },
    Notice(TaskId, Notification),
    /// Last event of a session that was not disposed
    Finished(TaskId, Result<(), AuditError>),
}

/// Write side of a session; every write checks the active flag first
struct Publisher {
    view: watch::Sender<SessionView>,
    events: Option<mpsc::UnboundedSender<SessionEvent>>,
    active: Arc<AtomicBool>,
}

impl Publisher {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Apply `update` only if `owner` currently owns the snapshot
    fn write(&self, owner: OwnerPhase, update: impl FnOnce(&mut SessionView)) -> bool {
        if !self.is_active() {
            return false;
        }
        let mut applied = false;
        self.view.send_if_modified(|view| {
            if view.phase != owner {
                return false;
            }
            update(view);
            applied = true;
            true
        });
        if !applied {
            debug!("Dropped write from {:?}", owner);
        }
        applied
    }

    fn emit(&self, event: SessionEvent) {
        if !self.is_active() {
            return;
        }
        if let Some(events) = &self.events {
            // Nobody listening is fine
            let _ = events.send(event);
        }
    }

    fn close(&self, task_id: &TaskId, outcome: &SessionOutcome) {
        if !self.is_active() {
            return;
        }
        self.view.send_modify(|view| {
            view.phase = OwnerPhase::Closed;
            view.outcome = Some(outcome.clone());
        });
        let finished = outcome.as_ref().map(|_| ()).map_err(Clone::clone);
        self.emit(SessionEvent::Finished(task_id.clone(), finished));
    }
}

type TickFuture = BoxFuture<'static, (StatusPoller, Result<TickOutcome, IllegalTransition>)>;

/// Fixed-delay scheduling: the delay starts after the previous poll resolved
fn schedule_tick(mut poller: StatusPoller, delay: Duration) -> TickFuture {
    async move {
        tokio::time::sleep(delay).await;
        let outcome = poller.tick().await;
        (poller, outcome)
    }
    .boxed()
}

enum Exit {
    Completed(AuditTask, Notification),
    Failed(AuditTask, Notification),
    Cancelled(AuditTask),
    TimedOut,
    Disposed,
    Broken(IllegalTransition),
}

struct Driver {
    session_id: Uuid,
    backend: Arc<dyn AuditBackend>,
    settings: SessionSettings,
    publisher: Publisher,
    attempts: Arc<AtomicU64>,
}

impl Driver {
    async fn run(self, task: AuditTask, mut cancel: oneshot::Receiver<()>) -> SessionOutcome {
        let task_id = task.task_id.clone();

        // Start polling
        let mut poller = StatusPoller::new(self.backend.clone(), task);
        if let Err(e) = poller.start() {
            error!("Could not start poller for {}: {}", task_id, e);
        }

        // The budget counts from here
        let mut governor = TimeoutGovernor::new(self.settings.budget);
        let timeout = sleep_until(governor.arm());
        tokio::pin!(timeout);

        // Subscribe to partial results
        let mut partials = observe_partial_results(
            self.backend.clone(),
            task_id.clone(),
            self.settings.partial_interval,
        );
        let mut partial_view = PartialView::default();

        let mut state = poller.state();
        let mut summary = poller.metrics().summary();
        let mut tick = schedule_tick(poller, Duration::ZERO);

        // First branch to fire wins; after a terminal branch the loop is gone
        let exit = loop {
            tokio::select! {
                biased;

                _ = &mut cancel => break Exit::Disposed,

                _ = &mut timeout => break Exit::TimedOut,

                (poller, result) = &mut tick => {
                    self.attempts.store(poller.attempts(), Ordering::Release);
                    summary = poller.metrics().summary();
                    state = poller.state();

                    // An answer that lands on the deadline is too late
                    if governor.is_expired() {
                        break Exit::TimedOut;
                    }

                    match result {
                        Ok(TickOutcome::Progress(task)) => {
                            self.publisher.write(OwnerPhase::Poller, |view| {
                                view.state = state;
                                view.task = task.clone();
                            });
                            self.publisher.emit(SessionEvent::Progress(task));
                            tick = schedule_tick(poller, self.settings.poll_interval);
                        }
                        Ok(TickOutcome::TransientError { consecutive }) => {
                            if consecutive == self.settings.transient_warning_threshold {
                                warn!(
                                    "{} consecutive status polls failed for {}, {}s left",
                                    consecutive,
                                    task_id,
                                    governor.remaining().unwrap_or_default().as_secs()
                                );
                                self.publisher.emit(SessionEvent::TransientWarning {
                                    task_id: task_id.clone(),
                                    consecutive,
                                });
                            }
                            tick = schedule_tick(poller, self.settings.poll_interval);
                        }
                        Ok(TickOutcome::Completed(task, note)) => break Exit::Completed(task, note),
                        Ok(TickOutcome::Failed(task, note)) => break Exit::Failed(task, note),
                        Ok(TickOutcome::Cancelled(task)) => break Exit::Cancelled(task),
                        Err(e) => break Exit::Broken(e),
                    }
                }

                Some(partial) = partials.next() => {
                    partial_view.merge(&partial);
                    if partial_view.is_empty() {
                        continue;
                    }
                    let written = self.publisher.write(OwnerPhase::Poller, |view| {
                        view.partial = Some(partial_view.clone());
                    });
                    if written {
                        self.publisher.emit(SessionEvent::Partial(task_id.clone(), partial_view.clone()));
                    }
                }
            }
        };

        // Tear down the partial feed and any in-flight poll before anything else
        drop(partials);
        drop(tick);

        // Settle the outcome; only a completed task reaches the materializer
        let outcome = match exit {
            Exit::Completed(task, note) => self.materialize(task, note, summary.clone(), &mut cancel).await,
            Exit::Failed(task, note) => {
                let message = note.message().to_string();
                self.publisher.write(OwnerPhase::Poller, |view| {
                    view.state = PollerState::Failed;
                    view.task = task;
                    view.partial = None;
                });
                self.publisher.emit(SessionEvent::Notice(task_id.clone(), note));
                Err(AuditError::BackendFailure(message))
            }
            Exit::Cancelled(task) => {
                self.publisher.write(OwnerPhase::Poller, |view| {
                    view.state = PollerState::Cancelled;
                    view.task = task;
                    view.partial = None;
                });
                Err(AuditError::Cancelled)
            }
            Exit::TimedOut => {
                let error = AuditError::Timeout(self.settings.budget);
                warn!("Audit {} timed out after {}s", task_id, self.settings.budget.as_secs());
                let timed_out = state.on(PollerEvent::Timeout).unwrap_or(PollerState::TimedOut);
                self.publisher.write(OwnerPhase::Poller, |view| {
                    view.state = timed_out;
                    view.partial = None;
                });
                self.publisher.emit(SessionEvent::Notice(
                    task_id.clone(),
                    Notification::Failure(error.to_string()),
                ));
                Err(error)
            }
            Exit::Disposed => {
                debug!("Session {} for {} disposed", self.session_id, task_id);
                Err(AuditError::Cancelled)
            }
            Exit::Broken(e) => {
                error!("Poller for {} stopped: {}", task_id, e);
                Err(AuditError::BackendFailure(e.to_string()))
            }
        };

        // Publish the outcome and stop writing
        self.publisher.close(&task_id, &outcome);
        info!(
            session = %self.session_id,
            attempts = summary.attempts,
            failures = summary.failures,
            "Polling session for {} ended",
            task_id
        );
        outcome
    }

    async fn materialize(
        &self,
        task: AuditTask,
        note: Notification,
        metrics: PollSummary,
        cancel: &mut oneshot::Receiver<()>,
    ) -> SessionOutcome {
        // Hand the snapshot over; partial data is never shown past this point
        self.publisher.write(OwnerPhase::Poller, |view| {
            view.state = PollerState::Completed;
            view.task = task.clone();
            view.partial = None;
            view.phase = OwnerPhase::Materializer;
        });
        self.publisher.emit(SessionEvent::Notice(task.task_id.clone(), note));

        let materializer = Materializer::new(self.backend.clone());
        let results = tokio::select! {
            biased;
            _ = cancel => return Err(AuditError::Cancelled),
            results = materializer.materialize(&task) => results?,
        };

        self.publisher.write(OwnerPhase::Materializer, |view| {
            view.results = Some(results.clone());
        });

        Ok(CompletedAudit {
            task,
            results,
            metrics,
        })
    }
}

/// Read side of a session
#[derive(Clone)]
pub struct SessionWatch {
    view: watch::Receiver<SessionView>,
}

impl SessionWatch {
    pub fn current(&self) -> SessionView {
        self.view.borrow().clone()
    }

    /// Wait until the session resolves. A session torn down before it could
    /// publish an outcome resolves as cancelled.
    pub async fn outcome(&mut self) -> SessionOutcome {
        loop {
            if let Some(outcome) = self.view.borrow_and_update().outcome.clone() {
                return outcome;
            }
            if self.view.changed().await.is_err() {
                return self
                    .view
                    .borrow()
                    .outcome
                    .clone()
                    .unwrap_or(Err(AuditError::Cancelled));
            }
        }
    }
}

/// Client-side bundle of timers and subscriptions tracking one task.
///
/// All timers live inside one driver task; `dispose` stops it and waits for
/// it to exit. Dropping the handle without disposing aborts the driver.
pub struct PollingSession {
    id: Uuid,
    task_id: TaskId,
    active: Arc<AtomicBool>,
    attempts: Arc<AtomicU64>,
    cancel: Option<oneshot::Sender<()>>,
    driver: Option<JoinHandle<SessionOutcome>>,
    view: watch::Receiver<SessionView>,
}

impl PollingSession {
    pub fn spawn(
        backend: Arc<dyn AuditBackend>,
        task: AuditTask,
        settings: SessionSettings,
        events: Option<mpsc::UnboundedSender<SessionEvent>>,
    ) -> Self {
        let id = Uuid::new_v4();
        let task_id = task.task_id.clone();
        let active = Arc::new(AtomicBool::new(true));
        let attempts = Arc::new(AtomicU64::new(0));
        let (view_tx, view_rx) = watch::channel(SessionView::new(task.clone()));
        let (cancel_tx, cancel_rx) = oneshot::channel();

        let driver = Driver {
            session_id: id,
            backend,
            settings,
            publisher: Publisher {
                view: view_tx,
                events,
                active: active.clone(),
            },
            attempts: attempts.clone(),
        };

        info!(session = %id, "Starting polling session for {}", task_id);
        let handle = tokio::spawn(driver.run(task, cancel_rx));

        Self {
            id,
            task_id,
            active,
            attempts,
            cancel: Some(cancel_tx),
            driver: Some(handle),
            view: view_rx,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Acquire)
    }

    pub fn is_finished(&self) -> bool {
        self.driver.as_ref().map_or(true, JoinHandle::is_finished)
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire) && !self.is_finished()
    }

    pub fn watch(&self) -> SessionWatch {
        SessionWatch {
            view: self.view.clone(),
        }
    }

    /// Stop every timer and subscription of this session and wait for the
    /// driver to exit. Responses arriving afterwards are discarded.
    pub async fn dispose(mut self) {
        self.active.store(false, Ordering::Release);
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
        if let Some(driver) = self.driver.take() {
            if let Err(e) = driver.await {
                if !e.is_cancelled() {
                    error!("Session driver for {} panicked: {}", self.task_id, e);
                }
            }
        }
        debug!(session = %self.id, "Disposed polling session for {}", self.task_id);
    }
}

impl Drop for PollingSession {
    fn drop(&mut self) {
        self.active.store(false, Ordering::Release);
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
    }
}

/// At most one session per task id. Owned by the caller.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: HashMap<TaskId, PollingSession>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking `task`, tearing down any session already tracking it
    pub async fn start(
        &mut self,
        backend: Arc<dyn AuditBackend>,
        task: AuditTask,
        settings: SessionSettings,
        events: Option<mpsc::UnboundedSender<SessionEvent>>,
    ) -> SessionWatch {
        if let Some(existing) = self.sessions.remove(&task.task_id) {
            info!(session = %existing.id(), "Replacing polling session for {}", task.task_id);
            existing.dispose().await;
        }

        let task_id = task.task_id.clone();
        let session = PollingSession::spawn(backend, task, settings, events);
        let watch = session.watch();
        self.sessions.insert(task_id, session);
        watch
    }

    /// Dispose the session for `task_id`. Returns `false` if none was tracked.
    pub async fn dispose(&mut self, task_id: &TaskId) -> bool {
        match self.sessions.remove(task_id) {
            Some(session) => {
                session.dispose().await;
                true
            }
            None => false,
        }
    }

    pub async fn dispose_all(&mut self) {
        let sessions: Vec<PollingSession> = self.sessions.drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.dispose().await;
        }
    }

    pub fn get(&self, task_id: &TaskId) -> Option<&PollingSession> {
        self.sessions.get(task_id)
    }

    pub fn is_active(&self, task_id: &TaskId) -> bool {
        self.sessions.get(task_id).map_or(false, PollingSession::is_active)
    }

    pub fn active_count(&self) -> usize {
        self.sessions.values().filter(|s| s.is_active()).count()
    }

    /// Forget sessions whose driver already exited
    pub fn reap(&mut self) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, session| !session.is_finished());
        before - self.sessions.len()
    }
}
