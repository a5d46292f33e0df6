use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Default wall-clock budget for polling a task
pub const DEFAULT_POLL_BUDGET: Duration = Duration::from_secs(180);

/// Wall-clock budget around a poller's lifetime.
///
/// The clock starts when polling starts, not when the task was submitted.
#[derive(Debug, Clone)]
pub struct TimeoutGovernor {
    budget: Duration,
    armed_at: Option<Instant>,
}

impl TimeoutGovernor {
    pub fn new(budget: Duration) -> Self {
        Self {
            budget,
            armed_at: None,
        }
    }

    /// Start the clock and return the deadline
    pub fn arm(&mut self) -> Instant {
        let now = Instant::now();
        self.armed_at = Some(now);
        debug!("Timeout armed for {}s", self.budget.as_secs());
        now + self.budget
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.armed_at.map(|armed| armed + self.budget)
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.deadline()
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn is_expired(&self) -> bool {
        matches!(self.deadline(), Some(deadline) if Instant::now() >= deadline)
    }
}

impl Default for TimeoutGovernor {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_BUDGET)
    }
}

/// Single-flight guard for retries
#[derive(Debug, Clone, Default)]
pub struct RetryGuard {
    in_flight: Arc<AtomicBool>,
}

/// Held for the duration of a retry; releases the guard on drop
#[derive(Debug)]
pub struct RetryPermit {
    in_flight: Arc<AtomicBool>,
}

impl RetryGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` when a retry is already running
    pub fn try_begin(&self) -> Option<RetryPermit> {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RetryPermit {
                in_flight: self.in_flight.clone(),
            })
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }
}

impl Drop for RetryPermit {
    fn drop(&mut self) {
        self.in_flight.store(false, Ordering::Release);
    }
}
