use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Poll statistics for one session
#[derive(Debug, Clone)]
pub struct PollMetrics {
    /// Start time of the metrics collection
    start_time: DateTime<Utc>,

    /// Successful status round-trips
    successes: u64,

    /// Failed status round-trips
    failures: u64,

    /// Current run of consecutive failures
    failure_streak: u32,

    /// Longest run of consecutive failures
    longest_failure_streak: u32,

    /// Round-trip durations in milliseconds
    round_trips: Vec<u64>,
}

/// Serializable view of [`PollMetrics`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollSummary {
    pub start_time: DateTime<Utc>,
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub longest_failure_streak: u32,
    pub average_round_trip_ms: u64,
    pub slowest_round_trip_ms: u64,
}

impl PollMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Utc::now(),
            successes: 0,
            failures: 0,
            failure_streak: 0,
            longest_failure_streak: 0,
            round_trips: Vec::new(),
        }
    }

    pub fn record_success(&mut self, elapsed: Duration) {
        self.successes += 1;
        self.failure_streak = 0;
        self.round_trips.push(elapsed.as_millis() as u64);
    }

    pub fn record_failure(&mut self, elapsed: Duration) {
        self.failures += 1;
        self.failure_streak += 1;
        self.longest_failure_streak = self.longest_failure_streak.max(self.failure_streak);
        self.round_trips.push(elapsed.as_millis() as u64);
    }

    pub fn attempts(&self) -> u64 {
        self.successes + self.failures
    }

    pub fn failures(&self) -> u64 {
        self.failures
    }

    pub fn longest_failure_streak(&self) -> u32 {
        self.longest_failure_streak
    }

    pub fn summary(&self) -> PollSummary {
        let total: u64 = self.round_trips.iter().sum();
        let average = if self.round_trips.is_empty() {
            0
        } else {
            total / self.round_trips.len() as u64
        };

        PollSummary {
            start_time: self.start_time,
            attempts: self.attempts(),
            successes: self.successes,
            failures: self.failures,
            longest_failure_streak: self.longest_failure_streak,
            average_round_trip_ms: average,
            slowest_round_trip_ms: self.round_trips.iter().copied().max().unwrap_or(0),
        }
    }
}

impl Default for PollMetrics {
    fn default() -> Self {
        Self::new()
    }
}
