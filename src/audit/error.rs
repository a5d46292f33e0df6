use std::time::Duration;

use thiserror::Error;

/// Errors that reach the caller of the audit lifecycle.
///
/// Transient poll failures never appear here; the poller swallows them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuditError {
    /// The task was never created
    #[error("Audit submission failed: {0}")]
    Submission(String),

    /// The backend reported `status=failed`
    #[error("Audit failed: {0}")]
    BackendFailure(String),

    /// No terminal status arrived within the polling budget
    #[error("Audit timed out after {}s without finishing", .0.as_secs())]
    Timeout(Duration),

    /// The task completed but its results could not be fetched
    #[error("Audit results unavailable: {0}")]
    Materialization(String),

    /// The backend or the user cancelled the task
    #[error("Audit was cancelled")]
    Cancelled,
}

/// What the user can do after a terminal error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextStep {
    /// Fix the input and submit the form again
    Resubmit,
    /// Start a fresh task for the same URL
    Retry,
    /// Fetch the results of the finished task again
    RetryMaterialize,
}

impl AuditError {
    pub fn next_step(&self) -> NextStep {
        match self {
            AuditError::Submission(_) => NextStep::Resubmit,
            AuditError::BackendFailure(_) | AuditError::Timeout(_) | AuditError::Cancelled => {
                NextStep::Retry
            }
            AuditError::Materialization(_) => NextStep::RetryMaterialize,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, AuditError::Timeout(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_error_has_a_next_step() {
        assert_eq!(AuditError::Submission("bad url".into()).next_step(), NextStep::Resubmit);
        assert_eq!(AuditError::BackendFailure("boom".into()).next_step(), NextStep::Retry);
        assert_eq!(AuditError::Timeout(Duration::from_secs(180)).next_step(), NextStep::Retry);
        assert_eq!(AuditError::Cancelled.next_step(), NextStep::Retry);
        assert_eq!(
            AuditError::Materialization("history".into()).next_step(),
            NextStep::RetryMaterialize
        );
    }

    #[test]
    fn test_timeout_message_is_distinct() {
        let timeout = AuditError::Timeout(Duration::from_secs(180));
        assert!(timeout.is_timeout());
        assert_eq!(timeout.to_string(), "Audit timed out after 180s without finishing");
        assert!(!AuditError::BackendFailure("timed out".into()).is_timeout());
    }
}
