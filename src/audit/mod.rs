pub mod controller;
pub mod error;
pub mod governor;
pub mod materializer;
pub mod poller;
pub mod reconciler;
pub mod session;
pub mod submitter;
pub mod task;

#[cfg(test)]
pub mod testing;

// Re-export common types
pub use controller::AuditController;
pub use error::{AuditError, NextStep};
pub use materializer::AuditResults;
pub use poller::{Notification, PollerState};
pub use session::{CompletedAudit, SessionEvent, SessionOutcome, SessionSettings, SessionWatch};
pub use submitter::Submission;
pub use task::{AuditOptions, AuditTask, AuditType, PartialResult, Stage, TaskId, TaskStatus};
