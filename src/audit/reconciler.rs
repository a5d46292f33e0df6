use futures::stream::{self, BoxStream, StreamExt};
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::audit::task::{PartialResult, TaskId};
use crate::backend::AuditBackend;

/// Provisional audit data assembled from partial results.
///
/// Never authoritative: it is discarded once the final results are fetched.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PartialView {
    pub completion_percentage: u8,
    pub data: Map<String, Value>,
}

impl PartialView {
    /// Sparse merge: keys present in the fragment overwrite, absent keys stay
    pub fn merge(&mut self, result: &PartialResult) {
        for (key, value) in &result.audit_data_fragment {
            self.data.insert(key.clone(), value.clone());
        }
        self.completion_percentage = result.completion_percentage.min(100);
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty() && self.completion_percentage == 0
    }
}

struct Feed {
    backend: Arc<dyn AuditBackend>,
    task_id: TaskId,
    every: Duration,
    last: Option<PartialResult>,
}

/// Pull feed of partial results for a task.
///
/// Yields only results that differ from the previous one. Fetch errors are
/// logged and the feed keeps going. Dropping the stream ends the subscription.
pub fn observe_partial_results(
    backend: Arc<dyn AuditBackend>,
    task_id: TaskId,
    every: Duration,
) -> BoxStream<'static, PartialResult> {
    let feed = Feed {
        backend,
        task_id,
        every,
        last: None,
    };

    stream::unfold(feed, |mut feed| async move {
        loop {
            tokio::time::sleep(feed.every).await;

            match feed.backend.partial_results(&feed.task_id).await {
                Ok(Some(result)) if result.task_id != feed.task_id => {
                    debug!("Ignoring partial result for {}", result.task_id);
                }
                Ok(Some(result)) if feed.last.as_ref() != Some(&result) => {
                    debug!(
                        "Partial result for {} at {}%",
                        feed.task_id, result.completion_percentage
                    );
                    feed.last = Some(result.clone());
                    return Some((result, feed));
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(kind = e.kind(), "Partial result fetch for {} failed: {}", feed.task_id, e);
                }
            }
        }
    })
    .boxed()
}
