//! User-visible notifications handed back to the front-end.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::queue::{DequeueCount, WorkQueue};
use crate::store::{Store, StoreKeys};

/// A message for the user who made the original request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Feedback {
    #[serde(alias = "interactionId")]
    pub correlation_id: String,
    pub channel_id: String,
    pub content: String,
}

/// Writes and drains the shared feedback queue.
#[derive(Clone)]
pub struct FeedbackSink {
    queue: WorkQueue<Feedback>,
    key: String,
}

impl FeedbackSink {
    pub fn new(store: Arc<dyn Store>, keys: &StoreKeys) -> Self {
        Self {
            queue: WorkQueue::new(store),
            key: keys.feedback(),
        }
    }

    /// Queue a notification. Requests without a correlation id have nobody to
    /// notify and are skipped. Failures are logged, never returned.
    pub async fn notify(
        &self,
        channel_id: &str,
        correlation_id: Option<&str>,
        content: impl Into<String>,
    ) {
        let Some(correlation_id) = correlation_id else {
            return;
        };

        let feedback = Feedback {
            correlation_id: correlation_id.to_string(),
            channel_id: channel_id.to_string(),
            content: content.into(),
        };
        let response = self.queue.enqueue(&self.key, &feedback, false).await;
        if let Some(e) = response.error {
            warn!(
                channel_id = %channel_id,
                correlation_id = %correlation_id,
                error = %e,
                "Failed to queue feedback"
            );
        }
    }

    /// Take up to `max` pending notifications, oldest first.
    pub async fn drain(&self, max: usize) -> Vec<Feedback> {
        self.queue
            .dequeue(&self.key, DequeueCount::Limit(max), None)
            .await
            .into_iter()
            .filter_map(|item| match item.outcome {
                Ok(feedback) => Some(feedback),
                Err(e) => {
                    warn!(error = %e, "Skipping unreadable feedback");
                    None
                }
            })
            .collect()
    }
}
