//! Job payload carried through channel queues.

use serde::{Deserialize, Serialize};

/// One track to play.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Track {
    pub track_id: String,
    pub title: String,
    /// Id of the user request that queued this track, used to key feedback.
    #[serde(default, alias = "originInteractionId", skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl Track {
    pub fn new(track_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            track_id: track_id.into(),
            title: title.into(),
            correlation_id: None,
        }
    }

    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}
