//! The producing side: enqueue jobs and publish control events.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::Result;
use crate::events::ControlEvent;
use crate::feedback::{Feedback, FeedbackSink};
use crate::queue::{EnqueueResponse, WorkQueue};
use crate::registry::{ChannelRegistry, WorkerId};
use crate::store::{Store, StoreKeys};
use crate::track::Track;

/// Cluster-wide view of channel ownership and backlogs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    /// Waiting for a worker, next to be claimed last.
    pub free: Vec<String>,
    /// Sorted.
    pub claimed: Vec<String>,
    /// Queued jobs per known channel.
    pub backlogs: BTreeMap<String, usize>,
}

/// Handle used by front ends to feed work into the cluster.
#[derive(Clone)]
pub struct Producer {
    store: Arc<dyn Store>,
    keys: StoreKeys,
    jobs: WorkQueue<Track>,
    feedback: FeedbackSink,
    registry: ChannelRegistry,
}

impl Producer {
    pub fn new(store: Arc<dyn Store>, keys: StoreKeys) -> Self {
        Self {
            jobs: WorkQueue::new(store.clone()),
            feedback: FeedbackSink::new(store.clone(), &keys),
            registry: ChannelRegistry::new(store.clone(), keys.clone(), WorkerId::new("producer")),
            store,
            keys,
        }
    }

    /// Add a track to a channel's queue and offer the channel to the workers.
    ///
    /// `play_next` puts the track at the front of the queue. The guild of a
    /// channel is recorded on first use and never changes afterwards.
    pub async fn enqueue_job(
        &self,
        channel_id: &str,
        guild_id: &str,
        track: Track,
        play_next: bool,
    ) -> Result<EnqueueResponse> {
        self.registry.set_guild(channel_id, guild_id).await?;

        let queue_key = self.keys.queue(channel_id);
        let response = self.jobs.enqueue(&queue_key, &track, play_next).await;
        if let Some(e) = &response.error {
            warn!(channel_id = %channel_id, track_id = %track.track_id, error = %e, "Failed to enqueue track");
            self.feedback
                .notify(
                    channel_id,
                    track.correlation_id.as_deref(),
                    format!("Could not add to queue: {}", track.title),
                )
                .await;
            return Ok(response);
        }

        // Once the job is visible, make sure some worker will look at the channel.
        self.registry.mark_free(channel_id).await?;
        info!(
            channel_id = %channel_id,
            track_id = %track.track_id,
            ref_id = %response.ref_id,
            play_next,
            "Track enqueued"
        );
        Ok(response)
    }

    /// Publish a control event to every worker.
    pub async fn publish_control_event(&self, event: &ControlEvent) -> Result<()> {
        let payload = event.to_json()?;
        self.store
            .publish(&self.keys.channel_events(), &payload)
            .await?;
        debug!(channel_id = %event.channel_id, kind = %event.kind, "Control event published");
        Ok(())
    }

    /// Offer a channel to the workers without enqueueing anything.
    pub async fn mark_channel_free(&self, channel_id: &str) -> Result<bool> {
        Ok(self.registry.mark_free(channel_id).await?)
    }

    pub async fn guild_for(&self, channel_id: &str) -> Result<Option<String>> {
        Ok(self.registry.guild_for(channel_id).await?)
    }

    pub async fn queue_len(&self, channel_id: &str) -> Result<usize> {
        Ok(self.jobs.len(&self.keys.queue(channel_id)).await?)
    }

    /// Take up to `max` pending notifications for requesters.
    pub async fn drain_feedback(&self, max: usize) -> Vec<Feedback> {
        self.feedback.drain(max).await
    }

    pub async fn status(&self) -> Result<ClusterStatus> {
        let free = self.registry.free_channels().await?;
        let mut claimed = self.registry.claimed_channels().await?;
        claimed.sort();

        let mut backlogs = BTreeMap::new();
        for channel_id in free.iter().chain(claimed.iter()) {
            if backlogs.contains_key(channel_id) {
                continue;
            }
            let len = self.queue_len(channel_id).await?;
            backlogs.insert(channel_id.clone(), len);
        }

        Ok(ClusterStatus {
            free,
            claimed,
            backlogs,
        })
    }
}
