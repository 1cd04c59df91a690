//! Handle to a running playback actor.

use std::sync::Arc;
use std::time::{Duration, Instant};

use super::playback_actor::PlaybackActor;
use super::state::ActorSnapshot;
use crate::events::ControlEvent;
use crate::fanout::DeliveryOutcome;

/// Metadata about an actor.
#[derive(Debug, Clone)]
pub struct ActorMetadata {
    /// Channel the actor owns.
    pub channel_id: String,
    pub guild_id: String,
    /// Unique per claim.
    pub actor_id: String,
    /// When the actor was spawned.
    pub spawned_at: Instant,
    /// Whether the channel was recovered from a previous run of this worker.
    pub recovered: bool,
}

impl ActorMetadata {
    /// Get the actor's uptime.
    pub fn uptime(&self) -> Duration {
        self.spawned_at.elapsed()
    }
}

/// A cheap, cloneable reference to a [`PlaybackActor`].
#[derive(Clone)]
pub struct ActorHandle {
    pub metadata: ActorMetadata,
    actor: Arc<PlaybackActor>,
}

impl ActorHandle {
    pub fn new(actor: Arc<PlaybackActor>, recovered: bool) -> Self {
        let metadata = ActorMetadata {
            channel_id: actor.channel_id().to_string(),
            guild_id: actor.guild_id().to_string(),
            actor_id: actor.actor_id().to_string(),
            spawned_at: Instant::now(),
            recovered,
        };
        Self { metadata, actor }
    }

    pub fn channel_id(&self) -> &str {
        &self.metadata.channel_id
    }

    pub fn guild_id(&self) -> &str {
        &self.metadata.guild_id
    }

    pub fn actor_id(&self) -> &str {
        &self.metadata.actor_id
    }

    pub fn is_accepting(&self) -> bool {
        self.actor.is_accepting()
    }

    /// Hand a control event to the actor's inbox.
    pub fn deliver(&self, event: ControlEvent) -> DeliveryOutcome {
        self.actor.deliver(event)
    }

    pub fn snapshot(&self) -> ActorSnapshot {
        self.actor.snapshot()
    }

    /// Stop the actor and release its channel.
    pub async fn stop(&self) {
        self.actor.stop().await;
    }
}

impl std::fmt::Debug for ActorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActorHandle")
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}
