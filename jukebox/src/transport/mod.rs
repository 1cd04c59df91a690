//! Capabilities injected into playback actors.
//!
//! Actors never implement media transport themselves. They ask a
//! [`VoiceTransport`] to join a channel, getting back an [`AudioPlayer`], and
//! ask a [`MediaSource`] to turn a queued [`Track`] into something playable.

pub mod simulated;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::track::Track;

pub use simulated::{SimulatedMediaSource, SimulatedTransport};

/// Where to connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinTarget {
    pub channel_id: String,
    pub guild_id: String,
}

/// Notifications from a player back to its actor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayerEvent {
    /// The resource played to its natural end.
    Finished { resource_id: u64 },
}

/// Sender half handed to the transport on join.
pub type PlayerEvents = mpsc::UnboundedSender<PlayerEvent>;

/// Media located and downloaded for a track, not yet playable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedMedia {
    pub source: String,
    pub duration: Option<Duration>,
}

/// A playable resource. Ids are unique per media source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioResource {
    pub id: u64,
    pub track: Track,
    pub duration: Option<Duration>,
}

/// Error type for media operations.
#[derive(Debug, Clone)]
pub struct MediaError {
    /// Error message.
    pub message: String,
    /// Whether this error is transient (can be retried).
    pub transient: bool,
}

impl MediaError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: false,
        }
    }
}

impl fmt::Display for MediaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for MediaError {}

/// Error type for transport operations.
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    #[error("failed to join channel {channel_id}: {reason}")]
    Join { channel_id: String, reason: String },

    #[error("player error: {0}")]
    Player(String),
}

/// Joins voice channels.
#[async_trait]
pub trait VoiceTransport: Send + Sync + 'static {
    /// Connect to the target. `events` receives [`PlayerEvent`]s for the
    /// returned player until it is disconnected.
    async fn join(
        &self,
        target: &JoinTarget,
        events: PlayerEvents,
    ) -> Result<Arc<dyn AudioPlayer>, TransportError>;
}

/// One connected player.
///
/// Playback controls are synchronous so they can be called while holding the
/// actor's state lock.
#[async_trait]
pub trait AudioPlayer: Send + Sync {
    /// Replace whatever is playing with `resource`.
    fn play(&self, resource: &AudioResource) -> Result<(), TransportError>;

    /// Returns false if nothing was playing.
    fn pause(&self) -> bool;

    /// Returns false if nothing was paused.
    fn unpause(&self) -> bool;

    /// Stop the current resource without emitting `Finished`.
    fn stop(&self);

    async fn disconnect(&self);
}

/// Finds tracks and prepares playable resources.
#[async_trait]
pub trait MediaSource: Send + Sync + 'static {
    async fn fetch(&self, track: &Track) -> Result<FetchedMedia, MediaError>;

    async fn create_resource(
        &self,
        track: &Track,
        media: FetchedMedia,
    ) -> Result<AudioResource, MediaError>;
}
