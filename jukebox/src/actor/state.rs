//! Playback actor state machine.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::track::Track;

/// The resource currently owned by the player.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NowPlaying {
    pub track: Track,
    pub resource_id: u64,
    pub started_at: DateTime<Utc>,
}

/// Why an actor released its channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// A stop control event.
    StopEvent,
    /// The queue stayed empty past the idle timeout.
    Idle,
    /// The owning worker is shutting down.
    Shutdown,
    /// Joining the transport or building a resource failed.
    Failed,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::StopEvent => "stop_event",
            StopReason::Idle => "idle",
            StopReason::Shutdown => "shutdown",
            StopReason::Failed => "failed",
        }
    }
}

/// Actor lifecycle.
///
/// ```text
/// Starting -> Draining -> Loading -> Playing <-> Paused
///                ^           |          |          |
///                +-----------+----------+----------+   (next job)
/// any -> Released
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum State {
    /// Claimed, no job pulled yet.
    Starting,
    /// Waiting for the next job, idle timer armed.
    Draining,
    /// A job was pulled and is being fetched.
    Loading(Track),
    Playing(NowPlaying),
    Paused(NowPlaying),
    /// Terminal.
    Released(StopReason),
}

/// A request to move to the next job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    /// First pull after the claim.
    Start,
    /// Explicit skip of whatever is playing.
    Skip,
    /// The player finished the resource with this id.
    Finished(u64),
}

/// What an advance request did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvanceOutcome {
    /// The request did not apply to the current state.
    Ignored,
    /// A new job is playing.
    Started,
    /// The queue stayed empty and the channel was released.
    Drained,
    /// The actor was stopped while the advance was in flight.
    Cancelled,
}

impl State {
    pub fn name(&self) -> &'static str {
        match self {
            State::Starting => "starting",
            State::Draining => "draining",
            State::Loading(_) => "loading",
            State::Playing(_) => "playing",
            State::Paused(_) => "paused",
            State::Released(_) => "released",
        }
    }

    pub fn is_released(&self) -> bool {
        matches!(self, State::Released(_))
    }

    pub fn now_playing(&self) -> Option<&NowPlaying> {
        match self {
            State::Playing(now) | State::Paused(now) => Some(now),
            _ => None,
        }
    }

    /// Whether `advance` may start a new advance from this state.
    ///
    /// Only one advance is in flight at a time: while `Draining` or
    /// `Loading` every request is a no-op. A `Finished` for a resource that
    /// is no longer current is stale.
    pub fn admits(&self, advance: Advance) -> bool {
        match (self, advance) {
            (State::Starting, Advance::Start) => true,
            (State::Playing(_) | State::Paused(_), Advance::Skip) => true,
            (State::Playing(now) | State::Paused(now), Advance::Finished(resource_id)) => {
                now.resource_id == resource_id
            }
            _ => false,
        }
    }
}

/// Point-in-time view of an actor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActorSnapshot {
    pub channel_id: String,
    pub actor_id: String,
    pub state: &'static str,
    pub current: Option<Track>,
    pub fetch_attempts: u32,
    pub accepting_events: bool,
    pub advances: u64,
    pub stop_reason: Option<StopReason>,
}
