//! Per-channel playback actors.
//!
//! A worker runs one [`PlaybackActor`] per claimed channel. The worker keeps
//! an [`ActorHandle`] for each in its [`ActorRegistry`], which the event
//! fanout uses to route control events into the actor's inbox.

mod handle;
mod playback_actor;
mod registry;
mod state;

pub use handle::{ActorHandle, ActorMetadata};
pub use playback_actor::{ActorContext, PlaybackActor};
pub use registry::{ActorRegistry, ActorTaskResult};
pub use state::{ActorSnapshot, Advance, AdvanceOutcome, NowPlaying, State, StopReason};

/// Result type for actor operations.
pub type ActorResult = Result<ActorOutcome, ActorError>;

/// Outcome of an actor's run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorOutcome {
    /// Stopped by a control event.
    Stopped,
    /// Stopped because the worker is shutting down.
    Cancelled,
    /// Released the channel after the queue stayed empty.
    Drained,
}

impl ActorOutcome {
    /// Outcome for a release reason. `None` for failures, which surface as
    /// [`ActorError`]s instead.
    pub fn from_reason(reason: StopReason) -> Option<Self> {
        match reason {
            StopReason::StopEvent => Some(ActorOutcome::Stopped),
            StopReason::Shutdown => Some(ActorOutcome::Cancelled),
            StopReason::Idle => Some(ActorOutcome::Drained),
            StopReason::Failed => None,
        }
    }
}

/// Error type for actor operations.
#[derive(Debug, Clone)]
pub struct ActorError {
    /// Error message.
    pub message: String,
    /// Whether this error is recoverable.
    pub recoverable: bool,
}

impl ActorError {
    /// Create a new recoverable error.
    pub fn recoverable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            recoverable: true,
        }
    }

    /// Create a new fatal error.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            recoverable: false,
        }
    }
}

impl std::fmt::Display for ActorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ActorError {}
