//! In-process transport and media source.
//!
//! Tracks "play" by sleeping for their duration. Both types record what
//! happened and support failure injection, so the whole system can run
//! without a voice backend.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

use super::{
    AudioPlayer, AudioResource, FetchedMedia, JoinTarget, MediaError, MediaSource, PlayerEvent,
    PlayerEvents, TransportError, VoiceTransport,
};
use crate::track::Track;

/// Default simulated track length.
pub const DEFAULT_TRACK_DURATION: Duration = Duration::from_secs(180);

/// Something a simulated player did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayerAction {
    Joined,
    Played { track_id: String, resource_id: u64 },
    Paused,
    Resumed,
    Stopped,
    Disconnected,
}

type ActionLog = Arc<Mutex<HashMap<String, Vec<PlayerAction>>>>;

fn record(log: &ActionLog, channel_id: &str, action: PlayerAction) {
    log.lock()
        .entry(channel_id.to_string())
        .or_default()
        .push(action);
}

/// Voice transport whose players are timers.
#[derive(Default)]
pub struct SimulatedTransport {
    log: ActionLog,
    failing_joins: Mutex<HashSet<String>>,
}

impl SimulatedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every join to `channel_id` fail.
    pub fn fail_joins(&self, channel_id: &str) {
        self.failing_joins.lock().insert(channel_id.to_string());
    }

    pub fn actions(&self, channel_id: &str) -> Vec<PlayerAction> {
        self.log.lock().get(channel_id).cloned().unwrap_or_default()
    }

    /// Track ids started on `channel_id`, in order.
    pub fn played(&self, channel_id: &str) -> Vec<String> {
        self.actions(channel_id)
            .into_iter()
            .filter_map(|action| match action {
                PlayerAction::Played { track_id, .. } => Some(track_id),
                _ => None,
            })
            .collect()
    }

    pub fn join_count(&self, channel_id: &str) -> usize {
        self.actions(channel_id)
            .iter()
            .filter(|action| **action == PlayerAction::Joined)
            .count()
    }
}

#[async_trait]
impl VoiceTransport for SimulatedTransport {
    async fn join(
        &self,
        target: &JoinTarget,
        events: PlayerEvents,
    ) -> Result<Arc<dyn AudioPlayer>, TransportError> {
        if self.failing_joins.lock().contains(&target.channel_id) {
            return Err(TransportError::Join {
                channel_id: target.channel_id.clone(),
                reason: "simulated join failure".into(),
            });
        }

        record(&self.log, &target.channel_id, PlayerAction::Joined);
        Ok(Arc::new(SimulatedPlayer {
            channel_id: target.channel_id.clone(),
            log: self.log.clone(),
            events,
            current: Arc::new(Mutex::new(None)),
        }))
    }
}

struct Current {
    resource_id: u64,
    remaining: Duration,
    started: Instant,
    /// `None` while paused.
    timer: Option<JoinHandle<()>>,
}

struct SimulatedPlayer {
    channel_id: String,
    log: ActionLog,
    events: PlayerEvents,
    current: Arc<Mutex<Option<Current>>>,
}

impl SimulatedPlayer {
    fn start_timer(&self, resource_id: u64, duration: Duration) -> JoinHandle<()> {
        let current = self.current.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            let finished = {
                let mut current = current.lock();
                if current.as_ref().is_some_and(|c| c.resource_id == resource_id) {
                    *current = None;
                    true
                } else {
                    false
                }
            };
            if finished {
                let _ = events.send(PlayerEvent::Finished { resource_id });
            }
        })
    }

    fn halt(&self) -> bool {
        match self.current.lock().take() {
            Some(current) => {
                if let Some(timer) = current.timer {
                    timer.abort();
                }
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl AudioPlayer for SimulatedPlayer {
    fn play(&self, resource: &AudioResource) -> Result<(), TransportError> {
        self.halt();
        let duration = resource.duration.unwrap_or(DEFAULT_TRACK_DURATION);
        {
            // The timer only fires for the resource in `current`, so it is
            // spawned while the slot is already filled and still locked.
            let mut current = self.current.lock();
            *current = Some(Current {
                resource_id: resource.id,
                remaining: duration,
                started: Instant::now(),
                timer: None,
            });
            let timer = self.start_timer(resource.id, duration);
            if let Some(playing) = current.as_mut() {
                playing.timer = Some(timer);
            }
        }
        debug!(channel_id = %self.channel_id, track_id = %resource.track.track_id, "Simulated playback started");
        record(
            &self.log,
            &self.channel_id,
            PlayerAction::Played {
                track_id: resource.track.track_id.clone(),
                resource_id: resource.id,
            },
        );
        Ok(())
    }

    fn pause(&self) -> bool {
        let mut current = self.current.lock();
        let Some(playing) = current.as_mut() else {
            return false;
        };
        let Some(timer) = playing.timer.take() else {
            return false;
        };
        timer.abort();
        playing.remaining = playing.remaining.saturating_sub(playing.started.elapsed());
        drop(current);
        record(&self.log, &self.channel_id, PlayerAction::Paused);
        true
    }

    fn unpause(&self) -> bool {
        let (resource_id, remaining) = {
            let current = self.current.lock();
            match current.as_ref() {
                Some(paused) if paused.timer.is_none() => (paused.resource_id, paused.remaining),
                _ => return false,
            }
        };
        let timer = self.start_timer(resource_id, remaining);
        if let Some(paused) = self.current.lock().as_mut() {
            paused.started = Instant::now();
            paused.timer = Some(timer);
        }
        record(&self.log, &self.channel_id, PlayerAction::Resumed);
        true
    }

    fn stop(&self) {
        if self.halt() {
            record(&self.log, &self.channel_id, PlayerAction::Stopped);
        }
    }

    async fn disconnect(&self) {
        self.halt();
        record(&self.log, &self.channel_id, PlayerAction::Disconnected);
    }
}

struct FailurePlan {
    remaining: u32,
    transient: bool,
}

/// Media source that never touches the network.
#[derive(Default)]
pub struct SimulatedMediaSource {
    next_resource_id: AtomicU64,
    default_duration: Option<Duration>,
    durations: Mutex<HashMap<String, Duration>>,
    fetch_delays: Mutex<HashMap<String, Duration>>,
    fetch_failures: Mutex<HashMap<String, FailurePlan>>,
    resource_failures: Mutex<HashMap<String, u32>>,
    fetch_attempts: Mutex<HashMap<String, u32>>,
}

impl SimulatedMediaSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Length of every track without an explicit duration.
    pub fn with_track_duration(mut self, duration: Duration) -> Self {
        self.default_duration = Some(duration);
        self
    }

    pub fn set_duration(&self, track_id: &str, duration: Duration) {
        self.durations.lock().insert(track_id.to_string(), duration);
    }

    /// Make each fetch of `track_id` take `delay`.
    pub fn delay_fetch(&self, track_id: &str, delay: Duration) {
        self.fetch_delays.lock().insert(track_id.to_string(), delay);
    }

    /// Fail the next `times` fetches of `track_id`.
    pub fn fail_fetch(&self, track_id: &str, times: u32, transient: bool) {
        self.fetch_failures.lock().insert(
            track_id.to_string(),
            FailurePlan {
                remaining: times,
                transient,
            },
        );
    }

    /// Fail the next `times` resource creations for `track_id`.
    pub fn fail_resource(&self, track_id: &str, times: u32) {
        self.resource_failures
            .lock()
            .insert(track_id.to_string(), times);
    }

    pub fn fetch_attempts(&self, track_id: &str) -> u32 {
        self.fetch_attempts
            .lock()
            .get(track_id)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl MediaSource for SimulatedMediaSource {
    async fn fetch(&self, track: &Track) -> Result<FetchedMedia, MediaError> {
        *self
            .fetch_attempts
            .lock()
            .entry(track.track_id.clone())
            .or_default() += 1;

        let delay = self.fetch_delays.lock().get(&track.track_id).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        {
            let mut failures = self.fetch_failures.lock();
            if let Some(plan) = failures.get_mut(&track.track_id) {
                if plan.remaining > 0 {
                    plan.remaining -= 1;
                    let message = format!("simulated fetch failure for {}", track.track_id);
                    return Err(if plan.transient {
                        MediaError::transient(message)
                    } else {
                        MediaError::permanent(message)
                    });
                }
            }
        }

        let duration = self
            .durations
            .lock()
            .get(&track.track_id)
            .copied()
            .or(self.default_duration);

        Ok(FetchedMedia {
            source: format!("sim://{}", track.track_id),
            duration,
        })
    }

    async fn create_resource(
        &self,
        track: &Track,
        media: FetchedMedia,
    ) -> Result<AudioResource, MediaError> {
        {
            let mut failures = self.resource_failures.lock();
            if let Some(remaining) = failures.get_mut(&track.track_id) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(MediaError::permanent(format!(
                        "simulated resource failure for {}",
                        track.track_id
                    )));
                }
            }
        }

        let id = self.next_resource_id.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(AudioResource {
            id,
            track: track.clone(),
            duration: media.duration,
        })
    }
}
