//! The per-channel playback actor.
//!
//! An actor owns one player for one claimed channel. It pulls jobs from the
//! channel's work queue one at a time, reacts to control events from its
//! inbox, and releases the channel when the queue stays empty past the idle
//! timeout or when it is stopped.
//!
//! All actor state sits behind one mutex that is never held across an
//! `.await`: jobs are pulled and fetched outside the lock, and only the
//! state change plus the synchronous player call happen under it. An advance
//! to the next job is claimed by moving to `Draining` under the lock, so a
//! skip and a natural "finished" notification can never both tear down and
//! replace the current resource.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use blocking_deque::BlockingDeque;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::state::{ActorSnapshot, Advance, AdvanceOutcome, NowPlaying, State, StopReason};
use super::{ActorError, ActorOutcome, ActorResult};
use crate::config::ActorConfig;
use crate::events::{ControlEvent, ControlKind};
use crate::fanout::DeliveryOutcome;
use crate::feedback::FeedbackSink;
use crate::queue::{DequeueCount, QueueError, WorkQueue};
use crate::registry::{ChannelRegistry, Claim, Requeue};
use crate::store::Store;
use crate::track::Track;
use crate::transport::{
    AudioPlayer, AudioResource, FetchedMedia, JoinTarget, MediaError, MediaSource, PlayerEvent,
    TransportError, VoiceTransport,
};

/// Everything an actor needs from its worker.
pub struct ActorContext {
    pub claim: Claim,
    pub guild_id: String,
    pub config: ActorConfig,
    pub store: Arc<dyn Store>,
    pub registry: ChannelRegistry,
    pub media: Arc<dyn MediaSource>,
    /// Child of the worker's root token.
    pub cancel: CancellationToken,
}

struct Inner {
    state: State,
    player: Option<Arc<dyn AudioPlayer>>,
    /// Fetch attempts for the job in flight.
    fetch_attempts: u32,
    advances: u64,
}

enum NextJob {
    Track(Track),
    /// Nothing arrived before the idle timeout, or the wait was cancelled.
    Empty,
    /// The unit was unusable; pull again.
    Retry,
}

enum FetchOutcome {
    Ready(FetchedMedia),
    Cancelled,
    Failed(MediaError),
}

/// State machine driving playback for one claimed channel.
pub struct PlaybackActor {
    channel_id: String,
    guild_id: String,
    actor_id: String,
    recovered: bool,
    config: ActorConfig,
    queue_key: String,
    jobs: WorkQueue<Track>,
    feedback: FeedbackSink,
    registry: ChannelRegistry,
    media: Arc<dyn MediaSource>,
    inner: Mutex<Inner>,
    accepting: AtomicBool,
    inbox: BlockingDeque<ControlEvent>,
    cancel: CancellationToken,
    tasks: TaskTracker,
    failure: Mutex<Option<ActorError>>,
}

impl PlaybackActor {
    pub fn new(ctx: ActorContext) -> Arc<Self> {
        let keys = ctx.registry.keys().clone();
        Arc::new(Self {
            queue_key: keys.queue(&ctx.claim.channel_id),
            channel_id: ctx.claim.channel_id,
            guild_id: ctx.guild_id,
            actor_id: ctx.claim.actor_id,
            recovered: ctx.claim.recovered,
            config: ctx.config,
            jobs: WorkQueue::new(ctx.store.clone()),
            feedback: FeedbackSink::new(ctx.store, &keys),
            registry: ctx.registry,
            media: ctx.media,
            inner: Mutex::new(Inner {
                state: State::Starting,
                player: None,
                fetch_attempts: 0,
                advances: 0,
            }),
            accepting: AtomicBool::new(false),
            inbox: BlockingDeque::new(),
            cancel: ctx.cancel,
            tasks: TaskTracker::new(),
            failure: Mutex::new(None),
        })
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    pub fn guild_id(&self) -> &str {
        &self.guild_id
    }

    pub fn actor_id(&self) -> &str {
        &self.actor_id
    }

    /// False before the first job starts and once shutdown begins.
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    /// Queue a control event for the event loop.
    pub fn deliver(&self, event: ControlEvent) -> DeliveryOutcome {
        if !self.is_accepting() {
            return DeliveryOutcome::NotAccepting;
        }
        // Pushed at the front and popped at the back: arrival order.
        self.inbox.push_front(event);
        DeliveryOutcome::Delivered
    }

    pub fn snapshot(&self) -> ActorSnapshot {
        let inner = self.inner.lock();
        let current = match &inner.state {
            State::Loading(track) => Some(track.clone()),
            state => state.now_playing().map(|now| now.track.clone()),
        };
        let stop_reason = match inner.state {
            State::Released(reason) => Some(reason),
            _ => None,
        };
        ActorSnapshot {
            channel_id: self.channel_id.clone(),
            actor_id: self.actor_id.clone(),
            state: inner.state.name(),
            current,
            fetch_attempts: inner.fetch_attempts,
            accepting_events: self.is_accepting(),
            advances: inner.advances,
            stop_reason,
        }
    }

    /// Join the transport, play the first job and process control events
    /// until the channel is released.
    pub async fn run(self: Arc<Self>, transport: Arc<dyn VoiceTransport>) -> ActorResult {
        info!(
            channel_id = %self.channel_id,
            actor_id = %self.actor_id,
            recovered = self.recovered,
            "PlaybackActor starting"
        );

        let target = JoinTarget {
            channel_id: self.channel_id.clone(),
            guild_id: self.guild_id.clone(),
        };
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let player = match transport.join(&target, events_tx).await {
            Ok(player) => player,
            Err(e) => {
                let error = ActorError::fatal(format!("transport join failed: {e}"));
                self.fail(error.clone()).await;
                return Err(error);
            }
        };
        self.inner.lock().player = Some(player.clone());

        self.tasks.spawn(self.clone().watch_cancellation());
        self.tasks.spawn(self.clone().listen_player(events_rx));

        if let Err(e) = self.play_next(Advance::Start).await {
            self.fail(e).await;
        }

        self.process_events().await;

        self.tasks.close();
        self.tasks.wait().await;
        player.disconnect().await;

        let reason = match self.inner.lock().state {
            State::Released(reason) => reason,
            _ => StopReason::Shutdown,
        };
        if let Some(error) = self.failure.lock().take() {
            return Err(error);
        }
        let outcome = ActorOutcome::from_reason(reason)
            .ok_or_else(|| ActorError::fatal("actor failed"))?;

        info!(
            channel_id = %self.channel_id,
            actor_id = %self.actor_id,
            reason = reason.as_str(),
            "PlaybackActor stopped"
        );
        Ok(outcome)
    }

    /// Move to the next job.
    ///
    /// A request that does not apply to the current state (a non-skip while
    /// a resource is playing, a stale `Finished`, anything while another
    /// advance is in flight) returns [`AdvanceOutcome::Ignored`] without side
    /// effects.
    pub async fn play_next(&self, advance: Advance) -> Result<AdvanceOutcome, ActorError> {
        if !self.begin_advance(advance) {
            debug!(channel_id = %self.channel_id, ?advance, "Advance ignored");
            return Ok(AdvanceOutcome::Ignored);
        }
        self.complete_advance().await
    }

    /// Pause playback. No-op unless playing.
    pub fn pause(&self) -> bool {
        let mut inner = self.inner.lock();
        let now = match &inner.state {
            State::Playing(now) => now.clone(),
            other => {
                debug!(channel_id = %self.channel_id, state = other.name(), "Ignoring pause");
                return false;
            }
        };
        if let Some(player) = &inner.player {
            player.pause();
        }
        inner.state = State::Paused(now);
        true
    }

    /// Resume playback. No-op unless paused.
    pub fn resume(&self) -> bool {
        let mut inner = self.inner.lock();
        let now = match &inner.state {
            State::Paused(now) => now.clone(),
            other => {
                debug!(channel_id = %self.channel_id, state = other.name(), "Ignoring resume");
                return false;
            }
        };
        if let Some(player) = &inner.player {
            player.unpause();
        }
        inner.state = State::Playing(now);
        true
    }

    /// Stop playback and release the channel.
    pub async fn stop(&self) {
        self.shutdown(StopReason::StopEvent).await;
    }

    async fn process_events(self: &Arc<Self>) {
        while self.is_accepting() {
            // `None` only after an abort; the loop condition decides.
            let Some(event) = self.inbox.blocking_pop_back(None).await else {
                continue;
            };

            debug!(
                channel_id = %self.channel_id,
                kind = %event.kind,
                correlation_id = event.correlation_id.as_deref().unwrap_or(""),
                "Control event"
            );

            match event.kind {
                ControlKind::Stop => {
                    self.stop().await;
                    break;
                }
                ControlKind::Skip => self.skip(),
                ControlKind::Pause => {
                    self.pause();
                }
                ControlKind::Resume => {
                    self.resume();
                }
            }
        }
    }

    /// Tear down the current resource inline, then pull the next job on a
    /// tracked task so later events are not stuck behind the queue wait.
    fn skip(self: &Arc<Self>) {
        if !self.begin_advance(Advance::Skip) {
            debug!(channel_id = %self.channel_id, "Nothing to skip");
            return;
        }
        let actor = self.clone();
        self.tasks.spawn(async move {
            if let Err(e) = actor.complete_advance().await {
                actor.fail(e).await;
            }
        });
    }

    fn begin_advance(&self, advance: Advance) -> bool {
        let mut inner = self.inner.lock();
        if !inner.state.admits(advance) {
            return false;
        }
        if inner.state.now_playing().is_some() {
            if let Some(player) = &inner.player {
                player.stop();
            }
        }
        inner.state = State::Draining;
        inner.fetch_attempts = 0;
        inner.advances += 1;
        true
    }

    async fn complete_advance(&self) -> Result<AdvanceOutcome, ActorError> {
        loop {
            if self.cancel.is_cancelled() {
                return Ok(AdvanceOutcome::Cancelled);
            }

            let track = match self.next_job().await {
                NextJob::Track(track) => track,
                NextJob::Retry => continue,
                NextJob::Empty => {
                    if self.cancel.is_cancelled() {
                        return Ok(AdvanceOutcome::Cancelled);
                    }
                    info!(channel_id = %self.channel_id, "Queue idle, releasing channel");
                    self.shutdown(StopReason::Idle).await;
                    return Ok(AdvanceOutcome::Drained);
                }
            };

            if !self.enter_loading(&track) {
                self.return_job(&track).await;
                return Ok(AdvanceOutcome::Cancelled);
            }

            let media = match self.fetch_with_retry(&track).await {
                FetchOutcome::Ready(media) => media,
                FetchOutcome::Cancelled => {
                    self.return_job(&track).await;
                    return Ok(AdvanceOutcome::Cancelled);
                }
                FetchOutcome::Failed(e) => {
                    warn!(
                        channel_id = %self.channel_id,
                        track_id = %track.track_id,
                        error = %e,
                        "Fetch failed, skipping track"
                    );
                    self.feedback
                        .notify(
                            &self.channel_id,
                            track.correlation_id.as_deref(),
                            format!("Playback error, skipping {}", track.title),
                        )
                        .await;
                    if !self.back_to_draining() {
                        return Ok(AdvanceOutcome::Cancelled);
                    }
                    continue;
                }
            };

            let resource = match self.media.create_resource(&track, media).await {
                Ok(resource) => resource,
                Err(e) => {
                    error!(
                        channel_id = %self.channel_id,
                        track_id = %track.track_id,
                        error = %e,
                        "Failed to create playable resource"
                    );
                    self.requeue_front(&track).await;
                    return Err(ActorError::recoverable(format!(
                        "failed to create resource for {}: {}",
                        track.track_id, e
                    )));
                }
            };

            match self.start_playback(&resource) {
                Ok(true) => {}
                Ok(false) => {
                    self.return_job(&track).await;
                    return Ok(AdvanceOutcome::Cancelled);
                }
                Err(e) => {
                    self.requeue_front(&track).await;
                    return Err(ActorError::recoverable(format!(
                        "failed to start {}: {}",
                        track.track_id, e
                    )));
                }
            }

            info!(
                channel_id = %self.channel_id,
                track_id = %track.track_id,
                resource_id = resource.id,
                "Now playing"
            );
            self.feedback
                .notify(
                    &self.channel_id,
                    track.correlation_id.as_deref(),
                    format!("Now playing: {}", track.title),
                )
                .await;
            return Ok(AdvanceOutcome::Started);
        }
    }

    async fn next_job(&self) -> NextJob {
        let items = self
            .jobs
            .dequeue_until(
                &self.queue_key,
                DequeueCount::Limit(1),
                Some(self.config.idle_timeout()),
                &self.cancel,
            )
            .await;
        let Some(item) = items.into_iter().next() else {
            return NextJob::Empty;
        };

        match item.outcome {
            Ok(track) => NextJob::Track(track),
            Err(QueueError::Store(e)) => {
                warn!(channel_id = %self.channel_id, error = %e, "Store error while pulling jobs");
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => {}
                    _ = tokio::time::sleep(self.config.store_retry_delay()) => {}
                }
                NextJob::Retry
            }
            Err(e) => {
                warn!(
                    channel_id = %self.channel_id,
                    ref_id = item.ref_id.as_deref().unwrap_or(""),
                    error = %e,
                    "Skipping unreadable job"
                );
                NextJob::Retry
            }
        }
    }

    async fn fetch_with_retry(&self, track: &Track) -> FetchOutcome {
        let policy = &self.config.fetch_retry;
        let mut attempts = 0;
        loop {
            attempts += 1;
            self.inner.lock().fetch_attempts = attempts;

            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return FetchOutcome::Cancelled,
                result = self.media.fetch(track) => result,
            };

            match result {
                Ok(media) => return FetchOutcome::Ready(media),
                Err(e) if e.transient && policy.should_retry(attempts) => {
                    let delay = policy.delay_after_attempt(attempts);
                    warn!(
                        channel_id = %self.channel_id,
                        track_id = %track.track_id,
                        attempt = attempts,
                        max_attempts = policy.max_attempts,
                        ?delay,
                        error = %e,
                        "Fetch failed, retrying"
                    );
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => return FetchOutcome::Cancelled,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return FetchOutcome::Failed(e),
            }
        }
    }

    fn enter_loading(&self, track: &Track) -> bool {
        let mut inner = self.inner.lock();
        if !matches!(inner.state, State::Draining) {
            return false;
        }
        inner.state = State::Loading(track.clone());
        true
    }

    fn back_to_draining(&self) -> bool {
        let mut inner = self.inner.lock();
        if !matches!(inner.state, State::Loading(_)) {
            return false;
        }
        inner.state = State::Draining;
        inner.fetch_attempts = 0;
        true
    }

    /// Returns `Ok(false)` if the actor was stopped meanwhile.
    fn start_playback(&self, resource: &AudioResource) -> Result<bool, TransportError> {
        let mut inner = self.inner.lock();
        if !matches!(inner.state, State::Loading(_)) || self.cancel.is_cancelled() {
            return Ok(false);
        }
        let Some(player) = inner.player.clone() else {
            return Err(TransportError::Player("no player attached".into()));
        };
        player.play(resource)?;
        inner.state = State::Playing(NowPlaying {
            track: resource.track.clone(),
            resource_id: resource.id,
            started_at: Utc::now(),
        });
        // Under the lock: shutdown clears this flag under the same lock.
        self.accepting.store(true, Ordering::Release);
        Ok(true)
    }

    async fn requeue_front(&self, track: &Track) {
        let response = self.jobs.enqueue(&self.queue_key, track, true).await;
        if let Some(e) = response.error {
            error!(
                channel_id = %self.channel_id,
                track_id = %track.track_id,
                error = %e,
                "Failed to re-enqueue job, it is lost"
            );
        }
    }

    /// Put a job pulled by a stopped actor back in line, and make sure the
    /// channel is offered again if the release already ran without it.
    async fn return_job(&self, track: &Track) {
        self.requeue_front(track).await;
        if let Err(e) = self.registry.mark_free(&self.channel_id).await {
            warn!(channel_id = %self.channel_id, error = %e, "Failed to re-offer channel");
        }
    }

    async fn fail(&self, error: ActorError) {
        error!(channel_id = %self.channel_id, actor_id = %self.actor_id, error = %error, "PlaybackActor failed");
        self.failure.lock().get_or_insert(error);
        self.shutdown(StopReason::Failed).await;
    }

    /// Stop accepting events, cancel in-flight waits, stop the player,
    /// release the claim and wake the event loop. Only the first call acts.
    ///
    /// The reason is recorded before the token fires, so the cancellation
    /// watcher never overwrites it with [`StopReason::Shutdown`].
    async fn shutdown(&self, reason: StopReason) {
        let player = {
            let mut inner = self.inner.lock();
            if inner.state.is_released() {
                return;
            }
            inner.state = State::Released(reason);
            self.accepting.store(false, Ordering::Release);
            inner.player.clone()
        };
        self.cancel.cancel();

        if let Some(player) = player {
            player.stop();
        }

        if let Err(e) = self
            .registry
            .release(&self.channel_id, Requeue::IfBacklog)
            .await
        {
            error!(channel_id = %self.channel_id, error = %e, "Failed to release channel");
        }
        self.inbox.abort_blocks();

        info!(channel_id = %self.channel_id, reason = reason.as_str(), "Channel released by actor");
    }

    async fn watch_cancellation(self: Arc<Self>) {
        self.cancel.cancelled().await;
        self.shutdown(StopReason::Shutdown).await;
    }

    async fn listen_player(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<PlayerEvent>) {
        loop {
            let event = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                event = events.recv() => event,
            };

            match event {
                Some(PlayerEvent::Finished { resource_id }) => {
                    debug!(channel_id = %self.channel_id, resource_id, "Resource finished");
                    if let Err(e) = self.play_next(Advance::Finished(resource_id)).await {
                        self.fail(e).await;
                    }
                }
                None => break,
            }
        }
    }
}
