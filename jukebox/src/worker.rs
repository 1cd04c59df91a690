//! Worker process: claims channels and supervises their actors.
//!
//! A worker runs three things side by side:
//!
//! - the claim loop, which pops channels off the shared free list and spawns
//!   a [`PlaybackActor`] for each one it wins
//! - the [`EventFanout`], which routes control events to local actors
//! - the actor tasks themselves, tracked in a `JoinSet`
//!
//! On shutdown the root cancellation token fires, every actor releases its
//! channel, and the worker waits up to the configured timeout before
//! aborting stragglers.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::Result;
use crate::actor::{
    ActorContext, ActorHandle, ActorRegistry, ActorTaskResult, PlaybackActor,
};
use crate::config::WorkerConfig;
use crate::fanout::{EventFanout, FanoutStats, FanoutStatsSnapshot};
use crate::registry::{ChannelRegistry, Claim, ClaimAttempt, Requeue, WorkerId};
use crate::store::{Store, StoreKeys};
use crate::transport::{MediaSource, VoiceTransport};

/// Upper bound on one wait for the free list, so finished actors are reaped
/// regularly even when no channel is offered.
const CLAIM_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// How a worker's actors ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShutdownReport {
    /// Actors that ended normally, during the run or at shutdown.
    pub actors_stopped: usize,
    pub actors_failed: usize,
    /// Actors still running at the shutdown deadline.
    pub actors_aborted: usize,
    pub fanout: FanoutStatsSnapshot,
}

pub struct Worker {
    config: WorkerConfig,
    store: Arc<dyn Store>,
    keys: StoreKeys,
    registry: ChannelRegistry,
    actors: Arc<ActorRegistry>,
    fanout: EventFanout,
    transport: Arc<dyn VoiceTransport>,
    media: Arc<dyn MediaSource>,
    cancel: CancellationToken,
    tasks: JoinSet<ActorTaskResult>,
    report: ShutdownReport,
}

impl Worker {
    pub fn new(
        config: WorkerConfig,
        store: Arc<dyn Store>,
        transport: Arc<dyn VoiceTransport>,
        media: Arc<dyn MediaSource>,
    ) -> Self {
        let keys = config.keys();
        let worker_id = config.resolve_worker_id();
        let registry = ChannelRegistry::new(store.clone(), keys.clone(), worker_id);
        let actors = Arc::new(ActorRegistry::new());
        let fanout = EventFanout::new(store.clone(), keys.channel_events(), actors.clone());

        Self {
            config,
            store,
            keys,
            registry,
            actors,
            fanout,
            transport,
            media,
            cancel: CancellationToken::new(),
            tasks: JoinSet::new(),
            report: ShutdownReport::default(),
        }
    }

    pub fn worker_id(&self) -> &WorkerId {
        self.registry.worker_id()
    }

    /// Cancelling this token shuts the worker down.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn actors(&self) -> Arc<ActorRegistry> {
        self.actors.clone()
    }

    pub fn fanout_stats(&self) -> Arc<FanoutStats> {
        self.fanout.stats()
    }

    /// Run until the cancellation token fires.
    pub async fn run(mut self) -> Result<ShutdownReport> {
        info!(
            worker_id = %self.worker_id(),
            namespace = %self.keys.namespace(),
            backend = self.store.backend(),
            "Worker starting"
        );

        let fanout_task = self.fanout.clone().spawn(self.cancel.clone()).await?;
        self.recover().await;
        self.claim_loop().await;
        Ok(self.shutdown(fanout_task).await)
    }

    /// Re-attach to channels this worker id still holds from a previous run.
    async fn recover(&mut self) {
        let owned = match self.registry.owned_channels().await {
            Ok(owned) => owned,
            Err(e) => {
                warn!(error = %e, "Failed to look up previously owned channels");
                return;
            }
        };
        if owned.is_empty() {
            return;
        }

        info!(count = owned.len(), "Recovering previously owned channels");
        for claim in owned {
            self.accept(claim).await;
        }
    }

    async fn claim_loop(&mut self) {
        while !self.cancel.is_cancelled() {
            // A crashed actor re-offers its channel; do not grab it right back.
            if self.reap_finished() > 0 {
                self.cooldown().await;
                continue;
            }

            let attempt = self
                .registry
                .try_claim(Some(CLAIM_POLL_INTERVAL), &self.cancel)
                .await;
            match attempt {
                Ok(ClaimAttempt::Claimed(claim)) => {
                    if self.cancel.is_cancelled() {
                        self.refuse(&claim.channel_id, "worker is shutting down").await;
                        break;
                    }
                    if !self.accept(claim).await {
                        self.cooldown().await;
                    }
                }
                Ok(ClaimAttempt::Contended(channel_id)) => {
                    debug!(channel_id = %channel_id, "Lost claim race");
                }
                Ok(ClaimAttempt::Empty) => {}
                Err(e) => {
                    warn!(error = %e, "Claim attempt failed");
                    self.pause(self.config.actor.store_retry_delay()).await;
                }
            }
        }
    }

    /// Spawn an actor for `claim`, or give the channel back. Returns whether
    /// an actor was spawned.
    async fn accept(&mut self, claim: Claim) -> bool {
        let guild_id = match self.registry.guild_for(&claim.channel_id).await {
            Ok(Some(guild_id)) => guild_id,
            Ok(None) => {
                self.refuse(&claim.channel_id, "no guild recorded for channel").await;
                return false;
            }
            Err(e) => {
                warn!(channel_id = %claim.channel_id, error = %e, "Failed to read channel guild");
                self.refuse(&claim.channel_id, "guild lookup failed").await;
                return false;
            }
        };

        // One voice connection per guild per worker.
        if self.actors.guild_in_use(&guild_id) {
            self.refuse(&claim.channel_id, "guild already has an actor on this worker")
                .await;
            return false;
        }

        self.spawn_actor(claim, guild_id);
        true
    }

    fn spawn_actor(&mut self, claim: Claim, guild_id: String) {
        let channel_id = claim.channel_id.clone();
        let actor_id = claim.actor_id.clone();
        let recovered = claim.recovered;

        let actor = PlaybackActor::new(ActorContext {
            claim,
            guild_id,
            config: self.config.actor.clone(),
            store: self.store.clone(),
            registry: self.registry.clone(),
            media: self.media.clone(),
            cancel: self.cancel.child_token(),
        });
        self.actors.insert(ActorHandle::new(actor.clone(), recovered));

        info!(channel_id = %channel_id, actor_id = %actor_id, recovered, "Spawning playback actor");

        let actors = self.actors.clone();
        let transport = self.transport.clone();
        self.tasks.spawn(async move {
            let result = actor.run(transport).await;
            actors.remove_if_actor(&channel_id, &actor_id);
            ActorTaskResult::new(channel_id, actor_id, result)
        });
    }

    async fn refuse(&self, channel_id: &str, reason: &str) {
        warn!(channel_id = %channel_id, reason, "Refusing claimed channel");
        if let Err(e) = self.registry.release(channel_id, Requeue::Always).await {
            error!(channel_id = %channel_id, error = %e, "Failed to give back refused channel");
        }
    }

    async fn cooldown(&self) {
        self.pause(self.config.claim_cooldown()).await;
    }

    async fn pause(&self, duration: Duration) {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {}
            _ = tokio::time::sleep(duration) => {}
        }
    }

    /// Record finished actors. Returns how many crashed.
    fn reap_finished(&mut self) -> usize {
        let failed_before = self.report.actors_failed;
        while let Some(joined) = self.tasks.try_join_next() {
            self.record(joined);
        }
        self.report.actors_failed - failed_before
    }

    fn record(&mut self, joined: std::result::Result<ActorTaskResult, JoinError>) {
        match joined {
            Ok(result) if result.is_crash() => {
                self.report.actors_failed += 1;
                error!(
                    channel_id = %result.channel_id,
                    actor_id = %result.actor_id,
                    error = result.error_message().unwrap_or(""),
                    "Playback actor failed"
                );
            }
            Ok(result) => {
                self.report.actors_stopped += 1;
                debug!(
                    channel_id = %result.channel_id,
                    actor_id = %result.actor_id,
                    outcome = ?result.outcome,
                    "Playback actor finished"
                );
            }
            Err(e) if e.is_cancelled() => {
                self.report.actors_aborted += 1;
            }
            Err(e) => {
                self.report.actors_failed += 1;
                error!(error = %e, "Playback actor panicked");
            }
        }
    }

    async fn shutdown(mut self, fanout_task: JoinHandle<()>) -> ShutdownReport {
        info!(actors = self.actors.len(), "Worker shutting down");
        self.cancel.cancel();

        let deadline = self.config.shutdown_timeout();
        let drained = tokio::time::timeout(deadline, async {
            while let Some(joined) = self.tasks.join_next().await {
                self.record(joined);
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                remaining = self.tasks.len(),
                ?deadline,
                "Actors did not stop in time, aborting; their channels stay claimed until this worker id restarts"
            );
            self.tasks.abort_all();
            while let Some(joined) = self.tasks.join_next().await {
                self.record(joined);
            }
        }

        if let Err(e) = fanout_task.await {
            warn!(error = %e, "Event fanout task ended abnormally");
        }

        self.report.fanout = self.fanout.stats().snapshot();
        info!(
            stopped = self.report.actors_stopped,
            failed = self.report.actors_failed,
            aborted = self.report.actors_aborted,
            "Worker stopped"
        );
        self.report
    }
}
