//! Routes control events from the store's pub/sub topic to local actors.
//!
//! Every worker subscribes to the same topic and sees every event. Events
//! for channels owned elsewhere are dropped quietly.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::StreamExt;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::actor::ActorRegistry;
use crate::events::ControlEvent;
use crate::store::{Store, StoreError};

/// What happened to one control event on this worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryOutcome {
    /// Pushed into the owning actor's inbox.
    Delivered,
    /// No actor for the channel on this worker.
    NoActor,
    /// The actor exists but is not taking events.
    NotAccepting,
    /// The payload did not parse.
    Malformed,
}

/// Counters for routed events.
#[derive(Debug, Default)]
pub struct FanoutStats {
    delivered: AtomicU64,
    no_actor: AtomicU64,
    not_accepting: AtomicU64,
    malformed: AtomicU64,
}

/// Point-in-time copy of [`FanoutStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FanoutStatsSnapshot {
    pub delivered: u64,
    pub no_actor: u64,
    pub not_accepting: u64,
    pub malformed: u64,
}

impl FanoutStats {
    fn record(&self, outcome: DeliveryOutcome) {
        let counter = match outcome {
            DeliveryOutcome::Delivered => &self.delivered,
            DeliveryOutcome::NoActor => &self.no_actor,
            DeliveryOutcome::NotAccepting => &self.not_accepting,
            DeliveryOutcome::Malformed => &self.malformed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> FanoutStatsSnapshot {
        FanoutStatsSnapshot {
            delivered: self.delivered.load(Ordering::Relaxed),
            no_actor: self.no_actor.load(Ordering::Relaxed),
            not_accepting: self.not_accepting.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
        }
    }
}

/// Subscriber that hands control events to the actors of this worker.
#[derive(Clone)]
pub struct EventFanout {
    store: Arc<dyn Store>,
    topic: String,
    actors: Arc<ActorRegistry>,
    stats: Arc<FanoutStats>,
}

impl EventFanout {
    pub fn new(store: Arc<dyn Store>, topic: impl Into<String>, actors: Arc<ActorRegistry>) -> Self {
        Self {
            store,
            topic: topic.into(),
            actors,
            stats: Arc::new(FanoutStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<FanoutStats> {
        self.stats.clone()
    }

    /// Parse a raw payload and deliver it.
    pub fn route(&self, payload: &str) -> DeliveryOutcome {
        match ControlEvent::parse(payload) {
            Ok(event) => self.deliver(event),
            Err(e) => {
                warn!(error = %e, payload = %payload, "Dropping malformed control event");
                self.stats.record(DeliveryOutcome::Malformed);
                DeliveryOutcome::Malformed
            }
        }
    }

    pub fn deliver(&self, event: ControlEvent) -> DeliveryOutcome {
        let channel_id = event.channel_id.clone();
        let kind = event.kind;
        let outcome = match self.actors.get(&channel_id) {
            Some(handle) => handle.deliver(event),
            None => DeliveryOutcome::NoActor,
        };

        match outcome {
            DeliveryOutcome::Delivered => {
                debug!(channel_id = %channel_id, kind = %kind, "Control event delivered")
            }
            DeliveryOutcome::NotAccepting => {
                debug!(channel_id = %channel_id, kind = %kind, "Actor not accepting events, dropped")
            }
            _ => trace!(channel_id = %channel_id, kind = %kind, "No local actor for control event"),
        }
        self.stats.record(outcome);
        outcome
    }

    /// Subscribe and route events until `cancel` fires.
    ///
    /// The subscription is established before this returns, so events
    /// published afterwards are not missed.
    pub async fn spawn(self, cancel: CancellationToken) -> Result<JoinHandle<()>, StoreError> {
        let mut stream = self.store.subscribe(&self.topic).await?;
        info!(topic = %self.topic, "Subscribed to control events");

        Ok(tokio::spawn(async move {
            loop {
                let payload = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    payload = stream.next() => payload,
                };
                match payload {
                    Some(payload) => {
                        self.route(&payload);
                    }
                    None => {
                        warn!(topic = %self.topic, "Control event stream ended");
                        break;
                    }
                }
            }
            debug!(topic = %self.topic, "Event fanout stopped");
        }))
    }
}
