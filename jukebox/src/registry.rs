//! Cross-process channel ownership.
//!
//! The free list is a queue of *intents to own*; the claimed set holds the
//! *current owners*. A worker claims a channel by popping it off the free
//! list and adding it to the claimed set. Only the worker whose add reports
//! "newly inserted" proceeds; any other racer drops the channel silently.
//!
//! At claim time the winner also writes an owner marker naming its
//! [`WorkerId`], so a restarted worker with the same id can re-attach to
//! channels it still holds instead of leaving them orphaned.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::store::{ChannelOffer, Store, StoreError, StoreKeys};

/// Error type for registry operations.
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("owner marker error: {0}")]
    Marker(#[from] serde_json::Error),
}

impl RegistryError {
    pub fn is_transient(&self) -> bool {
        match self {
            RegistryError::Store(e) => e.is_transient(),
            RegistryError::Marker(_) => false,
        }
    }
}

/// Stable identity of a worker process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// A random id. Channels claimed under it cannot be recovered after a restart.
    pub fn generate() -> Self {
        let id = Uuid::new_v4().simple().to_string();
        Self(format!("worker-{}", &id[..12]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Marker written next to a claimed channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerMarker {
    pub worker_id: WorkerId,
    pub actor_id: String,
    pub claimed_at: DateTime<Utc>,
}

/// A channel this worker now owns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub channel_id: String,
    pub actor_id: String,
    pub claimed_at: DateTime<Utc>,
    /// Re-attached from a previous run rather than popped off the free list.
    pub recovered: bool,
}

/// Result of one claim attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimAttempt {
    Claimed(Claim),
    /// Popped a channel someone else already owns; nothing to do.
    Contended(String),
    /// Nothing to claim before the timeout or cancellation.
    Empty,
}

/// What `release` does with the free list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Requeue {
    /// Offer the channel again only if its queue still holds jobs.
    #[default]
    IfBacklog,
    /// Always offer it again (the channel was refused, not finished).
    Always,
}

/// Claims, releases and offers channels through the shared store.
#[derive(Clone)]
pub struct ChannelRegistry {
    store: Arc<dyn Store>,
    keys: StoreKeys,
    worker_id: WorkerId,
}

impl ChannelRegistry {
    pub fn new(store: Arc<dyn Store>, keys: StoreKeys, worker_id: WorkerId) -> Self {
        Self {
            store,
            keys,
            worker_id,
        }
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    pub fn keys(&self) -> &StoreKeys {
        &self.keys
    }

    /// Pop one channel off the free list and try to own it.
    ///
    /// `timeout = None` waits until a channel is offered or `cancel` fires.
    pub async fn try_claim(
        &self,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<ClaimAttempt, RegistryError> {
        let popped = self
            .store
            .pop_tail_blocking(&self.keys.free_channels(), timeout, cancel)
            .await?;
        let Some(channel_id) = popped else {
            return Ok(ClaimAttempt::Empty);
        };

        if !self
            .store
            .set_add(&self.keys.claimed_channels(), &channel_id)
            .await?
        {
            debug!(channel_id = %channel_id, worker_id = %self.worker_id, "Channel already claimed");
            return Ok(ClaimAttempt::Contended(channel_id));
        }

        let claim = Claim {
            channel_id,
            actor_id: Uuid::new_v4().to_string(),
            claimed_at: Utc::now(),
            recovered: false,
        };

        if let Err(e) = self.write_marker(&claim).await {
            warn!(channel_id = %claim.channel_id, error = %e, "Failed to write owner marker, giving the channel back");
            self.give_back(&claim.channel_id).await;
            return Err(e);
        }

        info!(channel_id = %claim.channel_id, worker_id = %self.worker_id, "Channel claimed");
        Ok(ClaimAttempt::Claimed(claim))
    }

    /// Keep trying until a channel is claimed. `None` once `cancel` fires.
    pub async fn claim_next(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<Claim>, RegistryError> {
        loop {
            match self.try_claim(None, cancel).await? {
                ClaimAttempt::Claimed(claim) => return Ok(Some(claim)),
                ClaimAttempt::Contended(_) => continue,
                ClaimAttempt::Empty => {
                    if cancel.is_cancelled() {
                        return Ok(None);
                    }
                }
            }
        }
    }

    /// Give up ownership. Returns whether the channel went back on the free list.
    pub async fn release(&self, channel_id: &str, requeue: Requeue) -> Result<bool, RegistryError> {
        self.store.delete(&self.keys.owner(channel_id)).await?;

        let backlog_key = match requeue {
            Requeue::IfBacklog => Some(self.keys.queue(channel_id)),
            Requeue::Always => None,
        };
        let offered = self
            .store
            .offer_channel(ChannelOffer {
                free_key: self.keys.free_channels(),
                claimed_key: self.keys.claimed_channels(),
                channel_id: channel_id.to_string(),
                unclaim: true,
                backlog_key,
            })
            .await?;

        info!(channel_id = %channel_id, worker_id = %self.worker_id, offered, "Channel released");
        Ok(offered)
    }

    /// Offer an unclaimed channel to the workers. No-op when the channel is
    /// already claimed or already waiting on the free list.
    pub async fn mark_free(&self, channel_id: &str) -> Result<bool, RegistryError> {
        let offered = self
            .store
            .offer_channel(ChannelOffer {
                free_key: self.keys.free_channels(),
                claimed_key: self.keys.claimed_channels(),
                channel_id: channel_id.to_string(),
                unclaim: false,
                backlog_key: None,
            })
            .await?;
        if offered {
            debug!(channel_id = %channel_id, "Channel offered to workers");
        }
        Ok(offered)
    }

    /// Claimed channels whose owner marker names this worker.
    ///
    /// Each one gets a fresh actor id written back to its marker.
    pub async fn owned_channels(&self) -> Result<Vec<Claim>, RegistryError> {
        let mut owned = Vec::new();
        for channel_id in self.store.set_members(&self.keys.claimed_channels()).await? {
            let Some(raw) = self.store.get(&self.keys.owner(&channel_id)).await? else {
                continue;
            };
            let marker: OwnerMarker = match serde_json::from_str(&raw) {
                Ok(marker) => marker,
                Err(e) => {
                    warn!(channel_id = %channel_id, error = %e, "Ignoring unreadable owner marker");
                    continue;
                }
            };
            if marker.worker_id != self.worker_id {
                continue;
            }

            let claim = Claim {
                channel_id,
                actor_id: Uuid::new_v4().to_string(),
                claimed_at: Utc::now(),
                recovered: true,
            };
            self.write_marker(&claim).await?;
            owned.push(claim);
        }
        Ok(owned)
    }

    pub async fn owner_of(&self, channel_id: &str) -> Result<Option<OwnerMarker>, RegistryError> {
        match self.store.get(&self.keys.owner(channel_id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn is_claimed(&self, channel_id: &str) -> Result<bool, RegistryError> {
        Ok(self
            .store
            .set_contains(&self.keys.claimed_channels(), channel_id)
            .await?)
    }

    /// Channels waiting for a worker, next to be claimed last.
    pub async fn free_channels(&self) -> Result<Vec<String>, RegistryError> {
        Ok(self.store.list_items(&self.keys.free_channels()).await?)
    }

    pub async fn claimed_channels(&self) -> Result<Vec<String>, RegistryError> {
        Ok(self.store.set_members(&self.keys.claimed_channels()).await?)
    }

    /// Record which guild a channel belongs to. The first write wins; returns
    /// whether this call wrote it.
    pub async fn set_guild(&self, channel_id: &str, guild_id: &str) -> Result<bool, RegistryError> {
        let written = self
            .store
            .put_if_absent(&self.keys.guild(channel_id), guild_id)
            .await?;
        if !written {
            if let Some(existing) = self.guild_for(channel_id).await? {
                if existing != guild_id {
                    warn!(
                        channel_id = %channel_id,
                        existing = %existing,
                        requested = %guild_id,
                        "Channel already mapped to another guild"
                    );
                }
            }
        }
        Ok(written)
    }

    pub async fn guild_for(&self, channel_id: &str) -> Result<Option<String>, RegistryError> {
        Ok(self.store.get(&self.keys.guild(channel_id)).await?)
    }

    async fn write_marker(&self, claim: &Claim) -> Result<(), RegistryError> {
        let marker = OwnerMarker {
            worker_id: self.worker_id.clone(),
            actor_id: claim.actor_id.clone(),
            claimed_at: claim.claimed_at,
        };
        let raw = serde_json::to_string(&marker)?;
        self.store.put(&self.keys.owner(&claim.channel_id), &raw).await?;
        Ok(())
    }

    async fn give_back(&self, channel_id: &str) {
        if let Err(e) = self.release(channel_id, Requeue::Always).await {
            warn!(channel_id = %channel_id, error = %e, "Failed to give back channel");
        }
    }
}
