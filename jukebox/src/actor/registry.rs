//! Actors running on this worker, keyed by channel.

use dashmap::DashMap;

use super::handle::ActorHandle;
use super::state::ActorSnapshot;
use super::{ActorOutcome, ActorResult};

/// Result of an actor task completion.
#[derive(Debug)]
pub struct ActorTaskResult {
    pub channel_id: String,
    pub actor_id: String,
    /// The outcome of the actor's run.
    pub outcome: Result<ActorOutcome, String>,
}

impl ActorTaskResult {
    pub fn new(
        channel_id: impl Into<String>,
        actor_id: impl Into<String>,
        outcome: ActorResult,
    ) -> Self {
        Self {
            channel_id: channel_id.into(),
            actor_id: actor_id.into(),
            outcome: outcome.map_err(|e| e.to_string()),
        }
    }

    /// Check if the actor crashed.
    pub fn is_crash(&self) -> bool {
        self.outcome.is_err()
    }

    /// Get the error message if this was a crash.
    pub fn error_message(&self) -> Option<&str> {
        match &self.outcome {
            Err(e) => Some(e.as_str()),
            _ => None,
        }
    }
}

/// Registry of live actor handles.
///
/// Shared between the worker, which inserts and removes entries, and the
/// event fanout, which looks them up.
#[derive(Debug, Default)]
pub struct ActorRegistry {
    actors: DashMap<String, ActorHandle>,
}

impl ActorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handle`, replacing any previous actor for the channel.
    pub fn insert(&self, handle: ActorHandle) -> Option<ActorHandle> {
        self.actors.insert(handle.channel_id().to_string(), handle)
    }

    pub fn get(&self, channel_id: &str) -> Option<ActorHandle> {
        self.actors.get(channel_id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, channel_id: &str) -> bool {
        self.actors.contains_key(channel_id)
    }

    /// Remove the channel's entry only if it still belongs to `actor_id`.
    ///
    /// A channel released by one actor may already be claimed again by a
    /// newer actor on this worker; that entry must survive.
    pub fn remove_if_actor(&self, channel_id: &str, actor_id: &str) -> bool {
        self.actors
            .remove_if(channel_id, |_, handle| handle.actor_id() == actor_id)
            .is_some()
    }

    /// Whether some live actor is playing in `guild_id`.
    pub fn guild_in_use(&self, guild_id: &str) -> bool {
        self.actors
            .iter()
            .any(|entry| entry.value().guild_id() == guild_id)
    }

    pub fn len(&self) -> usize {
        self.actors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actors.is_empty()
    }

    /// Channel ids, sorted.
    pub fn channel_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.actors.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn handles(&self) -> Vec<ActorHandle> {
        self.actors.iter().map(|e| e.value().clone()).collect()
    }

    pub fn snapshots(&self) -> Vec<ActorSnapshot> {
        let mut snapshots: Vec<ActorSnapshot> = self.handles().iter().map(|h| h.snapshot()).collect();
        snapshots.sort_by(|a, b| a.channel_id.cmp(&b.channel_id));
        snapshots
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::ActorError;

    #[test]
    fn test_task_result_crash() {
        let ok = ActorTaskResult::new("c1", "a1", Ok(ActorOutcome::Drained));
        assert!(!ok.is_crash());
        assert_eq!(ok.error_message(), None);

        let failed = ActorTaskResult::new("c1", "a1", Err(ActorError::fatal("join failed")));
        assert!(failed.is_crash());
        assert_eq!(failed.error_message(), Some("join failed"));
    }

    #[test]
    fn test_empty_registry() {
        let registry = ActorRegistry::new();
        assert!(registry.is_empty());
        assert!(!registry.contains("c1"));
        assert!(!registry.guild_in_use("g1"));
        assert!(!registry.remove_if_actor("c1", "a1"));
        assert!(registry.channel_ids().is_empty());
    }
}
