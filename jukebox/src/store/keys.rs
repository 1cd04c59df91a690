/// Default key namespace.
pub const DEFAULT_NAMESPACE: &str = "jukebox";

/// Derives every shared-store key from one namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreKeys {
    namespace: String,
}

impl StoreKeys {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// List of channels waiting for a worker.
    pub fn free_channels(&self) -> String {
        format!("{}:free-channels", self.namespace)
    }

    /// Set of channels owned by a live actor.
    pub fn claimed_channels(&self) -> String {
        format!("{}:claimed-channels", self.namespace)
    }

    /// Control event topic.
    pub fn channel_events(&self) -> String {
        format!("{}:channel-events", self.namespace)
    }

    /// Queue of user-visible notifications.
    pub fn feedback(&self) -> String {
        format!("{}:feedback", self.namespace)
    }

    pub fn queue(&self, channel_id: &str) -> String {
        format!("{}:channel:{}:queue", self.namespace, channel_id)
    }

    pub fn guild(&self, channel_id: &str) -> String {
        format!("{}:channel:{}:guild-id", self.namespace, channel_id)
    }

    pub fn owner(&self, channel_id: &str) -> String {
        format!("{}:channel:{}:owner", self.namespace, channel_id)
    }

    /// Record key of one queued job.
    pub fn record(queue_key: &str, ref_id: &str) -> String {
        format!("{}-entry:{}", queue_key, ref_id)
    }
}

impl Default for StoreKeys {
    fn default() -> Self {
        Self::new(DEFAULT_NAMESPACE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_layout() {
        let keys = StoreKeys::default();
        assert_eq!(keys.free_channels(), "jukebox:free-channels");
        assert_eq!(keys.claimed_channels(), "jukebox:claimed-channels");
        assert_eq!(keys.channel_events(), "jukebox:channel-events");
        assert_eq!(keys.queue("c1"), "jukebox:channel:c1:queue");
        assert_eq!(keys.guild("c1"), "jukebox:channel:c1:guild-id");
        assert_eq!(keys.owner("c1"), "jukebox:channel:c1:owner");
    }

    #[test]
    fn test_record_key_is_derived_from_queue_key() {
        let keys = StoreKeys::new("test");
        let queue = keys.queue("c9");
        assert_eq!(StoreKeys::record(&queue, "abc"), "test:channel:c9:queue-entry:abc");
    }
}
