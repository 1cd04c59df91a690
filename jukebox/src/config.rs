//! Worker and actor configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::registry::WorkerId;
use crate::retry::RetryPolicy;
use crate::store::{DEFAULT_NAMESPACE, StoreKeys};
use crate::{Error, Result};

/// Default store URL.
pub const DEFAULT_STORE_URL: &str = "sqlite:jukebox.db";

/// Per-actor settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActorConfig {
    /// How long an actor waits on an empty queue before releasing its channel.
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// Retry policy for transient fetch failures.
    #[serde(default)]
    pub fetch_retry: RetryPolicy,
    /// Pause before retrying after a store error while pulling jobs.
    #[serde(default = "default_store_retry_delay_ms")]
    pub store_retry_delay_ms: u64,
}

fn default_idle_timeout_ms() -> u64 {
    30_000
}

fn default_store_retry_delay_ms() -> u64 {
    1_000
}

impl ActorConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn store_retry_delay(&self) -> Duration {
        Duration::from_millis(self.store_retry_delay_ms)
    }
}

impl Default for ActorConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: default_idle_timeout_ms(),
            fetch_retry: RetryPolicy::default(),
            store_retry_delay_ms: default_store_retry_delay_ms(),
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Filter directive; falls back to `RUST_LOG`, then the built-in default.
    #[serde(default)]
    pub filter: Option<String>,
    /// Emit JSON lines on the console.
    #[serde(default)]
    pub json: bool,
    /// Also write daily-rolling log files here.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

/// Settings for one worker process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_store_url")]
    pub store_url: String,
    /// Stable process identity used for crash recovery.
    #[serde(default)]
    pub worker_id: Option<String>,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default)]
    pub actor: ActorConfig,
    /// Pause after refusing a claimed channel, so the same worker does not
    /// immediately pop it again.
    #[serde(default = "default_claim_cooldown_ms")]
    pub claim_cooldown_ms: u64,
    /// How long shutdown waits for actors to release their channels.
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
    #[serde(default)]
    pub logging: LoggingSettings,
}

fn default_store_url() -> String {
    DEFAULT_STORE_URL.to_string()
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

fn default_claim_cooldown_ms() -> u64 {
    5_000
}

fn default_shutdown_timeout_ms() -> u64 {
    10_000
}

impl WorkerConfig {
    pub fn keys(&self) -> StoreKeys {
        StoreKeys::new(self.namespace.clone())
    }

    /// The configured worker id, or a random one with a warning.
    pub fn resolve_worker_id(&self) -> WorkerId {
        match self.worker_id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => WorkerId::new(id),
            _ => {
                let generated = WorkerId::generate();
                warn!(
                    worker_id = %generated,
                    "No worker id configured; channels held by this process cannot be recovered after a restart"
                );
                generated
            }
        }
    }

    pub fn claim_cooldown(&self) -> Duration {
        Duration::from_millis(self.claim_cooldown_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.namespace.trim().is_empty() {
            return Err(Error::config("namespace must not be empty"));
        }
        if !(self.store_url.starts_with("memory:") || self.store_url.starts_with("sqlite:")) {
            return Err(Error::config(format!(
                "unsupported store url '{}', expected memory:// or sqlite:<path>",
                self.store_url
            )));
        }
        if self.actor.idle_timeout_ms == 0 {
            return Err(Error::config("idle timeout must be greater than zero"));
        }
        if self.actor.fetch_retry.max_attempts == 0 {
            return Err(Error::config("fetch retry needs at least one attempt"));
        }
        Ok(())
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            store_url: default_store_url(),
            worker_id: None,
            namespace: default_namespace(),
            actor: ActorConfig::default(),
            claim_cooldown_ms: default_claim_cooldown_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            logging: LoggingSettings::default(),
        }
    }
}
