use std::path::PathBuf;

use clap::{Parser, Subcommand};

use jukebox::config::DEFAULT_STORE_URL;
use jukebox::events::ControlKind;
use jukebox::store::DEFAULT_NAMESPACE;

#[derive(Parser, Debug)]
#[command(name = "jukebox")]
#[command(about = "Channel-claiming playback workers over a shared store")]
#[command(version)]
pub struct Args {
    /// Store URL: `sqlite:<path>` or `memory://`
    #[arg(long, global = true, env = "JUKEBOX_STORE_URL", default_value = DEFAULT_STORE_URL)]
    pub store_url: String,

    /// Key namespace shared by producers and workers
    #[arg(long, global = true, env = "JUKEBOX_NAMESPACE", default_value = DEFAULT_NAMESPACE)]
    pub namespace: String,

    /// Log filter directive (overrides RUST_LOG)
    #[arg(long, global = true, env = "JUKEBOX_LOG")]
    pub log_filter: Option<String>,

    /// Emit JSON log lines
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Also write daily log files to this directory
    #[arg(long, global = true, env = "JUKEBOX_LOG_DIR")]
    pub log_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a worker until interrupted
    Worker {
        /// Stable worker identity, needed to recover channels after a restart
        #[arg(long, env = "JUKEBOX_WORKER_ID")]
        worker_id: Option<String>,

        /// Release a channel after its queue stays empty this long
        #[arg(long, default_value_t = 30_000)]
        idle_timeout_ms: u64,

        /// Fetch attempts per track before skipping it
        #[arg(long, default_value_t = 3)]
        fetch_attempts: u32,

        /// Pause after refusing a claimed channel
        #[arg(long, default_value_t = 5_000)]
        claim_cooldown_ms: u64,

        /// How long shutdown waits for actors
        #[arg(long, default_value_t = 10_000)]
        shutdown_timeout_ms: u64,

        /// Playback length of every simulated track
        #[arg(long, default_value_t = 180_000)]
        track_duration_ms: u64,
    },

    /// Add a track to a channel's queue
    Enqueue {
        channel_id: String,
        guild_id: String,
        track_id: String,

        #[arg(long)]
        title: Option<String>,

        /// Requester reference that receives feedback
        #[arg(long)]
        correlation_id: Option<String>,

        /// Put the track at the front of the queue
        #[arg(long)]
        play_next: bool,
    },

    /// Publish a control event (stop, skip, pause, resume)
    Control {
        kind: ControlKind,
        channel_id: String,

        #[arg(long)]
        correlation_id: Option<String>,
    },

    /// Show free and claimed channels with their backlogs
    Status,

    /// Drain pending feedback messages
    Feedback {
        #[arg(long, default_value_t = 20)]
        max: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_flags() {
        let args = Args::try_parse_from([
            "jukebox",
            "--log-json",
            "worker",
            "--worker-id",
            "node-a",
            "--idle-timeout-ms",
            "500",
        ])
        .unwrap();

        assert!(args.log_json);
        match args.command {
            Commands::Worker {
                worker_id,
                idle_timeout_ms,
                fetch_attempts,
                ..
            } => {
                assert_eq!(worker_id.as_deref(), Some("node-a"));
                assert_eq!(idle_timeout_ms, 500);
                assert_eq!(fetch_attempts, 3);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_control_kind_is_parsed() {
        let args = Args::try_parse_from(["jukebox", "control", "Skip", "c1"]).unwrap();
        match args.command {
            Commands::Control {
                kind, channel_id, ..
            } => {
                assert_eq!(kind, ControlKind::Skip);
                assert_eq!(channel_id, "c1");
            }
            other => panic!("unexpected command: {other:?}"),
        }

        assert!(Args::try_parse_from(["jukebox", "control", "rewind", "c1"]).is_err());
    }

    #[test]
    fn test_enqueue_play_next() {
        let args =
            Args::try_parse_from(["jukebox", "enqueue", "c1", "g1", "t1", "--play-next"]).unwrap();
        let Commands::Enqueue {
            play_next, title, ..
        } = args.command
        else {
            panic!("expected enqueue");
        };
        assert!(play_next);
        assert!(title.is_none());
    }
}
