mod cli;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use jukebox::config::{ActorConfig, LoggingSettings, WorkerConfig};
use jukebox::events::ControlEvent;
use jukebox::logging;
use jukebox::producer::Producer;
use jukebox::retry::RetryPolicy;
use jukebox::store::{self, StoreKeys};
use jukebox::track::Track;
use jukebox::transport::{SimulatedMediaSource, SimulatedTransport};
use jukebox::worker::Worker;

use crate::cli::{Args, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let args = Args::parse();
    let log_settings = LoggingSettings {
        filter: args.log_filter.clone(),
        json: args.log_json,
        log_dir: args.log_dir.clone(),
    };
    let _guard = logging::init_logging(&log_settings)?;

    if args.store_url.starts_with("memory:") {
        warn!("Using the in-memory store; nothing is shared with other processes");
    }

    match args.command {
        Commands::Worker {
            worker_id,
            idle_timeout_ms,
            fetch_attempts,
            claim_cooldown_ms,
            shutdown_timeout_ms,
            track_duration_ms,
        } => {
            let config = WorkerConfig {
                store_url: args.store_url,
                worker_id,
                namespace: args.namespace,
                actor: ActorConfig {
                    idle_timeout_ms,
                    fetch_retry: RetryPolicy::with_max_attempts(fetch_attempts),
                    ..Default::default()
                },
                claim_cooldown_ms,
                shutdown_timeout_ms,
                logging: log_settings,
            };
            run_worker(config, Duration::from_millis(track_duration_ms)).await
        }
        Commands::Enqueue {
            channel_id,
            guild_id,
            track_id,
            title,
            correlation_id,
            play_next,
        } => {
            let producer = connect_producer(&args.store_url, &args.namespace).await?;
            let title = title.unwrap_or_else(|| track_id.clone());
            let mut track = Track::new(track_id, title);
            if let Some(correlation_id) = correlation_id {
                track = track.with_correlation(correlation_id);
            }

            let response = producer
                .enqueue_job(&channel_id, &guild_id, track, play_next)
                .await?;
            if let Some(e) = response.error {
                return Err(e).context("failed to enqueue track");
            }
            println!(
                "queued {} in {} (position {})",
                response.ref_id,
                channel_id,
                response.ref_position.unwrap_or_default()
            );
            Ok(())
        }
        Commands::Control {
            kind,
            channel_id,
            correlation_id,
        } => {
            let producer = connect_producer(&args.store_url, &args.namespace).await?;
            let mut event = ControlEvent::new(kind, channel_id);
            if let Some(correlation_id) = correlation_id {
                event = event.with_correlation(correlation_id);
            }
            producer.publish_control_event(&event).await?;
            println!("published {} for {}", event.kind, event.channel_id);
            Ok(())
        }
        Commands::Status => {
            let producer = connect_producer(&args.store_url, &args.namespace).await?;
            let status = producer.status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
        Commands::Feedback { max } => {
            let producer = connect_producer(&args.store_url, &args.namespace).await?;
            for feedback in producer.drain_feedback(max).await {
                println!(
                    "[{}] {}: {}",
                    feedback.channel_id, feedback.correlation_id, feedback.content
                );
            }
            Ok(())
        }
    }
}

async fn connect_producer(store_url: &str, namespace: &str) -> anyhow::Result<Producer> {
    let store = store::connect(store_url)
        .await
        .with_context(|| format!("failed to open store {store_url}"))?;
    Ok(Producer::new(store, StoreKeys::new(namespace)))
}

async fn run_worker(config: WorkerConfig, track_duration: Duration) -> anyhow::Result<()> {
    config.validate()?;

    let store = store::connect(&config.store_url)
        .await
        .with_context(|| format!("failed to open store {}", config.store_url))?;
    let transport = Arc::new(SimulatedTransport::new());
    let media = Arc::new(SimulatedMediaSource::new().with_track_duration(track_duration));

    let worker = Worker::new(config, store, transport, media);
    let cancel = worker.cancellation_token();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C, shutting down");
                cancel.cancel();
            }
            Err(e) => warn!(error = %e, "Failed to listen for Ctrl+C"),
        }
    });

    let report = worker.run().await?;
    info!(
        stopped = report.actors_stopped,
        failed = report.actors_failed,
        aborted = report.actors_aborted,
        "Worker exited"
    );
    Ok(())
}
