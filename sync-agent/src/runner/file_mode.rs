//! Runs the agent against a local sample log.

use crate::checkpoint::{CheckpointDB, WatermarkStore};
use crate::config::Config;
use crate::pipeline::SyncPipeline;
use crate::runner::build_delivery_client;
use crate::tracker::DeliveryTracker;
use crate::watcher::{watch_file, ChangeSignal};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Run until Ctrl-C or until the watcher or pipeline stops on its own.
pub async fn run(config: &Config) -> Result<()> {
    info!("sync-agent starting");

    let cancel_token = CancellationToken::new();
    let log_path = config.log_path();
    let settings = config.sink_settings();

    let checkpoint_db =
        CheckpointDB::new(config.checkpoint_db_path()).context("failed to open checkpoint database")?;
    info!(path = %checkpoint_db.path().display(), "checkpoint database ready");
    let store: Arc<dyn WatermarkStore> = Arc::new(checkpoint_db);
    let tracker = DeliveryTracker::open(&log_path, store, config.log.max_batch_records).await?;
    let client = build_delivery_client(&settings)?;
    let pipeline = SyncPipeline::new(
        tracker,
        client,
        settings.retry_policy,
        settings.timeout,
        cancel_token.clone(),
    )
    .with_resync_interval(config.resync_interval());

    let signal = Arc::new(ChangeSignal::new());

    let mut watcher_handle = tokio::spawn({
        let log_path = log_path.clone();
        let signal = signal.clone();
        let cancel_token = cancel_token.clone();
        let mode = config.watcher.mode;
        let poll_interval = config.poll_interval();
        async move {
            if let Err(err) = watch_file(log_path, mode, poll_interval, signal, cancel_token).await
            {
                error!(error = %err, "file watcher exited unexpectedly");
            }
        }
    });
    let mut pipeline_handle = tokio::spawn(pipeline.run(signal.clone()));

    info!(path = %log_path.display(), "sync-agent started; awaiting log changes");

    let (shutdown_reason, watcher_done, pipeline_done) = tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(err) = result {
                error!(error = %err, "failed while waiting for shutdown signal");
            }
            info!("shutdown signal received");
            ("signal", false, false)
        }
        res = &mut watcher_handle => {
            log_early_exit("file watcher", res);
            ("watcher stopped", true, false)
        }
        res = &mut pipeline_handle => {
            log_early_exit("sync pipeline", res);
            ("pipeline stopped", false, true)
        }
    };

    info!(reason = shutdown_reason, "initiating shutdown");
    cancel_token.cancel();
    signal.close();

    if !pipeline_done {
        stop_task("sync pipeline", pipeline_handle).await;
    }
    if !watcher_done {
        stop_task("file watcher", watcher_handle).await;
    }

    Ok(())
}

fn log_early_exit(name: &str, result: Result<(), JoinError>) {
    match result {
        Ok(()) => warn!(task = name, "task stopped before shutdown was requested"),
        Err(err) => error!(task = name, error = %err, "task panicked"),
    }
}

async fn stop_task(name: &str, mut handle: JoinHandle<()>) {
    let timeout = sleep(SHUTDOWN_TIMEOUT);
    tokio::pin!(timeout);

    let result = tokio::select! {
        res = &mut handle => Some(res),
        _ = &mut timeout => None,
    };

    match result {
        Some(Ok(())) => info!(task = name, "task stopped"),
        Some(Err(err)) => {
            warn!(task = name, error = %err, "task exited with error during shutdown")
        }
        None => {
            warn!(task = name, "task did not stop within timeout; aborting");
            handle.abort();
        }
    }
}
