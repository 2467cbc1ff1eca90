//! Single-worker drain loop: read past the watermark, deliver, commit.

use crate::checkpoint::Watermark;
use crate::config::RetryPolicy;
use crate::error::{SinkError, SyncError};
use crate::metrics::{
    DELIVERY_FAILURES_TOTAL, DELIVERY_RETRIES_TOTAL, RECORDS_DELIVERED_TOTAL,
    REMOTE_CALL_DURATION,
};
use crate::sink::{DeliveryClient, RemoteEntry};
use crate::tracker::{DeliveryTracker, PendingBatch};
use crate::watcher::ChangeSignal;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::{interval_at, sleep, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What a single drain cycle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Nothing past the watermark.
    Idle,
    /// Only blank or malformed lines; the watermark moved without a remote call.
    Skipped { lines: usize },
    /// Every record was already present remotely, e.g. after a lost acknowledgement.
    Reconciled { records: usize, has_more: bool },
    Delivered {
        records: usize,
        skipped: usize,
        has_more: bool,
    },
}

impl DrainOutcome {
    pub fn has_more(&self) -> bool {
        match self {
            DrainOutcome::Reconciled { has_more, .. } | DrainOutcome::Delivered { has_more, .. } => {
                *has_more
            }
            DrainOutcome::Idle | DrainOutcome::Skipped { .. } => false,
        }
    }
}

pub struct SyncPipeline {
    tracker: DeliveryTracker,
    client: Arc<dyn DeliveryClient>,
    retry_policy: RetryPolicy,
    timeout: Duration,
    cancel_token: CancellationToken,
    resync_interval: Option<Duration>,
}

impl SyncPipeline {
    pub fn new(
        tracker: DeliveryTracker,
        client: Arc<dyn DeliveryClient>,
        retry_policy: RetryPolicy,
        timeout: Duration,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            tracker,
            client,
            retry_policy,
            timeout,
            cancel_token,
            resync_interval: None,
        }
    }

    /// Also drain every `interval`, independent of change notifications.
    pub fn with_resync_interval(mut self, interval: Option<Duration>) -> Self {
        self.resync_interval = interval.filter(|d| !d.is_zero());
        self
    }

    pub fn watermark(&self) -> Watermark {
        self.tracker.watermark()
    }

    /// Run one drain cycle.
    pub async fn drain_once(&mut self) -> Result<DrainOutcome, SyncError> {
        let batch = self
            .tracker
            .records_pending()
            .await
            .map_err(SyncError::Persistence)?;

        if batch.is_empty() {
            if !batch.advances() {
                return Ok(DrainOutcome::Idle);
            }
            self.commit(&batch).await?;
            debug!(
                path = %self.tracker.log_path().display(),
                to = %batch.to,
                skipped = batch.skipped,
                "advanced watermark past unusable lines"
            );
            return Ok(DrainOutcome::Skipped {
                lines: (batch.to.line_count - batch.from.line_count) as usize,
            });
        }

        let stamps: Vec<i64> = batch.records.iter().map(|r| r.timestamp_ms).collect();
        let entries: Vec<RemoteEntry> = batch
            .records
            .iter()
            .map(|record| self.client.encode(record))
            .collect();

        let delivered = self.deliver_batch(&batch, stamps, entries).await?;
        self.commit(&batch).await?;

        if delivered == 0 {
            info!(
                path = %self.tracker.log_path().display(),
                from = %batch.from,
                to = %batch.to,
                records = batch.records.len(),
                "records already present remotely"
            );
            return Ok(DrainOutcome::Reconciled {
                records: batch.records.len(),
                has_more: batch.has_more,
            });
        }

        RECORDS_DELIVERED_TOTAL.inc_by(delivered as u64);
        info!(
            path = %self.tracker.log_path().display(),
            sink = self.client.name(),
            from = %batch.from,
            to = %batch.to,
            records = delivered,
            skipped = batch.skipped,
            "delivered records"
        );

        Ok(DrainOutcome::Delivered {
            records: delivered,
            skipped: batch.skipped,
            has_more: batch.has_more,
        })
    }

    /// Drain until no complete line remains past the watermark.
    pub async fn drain_until_caught_up(&mut self) -> Result<Vec<DrainOutcome>, SyncError> {
        let mut outcomes = Vec::new();
        loop {
            let outcome = self.drain_once().await?;
            outcomes.push(outcome);
            if !outcome.has_more() || self.cancel_token.is_cancelled() {
                return Ok(outcomes);
            }
        }
    }

    /// Worker loop. Catches up once at startup, then drains on every change signal and resync
    /// tick until cancelled.
    pub async fn run(mut self, signal: Arc<ChangeSignal>) {
        info!(
            path = %self.tracker.log_path().display(),
            sink = self.client.name(),
            watermark = %self.tracker.watermark(),
            "sync pipeline started"
        );

        signal.begin();
        self.drain_logged().await;
        signal.finish();

        let mut resync = self.resync_interval.map(|period| {
            let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker
        });

        loop {
            tokio::select! {
                biased;
                _ = self.cancel_token.cancelled() => break,
                woke = signal.wait() => {
                    if !woke {
                        break;
                    }
                }
                _ = next_tick(&mut resync) => {
                    debug!("periodic resync");
                    signal.begin();
                }
            }
            self.drain_logged().await;
            signal.finish();
        }

        info!(
            path = %self.tracker.log_path().display(),
            watermark = %self.tracker.watermark(),
            "sync pipeline stopped"
        );
    }

    async fn drain_logged(&mut self) {
        match self.drain_until_caught_up().await {
            Ok(_) => {}
            Err(SyncError::Cancelled) => {
                info!("drain interrupted by shutdown");
            }
            // already logged with its watermark range when retries ran out
            Err(SyncError::DeliveryFailed { .. }) => {}
            Err(err) => {
                error!(
                    path = %self.tracker.log_path().display(),
                    error = %err,
                    "drain cycle failed"
                );
            }
        }
    }

    async fn commit(&mut self, batch: &PendingBatch) -> Result<(), SyncError> {
        self.tracker
            .commit(batch.to)
            .await
            .map(|_| ())
            .map_err(SyncError::Persistence)
    }

    /// Deliver `entries` with bounded exponential backoff. Returns how many were sent.
    ///
    /// A failed attempt may still have reached the sink, so every attempt after a failure (and
    /// the first one for a replayed batch) reconciles against `fetch_state` and drops entries
    /// whose timestamps are already present.
    async fn deliver_batch(
        &self,
        batch: &PendingBatch,
        mut stamps: Vec<i64>,
        mut entries: Vec<RemoteEntry>,
    ) -> Result<usize, SyncError> {
        let client = self.client.clone();
        let max_attempts = self.retry_policy.max_attempts.max(1);
        let mut reconcile = batch.replayed;
        let mut attempt = 0usize;

        loop {
            attempt += 1;
            let result = async {
                if reconcile {
                    let snapshot = self
                        .attempt("fetch_state", client.fetch_state())
                        .await
                        .map_err(|err| ("fetch_state", err))?;
                    let present = snapshot.timestamps(client.as_ref());
                    let before = entries.len();
                    (stamps, entries) = std::mem::take(&mut stamps)
                        .into_iter()
                        .zip(std::mem::take(&mut entries))
                        .filter(|(stamp, _)| !present.contains(stamp))
                        .unzip();
                    reconcile = false;
                    debug!(
                        remaining = entries.len(),
                        already_present = before - entries.len(),
                        "reconciled batch against remote state"
                    );
                    if entries.is_empty() {
                        return Ok(());
                    }
                }
                self.attempt("deliver", client.deliver(&entries))
                    .await
                    .map_err(|err| ("deliver", err))
            }
            .await;

            let (operation, err) = match result {
                Ok(()) => return Ok(entries.len()),
                Err(failure) => failure,
            };
            reconcile = true;

            if attempt >= max_attempts {
                DELIVERY_FAILURES_TOTAL.inc();
                error!(
                    sink = self.client.name(),
                    operation,
                    from = %batch.from,
                    to = %batch.to,
                    attempts = attempt,
                    error = %err,
                    "remote call failed; watermark not advanced"
                );
                return Err(SyncError::DeliveryFailed {
                    from: batch.from,
                    to: batch.to,
                    attempts: attempt,
                    source: err,
                });
            }

            let backoff = self.retry_policy.backoff(attempt);
            DELIVERY_RETRIES_TOTAL.inc();
            warn!(
                sink = self.client.name(),
                operation,
                attempt,
                max_attempts,
                backoff_ms = backoff.as_millis() as u64,
                error = %err,
                "remote call failed; retrying with backoff"
            );

            tokio::select! {
                biased;
                _ = self.cancel_token.cancelled() => return Err(SyncError::Cancelled),
                _ = sleep(backoff) => {}
            }
        }
    }

    /// One remote call bounded by the per-attempt timeout.
    async fn attempt<T>(
        &self,
        operation: &'static str,
        call: impl Future<Output = Result<T, SinkError>>,
    ) -> Result<T, SinkError> {
        let started = Instant::now();
        let result = match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(SinkError::Timeout(self.timeout)),
        };
        let status = match &result {
            Ok(_) => "ok",
            Err(SinkError::Timeout(_)) => "timeout",
            Err(_) => "error",
        };
        REMOTE_CALL_DURATION
            .with_label_values(&[operation, status])
            .observe(started.elapsed().as_secs_f64());
        result
    }
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
