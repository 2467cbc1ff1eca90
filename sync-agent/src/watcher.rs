use crate::config::WatchMode;
use crate::metrics::CHANGE_NOTIFICATIONS_TOTAL;
use anyhow::{Context, Result};
use notify::{
    Config as NotifyConfig, Event, EventKind, PollWatcher, RecommendedWatcher, RecursiveMode,
    Watcher,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    Idle,
    NotifiedPending,
    Processing,
}

#[derive(Debug)]
struct SignalState {
    state: WatchState,
    rerun: bool,
    closed: bool,
}

/// Coalescing hand-off between the watcher and the single pipeline worker.
///
/// At most one notification is ever pending: bursts while idle collapse into one pass, and
/// bursts while processing collapse into exactly one follow-up pass.
#[derive(Debug)]
pub struct ChangeSignal {
    inner: Mutex<SignalState>,
    wake: Notify,
    coalesced: AtomicU64,
}

impl Default for ChangeSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeSignal {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SignalState {
                state: WatchState::Idle,
                rerun: false,
                closed: false,
            }),
            wake: Notify::new(),
            coalesced: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SignalState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record a change. Returns `true` when this call scheduled a new pass.
    pub fn notify(&self) -> bool {
        let mut guard = self.lock();
        match guard.state {
            WatchState::Idle => {
                guard.state = WatchState::NotifiedPending;
                drop(guard);
                self.wake.notify_one();
                true
            }
            WatchState::NotifiedPending => {
                self.coalesced.fetch_add(1, Ordering::Relaxed);
                false
            }
            WatchState::Processing => {
                if guard.rerun {
                    self.coalesced.fetch_add(1, Ordering::Relaxed);
                    false
                } else {
                    guard.rerun = true;
                    true
                }
            }
        }
    }

    /// Wait for a pending notification and move to `Processing`.
    ///
    /// Returns `false` once the signal is closed and nothing is pending.
    pub async fn wait(&self) -> bool {
        loop {
            {
                let mut guard = self.lock();
                if guard.state == WatchState::NotifiedPending {
                    guard.state = WatchState::Processing;
                    return true;
                }
                if guard.closed {
                    return false;
                }
            }
            self.wake.notified().await;
        }
    }

    /// Enter `Processing` without a notification, e.g. for a timer-driven pass.
    ///
    /// A pending notification is absorbed by this pass.
    pub fn begin(&self) {
        let mut guard = self.lock();
        guard.state = WatchState::Processing;
    }

    /// Leave `Processing`. Changes seen meanwhile leave one pass pending.
    pub fn finish(&self) {
        let mut guard = self.lock();
        if guard.rerun {
            guard.rerun = false;
            guard.state = WatchState::NotifiedPending;
            drop(guard);
            self.wake.notify_one();
        } else {
            guard.state = WatchState::Idle;
        }
    }

    pub fn close(&self) {
        self.lock().closed = true;
        self.wake.notify_one();
    }

    pub fn state(&self) -> WatchState {
        self.lock().state
    }

    /// Notifications merged into an already pending pass.
    pub fn coalesced(&self) -> u64 {
        self.coalesced.load(Ordering::Relaxed)
    }
}

/// Watch `log_path` until `cancel_token` fires, signalling every change to it.
///
/// The parent directory is watched so the log may be created after startup. In
/// [`WatchMode::Notify`] the platform watcher is used and, if it cannot be set up, the watcher
/// degrades to polling at `poll_interval`.
pub async fn watch_file(
    log_path: PathBuf,
    mode: WatchMode,
    poll_interval: Duration,
    signal: Arc<ChangeSignal>,
    cancel_token: CancellationToken,
) -> Result<()> {
    let (watch_dir, target) = resolve_target(&log_path)?;

    let _watcher: Box<dyn Watcher + Send> = match mode {
        WatchMode::Notify => {
            match start_notify_watcher(&watch_dir, &target, signal.clone()) {
                Ok(watcher) => {
                    info!(path = %target.display(), "file watcher started");
                    watcher
                }
                Err(err) => {
                    warn!(
                        error = %err,
                        path = %target.display(),
                        poll_interval_ms = poll_interval.as_millis() as u64,
                        "filesystem notifications unavailable; degrading to polling"
                    );
                    start_poll_watcher(&watch_dir, &target, poll_interval, signal.clone())?
                }
            }
        }
        WatchMode::Poll => {
            let watcher = start_poll_watcher(&watch_dir, &target, poll_interval, signal.clone())?;
            info!(
                path = %target.display(),
                poll_interval_ms = poll_interval.as_millis() as u64,
                "polling watcher started"
            );
            watcher
        }
    };

    cancel_token.cancelled().await;
    info!(path = %target.display(), "file watcher stopped");
    Ok(())
}

fn resolve_target(log_path: &Path) -> Result<(PathBuf, PathBuf)> {
    let file_name = log_path
        .file_name()
        .with_context(|| format!("log path {} has no file name", log_path.display()))?;
    let parent = log_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let watch_dir = parent
        .canonicalize()
        .with_context(|| format!("failed to resolve log directory {}", parent.display()))?;
    let target = watch_dir.join(file_name);
    Ok((watch_dir, target))
}

fn start_notify_watcher(
    watch_dir: &Path,
    target: &Path,
    signal: Arc<ChangeSignal>,
) -> Result<Box<dyn Watcher + Send>> {
    let target = target.to_path_buf();
    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<Event>| match res {
            Ok(event) => handle_event(&target, &signal, event),
            Err(err) => error!(error = %err, "file watcher error"),
        },
        NotifyConfig::default(),
    )
    .context("failed to create notify watcher")?;
    watcher
        .watch(watch_dir, RecursiveMode::NonRecursive)
        .with_context(|| format!("failed to watch {}", watch_dir.display()))?;
    Ok(Box::new(watcher))
}

fn start_poll_watcher(
    watch_dir: &Path,
    target: &Path,
    poll_interval: Duration,
    signal: Arc<ChangeSignal>,
) -> Result<Box<dyn Watcher + Send>> {
    let target = target.to_path_buf();
    let mut watcher = PollWatcher::new(
        move |res: notify::Result<Event>| match res {
            Ok(event) => handle_event(&target, &signal, event),
            Err(err) => error!(error = %err, "poll watcher error"),
        },
        NotifyConfig::default().with_poll_interval(poll_interval),
    )
    .context("failed to create poll watcher")?;
    watcher
        .watch(watch_dir, RecursiveMode::NonRecursive)
        .with_context(|| format!("failed to poll {}", watch_dir.display()))?;
    Ok(Box::new(watcher))
}

fn handle_event(target: &Path, signal: &ChangeSignal, event: Event) {
    match event.kind {
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Any => {}
        _ => return,
    }

    if !event.paths.iter().any(|path| path == target) {
        trace!(paths = ?event.paths, "ignoring event for unrelated path");
        CHANGE_NOTIFICATIONS_TOTAL
            .with_label_values(&["ignored"])
            .inc();
        return;
    }

    if signal.notify() {
        debug!(path = %target.display(), "detected log change");
        CHANGE_NOTIFICATIONS_TOTAL
            .with_label_values(&["signalled"])
            .inc();
    } else {
        CHANGE_NOTIFICATIONS_TOTAL
            .with_label_values(&["coalesced"])
            .inc();
    }
}
