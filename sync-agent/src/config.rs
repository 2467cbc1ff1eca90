use crate::sink::Credential;
use anyhow::Result;
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub log: LogConfig,
    #[serde(default)]
    pub watcher: WatcherConfig,
    pub sink: SinkConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogConfig {
    /// The append-only sample log to watch.
    pub path: String,
    #[serde(default = "default_max_batch_records")]
    pub max_batch_records: usize,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum WatchMode {
    /// Platform file notifications, degrading to polling if unavailable.
    #[default]
    Notify,
    /// Periodic metadata polling only.
    Poll,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WatcherConfig {
    #[serde(default)]
    pub mode: WatchMode,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Drain on a timer as well as on notifications; 0 disables.
    #[serde(default = "default_resync_interval_ms")]
    pub resync_interval_ms: u64,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            mode: WatchMode::default(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            resync_interval_ms: DEFAULT_RESYNC_INTERVAL_MS,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SinkKind {
    Spreadsheet,
    DocumentStore,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SinkConfig {
    pub kind: SinkKind,
    pub endpoint: String,
    /// Sheet name or A1 range; spreadsheet sinks only.
    #[serde(default)]
    pub range: Option<String>,
    #[serde(default)]
    pub credential: Credential,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CheckpointConfig {
    pub db_path: String,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct MetricsConfig {
    #[serde(default)]
    pub listen_addr: Option<SocketAddr>,
}

/// Bounded exponential backoff for remote calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based count of failures so far).
    pub fn backoff(&self, attempt: usize) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31) as u32;
        self.base_delay
            .max(Duration::from_millis(1))
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms.max(config.base_delay_ms)),
        }
    }
}

/// Everything needed to construct a delivery client.
#[derive(Debug, Clone)]
pub struct SinkSettings {
    pub kind: SinkKind,
    pub endpoint: String,
    pub range: Option<String>,
    pub credential: Credential,
    pub timeout: Duration,
    pub retry_policy: RetryPolicy,
}

const DEFAULT_MAX_BATCH_RECORDS: usize = 500;
const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;
const DEFAULT_RESYNC_INTERVAL_MS: u64 = 60_000;
const DEFAULT_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_MAX_ATTEMPTS: usize = 5;
const DEFAULT_BASE_DELAY_MS: u64 = 500;
const DEFAULT_MAX_DELAY_MS: u64 = 30_000;

fn default_max_batch_records() -> usize {
    DEFAULT_MAX_BATCH_RECORDS
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

fn default_resync_interval_ms() -> u64 {
    DEFAULT_RESYNC_INTERVAL_MS
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

fn default_max_attempts() -> usize {
    DEFAULT_MAX_ATTEMPTS
}

fn default_base_delay_ms() -> u64 {
    DEFAULT_BASE_DELAY_MS
}

fn default_max_delay_ms() -> u64 {
    DEFAULT_MAX_DELAY_MS
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path.as_ref())?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let config: Config = toml::from_str(raw)?;
        if config.log.path.trim().is_empty() {
            anyhow::bail!("log.path cannot be empty");
        }
        if config.sink.endpoint.trim().is_empty() {
            anyhow::bail!("sink.endpoint cannot be empty");
        }
        if config.sink.timeout_ms == 0 {
            anyhow::bail!("sink.timeout_ms must be greater than zero");
        }
        if config.watcher.poll_interval_ms == 0 {
            anyhow::bail!("watcher.poll_interval_ms must be greater than zero");
        }
        let has_range = config
            .sink
            .range
            .as_ref()
            .map(|s| !s.trim().is_empty())
            .unwrap_or(false);

        match (config.sink.kind, has_range) {
            (SinkKind::Spreadsheet, false) => {
                anyhow::bail!("spreadsheet sink requires sink.range")
            }
            (SinkKind::DocumentStore, true) => {
                anyhow::bail!("sink.range is only valid for spreadsheet sinks")
            }
            _ => {}
        }
        Ok(config)
    }

    pub fn log_path(&self) -> PathBuf {
        shellexpand::tilde(&self.log.path).into_owned().into()
    }

    pub fn checkpoint_db_path(&self) -> PathBuf {
        let expanded = shellexpand::tilde(&self.checkpoint.db_path);
        PathBuf::from(expanded.as_ref())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.watcher.poll_interval_ms)
    }

    pub fn resync_interval(&self) -> Option<Duration> {
        (self.watcher.resync_interval_ms > 0)
            .then(|| Duration::from_millis(self.watcher.resync_interval_ms))
    }

    pub fn sink_settings(&self) -> SinkSettings {
        SinkSettings {
            kind: self.sink.kind,
            endpoint: self.sink.endpoint.trim().to_string(),
            range: self.sink.range.clone(),
            credential: self.sink.credential.clone(),
            timeout: Duration::from_millis(self.sink.timeout_ms),
            retry_policy: RetryPolicy::from(&self.retry),
        }
    }
}
