//! At-most-once bookkeeping for the sample log.
//!
//! The tracker reads everything past the committed watermark, validates it line by line and
//! stamps each record. Stamps are journaled before a batch is handed out so a replay (after a
//! failed delivery, a failed commit or a restart) yields identical remote entries.

use crate::checkpoint::{Watermark, WatermarkStore};
use crate::error::ParseError;
use crate::metrics::{
    CHECKPOINT_DURATION, CHECKPOINT_ERRORS_TOTAL, PARSE_ERRORS_TOTAL, RECORDS_DETECTED_TOTAL,
    WATERMARK_LINE,
};
use crate::parser::{line_preview, parse_line_bytes, LineChunker, Record};
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info, warn};

const MAX_READ_CHUNK_BYTES: usize = 1024 * 1024;
const LINE_PREVIEW_CHARS: usize = 120;

/// Records found past the watermark, ready for delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingBatch {
    pub from: Watermark,
    pub to: Watermark,
    pub records: Vec<Record>,
    /// Lines rejected by the parser inside `from..to`.
    pub skipped: usize,
    /// At least one record carries a stamp journaled by an earlier attempt.
    pub replayed: bool,
    /// More complete lines remain past `to`.
    pub has_more: bool,
}

impl PendingBatch {
    fn empty(at: Watermark) -> Self {
        Self {
            from: at,
            to: at,
            records: Vec::new(),
            skipped: 0,
            replayed: false,
            has_more: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn advances(&self) -> bool {
        self.to > self.from
    }
}

pub struct DeliveryTracker {
    log_path: PathBuf,
    store: Arc<dyn WatermarkStore>,
    watermark: Watermark,
    stamps: BTreeMap<u64, i64>,
    last_stamp: i64,
    max_batch_records: usize,
}

impl DeliveryTracker {
    /// Load the persisted watermark and stamp journal for `log_path`.
    pub async fn open(
        log_path: impl Into<PathBuf>,
        store: Arc<dyn WatermarkStore>,
        max_batch_records: usize,
    ) -> Result<Self> {
        let log_path = log_path.into();
        let watermark = store
            .load(&log_path)
            .await
            .with_context(|| format!("failed to load watermark for {}", log_path.display()))?;
        let mut stamps = store
            .load_stamps(&log_path)
            .await
            .with_context(|| format!("failed to load stamps for {}", log_path.display()))?;
        stamps.retain(|line_no, _| *line_no > watermark.line_count);
        let high_water = store
            .last_stamp(&log_path)
            .await
            .with_context(|| format!("failed to load last stamp for {}", log_path.display()))?;
        let last_stamp = stamps
            .values()
            .copied()
            .max()
            .unwrap_or_default()
            .max(high_water);

        WATERMARK_LINE.set(watermark.line_count as i64);
        info!(
            path = %log_path.display(),
            offset = watermark.byte_offset,
            line_count = watermark.line_count,
            journaled = stamps.len(),
            last_stamp,
            "delivery tracker resumed"
        );

        Ok(Self {
            log_path,
            store,
            watermark,
            stamps,
            last_stamp,
            max_batch_records: max_batch_records.max(1),
        })
    }

    pub fn watermark(&self) -> Watermark {
        self.watermark
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Everything past the watermark, parsed and stamped.
    ///
    /// Malformed lines are logged and skipped; the returned `to` watermark still moves past
    /// them. A partially written final line is left for a later call.
    pub async fn records_pending(&mut self) -> Result<PendingBatch> {
        let from = self.watermark;
        let file_size = match fs::metadata(&self.log_path).await {
            Ok(meta) => meta.len(),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!(path = %self.log_path.display(), "log file missing; nothing pending");
                return Ok(PendingBatch::empty(from));
            }
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("failed to stat log file {}", self.log_path.display())
                })
            }
        };

        if file_size < from.byte_offset {
            warn!(
                path = %self.log_path.display(),
                watermark_offset = from.byte_offset,
                current_size = file_size,
                "log file is shorter than the watermark; refusing to rewind"
            );
            return Ok(PendingBatch::empty(from));
        }
        if file_size == from.byte_offset {
            return Ok(PendingBatch::empty(from));
        }

        let mut batch = PendingBatch::empty(from);
        let mut fresh_stamps: Vec<(u64, i64)> = Vec::new();
        let mut chunker = LineChunker::new();
        let mut read_offset = from.byte_offset;
        let mut position = from;

        'read: while read_offset < file_size {
            let want = (file_size - read_offset).min(MAX_READ_CHUNK_BYTES as u64) as usize;
            let buffer = read_new_bytes(&self.log_path, read_offset, want).await?;
            if buffer.is_empty() {
                break;
            }
            read_offset += buffer.len() as u64;

            for line in chunker.push(&buffer) {
                if batch.records.len() >= self.max_batch_records {
                    batch.has_more = true;
                    break 'read;
                }

                let line_no = position.line_count + 1;
                position = Watermark::new(position.byte_offset + line.len() as u64 + 1, line_no);

                match parse_line_bytes(&line) {
                    Ok(Some(values)) => {
                        let timestamp_ms = match self.stamps.get(&line_no) {
                            Some(stamp) => {
                                batch.replayed = true;
                                *stamp
                            }
                            None => {
                                let stamp = self.next_stamp();
                                fresh_stamps.push((line_no, stamp));
                                stamp
                            }
                        };
                        batch.records.push(Record::new(values, line_no, timestamp_ms));
                    }
                    Ok(None) => {
                        debug!(path = %self.log_path.display(), line_no, "skipping blank line");
                    }
                    Err(err) => {
                        record_parse_error(&self.log_path, line_no, &line, &err);
                        batch.skipped += 1;
                    }
                }
            }
        }
        batch.to = position;

        if !fresh_stamps.is_empty() {
            let started = std::time::Instant::now();
            if let Err(err) = self
                .store
                .journal_stamps(&self.log_path, &fresh_stamps)
                .await
            {
                CHECKPOINT_ERRORS_TOTAL.with_label_values(&["journal"]).inc();
                return Err(err).context("failed to journal record stamps");
            }
            CHECKPOINT_DURATION
                .with_label_values(&["journal"])
                .observe(started.elapsed().as_secs_f64());
            self.stamps.extend(fresh_stamps);
        }

        RECORDS_DETECTED_TOTAL.inc_by(batch.records.len() as u64);
        debug!(
            path = %self.log_path.display(),
            from = %batch.from,
            to = %batch.to,
            records = batch.records.len(),
            skipped = batch.skipped,
            backlog = chunker.backlog_len(),
            replayed = batch.replayed,
            "scanned log tail"
        );

        Ok(batch)
    }

    /// Persist `watermark` once the caller has confirmed delivery of everything below it.
    ///
    /// Returns `false` without touching storage when `watermark` is not ahead of the current
    /// one. The in-memory watermark only moves after the store accepted the write.
    pub async fn commit(&mut self, watermark: Watermark) -> Result<bool> {
        if watermark <= self.watermark {
            debug!(
                path = %self.log_path.display(),
                current = %self.watermark,
                requested = %watermark,
                "ignoring stale watermark commit"
            );
            return Ok(false);
        }

        let started = std::time::Instant::now();
        if let Err(err) = self.store.save(&self.log_path, watermark).await {
            CHECKPOINT_ERRORS_TOTAL.with_label_values(&["commit"]).inc();
            return Err(err).with_context(|| format!("failed to persist watermark {watermark}"));
        }
        CHECKPOINT_DURATION
            .with_label_values(&["commit"])
            .observe(started.elapsed().as_secs_f64());

        self.watermark = watermark;
        self.stamps
            .retain(|line_no, _| *line_no > watermark.line_count);
        WATERMARK_LINE.set(watermark.line_count as i64);
        Ok(true)
    }

    fn next_stamp(&mut self) -> i64 {
        let stamp = current_millis().max(self.last_stamp + 1);
        self.last_stamp = stamp;
        stamp
    }
}

fn record_parse_error(path: &Path, line_no: u64, line: &[u8], err: &ParseError) {
    PARSE_ERRORS_TOTAL.with_label_values(&[err.kind()]).inc();
    warn!(
        path = %path.display(),
        line_no,
        error = %err,
        line = %line_preview(line, LINE_PREVIEW_CHARS),
        "skipping malformed log line"
    );
}

async fn read_new_bytes(path: &Path, offset: u64, max_bytes: usize) -> Result<Vec<u8>> {
    let mut file = fs::File::open(path)
        .await
        .with_context(|| format!("failed to open {}", path.display()))?;
    file.seek(std::io::SeekFrom::Start(offset))
        .await
        .with_context(|| format!("failed to seek {} to offset {}", path.display(), offset))?;

    let mut buffer = vec![0u8; max_bytes];
    let mut total_read = 0usize;
    while total_read < max_bytes {
        let bytes_read = file
            .read(&mut buffer[total_read..])
            .await
            .with_context(|| format!("failed to read from {}", path.display()))?;
        if bytes_read == 0 {
            break;
        }
        total_read += bytes_read;
    }
    buffer.truncate(total_read);
    Ok(buffer)
}

pub(crate) fn current_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::checkpoint::CheckpointDB;
    use std::io::Write;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Store wrapper whose writes can be switched off to simulate an unwritable disk.
    pub(crate) struct FlakyStore {
        pub inner: CheckpointDB,
        pub fail_saves: AtomicBool,
        pub fail_journal: AtomicBool,
    }

    impl FlakyStore {
        pub fn new(inner: CheckpointDB) -> Self {
            Self {
                inner,
                fail_saves: AtomicBool::new(false),
                fail_journal: AtomicBool::new(false),
            }
        }
    }

    #[async_trait::async_trait]
    impl WatermarkStore for FlakyStore {
        async fn load(&self, file_path: &Path) -> Result<Watermark> {
            self.inner.load(file_path).await
        }

        async fn save(&self, file_path: &Path, watermark: Watermark) -> Result<()> {
            if self.fail_saves.load(Ordering::SeqCst) {
                anyhow::bail!("checkpoint storage is read-only");
            }
            self.inner.save(file_path, watermark).await
        }

        async fn load_stamps(&self, file_path: &Path) -> Result<BTreeMap<u64, i64>> {
            self.inner.load_stamps(file_path).await
        }

        async fn journal_stamps(&self, file_path: &Path, stamps: &[(u64, i64)]) -> Result<()> {
            if self.fail_journal.load(Ordering::SeqCst) {
                anyhow::bail!("checkpoint storage is read-only");
            }
            self.inner.journal_stamps(file_path, stamps).await
        }

        async fn last_stamp(&self, file_path: &Path) -> Result<i64> {
            self.inner.last_stamp(file_path).await
        }
    }

    pub(crate) fn append(path: &Path, text: &str) {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        file.write_all(text.as_bytes()).unwrap();
    }

    async fn open_tracker(dir: &tempfile::TempDir) -> (PathBuf, Arc<FlakyStore>, DeliveryTracker) {
        let log = dir.path().join("numbers.txt");
        let store = Arc::new(FlakyStore::new(
            CheckpointDB::new(dir.path().join("checkpoints.db")).unwrap(),
        ));
        let tracker = DeliveryTracker::open(&log, store.clone(), 100).await.unwrap();
        (log, store, tracker)
    }

    #[tokio::test]
    async fn missing_log_has_nothing_pending() {
        let dir = tempfile::tempdir().unwrap();
        let (_log, _store, mut tracker) = open_tracker(&dir).await;

        let batch = tracker.records_pending().await.unwrap();
        assert!(batch.is_empty());
        assert!(!batch.advances());
    }

    #[tokio::test]
    async fn pending_records_follow_the_watermark() {
        let dir = tempfile::tempdir().unwrap();
        let (log, _store, mut tracker) = open_tracker(&dir).await;
        append(&log, "10,20,30,40,50,60,70\n");

        let batch = tracker.records_pending().await.unwrap();
        assert_eq!(batch.records.len(), 1);
        assert_eq!(batch.records[0].values, [10.0, 20.0, 30.0, 40.0, 50.0, 60.0, 70.0]);
        assert_eq!(batch.records[0].line_no, 1);
        assert_eq!(batch.to, Watermark::new(21, 1));
        assert!(tracker.commit(batch.to).await.unwrap());

        append(&log, "1,2,3,4,5,6,7\n");
        let batch = tracker.records_pending().await.unwrap();
        assert_eq!(batch.from, Watermark::new(21, 1));
        assert_eq!(batch.to, Watermark::new(35, 2));
        assert_eq!(batch.records[0].line_no, 2);
        assert!(!batch.replayed);
    }

    #[tokio::test]
    async fn malformed_and_blank_lines_advance_without_records() {
        let dir = tempfile::tempdir().unwrap();
        let (log, _store, mut tracker) = open_tracker(&dir).await;
        append(&log, "10,20,30\n\n1,2,x,4,5,6,7\n");

        let batch = tracker.records_pending().await.unwrap();
        assert!(batch.is_empty());
        assert_eq!(batch.skipped, 2);
        assert_eq!(batch.to, Watermark::new(24, 3));
        assert!(batch.advances());
    }

    #[tokio::test]
    async fn partial_trailing_line_waits_for_newline() {
        let dir = tempfile::tempdir().unwrap();
        let (log, _store, mut tracker) = open_tracker(&dir).await;
        append(&log, "1,2,3,4,5,6,7\n8,9,10");

        let batch = tracker.records_pending().await.unwrap();
        assert_eq!(batch.records.len(), 1);
        assert_eq!(batch.to, Watermark::new(14, 1));
        tracker.commit(batch.to).await.unwrap();

        append(&log, ",11,12,13,14\n");
        let batch = tracker.records_pending().await.unwrap();
        assert_eq!(batch.records.len(), 1);
        assert_eq!(batch.records[0].values[6], 14.0);
    }

    #[tokio::test]
    async fn stamps_are_strictly_increasing_and_reused_until_commit() {
        let dir = tempfile::tempdir().unwrap();
        let (log, _store, mut tracker) = open_tracker(&dir).await;
        append(&log, "1,1,1,1,1,1,1\n2,2,2,2,2,2,2\n3,3,3,3,3,3,3\n");

        let first = tracker.records_pending().await.unwrap();
        let stamps: Vec<i64> = first.records.iter().map(|r| r.timestamp_ms).collect();
        assert!(stamps.windows(2).all(|w| w[0] < w[1]));

        let replay = tracker.records_pending().await.unwrap();
        assert!(replay.replayed);
        assert_eq!(replay.records, first.records);
    }

    #[tokio::test]
    async fn stamps_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let (log, store, mut tracker) = open_tracker(&dir).await;
        append(&log, "1,2,3,4,5,6,7\n");
        let before = tracker.records_pending().await.unwrap();
        drop(tracker);

        let mut reopened = DeliveryTracker::open(&log, store.clone(), 100).await.unwrap();
        let after = reopened.records_pending().await.unwrap();
        assert!(after.replayed);
        assert_eq!(after.records, before.records);
    }

    #[tokio::test]
    async fn restart_after_commit_never_reuses_a_stamp() {
        let dir = tempfile::tempdir().unwrap();
        let (log, store, tracker) = open_tracker(&dir).await;
        drop(tracker);
        append(&log, "1,2,3,4,5,6,7\n");

        // a burst pushed the last stamp ahead of the clock, then the line was committed
        let ahead = current_millis() + 60_000;
        store.journal_stamps(&log, &[(1, ahead)]).await.unwrap();
        store.save(&log, Watermark::new(14, 1)).await.unwrap();

        let mut reopened = DeliveryTracker::open(&log, store.clone(), 100).await.unwrap();
        append(&log, "8,9,10,11,12,13,14\n");
        let batch = reopened.records_pending().await.unwrap();
        assert_eq!(batch.records.len(), 1);
        assert!(!batch.replayed);
        assert!(batch.records[0].timestamp_ms > ahead);
    }

    #[tokio::test]
    async fn commit_is_monotonic_and_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let (log, _store, mut tracker) = open_tracker(&dir).await;
        append(&log, "1,2,3,4,5,6,7\n");
        let batch = tracker.records_pending().await.unwrap();

        assert!(tracker.commit(batch.to).await.unwrap());
        assert!(!tracker.commit(batch.to).await.unwrap());
        assert!(!tracker.commit(Watermark::default()).await.unwrap());
        assert_eq!(tracker.watermark(), batch.to);
        assert!(tracker.records_pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_commit_keeps_in_memory_watermark() {
        let dir = tempfile::tempdir().unwrap();
        let (log, store, mut tracker) = open_tracker(&dir).await;
        append(&log, "1,2,3,4,5,6,7\n");
        let batch = tracker.records_pending().await.unwrap();

        store.fail_saves.store(true, Ordering::SeqCst);
        assert!(tracker.commit(batch.to).await.is_err());
        assert_eq!(tracker.watermark(), Watermark::default());

        let replay = tracker.records_pending().await.unwrap();
        assert_eq!(replay.records, batch.records);
    }

    #[tokio::test]
    async fn failed_journal_fails_the_scan() {
        let dir = tempfile::tempdir().unwrap();
        let (log, store, mut tracker) = open_tracker(&dir).await;
        append(&log, "1,2,3,4,5,6,7\n");

        store.fail_journal.store(true, Ordering::SeqCst);
        assert!(tracker.records_pending().await.is_err());

        store.fail_journal.store(false, Ordering::SeqCst);
        let batch = tracker.records_pending().await.unwrap();
        assert_eq!(batch.records.len(), 1);
        assert!(!batch.replayed);
    }

    #[tokio::test]
    async fn truncated_log_is_not_rewound() {
        let dir = tempfile::tempdir().unwrap();
        let (log, _store, mut tracker) = open_tracker(&dir).await;
        append(&log, "1,2,3,4,5,6,7\n");
        let batch = tracker.records_pending().await.unwrap();
        tracker.commit(batch.to).await.unwrap();

        std::fs::write(&log, "").unwrap();
        let batch = tracker.records_pending().await.unwrap();
        assert!(batch.is_empty());
        assert_eq!(tracker.watermark(), Watermark::new(14, 1));
    }

    #[tokio::test]
    async fn large_backlogs_are_split() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("numbers.txt");
        let store = Arc::new(CheckpointDB::new(dir.path().join("checkpoints.db")).unwrap());
        let mut tracker = DeliveryTracker::open(&log, store, 2).await.unwrap();
        append(&log, "1,1,1,1,1,1,1\n2,2,2,2,2,2,2\n3,3,3,3,3,3,3\n");

        let batch = tracker.records_pending().await.unwrap();
        assert_eq!(batch.records.len(), 2);
        assert!(batch.has_more);
        assert_eq!(batch.to.line_count, 2);
        tracker.commit(batch.to).await.unwrap();

        let rest = tracker.records_pending().await.unwrap();
        assert_eq!(rest.records.len(), 1);
        assert_eq!(rest.records[0].line_no, 3);
        assert!(!rest.has_more);
    }
}
