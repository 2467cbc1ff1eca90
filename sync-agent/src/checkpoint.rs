use anyhow::{Context, Result};
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::task;

/// Position in the log up to which every line has been handled.
///
/// `byte_offset` always sits just past a newline; `line_count` is the number of lines before it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Watermark {
    pub byte_offset: u64,
    pub line_count: u64,
}

impl Watermark {
    pub fn new(byte_offset: u64, line_count: u64) -> Self {
        Self {
            byte_offset,
            line_count,
        }
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {} (byte {})", self.line_count, self.byte_offset)
    }
}

/// Durable storage for the watermark and the timestamps of stamped but uncommitted lines.
#[async_trait]
pub trait WatermarkStore: Send + Sync {
    async fn load(&self, file_path: &Path) -> Result<Watermark>;

    /// Persist `watermark` and forget journaled stamps at or below its line count.
    async fn save(&self, file_path: &Path, watermark: Watermark) -> Result<()>;

    /// Journaled stamps keyed by line number.
    async fn load_stamps(&self, file_path: &Path) -> Result<BTreeMap<u64, i64>>;

    /// Record `stamps` and raise the high-water stamp; it outlives pruning.
    async fn journal_stamps(&self, file_path: &Path, stamps: &[(u64, i64)]) -> Result<()>;

    /// Highest stamp ever journaled for `file_path`, or 0.
    async fn last_stamp(&self, file_path: &Path) -> Result<i64>;
}

#[derive(Debug, Clone)]
pub struct CheckpointDB {
    path: Arc<PathBuf>,
}

impl CheckpointDB {
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create checkpoint directory {}", parent.display())
            })?;
        }

        let conn = open_connection(&path)?;
        initialize_schema(&conn)?;

        Ok(Self {
            path: Arc::new(path),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl WatermarkStore for CheckpointDB {
    async fn load(&self, file_path: &Path) -> Result<Watermark> {
        let db_path = self.path.clone();
        let path = normalize_path(file_path);
        task::spawn_blocking(move || {
            let conn = open_connection(&db_path)?;
            let watermark = conn
                .query_row(
                    "SELECT byte_offset, line_count FROM watermarks WHERE file_path = ?1",
                    params![path],
                    |row| {
                        Ok(Watermark {
                            byte_offset: row.get::<_, i64>(0)? as u64,
                            line_count: row.get::<_, i64>(1)? as u64,
                        })
                    },
                )
                .optional()
                .context("failed to query watermark table")?;

            Ok::<_, anyhow::Error>(watermark.unwrap_or_default())
        })
        .await
        .context("watermark load join error")?
    }

    async fn save(&self, file_path: &Path, watermark: Watermark) -> Result<()> {
        let db_path = self.path.clone();
        let path = normalize_path(file_path);
        let updated_at = current_timestamp();
        task::spawn_blocking(move || {
            let mut conn = open_connection(&db_path)?;
            let tx = conn
                .transaction()
                .context("failed to begin watermark transaction")?;
            tx.execute(
                "
                INSERT INTO watermarks (file_path, byte_offset, line_count, updated_at)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(file_path) DO UPDATE SET
                    byte_offset = excluded.byte_offset,
                    line_count = excluded.line_count,
                    updated_at = excluded.updated_at
                ",
                params![
                    path,
                    watermark.byte_offset as i64,
                    watermark.line_count as i64,
                    updated_at
                ],
            )
            .context("failed to upsert watermark record")?;
            tx.execute(
                "DELETE FROM stamp_journal WHERE file_path = ?1 AND line_no <= ?2",
                params![path, watermark.line_count as i64],
            )
            .context("failed to prune stamp journal")?;
            tx.commit().context("failed to commit watermark")?;
            Ok::<_, anyhow::Error>(())
        })
        .await
        .context("watermark save join error")??;

        Ok(())
    }

    async fn load_stamps(&self, file_path: &Path) -> Result<BTreeMap<u64, i64>> {
        let db_path = self.path.clone();
        let path = normalize_path(file_path);
        task::spawn_blocking(move || {
            let conn = open_connection(&db_path)?;
            let mut stmt = conn
                .prepare("SELECT line_no, timestamp_ms FROM stamp_journal WHERE file_path = ?1")
                .context("failed to prepare stamp journal select statement")?;
            let rows = stmt
                .query_map(params![path], |row| {
                    Ok((row.get::<_, i64>(0)? as u64, row.get::<_, i64>(1)?))
                })
                .context("failed to query stamp journal")?;

            let mut stamps = BTreeMap::new();
            for row in rows {
                let (line_no, timestamp_ms) = row.context("failed to read stamp journal row")?;
                stamps.insert(line_no, timestamp_ms);
            }
            Ok::<_, anyhow::Error>(stamps)
        })
        .await
        .context("stamp journal load join error")?
    }

    async fn journal_stamps(&self, file_path: &Path, stamps: &[(u64, i64)]) -> Result<()> {
        if stamps.is_empty() {
            return Ok(());
        }
        let db_path = self.path.clone();
        let path = normalize_path(file_path);
        let stamps = stamps.to_vec();
        task::spawn_blocking(move || {
            let mut conn = open_connection(&db_path)?;
            let tx = conn
                .transaction()
                .context("failed to begin stamp journal transaction")?;
            {
                let mut stmt = tx
                    .prepare(
                        "
                        INSERT OR IGNORE INTO stamp_journal (file_path, line_no, timestamp_ms)
                        VALUES (?1, ?2, ?3)
                        ",
                    )
                    .context("failed to prepare stamp journal insert")?;
                for (line_no, timestamp_ms) in &stamps {
                    stmt.execute(params![path, *line_no as i64, timestamp_ms])
                        .context("failed to journal stamp")?;
                }
            }
            let highest = stamps.iter().map(|(_, ts)| *ts).max().unwrap_or_default();
            tx.execute(
                "
                INSERT INTO stamp_high_water (file_path, last_stamp)
                VALUES (?1, ?2)
                ON CONFLICT(file_path) DO UPDATE SET
                    last_stamp = MAX(last_stamp, excluded.last_stamp)
                ",
                params![path, highest],
            )
            .context("failed to raise stamp high-water mark")?;
            tx.commit().context("failed to commit stamp journal")?;
            Ok::<_, anyhow::Error>(())
        })
        .await
        .context("stamp journal write join error")??;

        Ok(())
    }

    async fn last_stamp(&self, file_path: &Path) -> Result<i64> {
        let db_path = self.path.clone();
        let path = normalize_path(file_path);
        task::spawn_blocking(move || {
            let conn = open_connection(&db_path)?;
            let last = conn
                .query_row(
                    "SELECT last_stamp FROM stamp_high_water WHERE file_path = ?1",
                    params![path],
                    |row| row.get::<_, i64>(0),
                )
                .optional()
                .context("failed to query stamp high-water mark")?;
            Ok::<_, anyhow::Error>(last.unwrap_or_default())
        })
        .await
        .context("stamp high-water load join error")?
    }
}

fn current_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn open_connection(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)
        .with_context(|| format!("failed to open checkpoint db {}", path.display()))?;

    conn.pragma_update(None, "journal_mode", "WAL")
        .context("failed to enable WAL mode for checkpoint db")?;
    conn.pragma_update(None, "synchronous", "NORMAL")
        .context("failed to set checkpoint db synchronous mode")?;

    Ok(conn)
}

fn initialize_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS watermarks (
            file_path TEXT PRIMARY KEY,
            byte_offset INTEGER NOT NULL,
            line_count INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );
        CREATE TABLE IF NOT EXISTS stamp_journal (
            file_path TEXT NOT NULL,
            line_no INTEGER NOT NULL,
            timestamp_ms INTEGER NOT NULL,
            PRIMARY KEY (file_path, line_no)
        );
        CREATE TABLE IF NOT EXISTS stamp_high_water (
            file_path TEXT PRIMARY KEY,
            last_stamp INTEGER NOT NULL
        );
        ",
    )
    .context("failed to create checkpoint tables")?;

    Ok(())
}
