//! Append-only `SQLite` checkpoint store.

use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{TimeZone, Utc};
use rusqlite::{OptionalExtension, TransactionBehavior};
use serde::Serialize;
use tokio_rusqlite::Connection;
use tracing::debug;

use crate::checkpoint::errors::{CheckpointError, CheckpointResult};
use crate::checkpoint::types::{
    Checkpoint, CheckpointMetadata, CheckpointSource, ConversationState, ThreadId,
};

/// Boxed future type for checkpoint store operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS checkpoints (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        thread_id TEXT NOT NULL,
        seq INTEGER NOT NULL,
        created_at INTEGER NOT NULL,
        source TEXT NOT NULL,
        step INTEGER NOT NULL,
        state TEXT NOT NULL,
        UNIQUE (thread_id, seq)
    );
    CREATE INDEX IF NOT EXISTS idx_checkpoints_thread_seq
        ON checkpoints (thread_id, seq);
    CREATE TABLE IF NOT EXISTS replica_sync (
        remote TEXT PRIMARY KEY,
        last_synced_id INTEGER NOT NULL
    );";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SELECT_COLUMNS: &str = "id, thread_id, seq, created_at, source, step, state";

/// Checkpoint store trait.
pub trait CheckpointStore: Send + Sync {
    /// Append a new checkpoint for a thread and return it with its sequence.
    ///
    /// # Errors
    /// Returns an error if serialization or storage access fails.
    fn put(
        &self,
        thread_id: ThreadId,
        metadata: CheckpointMetadata,
        state: ConversationState,
    ) -> StoreFuture<'_, CheckpointResult<Checkpoint>>;
    /// Load the latest checkpoint for a thread.
    ///
    /// # Errors
    /// Returns an error if storage access fails.
    fn latest(&self, thread_id: ThreadId) -> StoreFuture<'_, CheckpointResult<Option<Checkpoint>>>;
    /// Load a specific checkpoint by sequence.
    ///
    /// # Errors
    /// Returns an error if storage access fails.
    fn get(
        &self,
        thread_id: ThreadId,
        seq: u64,
    ) -> StoreFuture<'_, CheckpointResult<Option<Checkpoint>>>;
    /// List checkpoints for a thread, newest first.
    ///
    /// # Errors
    /// Returns an error if storage access fails.
    fn list(
        &self,
        thread_id: ThreadId,
        limit: usize,
    ) -> StoreFuture<'_, CheckpointResult<Vec<Checkpoint>>>;
    /// List every thread that has at least one checkpoint.
    ///
    /// # Errors
    /// Returns an error if storage access fails.
    fn threads(&self) -> StoreFuture<'_, CheckpointResult<Vec<ThreadId>>>;
}

/// Raw checkpoint row, as shipped to the remote replica.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CheckpointRow {
    /// Local rowid, used as the replication high-water mark.
    pub id: i64,
    /// Thread key.
    pub thread_id: String,
    /// Per-thread sequence.
    pub seq: i64,
    /// Write time in unix milliseconds.
    pub created_at: i64,
    /// Checkpoint source tag.
    pub source: String,
    /// Step counter.
    pub step: i64,
    /// JSON-encoded conversation state.
    pub state: String,
}

impl CheckpointRow {
    fn from_sql(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            thread_id: row.get(1)?,
            seq: row.get(2)?,
            created_at: row.get(3)?,
            source: row.get(4)?,
            step: row.get(5)?,
            state: row.get(6)?,
        })
    }

    fn decode(self) -> CheckpointResult<Checkpoint> {
        let created_at = Utc
            .timestamp_millis_opt(self.created_at)
            .single()
            .ok_or_else(|| CheckpointError::InvalidCheckpoint("invalid timestamp".to_string()))?;
        let source = CheckpointSource::from_str(&self.source)
            .map_err(|err| CheckpointError::InvalidCheckpoint(format!("invalid source: {err}")))?;
        let seq = u64::try_from(self.seq)
            .map_err(|_| CheckpointError::InvalidCheckpoint("negative seq".to_string()))?;
        let step = u64::try_from(self.step)
            .map_err(|_| CheckpointError::InvalidCheckpoint("negative step".to_string()))?;
        Ok(Checkpoint {
            thread_id: ThreadId::new(self.thread_id),
            seq,
            created_at,
            metadata: CheckpointMetadata { source, step },
            state: serde_json::from_str(&self.state)?,
        })
    }
}

/// Create the checkpoint schema if this is a fresh file.
///
/// # Errors
/// Returns an error if the statements fail.
pub async fn ensure_schema(conn: &Connection) -> CheckpointResult<()> {
    conn.call(|conn| {
        // The replica reader and the store writer share the file.
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(SCHEMA)?;
        Ok(())
    })
    .await?;
    Ok(())
}

/// Load rows written after the last successful push to `remote`.
pub(crate) async fn load_unsynced(
    conn: &Connection,
    remote: &str,
    limit: usize,
) -> CheckpointResult<Vec<CheckpointRow>> {
    let remote = remote.to_string();
    let limit = i64::try_from(limit)
        .map_err(|_| CheckpointError::InvalidConfig("batch size exceeds i64".to_string()))?;
    let rows = conn
        .call(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SELECT_COLUMNS} FROM checkpoints
                 WHERE id > COALESCE(
                    (SELECT last_synced_id FROM replica_sync WHERE remote = ?1), 0)
                 ORDER BY id
                 LIMIT ?2"
            ))?;
            let rows = stmt
                .query_map(rusqlite::params![remote, limit], CheckpointRow::from_sql)?
                .collect::<Result<Vec<_>, rusqlite::Error>>()?;
            Ok(rows)
        })
        .await?;
    Ok(rows)
}

/// Advance the replication high-water mark for `remote`.
pub(crate) async fn mark_synced(
    conn: &Connection,
    remote: &str,
    last_id: i64,
) -> CheckpointResult<()> {
    let remote = remote.to_string();
    conn.call(move |conn| {
        conn.execute(
            "INSERT INTO replica_sync (remote, last_synced_id) VALUES (?1, ?2)
             ON CONFLICT(remote) DO UPDATE SET
                last_synced_id = MAX(last_synced_id, excluded.last_synced_id)",
            rusqlite::params![remote, last_id],
        )?;
        Ok(())
    })
    .await?;
    Ok(())
}

/// `SQLite` implementation of checkpoint storage.
pub struct SqliteCheckpointStore {
    conn: Connection,
    closed: AtomicBool,
}

impl SqliteCheckpointStore {
    /// Open the database file and ensure the schema exists.
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened or initialized.
    pub async fn open(path: impl AsRef<Path>) -> CheckpointResult<Self> {
        let conn = Connection::open(path.as_ref()).await?;
        ensure_schema(&conn).await?;
        debug!(path = %path.as_ref().display(), "Checkpoint store opened");
        Ok(Self {
            conn,
            closed: AtomicBool::new(false),
        })
    }

    /// Whether `close` has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close the underlying connection. Later operations fail with
    /// [`CheckpointError::Closed`]. Only the owning facade closes the handle.
    ///
    /// # Errors
    /// Returns an error if `SQLite` refuses to close the connection.
    pub(crate) async fn close(&self) -> CheckpointResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.conn.clone().close().await?;
        Ok(())
    }

    fn connection(&self) -> CheckpointResult<&Connection> {
        if self.is_closed() {
            return Err(CheckpointError::Closed);
        }
        Ok(&self.conn)
    }

    async fn query_rows(
        &self,
        sql: String,
        thread_id: String,
        extra: Option<i64>,
    ) -> CheckpointResult<Vec<Checkpoint>> {
        let rows = self
            .connection()?
            .call(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let rows = match extra {
                    Some(value) => stmt
                        .query_map(rusqlite::params![thread_id, value], CheckpointRow::from_sql)?
                        .collect::<Result<Vec<_>, rusqlite::Error>>()?,
                    None => stmt
                        .query_map(rusqlite::params![thread_id], CheckpointRow::from_sql)?
                        .collect::<Result<Vec<_>, rusqlite::Error>>()?,
                };
                Ok(rows)
            })
            .await?;
        rows.into_iter().map(CheckpointRow::decode).collect()
    }
}

impl CheckpointStore for SqliteCheckpointStore {
    fn put(
        &self,
        thread_id: ThreadId,
        metadata: CheckpointMetadata,
        state: ConversationState,
    ) -> StoreFuture<'_, CheckpointResult<Checkpoint>> {
        Box::pin(async move {
            let encoded = serde_json::to_string(&state)?;
            let step = i64::try_from(metadata.step)
                .map_err(|_| CheckpointError::InvalidCheckpoint("step exceeds i64".to_string()))?;
            let created_at = Utc::now();
            let created_millis = created_at.timestamp_millis();
            let thread = thread_id.to_string();
            let source = metadata.source.as_str();

            let seq = self
                .connection()?
                .call(move |conn| {
                    // IMMEDIATE takes the write lock before reading MAX(seq).
                    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                    let seq: i64 = tx.query_row(
                        "SELECT COALESCE(MAX(seq), 0) + 1 FROM checkpoints WHERE thread_id = ?1",
                        rusqlite::params![thread],
                        |row| row.get(0),
                    )?;
                    tx.execute(
                        "INSERT INTO checkpoints (thread_id, seq, created_at, source, step, state)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                        rusqlite::params![thread, seq, created_millis, source, step, encoded],
                    )?;
                    tx.commit()?;
                    Ok(seq)
                })
                .await?;

            let seq = u64::try_from(seq)
                .map_err(|_| CheckpointError::InvalidCheckpoint("negative seq".to_string()))?;
            debug!(thread_id = %thread_id, seq, source = metadata.source.as_str(), "Checkpoint written");
            Ok(Checkpoint {
                thread_id,
                seq,
                created_at,
                metadata,
                state,
            })
        })
    }

    fn latest(&self, thread_id: ThreadId) -> StoreFuture<'_, CheckpointResult<Option<Checkpoint>>> {
        Box::pin(async move {
            let thread = thread_id.to_string();
            let row = self
                .connection()?
                .call(move |conn| {
                    let row = conn
                        .query_row(
                            &format!(
                                "SELECT {SELECT_COLUMNS} FROM checkpoints
                                 WHERE thread_id = ?1
                                 ORDER BY seq DESC
                                 LIMIT 1"
                            ),
                            rusqlite::params![thread],
                            CheckpointRow::from_sql,
                        )
                        .optional()?;
                    Ok(row)
                })
                .await?;
            row.map(CheckpointRow::decode).transpose()
        })
    }

    fn get(
        &self,
        thread_id: ThreadId,
        seq: u64,
    ) -> StoreFuture<'_, CheckpointResult<Option<Checkpoint>>> {
        Box::pin(async move {
            let seq = i64::try_from(seq)
                .map_err(|_| CheckpointError::InvalidCheckpoint("seq exceeds i64".to_string()))?;
            let rows = self
                .query_rows(
                    format!(
                        "SELECT {SELECT_COLUMNS} FROM checkpoints
                         WHERE thread_id = ?1 AND seq = ?2"
                    ),
                    thread_id.to_string(),
                    Some(seq),
                )
                .await?;
            Ok(rows.into_iter().next())
        })
    }

    fn list(
        &self,
        thread_id: ThreadId,
        limit: usize,
    ) -> StoreFuture<'_, CheckpointResult<Vec<Checkpoint>>> {
        Box::pin(async move {
            let limit = i64::try_from(limit)
                .map_err(|_| CheckpointError::InvalidConfig("limit exceeds i64".to_string()))?;
            self.query_rows(
                format!(
                    "SELECT {SELECT_COLUMNS} FROM checkpoints
                     WHERE thread_id = ?1
                     ORDER BY seq DESC
                     LIMIT ?2"
                ),
                thread_id.to_string(),
                Some(limit),
            )
            .await
        })
    }

    fn threads(&self) -> StoreFuture<'_, CheckpointResult<Vec<ThreadId>>> {
        Box::pin(async move {
            let ids = self
                .connection()?
                .call(|conn| {
                    let mut stmt = conn
                        .prepare("SELECT DISTINCT thread_id FROM checkpoints ORDER BY thread_id")?;
                    let ids = stmt
                        .query_map([], |row| row.get::<_, String>(0))?
                        .collect::<Result<Vec<_>, rusqlite::Error>>()?;
                    Ok(ids)
                })
                .await?;
            Ok(ids.into_iter().map(ThreadId::new).collect())
        })
    }
}
