//! SQLite implementation of the durable log.
//!
//! Every worker process opens its own [`SqliteLog`] on the same database
//! file. WAL mode lets replays read while other processes append, and the
//! `UNIQUE` constraint on the token column is the only de-duplication point.

use crate::log::{AppendOutcome, DurableLog, LogError, ReplayStream};
use crate::message::{Message, MessageId};
use async_trait::async_trait;
use rusqlite::{params, Connection, OpenFlags};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS messages (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        idempotency_token TEXT UNIQUE,
        content TEXT NOT NULL
    );
";

const INSERT: &str = "INSERT INTO messages (content, idempotency_token) VALUES (?1, ?2)";

const SELECT_AFTER: &str = "SELECT id, content FROM messages WHERE id > ?1 ORDER BY id ASC";

const SELECT_HEAD: &str = "SELECT COALESCE(MAX(id), 0) FROM messages";

/// SQLite log configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Database file shared by all worker processes.
    pub path: PathBuf,
    /// How long a writer waits on a lock held by another process.
    pub busy_timeout: Duration,
    /// Rows buffered between the reader task and a replaying session.
    pub replay_buffer: usize,
}

impl LogConfig {
    /// Configuration with default tuning for the given database file.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            busy_timeout: Duration::from_secs(5),
            replay_buffer: 64,
        }
    }
}

/// A durable log stored in a SQLite database file.
pub struct SqliteLog {
    writer: Arc<Mutex<Connection>>,
    config: LogConfig,
}

impl SqliteLog {
    /// Open (and if needed create) the log at `config.path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
    pub fn open(config: LogConfig) -> Result<Self, LogError> {
        let conn = Connection::open(&config.path)?;
        conn.busy_timeout(config.busy_timeout)?;
        let mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        conn.execute_batch(SCHEMA)?;

        info!(path = %config.path.display(), journal = %mode, "Opened durable log");

        Ok(Self {
            writer: Arc::new(Mutex::new(conn)),
            config,
        })
    }

    /// Open the log at `path` with default tuning.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
    pub fn open_path(path: impl AsRef<Path>) -> Result<Self, LogError> {
        Self::open(LogConfig::new(path.as_ref()))
    }

    /// The configuration this log was opened with.
    #[must_use]
    pub fn config(&self) -> &LogConfig {
        &self.config
    }

}

/// Open a read-only connection. Blocks on file I/O.
fn open_reader(config: &LogConfig) -> Result<Connection, LogError> {
    let conn = Connection::open_with_flags(
        &config.path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    conn.busy_timeout(config.busy_timeout)?;
    Ok(conn)
}

fn insert(conn: &Connection, content: &str, token: Option<&str>) -> Result<AppendOutcome, LogError> {
    match conn.execute(INSERT, params![content, token]) {
        Ok(_) => {
            let id = conn.last_insert_rowid() as MessageId;
            Ok(AppendOutcome::Appended(Message::new(id, content)))
        }
        Err(rusqlite::Error::SqliteFailure(err, _))
            if err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE =>
        {
            Ok(AppendOutcome::Duplicate)
        }
        Err(e) => Err(e.into()),
    }
}

/// Rowids are signed; offsets beyond `i64::MAX` cannot exist in the table.
fn sql_offset(offset: MessageId) -> i64 {
    i64::try_from(offset).unwrap_or(i64::MAX)
}

fn replay_rows(
    conn: &Connection,
    offset: MessageId,
    tx: &mpsc::Sender<Result<Message, LogError>>,
) -> Result<(), LogError> {
    let mut stmt = conn.prepare(SELECT_AFTER)?;
    let mut rows = stmt.query([sql_offset(offset)])?;

    while let Some(row) = rows.next()? {
        let id: i64 = row.get(0)?;
        let message = Message::new(id as MessageId, row.get::<_, String>(1)?);
        if tx.blocking_send(Ok(message)).is_err() {
            debug!(offset, "Replay abandoned by consumer");
            return Ok(());
        }
    }

    Ok(())
}

#[async_trait]
impl DurableLog for SqliteLog {
    async fn append(&self, content: &str, token: Option<&str>) -> Result<AppendOutcome, LogError> {
        let writer = Arc::clone(&self.writer);
        let content = content.to_owned();
        let token = token.map(str::to_owned);

        let outcome = tokio::task::spawn_blocking(move || {
            let conn = writer
                .lock()
                .map_err(|_| LogError::Storage("writer connection poisoned".into()))?;
            insert(&conn, &content, token.as_deref())
        })
        .await??;

        trace!(outcome = ?outcome, "Append finished");
        Ok(outcome)
    }

    /// Must be called from within a tokio runtime.
    fn stream_after(&self, offset: MessageId) -> ReplayStream {
        let (tx, rx) = mpsc::channel(self.config.replay_buffer.max(1));
        let config = self.config.clone();

        tokio::task::spawn_blocking(move || {
            let result = open_reader(&config).and_then(|conn| replay_rows(&conn, offset, &tx));
            if let Err(e) = result {
                let _ = tx.blocking_send(Err(e));
            }
        });

        ReplayStream::new(rx)
    }

    async fn head(&self) -> Result<MessageId, LogError> {
        let config = self.config.clone();
        let head = tokio::task::spawn_blocking(move || {
            let conn = open_reader(&config)?;
            Ok::<_, LogError>(conn.query_row(SELECT_HEAD, [], |row| row.get::<_, i64>(0))?)
        })
        .await??;
        Ok(head as MessageId)
    }
}
