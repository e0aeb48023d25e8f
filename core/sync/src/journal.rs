//! Durable journal of pending outbox operations.

use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::info;

use hybridsync_common::{Error, Result};

use crate::operation::MutationOperation;

/// Write-through persistence for the outbox queue.
///
/// The journal mirrors the pending set only: operations are appended on
/// enqueue, rewritten when their retry state changes and removed once they
/// reach a terminal state.
pub trait OutboxJournal: Send + Sync {
    /// Load every journaled operation, in any order.
    fn load(&self) -> Result<Vec<MutationOperation>>;

    /// Record a newly enqueued operation.
    fn append(&self, op: &MutationOperation) -> Result<()>;

    /// Rewrite an operation after its state changed.
    fn update(&self, op: &MutationOperation) -> Result<()>;

    /// Forget an operation.
    fn remove(&self, id: &str) -> Result<()>;
}

/// Outbox journal in a SQLite `outbox` table.
pub struct SqliteJournal {
    conn: Mutex<Connection>,
}

impl SqliteJournal {
    /// Create or open a journal database.
    ///
    /// # Errors
    /// - Database creation or migration failure
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref()).map_err(journal_err)?;
        let journal = Self::init(conn)?;
        info!("Outbox journal opened at {}", db_path.as_ref().display());
        Ok(journal)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory().map_err(journal_err)?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.busy_timeout(Duration::from_secs(5)).map_err(journal_err)?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS outbox (
                id TEXT PRIMARY KEY,
                seq INTEGER NOT NULL,
                data TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_outbox_seq ON outbox(seq);
            "#,
        )
        .map_err(journal_err)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self, op: &MutationOperation) -> Result<()> {
        let data = serde_json::to_string(op)?;
        let seq = i64::try_from(op.seq)
            .map_err(|_| Error::Serialization(format!("sequence {} out of range", op.seq)))?;
        self.conn()
            .execute(
                "INSERT OR REPLACE INTO outbox (id, seq, data) VALUES (?1, ?2, ?3)",
                params![op.id, seq, data],
            )
            .map_err(journal_err)?;
        Ok(())
    }
}

fn journal_err(err: rusqlite::Error) -> Error {
    Error::Io(std::io::Error::other(err))
}

impl OutboxJournal for SqliteJournal {
    fn load(&self) -> Result<Vec<MutationOperation>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare("SELECT data FROM outbox ORDER BY seq")
            .map_err(journal_err)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(journal_err)?;

        let mut ops = Vec::new();
        for data in rows {
            let data = data.map_err(journal_err)?;
            ops.push(serde_json::from_str(&data)?);
        }
        Ok(ops)
    }

    fn append(&self, op: &MutationOperation) -> Result<()> {
        self.write(op)
    }

    fn update(&self, op: &MutationOperation) -> Result<()> {
        self.write(op)
    }

    fn remove(&self, id: &str) -> Result<()> {
        self.conn()
            .execute("DELETE FROM outbox WHERE id = ?1", params![id])
            .map_err(journal_err)?;
        Ok(())
    }
}
