//! SQLite-backed local primary store.
//!
//! Rows of every logical table share one `records` table and are stored as
//! JSON documents keyed by `(table_name, id)`.

use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info};

use hybridsync_common::{record_id, Error, Record, RecordFilter, Result, TableName};

use crate::local::{apply_changes, ensure_id, LocalStore};

/// Local store using SQLite.
pub struct SqliteLocalStore {
    conn: Mutex<Connection>,
}

impl SqliteLocalStore {
    /// Create or open a store database.
    ///
    /// # Errors
    /// - Database creation or migration failure
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref()).map_err(write_err)?;
        let store = Self::init(conn)?;
        info!("Local store opened at {}", db_path.as_ref().display());
        Ok(store)
    }

    /// Create a private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory().map_err(write_err)?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.busy_timeout(Duration::from_secs(5)).map_err(write_err)?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS records (
                table_name TEXT NOT NULL,
                id TEXT NOT NULL,
                data TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (table_name, id)
            );
            "#,
        )
        .map_err(write_err)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn load_rows(conn: &Connection, table: &TableName) -> Result<Vec<Record>> {
        let mut stmt = conn
            .prepare("SELECT data FROM records WHERE table_name = ?1 ORDER BY rowid")
            .map_err(read_err)?;
        let rows = stmt
            .query_map(params![table.as_str()], |row| row.get::<_, String>(0))
            .map_err(read_err)?;

        let mut records = Vec::new();
        for data in rows {
            let data = data.map_err(read_err)?;
            let record: Record = serde_json::from_str(&data)?;
            records.push(record);
        }
        Ok(records)
    }
}

fn write_err(err: rusqlite::Error) -> Error {
    Error::LocalWrite(err.to_string())
}

fn read_err(err: rusqlite::Error) -> Error {
    Error::LocalRead(err.to_string())
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl LocalStore for SqliteLocalStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn insert(&self, table: &TableName, mut record: Record) -> Result<Record> {
        let id = ensure_id(&mut record);
        let data = serde_json::to_string(&record)?;
        let conn = self.conn();

        let exists = conn
            .query_row(
                "SELECT 1 FROM records WHERE table_name = ?1 AND id = ?2",
                params![table.as_str(), id],
                |_| Ok(()),
            )
            .optional()
            .map_err(write_err)?
            .is_some();
        if exists {
            return Err(Error::LocalWrite(format!(
                "{} already has a row with id {}",
                table, id
            )));
        }

        conn.execute(
            "INSERT INTO records (table_name, id, data, updated_at) VALUES (?1, ?2, ?3, ?4)",
            params![table.as_str(), id, data, now_millis()],
        )
        .map_err(write_err)?;

        debug!("Inserted {}/{}", table, id);
        Ok(record)
    }

    fn update(
        &self,
        table: &TableName,
        changes: &Record,
        filter: &RecordFilter,
    ) -> Result<Vec<Record>> {
        let mut conn = self.conn();
        let tx = conn.transaction().map_err(write_err)?;

        let mut updated = Vec::new();
        for mut row in Self::load_rows(&tx, table)?
            .into_iter()
            .filter(|row| filter.matches(row))
        {
            apply_changes(&mut row, changes);
            let Some(id) = record_id(&row) else {
                continue;
            };
            tx.execute(
                "UPDATE records SET data = ?3, updated_at = ?4 WHERE table_name = ?1 AND id = ?2",
                params![table.as_str(), id, serde_json::to_string(&row)?, now_millis()],
            )
            .map_err(write_err)?;
            updated.push(row);
        }

        tx.commit().map_err(write_err)?;
        Ok(updated)
    }

    fn delete(&self, table: &TableName, filter: &RecordFilter) -> Result<Vec<Record>> {
        let mut conn = self.conn();
        let tx = conn.transaction().map_err(write_err)?;

        let doomed: Vec<Record> = Self::load_rows(&tx, table)?
            .into_iter()
            .filter(|row| filter.matches(row))
            .collect();
        for row in &doomed {
            if let Some(id) = record_id(row) {
                tx.execute(
                    "DELETE FROM records WHERE table_name = ?1 AND id = ?2",
                    params![table.as_str(), id],
                )
                .map_err(write_err)?;
            }
        }

        tx.commit().map_err(write_err)?;
        Ok(doomed)
    }

    fn query(&self, table: &TableName, filter: &RecordFilter) -> Result<Vec<Record>> {
        let conn = self.conn();
        Ok(Self::load_rows(&conn, table)?
            .into_iter()
            .filter(|row| filter.matches(row))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn table() -> TableName {
        TableName::new("repair_orders").unwrap()
    }

    fn record(value: serde_json::Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_insert_and_query() {
        let store = SqliteLocalStore::open_in_memory().unwrap();
        store
            .insert(&table(), record(json!({"id": "ro1", "shop_id": "s1"})))
            .unwrap();
        store
            .insert(&table(), record(json!({"id": "ro2", "shop_id": "s2"})))
            .unwrap();

        let rows = store
            .query(&table(), &RecordFilter::new().eq("shop_id", "s2"))
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["id"], json!("ro2"));
    }

    #[test]
    fn test_duplicate_insert_is_local_write_error() {
        let store = SqliteLocalStore::open_in_memory().unwrap();
        store.insert(&table(), record(json!({"id": "ro1"}))).unwrap();

        let err = store.insert(&table(), record(json!({"id": "ro1"}))).unwrap_err();
        assert!(matches!(err, Error::LocalWrite(_)));
    }

    #[test]
    fn test_update_and_delete() {
        let store = SqliteLocalStore::open_in_memory().unwrap();
        store
            .insert(&table(), record(json!({"id": "ro1", "status": "open"})))
            .unwrap();

        let updated = store
            .update(
                &table(),
                &record(json!({"status": "closed"})),
                &RecordFilter::by_id("ro1"),
            )
            .unwrap();
        assert_eq!(updated[0]["status"], json!("closed"));

        let deleted = store.delete(&table(), &RecordFilter::by_id("ro1")).unwrap();
        assert_eq!(deleted.len(), 1);
        assert!(store.query(&table(), &RecordFilter::new()).unwrap().is_empty());
    }

    #[test]
    fn test_persistence() {
        let temp = TempDir::new().unwrap();
        let db_path = temp.path().join("local.db");

        {
            let store = SqliteLocalStore::open(&db_path).unwrap();
            store
                .insert(&table(), record(json!({"id": "ro1", "total": 120})))
                .unwrap();
        }

        {
            let store = SqliteLocalStore::open(&db_path).unwrap();
            let rows = store.query(&table(), &RecordFilter::by_id("ro1")).unwrap();
            assert_eq!(rows[0]["total"], json!(120));
        }
    }
}
