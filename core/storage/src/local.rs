//! Local primary store trait and an in-memory implementation.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

use hybridsync_common::{record_id, Error, Record, RecordFilter, Result, TableName};

/// The authoritative local store.
///
/// All operations are synchronous. Any error is fatal to the caller: the sync
/// engine never retries or masks a local failure.
pub trait LocalStore: Send + Sync {
    /// Get the store name (e.g., "memory", "sqlite").
    fn name(&self) -> &str;

    /// Insert a record and return it as stored.
    ///
    /// # Postconditions
    /// - The returned record carries an `id`; one is generated if missing
    ///
    /// # Errors
    /// - `LocalWrite` if a record with the same `id` already exists
    fn insert(&self, table: &TableName, record: Record) -> Result<Record>;

    /// Merge `changes` into every row matching `filter`.
    ///
    /// The `id` column is never rewritten. Returns the updated rows.
    fn update(
        &self,
        table: &TableName,
        changes: &Record,
        filter: &RecordFilter,
    ) -> Result<Vec<Record>>;

    /// Delete every row matching `filter` and return the deleted rows.
    fn delete(&self, table: &TableName, filter: &RecordFilter) -> Result<Vec<Record>>;

    /// Return every row matching `filter`.
    fn query(&self, table: &TableName, filter: &RecordFilter) -> Result<Vec<Record>>;
}

/// Assign an `id` to a record that lacks one and return it.
pub(crate) fn ensure_id(record: &mut Record) -> String {
    match record_id(record) {
        Some(id) => id,
        None => {
            let id = Uuid::new_v4().to_string();
            record.insert("id".to_string(), id.clone().into());
            id
        }
    }
}

/// Merge changed columns into a row, leaving its `id` alone.
pub(crate) fn apply_changes(row: &mut Record, changes: &Record) {
    for (column, value) in changes {
        if column != "id" {
            row.insert(column.clone(), value.clone());
        }
    }
}

/// In-memory local store.
///
/// Useful for testing and development. All data is stored in memory
/// and lost on drop.
pub struct MemoryLocalStore {
    tables: Mutex<HashMap<TableName, BTreeMap<String, Record>>>,
    /// Inserts allowed before the store starts failing (`None` = unlimited).
    insert_budget: Mutex<Option<usize>>,
}

impl MemoryLocalStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(HashMap::new()),
            insert_budget: Mutex::new(None),
        }
    }

    /// Let the next `count` inserts succeed and fail every insert after that.
    pub fn fail_inserts_after(&self, count: usize) {
        *lock(&self.insert_budget) = Some(count);
    }

    /// Number of rows in a table.
    pub fn len(&self, table: &TableName) -> usize {
        lock(&self.tables).get(table).map_or(0, BTreeMap::len)
    }

    /// Check whether a table holds no rows.
    pub fn is_empty(&self, table: &TableName) -> bool {
        self.len(table) == 0
    }
}

impl Default for MemoryLocalStore {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl LocalStore for MemoryLocalStore {
    fn name(&self) -> &str {
        "memory"
    }

    fn insert(&self, table: &TableName, mut record: Record) -> Result<Record> {
        {
            let mut budget = lock(&self.insert_budget);
            if let Some(remaining) = budget.as_mut() {
                if *remaining == 0 {
                    return Err(Error::LocalWrite(format!(
                        "insert into {} rejected by store",
                        table
                    )));
                }
                *remaining -= 1;
            }
        }

        let id = ensure_id(&mut record);
        let mut tables = lock(&self.tables);
        let rows = tables.entry(table.clone()).or_default();
        if rows.contains_key(&id) {
            return Err(Error::LocalWrite(format!(
                "{} already has a row with id {}",
                table, id
            )));
        }
        rows.insert(id, record.clone());
        Ok(record)
    }

    fn update(
        &self,
        table: &TableName,
        changes: &Record,
        filter: &RecordFilter,
    ) -> Result<Vec<Record>> {
        let mut tables = lock(&self.tables);
        let Some(rows) = tables.get_mut(table) else {
            return Ok(Vec::new());
        };

        let mut updated = Vec::new();
        for row in rows.values_mut().filter(|row| filter.matches(row)) {
            apply_changes(row, changes);
            updated.push(row.clone());
        }
        Ok(updated)
    }

    fn delete(&self, table: &TableName, filter: &RecordFilter) -> Result<Vec<Record>> {
        let mut tables = lock(&self.tables);
        let Some(rows) = tables.get_mut(table) else {
            return Ok(Vec::new());
        };

        let doomed: Vec<String> = rows
            .iter()
            .filter(|(_, row)| filter.matches(row))
            .map(|(id, _)| id.clone())
            .collect();

        Ok(doomed.iter().filter_map(|id| rows.remove(id)).collect())
    }

    fn query(&self, table: &TableName, filter: &RecordFilter) -> Result<Vec<Record>> {
        let tables = lock(&self.tables);
        Ok(tables
            .get(table)
            .map(|rows| {
                rows.values()
                    .filter(|row| filter.matches(row))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn table() -> TableName {
        TableName::new("customers").unwrap()
    }

    fn record(value: serde_json::Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_insert_assigns_id() {
        let store = MemoryLocalStore::new();
        let stored = store.insert(&table(), record(json!({"name": "Ada"}))).unwrap();

        assert!(record_id(&stored).is_some());
        assert_eq!(store.len(&table()), 1);
    }

    #[test]
    fn test_insert_duplicate_fails() {
        let store = MemoryLocalStore::new();
        store.insert(&table(), record(json!({"id": "c1"}))).unwrap();

        let err = store.insert(&table(), record(json!({"id": "c1"}))).unwrap_err();
        assert!(matches!(err, Error::LocalWrite(_)));
    }

    #[test]
    fn test_update_and_query() {
        let store = MemoryLocalStore::new();
        store
            .insert(&table(), record(json!({"id": "c1", "name": "Ada"})))
            .unwrap();
        store
            .insert(&table(), record(json!({"id": "c2", "name": "Bob"})))
            .unwrap();

        let updated = store
            .update(
                &table(),
                &record(json!({"id": "zzz", "name": "Grace"})),
                &RecordFilter::by_id("c1"),
            )
            .unwrap();
        assert_eq!(updated.len(), 1);
        assert_eq!(updated[0]["id"], json!("c1"));
        assert_eq!(updated[0]["name"], json!("Grace"));

        let rows = store
            .query(&table(), &RecordFilter::new().eq("name", "Bob"))
            .unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn test_delete_returns_rows() {
        let store = MemoryLocalStore::new();
        store.insert(&table(), record(json!({"id": "c1"}))).unwrap();

        let deleted = store.delete(&table(), &RecordFilter::by_id("c1")).unwrap();
        assert_eq!(deleted.len(), 1);
        assert!(store.is_empty(&table()));
    }

    #[test]
    fn test_insert_budget() {
        let store = MemoryLocalStore::new();
        store.fail_inserts_after(1);

        assert!(store.insert(&table(), record(json!({"id": "a"}))).is_ok());
        assert!(store.insert(&table(), record(json!({"id": "b"}))).is_err());
        assert_eq!(store.len(&table()), 1);
    }
}
