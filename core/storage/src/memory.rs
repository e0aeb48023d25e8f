//! In-memory cloud adapter for testing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use hybridsync_common::{record_id, value_key, CloudError, Record, RecordFilter, TableName};

use crate::cloud::{CloudAdapter, CloudResult};

/// Kind of a recorded adapter call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Upsert,
    Update,
    Delete,
}

/// One data call seen by the adapter, successful or not.
#[derive(Debug, Clone)]
pub struct CloudCall {
    pub kind: CallKind,
    pub table: TableName,
    /// Record ids touched by the call (from rows or the filter).
    pub record_ids: Vec<String>,
    /// Column values sent with the call, for upserts and updates.
    pub rows: Vec<Record>,
    pub succeeded: bool,
    pub at: DateTime<Utc>,
}

/// In-memory cloud replica.
///
/// Useful for testing and development. Failures can be scripted globally
/// (`fail_next`), per record id (`fail_record`), or by taking the whole
/// replica offline.
pub struct MemoryCloudAdapter {
    tables: Mutex<HashMap<TableName, BTreeMap<String, Record>>>,
    scripted: Mutex<VecDeque<CloudError>>,
    per_record: Mutex<HashMap<String, VecDeque<CloudError>>>,
    calls: Mutex<Vec<CloudCall>>,
    offline: AtomicBool,
    ping_error: Mutex<Option<CloudError>>,
    latency: Mutex<Option<Duration>>,
}

impl MemoryCloudAdapter {
    /// Create a new empty replica.
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(HashMap::new()),
            scripted: Mutex::new(VecDeque::new()),
            per_record: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            offline: AtomicBool::new(false),
            ping_error: Mutex::new(None),
            latency: Mutex::new(None),
        }
    }

    /// Fail the next `count` data calls with `error`.
    pub fn fail_next(&self, count: usize, error: CloudError) {
        let mut scripted = lock(&self.scripted);
        for _ in 0..count {
            scripted.push_back(error.clone());
        }
    }

    /// Fail the next `count` data calls touching `record_id` with `error`.
    pub fn fail_record(&self, record_id: impl Into<String>, count: usize, error: CloudError) {
        let mut per_record = lock(&self.per_record);
        let queue = per_record.entry(record_id.into()).or_default();
        for _ in 0..count {
            queue.push_back(error.clone());
        }
    }

    /// Make every call, including pings, fail with a network error.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Make pings fail with `error` (or succeed again with `None`).
    pub fn set_ping_error(&self, error: Option<CloudError>) {
        *lock(&self.ping_error) = error;
    }

    /// Delay every data call by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *lock(&self.latency) = latency;
    }

    /// All data calls seen so far, in arrival order.
    pub fn calls(&self) -> Vec<CloudCall> {
        lock(&self.calls).clone()
    }

    /// Data calls that were applied to the replica, in order.
    pub fn applied(&self) -> Vec<CloudCall> {
        lock(&self.calls)
            .iter()
            .filter(|call| call.succeeded)
            .cloned()
            .collect()
    }

    /// Current row for `id`, if any.
    pub fn get(&self, table: &TableName, id: &str) -> Option<Record> {
        lock(&self.tables)
            .get(table)
            .and_then(|rows| rows.get(id).cloned())
    }

    /// All rows of a table ordered by id.
    pub fn rows(&self, table: &TableName) -> Vec<Record> {
        lock(&self.tables)
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    async fn simulate(&self, ids: &[String]) -> CloudResult<()> {
        let latency = *lock(&self.latency);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        if self.offline.load(Ordering::SeqCst) {
            return Err(CloudError::Network("replica unreachable".to_string()));
        }
        if let Some(err) = lock(&self.scripted).pop_front() {
            return Err(err);
        }
        let mut per_record = lock(&self.per_record);
        for id in ids {
            if let Some(err) = per_record.get_mut(id).and_then(VecDeque::pop_front) {
                return Err(err);
            }
        }
        Ok(())
    }

    fn record_call(
        &self,
        kind: CallKind,
        table: &TableName,
        record_ids: Vec<String>,
        rows: Vec<Record>,
        succeeded: bool,
    ) {
        lock(&self.calls).push(CloudCall {
            kind,
            table: table.clone(),
            record_ids,
            rows,
            succeeded,
            at: Utc::now(),
        });
    }
}

impl Default for MemoryCloudAdapter {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn filter_ids(filter: &RecordFilter) -> Vec<String> {
    filter.get("id").and_then(value_key).into_iter().collect()
}

#[async_trait]
impl CloudAdapter for MemoryCloudAdapter {
    fn name(&self) -> &str {
        "memory"
    }

    async fn upsert(&self, table: &TableName, rows: Vec<Record>) -> CloudResult<()> {
        let mut ids = Vec::with_capacity(rows.len());
        for row in &rows {
            match record_id(row) {
                Some(id) => ids.push(id),
                None => {
                    self.record_call(CallKind::Upsert, table, ids, rows.clone(), false);
                    return Err(CloudError::Validation(format!(
                        "row without id for {}",
                        table
                    )));
                }
            }
        }

        if let Err(err) = self.simulate(&ids).await {
            self.record_call(CallKind::Upsert, table, ids, rows, false);
            return Err(err);
        }

        {
            let mut tables = lock(&self.tables);
            let stored = tables.entry(table.clone()).or_default();
            for (id, row) in ids.iter().zip(rows.iter()) {
                stored.insert(id.clone(), row.clone());
            }
        }
        self.record_call(CallKind::Upsert, table, ids, rows, true);
        Ok(())
    }

    async fn update(
        &self,
        table: &TableName,
        changes: Record,
        filter: &RecordFilter,
    ) -> CloudResult<()> {
        let ids = filter_ids(filter);
        if filter.is_empty() {
            self.record_call(CallKind::Update, table, ids, vec![changes], false);
            return Err(CloudError::Validation("update without filter".to_string()));
        }

        if let Err(err) = self.simulate(&ids).await {
            self.record_call(CallKind::Update, table, ids, vec![changes], false);
            return Err(err);
        }

        {
            let mut tables = lock(&self.tables);
            if let Some(rows) = tables.get_mut(table) {
                for row in rows.values_mut().filter(|row| filter.matches(row)) {
                    for (column, value) in &changes {
                        if column != "id" {
                            row.insert(column.clone(), value.clone());
                        }
                    }
                }
            }
        }
        self.record_call(CallKind::Update, table, ids, vec![changes], true);
        Ok(())
    }

    async fn delete(&self, table: &TableName, filter: &RecordFilter) -> CloudResult<()> {
        let ids = filter_ids(filter);
        if filter.is_empty() {
            self.record_call(CallKind::Delete, table, ids, Vec::new(), false);
            return Err(CloudError::Validation("delete without filter".to_string()));
        }

        if let Err(err) = self.simulate(&ids).await {
            self.record_call(CallKind::Delete, table, ids, Vec::new(), false);
            return Err(err);
        }

        {
            let mut tables = lock(&self.tables);
            if let Some(rows) = tables.get_mut(table) {
                rows.retain(|_, row| !filter.matches(row));
            }
        }
        self.record_call(CallKind::Delete, table, ids, Vec::new(), true);
        Ok(())
    }

    async fn ping(&self) -> CloudResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(CloudError::Network("replica unreachable".to_string()));
        }
        match lock(&self.ping_error).clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
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

    #[tokio::test]
    async fn test_upsert_is_last_write_wins() {
        let cloud = MemoryCloudAdapter::new();
        cloud
            .upsert(&table(), vec![record(json!({"id": "c1", "name": "Ada"}))])
            .await
            .unwrap();
        cloud
            .upsert(&table(), vec![record(json!({"id": "c1", "name": "Grace"}))])
            .await
            .unwrap();

        let row = cloud.get(&table(), "c1").unwrap();
        assert_eq!(row["name"], json!("Grace"));
        assert_eq!(cloud.rows(&table()).len(), 1);
    }

    #[tokio::test]
    async fn test_scripted_failures() {
        let cloud = MemoryCloudAdapter::new();
        cloud.fail_next(1, CloudError::Network("reset".into()));

        let first = cloud
            .upsert(&table(), vec![record(json!({"id": "c1"}))])
            .await;
        assert!(matches!(first, Err(CloudError::Network(_))));

        cloud
            .upsert(&table(), vec![record(json!({"id": "c1"}))])
            .await
            .unwrap();
        assert_eq!(cloud.calls().len(), 2);
        assert_eq!(cloud.applied().len(), 1);
    }

    #[tokio::test]
    async fn test_per_record_failures() {
        let cloud = MemoryCloudAdapter::new();
        cloud.fail_record("c2", 1, CloudError::Auth("expired".into()));

        cloud
            .upsert(&table(), vec![record(json!({"id": "c1"}))])
            .await
            .unwrap();
        let err = cloud
            .delete(&table(), &RecordFilter::by_id("c2"))
            .await
            .unwrap_err();
        assert!(matches!(err, CloudError::Auth(_)));
    }

    #[tokio::test]
    async fn test_update_and_delete_by_filter() {
        let cloud = MemoryCloudAdapter::new();
        cloud
            .upsert(&table(), vec![record(json!({"id": "c1", "name": "Ada"}))])
            .await
            .unwrap();

        cloud
            .update(
                &table(),
                record(json!({"name": "Grace"})),
                &RecordFilter::by_id("c1"),
            )
            .await
            .unwrap();
        assert_eq!(cloud.get(&table(), "c1").unwrap()["name"], json!("Grace"));

        cloud.delete(&table(), &RecordFilter::by_id("c1")).await.unwrap();
        assert!(cloud.get(&table(), "c1").is_none());
    }

    #[tokio::test]
    async fn test_unfiltered_writes_are_rejected() {
        let cloud = MemoryCloudAdapter::new();
        let err = cloud.delete(&table(), &RecordFilter::new()).await.unwrap_err();
        assert!(matches!(err, CloudError::Validation(_)));
    }

    #[tokio::test]
    async fn test_offline_fails_pings() {
        let cloud = MemoryCloudAdapter::new();
        assert!(cloud.ping().await.is_ok());

        cloud.set_offline(true);
        assert!(matches!(cloud.ping().await, Err(CloudError::Network(_))));

        cloud.set_offline(false);
        cloud.set_ping_error(Some(CloudError::Auth("revoked".into())));
        assert!(matches!(cloud.ping().await, Err(CloudError::Auth(_))));
    }
}
