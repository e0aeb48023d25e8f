//! Queued mutation operations and their state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use hybridsync_common::{
    record_id, value_key, Error, Record, RecordFilter, Result, ShopId, TableName,
};

/// The mutation to replay against the cloud replica.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum OperationType {
    /// A row created locally; replayed as an upsert.
    Create { record: Record },
    /// Columns changed on every row matching `filter`.
    Update { changes: Record, filter: RecordFilter },
    /// Rows removed locally.
    Delete { filter: RecordFilter },
    /// Rows created by one bulk import; replayed as a single upsert.
    BulkCreate { records: Vec<Record> },
}

impl OperationType {
    /// The fieldless kind of this operation.
    pub fn kind(&self) -> OperationKind {
        match self {
            OperationType::Create { .. } => OperationKind::Create,
            OperationType::Update { .. } => OperationKind::Update,
            OperationType::Delete { .. } => OperationKind::Delete,
            OperationType::BulkCreate { .. } => OperationKind::BulkCreate,
        }
    }

    /// Ids of the records this operation touches, where resolvable.
    pub fn record_keys(&self) -> Vec<String> {
        match self {
            OperationType::Create { record } => record_id(record).into_iter().collect(),
            OperationType::Update { changes, filter } => filter
                .get("id")
                .and_then(value_key)
                .or_else(|| record_id(changes))
                .into_iter()
                .collect(),
            OperationType::Delete { filter } => {
                filter.get("id").and_then(value_key).into_iter().collect()
            }
            OperationType::BulkCreate { records } => {
                let mut keys: Vec<String> = records.iter().filter_map(record_id).collect();
                keys.sort();
                keys.dedup();
                keys
            }
        }
    }
}

/// Operation kind without payload, for stats and history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
    BulkCreate,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationKind::Create => "create",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
            OperationKind::BulkCreate => "bulkCreate",
        };
        write!(f, "{}", name)
    }
}

/// Delivery state of a queued operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    /// Waiting for its next delivery attempt.
    Pending,
    /// Handed to the cloud adapter.
    InFlight,
    /// Applied to the replica (terminal).
    Synced,
    /// Retries exhausted or not retryable (terminal).
    Failed,
}

/// Per-key ordering scope: mutations sharing a key are applied in enqueue order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OrderingKey {
    pub shop_id: ShopId,
    pub table: TableName,
    pub record: String,
}

/// A mutation waiting in the outbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationOperation {
    /// Unique ID for this operation.
    pub id: String,
    /// Enqueue sequence number; the FIFO order key.
    pub seq: u64,
    pub shop_id: ShopId,
    pub table: TableName,
    pub op: OperationType,
    pub enqueued_at: DateTime<Utc>,
    /// Retries scheduled so far.
    pub attempts: u32,
    pub last_error: Option<String>,
    pub status: OperationStatus,
    /// Not eligible for delivery before this instant.
    pub next_attempt_at: DateTime<Utc>,
}

impl MutationOperation {
    /// Create a new pending operation, eligible immediately.
    pub fn new(seq: u64, shop_id: ShopId, table: TableName, op: OperationType) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            seq,
            shop_id,
            table,
            op,
            enqueued_at: now,
            attempts: 0,
            last_error: None,
            status: OperationStatus::Pending,
            next_attempt_at: now,
        }
    }

    /// The kind of mutation carried.
    pub fn kind(&self) -> OperationKind {
        self.op.kind()
    }

    /// Ordering keys of this operation.
    ///
    /// Operations whose records cannot be identified get a private key, so
    /// they are never held back by (and never hold back) other operations.
    pub fn ordering_keys(&self) -> Vec<OrderingKey> {
        let mut records = self.op.record_keys();
        if records.is_empty() {
            records.push(format!("op:{}", self.id));
        }
        records
            .into_iter()
            .map(|record| OrderingKey {
                shop_id: self.shop_id.clone(),
                table: self.table.clone(),
                record,
            })
            .collect()
    }

    /// Check whether the operation may be dispatched at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == OperationStatus::Pending && self.next_attempt_at <= now
    }

    /// Pending -> InFlight.
    pub fn mark_in_flight(&mut self) -> Result<()> {
        self.transition(OperationStatus::Pending, OperationStatus::InFlight)
    }

    /// InFlight -> Synced.
    pub fn mark_synced(&mut self) -> Result<()> {
        self.transition(OperationStatus::InFlight, OperationStatus::Synced)?;
        self.last_error = None;
        Ok(())
    }

    /// InFlight -> Pending, counting one more retry.
    pub fn schedule_retry(&mut self, error: impl Into<String>, at: DateTime<Utc>) -> Result<()> {
        self.transition(OperationStatus::InFlight, OperationStatus::Pending)?;
        self.attempts += 1;
        self.last_error = Some(error.into());
        self.next_attempt_at = at;
        Ok(())
    }

    /// InFlight -> Failed.
    pub fn mark_failed(&mut self, error: impl Into<String>) -> Result<()> {
        self.transition(OperationStatus::InFlight, OperationStatus::Failed)?;
        self.last_error = Some(error.into());
        Ok(())
    }

    /// Pending -> Failed, for an operation dropped without being attempted.
    pub fn evict(&mut self, reason: impl Into<String>) -> Result<()> {
        self.transition(OperationStatus::Pending, OperationStatus::Failed)?;
        self.last_error = Some(reason.into());
        Ok(())
    }

    /// Put an operation left in flight by a crash back in line.
    pub fn recover(&mut self) {
        if self.status == OperationStatus::InFlight {
            self.status = OperationStatus::Pending;
        }
    }

    fn transition(&mut self, from: OperationStatus, to: OperationStatus) -> Result<()> {
        if self.status != from {
            return Err(Error::InvalidInput(format!(
                "operation {} cannot move from {:?} to {:?}",
                self.id, self.status, to
            )));
        }
        self.status = to;
        Ok(())
    }

    /// Trimmed copy for the history log.
    pub fn to_history(&self) -> HistoryRecord {
        HistoryRecord {
            id: self.id.clone(),
            shop_id: self.shop_id.clone(),
            table: self.table.clone(),
            op_kind: self.kind(),
            status: self.status,
            attempts: self.attempts,
            last_error: self.last_error.clone(),
            enqueued_at: self.enqueued_at,
            finished_at: Utc::now(),
        }
    }
}

/// Immutable record of a terminal outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRecord {
    pub id: String,
    pub shop_id: ShopId,
    pub table: TableName,
    pub op_kind: OperationKind,
    pub status: OperationStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}
