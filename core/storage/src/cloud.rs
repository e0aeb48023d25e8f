//! Cloud adapter trait definition.

use async_trait::async_trait;

use hybridsync_common::{CloudError, Record, RecordFilter, TableName};

/// Result type for cloud calls, carrying the categorized failure.
pub type CloudResult<T> = std::result::Result<T, CloudError>;

/// Remote table operations against the cloud replica.
///
/// Every write is applied unconditionally (last-write-wins). Implementations
/// must map their transport failures onto [`CloudError`] so the outbox can
/// decide between retrying and dead-lettering.
#[async_trait]
pub trait CloudAdapter: Send + Sync {
    /// Get the adapter name (e.g., "memory", "rest").
    fn name(&self) -> &str;

    /// Insert rows, replacing any existing row with the same `id`.
    ///
    /// # Errors
    /// - `Validation` if a row has no `id`
    /// - `Auth`, `RateLimit`, `Network` from the transport
    async fn upsert(&self, table: &TableName, rows: Vec<Record>) -> CloudResult<()>;

    /// Apply `changes` to every row matching `filter`.
    ///
    /// # Errors
    /// - `Validation` if `filter` is empty
    async fn update(
        &self,
        table: &TableName,
        changes: Record,
        filter: &RecordFilter,
    ) -> CloudResult<()>;

    /// Delete every row matching `filter`.
    ///
    /// # Errors
    /// - `Validation` if `filter` is empty
    async fn delete(&self, table: &TableName, filter: &RecordFilter) -> CloudResult<()>;

    /// Liveness and credential check.
    async fn ping(&self) -> CloudResult<()>;
}
