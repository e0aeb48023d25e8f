//! hybridsync sync engine
//!
//! This module keeps a local store authoritative while mirroring every
//! mutation to a cloud replica in the background:
//! - Write orchestrator: local write first, cloud enqueue second
//! - Durable outbox with per-record ordering, backoff and backpressure
//! - Per-shop sync policy with a TTL cache over global defaults
//! - Admin surface for status, queue control and credentials checks

pub mod admin;
pub mod cache;
pub mod config;
pub mod journal;
pub mod operation;
pub mod orchestrator;
pub mod outbox;
pub mod policy;
mod processor;
pub mod retry;

// Re-export main types
pub use admin::{ApiResponse, Caller, Role, SyncAdmin};
pub use cache::TtlCache;
pub use config::{ConflictResolution, Feature, FeatureFlags, OverflowPolicy, ShopOverride, SyncPolicy};
pub use journal::{OutboxJournal, SqliteJournal};
pub use operation::{
    HistoryRecord, MutationOperation, OperationKind, OperationStatus, OperationType, OrderingKey,
};
pub use orchestrator::{SyncStatus, WriteOptions, WriteOrchestrator};
pub use outbox::{DrainReport, Outbox, OutboxConfig, QueueStats};
pub use policy::{
    ConnectionCheck, CostBreakdown, CostItem, MemoryPolicyStore, PolicyEvent, PolicyStatus,
    PolicyStore, SqlitePolicyStore, SyncMode, SyncPolicyProvider,
};
pub use retry::{RetryConfig, RetryDecision, RetryExecutor};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_exports() {
        let _policy = SyncPolicy::default();
        let _retry_config = RetryConfig::default();
        let _outbox_config = OutboxConfig::default();
        let _cache: TtlCache<String, u32> = TtlCache::new(std::time::Duration::from_secs(1));
    }
}
