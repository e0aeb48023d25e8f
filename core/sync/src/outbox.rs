//! Durable outbox of cloud-bound mutations.
//!
//! Mutations are appended after their local write succeeded and drained to
//! the cloud adapter in passes. A pass selects due operations in enqueue
//! order, never letting a later mutation of a record overtake an earlier one
//! that is still pending, and runs unrelated records concurrently.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use hybridsync_common::{EnqueueError, Record, RecordFilter, Result, ShopId, TableName};
use hybridsync_storage::{CloudAdapter, CloudResult};

use crate::config::{OverflowPolicy, SyncPolicy};
use crate::journal::OutboxJournal;
use crate::operation::{
    HistoryRecord, MutationOperation, OperationStatus, OperationType, OrderingKey,
};
use crate::processor::Processor;
use crate::retry::{RetryConfig, RetryDecision};

/// Result of an enqueue.
pub type EnqueueResult<T> = std::result::Result<T, EnqueueError>;

/// Cap for exponential retry backoff.
pub const DEFAULT_MAX_RETRY_DELAY: Duration = Duration::from_secs(300);

/// Number of terminal outcomes kept in history.
pub const DEFAULT_HISTORY_LIMIT: usize = 1000;

/// `last_error` of operations dropped by the evict-oldest policy.
pub const EVICTED_REASON: &str = "evicted: offline queue limit reached";

/// Outbox settings.
#[derive(Debug, Clone)]
pub struct OutboxConfig {
    /// Maximum operations dispatched per pass.
    pub batch_size: usize,
    /// Retry budget and backoff.
    pub retry: RetryConfig,
    /// Maximum pending operations.
    pub offline_queue_limit: usize,
    pub overflow_policy: OverflowPolicy,
    pub history_limit: usize,
    /// Period of the background processor.
    pub sync_interval: Duration,
}

impl OutboxConfig {
    /// Derive outbox settings from a sync policy.
    pub fn from_policy(policy: &SyncPolicy) -> Self {
        Self {
            batch_size: policy.batch_size.max(1),
            retry: RetryConfig::new(policy.retry_attempts)
                .with_initial_delay(policy.retry_delay())
                .with_max_delay(DEFAULT_MAX_RETRY_DELAY),
            offline_queue_limit: policy.offline_queue_limit.max(1),
            overflow_policy: policy.overflow_policy,
            history_limit: DEFAULT_HISTORY_LIMIT,
            sync_interval: policy.sync_interval(),
        }
    }
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self::from_policy(&SyncPolicy::default())
    }
}

/// Running counters, maintained incrementally.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub queue_size: usize,
    pub total_processed: u64,
    pub total_failed: u64,
    pub total_retried: u64,
    pub total_rejected: u64,
    pub total_evicted: u64,
    pub last_sync: Option<DateTime<Utc>>,
}

/// Outcome of one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DrainReport {
    pub processed: usize,
    pub failed: usize,
    pub retried: usize,
    /// Operations still queued after the pass.
    pub remaining: usize,
}

impl DrainReport {
    fn merge(mut self, other: DrainReport) -> Self {
        self.processed += other.processed;
        self.failed += other.failed;
        self.retried += other.retried;
        self
    }
}

enum Delivery {
    Synced,
    Retried,
    Failed,
    /// The operation vanished from the queue mid-flight.
    Missing,
}

enum JournalWrite {
    Update(MutationOperation),
    Remove(String),
}

struct QueueState {
    /// Queued operations (pending and in flight) by `seq`.
    ops: BTreeMap<u64, MutationOperation>,
    /// Operation id -> `seq`.
    index: HashMap<String, u64>,
    next_seq: u64,
    stats: QueueStats,
    /// Most recent first.
    history: VecDeque<HistoryRecord>,
}

impl QueueState {
    fn new() -> Self {
        Self {
            ops: BTreeMap::new(),
            index: HashMap::new(),
            next_seq: 1,
            stats: QueueStats::default(),
            history: VecDeque::new(),
        }
    }

    fn insert(&mut self, op: MutationOperation) {
        self.index.insert(op.id.clone(), op.seq);
        self.ops.insert(op.seq, op);
        self.stats.queue_size = self.ops.len();
    }

    fn take(&mut self, id: &str) -> Option<MutationOperation> {
        let seq = self.index.remove(id)?;
        let op = self.ops.remove(&seq);
        self.stats.queue_size = self.ops.len();
        op
    }

    fn get_mut(&mut self, id: &str) -> Option<&mut MutationOperation> {
        let seq = *self.index.get(id)?;
        self.ops.get_mut(&seq)
    }

    fn oldest_pending(&self) -> Option<String> {
        self.ops
            .values()
            .find(|op| op.status == OperationStatus::Pending)
            .map(|op| op.id.clone())
    }

    fn record(&mut self, entry: HistoryRecord, limit: usize) {
        self.history.push_front(entry);
        self.history.truncate(limit);
    }
}

/// Queue of mutations awaiting delivery to the cloud replica.
pub struct Outbox {
    state: Mutex<QueueState>,
    config: RwLock<OutboxConfig>,
    cloud: Arc<dyn CloudAdapter>,
    journal: Option<Arc<dyn OutboxJournal>>,
    /// Serializes enqueues so the capacity check holds across the journal
    /// append.
    enqueue_lock: Mutex<()>,
    /// Keeps journal writes in the order of the state changes they mirror.
    /// Taken while `state` is held, then `state` is released for the I/O.
    journal_order: Mutex<()>,
    /// Serializes drain passes.
    pass_lock: tokio::sync::Mutex<()>,
    processor: Processor,
}

impl Outbox {
    /// Create an in-memory outbox.
    pub fn new(cloud: Arc<dyn CloudAdapter>, config: OutboxConfig) -> Self {
        Self {
            state: Mutex::new(QueueState::new()),
            config: RwLock::new(config),
            cloud,
            journal: None,
            enqueue_lock: Mutex::new(()),
            journal_order: Mutex::new(()),
            pass_lock: tokio::sync::Mutex::new(()),
            processor: Processor::new(),
        }
    }

    /// Create an outbox backed by a journal, replaying what it holds.
    ///
    /// Operations journaled while in flight are put back to pending; they
    /// may be delivered again.
    ///
    /// # Errors
    /// - Any error loading the journal
    pub fn open(
        cloud: Arc<dyn CloudAdapter>,
        config: OutboxConfig,
        journal: Arc<dyn OutboxJournal>,
    ) -> Result<Self> {
        let mut state = QueueState::new();
        let mut recovered = 0;
        for mut op in journal.load()? {
            if op.status == OperationStatus::InFlight {
                op.recover();
                journal.update(&op)?;
                recovered += 1;
            }
            state.next_seq = state.next_seq.max(op.seq + 1);
            state.insert(op);
        }

        info!(
            "Outbox restored {} pending operations ({} were in flight)",
            state.ops.len(),
            recovered
        );

        Ok(Self {
            state: Mutex::new(state),
            config: RwLock::new(config),
            cloud,
            journal: Some(journal),
            enqueue_lock: Mutex::new(()),
            journal_order: Mutex::new(()),
            pass_lock: tokio::sync::Mutex::new(()),
            processor: Processor::new(),
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current settings.
    pub fn config(&self) -> OutboxConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the settings; takes effect from the next pass.
    pub fn reconfigure(&self, config: OutboxConfig) {
        debug!(
            "Outbox reconfigured: batch {}, {} retries, limit {}",
            config.batch_size, config.retry.max_retries, config.offline_queue_limit
        );
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = config;
    }

    pub fn queue_create(
        &self,
        shop_id: ShopId,
        table: TableName,
        record: Record,
    ) -> EnqueueResult<String> {
        self.enqueue(shop_id, table, OperationType::Create { record })
    }

    pub fn queue_update(
        &self,
        shop_id: ShopId,
        table: TableName,
        changes: Record,
        filter: RecordFilter,
    ) -> EnqueueResult<String> {
        self.enqueue(shop_id, table, OperationType::Update { changes, filter })
    }

    pub fn queue_delete(
        &self,
        shop_id: ShopId,
        table: TableName,
        filter: RecordFilter,
    ) -> EnqueueResult<String> {
        self.enqueue(shop_id, table, OperationType::Delete { filter })
    }

    pub fn queue_bulk_create(
        &self,
        shop_id: ShopId,
        table: TableName,
        records: Vec<Record>,
    ) -> EnqueueResult<String> {
        self.enqueue(shop_id, table, OperationType::BulkCreate { records })
    }

    /// Append an operation and return its id.
    ///
    /// # Errors
    /// - `InvalidOperation` for an unfiltered update/delete or an empty bulk
    /// - `QueueFull` when at the offline queue limit under the reject-new policy
    /// - `Journal` if the operation could not be persisted
    pub fn enqueue(
        &self,
        shop_id: ShopId,
        table: TableName,
        op: OperationType,
    ) -> EnqueueResult<String> {
        validate(&op)?;
        let config = self.config();
        let _enqueue = self.enqueue_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let operation = {
            let mut state = self.lock_state();
            if state.ops.len() >= config.offline_queue_limit
                && (config.overflow_policy == OverflowPolicy::RejectNew
                    || state.oldest_pending().is_none())
            {
                state.stats.total_rejected += 1;
                warn!(
                    "Outbox full ({} operations), rejecting {} on {}",
                    state.ops.len(),
                    op.kind(),
                    table
                );
                return Err(EnqueueError::QueueFull {
                    limit: config.offline_queue_limit,
                });
            }
            let operation = MutationOperation::new(state.next_seq, shop_id, table, op);
            state.next_seq += 1;
            operation
        };

        // Not yet visible to passes, so nothing else journals this id first.
        if let Some(journal) = &self.journal {
            journal
                .append(&operation)
                .map_err(|e| EnqueueError::Journal(e.to_string()))?;
        }

        let mut state = self.lock_state();
        let mut writes = Vec::new();
        if state.ops.len() >= config.offline_queue_limit {
            // Every queued operation may have gone in flight since the check;
            // then the queue briefly holds one more than the limit.
            if let Some(id) = state.oldest_pending() {
                if let Some(mut evicted) = state.take(&id) {
                    if let Err(e) = evicted.evict(EVICTED_REASON) {
                        warn!("Eviction of {} failed: {}", evicted.id, e);
                    }
                    warn!(
                        "Outbox full, evicted {} {} on {}",
                        evicted.kind(),
                        evicted.id,
                        evicted.table
                    );
                    state.stats.total_evicted += 1;
                    state.stats.total_failed += 1;
                    state.record(evicted.to_history(), config.history_limit);
                    writes.push(JournalWrite::Remove(evicted.id));
                }
            }
        }

        let id = operation.id.clone();
        debug!(
            "Queued {} {} on {} for shop {} (seq {})",
            operation.kind(),
            id,
            operation.table,
            operation.shop_id,
            operation.seq
        );
        state.insert(operation);
        self.persist(state, writes);
        Ok(id)
    }

    /// Counters snapshot.
    pub fn stats(&self) -> QueueStats {
        self.lock_state().stats.clone()
    }

    /// Number of queued operations.
    pub fn pending_count(&self) -> usize {
        self.lock_state().ops.len()
    }

    /// Snapshot of the queue in enqueue order.
    pub fn queue(&self) -> Vec<MutationOperation> {
        self.lock_state().ops.values().cloned().collect()
    }

    /// Up to `limit` terminal outcomes, most recent first.
    pub fn history(&self, limit: usize) -> Vec<HistoryRecord> {
        self.lock_state()
            .history
            .iter()
            .take(limit)
            .cloned()
            .collect()
    }

    /// Drop every pending operation and return how many were removed.
    ///
    /// Operations in flight finish their delivery.
    pub fn clear_queue(&self) -> usize {
        let mut state = self.lock_state();
        let doomed: Vec<String> = state
            .ops
            .values()
            .filter(|op| op.status == OperationStatus::Pending)
            .map(|op| op.id.clone())
            .collect();
        for id in &doomed {
            state.take(id);
        }
        let removed = doomed.len();
        self.persist(state, doomed.into_iter().map(JournalWrite::Remove).collect());
        info!("Cleared {} pending operations", removed);
        removed
    }

    /// Run one drain pass now.
    ///
    /// Waits for a pass already in progress, then runs its own.
    pub async fn trigger_sync(&self) -> DrainReport {
        let _pass = self.pass_lock.lock().await;
        let config = self.config();

        let batch = {
            let state = self.lock_state();
            select_batch(state.ops.values(), Utc::now(), config.batch_size)
        };
        if batch.is_empty() {
            return DrainReport {
                remaining: self.pending_count(),
                ..DrainReport::default()
            };
        }

        let selected = batch.len();
        let groups = group_by_keys(batch);
        debug!(
            "Drain pass: {} operations in {} groups",
            selected,
            groups.len()
        );

        let reports = join_all(
            groups
                .into_iter()
                .map(|group| self.run_group(group, &config)),
        )
        .await;
        let mut report = reports
            .into_iter()
            .fold(DrainReport::default(), DrainReport::merge);

        {
            let mut state = self.lock_state();
            state.stats.last_sync = Some(Utc::now());
            report.remaining = state.ops.len();
        }

        info!(
            "Drain pass complete: {} processed, {} retried, {} failed, {} remaining",
            report.processed, report.retried, report.failed, report.remaining
        );
        report
    }

    /// Deliver a group in order, stopping at the first operation that does
    /// not succeed.
    async fn run_group(&self, group: Vec<MutationOperation>, config: &OutboxConfig) -> DrainReport {
        let mut report = DrainReport::default();
        for selected in group {
            let Some(op) = self.begin(&selected.id) else {
                debug!("Operation {} left the queue before dispatch", selected.id);
                continue;
            };

            let result = self.dispatch(&op).await;
            match self.complete(&op.id, result, config) {
                Delivery::Synced => report.processed += 1,
                Delivery::Retried => {
                    report.retried += 1;
                    break;
                }
                Delivery::Failed => {
                    report.failed += 1;
                    break;
                }
                Delivery::Missing => {}
            }
        }
        report
    }

    /// Mark an operation in flight and return a copy for dispatch.
    fn begin(&self, id: &str) -> Option<MutationOperation> {
        let mut state = self.lock_state();
        let op = state.get_mut(id)?;
        op.mark_in_flight().ok()?;
        Some(op.clone())
    }

    async fn dispatch(&self, op: &MutationOperation) -> CloudResult<()> {
        match &op.op {
            OperationType::Create { record } => {
                self.cloud.upsert(&op.table, vec![record.clone()]).await
            }
            OperationType::Update { changes, filter } => {
                self.cloud.update(&op.table, changes.clone(), filter).await
            }
            OperationType::Delete { filter } => self.cloud.delete(&op.table, filter).await,
            OperationType::BulkCreate { records } => {
                self.cloud.upsert(&op.table, records.clone()).await
            }
        }
    }

    /// Apply the outcome of a delivery to the queue.
    fn complete(&self, id: &str, result: CloudResult<()>, config: &OutboxConfig) -> Delivery {
        let mut state = self.lock_state();

        let err = match result {
            Ok(()) => {
                let Some(mut op) = state.take(id) else {
                    return Delivery::Missing;
                };
                if let Err(e) = op.mark_synced() {
                    warn!("{}", e);
                }
                debug!("Synced {} {} on {}", op.kind(), op.id, op.table);
                state.stats.total_processed += 1;
                state.record(op.to_history(), config.history_limit);
                self.persist(state, vec![JournalWrite::Remove(op.id)]);
                return Delivery::Synced;
            }
            Err(err) => err,
        };

        let Some(attempts) = state.get_mut(id).map(|op| op.attempts) else {
            return Delivery::Missing;
        };

        match config.retry.decide(attempts, &err) {
            RetryDecision::Retry(delay) => {
                let backoff =
                    chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
                let at = Utc::now() + backoff;
                let Some(op) = state.get_mut(id) else {
                    return Delivery::Missing;
                };
                if let Err(e) = op.schedule_retry(err.to_string(), at) {
                    warn!("{}", e);
                }
                let snapshot = op.clone();
                state.stats.total_retried += 1;

                warn!(
                    "{} {} on {} failed ({}), retry {} in {:?}",
                    snapshot.kind(),
                    snapshot.id,
                    snapshot.table,
                    err,
                    snapshot.attempts,
                    delay
                );
                self.persist(state, vec![JournalWrite::Update(snapshot)]);
                Delivery::Retried
            }
            RetryDecision::DeadLetter => {
                let Some(mut op) = state.take(id) else {
                    return Delivery::Missing;
                };
                if let Err(e) = op.mark_failed(err.to_string()) {
                    warn!("{}", e);
                }
                error!(
                    "{} {} on {} failed permanently after {} deliveries ({}): {}",
                    op.kind(),
                    op.id,
                    op.table,
                    op.attempts + 1,
                    err.kind(),
                    err
                );
                state.stats.total_failed += 1;
                state.record(op.to_history(), config.history_limit);
                self.persist(state, vec![JournalWrite::Remove(op.id)]);
                Delivery::Failed
            }
        }
    }

    /// Release `state` and apply `writes` to the journal in order.
    ///
    /// Failures are logged; the in-memory queue stays authoritative.
    fn persist(&self, state: MutexGuard<'_, QueueState>, writes: Vec<JournalWrite>) {
        let Some(journal) = &self.journal else {
            return;
        };
        if writes.is_empty() {
            return;
        }
        let _order = self.journal_order.lock().unwrap_or_else(PoisonError::into_inner);
        drop(state);

        for write in writes {
            let (id, result) = match &write {
                JournalWrite::Update(op) => (op.id.as_str(), journal.update(op)),
                JournalWrite::Remove(id) => (id.as_str(), journal.remove(id)),
            };
            if let Err(e) = result {
                warn!("Failed to journal operation {}: {}", id, e);
            }
        }
    }

    /// Start the background processor. Returns false if already running.
    pub async fn start_processor(self: &Arc<Self>) -> bool {
        let interval = self.config().sync_interval;
        self.processor.start(Arc::downgrade(self), interval).await
    }

    /// Stop the background processor, letting a running pass finish.
    /// Returns false if it was not running.
    pub async fn stop_processor(&self) -> bool {
        self.processor.stop().await
    }

    pub async fn is_running(&self) -> bool {
        self.processor.is_running().await
    }
}

fn validate(op: &OperationType) -> EnqueueResult<()> {
    match op {
        OperationType::Update { filter, .. } | OperationType::Delete { filter }
            if filter.is_empty() =>
        {
            Err(EnqueueError::InvalidOperation(format!(
                "{} without filter",
                op.kind()
            )))
        }
        OperationType::BulkCreate { records } if records.is_empty() => Err(
            EnqueueError::InvalidOperation("bulk create without records".to_string()),
        ),
        _ => Ok(()),
    }
}

/// Choose the operations of one pass.
///
/// Walks in `seq` order. An operation is taken when it is due, none of its
/// keys is blocked and the batch has room; any operation walked past blocks
/// its keys for the rest of the walk.
fn select_batch<'a>(
    ops: impl Iterator<Item = &'a MutationOperation>,
    now: DateTime<Utc>,
    batch_size: usize,
) -> Vec<MutationOperation> {
    let mut blocked: HashSet<OrderingKey> = HashSet::new();
    let mut selected = Vec::new();

    for op in ops {
        if selected.len() >= batch_size {
            break;
        }
        let keys = op.ordering_keys();
        if op.is_due(now) && !keys.iter().any(|key| blocked.contains(key)) {
            selected.push(op.clone());
        } else {
            blocked.extend(keys);
        }
    }
    selected
}

/// Partition operations into groups connected by shared ordering keys,
/// each sorted by `seq`.
fn group_by_keys(ops: Vec<MutationOperation>) -> Vec<Vec<MutationOperation>> {
    let mut groups: Vec<Vec<MutationOperation>> = Vec::new();
    let mut owner: HashMap<OrderingKey, usize> = HashMap::new();

    for op in ops {
        let keys = op.ordering_keys();
        let mut hits: Vec<usize> = keys.iter().filter_map(|k| owner.get(k).copied()).collect();
        hits.sort_unstable();
        hits.dedup();

        let target = match hits.split_first() {
            Some((&first, rest)) => {
                for &other in rest {
                    let moved = std::mem::take(&mut groups[other]);
                    for member in &moved {
                        for key in member.ordering_keys() {
                            owner.insert(key, first);
                        }
                    }
                    groups[first].extend(moved);
                }
                first
            }
            None => {
                groups.push(Vec::new());
                groups.len() - 1
            }
        };

        for key in keys {
            owner.insert(key, target);
        }
        groups[target].push(op);
    }

    groups.retain(|group| !group.is_empty());
    for group in &mut groups {
        group.sort_by_key(|op| op.seq);
    }
    groups
}
