//! Write orchestrator: local-first writes mirrored to the cloud.
//!
//! Every mutation is committed to the local store first. Only then, and only
//! when sync is enabled for the record's shop, is a matching operation
//! queued in the outbox. Queueing is advisory: a failure is logged and the
//! local result is returned regardless.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use hybridsync_common::{
    record_id, value_key, Error, Record, RecordFilter, Result, ShopId, TableName,
};
use hybridsync_storage::{CloudAdapter, LocalStore};

use crate::operation::OperationType;
use crate::outbox::{Outbox, OutboxConfig, QueueStats};
use crate::policy::{PolicyEvent, PolicyStatus, SyncMode, SyncPolicyProvider};
use crate::retry::{RetryConfig, RetryExecutor};

/// Per-call write options.
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    /// Tenant to tag the mutation with; resolved from the data when unset.
    pub shop_id: Option<ShopId>,
    /// Write locally only.
    pub skip_sync: bool,
}

impl WriteOptions {
    pub fn for_shop(shop_id: ShopId) -> Self {
        Self {
            shop_id: Some(shop_id),
            skip_sync: false,
        }
    }

    pub fn local_only() -> Self {
        Self {
            shop_id: None,
            skip_sync: true,
        }
    }
}

/// Combined view of the sync engine.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub mode: SyncMode,
    pub enabled: bool,
    pub processor_running: bool,
    pub local_store: String,
    pub cloud: String,
    pub queue: QueueStats,
    pub policy: PolicyStatus,
}

/// Coordinates local writes, the outbox and the sync policy.
pub struct WriteOrchestrator {
    local: Arc<dyn LocalStore>,
    cloud: Arc<dyn CloudAdapter>,
    outbox: Arc<Outbox>,
    policy: Arc<SyncPolicyProvider>,
    enabled: AtomicBool,
    listener: Mutex<Option<JoinHandle<()>>>,
    force_retry: RetryConfig,
}

impl WriteOrchestrator {
    /// Create an orchestrator. Sync starts out as enabled in the global
    /// policy; call [`initialize`](Self::initialize) to start processing.
    pub fn new(
        local: Arc<dyn LocalStore>,
        cloud: Arc<dyn CloudAdapter>,
        outbox: Arc<Outbox>,
        policy: Arc<SyncPolicyProvider>,
    ) -> Self {
        let enabled = policy.global().enabled;
        Self {
            local,
            cloud,
            outbox,
            policy,
            enabled: AtomicBool::new(enabled),
            listener: Mutex::new(None),
            force_retry: RetryConfig::new(2).with_initial_delay(Duration::from_millis(200)),
        }
    }

    /// Override the inline retry used by [`force_sync_record`](Self::force_sync_record).
    pub fn with_force_retry(mut self, retry: RetryConfig) -> Self {
        self.force_retry = retry;
        self
    }

    pub fn outbox(&self) -> &Arc<Outbox> {
        &self.outbox
    }

    pub fn policy(&self) -> &Arc<SyncPolicyProvider> {
        &self.policy
    }

    pub fn local(&self) -> &Arc<dyn LocalStore> {
        &self.local
    }

    /// Whether sync is switched on at runtime.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Start the processor when sync is enabled and listen for policy
    /// changes.
    ///
    /// A failed credential check is logged but does not keep the processor
    /// from starting; queued work waits for the cloud to come back.
    pub async fn initialize(self: &Arc<Self>) -> Result<()> {
        if self.is_enabled() {
            if let Err(e) = self.policy.check_connection().await {
                warn!("Cloud not reachable at startup, operations will queue: {}", e);
            }
            self.outbox.start_processor().await;
            info!("Sync engine started in hybrid mode");
        } else {
            info!("Sync engine started in local-only mode");
        }

        let mut listener = self.listener.lock().await;
        if listener.is_none() {
            let events = self.policy.subscribe();
            *listener = Some(tokio::spawn(listen(Arc::downgrade(self), events)));
        }
        Ok(())
    }

    /// Stop the policy listener and the processor, letting a running pass
    /// finish.
    pub async fn shutdown(&self) {
        if let Some(listener) = self.listener.lock().await.take() {
            listener.abort();
        }
        self.outbox.stop_processor().await;
        info!("Sync engine stopped");
    }

    /// Insert a record locally and queue it for the cloud.
    ///
    /// # Errors
    /// - `LocalWrite` if the local insert failed; nothing is queued
    pub async fn create(
        &self,
        table: &TableName,
        data: Record,
        options: WriteOptions,
    ) -> Result<Record> {
        let stored = self.local.insert(table, data).map_err(local_write)?;

        let shop_id = resolve_shop(&options, &stored);
        if self.should_sync(&shop_id, &options) {
            self.enqueue(&shop_id, table, OperationType::Create {
                record: stored.clone(),
            });
        }
        Ok(stored)
    }

    /// Update matching rows locally and queue the change.
    ///
    /// When the filter does not name an `id`, one update per affected row is
    /// queued so each row keeps its own ordering.
    pub async fn update(
        &self,
        table: &TableName,
        changes: Record,
        filter: RecordFilter,
        options: WriteOptions,
    ) -> Result<Vec<Record>> {
        let updated = self
            .local
            .update(table, &changes, &filter)
            .map_err(local_write)?;
        if updated.is_empty() {
            debug!("Update on {} matched no rows, nothing to sync", table);
            return Ok(updated);
        }

        let explicit = options
            .shop_id
            .clone()
            .or_else(|| ShopId::from_record(&changes));
        for (shop_id, filter) in row_targets(explicit, &filter, &updated) {
            if self.should_sync(&shop_id, &options) {
                self.enqueue(&shop_id, table, OperationType::Update {
                    changes: changes.clone(),
                    filter,
                });
            }
        }
        Ok(updated)
    }

    /// Delete matching rows locally and queue the deletion.
    pub async fn delete(
        &self,
        table: &TableName,
        filter: RecordFilter,
        options: WriteOptions,
    ) -> Result<Vec<Record>> {
        let deleted = self.local.delete(table, &filter).map_err(local_write)?;
        if deleted.is_empty() {
            debug!("Delete on {} matched no rows, nothing to sync", table);
            return Ok(deleted);
        }

        let explicit = options
            .shop_id
            .clone()
            .or_else(|| shop_from_filter(&filter));
        for (shop_id, filter) in row_targets(explicit, &filter, &deleted) {
            if self.should_sync(&shop_id, &options) {
                self.enqueue(&shop_id, table, OperationType::Delete { filter });
            }
        }
        Ok(deleted)
    }

    /// Insert records one by one and queue them as a single bulk operation.
    ///
    /// A failing insert stops the import. Rows written before it stay
    /// written and are still queued.
    ///
    /// # Errors
    /// - `LocalWrite` from the first failing insert
    pub async fn bulk_create(
        &self,
        table: &TableName,
        records: Vec<Record>,
        options: WriteOptions,
    ) -> Result<Vec<Record>> {
        let mut committed = Vec::with_capacity(records.len());
        let mut failure = None;
        for record in records {
            match self.local.insert(table, record) {
                Ok(stored) => committed.push(stored),
                Err(e) => {
                    failure = Some(local_write(e));
                    break;
                }
            }
        }

        if !committed.is_empty() {
            let shop_id = resolve_shop(&options, &committed[0]);
            if self.should_sync(&shop_id, &options) {
                self.enqueue(&shop_id, table, OperationType::BulkCreate {
                    records: committed.clone(),
                });
            }
        }

        match failure {
            Some(e) => {
                warn!(
                    "Bulk create on {} stopped after {} rows: {}",
                    table,
                    committed.len(),
                    e
                );
                Err(e)
            }
            None => Ok(committed),
        }
    }

    /// Push the current local row straight to the cloud, bypassing the
    /// outbox.
    ///
    /// # Errors
    /// - `SyncDisabled` if sync is off
    /// - `NotFound` if no local row matches
    /// - `Cloud` if the upsert fails after inline retries
    pub async fn force_sync_record(
        &self,
        table: &TableName,
        filter: &RecordFilter,
    ) -> Result<Record> {
        if !self.is_enabled() {
            return Err(Error::SyncDisabled("cloud sync is turned off".to_string()));
        }

        let row = self
            .local
            .query(table, filter)?
            .into_iter()
            .next()
            .ok_or_else(|| Error::NotFound(format!("no {} row matches {}", table, filter)))?;

        let shop_id = ShopId::from_record(&row).unwrap_or_else(ShopId::default_shop);
        if !self.policy.get_shop_config(&shop_id).enabled {
            return Err(Error::SyncDisabled(format!(
                "cloud sync is turned off for shop {}",
                shop_id
            )));
        }

        let executor = RetryExecutor::new(self.force_retry.clone());
        executor
            .execute(|| self.cloud.upsert(table, vec![row.clone()]))
            .await?;

        info!(
            "Force-synced {}/{}",
            table,
            record_id(&row).unwrap_or_default()
        );
        Ok(row)
    }

    pub async fn get_sync_status(&self) -> SyncStatus {
        let enabled = self.is_enabled();
        SyncStatus {
            mode: SyncMode::from_enabled(enabled),
            enabled,
            processor_running: self.outbox.is_running().await,
            local_store: self.local.name().to_string(),
            cloud: self.cloud.name().to_string(),
            queue: self.outbox.stats(),
            policy: self.policy.policy_status(),
        }
    }

    /// Switch sync on or off at runtime.
    ///
    /// Enabling checks the cloud first and fails if it is unreachable or
    /// rejects the credentials. Queued operations are kept while disabled.
    /// The global policy flag follows the runtime state.
    ///
    /// # Errors
    /// - `Cloud` if the credential check fails
    pub async fn set_sync_enabled(&self, enabled: bool) -> Result<()> {
        if enabled {
            self.policy.check_connection().await?;
            self.enabled.store(true, Ordering::SeqCst);
            self.policy.set_global_enabled(true);
            if self.outbox.start_processor().await {
                info!(
                    "Cloud sync enabled, {} operations queued",
                    self.outbox.pending_count()
                );
            }
        } else {
            self.enabled.store(false, Ordering::SeqCst);
            self.policy.set_global_enabled(false);
            if self.outbox.stop_processor().await {
                info!(
                    "Cloud sync disabled, {} operations kept",
                    self.outbox.pending_count()
                );
            }
        }
        Ok(())
    }

    fn should_sync(&self, shop_id: &ShopId, options: &WriteOptions) -> bool {
        !options.skip_sync && self.is_enabled() && self.policy.get_shop_config(shop_id).enabled
    }

    fn enqueue(&self, shop_id: &ShopId, table: &TableName, op: OperationType) {
        let kind = op.kind();
        if let Err(e) = self.outbox.enqueue(shop_id.clone(), table.clone(), op) {
            warn!(
                "Failed to queue {} on {} for cloud sync (local write kept): {}",
                kind, table, e
            );
        }
    }
}

/// React to policy changes until the orchestrator goes away.
async fn listen(orchestrator: Weak<WriteOrchestrator>, mut events: broadcast::Receiver<PolicyEvent>) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!("Missed {} policy events", missed);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let Some(orchestrator) = orchestrator.upgrade() else {
            break;
        };

        match event {
            PolicyEvent::EnabledChanged {
                shop_id: Some(shop_id),
                enabled,
            } => {
                // Shop toggles gate enqueue through the policy lookup.
                debug!(
                    "Sync for shop {} now {}",
                    shop_id,
                    if enabled { "enabled" } else { "disabled" }
                );
            }
            PolicyEvent::EnabledChanged {
                shop_id: None,
                enabled,
            } => {
                if let Err(e) = orchestrator.set_sync_enabled(enabled).await {
                    warn!("Could not apply global sync policy change: {}", e);
                    orchestrator
                        .policy
                        .set_global_enabled(orchestrator.is_enabled());
                }
            }
            PolicyEvent::GlobalChanged(policy) => {
                orchestrator
                    .outbox
                    .reconfigure(OutboxConfig::from_policy(&policy));
            }
        }
    }
}

/// Map any local store failure onto `LocalWrite`.
fn local_write(err: Error) -> Error {
    match err {
        Error::LocalWrite(_) => err,
        other => Error::LocalWrite(other.to_string()),
    }
}

fn resolve_shop(options: &WriteOptions, data: &Record) -> ShopId {
    options
        .shop_id
        .clone()
        .or_else(|| ShopId::from_record(data))
        .unwrap_or_else(ShopId::default_shop)
}

fn shop_from_filter(filter: &RecordFilter) -> Option<ShopId> {
    ["shop_id", "shopId"]
        .iter()
        .filter_map(|key| filter.get(key))
        .find_map(|value| value_key(value).and_then(|key| ShopId::new(key).ok()))
}

/// Shop and filter of each cloud operation queued for a multi-row change.
///
/// A filter naming an `id` yields one operation. Otherwise every affected
/// row gets its own operation tagged with that row's shop, so it orders
/// behind the row's earlier mutations.
fn row_targets(
    explicit: Option<ShopId>,
    filter: &RecordFilter,
    rows: &[Record],
) -> Vec<(ShopId, RecordFilter)> {
    let shop_of = |row: Option<&Record>| {
        explicit
            .clone()
            .or_else(|| row.and_then(ShopId::from_record))
            .unwrap_or_else(ShopId::default_shop)
    };

    if filter.get("id").is_none() {
        let targets: Vec<(ShopId, RecordFilter)> = rows
            .iter()
            .filter_map(|row| record_id(row).map(|id| (shop_of(Some(row)), RecordFilter::by_id(id))))
            .collect();
        if !targets.is_empty() {
            return targets;
        }
    }
    vec![(shop_of(rows.first()), filter.clone())]
}
