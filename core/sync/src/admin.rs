//! Administrative surface over the sync engine.
//!
//! Route layers call these methods and serialize the returned
//! [`ApiResponse`] as is. Mutating calls that change whether data leaves the
//! shop (enable/disable, queue clear) require an admin or owner.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

use hybridsync_common::{Error, Record, RecordFilter, Result, ShopId, TableName};

use crate::config::{FeatureFlags, ShopOverride, SyncPolicy};
use crate::operation::{HistoryRecord, MutationOperation};
use crate::orchestrator::{SyncStatus, WriteOrchestrator};
use crate::outbox::{DrainReport, QueueStats};
use crate::policy::{ConnectionCheck, CostBreakdown, SyncPolicyProvider};

/// Uniform response envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            message: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn failed(err: &Error) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(err.to_string()),
            message: None,
        }
    }

    fn from_result(result: Result<T>) -> Self {
        match result {
            Ok(data) => Self::ok(data),
            Err(e) => Self::failed(&e),
        }
    }
}

/// Staff role of the caller, lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Viewer,
    Technician,
    Manager,
    Admin,
    Owner,
}

impl Role {
    pub fn is_privileged(self) -> bool {
        self >= Role::Admin
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Viewer => "viewer",
            Role::Technician => "technician",
            Role::Manager => "manager",
            Role::Admin => "admin",
            Role::Owner => "owner",
        };
        f.write_str(name)
    }
}

/// Authenticated identity behind an admin call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Caller {
    pub user_id: String,
    pub role: Role,
    pub shop_id: ShopId,
}

impl Caller {
    pub fn new(user_id: impl Into<String>, role: Role, shop_id: ShopId) -> Self {
        Self {
            user_id: user_id.into(),
            role,
            shop_id,
        }
    }

    fn require_privileged(&self, action: &str) -> Result<()> {
        if self.role.is_privileged() {
            Ok(())
        } else {
            warn!(
                "User {} ({}) denied: {} requires admin",
                self.user_id, self.role, action
            );
            Err(Error::NotPermitted(format!(
                "{} requires the admin or owner role",
                action
            )))
        }
    }
}

/// Admin operations for one sync engine.
pub struct SyncAdmin {
    orchestrator: Arc<WriteOrchestrator>,
}

impl SyncAdmin {
    pub fn new(orchestrator: Arc<WriteOrchestrator>) -> Self {
        Self { orchestrator }
    }

    fn policy(&self) -> &SyncPolicyProvider {
        self.orchestrator.policy()
    }

    pub async fn status(&self, _caller: &Caller) -> ApiResponse<SyncStatus> {
        ApiResponse::ok(self.orchestrator.get_sync_status().await)
    }

    /// Effective policy for the caller's shop.
    pub fn get_config(&self, caller: &Caller) -> ApiResponse<SyncPolicy> {
        ApiResponse::ok(self.policy().get_shop_config(&caller.shop_id))
    }

    /// Merge `updates` into the caller's shop override.
    ///
    /// Toggling `enabled` is privileged; other fields are open to any role.
    pub fn put_config(&self, caller: &Caller, updates: &ShopOverride) -> ApiResponse<SyncPolicy> {
        match self.apply_config(caller, updates) {
            Ok(policy) => ApiResponse::ok(policy).with_message("Configuration updated"),
            Err(e) => ApiResponse::failed(&e),
        }
    }

    fn apply_config(&self, caller: &Caller, updates: &ShopOverride) -> Result<SyncPolicy> {
        if updates.enabled.is_some() {
            caller.require_privileged("changing sync enablement")?;
        }
        let policy = self.policy().update_shop_config(&caller.shop_id, updates)?;
        info!("Sync config for {} updated by {}", caller.shop_id, caller.user_id);
        Ok(policy)
    }

    /// Queued operations of the caller's shop, oldest first.
    pub fn queue(&self, caller: &Caller) -> ApiResponse<Vec<MutationOperation>> {
        let ops = self
            .orchestrator
            .outbox()
            .queue()
            .into_iter()
            .filter(|op| op.shop_id == caller.shop_id)
            .collect();
        ApiResponse::ok(ops)
    }

    pub async fn trigger(&self, caller: &Caller) -> ApiResponse<DrainReport> {
        if !self.orchestrator.is_enabled() {
            return ApiResponse::failed(&Error::SyncDisabled(
                "cloud sync is turned off".to_string(),
            ));
        }
        info!("Manual sync triggered by {}", caller.user_id);
        let report = self.orchestrator.outbox().trigger_sync().await;
        ApiResponse::ok(report).with_message(format!(
            "Processed {} operations, {} remaining",
            report.processed, report.remaining
        ))
    }

    /// Drop every pending operation.
    pub fn clear(&self, caller: &Caller) -> ApiResponse<usize> {
        if let Err(e) = caller.require_privileged("clearing the sync queue") {
            return ApiResponse::failed(&e);
        }
        let removed = self.orchestrator.outbox().clear_queue();
        warn!("Sync queue cleared by {} ({} operations)", caller.user_id, removed);
        ApiResponse::ok(removed).with_message(format!("Removed {} operations", removed))
    }

    pub fn history(&self, caller: &Caller, limit: usize) -> ApiResponse<Vec<HistoryRecord>> {
        let records = self
            .orchestrator
            .outbox()
            .history(usize::MAX)
            .into_iter()
            .filter(|record| record.shop_id == caller.shop_id)
            .take(limit)
            .collect();
        ApiResponse::ok(records)
    }

    pub fn stats(&self, _caller: &Caller) -> ApiResponse<QueueStats> {
        ApiResponse::ok(self.orchestrator.outbox().stats())
    }

    /// Turn sync on or off for the whole engine.
    pub async fn set_enabled(&self, caller: &Caller, enabled: bool) -> ApiResponse<SyncStatus> {
        let action = if enabled { "enabling sync" } else { "disabling sync" };
        if let Err(e) = caller.require_privileged(action) {
            return ApiResponse::failed(&e);
        }
        if let Err(e) = self.orchestrator.set_sync_enabled(enabled).await {
            return ApiResponse::failed(&e);
        }
        info!("Sync {} by {}", if enabled { "enabled" } else { "disabled" }, caller.user_id);
        ApiResponse::ok(self.orchestrator.get_sync_status().await).with_message(if enabled {
            "Cloud sync enabled"
        } else {
            "Cloud sync disabled"
        })
    }

    pub async fn test_connection(&self, _caller: &Caller) -> ApiResponse<ConnectionCheck> {
        let check = self.policy().validate_credentials().await;
        let message = if check.ok {
            format!("Connected in {} ms", check.latency_ms)
        } else {
            "Connection failed".to_string()
        };
        ApiResponse::ok(check).with_message(message)
    }

    pub async fn force_sync_record(
        &self,
        caller: &Caller,
        table: &TableName,
        filter: &RecordFilter,
    ) -> ApiResponse<Record> {
        let result = self.orchestrator.force_sync_record(table, filter).await;
        if result.is_ok() {
            info!("{} force-synced {} where {}", caller.user_id, table, filter);
        }
        ApiResponse::from_result(result)
    }

    /// Monthly cost of `features`, or of the caller's enabled features.
    pub fn cost_breakdown(
        &self,
        caller: &Caller,
        features: Option<&FeatureFlags>,
    ) -> ApiResponse<CostBreakdown> {
        let breakdown = match features {
            Some(features) => SyncPolicyProvider::get_cost_breakdown(features),
            None => SyncPolicyProvider::get_cost_breakdown(
                &self.policy().get_shop_config(&caller.shop_id).features,
            ),
        };
        ApiResponse::ok(breakdown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Feature;
    use crate::orchestrator::WriteOptions;
    use crate::outbox::{Outbox, OutboxConfig};
    use crate::policy::MemoryPolicyStore;
    use hybridsync_common::CloudError;
    use hybridsync_storage::{MemoryCloudAdapter, MemoryLocalStore};
    use serde_json::json;

    fn admin(enabled: bool) -> (SyncAdmin, Arc<MemoryCloudAdapter>) {
        let cloud = Arc::new(MemoryCloudAdapter::new());
        let global = SyncPolicy {
            enabled,
            retry_delay_ms: 0,
            ..SyncPolicy::default()
        };
        let policy = Arc::new(SyncPolicyProvider::new(
            global.clone(),
            Arc::new(MemoryPolicyStore::new()),
            cloud.clone(),
        ));
        let outbox = Arc::new(Outbox::new(cloud.clone(), OutboxConfig::from_policy(&global)));
        let orchestrator = Arc::new(WriteOrchestrator::new(
            Arc::new(MemoryLocalStore::new()),
            cloud.clone(),
            outbox,
            policy,
        ));
        (SyncAdmin::new(orchestrator), cloud)
    }

    fn caller(role: Role) -> Caller {
        Caller::new("u1", role, ShopId::new("s1").unwrap())
    }

    fn table() -> TableName {
        TableName::new("jobs").unwrap()
    }

    async fn write(admin: &SyncAdmin, shop: &str, id: &str) {
        let record = json!({"id": id}).as_object().cloned().unwrap();
        admin
            .orchestrator
            .create(&table(), record, WriteOptions::for_shop(ShopId::new(shop).unwrap()))
            .await
            .unwrap();
    }

    #[test]
    fn test_role_order() {
        assert!(!Role::Manager.is_privileged());
        assert!(Role::Admin.is_privileged());
        assert!(Role::Owner.is_privileged());
    }

    #[test]
    fn test_response_serializes_camel_case() {
        let response = ApiResponse::ok(3).with_message("done");
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value, json!({"success": true, "data": 3, "message": "done"}));

        let failed: ApiResponse<()> = ApiResponse::failed(&Error::NotFound("row".into()));
        let value = serde_json::to_value(&failed).unwrap();
        assert_eq!(value["success"], json!(false));
        assert!(value["error"].as_str().unwrap().contains("row"));
    }

    #[tokio::test]
    async fn test_privileged_actions_need_admin() {
        let (admin, _) = admin(true);
        write(&admin, "s1", "j1").await;

        let denied = admin.clear(&caller(Role::Manager));
        assert!(!denied.success);
        assert_eq!(admin.orchestrator.outbox().pending_count(), 1);

        let denied = admin.set_enabled(&caller(Role::Technician), false).await;
        assert!(!denied.success);
        assert!(admin.orchestrator.is_enabled());

        let cleared = admin.clear(&caller(Role::Owner));
        assert_eq!(cleared.data, Some(1));
        assert_eq!(admin.orchestrator.outbox().pending_count(), 0);
    }

    #[tokio::test]
    async fn test_put_config_enabled_is_privileged() {
        let (admin, _) = admin(true);

        let denied = admin.put_config(&caller(Role::Manager), &ShopOverride::enabled(false));
        assert!(!denied.success);

        let mut updates = ShopOverride::default();
        updates.batch_size = Some(10);
        let allowed = admin.put_config(&caller(Role::Manager), &updates);
        assert!(allowed.success);
        assert_eq!(allowed.data.map(|p| p.batch_size), Some(10));
        assert_eq!(admin.get_config(&caller(Role::Viewer)).data.map(|p| p.batch_size), Some(10));

        let allowed = admin.put_config(&caller(Role::Admin), &ShopOverride::enabled(false));
        assert_eq!(allowed.data.map(|p| p.enabled), Some(false));
    }

    #[tokio::test]
    async fn test_queue_and_history_are_scoped_to_shop() {
        let (admin, _) = admin(true);
        write(&admin, "s1", "j1").await;
        write(&admin, "s2", "j2").await;

        let queue = admin.queue(&caller(Role::Viewer)).data.unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].shop_id.as_str(), "s1");

        let report = admin.trigger(&caller(Role::Viewer)).await.data.unwrap();
        assert_eq!(report.processed, 2);

        let history = admin.history(&caller(Role::Viewer), 10).data.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(admin.stats(&caller(Role::Viewer)).data.unwrap().total_processed, 2);
    }

    #[tokio::test]
    async fn test_trigger_requires_enabled_sync() {
        let (admin, _) = admin(false);
        let response = admin.trigger(&caller(Role::Admin)).await;
        assert!(!response.success);
    }

    #[tokio::test]
    async fn test_connection_and_enable() {
        let (admin, cloud) = admin(false);
        cloud.set_ping_error(Some(CloudError::Network("down".into())));

        let check = admin.test_connection(&caller(Role::Viewer)).await.data.unwrap();
        assert!(!check.ok);
        assert!(!admin.set_enabled(&caller(Role::Admin), true).await.success);

        cloud.set_ping_error(None);
        let status = admin.set_enabled(&caller(Role::Admin), true).await.data.unwrap();
        assert!(status.enabled);
        assert!(status.processor_running);

        admin.orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_status_and_policy_agree_after_toggle() {
        let (admin, _) = admin(false);

        let status = admin.set_enabled(&caller(Role::Admin), true).await.data.unwrap();
        assert!(status.policy.enabled);
        assert_eq!(status.enabled, status.policy.enabled);
        assert_eq!(status.mode, status.policy.mode);

        let status = admin.set_enabled(&caller(Role::Admin), false).await.data.unwrap();
        assert!(!status.policy.enabled);
        assert_eq!(status.enabled, status.policy.enabled);
        assert_eq!(status.mode, status.policy.mode);

        admin.orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_cost_breakdown_defaults_to_shop_features() {
        let (admin, _) = admin(true);
        let mut updates = ShopOverride::default();
        updates.features = Some([Feature::CloudBackup, Feature::FileStorage].into_iter().collect());
        admin.put_config(&caller(Role::Manager), &updates);

        let breakdown = admin.cost_breakdown(&caller(Role::Viewer), None).data.unwrap();
        assert_eq!(breakdown.total_monthly_cents, 2500);

        let explicit: FeatureFlags = [Feature::MultiLocation].into_iter().collect();
        let breakdown = admin
            .cost_breakdown(&caller(Role::Viewer), Some(&explicit))
            .data
            .unwrap();
        assert_eq!(breakdown.total_monthly_cents, 3000);
    }

    #[tokio::test]
    async fn test_force_sync_record_response() {
        let (admin, cloud) = admin(true);
        write(&admin, "s1", "j1").await;

        let response = admin
            .force_sync_record(&caller(Role::Manager), &table(), &RecordFilter::by_id("j1"))
            .await;
        assert!(response.success);
        assert!(cloud.get(&table(), "j1").is_some());

        let response = admin
            .force_sync_record(&caller(Role::Manager), &table(), &RecordFilter::by_id("nope"))
            .await;
        assert!(!response.success);
    }
}
