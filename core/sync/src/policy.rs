//! Sync policy provider: per-shop settings over global defaults.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use hybridsync_common::{Error, Result, ShopId};
use hybridsync_storage::{CloudAdapter, CloudResult};

use crate::cache::TtlCache;
use crate::config::{Feature, FeatureFlags, ShopOverride, SyncPolicy};

/// How long a resolved shop policy is served from cache.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);

/// Persistence for per-shop overrides.
pub trait PolicyStore: Send + Sync {
    /// Load the stored override of a shop, if any.
    ///
    /// # Errors
    /// - `PolicyLoad` if the backing store cannot be read
    fn load(&self, shop_id: &ShopId) -> Result<Option<ShopOverride>>;

    /// Replace the stored override of a shop.
    fn save(&self, shop_id: &ShopId, overrides: &ShopOverride) -> Result<()>;
}

/// Policy store kept in memory.
#[derive(Default)]
pub struct MemoryPolicyStore {
    overrides: Mutex<HashMap<ShopId, ShopOverride>>,
    unavailable: AtomicBool,
}

impl MemoryPolicyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every load and save fail, as if the backing database were down.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::PolicyLoad("policy store unavailable".to_string()));
        }
        Ok(())
    }

    fn overrides(&self) -> MutexGuard<'_, HashMap<ShopId, ShopOverride>> {
        self.overrides.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl PolicyStore for MemoryPolicyStore {
    fn load(&self, shop_id: &ShopId) -> Result<Option<ShopOverride>> {
        self.check()?;
        Ok(self.overrides().get(shop_id).cloned())
    }

    fn save(&self, shop_id: &ShopId, overrides: &ShopOverride) -> Result<()> {
        self.check()?;
        self.overrides().insert(shop_id.clone(), overrides.clone());
        Ok(())
    }
}

/// Policy store in a SQLite `shop_sync_config` table.
pub struct SqlitePolicyStore {
    conn: Mutex<Connection>,
}

impl SqlitePolicyStore {
    /// Create or open the policy table in the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::init(Connection::open(path.as_ref()).map_err(policy_err)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory().map_err(policy_err)?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.busy_timeout(Duration::from_secs(5)).map_err(policy_err)?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS shop_sync_config (
                shop_id TEXT PRIMARY KEY,
                config TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );
            "#,
        )
        .map_err(policy_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn policy_err(err: rusqlite::Error) -> Error {
    Error::PolicyLoad(err.to_string())
}

impl PolicyStore for SqlitePolicyStore {
    fn load(&self, shop_id: &ShopId) -> Result<Option<ShopOverride>> {
        let data: Option<String> = self
            .conn()
            .query_row(
                "SELECT config FROM shop_sync_config WHERE shop_id = ?1",
                params![shop_id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(policy_err)?;

        data.map(|data| {
            serde_json::from_str(&data).map_err(|e| Error::PolicyLoad(e.to_string()))
        })
        .transpose()
    }

    fn save(&self, shop_id: &ShopId, overrides: &ShopOverride) -> Result<()> {
        let data = serde_json::to_string(overrides)?;
        self.conn()
            .execute(
                "INSERT OR REPLACE INTO shop_sync_config (shop_id, config, updated_at) VALUES (?1, ?2, ?3)",
                params![shop_id.as_str(), data, Utc::now().timestamp_millis()],
            )
            .map_err(policy_err)?;
        Ok(())
    }
}

/// Change notifications consumed by the write orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub enum PolicyEvent {
    /// Sync was switched on or off, for one shop or (with `None`) globally.
    EnabledChanged {
        shop_id: Option<ShopId>,
        enabled: bool,
    },
    /// Global defaults changed.
    GlobalChanged(SyncPolicy),
}

/// Whether cloud mirroring is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncMode {
    Hybrid,
    LocalOnly,
}

impl SyncMode {
    pub fn from_enabled(enabled: bool) -> Self {
        if enabled {
            SyncMode::Hybrid
        } else {
            SyncMode::LocalOnly
        }
    }
}

/// Result of a cloud liveness check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionCheck {
    pub ok: bool,
    pub latency_ms: u64,
    pub error: Option<String>,
    pub checked_at: DateTime<Utc>,
}

/// Snapshot of the global policy state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyStatus {
    pub enabled: bool,
    pub mode: SyncMode,
    pub features: FeatureFlags,
    /// Last credential check, if one ran.
    pub credentials: Option<ConnectionCheck>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CostItem {
    pub feature: Feature,
    pub monthly_cost_cents: u32,
}

/// Estimated monthly cost of a feature selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CostBreakdown {
    pub items: Vec<CostItem>,
    pub total_monthly_cents: u32,
}

/// Resolves effective sync settings per shop.
///
/// Shop overrides are loaded from a [`PolicyStore`], merged over the global
/// defaults and cached. Loading never fails from the caller's point of view:
/// a store error degrades to the global defaults.
pub struct SyncPolicyProvider {
    global: RwLock<SyncPolicy>,
    store: Arc<dyn PolicyStore>,
    cloud: Arc<dyn CloudAdapter>,
    cache: TtlCache<ShopId, SyncPolicy>,
    events: broadcast::Sender<PolicyEvent>,
    last_check: Mutex<Option<ConnectionCheck>>,
}

impl SyncPolicyProvider {
    pub fn new(
        global: SyncPolicy,
        store: Arc<dyn PolicyStore>,
        cloud: Arc<dyn CloudAdapter>,
    ) -> Self {
        Self::with_cache_ttl(global, store, cloud, DEFAULT_CACHE_TTL)
    }

    pub fn with_cache_ttl(
        global: SyncPolicy,
        store: Arc<dyn PolicyStore>,
        cloud: Arc<dyn CloudAdapter>,
        ttl: Duration,
    ) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            global: RwLock::new(global),
            store,
            cloud,
            cache: TtlCache::new(ttl),
            events,
            last_check: Mutex::new(None),
        }
    }

    /// Subscribe to enable/disable and global change events.
    pub fn subscribe(&self) -> broadcast::Receiver<PolicyEvent> {
        self.events.subscribe()
    }

    /// Current global defaults.
    pub fn global(&self) -> SyncPolicy {
        self.global
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Apply `updates` to the global defaults.
    ///
    /// Clears every cached shop policy.
    pub fn update_global(&self, updates: &ShopOverride) -> Result<SyncPolicy> {
        let (previous, updated) = {
            let mut global = self.global.write().unwrap_or_else(PoisonError::into_inner);
            let updated = global.merged(updates);
            updated.validate()?;
            let previous = std::mem::replace(&mut *global, updated.clone());
            (previous, updated)
        };
        self.cache.clear();
        info!("Global sync policy updated (enabled: {})", updated.enabled);

        self.publish(PolicyEvent::GlobalChanged(updated.clone()));
        if previous.enabled != updated.enabled {
            self.publish(PolicyEvent::EnabledChanged {
                shop_id: None,
                enabled: updated.enabled,
            });
        }
        Ok(updated)
    }

    /// Set the global enabled flag without publishing an event.
    ///
    /// Used by the orchestrator to mirror a runtime toggle. Returns the
    /// previous value.
    pub fn set_global_enabled(&self, enabled: bool) -> bool {
        let previous = {
            let mut global = self.global.write().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut global.enabled, enabled)
        };
        if previous != enabled {
            self.cache.clear();
            debug!("Global sync flag set to {}", enabled);
        }
        previous
    }

    /// Effective policy of a shop.
    pub fn get_shop_config(&self, shop_id: &ShopId) -> SyncPolicy {
        if let Some(policy) = self.cache.get(shop_id) {
            return policy;
        }

        match self.store.load(shop_id) {
            Ok(overrides) => {
                let global = self.global();
                let policy = match overrides {
                    Some(overrides) => global.merged(&overrides),
                    None => global,
                };
                self.cache.set(shop_id.clone(), policy.clone());
                policy
            }
            Err(e) => {
                warn!(
                    "Failed to load sync policy for shop {}, using global defaults: {}",
                    shop_id, e
                );
                self.global()
            }
        }
    }

    /// Merge `updates` into a shop's stored override.
    ///
    /// # Errors
    /// - `PolicyLoad` if the override cannot be read or written
    /// - `Config` if the resulting policy is invalid
    pub fn update_shop_config(&self, shop_id: &ShopId, updates: &ShopOverride) -> Result<SyncPolicy> {
        let was_enabled = self.get_shop_config(shop_id).enabled;

        let mut stored = self.store.load(shop_id)?.unwrap_or_default();
        stored.apply(updates);
        let effective = self.global().merged(&stored);
        effective.validate()?;

        self.store.save(shop_id, &stored)?;
        self.cache.invalidate(shop_id);
        debug!("Sync policy for shop {} updated", shop_id);

        if effective.enabled != was_enabled {
            info!(
                "Sync {} for shop {}",
                if effective.enabled { "enabled" } else { "disabled" },
                shop_id
            );
            self.publish(PolicyEvent::EnabledChanged {
                shop_id: Some(shop_id.clone()),
                enabled: effective.enabled,
            });
        }
        Ok(effective)
    }

    /// Drop a shop's cached policy so the next read reloads it.
    pub fn invalidate(&self, shop_id: &ShopId) {
        self.cache.invalidate(shop_id);
    }

    fn publish(&self, event: PolicyEvent) {
        // No receivers is fine: nobody is listening yet.
        let _ = self.events.send(event);
    }

    /// Price a feature selection from the static cost table.
    pub fn get_cost_breakdown(features: &FeatureFlags) -> CostBreakdown {
        let items: Vec<CostItem> = features
            .iter()
            .map(|&feature| CostItem {
                feature,
                monthly_cost_cents: feature.monthly_cost_cents(),
            })
            .collect();
        let total_monthly_cents = items.iter().map(|item| item.monthly_cost_cents).sum();
        CostBreakdown {
            items,
            total_monthly_cents,
        }
    }

    /// Check the cloud connection and report the outcome.
    pub async fn check_connection(&self) -> CloudResult<Duration> {
        self.run_check().await.1
    }

    /// Liveness check against the cloud adapter.
    pub async fn validate_credentials(&self) -> ConnectionCheck {
        self.run_check().await.0
    }

    /// Ping once, remember the check and return it with the raw outcome.
    async fn run_check(&self) -> (ConnectionCheck, CloudResult<Duration>) {
        let started = Instant::now();
        let result = self.cloud.ping().await;
        let latency = started.elapsed();

        let check = ConnectionCheck {
            ok: result.is_ok(),
            latency_ms: u64::try_from(latency.as_millis()).unwrap_or(u64::MAX),
            error: result.as_ref().err().map(ToString::to_string),
            checked_at: Utc::now(),
        };
        *self.last_check.lock().unwrap_or_else(PoisonError::into_inner) = Some(check.clone());

        let result = match result {
            Ok(()) => {
                debug!("Cloud {} reachable in {:?}", self.cloud.name(), latency);
                Ok(latency)
            }
            Err(e) => {
                warn!("Cloud {} connection check failed: {}", self.cloud.name(), e);
                Err(e)
            }
        };
        (check, result)
    }

    /// Global enable flag, features and the last credential check.
    pub fn policy_status(&self) -> PolicyStatus {
        let global = self.global();
        PolicyStatus {
            enabled: global.enabled,
            mode: SyncMode::from_enabled(global.enabled),
            features: global.features,
            credentials: self
                .last_check
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use hybridsync_common::{CloudError, Record, RecordFilter, TableName};
    use hybridsync_storage::MemoryCloudAdapter;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use tempfile::TempDir;

    fn shop(id: &str) -> ShopId {
        ShopId::new(id).unwrap()
    }

    fn provider(store: Arc<dyn PolicyStore>) -> (SyncPolicyProvider, Arc<MemoryCloudAdapter>) {
        let cloud = Arc::new(MemoryCloudAdapter::new());
        let provider = SyncPolicyProvider::new(SyncPolicy::default(), store, cloud.clone());
        (provider, cloud)
    }

    #[test]
    fn test_shop_falls_back_to_global() {
        let (provider, _) = provider(Arc::new(MemoryPolicyStore::new()));
        assert_eq!(provider.get_shop_config(&shop("s1")), SyncPolicy::default());
    }

    #[test]
    fn test_update_shop_config_merges_and_invalidates() {
        let (provider, _) = provider(Arc::new(MemoryPolicyStore::new()));
        let s1 = shop("s1");
        assert!(!provider.get_shop_config(&s1).enabled);

        let updated = provider
            .update_shop_config(
                &s1,
                &ShopOverride {
                    enabled: Some(true),
                    batch_size: Some(5),
                    ..ShopOverride::default()
                },
            )
            .unwrap();
        assert!(updated.enabled);

        let resolved = provider.get_shop_config(&s1);
        assert!(resolved.enabled);
        assert_eq!(resolved.batch_size, 5);

        provider
            .update_shop_config(&s1, &ShopOverride::enabled(false))
            .unwrap();
        let resolved = provider.get_shop_config(&s1);
        assert!(!resolved.enabled);
        assert_eq!(resolved.batch_size, 5);
    }

    #[test]
    fn test_invalid_override_is_rejected() {
        let (provider, _) = provider(Arc::new(MemoryPolicyStore::new()));
        let err = provider
            .update_shop_config(
                &shop("s1"),
                &ShopOverride {
                    batch_size: Some(0),
                    ..ShopOverride::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_store_failure_degrades_to_global() {
        let store = Arc::new(MemoryPolicyStore::new());
        let (provider, _) = provider(store.clone());
        provider
            .update_shop_config(&shop("s1"), &ShopOverride::enabled(true))
            .unwrap();
        provider.invalidate(&shop("s1"));

        store.set_unavailable(true);
        assert!(!provider.get_shop_config(&shop("s1")).enabled);

        store.set_unavailable(false);
        assert!(provider.get_shop_config(&shop("s1")).enabled);
    }

    #[test]
    fn test_enabled_change_is_published() {
        let (provider, _) = provider(Arc::new(MemoryPolicyStore::new()));
        let mut events = provider.subscribe();

        provider
            .update_shop_config(&shop("s1"), &ShopOverride::enabled(true))
            .unwrap();
        assert_eq!(
            events.try_recv().unwrap(),
            PolicyEvent::EnabledChanged {
                shop_id: Some(shop("s1")),
                enabled: true,
            }
        );

        // No change, no event.
        provider
            .update_shop_config(&shop("s1"), &ShopOverride::enabled(true))
            .unwrap();
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_update_global_clears_cache() {
        let (provider, _) = provider(Arc::new(MemoryPolicyStore::new()));
        let mut events = provider.subscribe();
        assert_eq!(provider.get_shop_config(&shop("s1")).batch_size, 50);

        provider
            .update_global(&ShopOverride {
                enabled: Some(true),
                batch_size: Some(10),
                ..ShopOverride::default()
            })
            .unwrap();

        assert_eq!(provider.get_shop_config(&shop("s1")).batch_size, 10);
        assert!(matches!(
            events.try_recv().unwrap(),
            PolicyEvent::GlobalChanged(_)
        ));
        assert_eq!(
            events.try_recv().unwrap(),
            PolicyEvent::EnabledChanged {
                shop_id: None,
                enabled: true,
            }
        );
    }

    #[test]
    fn test_cost_breakdown() {
        let features = FeatureFlags::from([Feature::CloudBackup, Feature::MultiLocation]);
        let breakdown = SyncPolicyProvider::get_cost_breakdown(&features);

        assert_eq!(breakdown.items.len(), 2);
        assert_eq!(breakdown.total_monthly_cents, 4500);
        assert_eq!(
            SyncPolicyProvider::get_cost_breakdown(&FeatureFlags::new()).total_monthly_cents,
            0
        );
    }

    #[tokio::test]
    async fn test_validate_credentials() {
        let (provider, cloud) = provider(Arc::new(MemoryPolicyStore::new()));
        assert!(provider.policy_status().credentials.is_none());

        let check = provider.validate_credentials().await;
        assert!(check.ok);
        assert!(check.error.is_none());

        cloud.set_ping_error(Some(CloudError::Auth("bad key".into())));
        let check = provider.validate_credentials().await;
        assert!(!check.ok);
        assert!(check.error.unwrap().contains("bad key"));

        let status = provider.policy_status();
        assert_eq!(status.mode, SyncMode::LocalOnly);
        assert_eq!(status.credentials.map(|c| c.ok), Some(false));
    }

    /// Adapter whose first ping is slow and fails while later pings succeed.
    #[derive(Default)]
    struct SlowFirstPing {
        pings: AtomicUsize,
    }

    #[async_trait]
    impl CloudAdapter for SlowFirstPing {
        fn name(&self) -> &str {
            "slow-first-ping"
        }

        async fn upsert(&self, _table: &TableName, _rows: Vec<Record>) -> CloudResult<()> {
            Ok(())
        }

        async fn update(
            &self,
            _table: &TableName,
            _changes: Record,
            _filter: &RecordFilter,
        ) -> CloudResult<()> {
            Ok(())
        }

        async fn delete(&self, _table: &TableName, _filter: &RecordFilter) -> CloudResult<()> {
            Ok(())
        }

        async fn ping(&self) -> CloudResult<()> {
            if self.pings.fetch_add(1, AtomicOrdering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(50)).await;
                return Err(CloudError::Network("timed out".into()));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_overlapping_checks_report_their_own_outcome() {
        let provider = SyncPolicyProvider::new(
            SyncPolicy::default(),
            Arc::new(MemoryPolicyStore::new()),
            Arc::new(SlowFirstPing::default()),
        );

        let slow = provider.validate_credentials();
        let fast = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            provider.validate_credentials().await
        };
        let (slow, fast) = tokio::join!(slow, fast);

        assert!(!slow.ok);
        assert!(slow.error.unwrap().contains("timed out"));
        assert!(fast.ok);
        assert_eq!(provider.policy_status().credentials.map(|c| c.ok), Some(false));
    }

    #[test]
    fn test_set_global_enabled_is_silent_and_clears_cache() {
        let (provider, _) = provider(Arc::new(MemoryPolicyStore::new()));
        let mut events = provider.subscribe();
        assert!(!provider.get_shop_config(&shop("s1")).enabled);

        assert!(!provider.set_global_enabled(true));
        assert!(provider.get_shop_config(&shop("s1")).enabled);
        assert_eq!(provider.policy_status().mode, SyncMode::Hybrid);
        assert!(events.try_recv().is_err());

        assert!(provider.set_global_enabled(false));
        assert!(!provider.global().enabled);
    }

    #[test]
    fn test_sqlite_policy_store_persists() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("policy.db");

        {
            let store = SqlitePolicyStore::open(&path).unwrap();
            assert!(store.load(&shop("s1")).unwrap().is_none());
            store
                .save(&shop("s1"), &ShopOverride::enabled(true))
                .unwrap();
        }

        let store = SqlitePolicyStore::open(&path).unwrap();
        assert_eq!(
            store.load(&shop("s1")).unwrap(),
            Some(ShopOverride::enabled(true))
        );
    }
}
