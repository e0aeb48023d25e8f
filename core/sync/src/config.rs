//! Sync policy types and environment-driven global defaults.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use hybridsync_common::{Error, Result};

/// Cloud features a shop can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Feature {
    CloudBackup,
    RealtimeUpdates,
    FileStorage,
    MultiLocation,
    MobileSync,
}

impl Feature {
    pub const ALL: [Feature; 5] = [
        Feature::CloudBackup,
        Feature::RealtimeUpdates,
        Feature::FileStorage,
        Feature::MultiLocation,
        Feature::MobileSync,
    ];

    /// Suffix of the `SYNC_FEATURE_<NAME>` environment variable.
    pub fn env_name(self) -> &'static str {
        match self {
            Feature::CloudBackup => "CLOUD_BACKUP",
            Feature::RealtimeUpdates => "REALTIME_UPDATES",
            Feature::FileStorage => "FILE_STORAGE",
            Feature::MultiLocation => "MULTI_LOCATION",
            Feature::MobileSync => "MOBILE_SYNC",
        }
    }

    /// Estimated monthly cost in cents.
    pub fn monthly_cost_cents(self) -> u32 {
        match self {
            Feature::CloudBackup => 1500,
            Feature::RealtimeUpdates => 2000,
            Feature::FileStorage => 1000,
            Feature::MultiLocation => 3000,
            Feature::MobileSync => 1500,
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.env_name().to_ascii_lowercase().replace('_', "-"))
    }
}

impl FromStr for Feature {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_ascii_uppercase().replace('-', "_");
        Feature::ALL
            .into_iter()
            .find(|feature| feature.env_name() == wanted)
            .ok_or_else(|| Error::Config(format!("Unknown feature: {}", s)))
    }
}

/// Set of enabled features.
pub type FeatureFlags = BTreeSet<Feature>;

/// What happens when the outbox is at its offline queue limit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowPolicy {
    /// Refuse the new operation.
    #[default]
    RejectNew,
    /// Drop the oldest pending operation to make room.
    EvictOldest,
}

impl FromStr for OverflowPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reject-new" | "reject_new" => Ok(OverflowPolicy::RejectNew),
            "evict-oldest" | "evict_oldest" => Ok(OverflowPolicy::EvictOldest),
            other => Err(Error::Config(format!("Unknown overflow policy: {}", other))),
        }
    }
}

/// How concurrent edits are reconciled on the replica.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictResolution {
    #[default]
    LastWriteWins,
}

impl FromStr for ConflictResolution {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "last-write-wins" | "last_write_wins" | "lww" => Ok(ConflictResolution::LastWriteWins),
            other => Err(Error::Config(format!(
                "Unsupported conflict resolution: {}",
                other
            ))),
        }
    }
}

/// Effective sync settings for a shop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPolicy {
    pub enabled: bool,
    pub features: FeatureFlags,
    pub sync_interval_ms: u64,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
    pub batch_size: usize,
    pub conflict_resolution: ConflictResolution,
    pub offline_queue_limit: usize,
    pub overflow_policy: OverflowPolicy,
    pub compression: bool,
    pub delta_sync: bool,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            features: FeatureFlags::new(),
            sync_interval_ms: 30_000,
            retry_attempts: 3,
            retry_delay_ms: 1_000,
            batch_size: 50,
            conflict_resolution: ConflictResolution::LastWriteWins,
            offline_queue_limit: 10_000,
            overflow_policy: OverflowPolicy::RejectNew,
            compression: false,
            delta_sync: false,
        }
    }
}

impl SyncPolicy {
    /// Build the global policy from `SYNC_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the global policy from an arbitrary variable lookup.
    ///
    /// Unset variables keep their defaults.
    ///
    /// # Errors
    /// - `Config` if a variable is set to an unparseable value, or the
    ///   resulting policy fails validation
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut policy = Self::default();

        if let Some(v) = lookup("SYNC_ENABLED") {
            policy.enabled = parse_bool("SYNC_ENABLED", &v)?;
        }
        for feature in Feature::ALL {
            let key = format!("SYNC_FEATURE_{}", feature.env_name());
            if let Some(v) = lookup(&key) {
                if parse_bool(&key, &v)? {
                    policy.features.insert(feature);
                } else {
                    policy.features.remove(&feature);
                }
            }
        }
        if let Some(v) = lookup("SYNC_INTERVAL_MS") {
            policy.sync_interval_ms = parse_num("SYNC_INTERVAL_MS", &v)?;
        }
        if let Some(v) = lookup("SYNC_RETRY_ATTEMPTS") {
            policy.retry_attempts = parse_num("SYNC_RETRY_ATTEMPTS", &v)?;
        }
        if let Some(v) = lookup("SYNC_RETRY_DELAY_MS") {
            policy.retry_delay_ms = parse_num("SYNC_RETRY_DELAY_MS", &v)?;
        }
        if let Some(v) = lookup("SYNC_BATCH_SIZE") {
            policy.batch_size = parse_num("SYNC_BATCH_SIZE", &v)?;
        }
        if let Some(v) = lookup("SYNC_OFFLINE_QUEUE_LIMIT") {
            policy.offline_queue_limit = parse_num("SYNC_OFFLINE_QUEUE_LIMIT", &v)?;
        }
        if let Some(v) = lookup("SYNC_OVERFLOW_POLICY") {
            policy.overflow_policy = v.parse()?;
        }
        if let Some(v) = lookup("SYNC_CONFLICT_RESOLUTION") {
            policy.conflict_resolution = v.parse()?;
        }

        policy.validate()?;
        Ok(policy)
    }

    /// Reject settings the outbox cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::Config("batch size must be at least 1".to_string()));
        }
        if self.offline_queue_limit == 0 {
            return Err(Error::Config(
                "offline queue limit must be at least 1".to_string(),
            ));
        }
        if self.sync_interval_ms == 0 {
            return Err(Error::Config("sync interval must be positive".to_string()));
        }
        Ok(())
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// This policy with `overrides` applied on top.
    pub fn merged(&self, overrides: &ShopOverride) -> SyncPolicy {
        let mut policy = self.clone();
        if let Some(v) = overrides.enabled {
            policy.enabled = v;
        }
        if let Some(v) = &overrides.features {
            policy.features = v.clone();
        }
        if let Some(v) = overrides.sync_interval_ms {
            policy.sync_interval_ms = v;
        }
        if let Some(v) = overrides.retry_attempts {
            policy.retry_attempts = v;
        }
        if let Some(v) = overrides.retry_delay_ms {
            policy.retry_delay_ms = v;
        }
        if let Some(v) = overrides.batch_size {
            policy.batch_size = v;
        }
        if let Some(v) = overrides.conflict_resolution {
            policy.conflict_resolution = v;
        }
        if let Some(v) = overrides.offline_queue_limit {
            policy.offline_queue_limit = v;
        }
        if let Some(v) = overrides.overflow_policy {
            policy.overflow_policy = v;
        }
        if let Some(v) = overrides.compression {
            policy.compression = v;
        }
        if let Some(v) = overrides.delta_sync {
            policy.delta_sync = v;
        }
        policy
    }
}

/// Per-shop overrides; unset fields fall back to the global policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ShopOverride {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub features: Option<FeatureFlags>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync_interval_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_attempts: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_delay_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conflict_resolution: Option<ConflictResolution>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offline_queue_limit: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overflow_policy: Option<OverflowPolicy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compression: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta_sync: Option<bool>,
}

impl ShopOverride {
    /// Override that only toggles sync.
    pub fn enabled(enabled: bool) -> Self {
        Self {
            enabled: Some(enabled),
            ..Self::default()
        }
    }

    /// Fold newer `updates` into this override.
    pub fn apply(&mut self, updates: &ShopOverride) {
        if updates.enabled.is_some() {
            self.enabled = updates.enabled.clone();
        }
        if updates.features.is_some() {
            self.features = updates.features.clone();
        }
        if updates.sync_interval_ms.is_some() {
            self.sync_interval_ms = updates.sync_interval_ms.clone();
        }
        if updates.retry_attempts.is_some() {
            self.retry_attempts = updates.retry_attempts.clone();
        }
        if updates.retry_delay_ms.is_some() {
            self.retry_delay_ms = updates.retry_delay_ms.clone();
        }
        if updates.batch_size.is_some() {
            self.batch_size = updates.batch_size.clone();
        }
        if updates.conflict_resolution.is_some() {
            self.conflict_resolution = updates.conflict_resolution.clone();
        }
        if updates.offline_queue_limit.is_some() {
            self.offline_queue_limit = updates.offline_queue_limit.clone();
        }
        if updates.overflow_policy.is_some() {
            self.overflow_policy = updates.overflow_policy.clone();
        }
        if updates.compression.is_some() {
            self.compression = updates.compression.clone();
        }
        if updates.delta_sync.is_some() {
            self.delta_sync = updates.delta_sync.clone();
        }
    }

    /// Set a single field from its camelCase name and a string value.
    ///
    /// Used by the CLI `config set` command.
    pub fn set_field(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "enabled" => self.enabled = Some(parse_bool(key, value)?),
            "features" => {
                let features = value
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::parse::<Feature>)
                    .collect::<Result<FeatureFlags>>()?;
                self.features = Some(features);
            }
            "syncIntervalMs" => self.sync_interval_ms = Some(parse_num(key, value)?),
            "retryAttempts" => self.retry_attempts = Some(parse_num(key, value)?),
            "retryDelayMs" => self.retry_delay_ms = Some(parse_num(key, value)?),
            "batchSize" => self.batch_size = Some(parse_num(key, value)?),
            "conflictResolution" => self.conflict_resolution = Some(value.parse()?),
            "offlineQueueLimit" => self.offline_queue_limit = Some(parse_num(key, value)?),
            "overflowPolicy" => self.overflow_policy = Some(value.parse()?),
            "compression" => self.compression = Some(parse_bool(key, value)?),
            "deltaSync" => self.delta_sync = Some(parse_bool(key, value)?),
            other => return Err(Error::Config(format!("Unknown config key: {}", other))),
        }
        Ok(())
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(Error::Config(format!(
            "{} must be a boolean, got {:?}",
            key, other
        ))),
    }
}

fn parse_num<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("{} must be a number, got {:?}", key, value)))
}
