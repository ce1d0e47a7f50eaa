//! Configuration loading for purchase-state sync.
//!
//! Only `api_key` is required; everything else has a default matching the
//! SDK's historical behavior.

use crate::identity::Identity;
use crate::ConfigError;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming the TOML config file.
pub const CONFIG_PATH_ENV: &str = "PURCHASES_CONFIG";

/// Namespace prefix used for every persisted key.
pub const DEFAULT_NAMESPACE: &str = "com.revenuecat.purchases";

/// Entitlement snapshots older than this are refetched (5 minutes).
pub const DEFAULT_SNAPSHOT_TTL_MS: u64 = 5 * 60 * 1000;

/// Catalog entries older than this are refetched (5 minutes).
pub const DEFAULT_CATALOG_TTL_MS: u64 = 5 * 60 * 1000;

/// Lifecycle-triggered refreshes are throttled to one per window (60 seconds).
pub const DEFAULT_REFRESH_COOLDOWN_MS: u64 = 60 * 1000;

/// Default LMDB map size.
pub const DEFAULT_STORE_MAX_SIZE_MB: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncConfig {
    pub api_key: String,
    #[serde(default)]
    pub app_user_id: Option<String>,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default = "default_snapshot_ttl_ms")]
    pub snapshot_ttl_ms: u64,
    #[serde(default = "default_catalog_ttl_ms")]
    pub catalog_ttl_ms: u64,
    #[serde(default = "default_refresh_cooldown_ms")]
    pub refresh_cooldown_ms: u64,
    /// Directory for the durable store. In-memory when unset.
    #[serde(default)]
    pub store_path: Option<PathBuf>,
    #[serde(default = "default_store_max_size_mb")]
    pub store_max_size_mb: usize,
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

fn default_snapshot_ttl_ms() -> u64 {
    DEFAULT_SNAPSHOT_TTL_MS
}

fn default_catalog_ttl_ms() -> u64 {
    DEFAULT_CATALOG_TTL_MS
}

fn default_refresh_cooldown_ms() -> u64 {
    DEFAULT_REFRESH_COOLDOWN_MS
}

fn default_store_max_size_mb() -> usize {
    DEFAULT_STORE_MAX_SIZE_MB
}

impl SyncConfig {
    /// Build a config with defaults for everything but the API key.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            app_user_id: None,
            namespace: default_namespace(),
            snapshot_ttl_ms: DEFAULT_SNAPSHOT_TTL_MS,
            catalog_ttl_ms: DEFAULT_CATALOG_TTL_MS,
            refresh_cooldown_ms: DEFAULT_REFRESH_COOLDOWN_MS,
            store_path: None,
            store_max_size_mb: DEFAULT_STORE_MAX_SIZE_MB,
        }
    }

    pub fn with_app_user_id(mut self, app_user_id: impl Into<String>) -> Self {
        self.app_user_id = Some(app_user_id.into());
        self
    }

    pub fn with_store_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.store_path = Some(path.into());
        self
    }

    pub fn with_snapshot_ttl(mut self, ttl: Duration) -> Self {
        self.snapshot_ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_refresh_cooldown(mut self, cooldown: Duration) -> Self {
        self.refresh_cooldown_ms = u64::try_from(cooldown.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Load from the file named by `PURCHASES_CONFIG`.
    pub fn load() -> Result<Self, ConfigError> {
        let path = config_path_from_env().ok_or(ConfigError::MissingConfigPath)?;
        Self::from_path(&path)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: SyncConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api_key.trim().is_empty() {
            return Err(ConfigError::MissingRequired { field: "api_key" });
        }
        if self.namespace.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "namespace",
                reason: "must not be empty".to_string(),
            });
        }
        if let Some(app_user_id) = &self.app_user_id {
            Identity::try_new(app_user_id.as_str())?;
        }
        if self.snapshot_ttl_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "snapshot_ttl_ms",
                reason: "must be > 0".to_string(),
            });
        }
        if self.catalog_ttl_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "catalog_ttl_ms",
                reason: "must be > 0".to_string(),
            });
        }
        if self.store_path.is_some() && self.store_max_size_mb == 0 {
            return Err(ConfigError::InvalidValue {
                field: "store_max_size_mb",
                reason: "must be > 0".to_string(),
            });
        }
        Ok(())
    }

    pub fn snapshot_ttl(&self) -> Duration {
        Duration::from_millis(self.snapshot_ttl_ms)
    }

    pub fn catalog_ttl(&self) -> Duration {
        Duration::from_millis(self.catalog_ttl_ms)
    }

    pub fn refresh_cooldown(&self) -> Duration {
        Duration::from_millis(self.refresh_cooldown_ms)
    }
}

fn config_path_from_env() -> Option<PathBuf> {
    std::env::var(CONFIG_PATH_ENV).ok().map(PathBuf::from)
}
