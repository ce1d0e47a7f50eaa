//! Error types for purchase-state sync operations

use thiserror::Error;

/// Keyed store errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Store I/O failed: {reason}")]
    Io { reason: String },

    #[error("Store backend failed: {reason}")]
    Backend { reason: String },

    #[error("Serialization failed for key {key}: {reason}")]
    Serialization { key: String, reason: String },

    #[error("Cache lock poisoned")]
    LockPoisoned,
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io {
            reason: e.to_string(),
        }
    }
}

/// Entitlement backend errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("Transport failed: {reason}")]
    Transport { reason: String },

    #[error("Backend returned status {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Invalid response from backend: {reason}")]
    InvalidResponse { reason: String },
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: &'static str },

    #[error("Invalid config value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("Missing configuration file path (set PURCHASES_CONFIG)")]
    MissingConfigPath,

    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Failure delivered to listeners through [`crate::SyncEvent::Failed`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Billing error {code}: {message}")]
    Billing { code: i32, message: String },

    #[error("Cache error: {0}")]
    Store(#[from] StoreError),

    #[error("App user id changed while the request was in flight")]
    Superseded,
}

/// Master error type for purchase-state sync.
#[derive(Debug, Error)]
pub enum PurchasesError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),
}

/// Result type alias for purchase-state sync operations.
pub type PurchasesResult<T> = Result<T, PurchasesError>;

/// Result type alias for keyed store operations.
pub type StoreResult<T> = Result<T, StoreError>;

// =============================================================================
// TESTS
// =============================================================================
