//! Purchases Core - Shared Types
//!
//! Data structures, errors, configuration and collaborator traits used by the
//! storage and sync crates. No persistence or network logic lives here.

pub mod clock;
pub mod collaborators;
pub mod config;
pub mod entities;
pub mod error;
pub mod event;
pub mod fingerprint;
pub mod identity;

pub use clock::{elapsed_between, Clock, ManualClock, SystemClock};
pub use collaborators::{BillingCollaborator, BillingUpdate, EntitlementBackend};
pub use config::{SyncConfig, DEFAULT_NAMESPACE};
pub use entities::{
    index_by_fingerprint, Catalog, Entitlement, EntitlementSnapshot, Product, ProductKind,
    PurchaseRecord, SNAPSHOT_SCHEMA_VERSION,
};
pub use error::{
    BackendError, ConfigError, PurchasesError, PurchasesResult, StoreError, StoreResult,
    SyncError,
};
pub use event::SyncEvent;
pub use fingerprint::ReceiptFingerprint;
pub use identity::{Identity, Timestamp, ANONYMOUS_ID_PREFIX, RESERVED_APP_USER_IDS};
