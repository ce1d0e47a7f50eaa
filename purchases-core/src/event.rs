//! Listener events.

use crate::{EntitlementSnapshot, SyncError};

/// Outcome of an asynchronous sync operation, delivered to the listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// A purchase was reported and the backend returned the new snapshot.
    Completed(EntitlementSnapshot),
    /// Entitlements were refreshed (fetch, restore or pending-purchase sync).
    Updated(EntitlementSnapshot),
    /// A fetch, post or billing flow failed. Cached state is unchanged.
    Failed(SyncError),
}

impl SyncEvent {
    pub fn snapshot(&self) -> Option<&EntitlementSnapshot> {
        match self {
            SyncEvent::Completed(s) | SyncEvent::Updated(s) => Some(s),
            SyncEvent::Failed(_) => None,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, SyncEvent::Failed(_))
    }
}
