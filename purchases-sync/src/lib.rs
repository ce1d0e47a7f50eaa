//! Purchases Sync - Synchronization Controller
//!
//! Reconciles the device cache with the entitlement backend: serves fresh
//! snapshots from cache, refreshes stale ones, posts unreported receipts and
//! delivers outcomes as [`purchases_core::SyncEvent`]s on one channel.

pub mod controller;
pub mod telemetry;

pub use controller::{RefreshOutcome, RefreshTrigger, SyncController};
pub use telemetry::{init_tracing, TelemetryConfig, TelemetryError};
