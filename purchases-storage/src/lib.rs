//! Purchases Storage - Device Cache and Receipt Ledger
//!
//! Layers the identity-scoped device cache on top of a keyed store. The
//! in-memory store backs tests; the LMDB store is the durable one.

pub mod attributes;
pub mod cache;
pub mod device_cache;
pub mod ledger;
pub mod store;

pub use attributes::{AttributeMap, SubscriberAttribute};
pub use cache::{CacheCell, CacheKeys};
pub use device_cache::DeviceCache;
pub use ledger::ReceiptLedger;
pub use store::{InMemoryKeyedStore, KeyedStore, LmdbKeyedStore};
pub use store::lmdb::LmdbStoreError;
