//! In-process cache primitives and the persisted key scheme.

pub mod cell;
pub mod keys;

pub use cell::CacheCell;
pub use keys::CacheKeys;
