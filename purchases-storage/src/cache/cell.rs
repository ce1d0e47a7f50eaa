//! Staleness-tracked cache cell.
//!
//! A cell holds at most one value plus the time it was last refreshed.
//! Staleness is advisory: [`CacheCell::read`] always returns the value if
//! there is one, so callers can show stale data while a refresh is in flight.

use purchases_core::{elapsed_between, Clock, Timestamp};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

#[derive(Debug)]
struct CellState<T> {
    value: Option<T>,
    last_refreshed: Option<Timestamp>,
}

/// One cached value with a fixed time-to-live.
///
/// # Invariants
///
/// - `is_stale()` is true when there is no value, no timestamp, or
///   `now - last_refreshed >= ttl`.
/// - Value and timestamp are replaced together under one write lock, so
///   readers never see a value paired with another value's timestamp.
#[derive(Debug)]
pub struct CacheCell<T> {
    state: RwLock<CellState<T>>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl<T: Clone> CacheCell<T> {
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: RwLock::new(CellState {
                value: None,
                last_refreshed: None,
            }),
            ttl,
            clock,
        }
    }

    // Every write leaves the state whole, so a poisoned lock still guards
    // consistent data.
    fn read_state(&self) -> RwLockReadGuard<'_, CellState<T>> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, CellState<T>> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Store `value` and mark it refreshed now.
    pub fn cache(&self, value: T) {
        let now = self.clock.now();
        let mut state = self.write_state();
        state.value = Some(value);
        state.last_refreshed = Some(now);
    }

    /// Current value, stale or not.
    pub fn read(&self) -> Option<T> {
        self.read_state().value.clone()
    }

    /// Value together with its staleness, observed atomically.
    pub fn read_with_staleness(&self) -> (Option<T>, bool) {
        let now = self.clock.now();
        let state = self.read_state();
        let stale = Self::stale_at(&state, self.ttl, now);
        (state.value.clone(), stale)
    }

    pub fn is_stale(&self) -> bool {
        let now = self.clock.now();
        Self::stale_at(&self.read_state(), self.ttl, now)
    }

    /// Drop both value and timestamp.
    pub fn clear(&self) {
        let mut state = self.write_state();
        state.value = None;
        state.last_refreshed = None;
    }

    /// Drop only the timestamp; the value stays readable but is stale.
    pub fn clear_timestamp(&self) {
        self.write_state().last_refreshed = None;
    }

    /// Override the refresh time, e.g. after populating the value out of band.
    pub fn set_timestamp(&self, at: Timestamp) {
        self.write_state().last_refreshed = Some(at);
    }

    pub fn last_refreshed(&self) -> Option<Timestamp> {
        self.read_state().last_refreshed
    }

    /// Time since the last refresh, if any.
    pub fn age(&self) -> Option<Duration> {
        let now = self.clock.now();
        self.read_state()
            .last_refreshed
            .map(|at| elapsed_between(at, now))
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Apply `f` to the current value and store the result, refreshing the
    /// timestamp. Runs entirely under the write lock.
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(Option<T>) -> T,
    {
        let now = self.clock.now();
        let mut state = self.write_state();
        let next = f(state.value.take());
        state.value = Some(next);
        state.last_refreshed = Some(now);
    }

    fn stale_at(state: &CellState<T>, ttl: Duration, now: Timestamp) -> bool {
        if state.value.is_none() {
            return true;
        }
        match state.last_refreshed {
            None => true,
            Some(at) => elapsed_between(at, now) >= ttl,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use purchases_core::ManualClock;

    const TTL: Duration = Duration::from_secs(300);

    fn cell() -> (CacheCell<String>, ManualClock) {
        let clock = ManualClock::new(Utc::now());
        (CacheCell::new(TTL, Arc::new(clock.clone())), clock)
    }

    #[test]
    fn test_empty_cell_is_stale() {
        let (cell, _) = cell();
        assert!(cell.is_stale());
        assert_eq!(cell.read(), None);
        assert_eq!(cell.age(), None);
    }

    #[test]
    fn test_fresh_after_cache_until_ttl() {
        let (cell, clock) = cell();
        cell.cache("v1".to_string());
        assert!(!cell.is_stale());

        clock.advance(TTL - Duration::from_secs(1));
        assert!(!cell.is_stale());

        clock.advance(Duration::from_secs(1));
        assert!(cell.is_stale(), "age == ttl counts as stale");
        assert_eq!(cell.read().as_deref(), Some("v1"), "stale values stay readable");
    }

    #[test]
    fn test_clear_removes_value_and_timestamp() {
        let (cell, _) = cell();
        cell.cache("v1".to_string());
        cell.clear();
        assert!(cell.is_stale());
        assert_eq!(cell.read(), None);
        assert_eq!(cell.last_refreshed(), None);
    }

    #[test]
    fn test_clear_timestamp_keeps_value() {
        let (cell, _) = cell();
        cell.cache("v1".to_string());
        cell.clear_timestamp();
        assert!(cell.is_stale());
        assert_eq!(cell.read().as_deref(), Some("v1"));
    }

    #[test]
    fn test_set_timestamp_override() {
        let (cell, clock) = cell();
        cell.cache("v1".to_string());
        cell.clear_timestamp();

        cell.set_timestamp(clock.now());
        assert!(!cell.is_stale());

        cell.set_timestamp(clock.now() - chrono::Duration::seconds(301));
        assert!(cell.is_stale());
    }

    #[test]
    fn test_timestamp_without_value_is_stale() {
        let (cell, clock) = cell();
        cell.set_timestamp(clock.now());
        assert!(cell.is_stale());
    }

    #[test]
    fn test_overwrite_refreshes_timestamp() {
        let (cell, clock) = cell();
        cell.cache("v1".to_string());
        clock.advance(TTL);
        assert!(cell.is_stale());

        cell.cache("v2".to_string());
        assert!(!cell.is_stale());
        assert_eq!(cell.read().as_deref(), Some("v2"));
    }

    #[test]
    fn test_update_applies_under_lock() {
        let (cell, _) = cell();
        cell.update(|prev| prev.unwrap_or_default() + "a");
        cell.update(|prev| prev.unwrap_or_default() + "b");
        assert_eq!(cell.read().as_deref(), Some("ab"));
        assert!(!cell.is_stale());
    }

    #[test]
    fn test_read_with_staleness() {
        let (cell, clock) = cell();
        cell.cache("v".to_string());
        assert_eq!(cell.read_with_staleness(), (Some("v".to_string()), false));
        clock.advance(TTL * 2);
        assert_eq!(cell.read_with_staleness(), (Some("v".to_string()), true));
    }

    #[test]
    fn test_concurrent_writers_never_tear() {
        let (cell, _) = cell();
        let cell = Arc::new(cell);
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let cell = Arc::clone(&cell);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        cell.cache(format!("writer-{}", i));
                        let seen = cell.read().expect("value present after cache");
                        assert!(seen.starts_with("writer-"));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("writer thread should not panic");
        }
        assert!(!cell.is_stale());
    }
}

#[cfg(test)]
mod prop_tests {
    use super::*;
    use chrono::Utc;
    use proptest::prelude::*;
    use purchases_core::ManualClock;

    proptest! {
        /// Property: staleness after caching flips exactly at the ttl.
        #[test]
        fn prop_staleness_flips_at_ttl(ttl_ms in 1u64..10_000_000, elapsed_ms in 0u64..20_000_000) {
            let clock = ManualClock::new(Utc::now());
            let cell = CacheCell::new(Duration::from_millis(ttl_ms), Arc::new(clock.clone()));
            cell.cache(1u8);
            clock.advance(Duration::from_millis(elapsed_ms));
            prop_assert_eq!(cell.is_stale(), elapsed_ms >= ttl_ms);
        }

        /// Property: clear and clear_timestamp always leave the cell stale.
        #[test]
        fn prop_clears_make_stale(value in any::<u32>(), full_clear in any::<bool>()) {
            let cell = CacheCell::new(Duration::from_secs(60), Arc::new(ManualClock::default()));
            cell.cache(value);
            if full_clear {
                cell.clear();
                prop_assert_eq!(cell.read(), None);
            } else {
                cell.clear_timestamp();
                prop_assert_eq!(cell.read(), Some(value));
            }
            prop_assert!(cell.is_stale());
        }
    }
}
