//! Shared harness for controller integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use purchases_storage::{DeviceCache, InMemoryKeyedStore};
use purchases_sync::SyncController;
use purchases_test_utils::fixtures::{memory_cache_on, test_config};
use purchases_test_utils::{ManualClock, MockBackend, MockBilling, SyncConfig, SyncEvent};
use tokio::sync::mpsc::UnboundedReceiver;

pub struct Harness {
    pub controller: SyncController<InMemoryKeyedStore>,
    pub events: UnboundedReceiver<SyncEvent>,
    pub backend: Arc<MockBackend>,
    pub billing: Arc<MockBilling>,
    pub cache: Arc<DeviceCache<InMemoryKeyedStore>>,
    pub store: Arc<InMemoryKeyedStore>,
    pub clock: ManualClock,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn identified(app_user_id: &str) -> Self {
        Self::with_config(test_config().with_app_user_id(app_user_id))
    }

    pub fn with_config(config: SyncConfig) -> Self {
        Self::on_store(Arc::new(InMemoryKeyedStore::new()), config)
    }

    /// Build a harness over an existing store, as after a process restart.
    pub fn on_store(store: Arc<InMemoryKeyedStore>, config: SyncConfig) -> Self {
        let clock = ManualClock::default();
        let cache = memory_cache_on(Arc::clone(&store), &config, &clock);
        let backend = Arc::new(MockBackend::new());
        let billing = Arc::new(MockBilling::new());
        let (controller, events) = SyncController::new(
            &config,
            Arc::clone(&cache),
            backend.clone(),
            billing.clone(),
        )
        .expect("controller should build");
        Self {
            controller,
            events,
            backend,
            billing,
            cache,
            store,
            clock,
        }
    }

    /// Every event delivered so far.
    pub fn drain_events(&mut self) -> Vec<SyncEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}
