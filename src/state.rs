use std::sync::Arc;

use crate::config::Config;
use crate::engine::{Engine, EngineSettings};
use crate::notify::BroadcastDispatcher;
use crate::notify::audit::InMemoryAudit;
use crate::observability::metrics::Metrics;
use crate::store::RequestStore;

pub struct AppState {
    pub engine: Arc<Engine>,
    pub store: Arc<RequestStore>,
    pub dispatcher: Arc<BroadcastDispatcher>,
    pub audit: Arc<InMemoryAudit>,
    pub metrics: Metrics,
}

impl AppState {
    pub fn new(event_buffer_size: usize, settings: EngineSettings) -> Self {
        Self::with_dispatcher(BroadcastDispatcher::new(event_buffer_size), settings)
    }

    pub fn from_config(config: &Config) -> Self {
        let dispatcher =
            BroadcastDispatcher::new(config.event_buffer_size).with_inbox_capacity(config.inbox_capacity);
        Self::with_dispatcher(dispatcher, config.engine_settings())
    }

    fn with_dispatcher(dispatcher: BroadcastDispatcher, settings: EngineSettings) -> Self {
        let store = Arc::new(RequestStore::new());
        let dispatcher = Arc::new(dispatcher);
        let audit = Arc::new(InMemoryAudit::new());
        let metrics = Metrics::new();

        let engine = Arc::new(Engine::new(
            store.clone(),
            dispatcher.clone(),
            audit.clone(),
            settings,
            metrics.clone(),
        ));

        Self {
            engine,
            store,
            dispatcher,
            audit,
            metrics,
        }
    }
}
