//! Application state management
//!
//! Contains shared state accessible across all handlers.

use crate::config::Settings;
use crate::governance::{
    EngineActionFactory, EngineActionService, GovernanceEngine, ListenerRegistry, ProcessGraph,
    ServiceRegistry,
};
use crate::store::MetadataStore;
use std::sync::Arc;

/// Application state shared across all handlers
pub struct AppState {
    /// Metadata store backing every process, step and engine action
    pub store: Arc<dyn MetadataStore>,

    pub graph: ProcessGraph,

    pub factory: EngineActionFactory,

    /// Engine action state machine
    pub actions: EngineActionService,

    pub services: Arc<ServiceRegistry>,

    pub listeners: Arc<ListenerRegistry>,

    pub settings: Settings,
}

impl AppState {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        services: Arc<ServiceRegistry>,
        listeners: Arc<ListenerRegistry>,
        settings: Settings,
    ) -> Self {
        let engine = GovernanceEngine::new(store.clone(), listeners.clone(), settings.engine.status_encoding);

        Self {
            store,
            graph: engine.graph,
            factory: engine.factory,
            actions: engine.actions,
            services,
            listeners,
            settings,
        }
    }
}

/// Type alias for shared state
pub type SharedState = Arc<AppState>;
