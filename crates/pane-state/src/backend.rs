//! Backend selection and store construction.
//!
//! The backend is chosen once from configuration. Every store is built
//! behind its trait here, so nothing above this module branches on which
//! backend is active.

use std::sync::Arc;

use pane_core::{BackendKind, StateConfig, WorkerId};
use tracing::debug;

use crate::bus::{EventBus, MemoryEventBus, SharedEventBus};
use crate::callbacks::{CallbackRegistry, MemoryBindings, SharedBindings};
use crate::keys::KeySpace;
use crate::routes::{ConnectionRouter, MemoryRouter, SharedRouter};
use crate::sessions::{MemorySessionStore, SessionStore, SharedSessionStore};
use crate::substrate::SharedStore;
use crate::widgets::{MemoryWidgetStore, SharedWidgetStore, WidgetStore};

/// Resolve which backend a worker runs on.
///
/// An explicit `backend` wins; otherwise deploy mode means shared-external
/// and anything else means memory.
pub fn select_backend(config: &StateConfig) -> BackendKind {
    match config.backend {
        Some(kind) => kind,
        None if config.deploy_mode => BackendKind::SharedExternal,
        None => BackendKind::Memory,
    }
}

/// One instance of every store, bound to a single backend.
#[derive(Clone)]
pub struct StoreSet {
    pub widgets: Arc<dyn WidgetStore>,
    pub sessions: Arc<dyn SessionStore>,
    pub routes: Arc<dyn ConnectionRouter>,
    pub bus: Arc<dyn EventBus>,
    pub callbacks: Arc<CallbackRegistry>,
}

impl StoreSet {
    /// Process-local stores.
    pub fn memory(config: &StateConfig, worker_id: &WorkerId) -> Self {
        debug!(%worker_id, "building memory stores");
        Self {
            widgets: Arc::new(MemoryWidgetStore::new(config.widget_ttl())),
            sessions: Arc::new(MemorySessionStore::new(config.session_ttl())),
            routes: Arc::new(MemoryRouter::new()),
            bus: Arc::new(MemoryEventBus::new()),
            callbacks: Arc::new(CallbackRegistry::new(
                worker_id.clone(),
                Arc::new(MemoryBindings::new()),
            )),
        }
    }

    /// Stores on a shared coordination substrate.
    pub fn shared(
        config: &StateConfig,
        worker_id: &WorkerId,
        substrate: Arc<dyn SharedStore>,
    ) -> Self {
        debug!(%worker_id, substrate = substrate.name(), "building shared stores");
        let keys = KeySpace::new(config.key_prefix.clone());
        Self {
            widgets: Arc::new(SharedWidgetStore::new(
                Arc::clone(&substrate),
                keys.clone(),
                config.widget_ttl(),
            )),
            sessions: Arc::new(SharedSessionStore::new(
                Arc::clone(&substrate),
                keys.clone(),
                config.session_ttl(),
            )),
            routes: Arc::new(SharedRouter::new(
                Arc::clone(&substrate),
                keys.clone(),
                config.route_ttl(),
            )),
            bus: Arc::new(SharedEventBus::new(Arc::clone(&substrate), keys.clone())),
            callbacks: Arc::new(CallbackRegistry::new(
                worker_id.clone(),
                Arc::new(SharedBindings::new(substrate, keys)),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_backend_wins() {
        let config = StateConfig {
            deploy_mode: true,
            backend: Some(BackendKind::Memory),
            ..StateConfig::default()
        };
        assert_eq!(select_backend(&config), BackendKind::Memory);
    }

    #[test]
    fn deploy_mode_selects_shared() {
        let config = StateConfig {
            deploy_mode: true,
            ..StateConfig::default()
        };
        assert_eq!(select_backend(&config), BackendKind::SharedExternal);
    }

    #[test]
    fn memory_is_the_default() {
        assert_eq!(select_backend(&StateConfig::default()), BackendKind::Memory);
    }
}
