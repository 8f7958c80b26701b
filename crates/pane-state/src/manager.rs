//! ServerStateManager — the composition root of a worker's state layer.
//!
//! Built once at process start and shared as an `Arc` for the process
//! lifetime. Startup against a shared backend either reaches the store or
//! fails; a worker never serves with half its stores configured.

use std::sync::Arc;

use pane_core::{BackendKind, StateConfig, WorkerId};
use tracing::{info, warn};

use crate::backend::{select_backend, StoreSet};
use crate::bus::EventBus;
use crate::callbacks::CallbackRegistry;
use crate::error::{StateError, StateResult};
use crate::routes::ConnectionRouter;
use crate::sessions::SessionStore;
use crate::substrate::{self, bounded, SharedStore};
use crate::widgets::WidgetStore;

pub struct ServerStateManager {
    config: StateConfig,
    worker_id: WorkerId,
    backend: BackendKind,
    substrate: Option<Arc<dyn SharedStore>>,
    stores: StoreSet,
}

impl ServerStateManager {
    /// Resolve the backend, connect if it is shared, and build every store.
    ///
    /// Errors here are fatal to the caller.
    pub async fn start(config: StateConfig) -> StateResult<Self> {
        config.validate()?;
        match select_backend(&config) {
            BackendKind::Memory => Self::in_memory(config),
            BackendKind::SharedExternal => {
                let url = config.backend_url.clone().ok_or_else(|| {
                    StateError::Config(
                        "shared-external backend selected but no backend_url configured"
                            .to_string(),
                    )
                })?;
                let store =
                    substrate::connect(&url, config.connect_timeout(), config.op_timeout()).await?;
                Self::with_substrate(config, store).await
            }
        }
    }

    /// Memory backend. Never touches the network.
    pub fn in_memory(config: StateConfig) -> StateResult<Self> {
        config.validate()?;
        let worker_id = WorkerId::from_config(config.worker_id.as_deref());
        let stores = StoreSet::memory(&config, &worker_id);
        info!(%worker_id, backend = "memory", "state layer ready");
        Ok(Self {
            config,
            worker_id,
            backend: BackendKind::Memory,
            substrate: None,
            stores,
        })
    }

    /// Shared-external backend over an already-opened substrate.
    ///
    /// The substrate must answer a ping within the connect timeout.
    pub async fn with_substrate(
        config: StateConfig,
        store: Arc<dyn SharedStore>,
    ) -> StateResult<Self> {
        config.validate()?;
        let worker_id = WorkerId::from_config(config.worker_id.as_deref());

        bounded(config.connect_timeout(), store.ping())
            .await
            .map_err(|e| {
                StateError::BackendUnavailable(format!("{} ping failed: {e}", store.name()))
            })?;

        let stores = StoreSet::shared(&config, &worker_id, Arc::clone(&store));
        info!(
            %worker_id,
            backend = "shared-external",
            substrate = store.name(),
            prefix = %config.key_prefix,
            "state layer ready"
        );
        Ok(Self {
            config,
            worker_id,
            backend: BackendKind::SharedExternal,
            substrate: Some(store),
            stores,
        })
    }

    pub fn widgets(&self) -> &Arc<dyn WidgetStore> {
        &self.stores.widgets
    }

    pub fn sessions(&self) -> &Arc<dyn SessionStore> {
        &self.stores.sessions
    }

    pub fn routes(&self) -> &Arc<dyn ConnectionRouter> {
        &self.stores.routes
    }

    pub fn bus(&self) -> &Arc<dyn EventBus> {
        &self.stores.bus
    }

    pub fn callbacks(&self) -> &Arc<CallbackRegistry> {
        &self.stores.callbacks
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    pub fn backend(&self) -> BackendKind {
        self.backend
    }

    pub fn config(&self) -> &StateConfig {
        &self.config
    }

    /// Whether the backend answers. Always true for memory.
    pub async fn healthy(&self) -> bool {
        match &self.substrate {
            Some(store) => match bounded(self.config.op_timeout(), store.ping()).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(error = %e, "backend health check failed");
                    false
                }
            },
            None => true,
        }
    }

    /// Rebuild every store. Test isolation only.
    ///
    /// Memory state is discarded. Shared records stay in the substrate;
    /// this worker's local tables (owned routes, callables) are dropped.
    pub fn reset(&mut self) {
        self.stores = match &self.substrate {
            Some(store) => StoreSet::shared(&self.config, &self.worker_id, Arc::clone(store)),
            None => StoreSet::memory(&self.config, &self.worker_id),
        };
        warn!(worker_id = %self.worker_id, "state layer reset");
    }
}
