//! CallbackRegistry — which server-side callable handles a widget event.
//!
//! Callables cannot cross process boundaries, so only the binding (owner
//! worker and a local handle id) is shared. The callable itself stays in
//! the registering worker's local table. A worker that resolves a binding
//! owned elsewhere gets [`Resolution::Remote`] and forwards the event to the
//! owner over the event bus.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use pane_core::{new_handle_id, WorkerId};
use tracing::{debug, info, warn};

use crate::error::{StateError, StateResult};
use crate::keys::KeySpace;
use crate::substrate::{SharedStore, WriteMode};
use crate::types::{epoch_secs, CallbackBinding, EventMessage, WidgetId};

/// Future returned by a [`Callback`]: the events to emit in response.
pub type CallbackFuture = Pin<Box<dyn Future<Output = Result<Vec<EventMessage>, String>> + Send>>;

/// A server-side event handler.
pub type Callback = Arc<dyn Fn(EventMessage) -> CallbackFuture + Send + Sync>;

/// Wrap an async closure as a [`Callback`].
pub fn callback<F, Fut>(f: F) -> Callback
where
    F: Fn(EventMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<EventMessage>, String>> + Send + 'static,
{
    Arc::new(move |event| Box::pin(f(event)))
}

/// Outcome of [`CallbackRegistry::resolve`].
pub enum Resolution {
    /// This worker owns the binding; run the callable here.
    Local(Callback),
    /// Another worker owns the binding.
    Remote(CallbackBinding),
}

impl std::fmt::Debug for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Resolution::Local(_) => f.write_str("Local(..)"),
            Resolution::Remote(binding) => f.debug_tuple("Remote").field(binding).finish(),
        }
    }
}

// ── Binding storage ────────────────────────────────────────────────

/// Where bindings live: process memory or the shared substrate.
#[async_trait]
pub trait BindingStore: Send + Sync {
    /// Insert or replace the binding for `(widget_id, event_type)`.
    async fn bind(&self, binding: CallbackBinding) -> StateResult<()>;

    async fn binding(
        &self,
        widget_id: &str,
        event_type: &str,
    ) -> StateResult<Option<CallbackBinding>>;

    async fn bindings(&self, widget_id: &str) -> StateResult<Vec<CallbackBinding>>;

    /// Remove every binding of a widget and return them.
    async fn unbind_all(&self, widget_id: &str) -> StateResult<Vec<CallbackBinding>>;
}

#[derive(Default)]
pub struct MemoryBindings {
    by_widget: DashMap<WidgetId, BTreeMap<String, CallbackBinding>>,
}

impl MemoryBindings {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BindingStore for MemoryBindings {
    async fn bind(&self, binding: CallbackBinding) -> StateResult<()> {
        self.by_widget
            .entry(binding.widget_id.clone())
            .or_default()
            .insert(binding.event_type.clone(), binding);
        Ok(())
    }

    async fn binding(
        &self,
        widget_id: &str,
        event_type: &str,
    ) -> StateResult<Option<CallbackBinding>> {
        Ok(self
            .by_widget
            .get(widget_id)
            .and_then(|b| b.get(event_type).cloned()))
    }

    async fn bindings(&self, widget_id: &str) -> StateResult<Vec<CallbackBinding>> {
        Ok(self
            .by_widget
            .get(widget_id)
            .map(|b| b.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn unbind_all(&self, widget_id: &str) -> StateResult<Vec<CallbackBinding>> {
        Ok(self
            .by_widget
            .remove(widget_id)
            .map(|(_, b)| b.into_values().collect())
            .unwrap_or_default())
    }
}

/// Bindings in a `callbacks:{widget_id}` hash, field per event type.
pub struct SharedBindings {
    store: Arc<dyn SharedStore>,
    keys: KeySpace,
}

impl SharedBindings {
    pub fn new(store: Arc<dyn SharedStore>, keys: KeySpace) -> Self {
        Self { store, keys }
    }
}

fn decode_binding(raw: &str) -> StateResult<CallbackBinding> {
    serde_json::from_str(raw).map_err(|e| StateError::Deserialize(e.to_string()))
}

#[async_trait]
impl BindingStore for SharedBindings {
    async fn bind(&self, binding: CallbackBinding) -> StateResult<()> {
        let raw =
            serde_json::to_string(&binding).map_err(|e| StateError::Serialize(e.to_string()))?;
        self.store
            .hash_set(
                &self.keys.callbacks(&binding.widget_id),
                &[(binding.event_type.clone(), raw)],
                WriteMode::Always,
                None,
            )
            .await?;
        Ok(())
    }

    async fn binding(
        &self,
        widget_id: &str,
        event_type: &str,
    ) -> StateResult<Option<CallbackBinding>> {
        let fields = self.store.hash_get_all(&self.keys.callbacks(widget_id)).await?;
        fields.get(event_type).map(|raw| decode_binding(raw)).transpose()
    }

    async fn bindings(&self, widget_id: &str) -> StateResult<Vec<CallbackBinding>> {
        let fields = self.store.hash_get_all(&self.keys.callbacks(widget_id)).await?;
        let mut bindings = fields
            .values()
            .map(|raw| decode_binding(raw))
            .collect::<StateResult<Vec<_>>>()?;
        bindings.sort_by(|a, b| a.event_type.cmp(&b.event_type));
        Ok(bindings)
    }

    async fn unbind_all(&self, widget_id: &str) -> StateResult<Vec<CallbackBinding>> {
        let bindings = self.bindings(widget_id).await?;
        self.store.delete(&self.keys.callbacks(widget_id)).await?;
        Ok(bindings)
    }
}

// ── Registry ───────────────────────────────────────────────────────

struct LocalCallback {
    widget_id: WidgetId,
    callback: Callback,
}

/// Per-worker view of callback bindings.
pub struct CallbackRegistry {
    worker_id: WorkerId,
    bindings: Arc<dyn BindingStore>,
    /// handle_id → callable owned by this worker.
    local: DashMap<String, LocalCallback>,
}

impl CallbackRegistry {
    pub fn new(worker_id: WorkerId, bindings: Arc<dyn BindingStore>) -> Self {
        Self {
            worker_id,
            bindings,
            local: DashMap::new(),
        }
    }

    /// Bind `callback` to `(widget_id, event_type)`, owned by this worker.
    ///
    /// A later registration for the same pair replaces the earlier one,
    /// whichever worker made it.
    pub async fn register(
        &self,
        widget_id: &str,
        event_type: &str,
        callback: Callback,
    ) -> StateResult<CallbackBinding> {
        let previous = self.bindings.binding(widget_id, event_type).await?;

        let handle_id = new_handle_id();
        self.local.insert(
            handle_id.clone(),
            LocalCallback {
                widget_id: widget_id.to_string(),
                callback,
            },
        );
        let binding = CallbackBinding {
            widget_id: widget_id.to_string(),
            event_type: event_type.to_string(),
            worker_id: self.worker_id.to_string(),
            handle_id: handle_id.clone(),
            registered_at: epoch_secs(),
        };
        if let Err(e) = self.bindings.bind(binding.clone()).await {
            self.local.remove(&handle_id);
            return Err(e);
        }

        if let Some(previous) = previous {
            if previous.worker_id == self.worker_id.as_str() {
                self.local.remove(&previous.handle_id);
            }
        }
        info!(%widget_id, %event_type, %handle_id, "callback registered");
        Ok(binding)
    }

    /// Find who handles `(widget_id, event_type)`. `NotFound` when unbound.
    pub async fn resolve(&self, widget_id: &str, event_type: &str) -> StateResult<Resolution> {
        let not_found = || StateError::NotFound(format!("callback {widget_id}/{event_type}"));
        let binding = self
            .bindings
            .binding(widget_id, event_type)
            .await?
            .ok_or_else(not_found)?;

        if binding.worker_id != self.worker_id.as_str() {
            return Ok(Resolution::Remote(binding));
        }
        match self.local.get(&binding.handle_id) {
            Some(local) => Ok(Resolution::Local(Arc::clone(&local.callback))),
            None => {
                // Left behind by an earlier process that used the same worker id.
                warn!(%widget_id, %event_type, handle_id = %binding.handle_id, "binding has no local callable");
                Err(not_found())
            }
        }
    }

    /// Remove every binding of a widget. Returns how many were removed.
    pub async fn unregister_all(&self, widget_id: &str) -> StateResult<usize> {
        let removed = self.bindings.unbind_all(widget_id).await?;
        self.local.retain(|_, local| local.widget_id != widget_id);
        debug!(%widget_id, removed = removed.len(), "callbacks unregistered");
        Ok(removed.len())
    }

    pub async fn bindings(&self, widget_id: &str) -> StateResult<Vec<CallbackBinding>> {
        self.bindings.bindings(widget_id).await
    }

    /// Whether this worker holds any callable for the widget.
    pub fn owns_any(&self, widget_id: &str) -> bool {
        self.local.iter().any(|l| l.widget_id == widget_id)
    }

    pub fn local_count(&self) -> usize {
        self.local.len()
    }
}
