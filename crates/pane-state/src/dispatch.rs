//! Dispatcher — worker-side glue between client sockets and the state layer.
//!
//! Inbound: a client event is resolved through the callback registry. A
//! locally owned callback runs here; a binding owned by another worker is
//! forwarded as a `to_server` event on the widget's channel, where the
//! owner picks it up.
//!
//! Outbound: events are published on the bus. Every worker with a local
//! socket (or callable) for the widget subscribes to its channel, and on
//! each `to_client` event consults the router before pushing bytes down any
//! socket. A worker that owns no matching connection does nothing.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use pane_core::{new_connection_id, new_event_id};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::{debug, info, warn};

use crate::bus::{handler, EventBus, Subscription};
use crate::callbacks::{Callback, Resolution};
use crate::error::{StateError, StateResult};
use crate::manager::ServerStateManager;
use crate::routes::ConnectionRouter;
use crate::widgets::WidgetStore;
use crate::types::{
    CallbackBinding, ConnectionId, ConnectionInfo, EventDirection, EventFilter, EventMessage,
    WidgetId,
};

/// How many recent event ids are remembered for duplicate suppression.
const SEEN_CAPACITY: usize = 4096;

struct LocalSocket {
    widget_id: WidgetId,
    tx: mpsc::Sender<String>,
}

#[derive(Default)]
struct SeenEvents {
    ids: HashSet<String>,
    order: VecDeque<String>,
}

impl SeenEvents {
    /// Returns `false` if `id` was already recorded.
    fn insert(&mut self, id: &str) -> bool {
        if self.ids.contains(id) {
            return false;
        }
        if self.order.len() == SEEN_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        self.ids.insert(id.to_string());
        self.order.push_back(id.to_string());
        true
    }
}

struct Inner {
    manager: Arc<ServerStateManager>,
    sockets: DashMap<ConnectionId, LocalSocket>,
    subscriptions: AsyncMutex<HashMap<WidgetId, Subscription>>,
    seen: Mutex<SeenEvents>,
}

/// Per-worker event dispatcher. Cheap to clone.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    pub fn new(manager: Arc<ServerStateManager>) -> Self {
        Self {
            inner: Arc::new(Inner {
                manager,
                sockets: DashMap::new(),
                subscriptions: AsyncMutex::new(HashMap::new()),
                seen: Mutex::new(SeenEvents::default()),
            }),
        }
    }

    pub fn manager(&self) -> &Arc<ServerStateManager> {
        &self.inner.manager
    }

    /// Attach a client socket to a widget. Outbound frames are pushed to `tx`.
    pub async fn attach(
        &self,
        widget_id: &str,
        tx: mpsc::Sender<String>,
    ) -> StateResult<ConnectionId> {
        let connection_id = new_connection_id();
        self.inner.ensure_subscribed(widget_id).await?;

        // The route goes in before the socket is visible, so delivery never
        // sees a socket whose registration is still pending or has failed.
        let worker_id = self.inner.manager.worker_id().to_string();
        let connection = ConnectionInfo::new(connection_id.clone(), widget_id, worker_id);
        if let Err(e) = self.inner.manager.routes().register(connection).await {
            self.inner.release(widget_id).await;
            return Err(e);
        }
        self.inner.sockets.insert(
            connection_id.clone(),
            LocalSocket {
                widget_id: widget_id.to_string(),
                tx,
            },
        );
        self.inner.touch_widget(widget_id).await;
        info!(%connection_id, %widget_id, "client attached");
        Ok(connection_id)
    }

    /// Detach a client socket. Idempotent.
    pub async fn detach(&self, connection_id: &str) {
        let Some((_, socket)) = self.inner.sockets.remove(connection_id) else {
            return;
        };
        if let Err(e) = self.inner.manager.routes().unregister(connection_id).await {
            // The route expires on its own once heartbeats stop.
            warn!(%connection_id, error = %e, "route unregister failed");
        }
        self.inner.release(&socket.widget_id).await;
        info!(%connection_id, widget_id = %socket.widget_id, "client detached");
    }

    /// Bind a callback owned by this worker and start listening for
    /// events forwarded to it.
    pub async fn register_callback(
        &self,
        widget_id: &str,
        event_type: &str,
        callback: Callback,
    ) -> StateResult<CallbackBinding> {
        self.inner.ensure_subscribed(widget_id).await?;
        let result = self
            .inner
            .manager
            .callbacks()
            .register(widget_id, event_type, callback)
            .await;
        if result.is_err() {
            self.inner.release(widget_id).await;
        }
        result
    }

    /// Drop every callback of a widget (widget deletion).
    pub async fn forget_widget(&self, widget_id: &str) -> StateResult<usize> {
        let removed = self
            .inner
            .manager
            .callbacks()
            .unregister_all(widget_id)
            .await?;
        self.inner.release(widget_id).await;
        Ok(removed)
    }

    /// Handle an event raised by the client on `connection_id`.
    pub async fn handle_inbound(
        &self,
        connection_id: &str,
        event_type: &str,
        payload: Value,
    ) -> StateResult<()> {
        let widget_id = self
            .inner
            .sockets
            .get(connection_id)
            .map(|s| s.widget_id.clone())
            .ok_or_else(|| StateError::NotFound(format!("connection {connection_id}")))?;
        self.inner.touch_widget(&widget_id).await;

        let mut event = EventMessage::from_client(&widget_id, event_type, payload, connection_id)
            .with_source(self.inner.manager.worker_id().as_str());
        event.event_id = Some(new_event_id());

        match self
            .inner
            .manager
            .callbacks()
            .resolve(&widget_id, event_type)
            .await
        {
            Ok(Resolution::Local(callback)) => {
                self.inner.run_callback(callback, event).await;
                Ok(())
            }
            Ok(Resolution::Remote(binding)) => {
                debug!(%widget_id, %event_type, owner = %binding.worker_id, "forwarding event to callback owner");
                self.inner.manager.bus().publish(event).await
            }
            Err(StateError::NotFound(_)) => {
                debug!(%widget_id, %event_type, "no callback bound");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Publish a client-bound event. Falls back to local sockets when the
    /// bus cannot be reached.
    pub async fn emit(&self, event: EventMessage) -> StateResult<()> {
        self.inner.emit(event).await
    }

    /// Number of sockets attached to this worker.
    pub fn local_connections(&self) -> usize {
        self.inner.sockets.len()
    }

    /// Detach every socket and drop every subscription.
    pub async fn shutdown(&self) {
        let ids: Vec<ConnectionId> = self.inner.sockets.iter().map(|s| s.key().clone()).collect();
        for connection_id in ids {
            self.detach(&connection_id).await;
        }
        self.inner.subscriptions.lock().await.clear();
    }
}

impl Inner {
    async fn ensure_subscribed(self: &Arc<Self>, widget_id: &str) -> StateResult<()> {
        let mut subscriptions = self.subscriptions.lock().await;
        if subscriptions.contains_key(widget_id) {
            return Ok(());
        }
        let weak: Weak<Inner> = Arc::downgrade(self);
        let on_event = handler(move |event| {
            let weak = weak.clone();
            async move {
                if let Some(inner) = weak.upgrade() {
                    inner.on_bus_event(event).await;
                }
            }
        });
        let subscription = self
            .manager
            .bus()
            .subscribe(EventFilter::widget(widget_id), on_event)
            .await?;
        subscriptions.insert(widget_id.to_string(), subscription);
        debug!(%widget_id, "widget channel subscribed");
        Ok(())
    }

    /// Client activity keeps the widget record alive past its TTL.
    async fn touch_widget(&self, widget_id: &str) {
        match self.manager.widgets().touch(widget_id).await {
            Ok(()) => {}
            Err(StateError::NotFound(_)) => debug!(%widget_id, "no widget record to refresh"),
            Err(e) => warn!(%widget_id, error = %e, "widget refresh failed"),
        }
    }

    /// Register the route of a local socket again. If the socket detached
    /// while the write was in flight, the route is removed so it does not
    /// outlive the connection.
    async fn restore_route(&self, connection_id: &str, widget_id: &str) {
        let routes = self.manager.routes();
        let connection =
            ConnectionInfo::new(connection_id, widget_id, self.manager.worker_id().as_str());
        if let Err(e) = routes.register(connection).await {
            warn!(%connection_id, error = %e, "route re-registration failed");
            return;
        }
        if self.sockets.contains_key(connection_id) {
            info!(%connection_id, "unrouted local socket registered again");
            return;
        }
        if let Err(e) = routes.unregister(connection_id).await {
            warn!(%connection_id, error = %e, "failed to remove route of detached socket");
        }
    }

    /// Drop the widget subscription once nothing local needs it.
    async fn release(&self, widget_id: &str) {
        let mut subscriptions = self.subscriptions.lock().await;
        let in_use = self.sockets.iter().any(|s| s.widget_id == widget_id)
            || self.manager.callbacks().owns_any(widget_id);
        if !in_use && subscriptions.remove(widget_id).is_some() {
            debug!(%widget_id, "widget channel released");
        }
    }

    async fn emit(&self, mut event: EventMessage) -> StateResult<()> {
        event.direction = EventDirection::ToClient;
        if event.source_worker.is_none() {
            event.source_worker = Some(self.manager.worker_id().to_string());
        }
        if event.event_id.is_none() {
            event.event_id = Some(new_event_id());
        }
        match self.manager.bus().publish(event.clone()).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_unavailable() => {
                warn!(widget_id = %event.widget_id, error = %e, "bus unavailable, delivering locally");
                if let Some(id) = &event.event_id {
                    self.seen.lock().insert(id);
                }
                self.push_local(&event, None);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn run_callback(&self, callback: Callback, event: EventMessage) {
        let widget_id = event.widget_id.clone();
        let event_type = event.event_type.clone();
        match callback(event).await {
            Ok(replies) => {
                for reply in replies {
                    if let Err(e) = self.emit(reply).await {
                        warn!(%widget_id, error = %e, "failed to emit callback reply");
                    }
                }
            }
            Err(message) => {
                warn!(%widget_id, %event_type, error = %message, "callback failed");
            }
        }
    }

    async fn on_bus_event(&self, event: EventMessage) {
        if let Some(id) = &event.event_id {
            if !self.seen.lock().insert(id) {
                debug!(event_id = %id, "duplicate event dropped");
                return;
            }
        }
        match event.direction {
            EventDirection::ToClient => self.deliver(event).await,
            EventDirection::ToServer => {
                let resolved = self
                    .manager
                    .callbacks()
                    .resolve(&event.widget_id, &event.event_type)
                    .await;
                // Only the owning worker acts on forwarded client events.
                if let Ok(Resolution::Local(callback)) = resolved {
                    self.run_callback(callback, event).await;
                }
            }
        }
    }

    /// Push a client-bound event to the sockets this worker owns.
    async fn deliver(&self, event: EventMessage) {
        let worker_id = self.manager.worker_id().as_str();
        let routed: HashSet<ConnectionId> = match self.manager.routes().lookup(&event.widget_id).await {
            Ok(routes) => routes
                .into_iter()
                .filter(|r| r.worker_id == worker_id)
                .map(|r| r.connection_id)
                .collect(),
            Err(e) => {
                warn!(widget_id = %event.widget_id, error = %e, "route lookup failed, delivering to local sockets");
                self.push_local(&event, None);
                return;
            }
        };

        let unrouted = self.push_local(&event, Some(&routed));
        for connection_id in unrouted {
            self.restore_route(&connection_id, &event.widget_id).await;
        }
    }

    /// Send to local sockets of the event's widget. With `routed`, sockets
    /// missing from it are still served and returned for re-registration.
    fn push_local(
        &self,
        event: &EventMessage,
        routed: Option<&HashSet<ConnectionId>>,
    ) -> Vec<ConnectionId> {
        let frame = match serde_json::to_string(event) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "failed to encode event frame");
                return Vec::new();
            }
        };
        let mut unrouted = Vec::new();
        for socket in self.sockets.iter().filter(|s| s.widget_id == event.widget_id) {
            let connection_id = socket.key();
            if routed.is_some_and(|r| !r.contains(connection_id)) {
                unrouted.push(connection_id.clone());
            }
            match socket.tx.try_send(frame.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(%connection_id, "send queue full, dropping event");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(%connection_id, "socket closed before delivery");
                }
            }
        }
        unrouted
    }
}
