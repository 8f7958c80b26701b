//! EventBus — publish/subscribe fan-out of widget events.
//!
//! Publishing never waits for subscribers. Every subscription owns an
//! unbounded queue drained by a single task that awaits the handler for one
//! event before taking the next, so events from one publisher for one
//! widget reach a handler in publish order.
//!
//! The shared bus uses one channel per widget (`events:{widget_id}`).
//! Delivery is at-least-once: consumers must tolerate duplicates.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{StateError, StateResult};
use crate::keys::KeySpace;
use crate::substrate::{Inbox, SharedStore};
use crate::types::{EventFilter, EventMessage};

/// Async event handler invoked once per matching event.
pub type EventHandler = Arc<dyn Fn(EventMessage) -> BoxFuture + Send + Sync>;

type BoxFuture = std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>;

/// Wrap an async closure as an [`EventHandler`].
pub fn handler<F, Fut>(f: F) -> EventHandler
where
    F: Fn(EventMessage) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    Arc::new(move |event| Box::pin(f(event)))
}

/// A live subscription. Dropping it stops delivery.
pub struct Subscription {
    filter: EventFilter,
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn filter(&self) -> &EventFilter {
        &self.filter
    }

    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stop delivery. Same as dropping the subscription.
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[async_trait]
pub trait EventBus: Send + Sync {
    /// Hand the event off for delivery. Does not wait for any subscriber.
    async fn publish(&self, event: EventMessage) -> StateResult<()>;

    /// Run `handler` for every event matching `filter` until the returned
    /// subscription is dropped.
    async fn subscribe(
        &self,
        filter: EventFilter,
        handler: EventHandler,
    ) -> StateResult<Subscription>;
}

fn drain(mut rx: mpsc::UnboundedReceiver<EventMessage>, handler: EventHandler) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            handler(event).await;
        }
    })
}

// ── Memory ─────────────────────────────────────────────────────────

struct LocalSubscriber {
    filter: EventFilter,
    tx: mpsc::UnboundedSender<EventMessage>,
}

/// In-process bus. Only subscribers in this process see events.
#[derive(Default)]
pub struct MemoryEventBus {
    subscribers: RwLock<Vec<LocalSubscriber>>,
    next_id: AtomicU64,
}

impl MemoryEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .iter()
            .filter(|s| !s.tx.is_closed())
            .count()
    }
}

#[async_trait]
impl EventBus for MemoryEventBus {
    async fn publish(&self, event: EventMessage) -> StateResult<()> {
        let mut closed = false;
        {
            let subscribers = self.subscribers.read();
            for sub in subscribers.iter().filter(|s| s.filter.matches(&event)) {
                if sub.tx.send(event.clone()).is_err() {
                    closed = true;
                }
            }
        }
        if closed {
            self.subscribers.write().retain(|s| !s.tx.is_closed());
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        filter: EventFilter,
        handler: EventHandler,
    ) -> StateResult<Subscription> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.write().push(LocalSubscriber {
            filter: filter.clone(),
            tx,
        });
        debug!(subscription = id, ?filter, "local subscription opened");
        Ok(Subscription {
            filter,
            task: drain(rx, handler),
        })
    }
}

// ── Shared ─────────────────────────────────────────────────────────

const RESUBSCRIBE_MIN: Duration = Duration::from_millis(100);
const RESUBSCRIBE_MAX: Duration = Duration::from_secs(5);

/// Bus on the shared substrate's publish/subscribe channels.
pub struct SharedEventBus {
    store: Arc<dyn SharedStore>,
    keys: KeySpace,
}

impl SharedEventBus {
    pub fn new(store: Arc<dyn SharedStore>, keys: KeySpace) -> Self {
        Self { store, keys }
    }
}

fn bus_error(e: StateError) -> StateError {
    match e {
        StateError::BusUnavailable(_) => e,
        other => StateError::BusUnavailable(other.to_string()),
    }
}

async fn open(store: &dyn SharedStore, topic: &Topic) -> StateResult<Inbox> {
    match topic {
        Topic::Channel(channel) => store.subscribe(channel).await,
        Topic::Pattern(pattern) => store.psubscribe(pattern).await,
    }
}

enum Topic {
    Channel(String),
    Pattern(String),
}

impl Topic {
    fn name(&self) -> &str {
        match self {
            Topic::Channel(name) | Topic::Pattern(name) => name,
        }
    }
}

#[async_trait]
impl EventBus for SharedEventBus {
    async fn publish(&self, event: EventMessage) -> StateResult<()> {
        let payload =
            serde_json::to_string(&event).map_err(|e| StateError::Serialize(e.to_string()))?;
        let channel = self.keys.events(&event.widget_id);
        let receivers = self
            .store
            .publish(&channel, &payload)
            .await
            .map_err(bus_error)?;
        debug!(%channel, event_type = %event.event_type, receivers, "event published");
        Ok(())
    }

    async fn subscribe(
        &self,
        filter: EventFilter,
        handler: EventHandler,
    ) -> StateResult<Subscription> {
        let topic = match &filter.widget_id {
            Some(widget_id) => Topic::Channel(self.keys.events(widget_id)),
            None => Topic::Pattern(self.keys.events_pattern()),
        };
        let mut inbox = open(self.store.as_ref(), &topic)
            .await
            .map_err(bus_error)?;
        debug!(topic = %topic.name(), "channel subscription opened");

        let store = Arc::clone(&self.store);
        let predicate = filter.clone();
        let task = tokio::spawn(async move {
            let mut backoff = RESUBSCRIBE_MIN;
            loop {
                // The inbox queue is unbounded, so awaiting the handler here
                // never holds up the publisher.
                while let Some(message) = inbox.recv().await {
                    backoff = RESUBSCRIBE_MIN;
                    match serde_json::from_str::<EventMessage>(&message.payload) {
                        Ok(event) if predicate.matches(&event) => handler(event).await,
                        Ok(_) => {}
                        Err(e) => {
                            warn!(channel = %message.channel, error = %e, "dropping undecodable event");
                        }
                    }
                }

                loop {
                    warn!(topic = %topic.name(), ?backoff, "subscription lost, resubscribing");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(RESUBSCRIBE_MAX);
                    match open(store.as_ref(), &topic).await {
                        Ok(reopened) => {
                            inbox = reopened;
                            break;
                        }
                        Err(e) => warn!(topic = %topic.name(), error = %e, "resubscribe failed"),
                    }
                }
            }
        });

        Ok(Subscription { filter, task })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::substrate::LoopbackStore;
    use serde_json::json;

    fn collector() -> (EventHandler, mpsc::UnboundedReceiver<EventMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let h = handler(move |event| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(event);
            }
        });
        (h, rx)
    }

    fn shared(store: &LoopbackStore) -> SharedEventBus {
        SharedEventBus::new(Arc::new(store.clone()), KeySpace::new("test:"))
    }

    fn numbered(i: u64) -> EventMessage {
        EventMessage::new("w1", "app:tick", json!({ "n": i }))
    }

    async fn check_publish_order(bus: &dyn EventBus) {
        let (h, mut rx) = collector();
        let _sub = bus.subscribe(EventFilter::widget("w1"), h).await.unwrap();
        for i in 0..100 {
            bus.publish(numbered(i)).await.unwrap();
        }
        for i in 0..100 {
            let event = rx.recv().await.unwrap();
            assert_eq!(event.payload["n"], json!(i));
        }
    }

    async fn check_filtering(bus: &dyn EventBus) {
        let (h, mut rx) = collector();
        let _sub = bus
            .subscribe(EventFilter::widget("w1").event_type("app:*"), h)
            .await
            .unwrap();
        bus.publish(EventMessage::new("w1", "grid:select", json!({})))
            .await
            .unwrap();
        bus.publish(EventMessage::new("w2", "app:ping", json!({})))
            .await
            .unwrap();
        bus.publish(EventMessage::new("w1", "app:ping", json!({})))
            .await
            .unwrap();
        bus.publish(EventMessage::new("w1", "app:done", json!({})))
            .await
            .unwrap();

        assert_eq!(rx.recv().await.unwrap().event_type, "app:ping");
        assert_eq!(rx.recv().await.unwrap().event_type, "app:done");
    }

    async fn check_drop_stops_delivery(bus: &dyn EventBus) {
        let (h, mut rx) = collector();
        let sub = bus.subscribe(EventFilter::all(), h).await.unwrap();
        bus.publish(numbered(1)).await.unwrap();
        assert!(rx.recv().await.is_some());

        sub.unsubscribe();
        bus.publish(numbered(2)).await.unwrap();
        // The handler (and its sender) is dropped with the aborted task.
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn memory_publish_order() {
        check_publish_order(&MemoryEventBus::new()).await;
    }

    #[tokio::test]
    async fn shared_publish_order() {
        check_publish_order(&shared(&LoopbackStore::new())).await;
    }

    #[tokio::test]
    async fn memory_filtering() {
        check_filtering(&MemoryEventBus::new()).await;
    }

    #[tokio::test]
    async fn shared_filtering() {
        check_filtering(&shared(&LoopbackStore::new())).await;
    }

    #[tokio::test]
    async fn memory_drop_stops_delivery() {
        check_drop_stops_delivery(&MemoryEventBus::new()).await;
    }

    #[tokio::test]
    async fn shared_drop_stops_delivery() {
        check_drop_stops_delivery(&shared(&LoopbackStore::new())).await;
    }

    #[tokio::test]
    async fn memory_prunes_closed_subscribers() {
        let bus = MemoryEventBus::new();
        let (h, _rx) = collector();
        let sub = bus.subscribe(EventFilter::all(), h).await.unwrap();
        assert_eq!(bus.subscriber_count(), 1);
        drop(sub);
        while bus.subscriber_count() > 0 {
            tokio::task::yield_now().await;
        }
        bus.publish(numbered(1)).await.unwrap();
        assert!(bus.subscribers.read().is_empty());
    }

    #[tokio::test]
    async fn shared_events_cross_workers() {
        let store = LoopbackStore::new();
        let worker_a = shared(&store);
        let worker_b = shared(&store);

        let (h, mut on_b) = collector();
        let _sub = worker_b
            .subscribe(EventFilter::widget("w1"), h)
            .await
            .unwrap();
        let (h, mut on_b_all) = collector();
        let _all = worker_b.subscribe(EventFilter::all(), h).await.unwrap();

        let event = EventMessage::new("w1", "app:ping", json!({})).with_source("worker-a");
        worker_a.publish(event.clone()).await.unwrap();

        assert_eq!(on_b.recv().await.unwrap(), event);
        assert_eq!(on_b_all.recv().await.unwrap(), event);
    }

    #[tokio::test]
    async fn unreachable_channel_is_bus_unavailable() {
        let store = LoopbackStore::new();
        let bus = shared(&store);
        store.set_offline(true);

        let err = bus.publish(numbered(1)).await.unwrap_err();
        assert!(matches!(err, StateError::BusUnavailable(_)));

        let (h, _rx) = collector();
        let err = bus.subscribe(EventFilter::all(), h).await.err().unwrap();
        assert!(matches!(err, StateError::BusUnavailable(_)));
    }
}
