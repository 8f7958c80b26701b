//! Two workers sharing one coordination store.

use std::sync::Arc;
use std::time::Duration;

use pane_core::StateConfig;
use pane_state::{
    callback, handler, ConnectionInfo, ConnectionRouter, Dispatcher, EventBus, EventFilter,
    EventMessage, LoopbackStore, Resolution, ServerStateManager, SessionPatch, SessionStore,
    SessionToken, StateError, UserSession, WidgetData, WidgetStore,
};
use serde_json::json;
use tokio::sync::mpsc;

async fn worker(store: &LoopbackStore, worker_id: &str) -> Arc<ServerStateManager> {
    let config = StateConfig {
        worker_id: Some(worker_id.to_string()),
        key_prefix: "it:".to_string(),
        ..StateConfig::default()
    };
    Arc::new(
        ServerStateManager::with_substrate(config, Arc::new(store.clone()))
            .await
            .unwrap(),
    )
}

async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("channel closed")
}

async fn recv_frame(rx: &mut mpsc::Receiver<String>) -> EventMessage {
    let frame = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for frame")
        .expect("socket channel closed");
    serde_json::from_str(&frame).unwrap()
}

#[tokio::test]
async fn widget_written_on_one_worker_is_read_on_another() {
    let store = LoopbackStore::new();
    let a = worker(&store, "worker-a").await;
    let b = worker(&store, "worker-b").await;

    a.widgets()
        .create(WidgetData::new("w1", "<h1>hi</h1>"))
        .await
        .unwrap();
    assert_eq!(b.widgets().get("w1").await.unwrap().html, "<h1>hi</h1>");

    let err = b
        .widgets()
        .create(WidgetData::new("w1", "<p>dup</p>"))
        .await
        .unwrap_err();
    assert!(matches!(err, StateError::AlreadyExists(_)));

    assert!(b.widgets().delete("w1").await.unwrap());
    assert!(!a.widgets().delete("w1").await.unwrap());
    assert!(matches!(
        a.widgets().get("w1").await.unwrap_err(),
        StateError::NotFound(_)
    ));
}

#[tokio::test]
async fn every_worker_sees_the_event_but_only_the_owner_routes_it() {
    let store = LoopbackStore::new();
    let a = worker(&store, "worker-a").await;
    let b = worker(&store, "worker-b").await;

    a.routes()
        .register(ConnectionInfo::new("c1", "w1", "worker-a"))
        .await
        .unwrap();

    let (tx_a, mut raw_a) = mpsc::unbounded_channel();
    let _sub_a = a
        .bus()
        .subscribe(
            EventFilter::widget("w1"),
            handler(move |e| {
                let tx = tx_a.clone();
                async move {
                    let _ = tx.send(e);
                }
            }),
        )
        .await
        .unwrap();
    let (tx_b, mut raw_b) = mpsc::unbounded_channel();
    let _sub_b = b
        .bus()
        .subscribe(
            EventFilter::widget("w1"),
            handler(move |e| {
                let tx = tx_b.clone();
                async move {
                    let _ = tx.send(e);
                }
            }),
        )
        .await
        .unwrap();

    let ping = EventMessage::new("w1", "app:ping", json!({}));
    a.bus().publish(ping.clone()).await.unwrap();
    assert_eq!(recv(&mut raw_a).await, ping);
    assert_eq!(recv(&mut raw_b).await, ping);

    let routes = b.routes().lookup("w1").await.unwrap();
    assert_eq!(routes.len(), 1);
    assert_eq!(routes[0].worker_id, "worker-a");
    assert!(routes.iter().all(|r| r.worker_id != b.worker_id().as_str()));
}

#[tokio::test]
async fn reply_reaches_the_socket_on_the_owning_worker() {
    let store = LoopbackStore::new();
    let a = Dispatcher::new(worker(&store, "worker-a").await);
    let b = Dispatcher::new(worker(&store, "worker-b").await);

    let (tx_a, mut socket_a) = mpsc::channel(16);
    let (tx_b, mut socket_b) = mpsc::channel(16);
    a.attach("w1", tx_a).await.unwrap();
    b.attach("w2", tx_b).await.unwrap();

    a.emit(EventMessage::new("w2", "app:update", json!({"n": 1})))
        .await
        .unwrap();
    a.emit(EventMessage::new("w1", "app:update", json!({"n": 2})))
        .await
        .unwrap();

    assert_eq!(recv_frame(&mut socket_b).await.payload["n"], json!(1));
    assert_eq!(recv_frame(&mut socket_a).await.payload["n"], json!(2));
    assert!(socket_a.try_recv().is_err());
    assert!(socket_b.try_recv().is_err());
}

#[tokio::test]
async fn client_event_is_forwarded_to_the_callback_owner() {
    let store = LoopbackStore::new();
    let a = Dispatcher::new(worker(&store, "worker-a").await);
    let b = Dispatcher::new(worker(&store, "worker-b").await);

    a.register_callback(
        "w1",
        "app:click",
        callback(|event: EventMessage| async move {
            Ok(vec![event.reply("app:clicked", event.payload.clone())])
        }),
    )
    .await
    .unwrap();

    let (tx, mut socket) = mpsc::channel(16);
    let conn = b.attach("w1", tx).await.unwrap();
    b.handle_inbound(&conn, "app:click", json!({"x": 3}))
        .await
        .unwrap();

    let reply = recv_frame(&mut socket).await;
    assert_eq!(reply.event_type, "app:clicked");
    assert_eq!(reply.payload, json!({"x": 3}));
    assert_eq!(reply.source_worker.as_deref(), Some("worker-a"));
}

#[tokio::test]
async fn binding_is_local_on_the_owner_and_a_marker_elsewhere() {
    let store = LoopbackStore::new();
    let a = worker(&store, "worker-a").await;
    let b = worker(&store, "worker-b").await;

    a.callbacks()
        .register(
            "w1",
            "app:click",
            callback(|_event: EventMessage| async move { Ok(Vec::new()) }),
        )
        .await
        .unwrap();

    assert!(matches!(
        a.callbacks().resolve("w1", "app:click").await.unwrap(),
        Resolution::Local(_)
    ));
    match b.callbacks().resolve("w1", "app:click").await.unwrap() {
        Resolution::Remote(binding) => assert_eq!(binding.worker_id, "worker-a"),
        Resolution::Local(_) => panic!("worker-b must not get an invokable handle"),
    }
}

#[tokio::test]
async fn concurrent_token_refresh_keeps_roles() {
    let store = LoopbackStore::new();
    let a = worker(&store, "worker-a").await;
    let b = worker(&store, "worker-b").await;

    let session = UserSession::new(
        "s1",
        "alice",
        vec!["admin".to_string(), "editor".to_string()],
        SessionToken::bearer("initial"),
        Duration::from_secs(3600),
    );
    let expires_at = session.expires_at + 600;
    a.sessions().create(session).await.unwrap();

    let (ra, rb) = tokio::join!(
        a.sessions()
            .update("s1", SessionPatch::token_refresh("token-a", None, expires_at)),
        b.sessions()
            .update("s1", SessionPatch::token_refresh("token-b", None, expires_at)),
    );
    ra.unwrap();
    rb.unwrap();

    let stored = a.sessions().get("s1").await.unwrap();
    assert!(["token-a", "token-b"].contains(&stored.token.access_token.as_str()));
    assert_eq!(stored.roles, vec!["admin", "editor"]);
    assert_eq!(stored.expires_at, expires_at);
}

#[tokio::test]
async fn unreachable_bus_degrades_to_local_delivery() {
    let store = LoopbackStore::new();
    let a = Dispatcher::new(worker(&store, "worker-a").await);
    let (tx, mut socket) = mpsc::channel(16);
    a.attach("w1", tx).await.unwrap();

    store.set_offline(true);
    a.emit(EventMessage::new("w1", "app:update", json!({"n": 1})))
        .await
        .unwrap();
    assert_eq!(recv_frame(&mut socket).await.payload["n"], json!(1));
}

#[tokio::test]
async fn redelivered_event_reaches_the_socket_once() {
    let store = LoopbackStore::new();
    let a = Dispatcher::new(worker(&store, "worker-a").await);
    let (tx, mut socket) = mpsc::channel(16);
    a.attach("w1", tx).await.unwrap();

    let mut event = EventMessage::new("w1", "app:update", json!({"n": 1}));
    event.event_id = Some("evt-1".to_string());
    let bus = a.manager().bus();
    bus.publish(event.clone()).await.unwrap();
    bus.publish(event).await.unwrap();
    bus.publish(EventMessage::new("w1", "app:done", json!({})))
        .await
        .unwrap();

    assert_eq!(recv_frame(&mut socket).await.event_type, "app:update");
    assert_eq!(recv_frame(&mut socket).await.event_type, "app:done");
}
