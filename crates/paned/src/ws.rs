//! WebSocket bridge between a browser tab and the dispatcher.
//!
//! Each socket is split into a writer task (outbound queue plus periodic
//! ping) and a reader task (inbound frames to the dispatcher). Whichever
//! finishes first ends the connection, and the route is unregistered.

use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use pane_state::{is_valid_event_type, Dispatcher, StateError, WidgetStore};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::AppState;

const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Inbound client frame: `{"type": "ns:name", "data": {...}}`.
#[derive(Debug, Deserialize, PartialEq)]
pub struct ClientFrame {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub data: Value,
}

impl ClientFrame {
    pub fn parse(text: &str) -> Result<Self, String> {
        let frame: ClientFrame = serde_json::from_str(text).map_err(|e| e.to_string())?;
        if !is_valid_event_type(&frame.event_type) {
            return Err(format!(
                "event type {:?} is not of the form namespace:name",
                frame.event_type
            ));
        }
        Ok(frame)
    }
}

/// GET /ws/{widget_id}
pub async fn ws_handler(
    Path(widget_id): Path<String>,
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    match state.dispatcher.manager().widgets().get(&widget_id).await {
        Ok(_) => {}
        Err(StateError::NotFound(_)) => {
            return (StatusCode::NOT_FOUND, "widget not found").into_response();
        }
        Err(e) => {
            warn!(%widget_id, error = %e, "widget lookup failed before upgrade");
            return (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response();
        }
    }
    ws.on_upgrade(move |socket| handle_socket(socket, widget_id, state))
        .into_response()
}

async fn handle_socket(socket: WebSocket, widget_id: String, state: AppState) {
    let dispatcher = state.dispatcher;
    let (tx, mut rx) = mpsc::channel::<String>(state.send_queue);
    let connection_id = match dispatcher.attach(&widget_id, tx).await {
        Ok(id) => id,
        Err(e) => {
            warn!(%widget_id, error = %e, "attach failed, closing socket");
            return;
        }
    };

    let (mut ws_tx, mut ws_rx) = socket.split();

    let writer_conn = connection_id.clone();
    let writer = tokio::spawn(async move {
        let mut ping = tokio::time::interval(PING_INTERVAL);
        ping.tick().await;
        loop {
            tokio::select! {
                frame = rx.recv() => match frame {
                    Some(text) => {
                        if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                _ = ping.tick() => {
                    if ws_tx.send(WsMessage::Ping(Default::default())).await.is_err() {
                        break;
                    }
                    debug!(connection_id = %writer_conn, "sent ping");
                }
            }
        }
    });

    let reader_conn = connection_id.clone();
    let reader_dispatcher = dispatcher.clone();
    let reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                WsMessage::Text(text) => {
                    handle_frame(&reader_dispatcher, &reader_conn, text.as_str()).await
                }
                WsMessage::Close(_) => break,
                _ => {}
            }
        }
    });

    first_to_finish(writer, reader).await;

    dispatcher.detach(&connection_id).await;
    info!(%connection_id, %widget_id, "socket closed");
}

/// Wait for either task, then abort the other.
async fn first_to_finish(a: JoinHandle<()>, b: JoinHandle<()>) {
    let (abort_a, abort_b) = (a.abort_handle(), b.abort_handle());
    tokio::select! {
        _ = a => {},
        _ = b => {},
    }
    abort_a.abort();
    abort_b.abort();
}

async fn handle_frame(dispatcher: &Dispatcher, connection_id: &str, text: &str) {
    let frame = match ClientFrame::parse(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(%connection_id, error = %e, "ignoring malformed frame");
            return;
        }
    };
    if let Err(e) = dispatcher
        .handle_inbound(connection_id, &frame.event_type, frame.data)
        .await
    {
        warn!(%connection_id, event_type = %frame.event_type, error = %e, "inbound event failed");
    }
}
