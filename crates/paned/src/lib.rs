//! paned — the pane worker daemon.
//!
//! Serves widget sockets and a small admin API on top of `pane-state`.
//!
//! # Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/healthz` | Backend kind, worker id, backend reachability |
//! | GET | `/api/v1/widgets` | List widget ids |
//! | POST | `/api/v1/widgets` | Create a widget |
//! | GET | `/api/v1/widgets/{id}` | Get a widget |
//! | DELETE | `/api/v1/widgets/{id}` | Delete a widget and its callbacks |
//! | GET | `/ws/{widget_id}` | Client WebSocket for one widget |

pub mod api;
pub mod ws;

use axum::Router;
use axum::routing::get;
use pane_state::Dispatcher;

/// Shared state for every handler.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Dispatcher,
    /// Capacity of each socket's outbound queue.
    pub send_queue: usize,
}

/// Build the complete daemon router.
pub fn build_router(dispatcher: Dispatcher, send_queue: usize) -> Router {
    let state = AppState {
        dispatcher,
        send_queue,
    };

    let api_routes = Router::new()
        .route("/widgets", get(api::list_widgets).post(api::create_widget))
        .route(
            "/widgets/{id}",
            get(api::get_widget).delete(api::delete_widget),
        )
        .with_state(state.clone());

    Router::new()
        .route("/healthz", get(api::healthz))
        .route("/ws/{widget_id}", get(ws::ws_handler))
        .with_state(state)
        .nest("/api/v1", api_routes)
}
