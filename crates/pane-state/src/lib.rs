//! pane-state — shared state and event coordination for pane workers.
//!
//! Several worker processes serve the same widgets. This crate gives each
//! of them one consistent view of widget content, sessions, socket
//! ownership, and callback ownership, plus an event bus to reach whichever
//! worker holds a client's socket.
//!
//! # Architecture
//!
//! Every store is a trait with a memory and a shared implementation. The
//! shared implementations are written against [`SharedStore`], a small
//! key/value + hash + set + pub/sub capability set provided by Redis in
//! production and by [`LoopbackStore`] in tests. [`ServerStateManager`]
//! picks the backend once at startup and hands out the stores.

pub mod backend;
pub mod bus;
pub mod callbacks;
pub mod dispatch;
pub mod error;
pub mod keys;
pub mod maintenance;
pub mod manager;
pub mod routes;
pub mod sessions;
pub mod substrate;
pub mod types;
pub mod widgets;

pub use backend::{select_backend, StoreSet};
pub use bus::{handler, EventBus, EventHandler, Subscription};
pub use callbacks::{callback, Callback, CallbackRegistry, Resolution};
pub use dispatch::Dispatcher;
pub use error::{StateError, StateResult};
pub use keys::KeySpace;
pub use maintenance::BackgroundTasks;
pub use manager::ServerStateManager;
pub use routes::ConnectionRouter;
pub use sessions::SessionStore;
pub use substrate::{LoopbackStore, RedisStore, SharedStore};
pub use types::*;
pub use widgets::WidgetStore;
