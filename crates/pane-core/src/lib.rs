//! pane-core — configuration and identifiers shared by every pane crate.
//!
//! The configuration surface is loaded once at process start (file, then
//! `PANE_*` environment overrides, then CLI flags in `paned`) and handed to
//! `pane-state`, which never reads the environment itself.

pub mod config;
pub mod ids;

pub use config::{BackendKind, ConfigError, LogFormat, PaneConfig, ServerConfig, StateConfig};
pub use ids::{new_connection_id, new_event_id, new_handle_id, new_widget_id, WorkerId};
