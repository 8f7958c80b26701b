//! Error types for the pane state layer.

use thiserror::Error;

/// Result type alias for state operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors surfaced by stores, the router, the bus, and the manager.
///
/// Everything except `Config` and `BackendUnavailable` at startup is
/// recoverable; callers decide whether to retry, regenerate ids, or degrade.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("backend timed out after {0:?}")]
    BackendTimeout(std::time::Duration),

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("event bus unavailable: {0}")]
    BusUnavailable(String),

    #[error("stale route: {0}")]
    StaleRoute(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),
}

impl StateError {
    /// Whether the error means the shared backend could not be reached in time.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            StateError::BackendTimeout(_)
                | StateError::BackendUnavailable(_)
                | StateError::BusUnavailable(_)
        )
    }
}

impl From<pane_core::ConfigError> for StateError {
    fn from(e: pane_core::ConfigError) -> Self {
        StateError::Config(e.to_string())
    }
}
