//! Key and channel layout in the shared coordination store.
//!
//! Every name is `{prefix}{namespace}:{id}`. The prefix isolates several
//! deployments (or test runs) sharing one store.

/// Builds namespaced keys for one deployment.
#[derive(Debug, Clone)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Widget record (JSON string).
    pub fn widget(&self, widget_id: &str) -> String {
        format!("{}widget:{widget_id}", self.prefix)
    }

    /// Prefix shared by every widget key, used by `list`.
    pub fn widget_prefix(&self) -> String {
        format!("{}widget:", self.prefix)
    }

    /// Session record (hash).
    pub fn session(&self, session_id: &str) -> String {
        format!("{}session:{session_id}", self.prefix)
    }

    /// Set of session ids belonging to a user.
    pub fn user_sessions(&self, user_id: &str) -> String {
        format!("{}user-sessions:{user_id}", self.prefix)
    }

    /// Set of `worker_id|connection_id` members serving a widget.
    pub fn routes(&self, widget_id: &str) -> String {
        format!("{}routes:{widget_id}", self.prefix)
    }

    /// Liveness record of a single connection (JSON string, short TTL).
    pub fn route(&self, connection_id: &str) -> String {
        format!("{}route:{connection_id}", self.prefix)
    }

    /// Hash of `event_type → binding` for a widget.
    pub fn callbacks(&self, widget_id: &str) -> String {
        format!("{}callbacks:{widget_id}", self.prefix)
    }

    /// Publish/subscribe channel for a widget's events.
    pub fn events(&self, widget_id: &str) -> String {
        format!("{}events:{widget_id}", self.prefix)
    }

    /// Pattern matching every widget channel.
    pub fn events_pattern(&self) -> String {
        format!("{}events:*", self.prefix)
    }
}
