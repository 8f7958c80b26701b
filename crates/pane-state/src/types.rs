//! Domain types for the pane state layer.
//!
//! Widgets, sessions, routes and callback bindings are persisted (JSON
//! strings or hash fields in the shared store, plain structs in memory).
//! `EventMessage` is transient: it is published and consumed, never stored.

use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Opaque widget identifier, unique across every worker sharing a backend.
pub type WidgetId = String;

/// Identifier of one live client socket.
pub type ConnectionId = String;

/// Identifier of an authenticated session.
pub type SessionId = String;

// ── Widget ─────────────────────────────────────────────────────────

/// Everything needed to render a widget.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WidgetData {
    pub widget_id: WidgetId,
    /// Content markup.
    pub html: String,
    /// Structural config (toolbars, layout) as free JSON.
    #[serde(default)]
    pub structure: Value,
    /// Free-form configuration map.
    #[serde(default)]
    pub config: BTreeMap<String, Value>,
    /// Unix timestamp (seconds) when the widget was created.
    pub created_at: u64,
    /// Unix timestamp (seconds) of the last update or touch.
    pub updated_at: u64,
    /// Inactivity TTL. `None` keeps the widget until deleted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_secs: Option<u64>,
    /// Worker that created the widget.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_worker_id: Option<String>,
}

impl WidgetData {
    pub fn new(widget_id: impl Into<String>, html: impl Into<String>) -> Self {
        let now = epoch_secs();
        Self {
            widget_id: widget_id.into(),
            html: html.into(),
            structure: Value::Null,
            config: BTreeMap::new(),
            created_at: now,
            updated_at: now,
            ttl_secs: None,
            owner_worker_id: None,
        }
    }

    pub fn with_config(mut self, key: impl Into<String>, value: Value) -> Self {
        self.config.insert(key.into(), value);
        self
    }

    pub fn with_structure(mut self, structure: Value) -> Self {
        self.structure = structure;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl_secs = Some(ttl.as_secs());
        self
    }

    /// Effective TTL; zero is treated as "no expiry".
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

/// Partial update applied by `WidgetStore::update`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WidgetPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structure: Option<Value>,
    /// Merged key by key; a `null` value removes the key.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config: BTreeMap<String, Value>,
    /// New TTL in seconds; `Some(0)` disables expiry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_secs: Option<u64>,
}

impl WidgetPatch {
    pub fn html(html: impl Into<String>) -> Self {
        Self {
            html: Some(html.into()),
            ..Self::default()
        }
    }

    pub fn set_config(mut self, key: impl Into<String>, value: Value) -> Self {
        self.config.insert(key.into(), value);
        self
    }

    pub fn apply(self, widget: &mut WidgetData) {
        if let Some(html) = self.html {
            widget.html = html;
        }
        if let Some(structure) = self.structure {
            widget.structure = structure;
        }
        for (key, value) in self.config {
            if value.is_null() {
                widget.config.remove(&key);
            } else {
                widget.config.insert(key, value);
            }
        }
        if let Some(ttl) = self.ttl_secs {
            widget.ttl_secs = (ttl > 0).then_some(ttl);
        }
        widget.updated_at = epoch_secs();
    }
}

// ── Events ─────────────────────────────────────────────────────────

/// Which way an event travels.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum EventDirection {
    /// Produced server-side, to be pushed down client sockets.
    #[default]
    ToClient,
    /// Produced by a client, to be handled by the callback owner.
    ToServer,
}

/// An event travelling between clients and workers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventMessage {
    pub widget_id: WidgetId,
    /// Namespaced type, `namespace:name`.
    pub event_type: String,
    #[serde(default)]
    pub payload: Value,
    /// Worker that produced the event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_worker: Option<String>,
    #[serde(default)]
    pub direction: EventDirection,
    /// Set by the publisher so consumers can drop exact duplicates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    /// Originating socket for client events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<ConnectionId>,
}

impl EventMessage {
    /// A server-side event destined for client sockets.
    pub fn new(widget_id: impl Into<String>, event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            widget_id: widget_id.into(),
            event_type: event_type.into(),
            payload,
            source_worker: None,
            direction: EventDirection::ToClient,
            event_id: None,
            connection_id: None,
        }
    }

    /// An event raised by a client on `connection_id`.
    pub fn from_client(
        widget_id: impl Into<String>,
        event_type: impl Into<String>,
        payload: Value,
        connection_id: impl Into<String>,
    ) -> Self {
        Self {
            direction: EventDirection::ToServer,
            connection_id: Some(connection_id.into()),
            ..Self::new(widget_id, event_type, payload)
        }
    }

    /// A client-bound event for the same widget.
    pub fn reply(&self, event_type: impl Into<String>, payload: Value) -> Self {
        Self::new(self.widget_id.clone(), event_type, payload)
    }

    pub fn with_source(mut self, worker_id: impl Into<String>) -> Self {
        self.source_worker = Some(worker_id.into());
        self
    }

    pub fn namespace(&self) -> Option<&str> {
        self.event_type.split_once(':').map(|(ns, _)| ns)
    }

    pub fn is_to_client(&self) -> bool {
        self.direction == EventDirection::ToClient
    }
}

/// Whether `event_type` has the `namespace:name` shape.
pub fn is_valid_event_type(event_type: &str) -> bool {
    match event_type.split_once(':') {
        Some((ns, name)) => !ns.is_empty() && !name.is_empty() && !ns.contains('*'),
        None => false,
    }
}

/// Subscription predicate.
///
/// `event_type` accepts `*`, `namespace:*`, or an exact type.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventFilter {
    pub widget_id: Option<WidgetId>,
    pub event_type: Option<String>,
}

impl EventFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn widget(widget_id: impl Into<String>) -> Self {
        Self {
            widget_id: Some(widget_id.into()),
            event_type: None,
        }
    }

    pub fn event_type(mut self, pattern: impl Into<String>) -> Self {
        self.event_type = Some(pattern.into());
        self
    }

    pub fn matches(&self, event: &EventMessage) -> bool {
        if let Some(widget_id) = &self.widget_id {
            if widget_id != &event.widget_id {
                return false;
            }
        }
        match self.event_type.as_deref() {
            None | Some("*") => true,
            Some(pattern) => match pattern.strip_suffix(":*") {
                Some(ns) => event.namespace() == Some(ns),
                None => pattern == event.event_type,
            },
        }
    }
}

// ── Connections ────────────────────────────────────────────────────

/// Ownership record for one live client socket.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionInfo {
    pub connection_id: ConnectionId,
    pub widget_id: WidgetId,
    pub worker_id: String,
    pub connected_at: u64,
    pub last_heartbeat: u64,
}

impl ConnectionInfo {
    pub fn new(
        connection_id: impl Into<String>,
        widget_id: impl Into<String>,
        worker_id: impl Into<String>,
    ) -> Self {
        let now = epoch_secs();
        Self {
            connection_id: connection_id.into(),
            widget_id: widget_id.into(),
            worker_id: worker_id.into(),
            connected_at: now,
            last_heartbeat: now,
        }
    }

    pub fn route(&self) -> RouteEntry {
        RouteEntry {
            worker_id: self.worker_id.clone(),
            connection_id: self.connection_id.clone(),
        }
    }
}

/// One `(worker_id, connection_id)` pair serving a widget.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RouteEntry {
    pub worker_id: String,
    pub connection_id: ConnectionId,
}

// ── Sessions ───────────────────────────────────────────────────────

/// Token material issued by the authentication collaborator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionToken {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default = "default_token_type")]
    pub token_type: String,
}

fn default_token_type() -> String {
    "bearer".to_string()
}

impl SessionToken {
    pub fn bearer(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: None,
            token_type: default_token_type(),
        }
    }
}

/// An authenticated user session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserSession {
    pub session_id: SessionId,
    pub user_id: String,
    #[serde(default)]
    pub roles: Vec<String>,
    pub token: SessionToken,
    pub created_at: u64,
    /// Unix timestamp (seconds) after which the session is gone. Zero means
    /// unset; the store fills in its default lifetime on create.
    #[serde(default)]
    pub expires_at: u64,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl UserSession {
    pub fn new(
        session_id: impl Into<String>,
        user_id: impl Into<String>,
        roles: Vec<String>,
        token: SessionToken,
        ttl: Duration,
    ) -> Self {
        let now = epoch_secs();
        Self {
            session_id: session_id.into(),
            user_id: user_id.into(),
            roles,
            token,
            created_at: now,
            expires_at: now + ttl.as_secs(),
            metadata: BTreeMap::new(),
        }
    }

    /// A session whose lifetime is left to the store's configured default.
    pub fn with_default_ttl(
        session_id: impl Into<String>,
        user_id: impl Into<String>,
        roles: Vec<String>,
        token: SessionToken,
    ) -> Self {
        Self {
            expires_at: 0,
            ..Self::new(session_id, user_id, roles, token, Duration::ZERO)
        }
    }

    pub fn is_expired_at(&self, now: u64) -> bool {
        now >= self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(epoch_secs())
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    /// Time left before expiry, `None` once expired.
    pub fn remaining(&self) -> Option<Duration> {
        let now = epoch_secs();
        (self.expires_at > now).then(|| Duration::from_secs(self.expires_at - now))
    }

    /// Short digest of the access token, safe to log.
    pub fn token_fingerprint(&self) -> String {
        token_fingerprint(&self.token.access_token)
    }
}

pub fn token_fingerprint(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    let mut hex = hex::encode(digest);
    hex.truncate(12);
    hex
}

/// Field-level session update.
///
/// Only the supplied fields are written, so a token refresh never touches
/// `roles` and two concurrent refreshes resolve last-write-wins on the token.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionPatch {
    pub roles: Option<Vec<String>>,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub expires_at: Option<u64>,
    /// Merged key by key.
    pub metadata: BTreeMap<String, String>,
}

impl SessionPatch {
    pub fn token_refresh(
        access_token: impl Into<String>,
        refresh_token: Option<String>,
        expires_at: u64,
    ) -> Self {
        Self {
            access_token: Some(access_token.into()),
            refresh_token,
            expires_at: Some(expires_at),
            ..Self::default()
        }
    }

    pub fn roles(roles: Vec<String>) -> Self {
        Self {
            roles: Some(roles),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.roles.is_none()
            && self.access_token.is_none()
            && self.refresh_token.is_none()
            && self.expires_at.is_none()
            && self.metadata.is_empty()
    }

    pub fn apply(self, session: &mut UserSession) {
        if let Some(roles) = self.roles {
            session.roles = roles;
        }
        if let Some(access) = self.access_token {
            session.token.access_token = access;
        }
        if let Some(refresh) = self.refresh_token {
            session.token.refresh_token = Some(refresh);
        }
        if let Some(expires_at) = self.expires_at {
            session.expires_at = expires_at;
        }
        session.metadata.extend(self.metadata);
    }
}

// ── Callbacks ──────────────────────────────────────────────────────

/// Shared record of who owns a callback.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CallbackBinding {
    pub widget_id: WidgetId,
    pub event_type: String,
    pub worker_id: String,
    /// Key into the owning worker's local callable table.
    pub handle_id: String,
    pub registered_at: u64,
}

pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn patch_merges_config_and_removes_nulls() {
        let mut widget = WidgetData::new("w1", "<p>a</p>")
            .with_config("theme", json!("dark"))
            .with_config("height", json!(400));

        WidgetPatch::html("<p>b</p>")
            .set_config("theme", Value::Null)
            .set_config("width", json!(600))
            .apply(&mut widget);

        assert_eq!(widget.html, "<p>b</p>");
        assert!(!widget.config.contains_key("theme"));
        assert_eq!(widget.config["height"], json!(400));
        assert_eq!(widget.config["width"], json!(600));
    }

    #[test]
    fn zero_ttl_means_no_expiry() {
        let mut widget = WidgetData::new("w1", "").with_ttl(Duration::from_secs(30));
        assert_eq!(widget.ttl(), Some(Duration::from_secs(30)));

        WidgetPatch {
            ttl_secs: Some(0),
            ..WidgetPatch::default()
        }
        .apply(&mut widget);
        assert_eq!(widget.ttl(), None);
    }

    #[test]
    fn filter_patterns() {
        let click = EventMessage::new("w1", "plotly:click", json!({}));
        assert!(EventFilter::all().matches(&click));
        assert!(EventFilter::widget("w1").matches(&click));
        assert!(!EventFilter::widget("w2").matches(&click));
        assert!(EventFilter::widget("w1").event_type("plotly:*").matches(&click));
        assert!(EventFilter::all().event_type("plotly:click").matches(&click));
        assert!(!EventFilter::all().event_type("grid:*").matches(&click));
        assert!(!EventFilter::all().event_type("plotly:hover").matches(&click));
    }

    #[test]
    fn event_type_shape() {
        assert!(is_valid_event_type("app:ping"));
        assert!(is_valid_event_type("pane:set-content"));
        assert!(!is_valid_event_type("ping"));
        assert!(!is_valid_event_type(":ping"));
        assert!(!is_valid_event_type("app:"));
    }

    #[test]
    fn event_wire_defaults() {
        let event: EventMessage =
            serde_json::from_str(r#"{"widget_id":"w1","event_type":"app:ping"}"#).unwrap();
        assert_eq!(event.direction, EventDirection::ToClient);
        assert_eq!(event.payload, Value::Null);
        assert!(event.source_worker.is_none());
    }

    #[test]
    fn token_refresh_patch_keeps_roles() {
        let mut session = UserSession::new(
            "s1",
            "alice",
            vec!["admin".into()],
            SessionToken::bearer("old"),
            Duration::from_secs(60),
        );
        SessionPatch::token_refresh("new", Some("r2".into()), session.expires_at + 60)
            .apply(&mut session);
        assert_eq!(session.token.access_token, "new");
        assert_eq!(session.token.refresh_token.as_deref(), Some("r2"));
        assert!(session.has_role("admin"));
    }

    #[test]
    fn fingerprint_is_stable_and_short() {
        let a = token_fingerprint("secret-token");
        assert_eq!(a.len(), 12);
        assert_eq!(a, token_fingerprint("secret-token"));
        assert_ne!(a, token_fingerprint("other-token"));
    }

    #[test]
    fn session_expiry() {
        let session = UserSession::new(
            "s1",
            "bob",
            vec![],
            SessionToken::bearer("t"),
            Duration::from_secs(60),
        );
        assert!(!session.is_expired());
        assert!(session.is_expired_at(session.expires_at));
        assert!(session.remaining().is_some());
    }
}
