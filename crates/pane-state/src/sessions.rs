//! SessionStore — authenticated user sessions and their token material.
//!
//! Session reads sit on the hot path of every authenticated request, so
//! both implementations look sessions up by id in O(1).
//!
//! Updates are field-level merges. The shared implementation stores each
//! session as a hash (`session:{id}`) and writes only the fields a
//! [`SessionPatch`] carries, so two workers refreshing the same session's
//! token at once resolve last-write-wins on the token while `roles` is
//! never rewritten.
//!
//! The per-user index (`user-sessions:{user}`) carries no TTL of its own:
//! sessions in it have different lifetimes, so any single expiry would drop
//! live members. Expired ids are pruned when the index is read.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::keys::KeySpace;
use crate::substrate::{SharedStore, WriteMode};
use crate::types::{epoch_secs, SessionId, SessionPatch, SessionToken, UserSession};

/// Session lifecycle operations.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Store a new session. Fails with `AlreadyExists` if the id is live.
    async fn create(&self, session: UserSession) -> StateResult<()>;

    /// Current session, or `NotFound` (including after expiry).
    async fn get(&self, session_id: &str) -> StateResult<UserSession>;

    /// Merge the supplied fields and return the updated session.
    async fn update(&self, session_id: &str, patch: SessionPatch) -> StateResult<UserSession>;

    /// Remove a session. Idempotent; returns whether it existed.
    async fn delete(&self, session_id: &str) -> StateResult<bool>;

    /// Live sessions of one user.
    async fn list_user_sessions(&self, user_id: &str) -> StateResult<Vec<UserSession>>;

    /// Drop expired sessions. Returns how many were removed.
    async fn purge_expired(&self) -> StateResult<usize>;
}

fn not_found(session_id: &str) -> StateError {
    StateError::NotFound(format!("session {session_id}"))
}

fn apply_default_ttl(session: &mut UserSession, default_ttl: Duration) {
    if session.expires_at == 0 {
        session.expires_at = epoch_secs() + default_ttl.as_secs();
    }
}

// ── Memory ─────────────────────────────────────────────────────────

/// Single-process session store.
pub struct MemorySessionStore {
    sessions: DashMap<SessionId, UserSession>,
    default_ttl: Duration,
}

impl MemorySessionStore {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            default_ttl,
        }
    }

    fn evict(&self, session_id: &str) {
        let now = epoch_secs();
        if self
            .sessions
            .remove_if(session_id, |_, s| s.is_expired_at(now))
            .is_some()
        {
            debug!(%session_id, "session expired");
        }
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create(&self, mut session: UserSession) -> StateResult<()> {
        apply_default_ttl(&mut session, self.default_ttl);
        let now = epoch_secs();
        let session_id = session.session_id.clone();
        let fingerprint = session.token_fingerprint();
        match self.sessions.entry(session_id.clone()) {
            Entry::Occupied(mut occupied) if occupied.get().is_expired_at(now) => {
                occupied.insert(session);
            }
            Entry::Occupied(_) => {
                return Err(StateError::AlreadyExists(format!("session {session_id}")));
            }
            Entry::Vacant(vacant) => {
                vacant.insert(session);
            }
        }
        debug!(%session_id, token = %fingerprint, "session created");
        Ok(())
    }

    async fn get(&self, session_id: &str) -> StateResult<UserSession> {
        let now = epoch_secs();
        let expired = match self.sessions.get(session_id) {
            Some(s) if !s.is_expired_at(now) => return Ok(s.value().clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.evict(session_id);
        }
        Err(not_found(session_id))
    }

    async fn update(&self, session_id: &str, patch: SessionPatch) -> StateResult<UserSession> {
        let now = epoch_secs();
        let expired = match self.sessions.get_mut(session_id) {
            Some(mut s) if !s.is_expired_at(now) => {
                patch.apply(&mut s);
                debug!(%session_id, token = %s.token_fingerprint(), "session updated");
                return Ok(s.value().clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            self.evict(session_id);
        }
        Err(not_found(session_id))
    }

    async fn delete(&self, session_id: &str) -> StateResult<bool> {
        let now = epoch_secs();
        let existed = self
            .sessions
            .remove(session_id)
            .is_some_and(|(_, s)| !s.is_expired_at(now));
        debug!(%session_id, existed, "session deleted");
        Ok(existed)
    }

    async fn list_user_sessions(&self, user_id: &str) -> StateResult<Vec<UserSession>> {
        let now = epoch_secs();
        let mut sessions: Vec<UserSession> = self
            .sessions
            .iter()
            .filter(|s| s.user_id == user_id && !s.is_expired_at(now))
            .map(|s| s.value().clone())
            .collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(sessions)
    }

    async fn purge_expired(&self) -> StateResult<usize> {
        let now = epoch_secs();
        let mut removed = 0;
        self.sessions.retain(|_, s| {
            let keep = !s.is_expired_at(now);
            if !keep {
                removed += 1;
            }
            keep
        });
        if removed > 0 {
            debug!(removed, "purged expired sessions");
        }
        Ok(removed)
    }
}

// ── Shared ─────────────────────────────────────────────────────────

const F_SESSION_ID: &str = "session_id";
const F_USER_ID: &str = "user_id";
const F_ROLES: &str = "roles";
const F_ACCESS_TOKEN: &str = "access_token";
const F_REFRESH_TOKEN: &str = "refresh_token";
const F_TOKEN_TYPE: &str = "token_type";
const F_CREATED_AT: &str = "created_at";
const F_EXPIRES_AT: &str = "expires_at";
const META_PREFIX: &str = "meta.";

/// Session store on the shared coordination substrate.
pub struct SharedSessionStore {
    store: Arc<dyn SharedStore>,
    keys: KeySpace,
    default_ttl: Duration,
}

impl SharedSessionStore {
    pub fn new(store: Arc<dyn SharedStore>, keys: KeySpace, default_ttl: Duration) -> Self {
        Self {
            store,
            keys,
            default_ttl,
        }
    }

    async fn read(&self, session_id: &str) -> StateResult<Option<UserSession>> {
        let fields = self.store.hash_get_all(&self.keys.session(session_id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        let session = decode_session(fields)?;
        // Guards against clock skew between workers and the store.
        if session.is_expired() {
            return Ok(None);
        }
        Ok(Some(session))
    }
}

fn encode_session(session: &UserSession) -> StateResult<Vec<(String, String)>> {
    let roles =
        serde_json::to_string(&session.roles).map_err(|e| StateError::Serialize(e.to_string()))?;
    let mut fields = vec![
        (F_SESSION_ID.to_string(), session.session_id.clone()),
        (F_USER_ID.to_string(), session.user_id.clone()),
        (F_ROLES.to_string(), roles),
        (F_ACCESS_TOKEN.to_string(), session.token.access_token.clone()),
        (F_TOKEN_TYPE.to_string(), session.token.token_type.clone()),
        (F_CREATED_AT.to_string(), session.created_at.to_string()),
        (F_EXPIRES_AT.to_string(), session.expires_at.to_string()),
    ];
    if let Some(refresh) = &session.token.refresh_token {
        fields.push((F_REFRESH_TOKEN.to_string(), refresh.clone()));
    }
    for (key, value) in &session.metadata {
        fields.push((format!("{META_PREFIX}{key}"), value.clone()));
    }
    Ok(fields)
}

fn encode_patch(patch: &SessionPatch) -> StateResult<Vec<(String, String)>> {
    let mut fields = Vec::new();
    if let Some(roles) = &patch.roles {
        let roles =
            serde_json::to_string(roles).map_err(|e| StateError::Serialize(e.to_string()))?;
        fields.push((F_ROLES.to_string(), roles));
    }
    if let Some(access) = &patch.access_token {
        fields.push((F_ACCESS_TOKEN.to_string(), access.clone()));
    }
    if let Some(refresh) = &patch.refresh_token {
        fields.push((F_REFRESH_TOKEN.to_string(), refresh.clone()));
    }
    if let Some(expires_at) = patch.expires_at {
        fields.push((F_EXPIRES_AT.to_string(), expires_at.to_string()));
    }
    for (key, value) in &patch.metadata {
        fields.push((format!("{META_PREFIX}{key}"), value.clone()));
    }
    Ok(fields)
}

fn decode_session(mut fields: HashMap<String, String>) -> StateResult<UserSession> {
    fn take(fields: &mut HashMap<String, String>, name: &str) -> StateResult<String> {
        fields
            .remove(name)
            .ok_or_else(|| StateError::Deserialize(format!("session hash missing {name}")))
    }
    fn number(value: String, name: &str) -> StateResult<u64> {
        value
            .parse()
            .map_err(|_| StateError::Deserialize(format!("session field {name} is not a number")))
    }

    let roles: Vec<String> = serde_json::from_str(&take(&mut fields, F_ROLES)?)
        .map_err(|e| StateError::Deserialize(e.to_string()))?;
    let session_id = take(&mut fields, F_SESSION_ID)?;
    let user_id = take(&mut fields, F_USER_ID)?;
    let access_token = take(&mut fields, F_ACCESS_TOKEN)?;
    let token_type = fields
        .remove(F_TOKEN_TYPE)
        .unwrap_or_else(|| "bearer".to_string());
    let refresh_token = fields.remove(F_REFRESH_TOKEN);
    let created_at = number(take(&mut fields, F_CREATED_AT)?, F_CREATED_AT)?;
    let expires_at = number(take(&mut fields, F_EXPIRES_AT)?, F_EXPIRES_AT)?;
    let metadata = fields
        .into_iter()
        .filter_map(|(k, v)| k.strip_prefix(META_PREFIX).map(|k| (k.to_string(), v)))
        .collect();

    Ok(UserSession {
        session_id,
        user_id,
        roles,
        token: SessionToken {
            access_token,
            refresh_token,
            token_type,
        },
        created_at,
        expires_at,
        metadata,
    })
}

#[async_trait]
impl SessionStore for SharedSessionStore {
    async fn create(&self, mut session: UserSession) -> StateResult<()> {
        apply_default_ttl(&mut session, self.default_ttl);
        let key = self.keys.session(&session.session_id);
        let fields = encode_session(&session)?;
        let created = self
            .store
            .hash_set(&key, &fields, WriteMode::IfAbsent, Some(session.expires_at))
            .await?;
        if !created {
            return Err(StateError::AlreadyExists(format!(
                "session {}",
                session.session_id
            )));
        }
        self.store
            .set_add(
                &self.keys.user_sessions(&session.user_id),
                &session.session_id,
                None,
            )
            .await?;
        debug!(
            session_id = %session.session_id,
            user_id = %session.user_id,
            token = %session.token_fingerprint(),
            "session created"
        );
        Ok(())
    }

    async fn get(&self, session_id: &str) -> StateResult<UserSession> {
        self.read(session_id)
            .await?
            .ok_or_else(|| not_found(session_id))
    }

    async fn update(&self, session_id: &str, patch: SessionPatch) -> StateResult<UserSession> {
        if !patch.is_empty() {
            let fields = encode_patch(&patch)?;
            let written = self
                .store
                .hash_set(
                    &self.keys.session(session_id),
                    &fields,
                    WriteMode::IfPresent,
                    patch.expires_at,
                )
                .await?;
            if !written {
                return Err(not_found(session_id));
            }
        }
        let session = self.get(session_id).await?;
        debug!(%session_id, token = %session.token_fingerprint(), "session updated");
        Ok(session)
    }

    async fn delete(&self, session_id: &str) -> StateResult<bool> {
        let key = self.keys.session(session_id);
        let fields = self.store.hash_get_all(&key).await?;
        if let Some(user_id) = fields.get(F_USER_ID) {
            self.store
                .set_remove(&self.keys.user_sessions(user_id), &[session_id.to_string()])
                .await?;
        }
        let existed = self.store.delete(&key).await?;
        debug!(%session_id, existed, "session deleted");
        Ok(existed)
    }

    async fn list_user_sessions(&self, user_id: &str) -> StateResult<Vec<UserSession>> {
        let index = self.keys.user_sessions(user_id);
        let mut sessions = Vec::new();
        let mut stale = Vec::new();
        for session_id in self.store.set_members(&index).await? {
            match self.read(&session_id).await? {
                Some(session) => sessions.push(session),
                None => stale.push(session_id),
            }
        }
        if !stale.is_empty() {
            debug!(%user_id, count = stale.len(), "pruning expired session index entries");
            self.store.set_remove(&index, &stale).await?;
        }
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(sessions)
    }

    async fn purge_expired(&self) -> StateResult<usize> {
        Ok(0)
    }
}
