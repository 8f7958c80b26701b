//! In-process coordination substrate.
//!
//! Mirrors the Redis semantics the shared stores rely on (per-key expiry,
//! conditional writes, hashes, sets, channel and pattern subscriptions)
//! behind one mutex. Cloning a `LoopbackStore` shares the same data, so two
//! `ServerStateManager`s built on clones behave like two workers on one
//! external store.
//!
//! Expiry uses `tokio::time::Instant`, so tests running with paused time can
//! advance past TTLs deterministically.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::{ChannelMessage, Inbox, SharedStore, WriteMode};
use crate::error::{StateError, StateResult};
use crate::types::epoch_secs;

enum Value {
    Str(String),
    Hash(HashMap<String, String>),
    Set(BTreeSet<String>),
}

struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

enum Topic {
    Channel(String),
    Prefix(String),
}

impl Topic {
    fn matches(&self, channel: &str) -> bool {
        match self {
            Topic::Channel(name) => name == channel,
            Topic::Prefix(prefix) => channel.starts_with(prefix.as_str()),
        }
    }
}

struct Subscriber {
    topic: Topic,
    tx: mpsc::UnboundedSender<ChannelMessage>,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    subscribers: Vec<Subscriber>,
}

impl Inner {
    /// Live entry for `key`, dropping it first if it has expired.
    fn live(&mut self, key: &str) -> Option<&mut Entry> {
        let now = Instant::now();
        if self.entries.get(key).is_some_and(|e| e.is_expired(now)) {
            self.entries.remove(key);
        }
        self.entries.get_mut(key)
    }
}

/// Shared in-process store. Clones share state.
#[derive(Clone, Default)]
pub struct LoopbackStore {
    inner: Arc<Mutex<Inner>>,
    offline: Arc<AtomicBool>,
}

impl LoopbackStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the store becoming unreachable (or reachable again).
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        inner.entries.retain(|_, e| !e.is_expired(now));
        inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_online(&self) -> StateResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            Err(StateError::BackendUnavailable(
                "loopback store offline".to_string(),
            ))
        } else {
            Ok(())
        }
    }

    fn open_inbox(&self, topic: Topic) -> StateResult<Inbox> {
        self.check_online()?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().subscribers.push(Subscriber { topic, tx });
        Ok(Inbox::new(rx, None))
    }
}

fn wrong_type(key: &str) -> StateError {
    StateError::Backend(format!("WRONGTYPE operation against key {key}"))
}

fn instant_at_epoch(expire_at: u64) -> Instant {
    let now = epoch_secs();
    Instant::now() + Duration::from_secs(expire_at.saturating_sub(now))
}

#[async_trait]
impl SharedStore for LoopbackStore {
    fn name(&self) -> &'static str {
        "loopback"
    }

    async fn ping(&self) -> StateResult<()> {
        self.check_online()
    }

    async fn get(&self, key: &str) -> StateResult<Option<String>> {
        self.check_online()?;
        let mut inner = self.inner.lock();
        match inner.live(key) {
            Some(Entry {
                value: Value::Str(s),
                ..
            }) => Ok(Some(s.clone())),
            Some(_) => Err(wrong_type(key)),
            None => Ok(None),
        }
    }

    async fn get_many(&self, keys: &[String]) -> StateResult<Vec<Option<String>>> {
        self.check_online()?;
        let mut inner = self.inner.lock();
        let values = keys
            .iter()
            .map(|key| match inner.live(key) {
                Some(Entry {
                    value: Value::Str(s),
                    ..
                }) => Some(s.clone()),
                _ => None,
            })
            .collect();
        Ok(values)
    }

    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
        mode: WriteMode,
    ) -> StateResult<bool> {
        self.check_online()?;
        let mut inner = self.inner.lock();
        let exists = inner.live(key).is_some();
        match (mode, exists) {
            (WriteMode::IfAbsent, true) | (WriteMode::IfPresent, false) => return Ok(false),
            _ => {}
        }
        inner.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> StateResult<bool> {
        self.check_online()?;
        let mut inner = self.inner.lock();
        let existed = inner.live(key).is_some();
        inner.entries.remove(key);
        Ok(existed)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StateResult<bool> {
        self.check_online()?;
        let mut inner = self.inner.lock();
        match inner.live(key) {
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn scan_prefix(&self, prefix: &str) -> StateResult<Vec<String>> {
        self.check_online()?;
        let mut inner = self.inner.lock();
        let now = Instant::now();
        inner.entries.retain(|_, e| !e.is_expired(now));
        let mut keys: Vec<String> = inner
            .entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn hash_get_all(&self, key: &str) -> StateResult<HashMap<String, String>> {
        self.check_online()?;
        let mut inner = self.inner.lock();
        match inner.live(key) {
            Some(Entry {
                value: Value::Hash(h),
                ..
            }) => Ok(h.clone()),
            Some(_) => Err(wrong_type(key)),
            None => Ok(HashMap::new()),
        }
    }

    async fn hash_set(
        &self,
        key: &str,
        fields: &[(String, String)],
        mode: WriteMode,
        expire_at: Option<u64>,
    ) -> StateResult<bool> {
        self.check_online()?;
        let mut inner = self.inner.lock();
        let exists = inner.live(key).is_some();
        match (mode, exists) {
            (WriteMode::IfAbsent, true) | (WriteMode::IfPresent, false) => return Ok(false),
            _ => {}
        }
        let entry = inner.entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::Hash(HashMap::new()),
            expires_at: None,
        });
        let Value::Hash(hash) = &mut entry.value else {
            return Err(wrong_type(key));
        };
        for (field, value) in fields {
            hash.insert(field.clone(), value.clone());
        }
        if let Some(at) = expire_at.filter(|at| *at > 0) {
            entry.expires_at = Some(instant_at_epoch(at));
        }
        Ok(true)
    }

    async fn set_add(&self, key: &str, member: &str, ttl: Option<Duration>) -> StateResult<()> {
        self.check_online()?;
        let mut inner = self.inner.lock();
        inner.live(key);
        let entry = inner.entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::Set(BTreeSet::new()),
            expires_at: None,
        });
        let Value::Set(set) = &mut entry.value else {
            return Err(wrong_type(key));
        };
        set.insert(member.to_string());
        if let Some(ttl) = ttl {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn set_remove(&self, key: &str, members: &[String]) -> StateResult<u64> {
        self.check_online()?;
        let mut inner = self.inner.lock();
        let (removed, now_empty) = match inner.live(key) {
            Some(Entry {
                value: Value::Set(set),
                ..
            }) => {
                let removed = members.iter().filter(|m| set.remove(m.as_str())).count();
                (removed as u64, set.is_empty())
            }
            Some(_) => return Err(wrong_type(key)),
            None => (0, false),
        };
        // Redis deletes a set once its last member is gone.
        if now_empty {
            inner.entries.remove(key);
        }
        Ok(removed)
    }

    async fn set_members(&self, key: &str) -> StateResult<Vec<String>> {
        self.check_online()?;
        let mut inner = self.inner.lock();
        match inner.live(key) {
            Some(Entry {
                value: Value::Set(set),
                ..
            }) => Ok(set.iter().cloned().collect()),
            Some(_) => Err(wrong_type(key)),
            None => Ok(Vec::new()),
        }
    }

    async fn publish(&self, channel: &str, payload: &str) -> StateResult<u64> {
        self.check_online()?;
        let mut inner = self.inner.lock();
        inner.subscribers.retain(|s| !s.tx.is_closed());
        let mut delivered = 0;
        for sub in inner.subscribers.iter().filter(|s| s.topic.matches(channel)) {
            let message = ChannelMessage {
                channel: channel.to_string(),
                payload: payload.to_string(),
            };
            if sub.tx.send(message).is_ok() {
                delivered += 1;
            }
        }
        Ok(delivered)
    }

    async fn subscribe(&self, channel: &str) -> StateResult<Inbox> {
        self.open_inbox(Topic::Channel(channel.to_string()))
    }

    async fn psubscribe(&self, pattern: &str) -> StateResult<Inbox> {
        match pattern.strip_suffix('*') {
            Some(prefix) if !prefix.contains(['*', '?', '[']) => {
                self.open_inbox(Topic::Prefix(prefix.to_string()))
            }
            _ => Err(StateError::Backend(format!(
                "unsupported subscription pattern {pattern:?}"
            ))),
        }
    }
}
