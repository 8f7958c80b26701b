//! Coordination substrate — the capability set the shared-external
//! implementations are written against.
//!
//! A substrate is any external key-value store with per-key expiry, hashes,
//! sets, and publish/subscribe. `RedisStore` is the production
//! implementation; `LoopbackStore` keeps the same semantics in-process so
//! several workers can be simulated against one store in tests.

pub mod loopback;
pub mod redis;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{StateError, StateResult};

pub use self::loopback::LoopbackStore;
pub use self::redis::RedisStore;

/// Conditional write behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Always,
    /// Write only if the key does not exist.
    IfAbsent,
    /// Write only if the key already exists.
    IfPresent,
}

/// A message received on a subscribed channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelMessage {
    pub channel: String,
    pub payload: String,
}

/// Receiving end of a channel subscription.
///
/// Dropping the inbox ends the subscription.
pub struct Inbox {
    rx: mpsc::UnboundedReceiver<ChannelMessage>,
    forwarder: Option<JoinHandle<()>>,
}

impl Inbox {
    pub(crate) fn new(
        rx: mpsc::UnboundedReceiver<ChannelMessage>,
        forwarder: Option<JoinHandle<()>>,
    ) -> Self {
        Self { rx, forwarder }
    }

    /// Next message, or `None` once the underlying subscription is gone.
    pub async fn recv(&mut self) -> Option<ChannelMessage> {
        self.rx.recv().await
    }
}

impl Drop for Inbox {
    fn drop(&mut self) {
        if let Some(handle) = self.forwarder.take() {
            handle.abort();
        }
    }
}

/// Operations every shared coordination store provides.
///
/// Missing keys are not errors: reads return `None`/empty and conditional
/// writes return `false`. Implementations bound every call by their
/// configured operation timeout.
#[async_trait]
pub trait SharedStore: Send + Sync + 'static {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    async fn ping(&self) -> StateResult<()>;

    async fn get(&self, key: &str) -> StateResult<Option<String>>;

    async fn get_many(&self, keys: &[String]) -> StateResult<Vec<Option<String>>>;

    /// Write a string value. Returns whether the write happened.
    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
        mode: WriteMode,
    ) -> StateResult<bool>;

    /// Returns whether the key existed.
    async fn delete(&self, key: &str) -> StateResult<bool>;

    /// Refresh expiry. Returns `false` if the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> StateResult<bool>;

    /// All keys starting with `prefix`.
    async fn scan_prefix(&self, prefix: &str) -> StateResult<Vec<String>>;

    /// All fields of a hash; empty when the key is absent.
    async fn hash_get_all(&self, key: &str) -> StateResult<HashMap<String, String>>;

    /// Write hash fields atomically, leaving other fields untouched.
    ///
    /// `expire_at` is an absolute unix timestamp in seconds.
    async fn hash_set(
        &self,
        key: &str,
        fields: &[(String, String)],
        mode: WriteMode,
        expire_at: Option<u64>,
    ) -> StateResult<bool>;

    /// Add a member and (re)arm the set's expiry.
    async fn set_add(&self, key: &str, member: &str, ttl: Option<Duration>) -> StateResult<()>;

    /// Returns how many members were removed.
    async fn set_remove(&self, key: &str, members: &[String]) -> StateResult<u64>;

    async fn set_members(&self, key: &str) -> StateResult<Vec<String>>;

    /// Returns the number of subscribers that received the message.
    async fn publish(&self, channel: &str, payload: &str) -> StateResult<u64>;

    async fn subscribe(&self, channel: &str) -> StateResult<Inbox>;

    /// Subscribe to every channel matching a trailing-`*` pattern.
    async fn psubscribe(&self, pattern: &str) -> StateResult<Inbox>;
}

/// Open the substrate named by `url`.
pub async fn connect(
    url: &str,
    connect_timeout: Duration,
    op_timeout: Duration,
) -> StateResult<Arc<dyn SharedStore>> {
    let scheme = url.split_once("://").map(|(s, _)| s).unwrap_or_default();
    match scheme {
        "redis" | "rediss" | "redis+unix" => {
            let store = RedisStore::connect(url, connect_timeout, op_timeout).await?;
            Ok(Arc::new(store))
        }
        _ => Err(StateError::Config(format!(
            "unsupported backend url scheme {scheme:?}"
        ))),
    }
}

/// Run `fut`, mapping an elapsed deadline to `BackendTimeout`.
pub(crate) async fn bounded<T, F>(timeout: Duration, fut: F) -> StateResult<T>
where
    F: Future<Output = StateResult<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(StateError::BackendTimeout(timeout)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_scheme_is_config_error() {
        let err = connect(
            "etcd://localhost:2379",
            Duration::from_millis(10),
            Duration::from_millis(10),
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err, StateError::Config(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_reports_timeout() {
        let err = bounded(Duration::from_millis(50), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, StateError>(())
        })
        .await
        .unwrap_err();
        assert!(matches!(err, StateError::BackendTimeout(_)));
    }
}
