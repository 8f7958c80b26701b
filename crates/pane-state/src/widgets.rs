//! WidgetStore — the record of what every widget should render.
//!
//! Two implementations share one contract:
//!
//! - [`MemoryWidgetStore`] keeps records in a sharded concurrent map. TTLs are
//!   enforced lazily on every read and by [`WidgetStore::purge_expired`],
//!   which the maintenance task calls on a fixed cadence.
//! - [`SharedWidgetStore`] keeps one JSON string per widget under
//!   `widget:{id}` and maps TTL onto the substrate's native key expiry.
//!
//! Creating a widget does not create routes or callbacks; callers own those.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::keys::KeySpace;
use crate::substrate::{SharedStore, WriteMode};
use crate::types::{WidgetData, WidgetId, WidgetPatch, epoch_secs};

/// Widget lifecycle operations.
#[async_trait]
pub trait WidgetStore: Send + Sync {
    /// Store a new widget. Fails with `AlreadyExists` if the id is live.
    ///
    /// Returns the stored record (with the default TTL applied).
    async fn create(&self, widget: WidgetData) -> StateResult<WidgetData>;

    /// Current record, or `NotFound`.
    async fn get(&self, widget_id: &str) -> StateResult<WidgetData>;

    /// Apply a partial update and refresh the TTL.
    async fn update(&self, widget_id: &str, patch: WidgetPatch) -> StateResult<WidgetData>;

    /// Refresh the TTL without changing content.
    async fn touch(&self, widget_id: &str) -> StateResult<()>;

    /// Remove a widget. Idempotent; returns whether a record existed.
    async fn delete(&self, widget_id: &str) -> StateResult<bool>;

    /// All live widget ids, sorted.
    async fn list(&self) -> StateResult<Vec<WidgetId>>;

    /// Drop expired records. Returns how many were removed.
    async fn purge_expired(&self) -> StateResult<usize>;
}

fn not_found(widget_id: &str) -> StateError {
    StateError::NotFound(format!("widget {widget_id}"))
}

fn apply_default_ttl(widget: &mut WidgetData, default_ttl: Option<Duration>) {
    if widget.ttl_secs.is_none() {
        widget.ttl_secs = default_ttl.map(|t| t.as_secs()).filter(|s| *s > 0);
    }
}

// ── Memory ─────────────────────────────────────────────────────────

struct Slot {
    widget: WidgetData,
    expires_at: Option<Instant>,
}

impl Slot {
    fn new(widget: WidgetData, now: Instant) -> Self {
        let expires_at = widget.ttl().map(|ttl| now + ttl);
        Self { widget, expires_at }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    fn refresh(&mut self, now: Instant) {
        self.expires_at = self.widget.ttl().map(|ttl| now + ttl);
    }
}

/// Single-process widget store.
pub struct MemoryWidgetStore {
    widgets: DashMap<WidgetId, Slot>,
    default_ttl: Option<Duration>,
}

impl MemoryWidgetStore {
    pub fn new(default_ttl: Option<Duration>) -> Self {
        Self {
            widgets: DashMap::new(),
            default_ttl,
        }
    }

    /// Remove `widget_id` if its slot is still expired.
    fn evict(&self, widget_id: &str, now: Instant) {
        if self
            .widgets
            .remove_if(widget_id, |_, slot| slot.is_expired(now))
            .is_some()
        {
            debug!(%widget_id, "widget expired");
        }
    }
}

#[async_trait]
impl WidgetStore for MemoryWidgetStore {
    async fn create(&self, mut widget: WidgetData) -> StateResult<WidgetData> {
        apply_default_ttl(&mut widget, self.default_ttl);
        let now = Instant::now();
        let widget_id = widget.widget_id.clone();

        match self.widgets.entry(widget_id.clone()) {
            Entry::Occupied(mut occupied) if occupied.get().is_expired(now) => {
                occupied.insert(Slot::new(widget.clone(), now));
            }
            Entry::Occupied(_) => {
                return Err(StateError::AlreadyExists(format!("widget {widget_id}")));
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Slot::new(widget.clone(), now));
            }
        }
        debug!(%widget_id, ttl_secs = ?widget.ttl_secs, "widget created");
        Ok(widget)
    }

    async fn get(&self, widget_id: &str) -> StateResult<WidgetData> {
        let now = Instant::now();
        let expired = match self.widgets.get(widget_id) {
            Some(slot) if !slot.is_expired(now) => return Ok(slot.widget.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.evict(widget_id, now);
        }
        Err(not_found(widget_id))
    }

    async fn update(&self, widget_id: &str, patch: WidgetPatch) -> StateResult<WidgetData> {
        let now = Instant::now();
        let expired = match self.widgets.get_mut(widget_id) {
            Some(mut slot) if !slot.is_expired(now) => {
                patch.apply(&mut slot.widget);
                slot.refresh(now);
                debug!(%widget_id, "widget updated");
                return Ok(slot.widget.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            self.evict(widget_id, now);
        }
        Err(not_found(widget_id))
    }

    async fn touch(&self, widget_id: &str) -> StateResult<()> {
        let now = Instant::now();
        let expired = match self.widgets.get_mut(widget_id) {
            Some(mut slot) if !slot.is_expired(now) => {
                slot.widget.updated_at = epoch_secs();
                slot.refresh(now);
                return Ok(());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            self.evict(widget_id, now);
        }
        Err(not_found(widget_id))
    }

    async fn delete(&self, widget_id: &str) -> StateResult<bool> {
        let now = Instant::now();
        let existed = self
            .widgets
            .remove(widget_id)
            .is_some_and(|(_, slot)| !slot.is_expired(now));
        debug!(%widget_id, existed, "widget deleted");
        Ok(existed)
    }

    async fn list(&self) -> StateResult<Vec<WidgetId>> {
        let now = Instant::now();
        let mut ids: Vec<WidgetId> = self
            .widgets
            .iter()
            .filter(|slot| !slot.value().is_expired(now))
            .map(|slot| slot.key().clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn purge_expired(&self) -> StateResult<usize> {
        let now = Instant::now();
        let mut removed = 0;
        self.widgets.retain(|_, slot| {
            let keep = !slot.is_expired(now);
            if !keep {
                removed += 1;
            }
            keep
        });
        if removed > 0 {
            debug!(removed, "purged expired widgets");
        }
        Ok(removed)
    }
}

// ── Shared ─────────────────────────────────────────────────────────

/// Widget store on the shared coordination substrate.
///
/// Concurrent updates from different workers are last-write-wins on the
/// whole record.
pub struct SharedWidgetStore {
    store: Arc<dyn SharedStore>,
    keys: KeySpace,
    default_ttl: Option<Duration>,
}

impl SharedWidgetStore {
    pub fn new(store: Arc<dyn SharedStore>, keys: KeySpace, default_ttl: Option<Duration>) -> Self {
        Self {
            store,
            keys,
            default_ttl,
        }
    }

    async fn read(&self, widget_id: &str) -> StateResult<WidgetData> {
        let raw = self
            .store
            .get(&self.keys.widget(widget_id))
            .await?
            .ok_or_else(|| not_found(widget_id))?;
        serde_json::from_str(&raw).map_err(|e| StateError::Deserialize(e.to_string()))
    }
}

fn encode(widget: &WidgetData) -> StateResult<String> {
    serde_json::to_string(widget).map_err(|e| StateError::Serialize(e.to_string()))
}

#[async_trait]
impl WidgetStore for SharedWidgetStore {
    async fn create(&self, mut widget: WidgetData) -> StateResult<WidgetData> {
        apply_default_ttl(&mut widget, self.default_ttl);
        let key = self.keys.widget(&widget.widget_id);
        let value = encode(&widget)?;
        let created = self
            .store
            .set(&key, &value, widget.ttl(), WriteMode::IfAbsent)
            .await?;
        if !created {
            return Err(StateError::AlreadyExists(format!(
                "widget {}",
                widget.widget_id
            )));
        }
        debug!(widget_id = %widget.widget_id, "widget created");
        Ok(widget)
    }

    async fn get(&self, widget_id: &str) -> StateResult<WidgetData> {
        self.read(widget_id).await
    }

    async fn update(&self, widget_id: &str, patch: WidgetPatch) -> StateResult<WidgetData> {
        let mut widget = self.read(widget_id).await?;
        patch.apply(&mut widget);
        let value = encode(&widget)?;
        // XX: a widget deleted between read and write stays deleted.
        let written = self
            .store
            .set(
                &self.keys.widget(widget_id),
                &value,
                widget.ttl(),
                WriteMode::IfPresent,
            )
            .await?;
        if !written {
            return Err(not_found(widget_id));
        }
        debug!(%widget_id, "widget updated");
        Ok(widget)
    }

    async fn touch(&self, widget_id: &str) -> StateResult<()> {
        let widget = self.read(widget_id).await?;
        match widget.ttl() {
            Some(ttl) => {
                if self.store.expire(&self.keys.widget(widget_id), ttl).await? {
                    Ok(())
                } else {
                    Err(not_found(widget_id))
                }
            }
            None => Ok(()),
        }
    }

    async fn delete(&self, widget_id: &str) -> StateResult<bool> {
        let existed = self.store.delete(&self.keys.widget(widget_id)).await?;
        debug!(%widget_id, existed, "widget deleted");
        Ok(existed)
    }

    async fn list(&self) -> StateResult<Vec<WidgetId>> {
        let prefix = self.keys.widget_prefix();
        let mut ids: Vec<WidgetId> = self
            .store
            .scan_prefix(&prefix)
            .await?
            .into_iter()
            .filter_map(|key| key.strip_prefix(&prefix).map(str::to_string))
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn purge_expired(&self) -> StateResult<usize> {
        // The substrate expires keys natively.
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::substrate::LoopbackStore;
    use serde_json::json;

    fn memory() -> MemoryWidgetStore {
        MemoryWidgetStore::new(None)
    }

    fn shared() -> SharedWidgetStore {
        SharedWidgetStore::new(Arc::new(LoopbackStore::new()), KeySpace::new("test:"), None)
    }

    async fn check_round_trip(store: &dyn WidgetStore) {
        let widget = WidgetData::new("w1", "<h1>hi</h1>")
            .with_config("theme", json!("dark"))
            .with_structure(json!({"toolbar": ["zoom"]}));
        store.create(widget.clone()).await.unwrap();

        let fetched = store.get("w1").await.unwrap();
        assert_eq!(fetched.html, "<h1>hi</h1>");
        assert_eq!(fetched.config, widget.config);
        assert_eq!(fetched.structure, widget.structure);

        assert!(store.delete("w1").await.unwrap());
        assert!(matches!(
            store.get("w1").await.unwrap_err(),
            StateError::NotFound(_)
        ));
        // Second delete is not an error.
        assert!(!store.delete("w1").await.unwrap());
    }

    async fn check_duplicate_create(store: &dyn WidgetStore) {
        store.create(WidgetData::new("w1", "a")).await.unwrap();
        let err = store.create(WidgetData::new("w1", "b")).await.unwrap_err();
        assert!(matches!(err, StateError::AlreadyExists(_)));
        assert_eq!(store.get("w1").await.unwrap().html, "a");
    }

    async fn check_update(store: &dyn WidgetStore) {
        let err = store
            .update("missing", WidgetPatch::html("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, StateError::NotFound(_)));

        store
            .create(WidgetData::new("w1", "a").with_config("height", json!(300)))
            .await
            .unwrap();
        let updated = store
            .update("w1", WidgetPatch::html("b").set_config("width", json!(500)))
            .await
            .unwrap();
        assert_eq!(updated.html, "b");
        assert_eq!(updated.config["height"], json!(300));
        assert_eq!(store.get("w1").await.unwrap(), updated);
    }

    async fn check_list(store: &dyn WidgetStore) {
        store.create(WidgetData::new("b", "")).await.unwrap();
        store.create(WidgetData::new("a", "")).await.unwrap();
        assert_eq!(store.list().await.unwrap(), vec!["a", "b"]);
    }

    async fn check_ttl(store: &dyn WidgetStore) {
        store
            .create(WidgetData::new("w1", "x").with_ttl(Duration::from_secs(10)))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(8)).await;
        store.touch("w1").await.unwrap();
        tokio::time::advance(Duration::from_secs(8)).await;
        assert!(store.get("w1").await.is_ok());
        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(matches!(
            store.get("w1").await.unwrap_err(),
            StateError::NotFound(_)
        ));
        assert!(store.list().await.unwrap().is_empty());
        // The id is free again.
        store.create(WidgetData::new("w1", "y")).await.unwrap();
    }

    #[tokio::test]
    async fn memory_round_trip() {
        check_round_trip(&memory()).await;
    }

    #[tokio::test]
    async fn shared_round_trip() {
        check_round_trip(&shared()).await;
    }

    #[tokio::test]
    async fn memory_duplicate_create() {
        check_duplicate_create(&memory()).await;
    }

    #[tokio::test]
    async fn shared_duplicate_create() {
        check_duplicate_create(&shared()).await;
    }

    #[tokio::test]
    async fn memory_update() {
        check_update(&memory()).await;
    }

    #[tokio::test]
    async fn shared_update() {
        check_update(&shared()).await;
    }

    #[tokio::test]
    async fn memory_list() {
        check_list(&memory()).await;
    }

    #[tokio::test]
    async fn shared_list() {
        check_list(&shared()).await;
    }

    #[tokio::test(start_paused = true)]
    async fn memory_ttl() {
        check_ttl(&memory()).await;
    }

    #[tokio::test(start_paused = true)]
    async fn shared_ttl() {
        check_ttl(&shared()).await;
    }

    #[tokio::test(start_paused = true)]
    async fn default_ttl_applies_when_unset() {
        let store = MemoryWidgetStore::new(Some(Duration::from_secs(5)));
        let stored = store.create(WidgetData::new("w1", "")).await.unwrap();
        assert_eq!(stored.ttl_secs, Some(5));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(store.purge_expired().await.unwrap(), 1);
        assert!(store.get("w1").await.is_err());
    }

    #[tokio::test]
    async fn shared_update_after_delete_is_not_found() {
        let store = shared();
        store.create(WidgetData::new("w1", "a")).await.unwrap();
        store.delete("w1").await.unwrap();
        assert!(matches!(
            store.update("w1", WidgetPatch::html("b")).await.unwrap_err(),
            StateError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn shared_backend_errors_surface() {
        let substrate = LoopbackStore::new();
        let store =
            SharedWidgetStore::new(Arc::new(substrate.clone()), KeySpace::new("test:"), None);
        substrate.set_offline(true);
        let err = store.get("w1").await.unwrap_err();
        assert!(matches!(err, StateError::BackendUnavailable(_)));
    }
}
