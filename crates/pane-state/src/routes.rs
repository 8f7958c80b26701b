//! ConnectionRouter — which worker holds the live socket for a connection.
//!
//! The event bus tells every worker that something happened to a widget;
//! the router is what a worker consults to decide whether the destination
//! socket is actually its own.
//!
//! In the shared backend every connection has its own liveness key
//! (`route:{connection_id}`) with a short TTL that the owning worker keeps
//! refreshing. A worker that dies without unregistering stops refreshing,
//! its keys expire, and `lookup` filters and prunes the dangling members of
//! `routes:{widget_id}`.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, info};

use crate::error::{StateError, StateResult};
use crate::keys::KeySpace;
use crate::substrate::{SharedStore, WriteMode};
use crate::types::{epoch_secs, ConnectionId, ConnectionInfo, RouteEntry, WidgetId};

#[async_trait]
pub trait ConnectionRouter: Send + Sync {
    /// Record that `connection.worker_id` owns the socket. Re-registering a
    /// known connection refreshes it.
    async fn register(&self, connection: ConnectionInfo) -> StateResult<()>;

    /// Live routes of a widget, sorted.
    async fn lookup(&self, widget_id: &str) -> StateResult<Vec<RouteEntry>>;

    /// The live entry for one connection, or `NotFound`.
    async fn connection(&self, connection_id: &str) -> StateResult<ConnectionInfo>;

    /// Refresh liveness. `StaleRoute` if the entry is already gone.
    async fn heartbeat(&self, connection_id: &str) -> StateResult<()>;

    /// Register a stale route again from this router's own record, but only
    /// while the connection is still owned. Returns `false` once it has been
    /// unregistered, so a heartbeat pass never revives a detached socket.
    async fn reregister(&self, connection_id: &str) -> StateResult<bool>;

    /// Remove a route. Idempotent; returns whether it was live.
    async fn unregister(&self, connection_id: &str) -> StateResult<bool>;

    /// Connections registered through this router and not unregistered,
    /// whether or not their shared entry is still live.
    fn owned(&self) -> Vec<ConnectionInfo>;
}

fn stale(connection_id: &str) -> StateError {
    StateError::StaleRoute(format!("connection {connection_id}"))
}

// ── Memory ─────────────────────────────────────────────────────────

/// Single-process router. Entries live until unregistered.
#[derive(Default)]
pub struct MemoryRouter {
    connections: DashMap<ConnectionId, ConnectionInfo>,
    by_widget: DashMap<WidgetId, BTreeSet<ConnectionId>>,
}

impl MemoryRouter {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConnectionRouter for MemoryRouter {
    async fn register(&self, mut connection: ConnectionInfo) -> StateResult<()> {
        connection.last_heartbeat = epoch_secs();
        let connection_id = connection.connection_id.clone();
        let widget_id = connection.widget_id.clone();
        self.connections.insert(connection_id.clone(), connection);
        self.by_widget
            .entry(widget_id.clone())
            .or_default()
            .insert(connection_id.clone());
        debug!(%connection_id, %widget_id, "route registered");
        Ok(())
    }

    async fn lookup(&self, widget_id: &str) -> StateResult<Vec<RouteEntry>> {
        let ids: Vec<ConnectionId> = match self.by_widget.get(widget_id) {
            Some(ids) => ids.iter().cloned().collect(),
            None => return Ok(Vec::new()),
        };
        let mut routes: Vec<RouteEntry> = ids
            .iter()
            .filter_map(|id| self.connections.get(id).map(|c| c.route()))
            .collect();
        routes.sort();
        Ok(routes)
    }

    async fn connection(&self, connection_id: &str) -> StateResult<ConnectionInfo> {
        self.connections
            .get(connection_id)
            .map(|c| c.value().clone())
            .ok_or_else(|| StateError::NotFound(format!("connection {connection_id}")))
    }

    async fn heartbeat(&self, connection_id: &str) -> StateResult<()> {
        match self.connections.get_mut(connection_id) {
            Some(mut c) => {
                c.last_heartbeat = epoch_secs();
                Ok(())
            }
            None => Err(stale(connection_id)),
        }
    }

    async fn reregister(&self, connection_id: &str) -> StateResult<bool> {
        // Memory entries never go stale while registered.
        Ok(self.connections.contains_key(connection_id))
    }

    async fn unregister(&self, connection_id: &str) -> StateResult<bool> {
        let Some((_, connection)) = self.connections.remove(connection_id) else {
            return Ok(false);
        };
        if let Some(mut ids) = self.by_widget.get_mut(&connection.widget_id) {
            ids.remove(connection_id);
        }
        self.by_widget
            .remove_if(&connection.widget_id, |_, ids| ids.is_empty());
        debug!(%connection_id, widget_id = %connection.widget_id, "route unregistered");
        Ok(true)
    }

    fn owned(&self) -> Vec<ConnectionInfo> {
        self.connections.iter().map(|c| c.value().clone()).collect()
    }
}

// ── Shared ─────────────────────────────────────────────────────────

/// Router on the shared coordination substrate.
pub struct SharedRouter {
    store: Arc<dyn SharedStore>,
    keys: KeySpace,
    route_ttl: Duration,
    /// Connections this worker registered, for heartbeats and re-registration.
    owned: DashMap<ConnectionId, ConnectionInfo>,
}

impl SharedRouter {
    pub fn new(store: Arc<dyn SharedStore>, keys: KeySpace, route_ttl: Duration) -> Self {
        Self {
            store,
            keys,
            route_ttl,
            owned: DashMap::new(),
        }
    }

    async fn write(&self, connection: &ConnectionInfo) -> StateResult<()> {
        let raw = encode(connection)?;
        let key = self.keys.route(&connection.connection_id);
        self.store
            .set(&key, &raw, Some(self.route_ttl), WriteMode::Always)
            .await?;
        self.store
            .set_add(
                &self.keys.routes(&connection.widget_id),
                &member(&connection.route()),
                Some(self.route_ttl),
            )
            .await?;
        Ok(())
    }

    async fn erase(&self, connection: &ConnectionInfo) -> StateResult<bool> {
        self.store
            .set_remove(
                &self.keys.routes(&connection.widget_id),
                &[member(&connection.route())],
            )
            .await?;
        self.store
            .delete(&self.keys.route(&connection.connection_id))
            .await
    }

    async fn read(&self, connection_id: &str) -> StateResult<Option<ConnectionInfo>> {
        match self.store.get(&self.keys.route(connection_id)).await? {
            Some(raw) => decode(&raw).map(Some),
            None => Ok(None),
        }
    }
}

fn member(route: &RouteEntry) -> String {
    format!("{}|{}", route.worker_id, route.connection_id)
}

fn parse_member(member: &str) -> Option<RouteEntry> {
    let (worker_id, connection_id) = member.split_once('|')?;
    Some(RouteEntry {
        worker_id: worker_id.to_string(),
        connection_id: connection_id.to_string(),
    })
}

fn encode(connection: &ConnectionInfo) -> StateResult<String> {
    serde_json::to_string(connection).map_err(|e| StateError::Serialize(e.to_string()))
}

fn decode(raw: &str) -> StateResult<ConnectionInfo> {
    serde_json::from_str(raw).map_err(|e| StateError::Deserialize(e.to_string()))
}

#[async_trait]
impl ConnectionRouter for SharedRouter {
    async fn register(&self, mut connection: ConnectionInfo) -> StateResult<()> {
        connection.last_heartbeat = epoch_secs();
        self.write(&connection).await?;
        debug!(
            connection_id = %connection.connection_id,
            widget_id = %connection.widget_id,
            worker_id = %connection.worker_id,
            "route registered"
        );
        self.owned
            .insert(connection.connection_id.clone(), connection);
        Ok(())
    }

    async fn lookup(&self, widget_id: &str) -> StateResult<Vec<RouteEntry>> {
        let index = self.keys.routes(widget_id);
        let members = self.store.set_members(&index).await?;
        if members.is_empty() {
            return Ok(Vec::new());
        }

        let candidates: Vec<Option<RouteEntry>> =
            members.iter().map(|m| parse_member(m)).collect();
        let route_keys: Vec<String> = candidates
            .iter()
            .map(|c| match c {
                Some(route) => self.keys.route(&route.connection_id),
                None => String::new(),
            })
            .collect();
        let values = self.store.get_many(&route_keys).await?;

        let mut routes = Vec::new();
        let mut dangling = Vec::new();
        for ((raw_member, candidate), value) in members.iter().zip(candidates).zip(values) {
            let live = match (candidate, value) {
                (Some(route), Some(raw)) => match decode(&raw) {
                    Ok(info) if info.widget_id == widget_id && info.worker_id == route.worker_id => {
                        Some(route)
                    }
                    _ => None,
                },
                _ => None,
            };
            match live {
                Some(route) => routes.push(route),
                None => dangling.push(raw_member.clone()),
            }
        }

        if !dangling.is_empty() {
            debug!(%widget_id, count = dangling.len(), "pruning expired routes");
            self.store.set_remove(&index, &dangling).await?;
        }
        routes.sort();
        Ok(routes)
    }

    async fn connection(&self, connection_id: &str) -> StateResult<ConnectionInfo> {
        self.read(connection_id)
            .await?
            .ok_or_else(|| StateError::NotFound(format!("connection {connection_id}")))
    }

    async fn heartbeat(&self, connection_id: &str) -> StateResult<()> {
        let known = self.owned.get(connection_id).map(|c| c.value().clone());
        let mut connection = match known {
            Some(c) => c,
            None => self
                .read(connection_id)
                .await?
                .ok_or_else(|| stale(connection_id))?,
        };
        connection.last_heartbeat = epoch_secs();
        let raw = encode(&connection)?;

        // IfPresent: a heartbeat never brings an expired or removed route back.
        let refreshed = self
            .store
            .set(
                &self.keys.route(connection_id),
                &raw,
                Some(self.route_ttl),
                WriteMode::IfPresent,
            )
            .await?;
        if !refreshed {
            return Err(stale(connection_id));
        }
        self.store
            .expire(&self.keys.routes(&connection.widget_id), self.route_ttl)
            .await?;
        if let Some(mut owned) = self.owned.get_mut(connection_id) {
            owned.last_heartbeat = connection.last_heartbeat;
        }
        Ok(())
    }

    async fn reregister(&self, connection_id: &str) -> StateResult<bool> {
        let Some(mut connection) = self.owned.get(connection_id).map(|c| c.value().clone())
        else {
            return Ok(false);
        };
        connection.last_heartbeat = epoch_secs();
        self.write(&connection).await?;
        // An unregister that ran during the write has already deleted the
        // keys; undo ours so the route stays gone.
        if !self.owned.contains_key(connection_id) {
            self.erase(&connection).await?;
            debug!(%connection_id, "route unregistered during re-registration");
            return Ok(false);
        }
        if let Some(mut owned) = self.owned.get_mut(connection_id) {
            owned.last_heartbeat = connection.last_heartbeat;
        }
        Ok(true)
    }

    async fn unregister(&self, connection_id: &str) -> StateResult<bool> {
        let local = self.owned.remove(connection_id).map(|(_, c)| c);
        let connection = match self.read(connection_id).await? {
            Some(c) => Some(c),
            None => local,
        };
        let existed = match &connection {
            Some(connection) => self.erase(connection).await?,
            None => self.store.delete(&self.keys.route(connection_id)).await?,
        };
        if existed {
            info!(%connection_id, "route unregistered");
        }
        Ok(existed)
    }

    fn owned(&self) -> Vec<ConnectionInfo> {
        self.owned.iter().map(|c| c.value().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::substrate::LoopbackStore;

    const TTL: Duration = Duration::from_secs(30);

    fn shared(store: &LoopbackStore) -> SharedRouter {
        SharedRouter::new(Arc::new(store.clone()), KeySpace::new("test:"), TTL)
    }

    fn route(worker: &str, conn: &str) -> RouteEntry {
        RouteEntry {
            worker_id: worker.to_string(),
            connection_id: conn.to_string(),
        }
    }

    async fn check_register_lookup_unregister(router: &dyn ConnectionRouter) {
        router
            .register(ConnectionInfo::new("c1", "w1", "worker-a"))
            .await
            .unwrap();
        router
            .register(ConnectionInfo::new("c2", "w1", "worker-a"))
            .await
            .unwrap();
        router
            .register(ConnectionInfo::new("c3", "w2", "worker-a"))
            .await
            .unwrap();

        assert_eq!(
            router.lookup("w1").await.unwrap(),
            vec![route("worker-a", "c1"), route("worker-a", "c2")]
        );
        assert_eq!(router.connection("c3").await.unwrap().widget_id, "w2");

        assert!(router.unregister("c1").await.unwrap());
        assert!(!router.unregister("c1").await.unwrap());
        assert_eq!(
            router.lookup("w1").await.unwrap(),
            vec![route("worker-a", "c2")]
        );
        assert!(matches!(
            router.connection("c1").await.unwrap_err(),
            StateError::NotFound(_)
        ));
        assert!(router.lookup("nope").await.unwrap().is_empty());
    }

    async fn check_heartbeat_after_unregister(router: &dyn ConnectionRouter) {
        router
            .register(ConnectionInfo::new("c1", "w1", "worker-a"))
            .await
            .unwrap();
        router.heartbeat("c1").await.unwrap();
        router.unregister("c1").await.unwrap();

        assert!(matches!(
            router.heartbeat("c1").await.unwrap_err(),
            StateError::StaleRoute(_)
        ));
        assert!(router.lookup("w1").await.unwrap().is_empty());
        assert!(router.owned().is_empty());
    }

    #[tokio::test]
    async fn memory_register_lookup_unregister() {
        check_register_lookup_unregister(&MemoryRouter::new()).await;
    }

    #[tokio::test]
    async fn shared_register_lookup_unregister() {
        check_register_lookup_unregister(&shared(&LoopbackStore::new())).await;
    }

    #[tokio::test]
    async fn memory_heartbeat_after_unregister() {
        check_heartbeat_after_unregister(&MemoryRouter::new()).await;
    }

    #[tokio::test]
    async fn shared_heartbeat_after_unregister() {
        check_heartbeat_after_unregister(&shared(&LoopbackStore::new())).await;
    }

    #[tokio::test]
    async fn routers_share_one_view() {
        let store = LoopbackStore::new();
        let a = shared(&store);
        let b = shared(&store);
        a.register(ConnectionInfo::new("c1", "w1", "worker-a"))
            .await
            .unwrap();
        b.register(ConnectionInfo::new("c2", "w1", "worker-b"))
            .await
            .unwrap();

        let expected = vec![route("worker-a", "c1"), route("worker-b", "c2")];
        assert_eq!(a.lookup("w1").await.unwrap(), expected);
        assert_eq!(b.lookup("w1").await.unwrap(), expected);
        assert_eq!(a.owned().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unrefreshed_route_expires_and_is_pruned() {
        let store = LoopbackStore::new();
        let a = shared(&store);
        let b = shared(&store);
        a.register(ConnectionInfo::new("c1", "w1", "worker-a"))
            .await
            .unwrap();
        b.register(ConnectionInfo::new("c2", "w1", "worker-b"))
            .await
            .unwrap();

        // Only worker-b keeps heartbeating.
        for _ in 0..4 {
            tokio::time::advance(Duration::from_secs(10)).await;
            b.heartbeat("c2").await.unwrap();
        }

        assert_eq!(
            b.lookup("w1").await.unwrap(),
            vec![route("worker-b", "c2")]
        );
        let index = KeySpace::new("test:").routes("w1");
        assert_eq!(
            store.set_members(&index).await.unwrap(),
            vec!["worker-b|c2".to_string()]
        );
        assert!(matches!(
            a.heartbeat("c1").await.unwrap_err(),
            StateError::StaleRoute(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_route_recovers_by_registering_again() {
        let store = LoopbackStore::new();
        let a = shared(&store);
        a.register(ConnectionInfo::new("c1", "w1", "worker-a"))
            .await
            .unwrap();
        tokio::time::advance(TTL + Duration::from_secs(1)).await;
        assert!(a.lookup("w1").await.unwrap().is_empty());

        assert_eq!(a.owned().len(), 1);
        assert!(a.reregister("c1").await.unwrap());
        assert_eq!(
            a.lookup("w1").await.unwrap(),
            vec![route("worker-a", "c1")]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn detached_route_is_not_registered_again() {
        let store = LoopbackStore::new();
        let a = shared(&store);
        a.register(ConnectionInfo::new("c1", "w1", "worker-a"))
            .await
            .unwrap();
        tokio::time::advance(TTL + Duration::from_secs(1)).await;

        // A heartbeat pass took its copy, then the socket detached.
        let pass = a.owned();
        a.unregister("c1").await.unwrap();
        for connection in pass {
            let id = &connection.connection_id;
            assert!(matches!(
                a.heartbeat(id).await.unwrap_err(),
                StateError::StaleRoute(_)
            ));
            assert!(!a.reregister(id).await.unwrap());
        }

        assert!(a.lookup("w1").await.unwrap().is_empty());
        assert!(a.owned().is_empty());
        assert_eq!(store.get(&KeySpace::new("test:").route("c1")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn memory_reregister_follows_ownership() {
        let router = MemoryRouter::new();
        router
            .register(ConnectionInfo::new("c1", "w1", "worker-a"))
            .await
            .unwrap();
        assert!(router.reregister("c1").await.unwrap());
        router.unregister("c1").await.unwrap();
        assert!(!router.reregister("c1").await.unwrap());
        assert!(router.lookup("w1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn backend_errors_surface() {
        let store = LoopbackStore::new();
        let router = shared(&store);
        store.set_offline(true);
        let err = router
            .register(ConnectionInfo::new("c1", "w1", "worker-a"))
            .await
            .unwrap_err();
        assert!(err.is_unavailable());
    }

    #[test]
    fn member_encoding() {
        let entry = route("worker-a", "conn-1");
        assert_eq!(member(&entry), "worker-a|conn-1");
        assert_eq!(parse_member("worker-a|conn-1"), Some(entry));
        assert_eq!(parse_member("garbage"), None);
    }
}
