//! Background maintenance — TTL sweeps and route heartbeats.
//!
//! Each worker runs exactly two loops on a fixed cadence. Both stop when
//! the shutdown signal fires, so no heartbeat outlives the worker's routes.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::StateError;
use crate::manager::ServerStateManager;
use crate::routes::ConnectionRouter;
use crate::sessions::SessionStore;
use crate::widgets::WidgetStore;

/// Handles to the running maintenance loops.
pub struct BackgroundTasks {
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    /// Start the sweep and heartbeat loops for `manager`.
    pub fn spawn(manager: Arc<ServerStateManager>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let config = manager.config();
        let sweep_every = config.sweep_interval();
        let heartbeat_every = config.heartbeat_interval();

        let handles = vec![
            tokio::spawn(run_sweep_loop(
                Arc::clone(&manager),
                sweep_every,
                shutdown_rx.clone(),
            )),
            tokio::spawn(run_heartbeat_loop(
                Arc::clone(&manager),
                heartbeat_every,
                shutdown_rx,
            )),
        ];
        info!(
            worker_id = %manager.worker_id(),
            sweep_secs = sweep_every.as_secs(),
            heartbeat_secs = heartbeat_every.as_secs(),
            "maintenance started"
        );
        Self {
            shutdown_tx,
            handles,
        }
    }

    /// Signal both loops and wait for them to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    error!(error = %e, "maintenance task panicked");
                }
            }
        }
        info!("maintenance stopped");
    }
}

/// Result of one sweep pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub widgets: usize,
    pub sessions: usize,
}

/// Purge expired widgets and sessions once.
pub async fn sweep_once(manager: &ServerStateManager) -> SweepReport {
    let mut report = SweepReport::default();
    match manager.widgets().purge_expired().await {
        Ok(n) => report.widgets = n,
        Err(e) => warn!(error = %e, "widget sweep failed"),
    }
    match manager.sessions().purge_expired().await {
        Ok(n) => report.sessions = n,
        Err(e) => warn!(error = %e, "session sweep failed"),
    }
    report
}

/// Result of one heartbeat pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatReport {
    pub refreshed: usize,
    pub reregistered: usize,
    pub failed: usize,
}

/// Refresh every route this worker owns once. Expired routes whose
/// connection is still owned at that moment are registered again; a
/// connection unregistered since the pass started is skipped.
pub async fn heartbeat_once(manager: &ServerStateManager) -> HeartbeatReport {
    let routes = manager.routes();
    let mut report = HeartbeatReport::default();
    for connection in routes.owned() {
        let connection_id = connection.connection_id.clone();
        match routes.heartbeat(&connection_id).await {
            Ok(()) => report.refreshed += 1,
            Err(StateError::StaleRoute(_)) => match routes.reregister(&connection_id).await {
                Ok(true) => {
                    info!(%connection_id, "stale route registered again");
                    report.reregistered += 1;
                }
                Ok(false) => debug!(%connection_id, "route unregistered during heartbeat pass"),
                Err(e) => {
                    warn!(%connection_id, error = %e, "route re-registration failed");
                    report.failed += 1;
                }
            },
            Err(e) => {
                warn!(%connection_id, error = %e, "route heartbeat failed");
                report.failed += 1;
            }
        }
    }
    report
}

async fn run_sweep_loop(
    manager: Arc<ServerStateManager>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(every) => {
                let report = sweep_once(&manager).await;
                if report != SweepReport::default() {
                    debug!(widgets = report.widgets, sessions = report.sessions, "sweep removed expired records");
                }
            }
            _ = shutdown.changed() => {
                debug!("sweep loop shutting down");
                break;
            }
        }
    }
}

async fn run_heartbeat_loop(
    manager: Arc<ServerStateManager>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(every) => {
                let report = heartbeat_once(&manager).await;
                if report.failed > 0 {
                    warn!(failed = report.failed, refreshed = report.refreshed, "route heartbeat pass incomplete");
                }
            }
            _ = shutdown.changed() => {
                debug!("heartbeat loop shutting down");
                break;
            }
        }
    }
}
