//! Per-connection sync loops.
//!
//! Each watched connection gets its own task that runs a full sync, then
//! sleeps for the configured interval (or an exponential backoff after a
//! failure). At most one pass per connection runs at a time; a pass that
//! would overlap one already in flight is skipped.

use crate::config::SyncConfig;
use crate::services::store::LedgerStore;
use crate::sync::engine::{ReconciliationEngine, SyncError, SyncReport};
use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub enabled: bool,
    pub interval: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl From<&SyncConfig> for SchedulerSettings {
    fn from(config: &SyncConfig) -> Self {
        Self {
            enabled: config.enabled,
            interval: config.interval,
            initial_backoff: config.initial_backoff,
            max_backoff: config.max_backoff,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    Started,
    AlreadyRunning,
}

/// Removes the connection from the in-flight set when the pass ends,
/// including when the pass future is dropped on shutdown.
struct InFlightGuard {
    in_flight: Arc<DashMap<i64, ()>>,
    connection_id: i64,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.remove(&self.connection_id);
    }
}

#[derive(Clone)]
pub struct SyncScheduler {
    engine: ReconciliationEngine,
    store: Arc<dyn LedgerStore>,
    settings: SchedulerSettings,
    in_flight: Arc<DashMap<i64, ()>>,
    watched: Arc<DashMap<i64, ()>>,
    shutdown_token: CancellationToken,
}

impl SyncScheduler {
    pub fn new(
        engine: ReconciliationEngine,
        store: Arc<dyn LedgerStore>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            engine,
            store,
            settings,
            in_flight: Arc::new(DashMap::new()),
            watched: Arc::new(DashMap::new()),
            shutdown_token: CancellationToken::new(),
        }
    }

    /// Start a loop for every stored connection. Returns how many were started.
    pub async fn start(&self) -> Result<usize, SyncError> {
        if !self.settings.enabled {
            info!("Background sync disabled by configuration");
            return Ok(0);
        }

        let connections = self.store.list_connections().await?;
        let started = connections
            .iter()
            .filter(|connection| self.watch(connection.id))
            .count();

        info!(
            connections = started,
            interval_secs = self.settings.interval.as_secs(),
            "Sync scheduler started"
        );
        Ok(started)
    }

    /// Start the background loop for one connection. Returns `false` when
    /// background sync is disabled or the connection is already watched.
    pub fn watch(&self, connection_id: i64) -> bool {
        if !self.settings.enabled || self.shutdown_token.is_cancelled() {
            return false;
        }
        if self.watched.insert(connection_id, ()).is_some() {
            return false;
        }

        let scheduler = self.clone();
        tokio::spawn(async move {
            scheduler.run_loop(connection_id).await;
        });
        true
    }

    /// Run one full sync now on the caller's task. `Ok(None)` means a pass
    /// for this connection was already in flight and nothing ran.
    pub async fn run_once(&self, connection_id: i64) -> Result<Option<SyncReport>, SyncError> {
        let Some(_guard) = self.claim(connection_id) else {
            info!(connection_id, "Pass already in flight, skipping");
            return Ok(None);
        };

        self.engine.sync_connection(connection_id).await.map(Some)
    }

    /// Start one full sync in the background unless one is already running.
    pub fn trigger(&self, connection_id: i64) -> TriggerOutcome {
        let Some(guard) = self.claim(connection_id) else {
            return TriggerOutcome::AlreadyRunning;
        };

        let engine = self.engine.clone();
        let shutdown = self.shutdown_token.clone();
        tokio::spawn(async move {
            let _guard = guard;
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(connection_id, "Manual pass abandoned on shutdown");
                }
                result = engine.sync_connection(connection_id) => {
                    if let Err(e) = result {
                        warn!(connection_id, error = %e, "Manual pass failed");
                    }
                }
            }
        });

        info!(connection_id, "Manual pass started");
        TriggerOutcome::Started
    }

    pub fn is_running(&self, connection_id: i64) -> bool {
        self.in_flight.contains_key(&connection_id)
    }

    pub fn is_watching(&self, connection_id: i64) -> bool {
        self.watched.contains_key(&connection_id)
    }

    pub fn shutdown(&self) {
        info!("Stopping sync scheduler");
        self.shutdown_token.cancel();
    }

    fn claim(&self, connection_id: i64) -> Option<InFlightGuard> {
        match self.in_flight.entry(connection_id) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(());
                Some(InFlightGuard {
                    in_flight: self.in_flight.clone(),
                    connection_id,
                })
            }
        }
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.settings.initial_backoff)
            .with_max_interval(self.settings.max_backoff)
            .with_max_elapsed_time(None)
            .build()
    }

    async fn run_loop(&self, connection_id: i64) {
        let mut backoff = self.backoff();
        info!(connection_id, "Sync loop started");

        loop {
            let result = tokio::select! {
                _ = self.shutdown_token.cancelled() => break,
                result = self.run_once(connection_id) => result,
            };

            let delay = match result {
                Ok(Some(report)) => {
                    backoff.reset();
                    info!(
                        connection_id,
                        pages = report.transactions.pages,
                        inserted = report.transactions.inserted,
                        skipped = report.transactions.skipped.len(),
                        "Scheduled pass complete"
                    );
                    self.settings.interval
                }
                Ok(None) => self.settings.interval,
                Err(SyncError::ConnectionNotFound(_)) => {
                    warn!(connection_id, "Connection gone, stopping sync loop");
                    break;
                }
                Err(e) => {
                    let delay = backoff.next_backoff().unwrap_or(self.settings.max_backoff);
                    warn!(
                        connection_id,
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "Scheduled pass failed"
                    );
                    delay
                }
            };

            tokio::select! {
                _ = self.shutdown_token.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.watched.remove(&connection_id);
        info!(connection_id, "Sync loop stopped");
    }
}
