//! Application startup and lifecycle management.

use crate::config::SyncServiceConfig;
use crate::handlers;
use crate::services::provider::{FinanceProvider, PlaidClient};
use crate::services::{init_metrics, Database, LedgerStore};
use crate::sync::{EngineSettings, ReconciliationEngine, SchedulerSettings, SyncScheduler};
use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use service_core::error::AppError;
use service_core::middleware::metrics::metrics_middleware;
use service_core::middleware::tracing::request_id_middleware;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: SyncServiceConfig,
    pub db: Arc<Database>,
    pub provider: Arc<dyn FinanceProvider>,
    pub scheduler: SyncScheduler,
}

/// Application container for managing server lifecycle.
pub struct Application {
    http_port: u16,
    http_listener: TcpListener,
    state: AppState,
}

impl Application {
    /// Build the application with the Plaid client from configuration.
    pub async fn build(config: SyncServiceConfig) -> Result<Self, AppError> {
        let provider = PlaidClient::new(config.provider.clone()).map_err(|e| {
            tracing::error!(error = %e, "Failed to create Plaid client");
            AppError::ConfigError(anyhow::anyhow!("Failed to create Plaid client: {}", e))
        })?;

        if !provider.is_configured() {
            tracing::warn!("PLAID_CLIENT_ID or PLAID_SECRET not set - provider calls will fail");
        }

        Self::build_with_provider(config, Arc::new(provider)).await
    }

    /// Build the application around an existing provider implementation.
    pub async fn build_with_provider(
        config: SyncServiceConfig,
        provider: Arc<dyn FinanceProvider>,
    ) -> Result<Self, AppError> {
        init_metrics();

        let db = Database::new(
            &config.database.url,
            config.database.max_connections,
            config.database.min_connections,
        )
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to open SQLite database");
            e
        })?;

        db.run_migrations().await.map_err(|e| {
            tracing::error!(error = %e, "Failed to run migrations");
            AppError::from(e)
        })?;

        let db = Arc::new(db);
        let store: Arc<dyn LedgerStore> = db.clone();

        let engine = ReconciliationEngine::new(
            store.clone(),
            provider.clone(),
            EngineSettings::from(config.sync.clone()),
        );
        let scheduler =
            SyncScheduler::new(engine, store, SchedulerSettings::from(&config.sync));

        let state = AppState {
            config: config.clone(),
            db,
            provider,
            scheduler,
        };

        let http_addr = config.common.http_addr();
        let http_listener = TcpListener::bind(http_addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %http_addr, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let http_port = http_listener.local_addr()?.port();

        tracing::info!(http_port = http_port, "Ledger sync service listener bound");

        Ok(Self {
            http_port,
            http_listener,
            state,
        })
    }

    /// Get the HTTP port the server is listening on.
    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    /// Get a reference to the database.
    pub fn db(&self) -> &Database {
        &self.state.db
    }

    pub fn scheduler(&self) -> SyncScheduler {
        self.state.scheduler.clone()
    }

    /// Start the sync loops and serve HTTP until stopped. The loops are
    /// cancelled when the server future ends or is dropped.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let scheduler = self.state.scheduler.clone();
        let _stop_loops = StopOnDrop(scheduler.clone());

        match scheduler.start().await {
            Ok(count) => tracing::info!(connections = count, "Sync loops running"),
            Err(e) => tracing::error!(error = %e, "Failed to start sync loops"),
        }

        let router = router(self.state);

        tracing::info!(
            service = "ledger-sync-service",
            version = env!("CARGO_PKG_VERSION"),
            http_port = self.http_port,
            "Service ready to accept connections"
        );

        axum::serve(self.http_listener, router).await.map_err(|e| {
            tracing::error!(error = %e, "HTTP server error");
            std::io::Error::other(format!("HTTP server error: {}", e))
        })
    }
}

struct StopOnDrop(SyncScheduler);

impl Drop for StopOnDrop {
    fn drop(&mut self) {
        self.0.shutdown();
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/metrics", get(handlers::metrics_handler))
        .route("/api/link/token", post(handlers::create_link_token))
        .route("/api/link/exchange", post(handlers::exchange_public_token))
        .route("/api/connections", get(handlers::list_connections))
        .route("/api/connections/:id/sync", post(handlers::trigger_sync))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(metrics_middleware))
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}
