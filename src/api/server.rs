//! Dispatch server

use crate::api::http::{create_router, AppState};
use crate::common::config::{HistoryBackend, SyncPolicy};
use crate::common::{Config, Result};
use crate::dispatch::{spawn_reconciler, DispatchCoordinator};
use crate::store::{spawn_syncer, HistoryLog, Stores};
use std::future::Future;
use std::time::Duration;

pub struct DispatchServer {
    config: Config,
}

impl DispatchServer {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Serve until ctrl-c.
    pub async fn serve(self) -> Result<()> {
        self.serve_until(shutdown_signal()).await
    }

    /// Serve until `shutdown` resolves, then drain in-flight requests.
    pub async fn serve_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tracing::info!("Starting geodispatch server");
        tracing::info!("  HTTP API: {}", self.config.server.bind_addr);
        tracing::info!("  State store: {:?}", self.config.state.backend);
        tracing::info!("  History log: {:?}", self.config.history.backend);
        tracing::info!("  H3 resolution: {}", self.config.geo.resolution);

        let stores = Stores::open(&self.config)?;
        let coordinator = DispatchCoordinator::new(stores, self.config.dispatch.clone());

        let reconciler = if self.config.reconcile.enabled {
            let interval = Duration::from_secs(self.config.reconcile.interval_secs);
            tracing::info!("  Reconciliation every {:?}", interval);
            Some(spawn_reconciler(coordinator.clone(), interval))
        } else {
            None
        };

        let syncer = if self.config.history.backend == HistoryBackend::File
            && self.config.history.sync_policy == SyncPolicy::Interval
        {
            let interval = Duration::from_millis(self.config.history.sync_interval_ms);
            tracing::info!("  History fsync every {:?}", interval);
            Some(spawn_syncer(coordinator.stores().history.clone(), interval))
        } else {
            None
        };

        let history = coordinator.stores().history.clone();
        let router = create_router(
            AppState { coordinator },
            self.config.server.body_limit_bytes,
        );
        let listener = tokio::net::TcpListener::bind(self.config.server.bind_addr).await?;

        tracing::info!("✓ Dispatch server ready on {}", listener.local_addr()?);

        let result = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await;

        if let Some(reconciler) = reconciler {
            reconciler.abort();
        }
        if let Some(syncer) = syncer {
            syncer.abort();
        }
        if let Err(e) = history.sync().await {
            tracing::error!("Final history sync failed: {}", e);
        }
        if let Err(e) = &result {
            tracing::error!("HTTP server error: {}", e);
        }
        tracing::info!("Dispatch server stopped");
        Ok(result?)
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
}
