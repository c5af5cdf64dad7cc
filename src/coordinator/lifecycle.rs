//! Engine lifecycle management: construction, start, shutdown, health.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::FavoriteEngineConfig;
use crate::reconcile::Reconciler;
use crate::scheduler::SyncScheduler;
use crate::storage::redis::RedisFavoriteCache;
use crate::storage::sql::SqlCountStore;
use crate::storage::traits::{CountArchive, FavoriteCache, StorageError};

use super::types::HealthCheck;
use super::{EngineState, FavoriteEngine};

impl FavoriteEngine {
    /// Create an engine that connects to Redis and SQL on [`start()`](Self::start).
    pub fn new(config: FavoriteEngineConfig) -> Self {
        Self::assemble(config, None, None)
    }

    /// Create an engine over already-built backends (in-process stores,
    /// shared connections, test doubles). [`start()`](Self::start) then only
    /// launches the scheduler.
    pub fn with_backends(
        config: FavoriteEngineConfig,
        cache: Arc<dyn FavoriteCache>,
        archive: Arc<dyn CountArchive>,
    ) -> Self {
        Self::assemble(config, Some(cache), Some(archive))
    }

    fn assemble(
        config: FavoriteEngineConfig,
        cache: Option<Arc<dyn FavoriteCache>>,
        archive: Option<Arc<dyn CountArchive>>,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(EngineState::Created);
        let (shutdown_tx, _) = watch::channel(false);
        let mut engine = Self {
            config,
            state: state_tx,
            state_rx,
            cache,
            archive,
            reconciler: None,
            shutdown: shutdown_tx,
            scheduler: Mutex::new(None),
        };
        engine.build_reconciler();
        engine
    }

    fn build_reconciler(&mut self) {
        if let (Some(cache), Some(archive)) = (&self.cache, &self.archive) {
            self.reconciler = Some(Arc::new(Reconciler::new(cache.clone(), archive.clone(), &self.config)));
        }
    }

    /// Connect missing backends, then launch the reconciliation scheduler.
    ///
    /// Both `redis_url` and `sql_url` are required unless the backends were
    /// supplied through [`with_backends`](Self::with_backends).
    #[tracing::instrument(skip(self))]
    pub async fn start(&mut self) -> Result<(), StorageError> {
        match self.state() {
            EngineState::Created => {}
            EngineState::ShuttingDown => {
                return Err(StorageError::Config("engine is shutting down".into()));
            }
            state => {
                warn!(%state, "Favorite engine already started");
                return Ok(());
            }
        }

        let started = Instant::now();
        info!("Starting favorite engine");
        self.set_state(EngineState::Connecting);

        if self.cache.is_none() {
            match RedisFavoriteCache::connect(&self.config).await {
                Ok(cache) => {
                    info!(prefix = cache.prefix(), "Redis favorite cache connected");
                    crate::metrics::set_backend_healthy("redis", true);
                    self.cache = Some(Arc::new(cache));
                }
                Err(e) => {
                    error!(error = %e, "Failed to connect to Redis");
                    crate::metrics::set_backend_healthy("redis", false);
                    self.set_state(EngineState::Created);
                    return Err(e);
                }
            }
        }

        if self.archive.is_none() {
            let Some(sql_url) = self.config.sql_url.clone() else {
                self.set_state(EngineState::Created);
                return Err(StorageError::Config("sql_url is not set".into()));
            };
            match SqlCountStore::connect(&sql_url, self.config.sql_max_connections).await {
                Ok(store) => {
                    let store = store.with_io_timeout(self.config.io_timeout());
                    crate::metrics::set_backend_healthy("sql", true);
                    self.archive = Some(Arc::new(store));
                }
                Err(e) => {
                    error!(error = %e, "Failed to connect to SQL");
                    crate::metrics::set_backend_healthy("sql", false);
                    self.set_state(EngineState::Created);
                    return Err(e);
                }
            }
        }

        self.build_reconciler();
        self.set_state(EngineState::Ready);

        if self.spawn_scheduler()? {
            self.set_state(EngineState::Running);
        } else {
            warn!("Interval and threshold triggers both disabled, reconciliation runs only on demand");
        }

        info!(elapsed_ms = started.elapsed().as_millis() as u64, state = %self.state(), "Favorite engine started");
        Ok(())
    }

    /// Returns `false` when no trigger is configured.
    fn spawn_scheduler(&self) -> Result<bool, StorageError> {
        if self.config.sync_interval().is_none() && !self.config.threshold_enabled() {
            return Ok(false);
        }
        let reconciler = self.reconciler()?.clone();
        let cache = self.cache()?.clone();
        let handle = SyncScheduler::new(reconciler, cache, &self.config).spawn(self.shutdown.subscribe());
        *self.scheduler.lock() = Some(handle);
        Ok(true)
    }

    /// Initiate graceful shutdown.
    ///
    /// Stops new reconciliation triggers, lets an in-flight pass finish the
    /// batch it is writing, and waits for the scheduler to exit.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) {
        let started = Instant::now();
        info!("Initiating favorite engine shutdown");
        self.set_state(EngineState::ShuttingDown);
        self.shutdown.send_replace(true);

        let handle = self.scheduler.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Scheduler task ended abnormally");
            }
        }

        info!(elapsed_ms = started.elapsed().as_millis() as u64, "Favorite engine shutdown complete");
    }

    /// Probe both backends and collect engine state.
    pub async fn health_check(&self) -> HealthCheck {
        let state = self.state();

        let (cache_probe, archive_probe) = tokio::join!(
            async {
                match &self.cache {
                    Some(cache) => Some(timed(cache.ping()).await),
                    None => None,
                }
            },
            async {
                match &self.archive {
                    Some(archive) => Some(timed(archive.ping()).await),
                    None => None,
                }
            }
        );

        let pending_delta = match &self.cache {
            Some(cache) => cache.pending_delta().await.ok(),
            None => None,
        };

        let cache_connected = cache_probe.map(|(ok, _)| ok);
        let archive_connected = archive_probe.map(|(ok, _)| ok);
        if let Some(ok) = cache_connected {
            crate::metrics::set_backend_healthy("cache", ok);
        }
        if let Some(ok) = archive_connected {
            crate::metrics::set_backend_healthy("archive", ok);
        }

        let healthy = matches!(state, EngineState::Ready | EngineState::Running)
            && cache_connected == Some(true)
            && archive_connected == Some(true);

        HealthCheck {
            state,
            healthy,
            cache_connected,
            cache_latency_ms: cache_probe.and_then(|(ok, d)| ok.then(|| d.as_millis() as u64)),
            archive_connected,
            archive_latency_ms: archive_probe.and_then(|(ok, d)| ok.then(|| d.as_millis() as u64)),
            reconciling: self.reconciler.as_ref().is_some_and(|r| r.is_running()),
            pending_delta,
        }
    }
}

async fn timed(probe: impl std::future::Future<Output = Result<(), StorageError>>) -> (bool, Duration) {
    let started = Instant::now();
    let ok = probe.await.is_ok();
    (ok, started.elapsed())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::{InMemoryArchive, InMemoryFavoriteCache};

    fn in_memory(config: FavoriteEngineConfig) -> FavoriteEngine {
        FavoriteEngine::with_backends(
            config,
            Arc::new(InMemoryFavoriteCache::new()),
            Arc::new(InMemoryArchive::new()),
        )
    }

    #[tokio::test]
    async fn test_start_and_shutdown_transitions() {
        let mut engine = in_memory(FavoriteEngineConfig::default());
        assert_eq!(engine.state(), EngineState::Created);
        assert!(!engine.is_ready());

        engine.start().await.unwrap();
        assert_eq!(engine.state(), EngineState::Running);
        assert!(engine.is_ready());

        engine.shutdown().await;
        assert_eq!(engine.state(), EngineState::ShuttingDown);
        assert!(engine.scheduler.lock().is_none());
    }

    #[tokio::test]
    async fn test_second_start_keeps_single_scheduler() {
        let mut engine = in_memory(FavoriteEngineConfig::default());
        engine.start().await.unwrap();
        let first = engine.scheduler.lock().take();
        assert!(first.is_some());

        engine.start().await.unwrap();
        assert!(engine.scheduler.lock().is_none());
        assert_eq!(engine.state(), EngineState::Running);
        *engine.scheduler.lock() = first;

        engine.shutdown().await;
        let err = engine.start().await.unwrap_err();
        assert!(matches!(err, StorageError::Config(_)));
    }

    #[tokio::test]
    async fn test_no_triggers_stays_ready() {
        let config = FavoriteEngineConfig {
            sync_interval_mins: 0,
            sync_threshold: 0,
            ..Default::default()
        };
        let mut engine = in_memory(config);
        engine.start().await.unwrap();
        assert_eq!(engine.state(), EngineState::Ready);
        assert!(engine.scheduler.lock().is_none());
    }

    #[tokio::test]
    async fn test_start_without_redis_url_fails() {
        let mut engine = FavoriteEngine::new(FavoriteEngineConfig::default());
        let err = engine.start().await.unwrap_err();
        assert!(matches!(err, StorageError::Config(_)));
        assert_eq!(engine.state(), EngineState::Created);
    }

    #[tokio::test]
    async fn test_health_check_in_memory() {
        let mut engine = in_memory(FavoriteEngineConfig::default());
        engine.start().await.unwrap();

        let health = engine.health_check().await;
        assert!(health.healthy);
        assert_eq!(health.cache_connected, Some(true));
        assert_eq!(health.archive_connected, Some(true));
        assert_eq!(health.pending_delta, Some(0));
        assert!(!health.reconciling);

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_health_check_without_backends() {
        let engine = FavoriteEngine::new(FavoriteEngineConfig::default());
        let health = engine.health_check().await;
        assert!(!health.healthy);
        assert_eq!(health.cache_connected, None);
        assert_eq!(health.pending_delta, None);
    }
}
