//! Query and mutation API.
//!
//! Every call forwards to the cache; nothing here holds state of its own.

use std::collections::{BTreeSet, HashMap};

use tracing::{debug, warn};

use crate::domain::{now_secs, ActionType, BizKey, EdgeRecord, HistoryEntry};
use crate::metrics::{self, LatencyTimer};
use crate::reconcile::{ReconcileReport, Trigger};
use crate::storage::stream::{count_stream, CountStream};
use crate::storage::traits::StorageError;

use super::{ClientStatus, FavoriteEngine};

impl FavoriteEngine {
    /// Favorite or unfavorite one item.
    ///
    /// Fails with [`StorageError::AlreadyExists`] / [`StorageError::NotFound`]
    /// when the edge is already in the requested state. Never retried here.
    pub async fn favorite_action(
        &self,
        user_id: i64,
        biz: &str,
        biz_id: i64,
        action: ActionType,
    ) -> Result<(), StorageError> {
        let cache = self.cache()?;
        let result = {
            let _timer = LatencyTimer::new(match action {
                ActionType::Favorite => "create_favorite",
                ActionType::Unfavorite => "delete_favorite",
            });
            match action {
                ActionType::Favorite => cache.create_favorite(biz, biz_id, user_id).await,
                ActionType::Unfavorite => cache.delete_favorite(biz, biz_id, user_id).await,
            }
        };

        let status = ClientStatus::of(&result);
        metrics::record_action(action.as_str(), status.as_str());
        match &result {
            Ok(()) => self.mirror_edge(user_id, biz, biz_id, action).await,
            Err(e) if status == ClientStatus::Internal => {
                warn!(user_id, biz, biz_id, %action, error = %e, "Favorite action failed");
            }
            Err(e) => debug!(user_id, biz, biz_id, %action, error = %e, "Favorite action rejected"),
        }
        result
    }

    /// Best-effort copy of the edge into the archive's history table.
    async fn mirror_edge(&self, user_id: i64, biz: &str, biz_id: i64, action: ActionType) {
        if !self.config.archive_edges {
            return;
        }
        let Some(archive) = &self.archive else { return };
        let edge = EdgeRecord {
            user_id,
            key: BizKey::new(biz, biz_id),
            status: action.into(),
            updated_at: now_secs(),
        };
        if let Err(e) = archive.record_edge(&edge).await {
            warn!(user_id, biz, biz_id, error = %e, "Edge history write failed");
        }
    }

    /// Items the user currently favorites, ordered by `(biz, biz_id)`.
    pub async fn favorite_list(&self, user_id: i64) -> Result<Vec<BizKey>, StorageError> {
        Ok(self.user_favorite_elements(user_id).await?.into_iter().collect())
    }

    pub async fn favorite_count(&self, biz: &str, biz_id: i64) -> Result<i64, StorageError> {
        let _timer = LatencyTimer::new("favorite_count");
        self.cache()?.favorite_count(biz, biz_id).await
    }

    pub async fn is_favorite(&self, biz: &str, user_id: i64, biz_id: i64) -> Result<bool, StorageError> {
        let _timer = LatencyTimer::new("is_user_favorite");
        self.cache()?.is_user_favorite(biz, user_id, biz_id).await
    }

    pub async fn batch_is_favorite(
        &self,
        biz: &str,
        user_id: i64,
        biz_ids: &[i64],
    ) -> Result<HashMap<i64, bool>, StorageError> {
        let _timer = LatencyTimer::new("batch_is_user_favorite");
        self.cache()?.batch_is_user_favorite(biz, user_id, biz_ids).await
    }

    pub async fn user_favorite_count(&self, user_id: i64) -> Result<i64, StorageError> {
        let _timer = LatencyTimer::new("user_favorite_count");
        self.cache()?.user_favorite_count(user_id).await
    }

    pub async fn user_favorite_elements(&self, user_id: i64) -> Result<BTreeSet<BizKey>, StorageError> {
        let _timer = LatencyTimer::new("user_favorite_elements");
        self.cache()?.user_favorite_elements(user_id).await
    }

    /// Sum of favorite counts over `biz_ids`.
    pub async fn user_favorited_count(&self, biz: &str, biz_ids: &[i64]) -> Result<i64, StorageError> {
        let _timer = LatencyTimer::new("user_favorited_count");
        self.cache()?.user_favorited_count(biz, biz_ids).await
    }

    pub async fn top_favorite_content(&self, biz: &str, top_n: usize) -> Result<Vec<i64>, StorageError> {
        let _timer = LatencyTimer::new("top_favorite_content");
        self.cache()?.top_favorite_content(biz, top_n).await
    }

    pub async fn cleanup_user_history(&self, user_id: i64, retention_days: u32) -> Result<(), StorageError> {
        let _timer = LatencyTimer::new("cleanup_user_history");
        self.cache()?.cleanup_user_history(user_id, retention_days).await
    }

    pub async fn biz_favorite_users(&self, biz: &str, biz_id: i64) -> Result<BTreeSet<i64>, StorageError> {
        let _timer = LatencyTimer::new("biz_favorite_users");
        self.cache()?.biz_favorite_users(biz, biz_id).await
    }

    pub async fn user_recent_favorites(&self, user_id: i64, limit: usize) -> Result<Vec<HistoryEntry>, StorageError> {
        let _timer = LatencyTimer::new("user_recent_favorites");
        self.cache()?.user_recent_favorites(user_id, limit).await
    }

    pub async fn user_unfavorites(&self, user_id: i64) -> Result<Vec<HistoryEntry>, StorageError> {
        let _timer = LatencyTimer::new("user_unfavorites");
        self.cache()?.user_unfavorites(user_id).await
    }

    /// Archived edge history (populated when `archive_edges` is on).
    pub async fn edge_history(&self, user_id: i64) -> Result<Vec<EdgeRecord>, StorageError> {
        self.archive()?.edge_history(user_id).await
    }

    /// Lazy scan of every cached count, restarting from the beginning.
    pub fn stream_all_counts(&self) -> Result<CountStream, StorageError> {
        Ok(count_stream(self.cache()?.clone(), self.config.stream_batch_size))
    }

    /// Run one reconciliation pass now.
    ///
    /// Returns `Ok(None)` when a pass is already in flight; the request is
    /// dropped, not queued.
    pub async fn sync_counts(&self) -> Result<Option<ReconcileReport>, StorageError> {
        let reconciler = self.reconciler()?;
        let shutdown = self.shutdown.subscribe();
        reconciler.run_exclusive(Trigger::Manual, &shutdown).await.transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FavoriteEngineConfig;
    use crate::domain::{EdgeStatus, FavoriteCount};
    use crate::reconcile::PassOutcome;
    use crate::storage::memory::{InMemoryArchive, InMemoryFavoriteCache};
    use crate::storage::traits::CountArchive;
    use futures::TryStreamExt;
    use std::sync::Arc;

    fn engine_with(config: FavoriteEngineConfig) -> (FavoriteEngine, Arc<InMemoryArchive>) {
        let archive = Arc::new(InMemoryArchive::new());
        let engine = FavoriteEngine::with_backends(config, Arc::new(InMemoryFavoriteCache::new()), archive.clone());
        (engine, archive)
    }

    fn engine() -> (FavoriteEngine, Arc<InMemoryArchive>) {
        engine_with(FavoriteEngineConfig::default())
    }

    #[tokio::test]
    async fn test_action_then_queries() {
        let (engine, _) = engine();
        engine.favorite_action(1, "post", 42, ActionType::Favorite).await.unwrap();
        engine.favorite_action(2, "post", 42, ActionType::Favorite).await.unwrap();
        engine.favorite_action(1, "post", 7, ActionType::Favorite).await.unwrap();

        assert_eq!(engine.favorite_count("post", 42).await.unwrap(), 2);
        assert!(engine.is_favorite("post", 1, 42).await.unwrap());
        assert_eq!(engine.user_favorite_count(1).await.unwrap(), 2);
        assert_eq!(
            engine.favorite_list(1).await.unwrap(),
            vec![BizKey::new("post", 7), BizKey::new("post", 42)]
        );
        assert_eq!(engine.user_favorited_count("post", &[42, 7]).await.unwrap(), 3);
        assert_eq!(engine.top_favorite_content("post", 1).await.unwrap(), vec![42]);
        assert_eq!(engine.biz_favorite_users("post", 42).await.unwrap(), BTreeSet::from([1, 2]));
    }

    #[tokio::test]
    async fn test_action_errors_map_to_client_status() {
        let (engine, _) = engine();
        engine.favorite_action(1, "post", 42, ActionType::Favorite).await.unwrap();

        let dup = engine.favorite_action(1, "post", 42, ActionType::Favorite).await;
        assert_eq!(ClientStatus::of(&dup), ClientStatus::AlreadyExists);

        let missing = engine.favorite_action(1, "post", 99, ActionType::Unfavorite).await;
        assert_eq!(ClientStatus::of(&missing), ClientStatus::NotFound);
    }

    #[tokio::test]
    async fn test_unstarted_engine_reports_config_error() {
        let engine = FavoriteEngine::new(FavoriteEngineConfig::default());
        let err = engine.favorite_count("post", 1).await.unwrap_err();
        assert!(matches!(err, StorageError::Config(_)));
        assert!(engine.sync_counts().await.is_err());
    }

    #[tokio::test]
    async fn test_stream_all_counts() {
        let (engine, _) = engine();
        for biz_id in 0..5 {
            engine.favorite_action(1, "video", biz_id, ActionType::Favorite).await.unwrap();
        }
        let counts: Vec<FavoriteCount> = engine.stream_all_counts().unwrap().try_collect().await.unwrap();
        assert_eq!(counts.len(), 5);
        assert!(counts.iter().all(|c| c.count == 1));
    }

    #[tokio::test]
    async fn test_sync_counts_round_trip() {
        let (engine, archive) = engine();
        for user in 0..4 {
            engine.favorite_action(user, "post", 42, ActionType::Favorite).await.unwrap();
        }

        let report = engine.sync_counts().await.unwrap().unwrap();
        assert_eq!(report.outcome, PassOutcome::Completed);
        assert_eq!(report.trigger, Trigger::Manual);
        assert_eq!(archive.get_count("post", 42).await.unwrap().unwrap().count, 4);
    }

    #[tokio::test]
    async fn test_sync_counts_dropped_while_running() {
        let (engine, _) = engine();
        let _busy = engine.reconciler().unwrap().try_begin().unwrap();
        assert!(engine.sync_counts().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_edges_mirrored_when_enabled() {
        let (engine, archive) = engine_with(FavoriteEngineConfig {
            archive_edges: true,
            ..Default::default()
        });
        engine.favorite_action(5, "post", 1, ActionType::Favorite).await.unwrap();
        engine.favorite_action(5, "post", 1, ActionType::Unfavorite).await.unwrap();

        let history = engine.edge_history(5).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, EdgeStatus::Removed);
        assert!(archive.is_empty(), "edge mirroring must not touch counts");
    }

    #[tokio::test]
    async fn test_edges_not_mirrored_by_default() {
        let (engine, _) = engine();
        engine.favorite_action(5, "post", 1, ActionType::Favorite).await.unwrap();
        assert!(engine.edge_history(5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_history_queries() {
        let (engine, _) = engine();
        engine.favorite_action(3, "post", 1, ActionType::Favorite).await.unwrap();
        engine.favorite_action(3, "post", 1, ActionType::Unfavorite).await.unwrap();
        engine.favorite_action(3, "post", 2, ActionType::Favorite).await.unwrap();

        let recent = engine.user_recent_favorites(3, 10).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].key, BizKey::new("post", 2));

        let unfavorites = engine.user_unfavorites(3).await.unwrap();
        assert_eq!(unfavorites.len(), 1);

        engine.cleanup_user_history(3, 7).await.unwrap();
        assert_eq!(engine.user_unfavorites(3).await.unwrap().len(), 1);
    }
}
