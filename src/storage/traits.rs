use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{BizKey, EdgeRecord, FavoriteCount, HistoryEntry, PersistedCountRecord};

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("favorite already exists")]
    AlreadyExists,
    #[error("favorite not found")]
    NotFound,
    #[error("transient backend failure: {0}")]
    TransientIo(String),
    #[error("batch write failed after {committed} committed rows: {reason}")]
    BatchWriteFailure {
        committed: usize,
        reason: String,
    },
    #[error("configuration error: {0}")]
    Config(String),
}

impl StorageError {
    /// Whether the failure is worth retrying for an idempotent call.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientIo(_))
    }

    pub(crate) fn deadline(operation: &str) -> Self {
        Self::TransientIo(format!("{} exceeded its deadline", operation))
    }
}

impl From<redis::RedisError> for StorageError {
    fn from(e: redis::RedisError) -> Self {
        Self::TransientIo(e.to_string())
    }
}

impl From<sqlx::Error> for StorageError {
    fn from(e: sqlx::Error) -> Self {
        Self::TransientIo(e.to_string())
    }
}

/// Position inside a full count-table scan.
///
/// `biz == None` means "before the first biz type". Backends interpret
/// `position` themselves (Redis: HSCAN cursor, in-process: offset).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanCursor {
    pub biz: Option<String>,
    pub position: u64,
}

impl ScanCursor {
    #[must_use]
    pub fn start() -> Self {
        Self::default()
    }

    pub fn at(biz: impl Into<String>, position: u64) -> Self {
        Self { biz: Some(biz.into()), position }
    }
}

/// One page of a count-table scan. `next == None` means the scan is exhausted.
#[derive(Debug, Clone, Default)]
pub struct ScanPage {
    pub entries: Vec<FavoriteCount>,
    pub next: Option<ScanCursor>,
}

/// Live favorite state: edges, counts, rankings and history.
///
/// `create_favorite` and `delete_favorite` are each one indivisible step:
/// the membership check and every index update commit together or not at all.
#[async_trait]
pub trait FavoriteCache: Send + Sync {
    async fn create_favorite(&self, biz: &str, biz_id: i64, user_id: i64) -> Result<(), StorageError>;
    async fn delete_favorite(&self, biz: &str, biz_id: i64, user_id: i64) -> Result<(), StorageError>;

    /// Missing items count as 0.
    async fn favorite_count(&self, biz: &str, biz_id: i64) -> Result<i64, StorageError>;
    async fn is_user_favorite(&self, biz: &str, user_id: i64, biz_id: i64) -> Result<bool, StorageError>;

    /// Membership for many items at once.
    /// Default implementation falls back to sequential checks.
    async fn batch_is_user_favorite(
        &self,
        biz: &str,
        user_id: i64,
        biz_ids: &[i64],
    ) -> Result<HashMap<i64, bool>, StorageError> {
        let mut result = HashMap::with_capacity(biz_ids.len());
        for &biz_id in biz_ids {
            result.insert(biz_id, self.is_user_favorite(biz, user_id, biz_id).await?);
        }
        Ok(result)
    }

    async fn user_favorite_count(&self, user_id: i64) -> Result<i64, StorageError>;
    async fn user_favorite_elements(&self, user_id: i64) -> Result<BTreeSet<BizKey>, StorageError>;

    /// Sum of favorite counts over `biz_ids`.
    /// Default implementation falls back to sequential lookups.
    async fn user_favorited_count(&self, biz: &str, biz_ids: &[i64]) -> Result<i64, StorageError> {
        let mut total = 0;
        for &biz_id in biz_ids {
            total += self.favorite_count(biz, biz_id).await?;
        }
        Ok(total)
    }

    /// Highest counts first. Zero-count items are never ranked.
    async fn top_favorite_content(&self, biz: &str, top_n: usize) -> Result<Vec<i64>, StorageError>;

    /// Drop unfavorite history older than `retention_days`.
    async fn cleanup_user_history(&self, user_id: i64, retention_days: u32) -> Result<(), StorageError>;

    /// Fetch one page of the count table. See [`crate::storage::stream`].
    async fn scan_counts(&self, cursor: &ScanCursor, count: usize) -> Result<ScanPage, StorageError>;

    async fn biz_favorite_users(&self, biz: &str, biz_id: i64) -> Result<BTreeSet<i64>, StorageError>;

    /// Most recent favorites first.
    async fn user_recent_favorites(&self, user_id: i64, limit: usize) -> Result<Vec<HistoryEntry>, StorageError>;
    async fn user_unfavorites(&self, user_id: i64) -> Result<Vec<HistoryEntry>, StorageError>;

    /// Mutations committed since the last [`take_pending_delta`](Self::take_pending_delta).
    async fn pending_delta(&self) -> Result<u64, StorageError>;

    /// Read and reset the pending delta in one step.
    async fn take_pending_delta(&self) -> Result<u64, StorageError>;

    /// Add back a delta taken by a pass that did not complete.
    async fn restore_pending_delta(&self, delta: u64) -> Result<(), StorageError>;

    async fn ping(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

/// Durable mirror of aggregate counts plus the optional edge history.
#[async_trait]
pub trait CountArchive: Send + Sync {
    /// Insert-or-overwrite keyed on `(biz, biz_id)`. The whole slice commits
    /// atomically. Returns the number of rows written.
    async fn upsert_counts(&self, counts: &[FavoriteCount]) -> Result<usize, StorageError>;

    async fn get_count(&self, biz: &str, biz_id: i64) -> Result<Option<PersistedCountRecord>, StorageError>;

    async fn count_rows(&self) -> Result<u64, StorageError>;

    /// Insert-or-overwrite keyed on `(user_id, biz, biz_id)`.
    async fn record_edge(&self, edge: &EdgeRecord) -> Result<(), StorageError>;

    async fn edge_history(&self, user_id: i64) -> Result<Vec<EdgeRecord>, StorageError>;

    async fn ping(&self) -> Result<(), StorageError> {
        Ok(())
    }
}
