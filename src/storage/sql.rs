// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL backend for durable favorite counts.
//!
//! Two tables, created on connect:
//! ```sql
//! CREATE TABLE favorite_counts (
//!   id BIGINT PRIMARY KEY AUTO_INCREMENT,
//!   biz VARCHAR(64) NOT NULL,
//!   biz_id BIGINT NOT NULL,
//!   count BIGINT NOT NULL DEFAULT 0,
//!   created_at BIGINT NOT NULL,   -- unix seconds
//!   updated_at BIGINT NOT NULL,
//!   UNIQUE (biz, biz_id)
//! )
//!
//! CREATE TABLE user_favorites (
//!   id BIGINT PRIMARY KEY AUTO_INCREMENT,
//!   user_id BIGINT NOT NULL,
//!   biz VARCHAR(64) NOT NULL,
//!   biz_id BIGINT NOT NULL,
//!   status BIGINT NOT NULL,       -- 1 active, 0 removed
//!   created_at BIGINT NOT NULL,
//!   updated_at BIGINT NOT NULL,
//!   UNIQUE (user_id, biz, biz_id)
//! )
//! ```
//!
//! `favorite_counts` is a mirror, not a ledger: upserts overwrite `count`.
//! Timestamps are stored as integers because the sqlx `Any` driver has no
//! portable datetime mapping.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Once;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::{any::AnyPoolOptions, AnyPool, Row};
use tracing::{debug, info};

use super::traits::{CountArchive, StorageError};
use crate::config::FavoriteEngineConfig;
use crate::domain::{now_secs, BizKey, EdgeRecord, EdgeStatus, FavoriteCount, PersistedCountRecord};
use crate::resilience::retry::{retry, RetryConfig};

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

pub struct SqlCountStore {
    pool: AnyPool,
    is_sqlite: bool,
    io_timeout: Duration,
}

impl SqlCountStore {
    /// Connect with startup-mode retry (fails fast if config is wrong) and
    /// create the schema.
    pub async fn connect(connection_string: &str, max_connections: u32) -> Result<Self, StorageError> {
        install_drivers();

        let is_sqlite = connection_string.starts_with("sqlite:");

        let pool = retry("sql_connect", &RetryConfig::startup(), || async {
            AnyPoolOptions::new()
                .max_connections(max_connections)
                .acquire_timeout(Duration::from_secs(10))
                .idle_timeout(Duration::from_secs(300))
                .connect(connection_string)
                .await
                .map_err(StorageError::from)
        })
        .await?;

        let store = Self {
            pool,
            is_sqlite,
            io_timeout: FavoriteEngineConfig::default().io_timeout(),
        };
        if is_sqlite {
            store.enable_wal_mode().await?;
        }
        store.init_schema().await?;

        info!(sqlite = is_sqlite, max_connections, "SQL count store ready");
        Ok(store)
    }

    /// Per-statement deadline for every call after connect.
    #[must_use]
    pub fn with_io_timeout(mut self, io_timeout: Duration) -> Self {
        self.io_timeout = io_timeout;
        self
    }

    /// Get a clone of the connection pool.
    pub fn pool(&self) -> AnyPool {
        self.pool.clone()
    }

    async fn enable_wal_mode(&self) -> Result<(), StorageError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::TransientIo(format!("Failed to enable WAL mode: {}", e)))?;
        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::TransientIo(format!("Failed to set synchronous mode: {}", e)))?;
        Ok(())
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        let statements: [&str; 2] = if self.is_sqlite {
            [
                r#"
                CREATE TABLE IF NOT EXISTS favorite_counts (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    biz TEXT NOT NULL,
                    biz_id INTEGER NOT NULL,
                    count INTEGER NOT NULL DEFAULT 0,
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL,
                    UNIQUE (biz, biz_id)
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS user_favorites (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    user_id INTEGER NOT NULL,
                    biz TEXT NOT NULL,
                    biz_id INTEGER NOT NULL,
                    status INTEGER NOT NULL,
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL,
                    UNIQUE (user_id, biz, biz_id)
                )
                "#,
            ]
        } else {
            [
                r#"
                CREATE TABLE IF NOT EXISTS favorite_counts (
                    id BIGINT PRIMARY KEY AUTO_INCREMENT,
                    biz VARCHAR(64) NOT NULL,
                    biz_id BIGINT NOT NULL,
                    count BIGINT NOT NULL DEFAULT 0,
                    created_at BIGINT NOT NULL,
                    updated_at BIGINT NOT NULL,
                    UNIQUE KEY uk_biz_item (biz, biz_id)
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS user_favorites (
                    id BIGINT PRIMARY KEY AUTO_INCREMENT,
                    user_id BIGINT NOT NULL,
                    biz VARCHAR(64) NOT NULL,
                    biz_id BIGINT NOT NULL,
                    status BIGINT NOT NULL,
                    created_at BIGINT NOT NULL,
                    updated_at BIGINT NOT NULL,
                    UNIQUE KEY uk_user_item (user_id, biz, biz_id),
                    INDEX idx_user (user_id)
                )
                "#,
            ]
        };

        for sql in statements {
            retry("sql_init_schema", &RetryConfig::startup(), || async {
                sqlx::query(sql).execute(&self.pool).await.map_err(StorageError::from)
            })
            .await?;
        }
        Ok(())
    }

    async fn bounded<T>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = Result<T, sqlx::Error>>,
    ) -> Result<T, StorageError> {
        tokio::time::timeout(self.io_timeout, fut)
            .await
            .map_err(|_| StorageError::deadline(operation))?
            .map_err(StorageError::from)
    }

    fn upsert_counts_sql(&self, rows: usize) -> String {
        let placeholders = vec!["(?, ?, ?, ?, ?)"; rows].join(", ");
        if self.is_sqlite {
            format!(
                "INSERT INTO favorite_counts (biz, biz_id, count, created_at, updated_at) VALUES {} \
                 ON CONFLICT(biz, biz_id) DO UPDATE SET \
                    count = excluded.count, \
                    updated_at = excluded.updated_at",
                placeholders
            )
        } else {
            format!(
                "INSERT INTO favorite_counts (biz, biz_id, count, created_at, updated_at) VALUES {} \
                 ON DUPLICATE KEY UPDATE \
                    count = VALUES(count), \
                    updated_at = VALUES(updated_at)",
                placeholders
            )
        }
    }

    fn record_edge_sql(&self) -> &'static str {
        if self.is_sqlite {
            "INSERT INTO user_favorites (user_id, biz, biz_id, status, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?) \
             ON CONFLICT(user_id, biz, biz_id) DO UPDATE SET \
                status = excluded.status, \
                updated_at = excluded.updated_at"
        } else {
            "INSERT INTO user_favorites (user_id, biz, biz_id, status, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?) \
             ON DUPLICATE KEY UPDATE \
                status = VALUES(status), \
                updated_at = VALUES(updated_at)"
        }
    }
}

/// Collapse repeated keys so one statement never touches a row twice.
/// The last value for a key wins; first-seen order is kept.
fn dedup_last_wins(counts: &[FavoriteCount]) -> Vec<FavoriteCount> {
    let mut index: HashMap<BizKey, usize> = HashMap::with_capacity(counts.len());
    let mut rows: Vec<FavoriteCount> = Vec::with_capacity(counts.len());
    for c in counts {
        match index.get(&c.key()) {
            Some(&i) => rows[i].count = c.count,
            None => {
                index.insert(c.key(), rows.len());
                rows.push(c.clone());
            }
        }
    }
    rows
}

#[async_trait]
impl CountArchive for SqlCountStore {
    /// One multi-row statement per call, so the batch commits atomically.
    async fn upsert_counts(&self, counts: &[FavoriteCount]) -> Result<usize, StorageError> {
        if counts.is_empty() {
            return Ok(0);
        }
        let rows = dedup_last_wins(counts);
        let sql = self.upsert_counts_sql(rows.len());
        let now = now_secs();

        retry("sql_upsert_counts", &RetryConfig::batch_write(), || {
            let sql = &sql;
            let rows = &rows;
            async move {
                let mut query = sqlx::query(sql);
                for row in rows {
                    query = query.bind(row.biz.clone()).bind(row.biz_id).bind(row.count).bind(now).bind(now);
                }
                self.bounded("sql_upsert_counts", query.execute(&self.pool)).await
            }
        })
        .await?;

        debug!(rows = rows.len(), "Upserted favorite counts");
        Ok(counts.len())
    }

    async fn get_count(&self, biz: &str, biz_id: i64) -> Result<Option<PersistedCountRecord>, StorageError> {
        let row = retry("sql_get_count", &RetryConfig::query(), || async {
            let query = sqlx::query(
                "SELECT id, biz, biz_id, count, created_at, updated_at FROM favorite_counts WHERE biz = ? AND biz_id = ?",
            )
            .bind(biz)
            .bind(biz_id);
            self.bounded("sql_get_count", query.fetch_optional(&self.pool)).await
        })
        .await?;

        row.map(|row| -> Result<PersistedCountRecord, sqlx::Error> {
            Ok(PersistedCountRecord {
                id: row.try_get("id")?,
                biz: row.try_get("biz")?,
                biz_id: row.try_get("biz_id")?,
                count: row.try_get("count")?,
                created_at: row.try_get("created_at")?,
                updated_at: row.try_get("updated_at")?,
            })
        })
        .transpose()
        .map_err(StorageError::from)
    }

    async fn count_rows(&self) -> Result<u64, StorageError> {
        let count: i64 = retry("sql_count_rows", &RetryConfig::query(), || async {
            let query = sqlx::query("SELECT COUNT(*) AS cnt FROM favorite_counts");
            let row = self.bounded("sql_count_rows", query.fetch_one(&self.pool)).await?;
            row.try_get::<i64, _>("cnt").map_err(StorageError::from)
        })
        .await?;
        Ok(count.max(0) as u64)
    }

    async fn record_edge(&self, edge: &EdgeRecord) -> Result<(), StorageError> {
        let sql = self.record_edge_sql();
        retry("sql_record_edge", &RetryConfig::query(), || async {
            let query = sqlx::query(sql)
                .bind(edge.user_id)
                .bind(edge.key.biz.as_str())
                .bind(edge.key.biz_id)
                .bind(edge.status.code())
                .bind(edge.updated_at)
                .bind(edge.updated_at);
            self.bounded("sql_record_edge", query.execute(&self.pool)).await
        })
        .await?;
        Ok(())
    }

    async fn edge_history(&self, user_id: i64) -> Result<Vec<EdgeRecord>, StorageError> {
        let rows = retry("sql_edge_history", &RetryConfig::query(), || async {
            let query = sqlx::query(
                "SELECT user_id, biz, biz_id, status, updated_at FROM user_favorites WHERE user_id = ? ORDER BY biz, biz_id",
            )
            .bind(user_id);
            self.bounded("sql_edge_history", query.fetch_all(&self.pool)).await
        })
        .await?;

        rows.iter()
            .map(|row| {
                let biz: String = row.try_get("biz")?;
                let status: i64 = row.try_get("status")?;
                Ok(EdgeRecord {
                    user_id: row.try_get("user_id")?,
                    key: BizKey::new(biz, row.try_get("biz_id")?),
                    status: EdgeStatus::from_code(status),
                    updated_at: row.try_get("updated_at")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(StorageError::from)
    }

    async fn ping(&self) -> Result<(), StorageError> {
        self.bounded("sql_ping", sqlx::query("SELECT 1").execute(&self.pool)).await?;
        Ok(())
    }
}
