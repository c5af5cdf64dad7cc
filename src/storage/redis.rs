//! Redis backend for the favorite cache.
//!
//! Key layout (all keys carry the optional prefix):
//!
//! ```text
//! favorite:counts:{biz}            HASH   biz_id -> count (0 kept)
//! favorite:rank:{biz}              ZSET   biz_id scored by count (> 0 only)
//! favorite:user:{uid}              ZSET   "{biz}:{biz_id}" scored by favorite time
//! favorite:biz:{biz}:{biz_id}:users SET   user ids
//! favorite:biz:types               SET    every biz ever favorited
//! unfavorite:user:{uid}            ZSET   "{biz}:{biz_id}" scored by unfavorite time, EXPIRE ttl
//! favorite:pending                 STRING mutations since the last reconciliation
//! ```
//!
//! Create and delete run as Lua scripts, so the membership check and every
//! index update happen in one server-side step.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::{cmd, pipe, AsyncCommands, Client, RedisResult, Script};
use tracing::debug;

use super::traits::{FavoriteCache, ScanCursor, ScanPage, StorageError};
use crate::config::FavoriteEngineConfig;
use crate::domain::{now_secs, BizKey, FavoriteCount, HistoryEntry};
use crate::resilience::retry::{retry, RetryConfig};

const SECS_PER_DAY: i64 = 24 * 60 * 60;

/// KEYS: user zset, count hash, rank zset, item users, biz types, pending
/// ARGV: member, biz_id, user_id, now, biz
const CREATE_FAVORITE_LUA: &str = r"
if redis.call('ZSCORE', KEYS[1], ARGV[1]) then
    return 0
end
redis.call('ZADD', KEYS[1], ARGV[4], ARGV[1])
local count = redis.call('HINCRBY', KEYS[2], ARGV[2], 1)
redis.call('ZADD', KEYS[3], count, ARGV[2])
redis.call('SADD', KEYS[4], ARGV[3])
redis.call('SADD', KEYS[5], ARGV[5])
redis.call('INCR', KEYS[6])
return 1
";

/// KEYS: user zset, count hash, rank zset, item users, pending, unfavorite zset
/// ARGV: member, biz_id, user_id, now, history ttl secs
const DELETE_FAVORITE_LUA: &str = r"
if not redis.call('ZSCORE', KEYS[1], ARGV[1]) then
    return 0
end
redis.call('ZREM', KEYS[1], ARGV[1])
local count = redis.call('HINCRBY', KEYS[2], ARGV[2], -1)
if count <= 0 then
    redis.call('HSET', KEYS[2], ARGV[2], 0)
    redis.call('ZREM', KEYS[3], ARGV[2])
else
    redis.call('ZADD', KEYS[3], count, ARGV[2])
end
redis.call('SREM', KEYS[4], ARGV[3])
redis.call('ZADD', KEYS[6], ARGV[4], ARGV[1])
redis.call('EXPIRE', KEYS[6], ARGV[5])
redis.call('INCR', KEYS[5])
return 1
";

pub struct RedisFavoriteCache {
    connection: ConnectionManager,
    /// Optional key prefix for namespacing (e.g., "myapp:")
    prefix: String,
    io_timeout: Duration,
    history_ttl_secs: i64,
    create_script: Script,
    delete_script: Script,
}

impl RedisFavoriteCache {
    /// Connect using `redis_url`, `redis_prefix`, `io_timeout_ms` and
    /// `history_ttl_days` from the config.
    ///
    /// ```rust,no_run
    /// # use favorite_engine::{FavoriteEngineConfig, RedisFavoriteCache};
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let config = FavoriteEngineConfig {
    ///     redis_url: Some("redis://localhost:6379".into()),
    ///     redis_prefix: Some("myapp:".into()),
    ///     ..Default::default()
    /// };
    /// let cache = RedisFavoriteCache::connect(&config).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn connect(config: &FavoriteEngineConfig) -> Result<Self, StorageError> {
        let url = config
            .redis_url
            .as_deref()
            .ok_or_else(|| StorageError::Config("redis_url is not set".into()))?;
        let client = Client::open(url).map_err(|e| StorageError::Config(e.to_string()))?;
        let io_timeout = config.io_timeout();

        let connection = retry("redis_connect", &RetryConfig::startup(), || {
            let client = client.clone();
            async move {
                let manager_config = ConnectionManagerConfig::new()
                    .set_connection_timeout(io_timeout)
                    .set_response_timeout(io_timeout);
                ConnectionManager::new_with_config(client, manager_config)
                    .await
                    .map_err(StorageError::from)
            }
        })
        .await?;

        Ok(Self {
            connection,
            prefix: config.redis_prefix.clone().unwrap_or_default(),
            io_timeout,
            history_ttl_secs: i64::from(config.history_ttl_days) * SECS_PER_DAY,
            create_script: Script::new(CREATE_FAVORITE_LUA),
            delete_script: Script::new(DELETE_FAVORITE_LUA),
        })
    }

    /// Get the configured prefix
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    #[inline]
    fn prefixed_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    fn counts_key(&self, biz: &str) -> String {
        self.prefixed_key(&format!("favorite:counts:{}", biz))
    }

    fn rank_key(&self, biz: &str) -> String {
        self.prefixed_key(&format!("favorite:rank:{}", biz))
    }

    fn user_key(&self, user_id: i64) -> String {
        self.prefixed_key(&format!("favorite:user:{}", user_id))
    }

    fn item_users_key(&self, biz: &str, biz_id: i64) -> String {
        self.prefixed_key(&format!("favorite:biz:{}:{}:users", biz, biz_id))
    }

    fn biz_types_key(&self) -> String {
        self.prefixed_key("favorite:biz:types")
    }

    fn unfavorite_key(&self, user_id: i64) -> String {
        self.prefixed_key(&format!("unfavorite:user:{}", user_id))
    }

    fn pending_key(&self) -> String {
        self.prefixed_key("favorite:pending")
    }

    /// Idempotent call: each attempt is deadline-bounded, transient failures retry.
    async fn read<T, F, Fut>(&self, operation: &'static str, mut op: F) -> Result<T, StorageError>
    where
        F: FnMut(ConnectionManager) -> Fut,
        Fut: Future<Output = RedisResult<T>>,
    {
        let timeout = self.io_timeout;
        retry(operation, &RetryConfig::query(), || {
            let fut = op(self.connection.clone());
            async move {
                tokio::time::timeout(timeout, fut)
                    .await
                    .map_err(|_| StorageError::deadline(operation))?
                    .map_err(StorageError::from)
            }
        })
        .await
    }

    /// Non-idempotent call: one deadline-bounded attempt.
    async fn write_once<T>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = RedisResult<T>>,
    ) -> Result<T, StorageError> {
        tokio::time::timeout(self.io_timeout, fut)
            .await
            .map_err(|_| StorageError::deadline(operation))?
            .map_err(StorageError::from)
    }

    async fn hscan_page(&self, biz: &str, position: u64, count: usize) -> Result<(u64, Vec<FavoriteCount>), StorageError> {
        let key = self.counts_key(biz);
        let (next, flat): (u64, Vec<String>) = self
            .read("redis_hscan", |mut conn| {
                let key = key.clone();
                async move {
                    cmd("HSCAN")
                        .arg(&key)
                        .arg(position)
                        .arg("COUNT")
                        .arg(count)
                        .query_async(&mut conn)
                        .await
                }
            })
            .await?;
        Ok((next, parse_hscan_fields(biz, &flat)))
    }
}

/// Turn a flat `[field, value, field, value, ...]` reply into counts.
/// Unparseable fields are skipped.
fn parse_hscan_fields(biz: &str, flat: &[String]) -> Vec<FavoriteCount> {
    flat.chunks_exact(2)
        .filter_map(|pair| {
            let biz_id = pair[0].parse().ok()?;
            let count = pair[1].parse().ok()?;
            Some(FavoriteCount::new(biz, biz_id, count))
        })
        .collect()
}

fn history_from_scores(scored: Vec<(String, f64)>) -> Vec<HistoryEntry> {
    scored
        .into_iter()
        .filter_map(|(member, at)| {
            BizKey::parse_member(&member).map(|key| HistoryEntry { key, at: at as i64 })
        })
        .collect()
}

#[async_trait]
impl FavoriteCache for RedisFavoriteCache {
    async fn create_favorite(&self, biz: &str, biz_id: i64, user_id: i64) -> Result<(), StorageError> {
        let mut conn = self.connection.clone();
        let mut invocation = self.create_script.prepare_invoke();
        invocation
            .key(self.user_key(user_id))
            .key(self.counts_key(biz))
            .key(self.rank_key(biz))
            .key(self.item_users_key(biz, biz_id))
            .key(self.biz_types_key())
            .key(self.pending_key())
            .arg(BizKey::new(biz, biz_id).member())
            .arg(biz_id)
            .arg(user_id)
            .arg(now_secs())
            .arg(biz);

        let created: i64 = self
            .write_once("redis_create_favorite", invocation.invoke_async(&mut conn))
            .await?;
        if created == 0 {
            return Err(StorageError::AlreadyExists);
        }
        debug!(biz, biz_id, user_id, "Favorite created");
        Ok(())
    }

    async fn delete_favorite(&self, biz: &str, biz_id: i64, user_id: i64) -> Result<(), StorageError> {
        let mut conn = self.connection.clone();
        let mut invocation = self.delete_script.prepare_invoke();
        invocation
            .key(self.user_key(user_id))
            .key(self.counts_key(biz))
            .key(self.rank_key(biz))
            .key(self.item_users_key(biz, biz_id))
            .key(self.pending_key())
            .key(self.unfavorite_key(user_id))
            .arg(BizKey::new(biz, biz_id).member())
            .arg(biz_id)
            .arg(user_id)
            .arg(now_secs())
            .arg(self.history_ttl_secs);

        let deleted: i64 = self
            .write_once("redis_delete_favorite", invocation.invoke_async(&mut conn))
            .await?;
        if deleted == 0 {
            return Err(StorageError::NotFound);
        }
        debug!(biz, biz_id, user_id, "Favorite deleted");
        Ok(())
    }

    async fn favorite_count(&self, biz: &str, biz_id: i64) -> Result<i64, StorageError> {
        let key = self.counts_key(biz);
        let count: Option<i64> = self
            .read("redis_favorite_count", |mut conn| {
                let key = key.clone();
                async move { conn.hget(&key, biz_id).await }
            })
            .await?;
        Ok(count.unwrap_or(0))
    }

    async fn is_user_favorite(&self, biz: &str, user_id: i64, biz_id: i64) -> Result<bool, StorageError> {
        let key = self.user_key(user_id);
        let member = BizKey::new(biz, biz_id).member();
        let score: Option<f64> = self
            .read("redis_is_user_favorite", |mut conn| {
                let key = key.clone();
                let member = member.clone();
                async move { conn.zscore(&key, &member).await }
            })
            .await?;
        Ok(score.is_some())
    }

    /// One pipelined round trip of ZSCOREs.
    async fn batch_is_user_favorite(
        &self,
        biz: &str,
        user_id: i64,
        biz_ids: &[i64],
    ) -> Result<HashMap<i64, bool>, StorageError> {
        if biz_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let key = self.user_key(user_id);
        let members: Vec<String> = biz_ids.iter().map(|&id| BizKey::new(biz, id).member()).collect();

        let scores: Vec<Option<f64>> = self
            .read("redis_batch_is_user_favorite", |mut conn| {
                let key = key.clone();
                let members = members.clone();
                async move {
                    let mut pipeline = pipe();
                    for member in &members {
                        pipeline.zscore(&key, member);
                    }
                    pipeline.query_async(&mut conn).await
                }
            })
            .await?;

        Ok(biz_ids.iter().copied().zip(scores.into_iter().map(|s| s.is_some())).collect())
    }

    async fn user_favorite_count(&self, user_id: i64) -> Result<i64, StorageError> {
        let key = self.user_key(user_id);
        self.read("redis_user_favorite_count", |mut conn| {
            let key = key.clone();
            async move { conn.zcard(&key).await }
        })
        .await
    }

    async fn user_favorite_elements(&self, user_id: i64) -> Result<BTreeSet<BizKey>, StorageError> {
        let key = self.user_key(user_id);
        let members: Vec<String> = self
            .read("redis_user_favorite_elements", |mut conn| {
                let key = key.clone();
                async move { conn.zrange(&key, 0, -1).await }
            })
            .await?;
        Ok(members.iter().filter_map(|m| BizKey::parse_member(m)).collect())
    }

    /// Single HMGET over the biz count table.
    async fn user_favorited_count(&self, biz: &str, biz_ids: &[i64]) -> Result<i64, StorageError> {
        if biz_ids.is_empty() {
            return Ok(0);
        }
        let key = self.counts_key(biz);
        let counts: Vec<Option<i64>> = self
            .read("redis_user_favorited_count", |mut conn| {
                let key = key.clone();
                async move { cmd("HMGET").arg(&key).arg(biz_ids).query_async(&mut conn).await }
            })
            .await?;
        Ok(counts.into_iter().flatten().sum())
    }

    async fn top_favorite_content(&self, biz: &str, top_n: usize) -> Result<Vec<i64>, StorageError> {
        if top_n == 0 {
            return Ok(Vec::new());
        }
        let key = self.rank_key(biz);
        let stop = isize::try_from(top_n - 1).unwrap_or(isize::MAX);
        self.read("redis_top_favorite_content", |mut conn| {
            let key = key.clone();
            async move { conn.zrevrange(&key, 0, stop).await }
        })
        .await
    }

    async fn cleanup_user_history(&self, user_id: i64, retention_days: u32) -> Result<(), StorageError> {
        let key = self.unfavorite_key(user_id);
        let cutoff = now_secs() - i64::from(retention_days) * SECS_PER_DAY;
        let removed: i64 = self
            .read("redis_cleanup_user_history", |mut conn| {
                let key = key.clone();
                async move { conn.zrembyscore(&key, "-inf", cutoff).await }
            })
            .await?;
        debug!(user_id, retention_days, removed, "Unfavorite history cleaned");
        Ok(())
    }

    /// Walks biz types in sorted order, HSCANning each count table.
    ///
    /// `COUNT` is a hint, so a page may hold slightly more than `count`
    /// entries, or none while the cursor is still live.
    async fn scan_counts(&self, cursor: &ScanCursor, count: usize) -> Result<ScanPage, StorageError> {
        let types_key = self.biz_types_key();
        let mut biz_types: Vec<String> = self
            .read("redis_biz_types", |mut conn| {
                let key = types_key.clone();
                async move { conn.smembers(&key).await }
            })
            .await?;
        biz_types.sort();

        let mut biz = match (&cursor.biz, biz_types.first()) {
            (Some(biz), _) => biz.clone(),
            (None, Some(first)) => first.clone(),
            (None, None) => return Ok(ScanPage::default()),
        };
        let mut position = cursor.position;

        loop {
            let (next, entries) = self.hscan_page(&biz, position, count.max(1)).await?;
            if next != 0 {
                return Ok(ScanPage { entries, next: Some(ScanCursor::at(biz, next)) });
            }

            let following = biz_types.iter().find(|t| t.as_str() > biz.as_str()).cloned();
            match following {
                Some(next_biz) if entries.is_empty() => {
                    biz = next_biz;
                    position = 0;
                }
                Some(next_biz) => {
                    return Ok(ScanPage { entries, next: Some(ScanCursor::at(next_biz, 0)) });
                }
                None => return Ok(ScanPage { entries, next: None }),
            }
        }
    }

    async fn biz_favorite_users(&self, biz: &str, biz_id: i64) -> Result<BTreeSet<i64>, StorageError> {
        let key = self.item_users_key(biz, biz_id);
        self.read("redis_biz_favorite_users", |mut conn| {
            let key = key.clone();
            async move { conn.smembers(&key).await }
        })
        .await
    }

    async fn user_recent_favorites(&self, user_id: i64, limit: usize) -> Result<Vec<HistoryEntry>, StorageError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let key = self.user_key(user_id);
        let stop = isize::try_from(limit - 1).unwrap_or(isize::MAX);
        let scored: Vec<(String, f64)> = self
            .read("redis_user_recent_favorites", |mut conn| {
                let key = key.clone();
                async move { conn.zrevrange_withscores(&key, 0, stop).await }
            })
            .await?;
        Ok(history_from_scores(scored))
    }

    async fn user_unfavorites(&self, user_id: i64) -> Result<Vec<HistoryEntry>, StorageError> {
        let key = self.unfavorite_key(user_id);
        let scored: Vec<(String, f64)> = self
            .read("redis_user_unfavorites", |mut conn| {
                let key = key.clone();
                async move { conn.zrevrange_withscores(&key, 0, -1).await }
            })
            .await?;
        Ok(history_from_scores(scored))
    }

    async fn pending_delta(&self) -> Result<u64, StorageError> {
        let key = self.pending_key();
        let delta: Option<u64> = self
            .read("redis_pending_delta", |mut conn| {
                let key = key.clone();
                async move { conn.get(&key).await }
            })
            .await?;
        Ok(delta.unwrap_or(0))
    }

    async fn take_pending_delta(&self) -> Result<u64, StorageError> {
        let mut conn = self.connection.clone();
        let key = self.pending_key();
        let delta: Option<u64> = self
            .write_once("redis_take_pending_delta", cmd("GETDEL").arg(&key).query_async(&mut conn))
            .await?;
        Ok(delta.unwrap_or(0))
    }

    async fn restore_pending_delta(&self, delta: u64) -> Result<(), StorageError> {
        let mut conn = self.connection.clone();
        let key = self.pending_key();
        let _: i64 = self
            .write_once("redis_restore_pending_delta", conn.incr(&key, delta))
            .await?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), StorageError> {
        self.read("redis_ping", |mut conn| async move {
            let _: String = cmd("PING").query_async(&mut conn).await?;
            Ok::<_, redis::RedisError>(())
        })
        .await
    }
}
