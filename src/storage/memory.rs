//! In-process backends.
//!
//! [`InMemoryFavoriteCache`] keeps the same indexes as the Redis layout behind
//! one mutex, so every create/delete is a single critical section.
//! [`InMemoryArchive`] stands in for the SQL store in tests and local runs.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use super::traits::{CountArchive, FavoriteCache, ScanCursor, ScanPage, StorageError};
use crate::domain::{now_secs, BizKey, EdgeRecord, FavoriteCount, HistoryEntry, PersistedCountRecord};

const SECS_PER_DAY: i64 = 24 * 60 * 60;

type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

#[derive(Default)]
struct CacheState {
    biz_types: BTreeSet<String>,
    /// biz -> biz_id -> count (zero counts are kept)
    counts: BTreeMap<String, BTreeMap<i64, i64>>,
    /// biz -> (count desc, biz_id asc), positive counts only
    rankings: HashMap<String, BTreeSet<(Reverse<i64>, i64)>>,
    item_users: HashMap<BizKey, BTreeSet<i64>>,
    /// user -> key -> favorited at
    user_favorites: HashMap<i64, HashMap<BizKey, i64>>,
    /// user -> key -> last unfavorited at
    user_unfavorites: HashMap<i64, HashMap<BizKey, i64>>,
    unfavorite_expires_at: HashMap<i64, i64>,
    pending_delta: u64,
}

impl CacheState {
    fn rerank(&mut self, biz: &str, biz_id: i64, old: i64, new: i64) {
        let ranking = self.rankings.entry(biz.to_string()).or_default();
        ranking.remove(&(Reverse(old), biz_id));
        if new > 0 {
            ranking.insert((Reverse(new), biz_id));
        }
    }

    fn live_unfavorites(&self, user_id: i64, now: i64) -> Option<&HashMap<BizKey, i64>> {
        match self.unfavorite_expires_at.get(&user_id) {
            Some(&expires_at) if expires_at <= now => None,
            _ => self.user_unfavorites.get(&user_id),
        }
    }
}

pub struct InMemoryFavoriteCache {
    state: Mutex<CacheState>,
    history_ttl_secs: i64,
    clock: Clock,
}

impl InMemoryFavoriteCache {
    #[must_use]
    pub fn new() -> Self {
        Self::with_history_ttl_days(7)
    }

    #[must_use]
    pub fn with_history_ttl_days(days: u32) -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            history_ttl_secs: i64::from(days) * SECS_PER_DAY,
            clock: Arc::new(now_secs),
        }
    }

    /// Replace the wall clock (unix seconds).
    #[must_use]
    pub fn with_clock(mut self, clock: impl Fn() -> i64 + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Number of `(biz, biz_id)` entries in the count table.
    #[must_use]
    pub fn count_entries(&self) -> usize {
        self.state.lock().counts.values().map(BTreeMap::len).sum()
    }

    /// Overwrite a count directly, bypassing edges (seeding and tests).
    pub fn seed_count(&self, biz: &str, biz_id: i64, count: i64) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.biz_types.insert(biz.to_string());
        let slot = state.counts.entry(biz.to_string()).or_default().entry(biz_id).or_insert(0);
        let old = *slot;
        *slot = count;
        state.rerank(biz, biz_id, old, count);
    }

    fn now(&self) -> i64 {
        (self.clock)()
    }
}

impl Default for InMemoryFavoriteCache {
    fn default() -> Self {
        Self::new()
    }
}

fn sorted_history(entries: &HashMap<BizKey, i64>) -> Vec<HistoryEntry> {
    let mut history: Vec<HistoryEntry> = entries
        .iter()
        .map(|(key, &at)| HistoryEntry { key: key.clone(), at })
        .collect();
    history.sort_by(|a, b| b.at.cmp(&a.at).then_with(|| a.key.cmp(&b.key)));
    history
}

#[async_trait]
impl FavoriteCache for InMemoryFavoriteCache {
    async fn create_favorite(&self, biz: &str, biz_id: i64, user_id: i64) -> Result<(), StorageError> {
        let now = self.now();
        let key = BizKey::new(biz, biz_id);
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let favorites = state.user_favorites.entry(user_id).or_default();
        if favorites.contains_key(&key) {
            return Err(StorageError::AlreadyExists);
        }
        favorites.insert(key.clone(), now);

        state.biz_types.insert(biz.to_string());
        let slot = state.counts.entry(biz.to_string()).or_default().entry(biz_id).or_insert(0);
        *slot += 1;
        let new = *slot;
        state.rerank(biz, biz_id, new - 1, new);
        state.item_users.entry(key).or_default().insert(user_id);
        state.pending_delta += 1;
        Ok(())
    }

    async fn delete_favorite(&self, biz: &str, biz_id: i64, user_id: i64) -> Result<(), StorageError> {
        let now = self.now();
        let key = BizKey::new(biz, biz_id);
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let removed = state
            .user_favorites
            .get_mut(&user_id)
            .and_then(|favorites| favorites.remove(&key));
        if removed.is_none() {
            return Err(StorageError::NotFound);
        }

        let slot = state.counts.entry(biz.to_string()).or_default().entry(biz_id).or_insert(0);
        let old = *slot;
        *slot = (old - 1).max(0);
        let new = *slot;
        state.rerank(biz, biz_id, old, new);
        if let Some(users) = state.item_users.get_mut(&key) {
            users.remove(&user_id);
        }

        if state.unfavorite_expires_at.get(&user_id).is_some_and(|&at| at <= now) {
            state.user_unfavorites.remove(&user_id);
        }
        state.user_unfavorites.entry(user_id).or_default().insert(key, now);
        state.unfavorite_expires_at.insert(user_id, now + self.history_ttl_secs);
        state.pending_delta += 1;
        Ok(())
    }

    async fn favorite_count(&self, biz: &str, biz_id: i64) -> Result<i64, StorageError> {
        let state = self.state.lock();
        Ok(state.counts.get(biz).and_then(|t| t.get(&biz_id)).copied().unwrap_or(0))
    }

    async fn is_user_favorite(&self, biz: &str, user_id: i64, biz_id: i64) -> Result<bool, StorageError> {
        let state = self.state.lock();
        Ok(state
            .user_favorites
            .get(&user_id)
            .is_some_and(|f| f.contains_key(&BizKey::new(biz, biz_id))))
    }

    async fn user_favorite_count(&self, user_id: i64) -> Result<i64, StorageError> {
        let state = self.state.lock();
        Ok(state.user_favorites.get(&user_id).map_or(0, |f| f.len() as i64))
    }

    async fn user_favorite_elements(&self, user_id: i64) -> Result<BTreeSet<BizKey>, StorageError> {
        let state = self.state.lock();
        Ok(state
            .user_favorites
            .get(&user_id)
            .map(|f| f.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn top_favorite_content(&self, biz: &str, top_n: usize) -> Result<Vec<i64>, StorageError> {
        let state = self.state.lock();
        Ok(state
            .rankings
            .get(biz)
            .map(|r| r.iter().take(top_n).map(|&(_, id)| id).collect())
            .unwrap_or_default())
    }

    async fn cleanup_user_history(&self, user_id: i64, retention_days: u32) -> Result<(), StorageError> {
        let cutoff = self.now() - i64::from(retention_days) * SECS_PER_DAY;
        let mut state = self.state.lock();
        if let Some(history) = state.user_unfavorites.get_mut(&user_id) {
            history.retain(|_, at| *at > cutoff);
        }
        Ok(())
    }

    async fn scan_counts(&self, cursor: &ScanCursor, count: usize) -> Result<ScanPage, StorageError> {
        let count = count.max(1);
        let state = self.state.lock();
        let mut entries = Vec::with_capacity(count);

        let mut current = match &cursor.biz {
            Some(biz) => Some(biz.clone()),
            None => state.counts.keys().next().cloned(),
        };
        let mut offset = cursor.position as usize;

        while let Some(biz) = current {
            if let Some(table) = state.counts.get(&biz) {
                for (&biz_id, &c) in table.iter().skip(offset) {
                    if entries.len() == count {
                        return Ok(ScanPage {
                            entries,
                            next: Some(ScanCursor::at(biz, offset as u64)),
                        });
                    }
                    entries.push(FavoriteCount::new(biz.clone(), biz_id, c));
                    offset += 1;
                }
            }
            current = state
                .counts
                .range::<String, _>((Bound::Excluded(biz), Bound::Unbounded))
                .next()
                .map(|(k, _)| k.clone());
            offset = 0;
        }

        Ok(ScanPage { entries, next: None })
    }

    async fn biz_favorite_users(&self, biz: &str, biz_id: i64) -> Result<BTreeSet<i64>, StorageError> {
        let state = self.state.lock();
        Ok(state.item_users.get(&BizKey::new(biz, biz_id)).cloned().unwrap_or_default())
    }

    async fn user_recent_favorites(&self, user_id: i64, limit: usize) -> Result<Vec<HistoryEntry>, StorageError> {
        let state = self.state.lock();
        let mut history = state.user_favorites.get(&user_id).map(sorted_history).unwrap_or_default();
        history.truncate(limit);
        Ok(history)
    }

    async fn user_unfavorites(&self, user_id: i64) -> Result<Vec<HistoryEntry>, StorageError> {
        let now = self.now();
        let state = self.state.lock();
        Ok(state.live_unfavorites(user_id, now).map(sorted_history).unwrap_or_default())
    }

    async fn pending_delta(&self) -> Result<u64, StorageError> {
        Ok(self.state.lock().pending_delta)
    }

    async fn take_pending_delta(&self) -> Result<u64, StorageError> {
        Ok(std::mem::take(&mut self.state.lock().pending_delta))
    }

    async fn restore_pending_delta(&self, delta: u64) -> Result<(), StorageError> {
        let mut state = self.state.lock();
        state.pending_delta = state.pending_delta.saturating_add(delta);
        Ok(())
    }
}

/// DashMap-backed [`CountArchive`].
pub struct InMemoryArchive {
    counts: DashMap<BizKey, PersistedCountRecord>,
    edges: DashMap<(i64, BizKey), EdgeRecord>,
    next_id: AtomicI64,
}

impl InMemoryArchive {
    #[must_use]
    pub fn new() -> Self {
        Self {
            counts: DashMap::new(),
            edges: DashMap::new(),
            next_id: AtomicI64::new(1),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

impl Default for InMemoryArchive {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CountArchive for InMemoryArchive {
    async fn upsert_counts(&self, counts: &[FavoriteCount]) -> Result<usize, StorageError> {
        let now = now_secs();
        for c in counts {
            self.counts
                .entry(c.key())
                .and_modify(|row| {
                    row.count = c.count;
                    row.updated_at = now;
                })
                .or_insert_with(|| PersistedCountRecord {
                    id: self.next_id.fetch_add(1, Ordering::Relaxed),
                    biz: c.biz.clone(),
                    biz_id: c.biz_id,
                    count: c.count,
                    created_at: now,
                    updated_at: now,
                });
        }
        Ok(counts.len())
    }

    async fn get_count(&self, biz: &str, biz_id: i64) -> Result<Option<PersistedCountRecord>, StorageError> {
        Ok(self.counts.get(&BizKey::new(biz, biz_id)).map(|r| r.value().clone()))
    }

    async fn count_rows(&self) -> Result<u64, StorageError> {
        Ok(self.counts.len() as u64)
    }

    async fn record_edge(&self, edge: &EdgeRecord) -> Result<(), StorageError> {
        self.edges.insert((edge.user_id, edge.key.clone()), edge.clone());
        Ok(())
    }

    async fn edge_history(&self, user_id: i64) -> Result<Vec<EdgeRecord>, StorageError> {
        let mut edges: Vec<EdgeRecord> = self
            .edges
            .iter()
            .filter(|e| e.key().0 == user_id)
            .map(|e| e.value().clone())
            .collect();
        edges.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(edges)
    }
}
