// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Domain types shared by the cache, the durable store and the pipeline.
//!
//! A favorite edge is `(user_id, biz, biz_id)`. The `(biz, biz_id)` half is a
//! [`BizKey`]; inside Redis sets it is encoded as the member `"{biz}:{biz_id}"`.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Identifies one piece of business content: a biz tag plus its id.
///
/// Ordering is `(biz, biz_id)`, which is also the order the in-process cache
/// scans counts in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BizKey {
    pub biz: String,
    pub biz_id: i64,
}

impl BizKey {
    pub fn new(biz: impl Into<String>, biz_id: i64) -> Self {
        Self { biz: biz.into(), biz_id }
    }

    /// Set member encoding: `"{biz}:{biz_id}"`.
    #[must_use]
    pub fn member(&self) -> String {
        format!("{}:{}", self.biz, self.biz_id)
    }

    /// Parse a set member back into a key.
    ///
    /// Splits on the last `:` so biz tags may themselves contain colons.
    #[must_use]
    pub fn parse_member(member: &str) -> Option<Self> {
        let (biz, id) = member.rsplit_once(':')?;
        if biz.is_empty() {
            return None;
        }
        let biz_id = id.parse().ok()?;
        Some(Self::new(biz, biz_id))
    }
}

impl fmt::Display for BizKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.biz, self.biz_id)
    }
}

/// Aggregate favorite count for one item, as scanned out of the cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FavoriteCount {
    pub biz: String,
    pub biz_id: i64,
    pub count: i64,
}

impl FavoriteCount {
    pub fn new(biz: impl Into<String>, biz_id: i64, count: i64) -> Self {
        Self { biz: biz.into(), biz_id, count }
    }

    #[must_use]
    pub fn key(&self) -> BizKey {
        BizKey::new(self.biz.clone(), self.biz_id)
    }
}

/// Favorite or unfavorite, as requested by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionType {
    Favorite,
    Unfavorite,
}

impl ActionType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Favorite => "favorite",
            Self::Unfavorite => "unfavorite",
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One timestamped entry of a user's favorite or unfavorite history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub key: BizKey,
    /// Unix seconds
    pub at: i64,
}

/// Durable mirror of a [`FavoriteCount`] (row of `favorite_counts`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedCountRecord {
    pub id: i64,
    pub biz: String,
    pub biz_id: i64,
    pub count: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Stored edge state in the `user_favorites` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EdgeStatus {
    Removed = 0,
    Active = 1,
}

impl EdgeStatus {
    #[must_use]
    pub fn from_code(code: i64) -> Self {
        if code == 1 { Self::Active } else { Self::Removed }
    }

    #[must_use]
    pub fn code(self) -> i64 {
        self as i64
    }
}

impl From<ActionType> for EdgeStatus {
    fn from(action: ActionType) -> Self {
        match action {
            ActionType::Favorite => Self::Active,
            ActionType::Unfavorite => Self::Removed,
        }
    }
}

/// Historical edge record (row of `user_favorites`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeRecord {
    pub user_id: i64,
    pub key: BizKey,
    pub status: EdgeStatus,
    /// Unix seconds of the last status change
    pub updated_at: i64,
}

/// Current unix time in seconds.
#[must_use]
pub fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_member_encoding() {
        let key = BizKey::new("post", 42);
        assert_eq!(key.member(), "post:42");
        assert_eq!(BizKey::parse_member("post:42"), Some(key));
    }

    #[test]
    fn test_parse_member_with_colon_in_biz() {
        let key = BizKey::parse_member("video:short:7").unwrap();
        assert_eq!(key.biz, "video:short");
        assert_eq!(key.biz_id, 7);
    }

    #[test]
    fn test_parse_member_rejects_garbage() {
        assert_eq!(BizKey::parse_member("post"), None);
        assert_eq!(BizKey::parse_member(":5"), None);
        assert_eq!(BizKey::parse_member("post:abc"), None);
    }

    #[test]
    fn test_edge_status_codes() {
        assert_eq!(EdgeStatus::Active.code(), 1);
        assert_eq!(EdgeStatus::from_code(0), EdgeStatus::Removed);
        assert_eq!(EdgeStatus::from(ActionType::Favorite), EdgeStatus::Active);
    }

    #[test]
    fn test_action_display() {
        assert_eq!(ActionType::Unfavorite.to_string(), "unfavorite");
    }
}
