//! Property-based tests (fuzzing) for favorite engine invariants.
//!
//! Uses proptest to generate random action sequences and malformed inputs and
//! verify counts stay consistent, rankings stay ordered and parsers never
//! panic.
//!
//! Run with: `cargo test --test proptest_fuzz`

use std::collections::{HashMap, HashSet};

use proptest::prelude::*;

use favorite_engine::{
    BatchConfig, BizKey, FavoriteCache, FavoriteCount, FavoriteEngineConfig, InMemoryFavoriteCache, RowBatcher,
    StorageError,
};

// =============================================================================
// Strategies for generating test data
// =============================================================================

#[derive(Debug, Clone)]
struct Action {
    favorite: bool,
    user_id: i64,
    biz: &'static str,
    biz_id: i64,
}

/// Small id spaces so duplicates and misses are common.
fn action_strategy() -> impl Strategy<Value = Action> {
    (any::<bool>(), 0..6i64, prop::sample::select(vec!["post", "video"]), 0..5i64).prop_map(
        |(favorite, user_id, biz, biz_id)| Action {
            favorite,
            user_id,
            biz,
            biz_id,
        },
    )
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

// =============================================================================
// Cache Invariants
// =============================================================================

proptest! {
    /// Every item's count equals the number of users holding the edge, and
    /// every rejected mutation matches the edge state it was rejected for.
    #[test]
    fn fuzz_counts_match_edges(actions in prop::collection::vec(action_strategy(), 0..200)) {
        let rt = runtime();
        let cache = InMemoryFavoriteCache::new();
        let mut edges: HashSet<(i64, &str, i64)> = HashSet::new();

        rt.block_on(async {
            for a in &actions {
                let edge = (a.user_id, a.biz, a.biz_id);
                if a.favorite {
                    let result = cache.create_favorite(a.biz, a.biz_id, a.user_id).await;
                    if edges.insert(edge) {
                        prop_assert!(result.is_ok());
                    } else {
                        prop_assert!(matches!(result, Err(StorageError::AlreadyExists)));
                    }
                } else {
                    let result = cache.delete_favorite(a.biz, a.biz_id, a.user_id).await;
                    if edges.remove(&edge) {
                        prop_assert!(result.is_ok());
                    } else {
                        prop_assert!(matches!(result, Err(StorageError::NotFound)));
                    }
                }
            }

            for biz in ["post", "video"] {
                for biz_id in 0..5 {
                    let expected = edges.iter().filter(|(_, b, id)| *b == biz && *id == biz_id).count() as i64;
                    prop_assert_eq!(cache.favorite_count(biz, biz_id).await.unwrap(), expected);
                    prop_assert_eq!(cache.biz_favorite_users(biz, biz_id).await.unwrap().len() as i64, expected);
                }
            }
            for user_id in 0..6 {
                let expected = edges.iter().filter(|(u, _, _)| *u == user_id).count() as i64;
                prop_assert_eq!(cache.user_favorite_count(user_id).await.unwrap(), expected);
            }
            Ok(())
        })?;
    }

    /// Rankings hold only positive counts, highest first.
    #[test]
    fn fuzz_ranking_is_ordered(actions in prop::collection::vec(action_strategy(), 0..200), top_n in 0usize..8) {
        let rt = runtime();
        let cache = InMemoryFavoriteCache::new();

        rt.block_on(async {
            for a in &actions {
                let _ = if a.favorite {
                    cache.create_favorite(a.biz, a.biz_id, a.user_id).await
                } else {
                    cache.delete_favorite(a.biz, a.biz_id, a.user_id).await
                };
            }

            for biz in ["post", "video"] {
                let top = cache.top_favorite_content(biz, top_n).await.unwrap();
                prop_assert!(top.len() <= top_n);

                let mut previous = i64::MAX;
                for biz_id in &top {
                    let count = cache.favorite_count(biz, *biz_id).await.unwrap();
                    prop_assert!(count > 0, "zero-count item {} ranked", biz_id);
                    prop_assert!(count <= previous);
                    previous = count;
                }
            }
            Ok(())
        })?;
    }

    /// Counts never go negative, whatever order deletes arrive in.
    #[test]
    fn fuzz_counts_never_negative(actions in prop::collection::vec(action_strategy(), 0..200)) {
        let rt = runtime();
        let cache = InMemoryFavoriteCache::new();

        rt.block_on(async {
            for a in &actions {
                let _ = if a.favorite {
                    cache.create_favorite(a.biz, a.biz_id, a.user_id).await
                } else {
                    cache.delete_favorite(a.biz, a.biz_id, a.user_id).await
                };
                prop_assert!(cache.favorite_count(a.biz, a.biz_id).await.unwrap() >= 0);
            }
            Ok(())
        })?;
    }
}

// =============================================================================
// Parser / Batcher Fuzz Tests
// =============================================================================

proptest! {
    /// Member parsing should never panic on arbitrary strings
    #[test]
    fn fuzz_parse_member_random_strings(member in ".*") {
        let _ = BizKey::parse_member(&member);
    }

    /// Biz tags may contain colons and still parse back
    #[test]
    fn fuzz_member_with_colons(biz in "[a-z]{1,8}(:[a-z]{1,8}){0,3}", biz_id in any::<i64>()) {
        let key = BizKey::new(biz, biz_id);
        prop_assert_eq!(BizKey::parse_member(&key.member()), Some(key));
    }

    /// Batches never exceed the row limit and never lose rows
    #[test]
    fn fuzz_batcher_partitions_rows(rows in 0usize..500, max_rows in 1usize..80) {
        let mut batcher = RowBatcher::new(BatchConfig { max_rows, max_bytes: usize::MAX });
        let mut seen = 0;
        let mut keys = HashMap::new();

        for i in 0..rows {
            if let Some(batch) = batcher.add(FavoriteCount::new("post", i as i64, 1)) {
                prop_assert_eq!(batch.items.len(), max_rows);
                seen += batch.items.len();
                for item in batch.items {
                    *keys.entry(item.biz_id).or_insert(0) += 1;
                }
            }
        }
        if let Some(batch) = batcher.drain() {
            prop_assert!(!batch.items.is_empty() && batch.items.len() <= max_rows);
            seen += batch.items.len();
            for item in batch.items {
                *keys.entry(item.biz_id).or_insert(0) += 1;
            }
        }

        prop_assert_eq!(seen, rows);
        prop_assert!(keys.values().all(|&n| n == 1));
    }

    /// Config deserialization should fail cleanly on garbage
    #[test]
    fn fuzz_config_from_random_json(bytes in prop::collection::vec(any::<u8>(), 0..512)) {
        let _ = serde_json::from_slice::<FavoriteEngineConfig>(&bytes);
    }
}
