//! Full count-table scan as a lazy stream.
//!
//! Pages are fetched on demand through [`FavoriteCache::scan_counts`], so the
//! consumer never holds more than one page. Every call starts over from the
//! beginning. A failed page fetch yields one `Err` and then the stream ends,
//! which keeps "exhausted" and "failed" distinguishable.

use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};

use super::traits::{FavoriteCache, ScanCursor, StorageError};
use crate::domain::FavoriteCount;

pub type CountStream = BoxStream<'static, Result<FavoriteCount, StorageError>>;

/// Stream every `(biz, biz_id, count)` in the cache, `batch_size` per fetch.
pub fn count_stream(cache: Arc<dyn FavoriteCache>, batch_size: usize) -> CountStream {
    let batch_size = batch_size.max(1);
    stream::try_unfold(Some(ScanCursor::start()), move |cursor| {
        let cache = cache.clone();
        async move {
            let Some(cursor) = cursor else {
                return Ok::<_, StorageError>(None);
            };
            let page = cache.scan_counts(&cursor, batch_size).await?;
            Ok(Some((page.entries, page.next)))
        }
    })
    .map_ok(|entries| stream::iter(entries.into_iter().map(Ok::<_, StorageError>)))
    .try_flatten()
    .boxed()
}
