// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Row batching for durable upserts.
//!
//! The [`RowBatcher`] collects rows and hands back a full batch as soon as
//! either the row count or the byte ceiling is reached. Whatever is left when
//! the input ends comes out through [`RowBatcher::drain`].
//!
//! # Example
//!
//! ```
//! use favorite_engine::{BatchConfig, FavoriteCount, FlushReason, RowBatcher};
//!
//! let mut batcher = RowBatcher::new(BatchConfig { max_rows: 2, max_bytes: 1024 });
//! assert!(batcher.add(FavoriteCount::new("post", 1, 3)).is_none());
//!
//! let batch = batcher.add(FavoriteCount::new("post", 2, 5)).unwrap();
//! assert_eq!(batch.items.len(), 2);
//! assert_eq!(batch.reason, FlushReason::Count);
//! assert!(batcher.drain().is_none());
//! ```

use tracing::debug;

use crate::config::FavoriteEngineConfig;
use crate::domain::FavoriteCount;

/// Why a batch was handed out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    /// Row count threshold reached
    Count,
    /// Byte size threshold reached
    Size,
    /// Input ended with a partial batch
    Drain,
}

/// Batch thresholds
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Flush after this many rows
    pub max_rows: usize,
    /// Flush after this many bytes
    pub max_bytes: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_rows: 50,
            max_bytes: 1024 * 1024, // 1 MB
        }
    }
}

impl BatchConfig {
    #[must_use]
    pub fn from_engine_config(config: &FavoriteEngineConfig) -> Self {
        Self {
            max_rows: config.reconcile_batch_size,
            max_bytes: config.reconcile_batch_bytes,
        }
    }
}

/// A batch ready to be written
#[derive(Debug)]
pub struct FlushBatch<T> {
    pub items: Vec<T>,
    pub total_bytes: usize,
    pub reason: FlushReason,
}

/// Trait for rows that know their own encoded size
pub trait SizedItem {
    #[must_use]
    fn size_bytes(&self) -> usize;
}

impl SizedItem for FavoriteCount {
    /// biz tag plus two 8-byte integers and the two timestamps written alongside.
    fn size_bytes(&self) -> usize {
        self.biz.len() + 4 * std::mem::size_of::<i64>()
    }
}

/// Count/size bounded batcher. Whichever threshold is hit first flushes.
pub struct RowBatcher<T> {
    config: BatchConfig,
    items: Vec<T>,
    total_bytes: usize,
}

impl<T: SizedItem> RowBatcher<T> {
    pub fn new(config: BatchConfig) -> Self {
        let capacity = config.max_rows.max(1);
        Self {
            config,
            items: Vec::with_capacity(capacity),
            total_bytes: 0,
        }
    }

    /// Add a row; returns the batch when a threshold is hit.
    pub fn add(&mut self, item: T) -> Option<FlushBatch<T>> {
        self.total_bytes += item.size_bytes();
        self.items.push(item);

        // Count wins when both thresholds trip on the same row
        let reason = if self.items.len() >= self.config.max_rows.max(1) {
            FlushReason::Count
        } else if self.total_bytes >= self.config.max_bytes {
            FlushReason::Size
        } else {
            return None;
        };
        Some(self.take(reason))
    }

    /// Hand out whatever is pending, `None` if empty.
    pub fn drain(&mut self) -> Option<FlushBatch<T>> {
        if self.items.is_empty() {
            return None;
        }
        Some(self.take(FlushReason::Drain))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Pending `(rows, bytes)`
    #[must_use]
    pub fn stats(&self) -> (usize, usize) {
        (self.items.len(), self.total_bytes)
    }

    fn take(&mut self, reason: FlushReason) -> FlushBatch<T> {
        let total_bytes = std::mem::take(&mut self.total_bytes);
        let items = std::mem::replace(&mut self.items, Vec::with_capacity(self.config.max_rows.max(1)));
        debug!(rows = items.len(), bytes = total_bytes, ?reason, "Batch ready");
        FlushBatch { items, total_bytes, reason }
    }
}
