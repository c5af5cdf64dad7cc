//! Batching for durable writes.

pub mod row_batcher;
