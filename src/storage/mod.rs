//! Storage backends.
//!
//! - [`traits`]: the [`FavoriteCache`](traits::FavoriteCache) and
//!   [`CountArchive`](traits::CountArchive) seams plus [`StorageError`](traits::StorageError)
//! - [`redis`]: Redis cache (Lua-scripted mutations)
//! - [`sql`]: MySQL/SQLite count archive
//! - [`memory`]: in-process implementations of both traits
//! - [`stream`]: lazy full scan of cached counts

pub mod memory;
pub mod redis;
pub mod sql;
pub mod stream;
pub mod traits;
