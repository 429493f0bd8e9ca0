//! # 2Q Read Cache
//!
//! Scan-resistant page cache sitting between page consumers and the write
//! cache that owns the physical buffers.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                     TwoQCache                           │
//! ├─────────────────────────────────────────────────────────┤
//! │  a1in (seen once)   a1out (ghosts)   am (hot set)       │
//! │  ┌──────────────┐   ┌────────────┐   ┌──────────────┐   │
//! │  │ resident     │──▶│ keys only  │──▶│ resident     │   │
//! │  └──────────────┘   └────────────┘   └──────────────┘   │
//! ├─────────────────────────────────────────────────────────┤
//! │  pinned pages (excluded from eviction, capped share)    │
//! │  file -> pages index, per-file and per-page lock tables │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//!                    ┌───────────────┐
//!                    │  Write cache  │  owns buffers + dirty pages table
//!                    └───────────────┘
//! ```
//!
//! A page loaded for the first time enters `a1in`. When eviction pushes it
//! out, its key is remembered in `a1out` without the data. A second access
//! while the key is still remembered promotes the page into `am`, the LRU of
//! the hot set. One sweep over a large file can therefore displace at most
//! the admission queue, never the hot set.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use rusty_cache::cache::{CacheConfig, TwoQCache};
//!
//! let cache = TwoQCache::new(CacheConfig::default())?;
//! let file_id = cache.add_file(&write_cache, "people.pcl")?;
//!
//! if let Some(entry) = cache.load_for_read(&write_cache, file_id, 0, true, 1, true)? {
//!     // read through entry.cache_pointer()
//!     cache.release_from_read(&write_cache, &entry);
//! }
//! ```
//!
//! Entries returned by `load_for_read`/`load_for_write`/`allocate_new_page`
//! come with their content lock already acquired (shared for reads, exclusive
//! for writes) and count the caller as a holder. The matching release drops
//! both; an entry stays resident as long as it has holders.

// ============================================================================
// Module Exports
// ============================================================================

pub mod entry;
pub mod locks;
pub mod lru_list;
pub mod memory;
pub mod pointer;
pub mod two_q;
pub mod write_cache;

pub use entry::CacheEntry;
pub use locks::{
    CacheRwSpinLock, FileLockGuard, FileLockManager, PageLockGuard, PageLockManager,
};
pub use lru_list::LruList;
pub use memory::{MemoryData, MemoryDataContainer};
pub use pointer::CachePointer;
pub use two_q::{CacheConfig, CacheStats, TwoQCache};
pub use write_cache::WriteCache;

use crate::common::{FileId, PageIndex};
use crate::error::Result;
use std::sync::Arc;

// ============================================================================
// Public Surface
// ============================================================================

/// Narrow surface of the read cache, as the rest of the storage engine sees
/// it. [`TwoQCache`] is the production implementation.
pub trait ReadCache: Send + Sync {
    fn add_file(&self, write_cache: &dyn WriteCache, name: &str) -> Result<FileId>;

    fn add_file_with_id(
        &self,
        write_cache: &dyn WriteCache,
        name: &str,
        file_id: FileId,
    ) -> Result<FileId>;

    /// Load a page (and up to `page_count - 1` sibling pages) for reading.
    ///
    /// Returns `None` when the page does not exist. The returned entry is
    /// share-locked and must be handed back with [`ReadCache::release_from_read`].
    fn load_for_read(
        &self,
        write_cache: &dyn WriteCache,
        file_id: FileId,
        page_index: PageIndex,
        check_pinned: bool,
        page_count: usize,
        verify_checksums: bool,
    ) -> Result<Option<Arc<CacheEntry>>>;

    /// Load a page for writing.
    ///
    /// The returned entry is exclusively locked, marked dirty and registered
    /// in the write cache's dirty pages table; hand it back with
    /// [`ReadCache::release_from_write`].
    fn load_for_write(
        &self,
        write_cache: &dyn WriteCache,
        file_id: FileId,
        page_index: PageIndex,
        check_pinned: bool,
        page_count: usize,
        verify_checksums: bool,
    ) -> Result<Option<Arc<CacheEntry>>>;

    fn release_from_read(&self, write_cache: &dyn WriteCache, entry: &Arc<CacheEntry>);

    fn release_from_write(
        &self,
        write_cache: &dyn WriteCache,
        entry: &Arc<CacheEntry>,
    ) -> Result<()>;

    /// Exclude a loaded entry from eviction, within the configured share.
    fn pin_page(&self, write_cache: &dyn WriteCache, entry: &Arc<CacheEntry>) -> Result<()>;

    /// Append a fresh page to a file; the entry comes back exclusively
    /// locked and dirty.
    fn allocate_new_page(
        &self,
        write_cache: &dyn WriteCache,
        file_id: FileId,
    ) -> Result<Arc<CacheEntry>>;

    fn truncate_file(&self, write_cache: &dyn WriteCache, file_id: FileId) -> Result<()>;

    fn close_file(&self, write_cache: &dyn WriteCache, file_id: FileId, flush: bool) -> Result<()>;

    fn delete_file(&self, write_cache: &dyn WriteCache, file_id: FileId) -> Result<()>;

    /// Drop all cache content; fails if any entry is still in use.
    fn clear(&self) -> Result<()>;

    fn close_storage(&self, write_cache: &dyn WriteCache) -> Result<()>;

    fn delete_storage(&self, write_cache: &dyn WriteCache) -> Result<()>;

    fn load_cache_state(&self, write_cache: &dyn WriteCache) -> Result<()>;

    fn store_cache_state(&self, write_cache: &dyn WriteCache) -> Result<()>;

    fn change_maximum_amount_of_memory(&self, max_memory_bytes: u64) -> Result<()>;
}
