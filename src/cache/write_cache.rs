// # Write Cache Contract
//
// The read cache sits on top of a write cache that owns the physical page
// buffers and the dirty pages table. This trait is the full surface the read
// cache consumes; the storage engine provides the implementation, tests
// provide instrumented in-memory ones.

use crate::cache::pointer::CachePointer;
use crate::common::{FileId, PageIndex};
use crate::error::Result;
use std::path::PathBuf;
use std::sync::Arc;

pub trait WriteCache: Send + Sync {
    /// Identifier of this write cache instance
    fn id(&self) -> u64;

    /// Directory the storage keeps its files (and the cache state file) under
    fn root_directory(&self) -> PathBuf;

    /// Normalize an externally supplied file id to this write cache's id
    /// scheme. Incompatible ids are reported as `InvalidArgument`.
    fn file_id_for(&self, file_id: FileId) -> Result<FileId>;

    /// Register a new file and return its id.
    fn add_file(&self, name: &str) -> Result<FileId>;

    /// Register a new file under a caller-chosen id.
    fn add_file_with_id(&self, name: &str, file_id: FileId) -> Result<FileId>;

    /// Materialize up to `count` contiguous pages starting at `start_index`.
    ///
    /// Returns the pointers (each with one reader reference already held for
    /// the caller) and a flag telling whether the first page was served
    /// without disk I/O. An empty vector means the page does not exist and
    /// allocation was not requested.
    fn load(
        &self,
        file_id: FileId,
        start_index: PageIndex,
        count: usize,
        allocate_if_missing: bool,
        verify_checksums: bool,
    ) -> Result<(Vec<Arc<CachePointer>>, bool)>;

    /// Hand a page back for writing out.
    fn store(&self, file_id: FileId, page_index: PageIndex, pointer: &Arc<CachePointer>)
        -> Result<()>;

    /// Record the page in the dirty pages table.
    ///
    /// Must be called while the pointer's exclusive lock is held, before the
    /// corresponding entry is released.
    fn update_dirty_pages_table(&self, pointer: &Arc<CachePointer>) -> Result<()>;

    /// Number of pages the file currently holds.
    fn filled_up_to(&self, file_id: FileId) -> Result<PageIndex>;

    fn truncate_file(&self, file_id: FileId) -> Result<()>;

    fn close_file(&self, file_id: FileId, flush: bool) -> Result<()>;

    /// Close the whole storage; returns the ids of all files that were open.
    fn close(&self) -> Result<Vec<FileId>>;

    fn delete_file(&self, file_id: FileId) -> Result<()>;

    /// Delete the whole storage; returns the ids of all files that existed.
    fn delete(&self) -> Result<Vec<FileId>>;

    /// Cooperatively wait until the amount of dirty pages is acceptable.
    ///
    /// May block; an interruption of the wait surfaces as
    /// [`crate::error::CacheError::Interrupted`].
    fn check_cache_overflow(&self) -> Result<()>;
}
