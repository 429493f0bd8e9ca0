// # Cache Pointer - External Buffer Handle
//
// A `CachePointer` refers to a page buffer owned by the write cache. The read
// cache never allocates or frees the buffer; it only balances the one reader
// reference it holds for every pointer attached to a resident entry.
//
// The content lock is a raw readers-writer lock acquired and released by
// explicit calls, because a writer holds it from `load_for_write` until the
// matching `release_from_write` - a span no borrow-scoped guard can cover.

use crate::common::{FileId, PageIndex};
use parking_lot::lock_api::RawRwLock as RawRwLockApi;
use parking_lot::{RawRwLock, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::atomic::{AtomicI32, Ordering};

/// Reference-counted handle to a write-cache-owned page buffer.
pub struct CachePointer {
    file_id: FileId,
    page_index: PageIndex,

    /// Page body; sized by the write cache
    buffer: RwLock<Vec<u8>>,

    /// Outstanding reader references, incl. the one the read cache holds
    /// while this pointer is attached to a resident entry
    readers_referrer: AtomicI32,

    /// Content lock: shared for readers, exclusive for the single writer
    rw: RawRwLock,
}

impl CachePointer {
    /// Create a pointer with one reader reference already held, matching the
    /// write cache contract for freshly loaded pages.
    pub fn new(file_id: FileId, page_index: PageIndex, data: Vec<u8>) -> Self {
        Self {
            file_id,
            page_index,
            buffer: RwLock::new(data),
            readers_referrer: AtomicI32::new(1),
            rw: RawRwLock::INIT,
        }
    }

    #[inline]
    pub fn file_id(&self) -> FileId {
        self.file_id
    }

    #[inline]
    pub fn page_index(&self) -> PageIndex {
        self.page_index
    }

    #[inline]
    pub fn increment_readers_referrer(&self) -> i32 {
        self.readers_referrer.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Drop one reader reference. Returns the remaining count; the write
    /// cache reclaims the buffer when it reaches zero.
    #[inline]
    pub fn decrement_readers_referrer(&self) -> i32 {
        let remaining = self.readers_referrer.fetch_sub(1, Ordering::AcqRel) - 1;
        debug_assert!(remaining >= 0, "reader reference count underflow");
        remaining
    }

    #[inline]
    pub fn readers_referrer(&self) -> i32 {
        self.readers_referrer.load(Ordering::Acquire)
    }

    pub fn acquire_shared_lock(&self) {
        self.rw.lock_shared();
    }

    pub fn try_acquire_shared_lock(&self) -> bool {
        self.rw.try_lock_shared()
    }

    pub fn release_shared_lock(&self) {
        // SAFETY: paired with a prior acquire_shared_lock by the caller.
        unsafe { self.rw.unlock_shared() }
    }

    pub fn acquire_exclusive_lock(&self) {
        self.rw.lock_exclusive();
    }

    pub fn release_exclusive_lock(&self) {
        // SAFETY: paired with a prior acquire_exclusive_lock by the caller.
        unsafe { self.rw.unlock_exclusive() }
    }

    /// Read access to the page body.
    pub fn data(&self) -> RwLockReadGuard<'_, Vec<u8>> {
        self.buffer.read()
    }

    /// Write access to the page body.
    pub fn data_mut(&self) -> RwLockWriteGuard<'_, Vec<u8>> {
        self.buffer.write()
    }
}

impl std::fmt::Debug for CachePointer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachePointer")
            .field("file_id", &self.file_id)
            .field("page_index", &self.page_index)
            .field("readers_referrer", &self.readers_referrer())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
