// # Cache Entry
//
// One entry per page tracked by the cache. An entry in the admission or hot
// queue (or the pinned table) has a pointer attached; an entry parked in the
// ghost queue has none. The usage count records concurrent holders handed out
// by `load*` and not yet returned by `release*`; a non-zero count makes the
// entry non-evictable.
//
// The intrinsic shared/exclusive lock of an entry is the content lock of its
// attached pointer: callers only ever lock entries that are resident.

use crate::cache::pointer::CachePointer;
use crate::common::{FileId, PageIndex, PageKey};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

pub struct CacheEntry {
    file_id: FileId,
    page_index: PageIndex,

    /// Attached buffer handle; `None` while parked in the ghost queue
    pointer: RwLock<Option<Arc<CachePointer>>>,

    /// Concurrent holders of this entry
    usages: AtomicI32,

    /// Set by `load_for_write`/`allocate_new_page`, cleared on write release
    dirty: AtomicBool,
}

impl CacheEntry {
    pub fn new(
        file_id: FileId,
        page_index: PageIndex,
        pointer: Option<Arc<CachePointer>>,
    ) -> Self {
        Self {
            file_id,
            page_index,
            pointer: RwLock::new(pointer),
            usages: AtomicI32::new(0),
            dirty: AtomicBool::new(false),
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
    pub fn key(&self) -> PageKey {
        PageKey::new(self.file_id, self.page_index)
    }

    /// Currently attached pointer, if any.
    pub fn cache_pointer(&self) -> Option<Arc<CachePointer>> {
        self.pointer.read().clone()
    }

    /// Attach a pointer (promotion out of the ghost queue).
    pub fn set_pointer(&self, pointer: Arc<CachePointer>) {
        *self.pointer.write() = Some(pointer);
    }

    /// Detach and return the pointer (parking in the ghost queue, eviction).
    pub fn take_pointer(&self) -> Option<Arc<CachePointer>> {
        self.pointer.write().take()
    }

    #[inline]
    pub fn usages(&self) -> i32 {
        self.usages.load(Ordering::Acquire)
    }

    /// Register a holder. Returns the new count.
    #[inline]
    pub fn inc_usages(&self) -> i32 {
        self.usages.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Unregister a holder. Returns the new count, which must stay >= 0.
    #[inline]
    pub fn dec_usages(&self) -> i32 {
        let remaining = self.usages.fetch_sub(1, Ordering::AcqRel) - 1;
        assert!(remaining >= 0, "cache entry usage count underflow");
        remaining
    }

    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    #[inline]
    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    #[inline]
    pub fn clear_dirty(&self) {
        self.dirty.store(false, Ordering::Release);
    }

    fn resident_pointer(&self) -> Arc<CachePointer> {
        self.pointer
            .read()
            .clone()
            .expect("entry lock requires a resident page")
    }

    pub fn acquire_shared_lock(&self) {
        self.resident_pointer().acquire_shared_lock();
    }

    pub fn release_shared_lock(&self) {
        self.resident_pointer().release_shared_lock();
    }

    pub fn acquire_exclusive_lock(&self) {
        self.resident_pointer().acquire_exclusive_lock();
    }

    pub fn release_exclusive_lock(&self) {
        self.resident_pointer().release_exclusive_lock();
    }
}

impl std::fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEntry")
            .field("file_id", &self.file_id)
            .field("page_index", &self.page_index)
            .field("usages", &self.usages())
            .field("dirty", &self.is_dirty())
            .field("resident", &self.pointer.read().is_some())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
