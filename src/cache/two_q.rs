// # 2Q Page Cache - Core
//
// Scan-resistant read cache over a write cache that owns the page buffers.
// Resident pages live in two queues: `a1in` holds pages seen once, `am` holds
// pages seen at least twice. A third queue, `a1out`, remembers keys recently
// evicted from `a1in` without keeping their data; re-accessing such a key
// promotes the page straight into `am`. Sequential scans therefore churn only
// through `a1in` and never displace the hot set.
//
// ## Locking
//
// Locks are acquired in this order and released in reverse:
//
// 1. Global cache lock (shared for data plane, exclusive for eviction and
//    storage-wide operations)
// 2. File lock (shared for page operations, exclusive for file lifecycle and
//    page allocation)
// 3. Page lock (exclusive for any change to an entry's queue membership,
//    pointer or usage count; batched in canonical order for prefetch)
// 4. Entry content lock (shared for readers, exclusive for writers; held by
//    the caller between `load*` and `release*`)
//
// The queues and tables are internally synchronized, so holders of the shared
// cache lock may mutate them concurrently; the exclusive cache lock gives the
// eviction loop a stable view of all of them at once.

use crate::cache::entry::CacheEntry;
use crate::cache::locks::{CacheRwSpinLock, FileLockManager, PageLockManager};
use crate::cache::lru_list::LruList;
use crate::cache::memory::{MemoryData, MemoryDataContainer};
use crate::cache::pointer::CachePointer;
use crate::cache::write_cache::WriteCache;
use crate::cache::ReadCache;
use crate::common::{
    FileId, PageIndex, PageKey, PinnedPage, CACHE_STATE_FILE,
    DEFAULT_PERCENT_OF_PINNED_PAGES, MAX_AMOUNT_OF_WARNINGS_PINNED_PAGES,
    MAX_PERCENT_OF_PINNED_PAGES, MIN_CACHE_SIZE,
};
use crate::error::{CacheError, Result};
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

// ============================================================================
// Configuration
// ============================================================================

/// Read cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Overall memory budget in bytes
    pub max_memory_bytes: u64,

    /// Page size in bytes
    pub page_size: usize,

    /// Raise the capacity to [`MIN_CACHE_SIZE`] pages when the byte budget
    /// divides smaller
    pub enforce_min_size: bool,

    /// Share of the capacity pinned pages may occupy (at most
    /// [`MAX_PERCENT_OF_PINNED_PAGES`])
    pub percent_of_pinned_pages: u8,

    /// Emit periodic statistics through the log
    pub print_statistics: bool,

    /// Interval the embedder should report statistics at
    pub statistics_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_memory_bytes: 128 * 1024 * 1024,
            page_size: 4096,
            enforce_min_size: true,
            percent_of_pinned_pages: DEFAULT_PERCENT_OF_PINNED_PAGES,
            print_statistics: false,
            statistics_interval: Duration::from_secs(60),
        }
    }
}

/// Point-in-time cache statistics
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub cache_requests: u64,
    pub cache_hits: u64,
    pub hit_rate: f64,
    pub a1in_len: usize,
    pub a1out_len: usize,
    pub am_len: usize,
    pub pinned_pages: usize,
    pub max_size: u32,
}

// ============================================================================
// Cache Core
// ============================================================================

pub struct TwoQCache {
    /// Pages seen once, FIFO-ish admission queue
    a1in: LruList,

    /// Ghost queue: keys recently evicted from `a1in`, data not resident
    a1out: LruList,

    /// Hot queue: pages seen at least twice
    am: LruList,

    /// Pages excluded from the queues and from eviction
    pinned_pages: DashMap<PinnedPage, Arc<CacheEntry>>,

    /// Every page index currently tracked for a file, in any location
    file_pages: DashMap<FileId, HashSet<PageIndex>>,

    cache_lock: CacheRwSpinLock,
    file_locks: FileLockManager,
    page_locks: PageLockManager,

    memory: MemoryDataContainer,
    config: CacheConfig,

    cache_requests: AtomicU64,
    cache_hits: AtomicU64,
    pinned_warnings: AtomicU32,
}

impl TwoQCache {
    pub fn new(config: CacheConfig) -> Result<Self> {
        if config.percent_of_pinned_pages > MAX_PERCENT_OF_PINNED_PAGES {
            return Err(CacheError::InvalidArgument(format!(
                "percent of pinned pages is {} but may not exceed {}",
                config.percent_of_pinned_pages, MAX_PERCENT_OF_PINNED_PAGES
            )));
        }
        if config.page_size == 0 {
            return Err(CacheError::InvalidArgument(
                "page size must be non-zero".to_string(),
            ));
        }

        let mut max_size = (config.max_memory_bytes / config.page_size as u64)
            .min(i32::MAX as u64)
            .max(1) as u32;
        if config.enforce_min_size && max_size < MIN_CACHE_SIZE {
            max_size = MIN_CACHE_SIZE;
        }

        Ok(Self {
            a1in: LruList::new(),
            a1out: LruList::new(),
            am: LruList::new(),
            pinned_pages: DashMap::new(),
            file_pages: DashMap::new(),
            cache_lock: CacheRwSpinLock::new(),
            file_locks: FileLockManager::new(),
            page_locks: PageLockManager::new(),
            memory: MemoryDataContainer::new(MemoryData::new(max_size, 0)),
            config,
            cache_requests: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            pinned_warnings: AtomicU32::new(0),
        })
    }

    // ------------------------------------------------------------------
    // File registration
    // ------------------------------------------------------------------

    pub fn add_file(&self, write_cache: &dyn WriteCache, name: &str) -> Result<FileId> {
        let _cache = self.cache_lock.read();
        let file_id = write_cache.add_file(name)?;
        self.register_file(file_id)
    }

    pub fn add_file_with_id(
        &self,
        write_cache: &dyn WriteCache,
        name: &str,
        file_id: FileId,
    ) -> Result<FileId> {
        let _cache = self.cache_lock.read();
        let file_id = write_cache.add_file_with_id(name, file_id)?;
        self.register_file(file_id)
    }

    fn register_file(&self, file_id: FileId) -> Result<FileId> {
        use dashmap::mapref::entry::Entry;

        match self.file_pages.entry(file_id) {
            Entry::Occupied(occupied) if !occupied.get().is_empty() => {
                Err(CacheError::StorageConsistency(format!(
                    "file {file_id} is already registered and has resident pages"
                )))
            }
            Entry::Occupied(_) => Ok(file_id),
            Entry::Vacant(vacant) => {
                vacant.insert(HashSet::new());
                Ok(file_id)
            }
        }
    }

    // ------------------------------------------------------------------
    // Load / release
    // ------------------------------------------------------------------

    pub fn load_for_read(
        &self,
        write_cache: &dyn WriteCache,
        file_id: FileId,
        page_index: PageIndex,
        check_pinned: bool,
        page_count: usize,
        verify_checksums: bool,
    ) -> Result<Option<Arc<CacheEntry>>> {
        let file_id = write_cache.file_id_for(file_id)?;
        let entry = self.do_load(
            write_cache,
            file_id,
            page_index,
            check_pinned,
            false,
            page_count,
            verify_checksums,
        )?;
        if let Some(entry) = &entry {
            entry.acquire_shared_lock();
        }
        Ok(entry)
    }

    pub fn load_for_write(
        &self,
        write_cache: &dyn WriteCache,
        file_id: FileId,
        page_index: PageIndex,
        check_pinned: bool,
        page_count: usize,
        verify_checksums: bool,
    ) -> Result<Option<Arc<CacheEntry>>> {
        let file_id = write_cache.file_id_for(file_id)?;
        let Some(entry) = self.do_load(
            write_cache,
            file_id,
            page_index,
            check_pinned,
            false,
            page_count,
            verify_checksums,
        )?
        else {
            return Ok(None);
        };

        entry.acquire_exclusive_lock();
        entry.mark_dirty();

        let pointer = entry
            .cache_pointer()
            .expect("loaded entry has a resident page");
        if let Err(err) = write_cache.update_dirty_pages_table(&pointer) {
            entry.release_exclusive_lock();
            self.do_release(&entry);
            return Err(err);
        }

        Ok(Some(entry))
    }

    pub fn release_from_read(&self, _write_cache: &dyn WriteCache, entry: &Arc<CacheEntry>) {
        entry.release_shared_lock();
        self.do_release(entry);
    }

    /// Hand a written page back.
    ///
    /// The write cache is told about the page while the page lock is still
    /// held, and the exclusive content lock is dropped only afterwards. A
    /// flush that runs in between can therefore never clear the dirty pages
    /// table entry before the write cache has seen this update.
    pub fn release_from_write(
        &self,
        write_cache: &dyn WriteCache,
        entry: &Arc<CacheEntry>,
    ) -> Result<()> {
        let pointer = entry
            .cache_pointer()
            .expect("written entry has a resident page");

        let store_result = {
            let _cache = self.cache_lock.read();
            let _file = self.file_locks.acquire_shared(entry.file_id());
            let _page = self.page_locks.acquire_exclusive(entry.key());
            entry.dec_usages();
            write_cache.store(entry.file_id(), entry.page_index(), &pointer)
        };

        pointer.release_exclusive_lock();
        entry.clear_dirty();
        store_result
    }

    fn do_release(&self, entry: &Arc<CacheEntry>) {
        let _cache = self.cache_lock.read();
        let _file = self.file_locks.acquire_shared(entry.file_id());
        let _page = self.page_locks.acquire_exclusive(entry.key());
        entry.dec_usages();
    }

    // ------------------------------------------------------------------
    // Pinning
    // ------------------------------------------------------------------

    /// Exclude a loaded entry from the queues and from eviction.
    ///
    /// When the configured share of pinned pages is exhausted the page simply
    /// stays in its queue; a bounded number of warnings is logged.
    pub fn pin_page(&self, write_cache: &dyn WriteCache, entry: &Arc<CacheEntry>) -> Result<()> {
        let memory = self.memory.load();
        let projected = 100 * (u64::from(memory.pinned_pages) + 1) / u64::from(memory.max_size);
        if projected > u64::from(self.config.percent_of_pinned_pages) {
            if self.pinned_warnings.load(Ordering::Relaxed) < MAX_AMOUNT_OF_WARNINGS_PINNED_PAGES
            {
                let warnings = self.pinned_warnings.fetch_add(1, Ordering::Relaxed);
                if warnings < MAX_AMOUNT_OF_WARNINGS_PINNED_PAGES {
                    warn!(
                        file_id = entry.file_id(),
                        page_index = entry.page_index(),
                        percent_of_pinned_pages = self.config.percent_of_pinned_pages,
                        "share of pinned pages is exhausted, the page stays evictable"
                    );
                }
            }
            return Ok(());
        }

        {
            let _cache = self.cache_lock.read();
            let _file = self.file_locks.acquire_shared(entry.file_id());
            let _page = self.page_locks.acquire_exclusive(entry.key());

            self.remove_from_queues(entry.file_id(), entry.page_index())?;
            self.pinned_pages
                .insert(PinnedPage::from(entry.key()), Arc::clone(entry));
        }

        loop {
            let current = self.memory.load();
            let new = MemoryData::new(current.max_size, current.pinned_pages + 1);
            if self.memory.compare_exchange(current, new) {
                break;
            }
        }

        self.remove_coldest_pages_if_needed(write_cache)
    }

    /// Take an entry out of whichever queue currently holds it.
    fn remove_from_queues(&self, file_id: FileId, page_index: PageIndex) -> Result<()> {
        let entry = self
            .am
            .remove(file_id, page_index)
            .or_else(|| self.a1out.remove(file_id, page_index))
            .or_else(|| self.a1in.remove(file_id, page_index));

        match entry {
            Some(entry) if entry.usages() > 1 => Err(CacheError::StorageConsistency(format!(
                "page {page_index} of file {file_id} is used and cannot be removed"
            ))),
            Some(_) => Ok(()),
            None => Err(CacheError::StorageConsistency(format!(
                "page {page_index} of file {file_id} was not found in the cache"
            ))),
        }
    }

    // ------------------------------------------------------------------
    // Allocation
    // ------------------------------------------------------------------

    /// Append a fresh page to the file and return it locked for writing.
    pub fn allocate_new_page(
        &self,
        write_cache: &dyn WriteCache,
        file_id: FileId,
    ) -> Result<Arc<CacheEntry>> {
        let file_id = write_cache.file_id_for(file_id)?;

        let (entry, remove_cold) = {
            let _cache = self.cache_lock.read();
            let _file = self.file_locks.acquire_exclusive(file_id);

            let page_index = write_cache.filled_up_to(file_id)?;
            let mut hit = false;
            let mut remove_cold = false;
            let entry = self.lookup_or_admit(
                write_cache,
                file_id,
                page_index,
                false,
                true,
                1,
                true,
                &mut hit,
                &mut remove_cold,
            )?;
            let entry = entry.ok_or_else(|| {
                CacheError::StorageConsistency(format!(
                    "page {page_index} of file {file_id} could not be allocated"
                ))
            })?;
            (entry, remove_cold)
        };

        // Allocation always counts as a request served from the cache.
        self.cache_requests.fetch_add(1, Ordering::Relaxed);
        self.cache_hits.fetch_add(1, Ordering::Relaxed);

        if remove_cold {
            if let Err(err) = self.remove_coldest_pages_if_needed(write_cache) {
                self.do_release(&entry);
                return Err(err);
            }
        }

        entry.acquire_exclusive_lock();
        entry.mark_dirty();

        let pointer = entry
            .cache_pointer()
            .expect("allocated entry has a resident page");
        if let Err(err) = write_cache.update_dirty_pages_table(&pointer) {
            entry.release_exclusive_lock();
            self.do_release(&entry);
            return Err(err);
        }

        Ok(entry)
    }

    // ------------------------------------------------------------------
    // File lifecycle
    // ------------------------------------------------------------------

    pub fn truncate_file(&self, write_cache: &dyn WriteCache, file_id: FileId) -> Result<()> {
        let file_id = write_cache.file_id_for(file_id)?;
        let _cache = self.cache_lock.read();
        let _file = self.file_locks.acquire_exclusive(file_id);

        write_cache.truncate_file(file_id)?;
        self.clear_file_pages(file_id)
    }

    pub fn close_file(
        &self,
        write_cache: &dyn WriteCache,
        file_id: FileId,
        flush: bool,
    ) -> Result<()> {
        let file_id = write_cache.file_id_for(file_id)?;
        let _cache = self.cache_lock.read();
        let _file = self.file_locks.acquire_exclusive(file_id);

        write_cache.close_file(file_id, flush)?;
        self.clear_file_pages(file_id)
    }

    pub fn delete_file(&self, write_cache: &dyn WriteCache, file_id: FileId) -> Result<()> {
        let file_id = write_cache.file_id_for(file_id)?;
        let _cache = self.cache_lock.read();
        let _file = self.file_locks.acquire_exclusive(file_id);

        write_cache.delete_file(file_id)?;
        self.clear_file_pages(file_id)?;
        self.file_pages.remove(&file_id);
        Ok(())
    }

    /// Drop every tracked page of a file from the cache.
    ///
    /// A page that is still in use is a lifecycle violation by the caller and
    /// fails the operation; state changed before the detection sticks.
    fn clear_file_pages(&self, file_id: FileId) -> Result<()> {
        let Some(mut pages) = self.file_pages.get_mut(&file_id) else {
            return Ok(());
        };

        for page_index in pages.iter().copied() {
            let queued = self
                .am
                .get(file_id, page_index)
                .or_else(|| self.a1out.get(file_id, page_index))
                .or_else(|| self.a1in.get(file_id, page_index));

            if let Some(entry) = queued {
                // The usage check comes first; a used page must stay where
                // it is so its holder can still release it.
                Self::drop_unused_entry(file_id, page_index, &entry)?;
                self.am
                    .remove(file_id, page_index)
                    .or_else(|| self.a1out.remove(file_id, page_index))
                    .or_else(|| self.a1in.remove(file_id, page_index));
                continue;
            }

            let pinned_key = PinnedPage::new(file_id, page_index);
            let pinned = self
                .pinned_pages
                .get(&pinned_key)
                .map(|entry| Arc::clone(entry.value()));
            if let Some(entry) = pinned {
                Self::drop_unused_entry(file_id, page_index, &entry)?;
                self.pinned_pages.remove(&pinned_key);
                loop {
                    let current = self.memory.load();
                    let new = MemoryData::new(current.max_size, current.pinned_pages - 1);
                    if self.memory.compare_exchange(current, new) {
                        break;
                    }
                }
                continue;
            }

            return Err(CacheError::StorageConsistency(format!(
                "page {page_index} of file {file_id} was not found in the cache"
            )));
        }

        pages.clear();
        Ok(())
    }

    fn drop_unused_entry(
        file_id: FileId,
        page_index: PageIndex,
        entry: &Arc<CacheEntry>,
    ) -> Result<()> {
        if entry.usages() != 0 {
            return Err(CacheError::StorageConsistency(format!(
                "page {page_index} of file {file_id} is used and cannot be removed"
            )));
        }
        if let Some(pointer) = entry.take_pointer() {
            pointer.decrement_readers_referrer();
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Storage-wide operations
    // ------------------------------------------------------------------

    /// Drop the entire cache content. Fails if any entry is still in use.
    pub fn clear(&self) -> Result<()> {
        let _cache = self.cache_lock.write();
        self.clear_cache_content()
    }

    pub fn close_storage(&self, write_cache: &dyn WriteCache) -> Result<()> {
        let _cache = self.cache_lock.write();

        let file_ids = write_cache.close()?;
        debug!(files = file_ids.len(), "closing storage files");
        for file_id in file_ids {
            self.clear_file_pages(file_id)?;
            self.file_pages.remove(&file_id);
        }
        Ok(())
    }

    pub fn delete_storage(&self, write_cache: &dyn WriteCache) -> Result<()> {
        let _cache = self.cache_lock.write();

        let file_ids = write_cache.delete()?;
        for file_id in file_ids {
            self.clear_file_pages(file_id)?;
            self.file_pages.remove(&file_id);
        }

        let state_file = write_cache.root_directory().join(CACHE_STATE_FILE);
        if state_file.exists() {
            std::fs::remove_file(&state_file)?;
            debug!(path = %state_file.display(), "removed cache state file");
        }
        Ok(())
    }

    /// Queue state is rebuilt from load traffic; nothing is restored.
    pub fn load_cache_state(&self, _write_cache: &dyn WriteCache) -> Result<()> {
        Ok(())
    }

    /// The on-disk queue state format is reserved; nothing is persisted.
    pub fn store_cache_state(&self, _write_cache: &dyn WriteCache) -> Result<()> {
        Ok(())
    }

    fn clear_cache_content(&self) -> Result<()> {
        for entry in self
            .a1in
            .entries()
            .into_iter()
            .chain(self.am.entries())
        {
            Self::drop_unused_entry(entry.file_id(), entry.page_index(), &entry)?;
        }
        for item in self.pinned_pages.iter() {
            Self::drop_unused_entry(item.key().file_id, item.key().page_index, item.value())?;
        }

        self.a1in.clear();
        self.a1out.clear();
        self.am.clear();
        self.pinned_pages.clear();
        self.file_pages.clear();

        let current = self.memory.load();
        loop {
            let snapshot = self.memory.load();
            let new = MemoryData::new(snapshot.max_size, 0);
            if self.memory.compare_exchange(snapshot, new) {
                break;
            }
        }
        debug!(max_size = current.max_size, "cache content cleared");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Budget
    // ------------------------------------------------------------------

    /// Publish a new memory budget.
    ///
    /// Shrinking never evicts inline; the next admission brings the queues
    /// back within the new budget.
    pub fn change_maximum_amount_of_memory(&self, max_memory_bytes: u64) -> Result<()> {
        let new_max_size = (max_memory_bytes / self.config.page_size as u64)
            .min(i32::MAX as u64)
            .max(1) as u32;

        loop {
            let current = self.memory.load();
            if 100 * u64::from(current.pinned_pages) / u64::from(new_max_size)
                > u64::from(self.config.percent_of_pinned_pages)
            {
                return Err(CacheError::IllegalBudgetChange(format!(
                    "{} pinned pages would exceed {}% of the new size of {} pages",
                    current.pinned_pages, self.config.percent_of_pinned_pages, new_max_size
                )));
            }

            let new = MemoryData::new(new_max_size, current.pinned_pages);
            if self.memory.compare_exchange(current, new) {
                info!(max_size = new_max_size, "cache size was changed");
                return Ok(());
            }
        }
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub fn stats(&self) -> CacheStats {
        let requests = self.cache_requests.load(Ordering::Relaxed);
        let hits = self.cache_hits.load(Ordering::Relaxed);
        let hit_rate = if requests == 0 {
            0.0
        } else {
            hits as f64 / requests as f64
        };

        CacheStats {
            cache_requests: requests,
            cache_hits: hits,
            hit_rate,
            a1in_len: self.a1in.len(),
            a1out_len: self.a1out.len(),
            am_len: self.am.len(),
            pinned_pages: self.pinned_pages.len(),
            max_size: self.memory.load().max_size,
        }
    }

    /// Bytes held by resident pages (queues plus pinned table).
    pub fn used_memory_bytes(&self) -> u64 {
        let resident = self.a1in.len() + self.am.len() + self.pinned_pages.len();
        resident as u64 * self.config.page_size as u64
    }

    pub fn statistics_interval(&self) -> Duration {
        self.config.statistics_interval
    }

    /// Report current statistics through the log, if enabled.
    pub fn log_statistics(&self) {
        if !self.config.print_statistics {
            return;
        }
        let stats = self.stats();
        info!(
            requests = stats.cache_requests,
            hits = stats.cache_hits,
            hit_rate = stats.hit_rate,
            a1in = stats.a1in_len,
            a1out = stats.a1out_len,
            am = stats.am_len,
            pinned = stats.pinned_pages,
            "cache statistics"
        );
    }

    /// Cross-check the queues, the pinned table and the per-file index.
    ///
    /// Diagnostic used by integrity checks and tests; takes the exclusive
    /// cache lock for a stable view.
    pub fn verify_consistency(&self) -> Result<()> {
        let _cache = self.cache_lock.write();
        let memory = self.memory.load();

        for file in self.file_pages.iter() {
            let file_id = *file.key();
            for &page_index in file.value() {
                let mut locations = 0usize;
                if let Some(entry) = self.a1in.get(file_id, page_index) {
                    locations += 1;
                    if entry.cache_pointer().is_none() {
                        return Err(CacheError::StorageConsistency(format!(
                            "page {page_index} of file {file_id} is in a1in without a buffer"
                        )));
                    }
                }
                if let Some(entry) = self.a1out.get(file_id, page_index) {
                    locations += 1;
                    if entry.cache_pointer().is_some() {
                        return Err(CacheError::StorageConsistency(format!(
                            "ghost page {page_index} of file {file_id} still holds a buffer"
                        )));
                    }
                }
                if let Some(entry) = self.am.get(file_id, page_index) {
                    locations += 1;
                    if entry.cache_pointer().is_none() {
                        return Err(CacheError::StorageConsistency(format!(
                            "page {page_index} of file {file_id} is in am without a buffer"
                        )));
                    }
                }
                if self
                    .pinned_pages
                    .contains_key(&PinnedPage::new(file_id, page_index))
                {
                    locations += 1;
                }

                if locations != 1 {
                    return Err(CacheError::StorageConsistency(format!(
                        "page {page_index} of file {file_id} is tracked in {locations} locations"
                    )));
                }
            }
        }

        let tracked: usize = self.file_pages.iter().map(|file| file.value().len()).sum();
        let located =
            self.a1in.len() + self.a1out.len() + self.am.len() + self.pinned_pages.len();
        if tracked != located {
            return Err(CacheError::StorageConsistency(format!(
                "file index tracks {tracked} pages but {located} are cached"
            )));
        }

        if self.a1in.len() + self.am.len() > memory.two_q_size() as usize {
            return Err(CacheError::StorageConsistency(format!(
                "resident queues hold {} pages, budget is {}",
                self.a1in.len() + self.am.len(),
                memory.two_q_size()
            )));
        }
        if self.pinned_pages.len() as u64
            > u64::from(self.config.percent_of_pinned_pages) * u64::from(memory.max_size) / 100
        {
            return Err(CacheError::StorageConsistency(format!(
                "{} pinned pages exceed the configured share",
                self.pinned_pages.len()
            )));
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // Admission
    // ------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    fn do_load(
        &self,
        write_cache: &dyn WriteCache,
        file_id: FileId,
        page_index: PageIndex,
        check_pinned: bool,
        add_new_pages: bool,
        page_count: usize,
        verify_checksums: bool,
    ) -> Result<Option<Arc<CacheEntry>>> {
        if page_count < 1 {
            return Err(CacheError::InvalidArgument(format!(
                "page count must be at least 1, got {page_count}"
            )));
        }

        let mut hit = false;
        let mut remove_cold = false;
        let entry = {
            let _cache = self.cache_lock.read();
            let _file = self.file_locks.acquire_shared(file_id);
            self.lookup_or_admit(
                write_cache,
                file_id,
                page_index,
                check_pinned,
                add_new_pages,
                page_count,
                verify_checksums,
                &mut hit,
                &mut remove_cold,
            )?
        };

        self.cache_requests.fetch_add(1, Ordering::Relaxed);
        if hit {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
        }

        let Some(entry) = entry else {
            return Ok(None);
        };

        if remove_cold {
            if let Err(err) = self.remove_coldest_pages_if_needed(write_cache) {
                // The caller never sees the entry, so the holder slot taken
                // in lookup_or_admit has to be given back here.
                self.do_release(&entry);
                return Err(err);
            }
        }

        Ok(Some(entry))
    }

    /// Consult the pinned table and the queues under the page locks; register
    /// the caller as a holder of the returned entry.
    #[allow(clippy::too_many_arguments)]
    fn lookup_or_admit(
        &self,
        write_cache: &dyn WriteCache,
        file_id: FileId,
        page_index: PageIndex,
        check_pinned: bool,
        add_new_pages: bool,
        page_count: usize,
        verify_checksums: bool,
        hit: &mut bool,
        remove_cold: &mut bool,
    ) -> Result<Option<Arc<CacheEntry>>> {
        // Fast path: the pinned table is safe to consult with only the file
        // lock held.
        if check_pinned {
            if let Some(entry) = self.get_pinned(file_id, page_index) {
                entry.inc_usages();
                *hit = true;
                return Ok(Some(entry));
            }
        }

        let page_keys: Vec<PageKey> = (0..page_count as u64)
            .map(|offset| PageKey::new(file_id, page_index + offset))
            .collect();
        let _page_guards = self.page_locks.acquire_exclusive_batch(&page_keys);

        // The page could have been pinned while we were acquiring the locks.
        if check_pinned {
            if let Some(entry) = self.get_pinned(file_id, page_index) {
                entry.inc_usages();
                *hit = true;
                return Ok(Some(entry));
            }
        }

        let (entry, cold, cache_hit) = self.update_cache(
            write_cache,
            file_id,
            page_index,
            page_count,
            add_new_pages,
            verify_checksums,
        )?;
        *remove_cold = cold;
        *hit = cache_hit;

        if let Some(entry) = &entry {
            entry.inc_usages();
        }
        Ok(entry)
    }

    fn get_pinned(&self, file_id: FileId, page_index: PageIndex) -> Option<Arc<CacheEntry>> {
        self.pinned_pages
            .get(&PinnedPage::new(file_id, page_index))
            .map(|entry| Arc::clone(entry.value()))
    }

    /// 2Q admission and promotion for the primary page.
    ///
    /// Returns the entry, whether an eviction pass should run, and whether
    /// the access counts as a cache hit.
    fn update_cache(
        &self,
        write_cache: &dyn WriteCache,
        file_id: FileId,
        page_index: PageIndex,
        page_count: usize,
        add_new_pages: bool,
        verify_checksums: bool,
    ) -> Result<(Option<Arc<CacheEntry>>, bool, bool)> {
        if let Some(entry) = self.am.get(file_id, page_index) {
            self.am.put_to_mru(Arc::clone(&entry));
            return Ok((Some(entry), false, true));
        }

        if let Some(entry) = self.a1out.remove(file_id, page_index) {
            // Ghost hit: the key was evicted recently. Re-fetch the data and
            // promote straight into the hot queue.
            let (pointers, write_hit) = write_cache.load(
                file_id,
                page_index,
                page_count,
                add_new_pages,
                verify_checksums,
            )?;
            let Some(primary) = pointers.first() else {
                // The page vanished underneath the ghost queue; forget it.
                self.forget_page(file_id, page_index);
                return Ok((None, false, false));
            };

            entry.set_pointer(Arc::clone(primary));
            self.am.put_to_mru(Arc::clone(&entry));

            let mut remove_cold = true;
            for pointer in pointers.iter().skip(1) {
                remove_cold |= self.process_fetched_page(pointer);
            }
            return Ok((Some(entry), remove_cold, write_hit));
        }

        if let Some(entry) = self.a1in.get(file_id, page_index) {
            return Ok((Some(entry), false, true));
        }

        let (pointers, write_hit) = write_cache.load(
            file_id,
            page_index,
            page_count,
            add_new_pages,
            verify_checksums,
        )?;
        let Some(primary) = pointers.first() else {
            return Ok((None, false, false));
        };

        let entry = Arc::new(CacheEntry::new(
            file_id,
            page_index,
            Some(Arc::clone(primary)),
        ));
        self.a1in.put_to_mru(Arc::clone(&entry));
        self.track_page(file_id, page_index);

        let mut remove_cold = true;
        for pointer in pointers.iter().skip(1) {
            remove_cold |= self.process_fetched_page(pointer);
        }
        Ok((Some(entry), remove_cold, write_hit))
    }

    /// Admission for a prefetched sibling page. An already resident page wins
    /// over the freshly fetched buffer.
    fn process_fetched_page(&self, pointer: &Arc<CachePointer>) -> bool {
        let file_id = pointer.file_id();
        let page_index = pointer.page_index();

        if self
            .pinned_pages
            .contains_key(&PinnedPage::new(file_id, page_index))
        {
            pointer.decrement_readers_referrer();
            return false;
        }

        if self.am.get(file_id, page_index).is_some() || self.a1in.get(file_id, page_index).is_some()
        {
            pointer.decrement_readers_referrer();
            return false;
        }

        if let Some(entry) = self.a1out.remove(file_id, page_index) {
            entry.set_pointer(Arc::clone(pointer));
            self.am.put_to_mru(entry);
            return true;
        }

        let entry = Arc::new(CacheEntry::new(
            file_id,
            page_index,
            Some(Arc::clone(pointer)),
        ));
        self.a1in.put_to_mru(entry);
        self.track_page(file_id, page_index);
        true
    }

    fn track_page(&self, file_id: FileId, page_index: PageIndex) {
        self.file_pages
            .entry(file_id)
            .or_default()
            .insert(page_index);
    }

    fn forget_page(&self, file_id: FileId, page_index: PageIndex) {
        if let Some(mut pages) = self.file_pages.get_mut(&file_id) {
            pages.remove(&page_index);
        }
    }

    // ------------------------------------------------------------------
    // Eviction
    // ------------------------------------------------------------------

    /// Bring the resident queues back within the budget.
    ///
    /// Runs with no other cache locks held. The write cache gets a chance to
    /// apply back pressure for dirty pages first; that wait may block and its
    /// interruption fails the current operation.
    pub fn remove_coldest_pages_if_needed(&self, write_cache: &dyn WriteCache) -> Result<()> {
        write_cache.check_cache_overflow()?;

        let _cache = self.cache_lock.write();
        loop {
            let memory = self.memory.load();
            if self.a1in.len() + self.am.len() <= memory.two_q_size() as usize {
                break;
            }

            if self.a1in.len() > memory.k_in() as usize {
                let entry = self
                    .a1in
                    .remove_lru()
                    .ok_or(CacheError::AllEntriesUsed("a1in"))?;
                debug_assert_eq!(entry.usages(), 0);

                // A buffer can be absent on entries left over from recovery.
                if let Some(pointer) = entry.take_pointer() {
                    pointer.decrement_readers_referrer();
                }
                self.a1out.put_to_mru(entry);

                while self.a1out.len() > memory.k_out() as usize {
                    let ghost = self
                        .a1out
                        .remove_lru()
                        .expect("ghost queue entries are never in use");
                    self.forget_page(ghost.file_id(), ghost.page_index());
                }
            } else {
                let entry = self
                    .am
                    .remove_lru()
                    .ok_or(CacheError::AllEntriesUsed("am"))?;
                debug_assert_eq!(entry.usages(), 0);

                if let Some(pointer) = entry.take_pointer() {
                    pointer.decrement_readers_referrer();
                }
                self.forget_page(entry.file_id(), entry.page_index());
            }
        }

        Ok(())
    }
}

// ============================================================================
// Facade
// ============================================================================

impl ReadCache for TwoQCache {
    fn add_file(&self, write_cache: &dyn WriteCache, name: &str) -> Result<FileId> {
        TwoQCache::add_file(self, write_cache, name)
    }

    fn add_file_with_id(
        &self,
        write_cache: &dyn WriteCache,
        name: &str,
        file_id: FileId,
    ) -> Result<FileId> {
        TwoQCache::add_file_with_id(self, write_cache, name, file_id)
    }

    fn load_for_read(
        &self,
        write_cache: &dyn WriteCache,
        file_id: FileId,
        page_index: PageIndex,
        check_pinned: bool,
        page_count: usize,
        verify_checksums: bool,
    ) -> Result<Option<Arc<CacheEntry>>> {
        TwoQCache::load_for_read(
            self,
            write_cache,
            file_id,
            page_index,
            check_pinned,
            page_count,
            verify_checksums,
        )
    }

    fn load_for_write(
        &self,
        write_cache: &dyn WriteCache,
        file_id: FileId,
        page_index: PageIndex,
        check_pinned: bool,
        page_count: usize,
        verify_checksums: bool,
    ) -> Result<Option<Arc<CacheEntry>>> {
        TwoQCache::load_for_write(
            self,
            write_cache,
            file_id,
            page_index,
            check_pinned,
            page_count,
            verify_checksums,
        )
    }

    fn release_from_read(&self, write_cache: &dyn WriteCache, entry: &Arc<CacheEntry>) {
        TwoQCache::release_from_read(self, write_cache, entry)
    }

    fn release_from_write(
        &self,
        write_cache: &dyn WriteCache,
        entry: &Arc<CacheEntry>,
    ) -> Result<()> {
        TwoQCache::release_from_write(self, write_cache, entry)
    }

    fn pin_page(&self, write_cache: &dyn WriteCache, entry: &Arc<CacheEntry>) -> Result<()> {
        TwoQCache::pin_page(self, write_cache, entry)
    }

    fn allocate_new_page(
        &self,
        write_cache: &dyn WriteCache,
        file_id: FileId,
    ) -> Result<Arc<CacheEntry>> {
        TwoQCache::allocate_new_page(self, write_cache, file_id)
    }

    fn truncate_file(&self, write_cache: &dyn WriteCache, file_id: FileId) -> Result<()> {
        TwoQCache::truncate_file(self, write_cache, file_id)
    }

    fn close_file(&self, write_cache: &dyn WriteCache, file_id: FileId, flush: bool) -> Result<()> {
        TwoQCache::close_file(self, write_cache, file_id, flush)
    }

    fn delete_file(&self, write_cache: &dyn WriteCache, file_id: FileId) -> Result<()> {
        TwoQCache::delete_file(self, write_cache, file_id)
    }

    fn clear(&self) -> Result<()> {
        TwoQCache::clear(self)
    }

    fn close_storage(&self, write_cache: &dyn WriteCache) -> Result<()> {
        TwoQCache::close_storage(self, write_cache)
    }

    fn delete_storage(&self, write_cache: &dyn WriteCache) -> Result<()> {
        TwoQCache::delete_storage(self, write_cache)
    }

    fn load_cache_state(&self, write_cache: &dyn WriteCache) -> Result<()> {
        TwoQCache::load_cache_state(self, write_cache)
    }

    fn store_cache_state(&self, write_cache: &dyn WriteCache) -> Result<()> {
        TwoQCache::store_cache_state(self, write_cache)
    }

    fn change_maximum_amount_of_memory(&self, max_memory_bytes: u64) -> Result<()> {
        TwoQCache::change_maximum_amount_of_memory(self, max_memory_bytes)
    }
}

// ============================================================================
// Tests
// ============================================================================
