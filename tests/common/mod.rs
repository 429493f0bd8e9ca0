// Instrumented in-memory write cache used by the integration tests.
//
// Not every test binary uses every helper.
#![allow(dead_code)]

use parking_lot::Mutex;
use rusty_cache::cache::WriteCache;
use rusty_cache::{CacheError, CachePointer, FileId, PageIndex, Result};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Everything the mock observed, in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Load {
        file_id: FileId,
        page_index: PageIndex,
        count: usize,
    },
    Store {
        file_id: FileId,
        page_index: PageIndex,
        /// Whether the pointer's exclusive content lock was still held when
        /// the store call arrived.
        exclusive_held: bool,
    },
    DirtyTable {
        file_id: FileId,
        page_index: PageIndex,
    },
    Overflow,
}

#[derive(Default)]
struct FileData {
    name: String,
    pages: Vec<Vec<u8>>,
}

pub struct MockWriteCache {
    files: Mutex<BTreeMap<FileId, FileData>>,
    next_file_id: AtomicU64,
    page_size: usize,
    root: PathBuf,

    /// Value reported as the write-cache-hit flag on load
    write_hit: AtomicBool,

    /// Makes `check_cache_overflow` fail as if the wait was interrupted
    interrupt_overflow: AtomicBool,

    /// Makes `update_dirty_pages_table` fail
    fail_dirty_table: AtomicBool,

    events: Mutex<Vec<Event>>,

    /// Every pointer ever handed out, for leak accounting
    pointers: Mutex<Vec<Arc<CachePointer>>>,
}

impl MockWriteCache {
    pub fn new(page_size: usize, root: PathBuf) -> Self {
        Self {
            files: Mutex::new(BTreeMap::new()),
            next_file_id: AtomicU64::new(1),
            page_size,
            root,
            write_hit: AtomicBool::new(false),
            interrupt_overflow: AtomicBool::new(false),
            fail_dirty_table: AtomicBool::new(false),
            events: Mutex::new(Vec::new()),
            pointers: Mutex::new(Vec::new()),
        }
    }

    /// Register a file with `page_count` deterministic pages.
    pub fn seed_file(&self, name: &str, page_count: usize) -> FileId {
        let file_id = self.next_file_id.fetch_add(1, Ordering::Relaxed);
        let pages = (0..page_count)
            .map(|index| self.page_body(file_id, index as u64))
            .collect();
        self.files.lock().insert(
            file_id,
            FileData {
                name: name.to_string(),
                pages,
            },
        );
        file_id
    }

    fn page_body(&self, file_id: FileId, page_index: PageIndex) -> Vec<u8> {
        let mut body = vec![0u8; self.page_size];
        body[0] = file_id as u8;
        body[1] = page_index as u8;
        body
    }

    pub fn set_write_hit(&self, hit: bool) {
        self.write_hit.store(hit, Ordering::Relaxed);
    }

    pub fn set_interrupt_overflow(&self, interrupt: bool) {
        self.interrupt_overflow.store(interrupt, Ordering::Relaxed);
    }

    pub fn set_fail_dirty_table(&self, fail: bool) {
        self.fail_dirty_table.store(fail, Ordering::Relaxed);
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    fn record(&self, event: Event) {
        self.events.lock().push(event);
    }

    /// Pointers whose reader reference count is still positive.
    pub fn referenced_pointers(&self) -> usize {
        self.pointers
            .lock()
            .iter()
            .filter(|pointer| pointer.readers_referrer() > 0)
            .count()
    }

    pub fn file_name(&self, file_id: FileId) -> Option<String> {
        self.files
            .lock()
            .get(&file_id)
            .map(|file| file.name.clone())
    }

    pub fn page_count(&self, file_id: FileId) -> usize {
        self.files
            .lock()
            .get(&file_id)
            .map(|file| file.pages.len())
            .unwrap_or(0)
    }

    fn make_pointer(&self, file_id: FileId, page_index: PageIndex, data: Vec<u8>) -> Arc<CachePointer> {
        let pointer = Arc::new(CachePointer::new(file_id, page_index, data));
        self.pointers.lock().push(Arc::clone(&pointer));
        pointer
    }
}

impl WriteCache for MockWriteCache {
    fn id(&self) -> u64 {
        1
    }

    fn root_directory(&self) -> PathBuf {
        self.root.clone()
    }

    fn file_id_for(&self, file_id: FileId) -> Result<FileId> {
        Ok(file_id)
    }

    fn add_file(&self, name: &str) -> Result<FileId> {
        let file_id = self.next_file_id.fetch_add(1, Ordering::Relaxed);
        self.files.lock().insert(
            file_id,
            FileData {
                name: name.to_string(),
                pages: Vec::new(),
            },
        );
        Ok(file_id)
    }

    fn add_file_with_id(&self, name: &str, file_id: FileId) -> Result<FileId> {
        self.files.lock().entry(file_id).or_insert_with(|| FileData {
            name: name.to_string(),
            pages: Vec::new(),
        });
        Ok(file_id)
    }

    fn load(
        &self,
        file_id: FileId,
        start_index: PageIndex,
        count: usize,
        allocate_if_missing: bool,
        _verify_checksums: bool,
    ) -> Result<(Vec<Arc<CachePointer>>, bool)> {
        self.record(Event::Load {
            file_id,
            page_index: start_index,
            count,
        });

        let mut files = self.files.lock();
        let file = files
            .get_mut(&file_id)
            .ok_or_else(|| CacheError::InvalidArgument(format!("unknown file {file_id}")))?;

        let mut pointers = Vec::new();
        for offset in 0..count as u64 {
            let page_index = start_index + offset;
            if let Some(data) = file.pages.get(page_index as usize) {
                pointers.push(self.make_pointer(file_id, page_index, data.clone()));
            } else {
                break;
            }
        }

        if pointers.is_empty() && allocate_if_missing {
            while file.pages.len() <= start_index as usize {
                file.pages.push(vec![0u8; self.page_size]);
            }
            let data = file.pages[start_index as usize].clone();
            pointers.push(self.make_pointer(file_id, start_index, data));
        }

        Ok((pointers, self.write_hit.load(Ordering::Relaxed)))
    }

    fn store(
        &self,
        file_id: FileId,
        page_index: PageIndex,
        pointer: &Arc<CachePointer>,
    ) -> Result<()> {
        let exclusive_held = if pointer.try_acquire_shared_lock() {
            pointer.release_shared_lock();
            false
        } else {
            true
        };
        self.record(Event::Store {
            file_id,
            page_index,
            exclusive_held,
        });

        let mut files = self.files.lock();
        let file = files
            .get_mut(&file_id)
            .ok_or_else(|| CacheError::InvalidArgument(format!("unknown file {file_id}")))?;
        while file.pages.len() <= page_index as usize {
            file.pages.push(vec![0u8; self.page_size]);
        }
        file.pages[page_index as usize] = pointer.data().clone();
        Ok(())
    }

    fn update_dirty_pages_table(&self, pointer: &Arc<CachePointer>) -> Result<()> {
        if self.fail_dirty_table.load(Ordering::Relaxed) {
            return Err(CacheError::StorageConsistency(
                "dirty pages table rejected the update".to_string(),
            ));
        }
        self.record(Event::DirtyTable {
            file_id: pointer.file_id(),
            page_index: pointer.page_index(),
        });
        Ok(())
    }

    fn filled_up_to(&self, file_id: FileId) -> Result<PageIndex> {
        Ok(self.page_count(file_id) as PageIndex)
    }

    fn truncate_file(&self, file_id: FileId) -> Result<()> {
        if let Some(file) = self.files.lock().get_mut(&file_id) {
            file.pages.clear();
        }
        Ok(())
    }

    fn close_file(&self, _file_id: FileId, _flush: bool) -> Result<()> {
        Ok(())
    }

    fn close(&self) -> Result<Vec<FileId>> {
        Ok(self.files.lock().keys().copied().collect())
    }

    fn delete_file(&self, file_id: FileId) -> Result<()> {
        self.files.lock().remove(&file_id);
        Ok(())
    }

    fn delete(&self) -> Result<Vec<FileId>> {
        let mut files = self.files.lock();
        let ids = files.keys().copied().collect();
        files.clear();
        Ok(ids)
    }

    fn check_cache_overflow(&self) -> Result<()> {
        self.record(Event::Overflow);
        if self.interrupt_overflow.load(Ordering::Relaxed) {
            return Err(CacheError::Interrupted(
                "wait for dirty page flush was interrupted".to_string(),
            ));
        }
        Ok(())
    }
}
