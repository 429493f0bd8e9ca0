// # LRU List - Keyed Recency Queue
//
// Ordered MRU -> LRU sequence of cache entries with O(1) lookup by page key.
// Backed by an intrusive doubly-linked list stored in a slab vector for cache
// locality, plus a hash index from page key to slab slot.
//
// The whole structure is guarded by a single mutex with small critical
// sections. Concurrent `put_to_mru` calls may interleave in either order, but
// `remove` and `remove_lru` are atomic with respect to the list state.

use crate::cache::entry::CacheEntry;
use crate::common::{FileId, PageIndex, PageKey};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

struct Node {
    key: PageKey,
    entry: Arc<CacheEntry>,
    prev: Option<usize>,
    next: Option<usize>,
}

struct LruListInner {
    /// Slab of nodes; freed slots are recycled through `free`
    nodes: Vec<Option<Node>>,

    /// Recycled slot indices
    free: Vec<usize>,

    /// Page key -> slab slot
    index: HashMap<PageKey, usize>,

    /// Most recently used end
    head: Option<usize>,

    /// Least recently used end
    tail: Option<usize>,
}

impl LruListInner {
    fn unlink(&mut self, slot: usize) {
        let (prev, next) = {
            let node = self.nodes[slot].as_ref().expect("slot must be occupied");
            (node.prev, node.next)
        };

        match prev {
            Some(p) => self.nodes[p].as_mut().expect("linked slot").next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.nodes[n].as_mut().expect("linked slot").prev = prev,
            None => self.tail = prev,
        }
    }

    fn link_front(&mut self, slot: usize) {
        let old_head = self.head;
        {
            let node = self.nodes[slot].as_mut().expect("slot must be occupied");
            node.prev = None;
            node.next = old_head;
        }
        if let Some(h) = old_head {
            self.nodes[h].as_mut().expect("linked slot").prev = Some(slot);
        }
        self.head = Some(slot);
        if self.tail.is_none() {
            self.tail = Some(slot);
        }
    }

    fn alloc(&mut self, node: Node) -> usize {
        match self.free.pop() {
            Some(slot) => {
                self.nodes[slot] = Some(node);
                slot
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        }
    }

    fn release(&mut self, slot: usize) -> Node {
        let node = self.nodes[slot].take().expect("slot must be occupied");
        self.free.push(slot);
        node
    }
}

/// Recency queue of resident or ghost cache entries.
///
/// Three independent instances back the admission queue, the ghost queue and
/// the hot queue of the cache.
pub struct LruList {
    inner: Mutex<LruListInner>,
}

impl LruList {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(LruListInner {
                nodes: Vec::new(),
                free: Vec::new(),
                index: HashMap::new(),
                head: None,
                tail: None,
            }),
        }
    }

    /// Insert the entry at the MRU end, or move it there if already present.
    pub fn put_to_mru(&self, entry: Arc<CacheEntry>) {
        let key = entry.key();
        let mut inner = self.inner.lock();

        if let Some(&slot) = inner.index.get(&key) {
            inner.unlink(slot);
            inner.nodes[slot].as_mut().expect("indexed slot").entry = entry;
            inner.link_front(slot);
        } else {
            let slot = inner.alloc(Node {
                key,
                entry,
                prev: None,
                next: None,
            });
            inner.index.insert(key, slot);
            inner.link_front(slot);
        }
    }

    /// Look up an entry without changing its position.
    pub fn get(&self, file_id: FileId, page_index: PageIndex) -> Option<Arc<CacheEntry>> {
        let inner = self.inner.lock();
        let slot = *inner.index.get(&PageKey::new(file_id, page_index))?;
        Some(Arc::clone(
            &inner.nodes[slot].as_ref().expect("indexed slot").entry,
        ))
    }

    /// Remove and return the entry for the given key, if present.
    pub fn remove(&self, file_id: FileId, page_index: PageIndex) -> Option<Arc<CacheEntry>> {
        let mut inner = self.inner.lock();
        let slot = inner.index.remove(&PageKey::new(file_id, page_index))?;
        inner.unlink(slot);
        Some(inner.release(slot).entry)
    }

    /// Remove and return the coldest entry that is not in use.
    ///
    /// Entries with a non-zero usage count are skipped; returns `None` when
    /// every entry is in use (or the list is empty).
    pub fn remove_lru(&self) -> Option<Arc<CacheEntry>> {
        let mut inner = self.inner.lock();

        let mut cursor = inner.tail;
        while let Some(slot) = cursor {
            let (evictable, key, prev) = {
                let node = inner.nodes[slot].as_ref().expect("linked slot");
                (node.entry.usages() == 0, node.key, node.prev)
            };
            if evictable {
                inner.unlink(slot);
                inner.index.remove(&key);
                return Some(inner.release(slot).entry);
            }
            cursor = prev;
        }

        None
    }

    pub fn len(&self) -> usize {
        self.inner.lock().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of all entries in MRU -> LRU order.
    pub fn entries(&self) -> Vec<Arc<CacheEntry>> {
        let inner = self.inner.lock();
        let mut out = Vec::with_capacity(inner.index.len());
        let mut cursor = inner.head;
        while let Some(slot) = cursor {
            let node = inner.nodes[slot].as_ref().expect("linked slot");
            out.push(Arc::clone(&node.entry));
            cursor = node.next;
        }
        out
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.nodes.clear();
        inner.free.clear();
        inner.index.clear();
        inner.head = None;
        inner.tail = None;
    }
}

impl Default for LruList {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================
