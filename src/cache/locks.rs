// # Cache Locks
//
// The three outer levels of the cache lock hierarchy:
//
// 1. [`CacheRwSpinLock`] - global readers-writer spinlock with writer
//    preference. Data-plane operations hold it shared; eviction and global
//    operations hold it exclusive.
// 2. [`FileLockManager`] - partitioned per-file readers-writer locks.
// 3. [`PageLockManager`] - partitioned per-page locks, with a sorted batch
//    acquisition used by multi-page prefetch.
//
// State encoding of the spinlock (32-bit atomic):
// - Bits 0-23: reader count
// - Bit 24: writer lock bit
// - Bits 25-31: waiting writers count

use crate::common::{FileId, PageKey};
use crossbeam::utils::Backoff;
use parking_lot::lock_api::RawRwLock as RawRwLockApi;
use parking_lot::{Mutex, RawRwLock};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

/// Reader count mask (bits 0-23)
const READER_MASK: u32 = 0x00FF_FFFF;

/// Writer lock bit (bit 24)
const WRITER_BIT: u32 = 0x0100_0000;

/// Waiting writers shift (bits 25-31)
const WAITING_SHIFT: u32 = 25;

/// Waiting writers mask
const WAITING_MASK: u32 = 0x7F << WAITING_SHIFT;

// ============================================================================
// Global Cache Lock - Readers-Writer Spinlock
// ============================================================================

/// Readers-writer spinlock guarding the cache state as a whole.
///
/// Writers have preference: a pending exclusive acquisition blocks new shared
/// acquisitions, so readers cannot starve the eviction path.
pub struct CacheRwSpinLock {
    /// Lock state: [waiting_writers:7][writer:1][readers:24]
    state: AtomicU32,
}

impl CacheRwSpinLock {
    pub const fn new() -> Self {
        Self {
            state: AtomicU32::new(0),
        }
    }

    /// Acquire the lock in shared mode.
    #[inline]
    pub fn read(&self) -> CacheReadGuard<'_> {
        let backoff = Backoff::new();
        loop {
            let state = self.state.load(Ordering::Acquire);

            // Pending or active writers have priority.
            if state & (WRITER_BIT | WAITING_MASK) != 0 {
                backoff.snooze();
                continue;
            }

            assert!(state & READER_MASK < READER_MASK, "reader count overflow");

            if self
                .state
                .compare_exchange_weak(state, state + 1, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return CacheReadGuard { lock: self };
            }
        }
    }

    /// Acquire the lock in exclusive mode.
    #[inline]
    pub fn write(&self) -> CacheWriteGuard<'_> {
        self.announce_writer();

        let backoff = Backoff::new();
        loop {
            let state = self.state.load(Ordering::Acquire);

            if state & (READER_MASK | WRITER_BIT) == 0 {
                // Take the writer bit and leave the waiting queue in one step.
                let new_state = (state - (1 << WAITING_SHIFT)) | WRITER_BIT;
                if self
                    .state
                    .compare_exchange_weak(state, new_state, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    return CacheWriteGuard { lock: self };
                }
                continue;
            }

            backoff.snooze();
        }
    }

    #[inline]
    fn announce_writer(&self) {
        let backoff = Backoff::new();
        loop {
            let state = self.state.load(Ordering::Acquire);
            if (state & WAITING_MASK) == WAITING_MASK {
                // Waiting counter saturated; wait for a slot.
                backoff.snooze();
                continue;
            }
            if self
                .state
                .compare_exchange_weak(
                    state,
                    state + (1 << WAITING_SHIFT),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                return;
            }
        }
    }

    #[inline]
    fn release_read(&self) {
        self.state.fetch_sub(1, Ordering::Release);
    }

    #[inline]
    fn release_write(&self) {
        self.state.fetch_and(!WRITER_BIT, Ordering::Release);
    }
}

impl Default for CacheRwSpinLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared-mode guard for [`CacheRwSpinLock`]
pub struct CacheReadGuard<'a> {
    lock: &'a CacheRwSpinLock,
}

impl Drop for CacheReadGuard<'_> {
    #[inline]
    fn drop(&mut self) {
        self.lock.release_read();
    }
}

/// Exclusive-mode guard for [`CacheRwSpinLock`]
pub struct CacheWriteGuard<'a> {
    lock: &'a CacheRwSpinLock,
}

impl Drop for CacheWriteGuard<'_> {
    #[inline]
    fn drop(&mut self) {
        self.lock.release_write();
    }
}

// ============================================================================
// Partitioned Key Locks
// ============================================================================

/// One shared/exclusive lock slot, kept alive while any acquirer refers to it
struct LockSlot {
    raw: RawRwLock,
    referrers: AtomicUsize,
}

impl LockSlot {
    fn new() -> Self {
        Self {
            raw: RawRwLock::INIT,
            referrers: AtomicUsize::new(0),
        }
    }
}

/// Partitioned table of per-key readers-writer locks.
///
/// Slots are created on first acquisition and removed when the last referrer
/// drops, so the table stays proportional to the number of keys currently
/// locked, not the number of keys ever seen.
struct PartitionedLockTable<K: Eq + Hash + Copy> {
    shards: Vec<Mutex<HashMap<K, Arc<LockSlot>>>>,
    shard_mask: usize,
}

impl<K: Eq + Hash + Copy> PartitionedLockTable<K> {
    fn new(shard_count: usize) -> Self {
        let shard_count = shard_count.next_power_of_two();
        let mut shards = Vec::with_capacity(shard_count);
        for _ in 0..shard_count {
            shards.push(Mutex::new(HashMap::new()));
        }
        Self {
            shards,
            shard_mask: shard_count - 1,
        }
    }

    #[inline]
    fn shard_index(&self, key: &K) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) & self.shard_mask
    }

    fn acquire(&self, key: K, exclusive: bool) -> KeyLockGuard<'_, K> {
        let slot = {
            let mut shard = self.shards[self.shard_index(&key)].lock();
            let slot = shard.entry(key).or_insert_with(|| Arc::new(LockSlot::new()));
            slot.referrers.fetch_add(1, Ordering::Relaxed);
            Arc::clone(slot)
        };

        // Block outside the shard mutex so unrelated keys never contend.
        if exclusive {
            slot.raw.lock_exclusive();
        } else {
            slot.raw.lock_shared();
        }

        KeyLockGuard {
            table: self,
            key,
            slot,
            exclusive,
        }
    }

    fn release(&self, key: &K, slot: &Arc<LockSlot>, exclusive: bool) {
        // SAFETY: the guard being dropped acquired the lock in this mode.
        unsafe {
            if exclusive {
                slot.raw.unlock_exclusive();
            } else {
                slot.raw.unlock_shared();
            }
        }

        let mut shard = self.shards[self.shard_index(key)].lock();
        if slot.referrers.fetch_sub(1, Ordering::Relaxed) == 1 {
            shard.remove(key);
        }
    }
}

/// RAII guard over a single key lock
pub struct KeyLockGuard<'a, K: Eq + Hash + Copy> {
    table: &'a PartitionedLockTable<K>,
    key: K,
    slot: Arc<LockSlot>,
    exclusive: bool,
}

impl<K: Eq + Hash + Copy> Drop for KeyLockGuard<'_, K> {
    fn drop(&mut self) {
        self.table.release(&self.key, &self.slot, self.exclusive);
    }
}

pub type PageLockGuard<'a> = KeyLockGuard<'a, PageKey>;
pub type FileLockGuard<'a> = KeyLockGuard<'a, FileId>;

fn default_shard_count() -> usize {
    (num_cpus::get() * 4).max(16)
}

/// Per-page lock table keyed by `(file_id, page_index)`.
pub struct PageLockManager {
    table: PartitionedLockTable<PageKey>,
}

impl PageLockManager {
    pub fn new() -> Self {
        Self {
            table: PartitionedLockTable::new(default_shard_count()),
        }
    }

    pub fn acquire_shared(&self, key: PageKey) -> PageLockGuard<'_> {
        self.table.acquire(key, false)
    }

    pub fn acquire_exclusive(&self, key: PageKey) -> PageLockGuard<'_> {
        self.table.acquire(key, true)
    }

    /// Acquire exclusive locks for all distinct keys, in ascending
    /// `(file_id, page_index)` order.
    ///
    /// Every batched or single-key acquirer observes the same canonical
    /// order, which keeps overlapping prefetch ranges deadlock-free.
    pub fn acquire_exclusive_batch(&self, keys: &[PageKey]) -> Vec<PageLockGuard<'_>> {
        let mut sorted: Vec<PageKey> = keys.to_vec();
        sorted.sort_unstable();
        sorted.dedup();

        sorted
            .into_iter()
            .map(|key| self.table.acquire(key, true))
            .collect()
    }
}

impl Default for PageLockManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-file lock table.
///
/// Data-plane operations hold the file lock shared; file lifecycle operations
/// (truncate, close, delete, page allocation) hold it exclusive.
pub struct FileLockManager {
    table: PartitionedLockTable<FileId>,
}

impl FileLockManager {
    pub fn new() -> Self {
        Self {
            table: PartitionedLockTable::new(default_shard_count()),
        }
    }

    pub fn acquire_shared(&self, file_id: FileId) -> FileLockGuard<'_> {
        self.table.acquire(file_id, false)
    }

    pub fn acquire_exclusive(&self, file_id: FileId) -> FileLockGuard<'_> {
        self.table.acquire(file_id, true)
    }
}

impl Default for FileLockManager {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_spinlock_shared_readers() {
        let lock = Arc::new(CacheRwSpinLock::new());
        let mut handles = vec![];

        for _ in 0..8 {
            let lock = Arc::clone(&lock);
            handles.push(thread::spawn(move || {
                let _guard = lock.read();
                thread::sleep(Duration::from_millis(5));
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn test_spinlock_writer_excludes_readers() {
        let lock = Arc::new(CacheRwSpinLock::new());
        let counter = Arc::new(AtomicU32::new(0));
        let mut handles = vec![];

        for _ in 0..4 {
            let lock = Arc::clone(&lock);
            let counter = Arc::clone(&counter);
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    let _guard = lock.write();
                    let value = counter.load(Ordering::Relaxed);
                    counter.store(value + 1, Ordering::Relaxed);
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(counter.load(Ordering::Relaxed), 4000);
    }

    #[test]
    fn test_spinlock_writer_preference() {
        let lock = Arc::new(CacheRwSpinLock::new());
        let writer_done = Arc::new(AtomicBool::new(false));

        let reader = lock.read();

        let writer = {
            let lock = Arc::clone(&lock);
            let writer_done = Arc::clone(&writer_done);
            thread::spawn(move || {
                let _guard = lock.write();
                writer_done.store(true, Ordering::Release);
            })
        };

        // The writer is blocked on the active reader.
        thread::sleep(Duration::from_millis(20));
        assert!(!writer_done.load(Ordering::Acquire));

        drop(reader);
        writer.join().unwrap();
        assert!(writer_done.load(Ordering::Acquire));
    }

    #[test]
    fn test_page_lock_manager_distinct_keys() {
        let manager = PageLockManager::new();

        let a = manager.acquire_exclusive(PageKey::new(1, 0));
        let b = manager.acquire_exclusive(PageKey::new(1, 1));
        drop(a);
        drop(b);

        // The table cleans up after itself: re-acquisition works immediately.
        let _c = manager.acquire_exclusive(PageKey::new(1, 0));
    }

    #[test]
    fn test_page_lock_blocks_across_threads() {
        let manager = Arc::new(PageLockManager::new());
        let key = PageKey::new(3, 7);
        let entered = Arc::new(AtomicBool::new(false));

        let guard = manager.acquire_exclusive(key);

        let handle = {
            let manager = Arc::clone(&manager);
            let entered = Arc::clone(&entered);
            thread::spawn(move || {
                let _guard = manager.acquire_exclusive(key);
                entered.store(true, Ordering::Release);
            })
        };

        thread::sleep(Duration::from_millis(20));
        assert!(!entered.load(Ordering::Acquire));

        drop(guard);
        handle.join().unwrap();
        assert!(entered.load(Ordering::Acquire));
    }

    #[test]
    fn test_page_lock_shared_mode() {
        let manager = Arc::new(PageLockManager::new());
        let key = PageKey::new(5, 5);

        // Multiple shared holders coexist.
        let a = manager.acquire_shared(key);
        let b = manager.acquire_shared(key);

        let blocked = Arc::new(AtomicBool::new(false));
        let handle = {
            let manager = Arc::clone(&manager);
            let blocked = Arc::clone(&blocked);
            thread::spawn(move || {
                let _guard = manager.acquire_exclusive(key);
                blocked.store(true, Ordering::Release);
            })
        };

        thread::sleep(Duration::from_millis(20));
        assert!(!blocked.load(Ordering::Acquire));

        drop(a);
        drop(b);
        handle.join().unwrap();
    }

    #[test]
    fn test_batch_acquisition_sorts_and_dedups() {
        let manager = PageLockManager::new();

        let keys = vec![
            PageKey::new(2, 1),
            PageKey::new(1, 5),
            PageKey::new(2, 1),
            PageKey::new(1, 2),
        ];

        let guards = manager.acquire_exclusive_batch(&keys);
        assert_eq!(guards.len(), 3);
        drop(guards);

        // All keys are unlocked again.
        let _again = manager.acquire_exclusive_batch(&keys);
    }

    #[test]
    fn test_file_lock_shared_then_exclusive() {
        let manager = Arc::new(FileLockManager::new());
        let entered = Arc::new(AtomicBool::new(false));

        let shared_a = manager.acquire_shared(9);
        let shared_b = manager.acquire_shared(9);

        let handle = {
            let manager = Arc::clone(&manager);
            let entered = Arc::clone(&entered);
            thread::spawn(move || {
                let _guard = manager.acquire_exclusive(9);
                entered.store(true, Ordering::Release);
            })
        };

        thread::sleep(Duration::from_millis(20));
        assert!(!entered.load(Ordering::Acquire));

        drop(shared_a);
        drop(shared_b);
        handle.join().unwrap();
    }
}
