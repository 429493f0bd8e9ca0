// # Memory Budget - Immutable Snapshot, CAS-Swapped
//
// The cache budget is two numbers: the overall capacity in pages and the
// number of currently pinned pages. Every derived size is computed from those
// two, so both halves are packed into one 64-bit atomic and replaced with a
// single compare-and-swap. Readers always observe a consistent pair.

use std::sync::atomic::{AtomicU64, Ordering};

/// Immutable snapshot of the cache budget.
///
/// Derived sizes must come from the same snapshot; never mix `k_in()` of one
/// snapshot with `two_q_size()` of another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryData {
    /// Overall capacity in pages
    pub max_size: u32,

    /// Pages currently held in the pinned table
    pub pinned_pages: u32,
}

impl MemoryData {
    #[inline]
    pub fn new(max_size: u32, pinned_pages: u32) -> Self {
        Self {
            max_size,
            pinned_pages,
        }
    }

    /// Budget available to the admission and hot queues combined
    #[inline]
    pub fn two_q_size(&self) -> u32 {
        self.max_size - self.pinned_pages
    }

    /// Target size of the admission queue
    #[inline]
    pub fn k_in(&self) -> u32 {
        self.two_q_size() / 4
    }

    /// Target size of the ghost queue
    #[inline]
    pub fn k_out(&self) -> u32 {
        self.two_q_size() / 2
    }

    #[inline]
    fn pack(self) -> u64 {
        (u64::from(self.max_size) << 32) | u64::from(self.pinned_pages)
    }

    #[inline]
    fn unpack(raw: u64) -> Self {
        Self {
            max_size: (raw >> 32) as u32,
            pinned_pages: raw as u32,
        }
    }
}

/// Holder cell for the current [`MemoryData`].
///
/// Updated only through `compare_exchange`; callers snapshot with `load` and
/// loop on CAS failure.
pub struct MemoryDataContainer {
    raw: AtomicU64,
}

impl MemoryDataContainer {
    pub fn new(data: MemoryData) -> Self {
        Self {
            raw: AtomicU64::new(data.pack()),
        }
    }

    #[inline]
    pub fn load(&self) -> MemoryData {
        MemoryData::unpack(self.raw.load(Ordering::Acquire))
    }

    /// Publish `new` if the container still holds `current`.
    #[inline]
    pub fn compare_exchange(&self, current: MemoryData, new: MemoryData) -> bool {
        self.raw
            .compare_exchange(
                current.pack(),
                new.pack(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_sizes() {
        let data = MemoryData::new(16, 0);
        assert_eq!(data.two_q_size(), 16);
        assert_eq!(data.k_in(), 4);
        assert_eq!(data.k_out(), 8);

        let data = MemoryData::new(16, 4);
        assert_eq!(data.two_q_size(), 12);
        assert_eq!(data.k_in(), 3);
        assert_eq!(data.k_out(), 6);
    }

    #[test]
    fn test_pack_round_trip() {
        let data = MemoryData::new(u32::MAX, 12345);
        assert_eq!(MemoryData::unpack(data.pack()), data);
    }

    #[test]
    fn test_compare_exchange() {
        let container = MemoryDataContainer::new(MemoryData::new(100, 0));

        let current = container.load();
        let bumped = MemoryData::new(current.max_size, current.pinned_pages + 1);
        assert!(container.compare_exchange(current, bumped));
        assert_eq!(container.load().pinned_pages, 1);

        // Stale snapshot loses the race.
        assert!(!container.compare_exchange(current, MemoryData::new(100, 5)));
        assert_eq!(container.load(), bumped);
    }
}
