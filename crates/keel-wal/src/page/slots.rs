use std::sync::atomic::{AtomicU64, Ordering};

/// Highest number of slots a single pool word can carry.
pub const MAX_SLOTS: u8 = 63;

/// Lock-free pool of small integer identifiers backed by one 64-bit
/// word. A set bit means the slot is available. `try_take` claims the
/// lowest available slot with the lowest-bit-reset trick
/// (`bits & (bits - 1)`); `release` returns it with an atomic OR.
///
/// The private page store rents buffer-cache slots from this pool.
pub struct SlotPool {
    bits: AtomicU64,
    capacity: u8,
}

impl SlotPool {
    /// Creates a pool with `capacity` free slots, capped at [`MAX_SLOTS`].
    pub fn new(capacity: u8) -> Self {
        let capacity = capacity.min(MAX_SLOTS);
        let bits = if capacity == 0 {
            0
        } else {
            (1u64 << capacity) - 1
        };
        Self {
            bits: AtomicU64::new(bits),
            capacity,
        }
    }

    #[inline]
    pub fn capacity(&self) -> u8 {
        self.capacity
    }

    /// Claims the lowest available slot, or `None` when the pool is
    /// exhausted.
    pub fn try_take(&self) -> Option<u8> {
        let mut current = self.bits.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return None;
            }
            let slot = current.trailing_zeros() as u8;
            let next = current & (current - 1);
            match self
                .bits
                .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Some(slot),
                Err(observed) => current = observed,
            }
        }
    }

    /// Returns a slot to the pool. Releasing a slot that was never
    /// taken is a logic error; the pool tolerates it by treating the
    /// OR as idempotent.
    pub fn release(&self, slot: u8) {
        debug_assert!(slot < self.capacity, "slot {slot} out of range");
        self.bits.fetch_or(1u64 << slot, Ordering::AcqRel);
    }

    /// Claims every available slot at once, returning the claimed mask.
    pub fn take_all(&self) -> u64 {
        self.bits.swap(0, Ordering::AcqRel)
    }

    /// Returns every slot in `mask` to the pool.
    pub fn release_all(&self, mask: u64) {
        let usable = if self.capacity == 0 {
            0
        } else {
            (1u64 << self.capacity) - 1
        };
        self.bits.fetch_or(mask & usable, Ordering::AcqRel);
    }

    /// Whether `slot` is currently available.
    pub fn contains(&self, slot: u8) -> bool {
        slot < self.capacity && self.bits.load(Ordering::Acquire) & (1u64 << slot) != 0
    }

    /// Number of available slots.
    pub fn available(&self) -> u32 {
        self.bits.load(Ordering::Acquire).count_ones()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn takes_lowest_slot_first() {
        let pool = SlotPool::new(4);
        assert_eq!(pool.try_take(), Some(0));
        assert_eq!(pool.try_take(), Some(1));
        pool.release(0);
        assert_eq!(pool.try_take(), Some(0));
        assert_eq!(pool.try_take(), Some(2));
        assert_eq!(pool.try_take(), Some(3));
        assert_eq!(pool.try_take(), None);
    }

    #[test]
    fn capacity_is_capped_at_63() {
        let pool = SlotPool::new(u8::MAX);
        assert_eq!(pool.capacity(), MAX_SLOTS);
        assert_eq!(pool.available(), MAX_SLOTS as u32);
    }

    #[test]
    fn take_all_then_release_all() {
        let pool = SlotPool::new(5);
        let mask = pool.take_all();
        assert_eq!(mask, 0b1_1111);
        assert_eq!(pool.available(), 0);
        assert_eq!(pool.try_take(), None);
        pool.release_all(mask);
        assert_eq!(pool.available(), 5);
        assert!(pool.contains(4));
    }

    #[test]
    fn release_all_masks_out_of_range_bits() {
        let pool = SlotPool::new(2);
        pool.take_all();
        pool.release_all(u64::MAX);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn concurrent_take_release_yields_unique_slots() {
        let pool = Arc::new(SlotPool::new(MAX_SLOTS));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = Arc::clone(&pool);
            handles.push(std::thread::spawn(move || {
                for _ in 0..1_000 {
                    if let Some(slot) = pool.try_take() {
                        assert!(!pool.contains(slot));
                        pool.release(slot);
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().expect("join");
        }
        assert_eq!(pool.available(), MAX_SLOTS as u32);
    }
}
