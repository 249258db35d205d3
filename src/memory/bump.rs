//! Bump cursors over a mapped region
//!
//! Design: one cursor per region, owned by whoever holds the arena lease.
//! Cursors are atomics only so arenas can be shared by reference between
//! an outer call and the relays it triggers; there is never contention.

use core::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Upward bump allocator for the heap region
pub struct BumpCursor {
    start: usize,
    current: AtomicUsize,
    end: usize,
}

impl BumpCursor {
    pub fn new(start: *mut u8, end: *mut u8) -> Self {
        debug_assert!(start <= end, "invalid region bounds");
        Self {
            start: start as usize,
            current: AtomicUsize::new(start as usize),
            end: end as usize,
        }
    }

    /// Fast path: bump pointer allocation
    ///
    /// Returns None if the region is exhausted.
    #[inline(always)]
    pub fn try_alloc(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        debug_assert!(align.is_power_of_two(), "alignment must be power of 2");

        let ptr = align_up(self.current.load(Ordering::Relaxed), align);
        let new_current = ptr.checked_add(size)?;

        if new_current <= self.end {
            self.current.store(new_current, Ordering::Relaxed);
            NonNull::new(ptr as *mut u8)
        } else {
            None
        }
    }

    #[inline]
    pub fn mark(&self) -> usize {
        self.current.load(Ordering::Relaxed)
    }

    /// Release everything allocated after `mark`
    #[inline]
    pub fn rewind(&self, mark: usize) {
        debug_assert!(mark >= self.start && mark <= self.end, "mark outside region");
        self.current.store(mark, Ordering::Relaxed);
    }

    #[inline]
    pub fn reset(&self) {
        self.current.store(self.start, Ordering::Relaxed);
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.end.saturating_sub(self.current.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn used(&self) -> usize {
        self.current.load(Ordering::Relaxed) - self.start
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.end - self.start
    }
}

/// Downward cursor for the stack region, with a high-water mark
///
/// The guard page sits below `base`, so growth runs toward it.
pub struct StackCursor {
    base: usize,
    top: usize,
    current: AtomicUsize,
    lowest: AtomicUsize,
}

impl StackCursor {
    pub fn new(base: *mut u8, top: *mut u8) -> Self {
        debug_assert!(base <= top, "invalid region bounds");
        Self {
            base: base as usize,
            top: top as usize,
            current: AtomicUsize::new(top as usize),
            lowest: AtomicUsize::new(top as usize),
        }
    }

    #[inline(always)]
    pub fn try_push(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        debug_assert!(align.is_power_of_two(), "alignment must be power of 2");

        let ptr = align_down(self.current.load(Ordering::Relaxed).checked_sub(size)?, align);
        if ptr < self.base {
            return None;
        }

        self.current.store(ptr, Ordering::Relaxed);
        self.lowest.fetch_min(ptr, Ordering::Relaxed);
        NonNull::new(ptr as *mut u8)
    }

    #[inline]
    pub fn mark(&self) -> usize {
        self.current.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn restore(&self, mark: usize) {
        debug_assert!(mark >= self.base && mark <= self.top, "mark outside region");
        self.current.store(mark, Ordering::Relaxed);
    }

    pub fn reset(&self) {
        self.current.store(self.top, Ordering::Relaxed);
        self.lowest.store(self.top, Ordering::Relaxed);
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.current.load(Ordering::Relaxed) - self.base
    }

    /// Deepest extent reached since the last reset
    #[inline]
    pub fn high_water(&self) -> usize {
        self.top - self.lowest.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.top - self.base
    }
}

/// Align address upward to next multiple of alignment
#[inline(always)]
pub(crate) const fn align_up(addr: usize, align: usize) -> usize {
    (addr.wrapping_add(align).wrapping_sub(1)) & !align.wrapping_sub(1)
}

#[inline(always)]
pub(crate) const fn align_down(addr: usize, align: usize) -> usize {
    addr & !align.wrapping_sub(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align() {
        assert_eq!(align_up(0, 8), 0);
        assert_eq!(align_up(9, 8), 16);
        assert_eq!(align_down(15, 8), 8);
        assert_eq!(align_down(16, 16), 16);
    }

    #[test]
    fn test_bump_rewind() {
        let mut buf = vec![0u8; 256];
        let range = buf.as_mut_ptr_range();
        let cursor = BumpCursor::new(range.start, range.end);

        let mark = cursor.mark();
        cursor.try_alloc(100, 1).unwrap();
        assert!(cursor.try_alloc(200, 1).is_none());
        cursor.rewind(mark);
        assert!(cursor.try_alloc(200, 1).is_some());
    }

    #[test]
    fn test_stack_high_water() {
        let mut buf = vec![0u8; 256];
        let range = buf.as_mut_ptr_range();
        let cursor = StackCursor::new(range.start, range.end);

        let mark = cursor.mark();
        let a = cursor.try_push(64, 16).unwrap();
        assert_eq!(a.as_ptr() as usize % 16, 0);
        cursor.restore(mark);
        cursor.try_push(8, 8).unwrap();

        assert!(cursor.high_water() >= 64);
        assert!(cursor.try_push(1024, 8).is_none());
    }
}
